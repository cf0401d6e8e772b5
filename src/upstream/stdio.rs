//! Child-process (pipe) upstream client
//!
//! Spawns the configured command with a filtered environment after the
//! sandbox guardrails pass, and speaks MCP over its stdio. Operation
//! failures are retried within a single call under the upstream's restart
//! policy, reconnecting (respawning) before each retry. Close is
//! two-phase: a graceful cancel with a grace period, then the kill that
//! the transport performs on drop, so a child is never orphaned.

use std::borrow::Cow;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, CallToolResult, JsonObject, Tool};
use rmcp::service::RunningService;
use rmcp::transport::TokioChildProcess;
use rmcp::{RoleClient, ServiceExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

use super::{classify_service_error, UpstreamClient, UpstreamError, DEFAULT_TIMEOUT_MS};
use crate::config::{PipeSandboxConfig, RestartPolicy, StderrMode, UpstreamConfig};
use crate::error::RouterResult;
use crate::sandbox;

const CLOSE_GRACE: Duration = Duration::from_secs(2);
/// Upper bound for one captured stderr line.
const STDERR_LINE_CAP: usize = 4096;

pub struct StdioUpstream {
    name: String,
    cfg: UpstreamConfig,
    sandbox: PipeSandboxConfig,
    timeout: Duration,
    restart: RestartPolicy,
    conn: Mutex<Option<RunningService<RoleClient, ()>>>,
}

impl std::fmt::Debug for StdioUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioUpstream")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("restart", &self.restart)
            .finish()
    }
}

impl StdioUpstream {
    pub fn new(name: &str, cfg: &UpstreamConfig, sandbox: &PipeSandboxConfig) -> RouterResult<Self> {
        // Guardrails are also checked at spawn time; failing here keeps a
        // misconfigured upstream from ever entering the pool.
        sandbox::check_pipe_upstream(name, cfg, sandbox)?;
        Ok(Self {
            name: name.to_string(),
            cfg: cfg.clone(),
            sandbox: sandbox.clone(),
            timeout: Duration::from_millis(cfg.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)),
            restart: cfg.restart.clone(),
            conn: Mutex::new(None),
        })
    }

    fn build_command(&self) -> Result<Command, UpstreamError> {
        sandbox::check_pipe_upstream(&self.name, &self.cfg, &self.sandbox)
            .map_err(|e| UpstreamError::Unavailable(e.to_string()))?;

        let program = self
            .cfg
            .command
            .as_deref()
            .ok_or_else(|| UpstreamError::Unavailable("pipe upstream has no command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(&self.cfg.args);
        cmd.env_clear();
        cmd.envs(sandbox::child_env(&self.cfg, &self.sandbox));
        if let Some(cwd) = &self.cfg.cwd {
            cmd.current_dir(cwd);
        }
        Ok(cmd)
    }

    async fn connected_peer(&self) -> Result<rmcp::Peer<RoleClient>, UpstreamError> {
        let mut guard = self.conn.lock().await;
        if let Some(service) = guard.as_ref() {
            return Ok(service.peer().clone());
        }

        let cmd = self.build_command()?;
        tracing::debug!(
            upstream = %self.name,
            command = self.cfg.command.as_deref().unwrap_or(""),
            "spawning pipe upstream"
        );

        let stderr_cfg = match self.cfg.stderr_mode {
            StderrMode::Inherit => Stdio::inherit(),
            StderrMode::Ignore => Stdio::null(),
            StderrMode::Capture => Stdio::piped(),
        };
        let (transport, stderr) = TokioChildProcess::builder(cmd)
            .stderr(stderr_cfg)
            .spawn()
            .map_err(|e| {
                UpstreamError::Unavailable(format!("failed to spawn '{}': {e}", self.name))
            })?;

        if let Some(stderr) = stderr {
            spawn_stderr_reader(self.name.clone(), stderr);
        }

        let service = tokio::time::timeout(self.timeout, ().serve(transport))
            .await
            .map_err(|_| {
                UpstreamError::Unavailable(format!(
                    "initialize of '{}' timed out after {:?}",
                    self.name, self.timeout
                ))
            })?
            .map_err(|e| {
                UpstreamError::Unavailable(format!(
                    "failed to initialize MCP session with '{}': {e}",
                    self.name
                ))
            })?;

        let peer = service.peer().clone();
        *guard = Some(service);
        Ok(peer)
    }

    /// Disconnect so the next attempt respawns the child.
    async fn reset(&self) {
        let service = self.conn.lock().await.take();
        if let Some(service) = service {
            tracing::info!(upstream = %self.name, "pipe upstream disconnected");
            let _ = tokio::time::timeout(CLOSE_GRACE, service.cancel()).await;
        }
    }

    async fn list_tools_once(&self) -> Result<Vec<Tool>, UpstreamError> {
        let peer = self.connected_peer().await?;
        match tokio::time::timeout(self.timeout, peer.list_all_tools()).await {
            Err(_) => Err(UpstreamError::Unavailable(format!(
                "list_tools on '{}' timed out after {:?}",
                self.name, self.timeout
            ))),
            Ok(Err(err)) => Err(classify_service_error(err)),
            Ok(Ok(tools)) => Ok(tools),
        }
    }

    async fn call_tool_once(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, UpstreamError> {
        let peer = self.connected_peer().await?;
        let params = CallToolRequestParam {
            name: Cow::Owned(name.to_string()),
            arguments,
        };
        match tokio::time::timeout(self.timeout, peer.call_tool(params)).await {
            Err(_) => Err(UpstreamError::Unavailable(format!(
                "call to '{}' on '{}' timed out after {:?}",
                name, self.name, self.timeout
            ))),
            Ok(Err(err)) => Err(classify_service_error(err)),
            Ok(Ok(result)) => Ok(result),
        }
    }
}

/// Drive one attempt plus up to `max_retries` reconnect-and-retry rounds.
/// Protocol errors return immediately: the child is alive and answered.
macro_rules! with_restart {
    ($self:expr, $op:ident $(, $arg:expr )* ) => {{
        let mut attempt: u32 = 0;
        loop {
            match $self.$op( $( $arg ),* ).await {
                Ok(value) => break Ok(value),
                Err(err @ UpstreamError::Protocol(_)) => break Err(err),
                Err(err) => {
                    if attempt >= $self.restart.max_retries {
                        break Err(err);
                    }
                    let delay = $self.restart.delay_ms(attempt);
                    tracing::warn!(
                        upstream = %$self.name,
                        attempt = attempt + 1,
                        delay_ms = delay,
                        error = %err,
                        "pipe upstream operation failed, restarting"
                    );
                    $self.reset().await;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }
    }};
}

#[async_trait]
impl UpstreamClient for StdioUpstream {
    async fn list_tools(&self) -> Result<Vec<Tool>, UpstreamError> {
        with_restart!(self, list_tools_once)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, UpstreamError> {
        with_restart!(self, call_tool_once, name, arguments.clone())
    }

    async fn close(&self) {
        let service = self.conn.lock().await.take();
        if let Some(service) = service {
            tracing::debug!(upstream = %self.name, "closing pipe upstream");
            // Graceful phase: end the session (closes stdin, reaps the
            // child). The transport force-kills on drop if this stalls.
            if tokio::time::timeout(CLOSE_GRACE, service.cancel()).await.is_err() {
                tracing::warn!(upstream = %self.name, "pipe upstream ignored graceful close");
            }
        }
    }
}

fn spawn_stderr_reader(name: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(upstream = %name, "stderr: {}", cap_line(&line));
        }
    });
}

fn cap_line(line: &str) -> &str {
    if line.len() <= STDERR_LINE_CAP {
        return line;
    }
    let mut end = STDERR_LINE_CAP;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_config(json: serde_json::Value) -> UpstreamConfig {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn sandbox_violation_fails_construction() {
        let sandbox = PipeSandboxConfig {
            allowed_commands: vec!["npx".into()],
            ..Default::default()
        };
        let cfg = pipe_config(serde_json::json!({"transport": "pipe", "command": "bash"}));
        assert!(StdioUpstream::new("u", &cfg, &sandbox).is_err());
    }

    #[test]
    fn command_builds_with_filtered_env() {
        let cfg = pipe_config(serde_json::json!({
            "transport": "pipe",
            "command": "echo",
            "args": ["hello"],
            "env": {"EXTRA": "1"}
        }));
        let upstream = StdioUpstream::new("u", &cfg, &PipeSandboxConfig::default()).unwrap();
        let cmd = upstream.build_command().unwrap();
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "echo");
        let envs: Vec<_> = std_cmd.get_envs().collect();
        assert!(envs
            .iter()
            .any(|(k, v)| k.to_str() == Some("EXTRA") && v.and_then(|v| v.to_str()) == Some("1")));
        // fully cleared before the allowlist overlay
        assert!(!envs.iter().any(|(k, _)| k.to_str() == Some("LD_PRELOAD")));
    }

    #[test]
    fn stderr_lines_are_capped() {
        let long = "x".repeat(10_000);
        assert_eq!(cap_line(&long).len(), STDERR_LINE_CAP);
        assert_eq!(cap_line("short"), "short");
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable_after_retries() {
        let cfg = pipe_config(serde_json::json!({
            "transport": "pipe",
            "command": "/nonexistent/mcp-server-binary",
            "restart": {"maxRetries": 1, "initialDelayMs": 1, "maxDelayMs": 2, "factor": 2.0}
        }));
        let upstream = StdioUpstream::new("u", &cfg, &PipeSandboxConfig::default()).unwrap();
        let err = upstream.list_tools().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Unavailable(_)), "got: {err}");
    }
}
