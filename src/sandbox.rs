//! Pipe-transport guardrails
//!
//! Not an OS sandbox: a process-level allowlist check applied before a
//! child is ever spawned, plus the environment filtering policy. The child
//! receives a small inherited key set overlaid by the upstream's explicit
//! `env` map; inherited values that look like exported shell functions
//! (content starting with `()`) are dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::{PipeSandboxConfig, UpstreamConfig};
use crate::error::{RouterError, RouterResult};

#[cfg(not(windows))]
const DEFAULT_INHERIT_KEYS: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

#[cfg(windows)]
const DEFAULT_INHERIT_KEYS: &[&str] = &[
    "APPDATA",
    "COMSPEC",
    "HOMEDRIVE",
    "HOMEPATH",
    "LOCALAPPDATA",
    "PATH",
    "PATHEXT",
    "PROGRAMDATA",
    "SYSTEMDRIVE",
    "SYSTEMROOT",
    "TEMP",
    "TMP",
    "USERNAME",
    "USERPROFILE",
    "WINDIR",
];

/// Check the guardrails for a pipe upstream. Runs before spawning.
pub fn check_pipe_upstream(
    name: &str,
    upstream: &UpstreamConfig,
    sandbox: &PipeSandboxConfig,
) -> RouterResult<()> {
    let command = upstream
        .command
        .as_deref()
        .ok_or_else(|| RouterError::ConfigInvalid(format!("pipe upstream '{name}' has no command")))?;

    if !sandbox.allowed_commands.is_empty()
        && !sandbox.allowed_commands.iter().any(|c| c == command)
    {
        return Err(RouterError::Forbidden(format!(
            "command '{command}' for upstream '{name}' is not in the sandbox allowlist"
        )));
    }

    if let Some(cwd) = upstream.cwd.as_deref() {
        if !sandbox.allowed_cwd_roots.is_empty() {
            let cwd_path = PathBuf::from(cwd);
            let permitted = sandbox
                .allowed_cwd_roots
                .iter()
                .any(|root| cwd_path.starts_with(Path::new(root)));
            if !permitted {
                return Err(RouterError::Forbidden(format!(
                    "cwd '{cwd}' for upstream '{name}' is outside the allowed roots"
                )));
            }
        }
    }

    if !sandbox.allowed_env_keys.is_empty() {
        for key in upstream.env.keys() {
            if !sandbox.allowed_env_keys.iter().any(|k| k == key) {
                return Err(RouterError::Forbidden(format!(
                    "env key '{key}' for upstream '{name}' is not in the sandbox allowlist"
                )));
            }
        }
    }

    Ok(())
}

/// Build the child environment: inherited defaults (or the configured
/// inherit list), function-definition values dropped, explicit env
/// expanded and overlaid last so it always wins.
pub fn child_env(
    upstream: &UpstreamConfig,
    sandbox: &PipeSandboxConfig,
) -> HashMap<String, String> {
    let inherit_keys: Vec<String> = if sandbox.inherit_env_keys.is_empty() {
        DEFAULT_INHERIT_KEYS.iter().map(|s| s.to_string()).collect()
    } else {
        sandbox.inherit_env_keys.clone()
    };

    let mut env = HashMap::new();
    for key in &inherit_keys {
        if let Ok(value) = std::env::var(key) {
            if value.starts_with("()") {
                continue;
            }
            env.insert(key.clone(), value);
        }
    }

    for (key, value) in &upstream.env {
        let expanded = shellexpand::env(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.clone());
        env.insert(key.clone(), expanded);
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_upstream(json: serde_json::Value) -> UpstreamConfig {
        serde_json::from_value(json).unwrap()
    }

    fn upstream(command: &str) -> UpstreamConfig {
        pipe_upstream(serde_json::json!({"transport": "pipe", "command": command}))
    }

    #[test]
    fn empty_allowlist_permits_any_command() {
        let sandbox = PipeSandboxConfig::default();
        assert!(check_pipe_upstream("u", &upstream("anything"), &sandbox).is_ok());
    }

    #[test]
    fn command_outside_allowlist_rejected() {
        let sandbox = PipeSandboxConfig {
            allowed_commands: vec!["npx".into(), "uvx".into()],
            ..Default::default()
        };
        assert!(check_pipe_upstream("u", &upstream("uvx"), &sandbox).is_ok());
        let err = check_pipe_upstream("u", &upstream("bash"), &sandbox).unwrap_err();
        assert!(matches!(err, RouterError::Forbidden(_)));
    }

    #[test]
    fn cwd_must_be_under_allowed_root() {
        let sandbox = PipeSandboxConfig {
            allowed_cwd_roots: vec!["/srv/mcp".into()],
            ..Default::default()
        };
        let ok = pipe_upstream(serde_json::json!({
            "transport": "pipe", "command": "npx", "cwd": "/srv/mcp/tools"
        }));
        let bad = pipe_upstream(serde_json::json!({
            "transport": "pipe", "command": "npx", "cwd": "/tmp"
        }));
        assert!(check_pipe_upstream("u", &ok, &sandbox).is_ok());
        assert!(check_pipe_upstream("u", &bad, &sandbox).is_err());
    }

    #[test]
    fn env_keys_checked_against_allowlist() {
        let sandbox = PipeSandboxConfig {
            allowed_env_keys: vec!["API_KEY".into()],
            ..Default::default()
        };
        let ok = pipe_upstream(serde_json::json!({
            "transport": "pipe", "command": "npx", "env": {"API_KEY": "x"}
        }));
        let bad = pipe_upstream(serde_json::json!({
            "transport": "pipe", "command": "npx", "env": {"LD_PRELOAD": "evil.so"}
        }));
        assert!(check_pipe_upstream("u", &ok, &sandbox).is_ok());
        assert!(check_pipe_upstream("u", &bad, &sandbox).is_err());
    }

    #[test]
    fn explicit_env_overrides_inherited() {
        std::env::set_var("MCP_ROUTER_TEST_PATH_OVERRIDE", "from-parent");
        let sandbox = PipeSandboxConfig {
            inherit_env_keys: vec!["MCP_ROUTER_TEST_PATH_OVERRIDE".into()],
            ..Default::default()
        };
        let upstream = pipe_upstream(serde_json::json!({
            "transport": "pipe",
            "command": "npx",
            "env": {"MCP_ROUTER_TEST_PATH_OVERRIDE": "explicit"}
        }));
        let env = child_env(&upstream, &sandbox);
        assert_eq!(env.get("MCP_ROUTER_TEST_PATH_OVERRIDE").unwrap(), "explicit");
    }

    #[test]
    fn function_definition_values_dropped() {
        std::env::set_var("MCP_ROUTER_TEST_FUNC", "() { :; }; echo pwned");
        let sandbox = PipeSandboxConfig {
            inherit_env_keys: vec!["MCP_ROUTER_TEST_FUNC".into()],
            ..Default::default()
        };
        let env = child_env(&upstream("npx"), &sandbox);
        assert!(!env.contains_key("MCP_ROUTER_TEST_FUNC"));
    }

    #[test]
    fn explicit_values_are_expanded() {
        std::env::set_var("MCP_ROUTER_TEST_EXPAND", "expanded");
        let upstream = pipe_upstream(serde_json::json!({
            "transport": "pipe",
            "command": "npx",
            "env": {"TARGET": "${MCP_ROUTER_TEST_EXPAND}"}
        }));
        let env = child_env(&upstream, &PipeSandboxConfig::default());
        assert_eq!(env.get("TARGET").unwrap(), "expanded");
    }
}
