//! Audit trail
//!
//! Tool-call audit entries emitted as JSON lines through the `audit`
//! tracing target. Arguments are only recorded when the config opts in,
//! and are truncated to the configured budget. The principal appears only
//! as its token fingerprint.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::auth::Principal;
use crate::config::AuditConfig;

#[derive(Debug, Serialize)]
struct ToolStartEntry<'a> {
    event: &'static str,
    timestamp: String,
    session_id: &'a str,
    principal: &'a str,
    provider: &'a str,
    tool: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<String>,
}

#[derive(Debug, Serialize)]
struct ToolEndEntry<'a> {
    event: &'static str,
    timestamp: String,
    session_id: &'a str,
    principal: &'a str,
    provider: &'a str,
    tool: &'a str,
    ok: bool,
    duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn emit<T: Serialize>(entry: &T) {
    match serde_json::to_string(entry) {
        Ok(line) => tracing::info!(target: "audit", "{line}"),
        Err(err) => tracing::warn!("failed to serialize audit entry: {err}"),
    }
}

fn render_arguments(cfg: &AuditConfig, arguments: Option<&Value>) -> Option<String> {
    if !cfg.log_arguments {
        return None;
    }
    let rendered = arguments.map(Value::to_string).unwrap_or_else(|| "{}".to_string());
    if rendered.chars().count() > cfg.max_argument_chars {
        let truncated: String = rendered.chars().take(cfg.max_argument_chars).collect();
        Some(format!("{truncated}…"))
    } else {
        Some(rendered)
    }
}

pub fn tool_start(
    cfg: &AuditConfig,
    session_id: &str,
    principal: &Principal,
    provider: &str,
    tool: &str,
    arguments: Option<&Value>,
) {
    if !cfg.enabled {
        return;
    }
    emit(&ToolStartEntry {
        event: "tool_start",
        timestamp: timestamp(),
        session_id,
        principal: principal.audit_id(),
        provider,
        tool,
        arguments: render_arguments(cfg, arguments),
    });
}

pub fn tool_end(
    cfg: &AuditConfig,
    session_id: &str,
    principal: &Principal,
    provider: &str,
    tool: &str,
    ok: bool,
    duration_ms: u64,
    error: Option<&str>,
) {
    if !cfg.enabled {
        return;
    }
    emit(&ToolEndEntry {
        event: "tool_end",
        timestamp: timestamp(),
        session_id,
        principal: principal.audit_id(),
        provider,
        tool,
        ok,
        duration_ms,
        error,
    });
}
