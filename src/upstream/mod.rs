//! Upstream clients
//!
//! One capability behind two transports: a pipe (child process) client and
//! a streaming-HTTP client, both speaking MCP through `rmcp`. The manager
//! owns one client per upstream name and rebuilds them when their config
//! fingerprint changes.

pub mod http;
pub mod manager;
pub mod stdio;

use async_trait::async_trait;
use rmcp::model::{CallToolResult, JsonObject, Tool};
use rmcp::ErrorData as McpError;
use rmcp::ServiceError;
use thiserror::Error;

use crate::error::RouterError;

/// Default per-operation deadline when an upstream has no `timeoutMs`.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// How an upstream operation failed. The split drives breaker
/// classification: only `Unavailable` counts against availability.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Transport failure, timeout, or breaker-relevant breakage.
    #[error("{0}")]
    Unavailable(String),
    /// The upstream answered with a well-formed MCP error (unknown tool,
    /// invalid arguments). The connection itself is fine.
    #[error("{}", .0.message)]
    Protocol(McpError),
}

impl UpstreamError {
    /// Breaker verdict for an operation result: protocol errors are
    /// successes as far as availability is concerned.
    pub fn counts_as_available(&self) -> bool {
        matches!(self, UpstreamError::Protocol(_))
    }
}

impl From<UpstreamError> for RouterError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Unavailable(msg) => RouterError::UpstreamUnavailable(msg),
            UpstreamError::Protocol(inner) => RouterError::Protocol(inner),
        }
    }
}

/// The explicit protocol-vs-transport table for `rmcp` service errors.
pub fn classify_service_error(err: ServiceError) -> UpstreamError {
    match err {
        ServiceError::McpError(mcp) => UpstreamError::Protocol(mcp),
        other => UpstreamError::Unavailable(other.to_string()),
    }
}

/// Breaker verdict for a finished operation.
pub fn operation_ok<T>(result: &Result<T, UpstreamError>) -> bool {
    match result {
        Ok(_) => true,
        Err(err) => err.counts_as_available(),
    }
}

/// One upstream connection: list its tools, call one, release it.
#[async_trait]
pub trait UpstreamClient: Send + Sync + std::fmt::Debug {
    async fn list_tools(&self) -> Result<Vec<Tool>, UpstreamError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, UpstreamError>;

    /// Release the connection or child process. Idempotent.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_count_as_available() {
        let err = UpstreamError::Protocol(McpError::invalid_params("bad args", None));
        assert!(err.counts_as_available());
        let result: Result<(), UpstreamError> = Err(err);
        assert!(operation_ok(&result));
    }

    #[test]
    fn transport_errors_count_against_availability() {
        let result: Result<(), UpstreamError> =
            Err(UpstreamError::Unavailable("connection reset".into()));
        assert!(!operation_ok(&result));
    }

    #[test]
    fn mcp_service_error_classified_as_protocol() {
        let err = classify_service_error(ServiceError::McpError(McpError::invalid_params(
            "nope", None,
        )));
        assert!(matches!(err, UpstreamError::Protocol(_)));
    }
}
