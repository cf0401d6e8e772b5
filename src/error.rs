//! Router error taxonomy
//!
//! Typed errors for everything the router can reject or fail on. The
//! front-ends translate these into JSON-RPC error payloads at the service
//! boundary; inside the router they travel as plain `Result`s.

use rmcp::model::ErrorCode;
use rmcp::ErrorData as McpError;
use thiserror::Error;

/// Result alias used throughout the router core.
pub type RouterResult<T> = Result<T, RouterError>;

/// Everything that can go wrong while routing a request.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Configuration failed structural validation. Fatal at startup,
    /// logged (and the previous config retained) on reload.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Missing or unknown token on an authenticated endpoint.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The principal is authenticated but not allowed to reach the
    /// resolved upstream.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Unparseable selector, missing parameter, or unknown upstream
    /// addressed by explicit name.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A selector matched zero providers before breaker filtering.
    #[error("no providers match selector '{0}'")]
    NoProvidersMatch(String),

    /// Breaker rejection, transport failure, or timeout talking to an
    /// upstream. Also covers the case where every matching provider was
    /// filtered out by the breaker.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The upstream answered with a well-formed protocol error (unknown
    /// tool, invalid arguments). Does not count against the breaker.
    #[error("upstream protocol error: {}", .0.message)]
    Protocol(McpError),

    /// The principal's token bucket is empty.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Anything unclassified.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Short stable name for audit entries and error data payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::BadRequest(_) => "bad_request",
            Self::NoProvidersMatch(_) => "no_providers_match",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::Protocol(_) => "protocol_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<RouterError> for McpError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::BadRequest(_) | RouterError::NoProvidersMatch(_) => {
                McpError::invalid_params(err.to_string(), None)
            }
            RouterError::Protocol(inner) => inner,
            RouterError::Internal(_) | RouterError::ConfigInvalid(_) => {
                McpError::internal_error(err.to_string(), None)
            }
            RouterError::RateLimited { retry_after_secs } => McpError::new(
                ErrorCode(-32000),
                err.to_string(),
                Some(serde_json::json!({
                    "kind": "rate_limited",
                    "retryAfterSeconds": retry_after_secs,
                })),
            ),
            RouterError::Unauthenticated(_)
            | RouterError::Forbidden(_)
            | RouterError::UpstreamUnavailable(_) => {
                let kind = err.kind();
                McpError::new(
                    ErrorCode(-32000),
                    err.to_string(),
                    Some(serde_json::json!({ "kind": kind })),
                )
            }
        }
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(err: serde_json::Error) -> Self {
        RouterError::Internal(format!("JSON error: {err}"))
    }
}
