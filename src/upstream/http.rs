//! Streaming-HTTP upstream client
//!
//! Holds an `rmcp` client over the streamable-HTTP transport. The
//! connection is established lazily on first use; concurrent operations
//! during a connect queue on the connection lock and reuse the session it
//! produces, so at most one connect is ever in flight. Every operation
//! runs under the upstream's configured deadline.

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::model::{CallToolRequestParam, CallToolResult, JsonObject, Tool};
use rmcp::service::RunningService;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::{RoleClient, ServiceExt};
use tokio::sync::Mutex;

use super::{classify_service_error, UpstreamClient, UpstreamError, DEFAULT_TIMEOUT_MS};
use crate::config::UpstreamConfig;
use crate::error::{RouterError, RouterResult};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct HttpUpstream {
    name: String,
    url: String,
    headers: HashMap<String, String>,
    timeout: Duration,
    conn: Mutex<Option<RunningService<RoleClient, ()>>>,
}

impl std::fmt::Debug for HttpUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUpstream")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpUpstream {
    pub fn new(name: &str, cfg: &UpstreamConfig) -> RouterResult<Self> {
        let url = cfg
            .url
            .clone()
            .ok_or_else(|| RouterError::ConfigInvalid(format!("http upstream '{name}' has no url")))?;
        Ok(Self {
            name: name.to_string(),
            url,
            headers: cfg.headers.clone(),
            timeout: Duration::from_millis(cfg.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)),
            conn: Mutex::new(None),
        })
    }

    fn header_map(&self) -> Result<HeaderMap, UpstreamError> {
        let mut map = HeaderMap::new();
        for (key, value) in &self.headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                UpstreamError::Unavailable(format!("invalid header name '{key}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                UpstreamError::Unavailable(format!("invalid header value for '{key}': {e}"))
            })?;
            map.insert(name, value);
        }
        Ok(map)
    }

    /// Connect if needed and hand back the session peer. Callers queueing
    /// on the lock while a connect is in flight all reuse its result.
    async fn connected_peer(&self) -> Result<rmcp::Peer<RoleClient>, UpstreamError> {
        let mut guard = self.conn.lock().await;
        if let Some(service) = guard.as_ref() {
            return Ok(service.peer().clone());
        }

        tracing::debug!(upstream = %self.name, url = %self.url, "connecting http upstream");
        let http_client = reqwest::Client::builder()
            .default_headers(self.header_map()?)
            .build()
            .map_err(|e| {
                UpstreamError::Unavailable(format!("failed to build http client: {e}"))
            })?;
        let transport = StreamableHttpClientTransport::with_client(
            http_client,
            StreamableHttpClientTransportConfig::with_uri(self.url.clone()),
        );

        let service = tokio::time::timeout(self.timeout, ().serve(transport))
            .await
            .map_err(|_| {
                UpstreamError::Unavailable(format!(
                    "connect to '{}' timed out after {:?}",
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

    /// Drop the session so the next operation reconnects.
    async fn reset(&self) {
        let service = self.conn.lock().await.take();
        if let Some(service) = service {
            tracing::debug!(upstream = %self.name, "resetting http upstream connection");
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, service.cancel()).await;
        }
    }

    async fn settle<T>(&self, result: Result<T, UpstreamError>) -> Result<T, UpstreamError> {
        if matches!(result, Err(UpstreamError::Unavailable(_))) {
            self.reset().await;
        }
        result
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn list_tools(&self) -> Result<Vec<Tool>, UpstreamError> {
        let peer = self.connected_peer().await?;
        let result = match tokio::time::timeout(self.timeout, peer.list_all_tools()).await {
            Err(_) => Err(UpstreamError::Unavailable(format!(
                "list_tools on '{}' timed out after {:?}",
                self.name, self.timeout
            ))),
            Ok(Err(err)) => Err(classify_service_error(err)),
            Ok(Ok(tools)) => Ok(tools),
        };
        self.settle(result).await
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, UpstreamError> {
        let peer = self.connected_peer().await?;
        let params = CallToolRequestParam {
            name: Cow::Owned(name.to_string()),
            arguments,
        };
        let result = match tokio::time::timeout(self.timeout, peer.call_tool(params)).await {
            Err(_) => Err(UpstreamError::Unavailable(format!(
                "call to '{}' on '{}' timed out after {:?}",
                name, self.name, self.timeout
            ))),
            Ok(Err(err)) => Err(classify_service_error(err)),
            Ok(Ok(result)) => Ok(result),
        };
        self.settle(result).await
    }

    async fn close(&self) {
        let service = self.conn.lock().await.take();
        if let Some(service) = service {
            tracing::debug!(upstream = %self.name, "closing http upstream");
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, service.cancel()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_config(url: &str) -> UpstreamConfig {
        serde_json::from_value(serde_json::json!({
            "transport": "http",
            "url": url,
        }))
        .unwrap()
    }

    #[test]
    fn default_timeout_applies() {
        let upstream = HttpUpstream::new("demo", &http_config("http://localhost:9000/mcp")).unwrap();
        assert_eq!(upstream.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
    }

    #[test]
    fn invalid_header_names_surface_as_unavailable() {
        let mut cfg = http_config("http://localhost:9000/mcp");
        cfg.headers.insert("bad header\n".into(), "x".into());
        let upstream = HttpUpstream::new("demo", &cfg).unwrap();
        assert!(upstream.header_map().is_err());
    }

    #[tokio::test]
    async fn connect_failure_is_unavailable() {
        // Nothing listens on this port; connect (first operation) must
        // surface as Unavailable, not Protocol.
        let mut cfg = http_config("http://127.0.0.1:1/mcp");
        cfg.timeout_ms = Some(500);
        let upstream = HttpUpstream::new("demo", &cfg).unwrap();
        let err = upstream.list_tools().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Unavailable(_)), "got: {err}");
    }
}
