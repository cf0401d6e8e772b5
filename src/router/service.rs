//! MCP-facing service
//!
//! Thin `rmcp::ServerHandler` wrapper around a per-session
//! [`RouterEngine`]: the engine computes tool lists and dispatches calls,
//! this layer translates the router error taxonomy into protocol errors at
//! the boundary.

use std::sync::Arc;

use rmcp::model::{
    CallToolRequestParam, CallToolResult, Implementation, ListToolsResult,
    PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo, ToolsCapability,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData, RoleServer, ServerHandler};

use super::RouterEngine;

/// Per-session MCP server handler.
#[derive(Clone)]
pub struct RouterService {
    engine: Arc<RouterEngine>,
}

impl RouterService {
    pub fn new(engine: RouterEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn engine(&self) -> &RouterEngine {
        &self.engine
    }
}

impl ServerHandler for RouterService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: None }),
                ..ServerCapabilities::default()
            },
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_owned(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_owned(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "MCP router: one endpoint fronting a fleet of MCP servers. \
                 Discover providers with list_providers, then call tools \
                 through tools.call with a provider name or a tag:/version: \
                 selector."
                    .to_owned(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult {
            tools: self.engine.exposed_tools().await,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        params: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        self.engine
            .handle_tool(params.name.as_ref(), params.arguments)
            .await
            .map_err(ErrorData::from)
    }
}
