//! HTTP front-end
//!
//! An axum app exposing the MCP path (streamable HTTP, sessioned), the
//! deprecated `GET /sse` + `POST /messages` pair for legacy clients,
//! `/healthz` and `/metrics`. Authentication runs as middleware on the
//! MCP surfaces: Bearer or X-API-Key, with the JSON-RPC-shaped 401 body.
//! A session registry pins each session id to the token fingerprint that
//! created it; a request presenting the same session with a different
//! token is rejected.
//!
//! The streamable-HTTP service builds one router engine per session. Its
//! factory takes no request context, so the authenticated principal is
//! handed from the middleware to the factory through a task-local scope.
//! The legacy SSE accept loop runs outside the request task; its handoff
//! is a FIFO queue with the `/sse` handshake serialized by a lock so the
//! queue order matches the accept order.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use rmcp::transport::sse_server::{SseServer, SseServerConfig};
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::{StreamableHttpServerConfig, StreamableHttpService};
use tokio_util::sync::CancellationToken;

use crate::auth::{self, Principal};
use crate::error::RouterError;
use crate::health::HealthHandle;
use crate::metrics as router_metrics;
use crate::router::service::RouterService;
use crate::router::{RouterDeps, RouterEngine};

const SESSION_HEADER: &str = "mcp-session-id";
const DEFAULT_PORT: u16 = 8080;
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

tokio::task_local! {
    static REQUEST_PRINCIPAL: Principal;
}

/// Session id -> token fingerprint (None for anonymous sessions). A
/// session's binding is immutable once set.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<String, Option<String>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the binding for a freshly assigned session id.
    pub fn bind(&self, session_id: &str, fingerprint: Option<&str>) {
        self.inner
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| fingerprint.map(str::to_string));
    }

    /// Check a request against the session's binding. A session id this
    /// registry has never seen binds now (first use wins).
    pub fn verify_or_bind(&self, session_id: &str, fingerprint: Option<&str>) -> bool {
        let mut inner = self.inner.lock();
        match inner.get(session_id) {
            Some(bound) => bound.as_deref() == fingerprint,
            None => {
                inner.insert(
                    session_id.to_string(),
                    fingerprint.map(str::to_string),
                );
                true
            }
        }
    }

    pub fn remove(&self, session_id: &str) {
        self.inner.lock().remove(session_id);
    }
}

#[derive(Clone)]
struct HttpState {
    deps: RouterDeps,
    sessions: SessionRegistry,
    metrics: PrometheusHandle,
    /// Principals queued for the legacy SSE accept loop, FIFO.
    sse_pending: Arc<Mutex<VecDeque<Principal>>>,
    /// Serializes `/sse` handshakes so queue order matches accept order.
    sse_handshake: Arc<tokio::sync::Mutex<()>>,
}

pub async fn serve(
    deps: RouterDeps,
    health: HealthHandle,
    ct: CancellationToken,
) -> anyhow::Result<()> {
    let cfg = deps.config.load();
    let http_cfg = cfg.listen.http.clone().unwrap_or_default();
    let host = if http_cfg.host.is_empty() {
        "127.0.0.1".to_string()
    } else {
        http_cfg.host.clone()
    };
    let port = resolve_port(http_cfg.port);
    let mcp_path = if http_cfg.path.is_empty() {
        "/mcp".to_string()
    } else {
        http_cfg.path.clone()
    };
    drop(cfg);

    let metrics_handle = router_metrics::install_recorder()?;
    let state = HttpState {
        deps: deps.clone(),
        sessions: SessionRegistry::new(),
        metrics: metrics_handle,
        sse_pending: Arc::new(Mutex::new(VecDeque::new())),
        sse_handshake: Arc::new(tokio::sync::Mutex::new(())),
    };

    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "{host}:{port} is already in use; pick another port or stop the other process"
                )
            } else {
                anyhow::anyhow!("failed to bind {host}:{port}: {e}")
            }
        })?;
    let addr: SocketAddr = listener.local_addr()?;

    // Streamable HTTP: one engine per session, principal from the
    // middleware's task-local scope.
    let factory_deps = deps.clone();
    let streamable = StreamableHttpService::new(
        move || {
            let principal = REQUEST_PRINCIPAL
                .try_with(|p| p.clone())
                .map_err(|_| std::io::Error::other("request carried no principal"))?;
            Ok(RouterService::new(RouterEngine::new(
                factory_deps.clone(),
                principal,
            )))
        },
        Arc::new(LocalSessionManager::default()),
        StreamableHttpServerConfig {
            sse_keep_alive: Some(SSE_KEEP_ALIVE),
            stateful_mode: true,
        },
    );

    // Deprecated SSE pair for legacy clients.
    let (sse_server, sse_router) = SseServer::new(SseServerConfig {
        bind: addr,
        sse_path: "/sse".to_string(),
        post_path: "/messages".to_string(),
        ct: ct.child_token(),
        sse_keep_alive: Some(SSE_KEEP_ALIVE),
    });
    let sse_deps = deps.clone();
    let sse_pending = state.sse_pending.clone();
    let _sse_running = sse_server.with_service(move || {
        let principal = sse_pending
            .lock()
            .pop_front()
            .unwrap_or_else(Principal::denied);
        RouterService::new(RouterEngine::new(sse_deps.clone(), principal))
    });

    let open = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .with_state(state.clone());

    let protected = Router::new()
        .route_service(mcp_path.as_str(), streamable)
        .merge(sse_router)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let app = open.merge(protected);

    tracing::info!(addr = %addr, path = %mcp_path, "router serving on http");

    let shutdown_ct = ct.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_ct.cancelled().await })
        .await?;

    tracing::info!("http front-end stopped, shutting down");
    deps.manager.close_all().await;
    health.stop().await;
    Ok(())
}

/// `PORT` overrides the HTTP port unless the config set one explicitly.
fn resolve_port(configured: Option<u16>) -> u16 {
    if let Some(port) = configured {
        return port;
    }
    std::env::var("PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn render_metrics(State(state): State<HttpState>) -> String {
    state.metrics.render()
}

fn bearer_or_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let mut parts = value.trim().splitn(2, ' ');
        let scheme = parts.next().unwrap_or_default();
        let token = parts.next().unwrap_or_default().trim();
        if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
            return Some(token.to_string());
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn session_id_from_query(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "sessionId")
        .map(|(_, value)| value.into_owned())
}

fn unauthorized(err: &RouterError) -> Response {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "error": { "code": -32000, "message": err.to_string() },
        "id": null,
    });
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

async fn auth_middleware(
    State(state): State<HttpState>,
    request: Request,
    next: Next,
) -> Response {
    let cfg = state.deps.config.load();
    let token = bearer_or_api_key(request.headers());
    let principal = match auth::principal_from_token(&cfg, token.as_deref()) {
        Ok(principal) => principal,
        Err(err) => return unauthorized(&err),
    };
    drop(cfg);
    let fingerprint = principal.fingerprint().map(str::to_string);

    // Session binding: header on the streamable path, query parameter
    // on the legacy message path.
    let presented_session = request
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| session_id_from_query(request.uri()));
    if let Some(session_id) = &presented_session {
        if !state
            .sessions
            .verify_or_bind(session_id, fingerprint.as_deref())
        {
            return unauthorized(&RouterError::Unauthenticated(
                "Session is bound to a different token".into(),
            ));
        }
    }

    let method = request.method().clone();
    let is_sse_handshake = method == Method::GET && request.uri().path() == "/sse";

    let response = if is_sse_handshake {
        // Keep queue order aligned with the SSE accept order.
        let _guard = state.sse_handshake.lock().await;
        state.sse_pending.lock().push_back(principal.clone());
        REQUEST_PRINCIPAL.scope(principal, next.run(request)).await
    } else {
        REQUEST_PRINCIPAL.scope(principal, next.run(request)).await
    };

    // An initialize response assigns a fresh session id; bind it to the
    // token that created it.
    if presented_session.is_none() {
        if let Some(assigned) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            state.sessions.bind(assigned, fingerprint.as_deref());
        }
    }
    if method == Method::DELETE {
        if let Some(session_id) = &presented_session {
            state.sessions.remove(session_id);
        }
    }

    response
}
