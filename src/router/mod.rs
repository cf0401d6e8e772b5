//! Router engine
//!
//! One engine per session, constructed with the session's principal
//! already bound. The engine owns the per-session tool cache and
//! round-robin counters and borrows the shared control plane (config
//! snapshots, upstream pool, breaker, health, rate limiter). Every
//! dispatch captures one config snapshot up front and uses it for the
//! whole call.

pub mod namespace;
pub mod selector;
pub mod service;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rmcp::model::{CallToolResult, Content, JsonObject, Tool};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{assert_allowed_upstream, upstream_visible, Principal};
use crate::breaker::CircuitBreaker;
use crate::config::{NormalizedConfig, ToolExposure, SelectorStrategy};
use crate::error::{RouterError, RouterResult};
use crate::health::HealthRegistry;
use crate::metrics;
use crate::ratelimit::RateLimiter;
use crate::reload::ConfigHandle;
use crate::upstream::manager::UpstreamManager;
use crate::upstream::operation_ok;
use crate::audit;

use namespace::{namespaced, split_namespaced};
use selector::{Selector, Strategy};

/// Per-session tool cache TTL.
const TOOL_CACHE_TTL: Duration = Duration::from_secs(30);

/// Meta key carrying the original upstream tool name on namespaced tools.
const ORIGINAL_NAME_META_KEY: &str = "x-mcp-router-upstream-tool";

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> String {
    format!("s-{:06}", NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
}

/// Shared control plane handed to every engine.
#[derive(Clone)]
pub struct RouterDeps {
    pub config: ConfigHandle,
    pub manager: Arc<UpstreamManager>,
    pub breaker: CircuitBreaker,
    pub health: HealthRegistry,
    pub rate_limiter: Arc<RateLimiter>,
}

// ============================================================================
// Router Tool Parameters
// ============================================================================

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ListProvidersParams {
    #[schemars(description = "Only list providers carrying this tag")]
    pub tag: Option<String>,
    #[schemars(description = "Only list providers whose version satisfies this semver range")]
    pub version: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ToolsListParams {
    #[schemars(description = "Provider selector: a name, 'tag:<tag>[@range]', or 'version:<range>'")]
    pub provider: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ToolsCallParams {
    #[schemars(description = "Provider selector: a name, 'tag:<tag>[@range]', or 'version:<range>'")]
    pub provider: String,
    #[schemars(description = "Tool name as the upstream knows it")]
    pub name: String,
    #[schemars(description = "Arguments forwarded to the upstream tool")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ToolsRefreshParams {
    #[schemars(description = "Provider whose tool cache to drop; omit for all providers")]
    pub provider: Option<String>,
}

struct ToolCacheEntry {
    fetched_at: Instant,
    tools: Vec<Tool>,
    /// namespaced name -> original upstream name
    original_names: HashMap<String, String>,
}

/// Per-session routing engine.
pub struct RouterEngine {
    deps: RouterDeps,
    principal: Principal,
    session_id: String,
    tool_cache: Mutex<HashMap<String, Arc<ToolCacheEntry>>>,
    rr_counters: Mutex<HashMap<String, usize>>,
    rng: Box<dyn Fn() -> f64 + Send + Sync>,
}

impl RouterEngine {
    pub fn new(deps: RouterDeps, principal: Principal) -> Self {
        Self {
            deps,
            principal,
            session_id: next_session_id(),
            tool_cache: Mutex::new(HashMap::new()),
            rr_counters: Mutex::new(HashMap::new()),
            rng: Box::new(|| rand::random::<f64>()),
        }
    }

    /// Swap the RNG used by the `random` strategy. Tests pin this.
    pub fn with_rng(mut self, rng: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Single entry point for every tool invocation on this session.
    pub async fn handle_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> RouterResult<CallToolResult> {
        self.deps.rate_limiter.consume(&self.principal)?;
        let cfg = self.deps.config.load();

        match name {
            "list_providers" => {
                let params: ListProvidersParams = parse_params(arguments)?;
                let payload = self.list_providers(&cfg, &params)?;
                Ok(json_result(payload))
            }
            "tools.list" => {
                let params: ToolsListParams = parse_params(arguments)?;
                let provider = self.resolve(&cfg, &params.provider)?;
                let tools = self.fetch_tools(&cfg, &provider, true).await?;
                Ok(json_result(serde_json::json!({
                    "provider": provider,
                    "tools": &tools.tools,
                })))
            }
            "tools.call" => {
                let params: ToolsCallParams = parse_params(arguments)?;
                let provider = self.resolve(&cfg, &params.provider)?;
                let args = match params.arguments {
                    None => None,
                    Some(Value::Object(map)) => Some(map),
                    Some(other) => {
                        return Err(RouterError::BadRequest(format!(
                            "'arguments' must be an object, got {other}"
                        )));
                    }
                };
                let result = self.forward_call(&cfg, &provider, &params.name, args).await?;
                Ok(json_result(serde_json::json!({
                    "provider": provider,
                    "name": params.name,
                    "content": serde_json::to_value(&result.content)?,
                    "structuredContent": result.structured_content,
                })))
            }
            "tools.refresh" => {
                let params: ToolsRefreshParams = parse_params(arguments)?;
                self.refresh(params.provider.as_deref());
                Ok(json_result(serde_json::json!({ "ok": true })))
            }
            other => self.call_namespaced(&cfg, other, arguments).await,
        }
    }

    /// The tool surface this session sees, by exposure mode.
    pub async fn exposed_tools(&self) -> Vec<Tool> {
        let cfg = self.deps.config.load();
        let mut tools = Vec::new();

        match cfg.tool_exposure {
            ToolExposure::Hierarchical => {
                tools.extend(router_tools());
            }
            ToolExposure::Namespaced => {
                // list_providers stays visible for debuggability
                tools.extend(router_tools().into_iter().filter(|t| t.name == "list_providers"));
                tools.extend(self.namespaced_tools(&cfg).await);
            }
            ToolExposure::Both => {
                tools.extend(router_tools());
                tools.extend(self.namespaced_tools(&cfg).await);
            }
        }

        tools
    }

    async fn namespaced_tools(&self, cfg: &NormalizedConfig) -> Vec<Tool> {
        let mut surfaced = Vec::new();
        for (name, upstream) in &cfg.upstreams {
            if !upstream.enabled || !upstream_visible(&self.principal, name, upstream) {
                continue;
            }
            // Per-upstream failures elide that upstream's tools; a partial
            // listing beats none.
            match self.fetch_tools(cfg, name, false).await {
                Ok(entry) => surfaced.extend(entry.tools.iter().cloned()),
                Err(err) => {
                    tracing::warn!(upstream = %name, error = %err, "listing tools failed");
                }
            }
        }
        surfaced
    }

    async fn call_namespaced(
        &self,
        cfg: &NormalizedConfig,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> RouterResult<CallToolResult> {
        if cfg.tool_exposure == ToolExposure::Hierarchical {
            return Err(RouterError::BadRequest(format!("unknown tool '{name}'")));
        }
        let Some((upstream, rest)) = split_namespaced(name, cfg.upstreams.keys()) else {
            return Err(RouterError::BadRequest(format!("unknown tool '{name}'")));
        };
        let upstream = upstream.to_string();

        // The cache maps the namespaced name back to the exact upstream
        // name; `rest` is already usable when the cache has expired.
        let original = {
            let cache = self.tool_cache.lock();
            cache
                .get(&upstream)
                .and_then(|entry| entry.original_names.get(name).cloned())
        }
        .unwrap_or_else(|| rest.to_string());

        self.forward_call(cfg, &upstream, &original, arguments).await
    }

    // ========================================================================
    // Selector Resolution
    // ========================================================================

    /// Resolve a selector to exactly one upstream name.
    pub fn resolve(&self, cfg: &NormalizedConfig, selector: &str) -> RouterResult<String> {
        let parsed = Selector::parse(selector)?;
        if let Some(name) = parsed.as_explicit_name() {
            return Ok(name.to_string());
        }

        let mut candidates: Vec<String> = cfg
            .upstreams
            .iter()
            .filter(|(name, upstream)| {
                upstream.enabled && upstream_visible(&self.principal, name, upstream)
            })
            .filter(|(_, upstream)| match &parsed {
                Selector::Name(_) => unreachable!("explicit names returned above"),
                Selector::Tag { tag, range } => {
                    upstream.tags.iter().any(|t| t == tag)
                        && range
                            .as_ref()
                            .map(|r| upstream.semver().map(|v| r.matches(&v)).unwrap_or(false))
                            .unwrap_or(true)
                }
                Selector::Version(range) => {
                    upstream.semver().map(|v| range.matches(&v)).unwrap_or(false)
                }
            })
            .map(|(name, _)| name.clone())
            .collect();
        // BTreeMap iteration is already name-ascending; keep the tie-break
        // order explicit anyway.
        candidates.sort();

        if candidates.is_empty() {
            return Err(RouterError::NoProvidersMatch(selector.to_string()));
        }

        let available: Vec<String> = candidates
            .into_iter()
            .filter(|name| {
                self.deps
                    .breaker
                    .can_attempt(name, &cfg.routing.circuit_breaker)
            })
            .collect();

        if available.is_empty() {
            return Err(RouterError::UpstreamUnavailable(format!(
                "all providers matching '{selector}' are unavailable"
            )));
        }

        let picked = match cfg.routing.selector_strategy {
            SelectorStrategy::RoundRobin => {
                let mut counters = self.rr_counters.lock();
                let counter = counters.entry(selector.to_string()).or_insert(0);
                Strategy::RoundRobin { counter }.pick(&available).to_string()
            }
            SelectorStrategy::Random => {
                Strategy::Random { rng: &*self.rng }.pick(&available).to_string()
            }
        };
        Ok(picked)
    }

    // ========================================================================
    // Forwarding
    // ========================================================================

    async fn forward_call(
        &self,
        cfg: &NormalizedConfig,
        upstream: &str,
        tool: &str,
        arguments: Option<JsonObject>,
    ) -> RouterResult<CallToolResult> {
        let upstream_cfg = cfg
            .upstreams
            .get(upstream)
            .ok_or_else(|| RouterError::BadRequest(format!("unknown upstream '{upstream}'")))?;
        assert_allowed_upstream(&self.principal, upstream, upstream_cfg)?;

        let attempt = self
            .deps
            .breaker
            .begin_attempt(upstream, &cfg.routing.circuit_breaker)
            .map_err(|rejection| {
                RouterError::UpstreamUnavailable(format!("'{upstream}': {rejection}"))
            })?;

        let client = match self.deps.manager.get(upstream, cfg).await {
            Ok(client) => client,
            Err(err) => {
                attempt.end(false);
                return Err(err);
            }
        };

        let args_value = arguments.as_ref().map(|a| Value::Object(a.clone()));
        audit::tool_start(
            &cfg.audit,
            &self.session_id,
            &self.principal,
            upstream,
            tool,
            args_value.as_ref(),
        );

        let started = Instant::now();
        let result = client.call_tool(tool, arguments).await;
        attempt.end(operation_ok(&result));

        let elapsed = started.elapsed();
        metrics::record_tool_call(upstream, tool, result.is_ok(), elapsed);
        audit::tool_end(
            &cfg.audit,
            &self.session_id,
            &self.principal,
            upstream,
            tool,
            result.is_ok(),
            elapsed.as_millis() as u64,
            result.as_ref().err().map(|e| e.to_string()).as_deref(),
        );

        result.map_err(Into::into)
    }

    /// Tools for one upstream, through the per-session cache. With
    /// `enforce_allowlist` the caller addressed the upstream directly and
    /// the principal's allowlists apply; the namespaced listing filters
    /// visibility itself.
    async fn fetch_tools(
        &self,
        cfg: &NormalizedConfig,
        upstream: &str,
        enforce_allowlist: bool,
    ) -> RouterResult<Arc<ToolCacheEntry>> {
        let upstream_cfg = cfg
            .upstreams
            .get(upstream)
            .ok_or_else(|| RouterError::BadRequest(format!("unknown upstream '{upstream}'")))?;
        if enforce_allowlist {
            assert_allowed_upstream(&self.principal, upstream, upstream_cfg)?;
        }

        if let Some(entry) = self.tool_cache.lock().get(upstream) {
            if entry.fetched_at.elapsed() < TOOL_CACHE_TTL {
                return Ok(entry.clone());
            }
        }

        let attempt = self
            .deps
            .breaker
            .begin_attempt(upstream, &cfg.routing.circuit_breaker)
            .map_err(|rejection| {
                RouterError::UpstreamUnavailable(format!("'{upstream}': {rejection}"))
            })?;

        let client = match self.deps.manager.get(upstream, cfg).await {
            Ok(client) => client,
            Err(err) => {
                attempt.end(false);
                return Err(err);
            }
        };

        let result = client.list_tools().await;
        attempt.end(operation_ok(&result));
        let tools = result.map_err(RouterError::from)?;

        let mut surfaced = Vec::with_capacity(tools.len());
        let mut original_names = HashMap::with_capacity(tools.len());
        for tool in tools {
            let original = tool.name.to_string();
            let exposed = namespaced(upstream, &original);
            let mut renamed = tool;
            renamed.name = exposed.clone().into();
            let meta = renamed.meta.get_or_insert_with(rmcp::model::Meta::new);
            meta.0.insert(
                ORIGINAL_NAME_META_KEY.to_string(),
                Value::String(original.clone()),
            );
            original_names.insert(exposed, original);
            surfaced.push(renamed);
        }

        let entry = Arc::new(ToolCacheEntry {
            fetched_at: Instant::now(),
            tools: surfaced,
            original_names,
        });
        self.tool_cache
            .lock()
            .insert(upstream.to_string(), entry.clone());
        Ok(entry)
    }

    /// Drop one upstream's cache entry, or all of them.
    pub fn refresh(&self, provider: Option<&str>) {
        let mut cache = self.tool_cache.lock();
        match provider {
            Some(name) => {
                cache.remove(name);
            }
            None => cache.clear(),
        }
    }

    // ========================================================================
    // Providers
    // ========================================================================

    fn list_providers(
        &self,
        cfg: &NormalizedConfig,
        params: &ListProvidersParams,
    ) -> RouterResult<Value> {
        let range = params
            .version
            .as_deref()
            .map(|raw| {
                semver::VersionReq::parse(raw).map_err(|e| {
                    RouterError::BadRequest(format!("invalid semver range '{raw}': {e}"))
                })
            })
            .transpose()?;

        let mut providers = Vec::new();
        for (name, upstream) in &cfg.upstreams {
            if !upstream.enabled || !upstream_visible(&self.principal, name, upstream) {
                continue;
            }
            if let Some(tag) = &params.tag {
                if !upstream.tags.iter().any(|t| t == tag) {
                    continue;
                }
            }
            if let Some(range) = &range {
                match upstream.semver() {
                    Some(version) if range.matches(&version) => {}
                    _ => continue,
                }
            }

            providers.push(serde_json::json!({
                "name": name,
                "url": upstream.url,
                "transport": upstream.transport,
                "tags": upstream.tags,
                "version": upstream.version,
                "circuitBreaker": self.deps.breaker.snapshot(name),
                "health": self.deps.health.snapshot(name),
            }));
        }

        Ok(serde_json::json!({ "providers": providers }))
    }
}

// ============================================================================
// Router Tool Surface
// ============================================================================

fn schema_for<T: JsonSchema>() -> Arc<JsonObject> {
    let schema = schemars::schema_for!(T);
    match serde_json::to_value(schema) {
        Ok(Value::Object(map)) => Arc::new(map),
        _ => Arc::new(JsonObject::new()),
    }
}

fn router_tool(name: &'static str, description: &'static str, schema: Arc<JsonObject>) -> Tool {
    Tool {
        name: name.into(),
        title: None,
        description: Some(description.into()),
        input_schema: schema,
        output_schema: None,
        annotations: None,
        icons: None,
        meta: None,
    }
}

/// The router's own fixed tool surface.
pub fn router_tools() -> Vec<Tool> {
    vec![
        router_tool(
            "list_providers",
            "List upstream providers visible to this session, with circuit \
             breaker and health state.",
            schema_for::<ListProvidersParams>(),
        ),
        router_tool(
            "tools.list",
            "List the tools of one provider. The provider may be an explicit \
             name or a tag:/version: selector.",
            schema_for::<ToolsListParams>(),
        ),
        router_tool(
            "tools.call",
            "Call a tool on one provider. The provider may be an explicit \
             name or a tag:/version: selector.",
            schema_for::<ToolsCallParams>(),
        ),
        router_tool(
            "tools.refresh",
            "Drop the cached tool list for one provider, or for all of them.",
            schema_for::<ToolsRefreshParams>(),
        ),
    ]
}

fn parse_params<T: serde::de::DeserializeOwned>(arguments: Option<JsonObject>) -> RouterResult<T> {
    let value = Value::Object(arguments.unwrap_or_default());
    serde_json::from_value(value)
        .map_err(|e| RouterError::BadRequest(format!("invalid arguments: {e}")))
}

/// Wrap a JSON payload as a tool result: serialized text content plus the
/// payload as structured content.
fn json_result(payload: Value) -> CallToolResult {
    let text = payload.to_string();
    let mut result = CallToolResult::success(vec![Content::text(text)]);
    result.structured_content = Some(payload);
    result
}
