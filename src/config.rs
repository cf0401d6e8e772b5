//! Configuration loading and validation
//!
//! The router is driven by a single strict JSON document: unknown keys are
//! rejected, defaults are filled in, the historical `upstreams` key is
//! normalized into `mcpServers`, and cross-references (token -> project)
//! are checked before a config is ever published. Loading never produces a
//! partially-valid config: either the whole document validates or the load
//! fails.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RouterError, RouterResult};

/// How upstream tools are surfaced to downstream clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolExposure {
    /// Only the router's own tools (`list_providers`, `tools.*`).
    Hierarchical,
    /// Every visible upstream tool under `<upstream>.<tool>`.
    Namespaced,
    /// Both of the above.
    Both,
}

/// Tie-break strategy when a selector matches several providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectorStrategy {
    RoundRobin,
    Random,
}

/// What to do with a pipe upstream's stderr stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StderrMode {
    /// Pass through to the router's own stderr.
    Inherit,
    /// Read line by line into the router's logger.
    Capture,
    /// Discard.
    Ignore,
}

fn default_true() -> bool {
    true
}

fn default_http_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mcp_path() -> String {
    "/mcp".to_string()
}

fn default_admin_path() -> String {
    "/admin".to_string()
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_health_timeout_ms() -> u64 {
    5_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_open_ms() -> u64 {
    30_000
}

fn default_max_argument_chars() -> usize {
    2_000
}

fn default_restart_max_retries() -> u32 {
    2
}

fn default_restart_initial_delay_ms() -> u64 {
    250
}

fn default_restart_max_delay_ms() -> u64 {
    5_000
}

fn default_restart_factor() -> f64 {
    2.0
}

fn default_tool_exposure() -> ToolExposure {
    ToolExposure::Hierarchical
}

fn default_selector_strategy() -> SelectorStrategy {
    SelectorStrategy::RoundRobin
}

fn default_stderr_mode() -> StderrMode {
    StderrMode::Inherit
}

/// HTTP listener settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HttpListenConfig {
    #[serde(default = "default_http_host")]
    pub host: String,
    /// Explicit port. When absent, the `PORT` environment variable and
    /// finally 8080 are consulted at bind time. `0` asks the OS to pick.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_mcp_path")]
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    #[serde(default)]
    pub http: Option<HttpListenConfig>,
    /// Serve a single session over the process's own stdio.
    #[serde(default)]
    pub stdio: Option<bool>,
}

/// Admin surface settings. The embedded UI itself is out of scope; the
/// keys are accepted and validated so configs shared with richer builds
/// keep parsing.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_admin_path")]
    pub path: String,
    #[serde(default)]
    pub allow_unauthenticated: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    /// Probe pipe-transport upstreams too. Off by default: probing spawns
    /// the child process.
    #[serde(default)]
    pub include_stdio: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
            include_stdio: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_ms")]
    pub open_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            open_ms: default_open_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RoutingConfig {
    #[serde(default = "default_selector_strategy")]
    pub selector_strategy: SelectorStrategy,
    #[serde(default)]
    pub health_checks: HealthCheckConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            selector_strategy: default_selector_strategy(),
            health_checks: HealthCheckConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Include call arguments in audit entries.
    #[serde(default)]
    pub log_arguments: bool,
    #[serde(default = "default_max_argument_chars")]
    pub max_argument_chars: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_arguments: false,
            max_argument_chars: default_max_argument_chars(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RateLimitConfig {
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
}

/// Per-project access policy. `None` allowlists mean "everything".
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ProjectConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub allowed_mcp_servers: Option<Vec<String>>,
    #[serde(default)]
    pub allowed_tags: Option<Vec<String>>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TokenConfig {
    pub value: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub allowed_mcp_servers: Option<Vec<String>>,
    #[serde(default)]
    pub allowed_tags: Option<Vec<String>>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

/// Guardrails applied before spawning a pipe upstream.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PipeSandboxConfig {
    /// Commands a pipe upstream may run. Empty means no restriction.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Working directories must live under one of these roots.
    #[serde(default)]
    pub allowed_cwd_roots: Vec<String>,
    /// Keys permitted in an upstream's explicit `env` map. Empty means no
    /// restriction.
    #[serde(default)]
    pub allowed_env_keys: Vec<String>,
    /// Keys inherited from the router's own environment. Defaults to a
    /// small OS-specific set when empty.
    #[serde(default)]
    pub inherit_env_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    #[serde(default)]
    pub stdio: PipeSandboxConfig,
}

/// Restart policy for pipe upstreams: retries within a single call.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RestartPolicy {
    #[serde(default = "default_restart_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_restart_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_restart_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_restart_factor")]
    pub factor: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_restart_max_retries(),
            initial_delay_ms: default_restart_initial_delay_ms(),
            max_delay_ms: default_restart_max_delay_ms(),
            factor: default_restart_factor(),
        }
    }
}

impl RestartPolicy {
    /// Delay before retry number `attempt` (0-based), bounded by
    /// `max_delay_ms`.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let raw = self.initial_delay_ms as f64 * self.factor.powi(attempt as i32);
        (raw as u64).min(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    Pipe,
    Http,
}

/// One upstream MCP server. Immutable per reload; changes are applied by
/// replacing the whole config snapshot.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct UpstreamConfig {
    pub transport: TransportKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    // http transport
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,

    // pipe transport
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_stderr_mode")]
    pub stderr_mode: StderrMode,
    #[serde(default)]
    pub restart: RestartPolicy,
}

impl UpstreamConfig {
    /// Stable fingerprint used by the reconciler to detect changed
    /// upstreams across reloads.
    pub fn fingerprint(&self) -> String {
        // BTreeMap-free serde output is stable enough here: field order is
        // fixed by the struct definition and map fields are re-sorted.
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            for key in ["headers", "env"] {
                if let Some(map) = obj.get(key).and_then(|v| v.as_object()) {
                    let sorted: BTreeMap<String, serde_json::Value> =
                        map.clone().into_iter().collect();
                    obj.insert(
                        key.to_string(),
                        serde_json::to_value(sorted).unwrap_or_default(),
                    );
                }
            }
        }
        value.to_string()
    }

    /// Parsed semver version, when one is declared and valid.
    pub fn semver(&self) -> Option<semver::Version> {
        self.version.as_deref().and_then(|v| semver::Version::parse(v).ok())
    }
}

/// The raw document as written on disk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawConfig {
    #[serde(default)]
    listen: ListenConfig,
    #[serde(default)]
    admin: AdminConfig,
    #[serde(default = "default_tool_exposure")]
    tool_exposure: ToolExposure,
    #[serde(default)]
    routing: RoutingConfig,
    #[serde(default)]
    audit: AuditConfig,
    #[serde(default)]
    projects: Vec<ProjectConfig>,
    #[serde(default)]
    auth: AuthConfig,
    #[serde(default)]
    sandbox: SandboxConfig,
    /// Current key for the upstream map.
    #[serde(default)]
    mcp_servers: Option<BTreeMap<String, UpstreamConfig>>,
    /// Historical alias, normalized into `mcp_servers`.
    #[serde(default)]
    upstreams: Option<BTreeMap<String, UpstreamConfig>>,
}

/// Validated, normalized configuration. Snapshots of this struct are
/// published through [`crate::reload::ConfigHandle`] and never mutated in
/// place.
#[derive(Debug, Clone, Default)]
pub struct NormalizedConfig {
    pub listen: ListenConfig,
    pub admin: AdminConfig,
    pub tool_exposure: ToolExposure,
    pub routing: RoutingConfig,
    pub audit: AuditConfig,
    pub projects: BTreeMap<String, ProjectConfig>,
    pub auth: AuthConfig,
    pub sandbox: SandboxConfig,
    pub upstreams: BTreeMap<String, UpstreamConfig>,
}

impl Default for ToolExposure {
    fn default() -> Self {
        default_tool_exposure()
    }
}

impl NormalizedConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> RouterResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RouterError::ConfigInvalid(format!("{}: {e}", path.display())))?;
        Self::parse(&content)
    }

    /// Parse and validate a config document.
    pub fn parse(content: &str) -> RouterResult<Self> {
        let raw: RawConfig = serde_json::from_str(content)
            .map_err(|e| RouterError::ConfigInvalid(e.to_string()))?;
        Self::normalize(raw)
    }

    fn normalize(raw: RawConfig) -> RouterResult<Self> {
        let upstreams = match (raw.mcp_servers, raw.upstreams) {
            (Some(_), Some(_)) => {
                return Err(RouterError::ConfigInvalid(
                    "both 'mcpServers' and 'upstreams' present; use 'mcpServers'".into(),
                ));
            }
            (Some(map), None) | (None, Some(map)) => map,
            (None, None) => BTreeMap::new(),
        };

        let mut projects = BTreeMap::new();
        for project in raw.projects {
            if project.id.is_empty() {
                return Err(RouterError::ConfigInvalid("project with empty id".into()));
            }
            if projects.insert(project.id.clone(), project.clone()).is_some() {
                return Err(RouterError::ConfigInvalid(format!(
                    "duplicate project id '{}'",
                    project.id
                )));
            }
        }

        let cfg = Self {
            listen: raw.listen,
            admin: raw.admin,
            tool_exposure: raw.tool_exposure,
            routing: raw.routing,
            audit: raw.audit,
            projects,
            auth: raw.auth,
            sandbox: raw.sandbox,
            upstreams,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> RouterResult<()> {
        let mut seen_tokens = std::collections::HashSet::new();
        for token in &self.auth.tokens {
            if token.value.is_empty() {
                return Err(RouterError::ConfigInvalid("auth token with empty value".into()));
            }
            if !seen_tokens.insert(token.value.as_str()) {
                return Err(RouterError::ConfigInvalid("duplicate auth token value".into()));
            }
            if let Some(project_id) = &token.project_id {
                if !self.projects.contains_key(project_id) {
                    return Err(RouterError::ConfigInvalid(format!(
                        "token references unknown project '{project_id}'"
                    )));
                }
            }
        }

        for (name, upstream) in &self.upstreams {
            if name.is_empty() {
                return Err(RouterError::ConfigInvalid("upstream with empty name".into()));
            }
            if let Some(version) = &upstream.version {
                if semver::Version::parse(version).is_err() {
                    return Err(RouterError::ConfigInvalid(format!(
                        "upstream '{name}' declares invalid semver version '{version}'"
                    )));
                }
            }
            if !upstream.enabled {
                continue;
            }
            match upstream.transport {
                TransportKind::Http => {
                    let raw_url = upstream.url.as_deref().ok_or_else(|| {
                        RouterError::ConfigInvalid(format!(
                            "enabled http upstream '{name}' is missing 'url'"
                        ))
                    })?;
                    let parsed = url::Url::parse(raw_url).map_err(|e| {
                        RouterError::ConfigInvalid(format!(
                            "upstream '{name}' has invalid url '{raw_url}': {e}"
                        ))
                    })?;
                    if !matches!(parsed.scheme(), "http" | "https") {
                        return Err(RouterError::ConfigInvalid(format!(
                            "upstream '{name}' url must be http or https"
                        )));
                    }
                }
                TransportKind::Pipe => {
                    if upstream.command.as_deref().unwrap_or("").is_empty() {
                        return Err(RouterError::ConfigInvalid(format!(
                            "enabled pipe upstream '{name}' is missing 'command'"
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Whether any auth tokens are configured. When false, all sessions
    /// are anonymous.
    pub fn auth_enabled(&self) -> bool {
        !self.auth.tokens.is_empty()
    }
}
