//! Principals and access policy
//!
//! Resolves a presented token into a [`Principal`] with effective
//! allowlists (the intersection of the token's and its project's), and
//! enforces those allowlists when a call resolves to an upstream. All
//! decisions are fail-closed; only a truncated token fingerprint ever
//! reaches the logs.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use crate::config::{NormalizedConfig, UpstreamConfig};
use crate::error::{RouterError, RouterResult};

/// Truncated SHA-256 length carried into audit entries.
const FINGERPRINT_HEX_CHARS: usize = 12;

/// An allowlist where `All` acts as the top element of the intersection
/// lattice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allowlist {
    All,
    Only(BTreeSet<String>),
}

impl Allowlist {
    fn from_option(values: Option<&Vec<String>>) -> Self {
        match values {
            None => Allowlist::All,
            Some(list) => Allowlist::Only(list.iter().cloned().collect()),
        }
    }

    /// Intersection with `All` as identity.
    fn intersect(self, other: Allowlist) -> Allowlist {
        match (self, other) {
            (Allowlist::All, other) => other,
            (this, Allowlist::All) => this,
            (Allowlist::Only(a), Allowlist::Only(b)) => {
                Allowlist::Only(a.intersection(&b).cloned().collect())
            }
        }
    }

    pub fn permits(&self, value: &str) -> bool {
        match self {
            Allowlist::All => true,
            Allowlist::Only(set) => set.contains(value),
        }
    }

    /// For tag allowlists: does any of `values` intersect the list?
    pub fn permits_any(&self, values: &[String]) -> bool {
        match self {
            Allowlist::All => true,
            Allowlist::Only(set) => values.iter().any(|v| set.contains(v)),
        }
    }
}

/// The authenticated identity bound to a session.
#[derive(Debug, Clone)]
pub enum Principal {
    /// Auth is disabled; everything is permitted and nothing is rate
    /// limited.
    Anonymous,
    Token(TokenPrincipal),
}

#[derive(Debug, Clone)]
pub struct TokenPrincipal {
    /// The raw token; used only as the rate-limit bucket key.
    pub token: String,
    /// Truncated SHA-256 of the token; the only identifier that reaches
    /// audit logs.
    pub fingerprint: String,
    pub project_id: Option<String>,
    pub allowed_upstreams: Allowlist,
    pub allowed_tags: Allowlist,
    pub rate_limit_rpm: Option<u32>,
}

impl Principal {
    /// A principal that can see nothing. Fail-closed placeholder for
    /// sessions whose identity could not be established.
    pub fn denied() -> Self {
        Principal::Token(TokenPrincipal {
            token: String::new(),
            fingerprint: "unbound".to_string(),
            project_id: None,
            allowed_upstreams: Allowlist::Only(BTreeSet::new()),
            allowed_tags: Allowlist::Only(BTreeSet::new()),
            rate_limit_rpm: None,
        })
    }

    /// Identifier for audit entries.
    pub fn audit_id(&self) -> &str {
        match self {
            Principal::Anonymous => "anonymous",
            Principal::Token(t) => &t.fingerprint,
        }
    }

    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            Principal::Anonymous => None,
            Principal::Token(t) => Some(&t.fingerprint),
        }
    }

    pub fn rate_limit_key(&self) -> Option<(&str, u32)> {
        match self {
            Principal::Anonymous => None,
            Principal::Token(t) => t.rate_limit_rpm.map(|rpm| (t.token.as_str(), rpm)),
        }
    }
}

/// Truncated SHA-256 hex of a token value.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    hex[..FINGERPRINT_HEX_CHARS].to_string()
}

/// Resolve a presented token against the config.
///
/// With no tokens configured every caller is [`Principal::Anonymous`].
/// Otherwise a missing token and an unknown token are distinct
/// `Unauthenticated` failures so operators can tell the two apart in logs.
pub fn principal_from_token(
    cfg: &NormalizedConfig,
    token: Option<&str>,
) -> RouterResult<Principal> {
    if !cfg.auth_enabled() {
        return Ok(Principal::Anonymous);
    }

    let token = match token {
        Some(t) if !t.is_empty() => t,
        _ => return Err(RouterError::Unauthenticated("Missing token".into())),
    };

    let entry = cfg
        .auth
        .tokens
        .iter()
        .find(|t| t.value == token)
        .ok_or_else(|| RouterError::Unauthenticated("Invalid token".into()))?;

    let project = entry
        .project_id
        .as_ref()
        .and_then(|id| cfg.projects.get(id));

    let project_upstreams =
        Allowlist::from_option(project.and_then(|p| p.allowed_mcp_servers.as_ref()));
    let project_tags = Allowlist::from_option(project.and_then(|p| p.allowed_tags.as_ref()));
    let token_upstreams = Allowlist::from_option(entry.allowed_mcp_servers.as_ref());
    let token_tags = Allowlist::from_option(entry.allowed_tags.as_ref());

    let rate_limit_rpm = entry
        .rate_limit
        .as_ref()
        .and_then(|r| r.requests_per_minute)
        .or_else(|| {
            project
                .and_then(|p| p.rate_limit.as_ref())
                .and_then(|r| r.requests_per_minute)
        });

    Ok(Principal::Token(TokenPrincipal {
        token: entry.value.clone(),
        fingerprint: token_fingerprint(&entry.value),
        project_id: entry.project_id.clone(),
        allowed_upstreams: project_upstreams.intersect(token_upstreams),
        allowed_tags: project_tags.intersect(token_tags),
        rate_limit_rpm,
    }))
}

/// Whether the principal may see this upstream at all. Used to filter
/// provider listings and selector candidate sets.
pub fn upstream_visible(principal: &Principal, name: &str, cfg: &UpstreamConfig) -> bool {
    match principal {
        Principal::Anonymous => true,
        Principal::Token(t) => {
            t.allowed_upstreams.permits(name) && t.allowed_tags.permits_any(&cfg.tags)
        }
    }
}

/// Enforce the allowlists for a resolved upstream.
pub fn assert_allowed_upstream(
    principal: &Principal,
    name: &str,
    cfg: &UpstreamConfig,
) -> RouterResult<()> {
    if upstream_visible(principal, name, cfg) {
        Ok(())
    } else {
        Err(RouterError::Forbidden(format!(
            "access to upstream '{name}' is not permitted"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NormalizedConfig;

    fn config(content: &str) -> NormalizedConfig {
        NormalizedConfig::parse(content).unwrap()
    }

    // ============== Principal Resolution ==============

    #[test]
    fn anonymous_when_no_tokens_configured() {
        let cfg = config("{}");
        let principal = principal_from_token(&cfg, None).unwrap();
        assert!(matches!(principal, Principal::Anonymous));
        // Even a garbage token resolves anonymous when auth is off.
        let principal = principal_from_token(&cfg, Some("whatever")).unwrap();
        assert!(matches!(principal, Principal::Anonymous));
    }

    #[test]
    fn missing_token_rejected() {
        let cfg = config(r#"{"auth": {"tokens": [{"value": "t"}]}}"#);
        let err = principal_from_token(&cfg, None).unwrap_err();
        assert!(err.to_string().contains("Missing token"));
    }

    #[test]
    fn unknown_token_rejected() {
        let cfg = config(r#"{"auth": {"tokens": [{"value": "t"}]}}"#);
        let err = principal_from_token(&cfg, Some("nope")).unwrap_err();
        assert!(err.to_string().contains("Invalid token"));
    }

    #[test]
    fn allowlists_intersect_project_and_token() {
        let cfg = config(
            r#"{
                "projects": [{"id": "p", "allowedMcpServers": ["a", "b"]}],
                "auth": {"tokens": [{"value": "t", "projectId": "p", "allowedMcpServers": ["b", "c"]}]}
            }"#,
        );
        let principal = principal_from_token(&cfg, Some("t")).unwrap();
        let Principal::Token(t) = principal else { panic!("expected token principal") };
        assert_eq!(
            t.allowed_upstreams,
            Allowlist::Only(["b".to_string()].into_iter().collect())
        );
    }

    #[test]
    fn null_allowlists_act_as_top() {
        let cfg = config(
            r#"{
                "projects": [{"id": "p"}],
                "auth": {"tokens": [{"value": "t", "projectId": "p", "allowedMcpServers": ["x"]}]}
            }"#,
        );
        let Principal::Token(t) = principal_from_token(&cfg, Some("t")).unwrap() else {
            panic!()
        };
        // project is top, token restricts
        assert!(t.allowed_upstreams.permits("x"));
        assert!(!t.allowed_upstreams.permits("y"));
        // both null => top
        let cfg = config(r#"{"auth": {"tokens": [{"value": "t"}]}}"#);
        let Principal::Token(t) = principal_from_token(&cfg, Some("t")).unwrap() else {
            panic!()
        };
        assert_eq!(t.allowed_upstreams, Allowlist::All);
    }

    #[test]
    fn rate_limit_prefers_token_over_project() {
        let cfg = config(
            r#"{
                "projects": [{"id": "p", "rateLimit": {"requestsPerMinute": 10}}],
                "auth": {"tokens": [
                    {"value": "a", "projectId": "p", "rateLimit": {"requestsPerMinute": 5}},
                    {"value": "b", "projectId": "p"}
                ]}
            }"#,
        );
        let Principal::Token(a) = principal_from_token(&cfg, Some("a")).unwrap() else { panic!() };
        let Principal::Token(b) = principal_from_token(&cfg, Some("b")).unwrap() else { panic!() };
        assert_eq!(a.rate_limit_rpm, Some(5));
        assert_eq!(b.rate_limit_rpm, Some(10));
    }

    // ============== Authorization ==============

    fn upstream_with_tags(tags: &[&str]) -> crate::config::UpstreamConfig {
        let json = serde_json::json!({
            "transport": "http",
            "url": "http://localhost/mcp",
            "tags": tags,
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn anonymous_passes_unconditionally() {
        let upstream = upstream_with_tags(&[]);
        assert!(assert_allowed_upstream(&Principal::Anonymous, "x", &upstream).is_ok());
    }

    #[test]
    fn name_allowlist_enforced() {
        let cfg = config(
            r#"{
                "projects": [{"id": "p", "allowedMcpServers": ["demo1"]}],
                "auth": {"tokens": [{"value": "t", "projectId": "p"}]}
            }"#,
        );
        let principal = principal_from_token(&cfg, Some("t")).unwrap();
        let upstream = upstream_with_tags(&[]);
        assert!(assert_allowed_upstream(&principal, "demo1", &upstream).is_ok());
        let err = assert_allowed_upstream(&principal, "demo2", &upstream).unwrap_err();
        assert!(matches!(err, RouterError::Forbidden(_)));
    }

    #[test]
    fn tag_allowlist_requires_overlap() {
        let cfg = config(
            r#"{"auth": {"tokens": [{"value": "t", "allowedTags": ["prod"]}]}}"#,
        );
        let principal = principal_from_token(&cfg, Some("t")).unwrap();
        let tagged = upstream_with_tags(&["prod", "demo"]);
        let untagged = upstream_with_tags(&["dev"]);
        assert!(assert_allowed_upstream(&principal, "a", &tagged).is_ok());
        assert!(assert_allowed_upstream(&principal, "b", &untagged).is_err());
    }

    #[test]
    fn fingerprint_is_short_and_stable() {
        let fp = token_fingerprint("dev-token");
        assert_eq!(fp.len(), 12);
        assert_eq!(fp, token_fingerprint("dev-token"));
        assert_ne!(fp, token_fingerprint("other"));
    }
}
