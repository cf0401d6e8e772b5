//! Namespaced tool names
//!
//! Upstream tools are surfaced as `<upstream>.<sanitized-tool>`. Upstream
//! names may themselves contain dots, so the call side splits on the
//! longest configured upstream-name prefix rather than the first dot.

/// Keep `[A-Za-z0-9_.-]`, replace anything else with `_`, trim leading and
/// trailing dots. An empty result maps to `_`.
pub fn sanitize_tool_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// The namespaced name an upstream tool is surfaced under.
pub fn namespaced(upstream: &str, tool: &str) -> String {
    format!("{upstream}.{}", sanitize_tool_name(tool))
}

/// Split a namespaced name into `(upstream, rest)` using the longest
/// matching upstream-name prefix from `upstreams`.
pub fn split_namespaced<'a, I>(name: &'a str, upstreams: I) -> Option<(&'a str, &'a str)>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut best: Option<usize> = None;
    for upstream in upstreams {
        let upstream = upstream.as_ref();
        if upstream.is_empty() || name.len() <= upstream.len() + 1 {
            continue;
        }
        if name.starts_with(upstream) && name.as_bytes()[upstream.len()] == b'.' {
            if best.map(|len| upstream.len() > len).unwrap_or(true) {
                best = Some(upstream.len());
            }
        }
    }
    best.map(|len| (&name[..len], &name[len + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_safe_runes() {
        assert_eq!(sanitize_tool_name("read_file-v2.1"), "read_file-v2.1");
    }

    #[test]
    fn sanitize_replaces_other_runes() {
        assert_eq!(sanitize_tool_name("read file!"), "read_file_");
        assert_eq!(sanitize_tool_name("a/b:c"), "a_b_c");
        assert_eq!(sanitize_tool_name("héllo"), "h_llo");
    }

    #[test]
    fn sanitize_trims_dots_and_maps_empty() {
        assert_eq!(sanitize_tool_name(".echo."), "echo");
        assert_eq!(sanitize_tool_name(""), "_");
        assert_eq!(sanitize_tool_name("..."), "_");
    }

    #[test]
    fn namespaced_joins_with_dot() {
        assert_eq!(namespaced("demo", "echo"), "demo.echo");
        assert_eq!(namespaced("demo", "weird tool"), "demo.weird_tool");
    }

    #[test]
    fn split_picks_longest_prefix() {
        let upstreams = ["svc", "svc.internal"];
        // both "svc" and "svc.internal" prefix-match; longest wins
        assert_eq!(
            split_namespaced("svc.internal.echo", upstreams),
            Some(("svc.internal", "echo"))
        );
        assert_eq!(split_namespaced("svc.echo", upstreams), Some(("svc", "echo")));
    }

    #[test]
    fn split_requires_nonempty_rest() {
        let upstreams = ["demo"];
        assert_eq!(split_namespaced("demo.", upstreams), None);
        assert_eq!(split_namespaced("demo", upstreams), None);
        assert_eq!(split_namespaced("other.echo", upstreams), None);
    }

    #[test]
    fn roundtrip_through_namespace() {
        let upstreams = ["demo"];
        let surfaced = namespaced("demo", "echo");
        let (upstream, rest) = split_namespaced(&surfaced, upstreams).unwrap();
        assert_eq!(upstream, "demo");
        assert_eq!(rest, "echo");
    }
}
