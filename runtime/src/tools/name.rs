//! Tool-name routing.
//!
//! Tools are addressed as `<server>.<tool>`. Some LLM function-calling
//! backends restrict function names to word characters and encode the dot
//! as a double underscore; [`normalize`] undoes that encoding before
//! [`split`] validates and routes.

use regex::Regex;
use std::sync::LazyLock;

static TOOL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([\w][\w-]*)\.([\w][\w-]*)$").expect("invalid tool name regex"));

/// Error returned when a tool name does not match `<server>.<tool>`.
#[derive(Debug, thiserror::Error)]
#[error("invalid tool name {0:?}: expected <server>.<tool>")]
pub struct InvalidToolName(pub String);

/// Undo the `server__tool` encoding used by word-character-only function
/// naming schemes. Names already containing a dot pass through untouched.
pub fn normalize(name: &str) -> String {
    if name.contains("__") && !name.contains('.') {
        name.replacen("__", ".", 1)
    } else {
        name.to_string()
    }
}

/// Split a canonical tool name into `(server, tool)`.
pub fn split(name: &str) -> Result<(&str, &str), InvalidToolName> {
    let caps = TOOL_NAME_RE
        .captures(name)
        .ok_or_else(|| InvalidToolName(name.to_string()))?;
    // Both groups are guaranteed by the regex.
    let server = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    let tool = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    Ok((server, tool))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_double_underscore() {
        assert_eq!(normalize("kubernetes__get_pods"), "kubernetes.get_pods");
        // Only the first separator is rewritten.
        assert_eq!(normalize("srv__get__pods"), "srv.get__pods");
    }

    #[test]
    fn normalize_passes_through_dotted_names() {
        assert_eq!(normalize("kubernetes.get_pods"), "kubernetes.get_pods");
        // A dot anywhere disables the rewrite.
        assert_eq!(normalize("srv.get__pods"), "srv.get__pods");
        assert_eq!(normalize("plain"), "plain");
    }

    #[test]
    fn split_valid_names() {
        assert_eq!(split("kubernetes.get_pods").unwrap(), ("kubernetes", "get_pods"));
        assert_eq!(
            split("kubernetes-server.get-pods").unwrap(),
            ("kubernetes-server", "get-pods")
        );
    }

    #[test]
    fn split_rejects_malformed_names() {
        assert!(split(".tool").is_err());
        assert!(split("server.").is_err());
        assert!(split("no_dot").is_err());
        assert!(split("a.b.c").is_err());
        assert!(split("-server.tool").is_err());
        assert!(split("").is_err());
    }

    #[test]
    fn split_after_normalize_round_trip() {
        let normalized = normalize("grafana__query_range");
        let (server, tool) = split(&normalized).unwrap();
        assert_eq!(server, "grafana");
        assert_eq!(tool, "query_range");
    }
}
