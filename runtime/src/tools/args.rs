//! Tool-argument parsing.
//!
//! LLMs emit tool arguments as free-form strings: JSON when the backend
//! supports structured function calling, YAML or `key: value` lines when it
//! does not, and occasionally plain prose. The cascade here tries each
//! format in order and always produces a parameter map; unparseable input
//! is delivered as `{"input": <raw string>}` so the tool can still see it.

use serde_json::{Map, Value};

/// Parse a free-form argument string into a parameter map.
///
/// Cascade, first match wins: empty input, JSON, YAML, `key: value` /
/// `key=value` pairs, raw-string fallback.
pub fn parse_arguments(input: &str) -> Map<String, Value> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Map::new();
    }
    if let Some(map) = parse_json(trimmed) {
        return map;
    }
    if let Some(map) = parse_yaml(trimmed) {
        return map;
    }
    if let Some(map) = parse_key_value(trimmed) {
        return map;
    }
    wrap_raw(trimmed)
}

/// JSON sniffing: only attempt a JSON decode when the first byte could
/// start a JSON value. Prose like "get all pods" never reaches serde.
fn looks_like_json(input: &str) -> bool {
    matches!(
        input.as_bytes().first(),
        Some(b'{' | b'[' | b'"' | b'-' | b't' | b'f' | b'n' | b'0'..=b'9')
    )
}

fn parse_json(input: &str) -> Option<Map<String, Value>> {
    if !looks_like_json(input) {
        return None;
    }
    let value: Value = serde_json::from_str(input).ok()?;
    Some(match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other);
            map
        }
    })
}

/// Accept YAML only when it decodes to a non-empty mapping with at least
/// one nested mapping or sequence value. Plain sentences containing colons
/// ("error: connection refused") decode to flat string mappings and must
/// fall through to the key-value parser instead.
fn parse_yaml(input: &str) -> Option<Map<String, Value>> {
    let value: serde_yaml::Value = serde_yaml::from_str(input).ok()?;
    let mapping = value.as_mapping()?;
    if mapping.is_empty() {
        return None;
    }
    let structured = mapping
        .values()
        .any(|v| v.is_mapping() || v.is_sequence());
    if !structured {
        return None;
    }
    // Non-string keys fail the conversion and fall through.
    match serde_json::to_value(&value).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Parse comma- or newline-separated `key: value` / `key=value` pairs.
/// All-or-nothing: one malformed part rejects the whole input.
fn parse_key_value(input: &str) -> Option<Map<String, Value>> {
    let normalized = input.replace('\n', ",");
    let mut map = Map::new();
    for part in normalized.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, value) = split_pair(part)?;
        map.insert(key.to_string(), coerce_scalar(value));
    }
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// Try `key: value` first, then `key=value`. Keys must be non-empty and
/// contain no spaces.
fn split_pair(part: &str) -> Option<(&str, &str)> {
    for sep in [':', '='] {
        if let Some((key, value)) = part.split_once(sep) {
            let key = key.trim();
            if !key.is_empty() && !key.contains(' ') {
                return Some((key, value.trim()));
            }
        }
    }
    None
}

fn coerce_scalar(raw: &str) -> Value {
    match raw.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "none" => return Value::Null,
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        // NaN and infinities have no JSON representation.
        if f.is_finite() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Value::Number(n);
            }
        }
    }
    Value::String(raw.to_string())
}

fn wrap_raw(input: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("input".to_string(), Value::String(input.to_string()));
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_input_yields_empty_map() {
        assert!(parse_arguments("").is_empty());
        assert!(parse_arguments("   \n  ").is_empty());
    }

    #[test]
    fn json_object() {
        let map = parse_arguments(r#"{"namespace": "default"}"#);
        assert_eq!(map["namespace"], json!("default"));
    }

    #[test]
    fn json_scalar_wraps_as_input() {
        let map = parse_arguments("42");
        assert_eq!(map["input"], json!(42));

        let map = parse_arguments("[1, 2]");
        assert_eq!(map["input"], json!([1, 2]));

        let map = parse_arguments("true");
        assert_eq!(map["input"], json!(true));
    }

    #[test]
    fn yaml_with_nested_structure() {
        let map = parse_arguments("selector:\n  app: web\nnamespaces:\n  - default\n  - kube-system");
        assert_eq!(map["selector"]["app"], json!("web"));
        assert_eq!(map["namespaces"], json!(["default", "kube-system"]));
    }

    #[test]
    fn flat_yaml_falls_through_to_key_value() {
        // A flat mapping is not accepted by the YAML arm; the key-value
        // parser picks it up and coerces scalars.
        let map = parse_arguments("namespace: default, limit: 10");
        assert_eq!(map["namespace"], json!("default"));
        assert_eq!(map["limit"], json!(10));
    }

    #[test]
    fn key_value_equals_and_newlines() {
        let map = parse_arguments("namespace=default\nlimit=10\nverbose=true");
        assert_eq!(map["namespace"], json!("default"));
        assert_eq!(map["limit"], json!(10));
        assert_eq!(map["verbose"], json!(true));
    }

    #[test]
    fn key_value_scalar_coercion() {
        let map = parse_arguments("a: true, b: FALSE, c: null, d: none, e: 3, f: 2.5, g: text");
        assert_eq!(map["a"], json!(true));
        assert_eq!(map["b"], json!(false));
        assert_eq!(map["c"], json!(null));
        assert_eq!(map["d"], json!(null));
        assert_eq!(map["e"], json!(3));
        assert_eq!(map["f"], json!(2.5));
        assert_eq!(map["g"], json!("text"));
    }

    #[test]
    fn nan_and_infinity_stay_strings() {
        let map = parse_arguments("a: NaN, b: inf");
        assert_eq!(map["a"], json!("NaN"));
        assert_eq!(map["b"], json!("inf"));
    }

    #[test]
    fn value_with_colon_splits_on_first_separator() {
        let map = parse_arguments("url: http://example.com/path");
        assert_eq!(map["url"], json!("http://example.com/path"));
    }

    #[test]
    fn prose_falls_back_to_raw_input() {
        let map = parse_arguments("get all pods");
        assert_eq!(map["input"], json!("get all pods"));
    }

    #[test]
    fn malformed_pair_rejects_whole_input() {
        // "in namespace default" has no separator, so the key-value parser
        // rejects everything and the raw fallback wins.
        let map = parse_arguments("namespace: default, in namespace default");
        assert_eq!(
            map["input"],
            json!("namespace: default, in namespace default")
        );
    }

    #[test]
    fn comma_inside_value_is_lossy_but_safe() {
        // Known limitation: literal commas in values mis-split, the pair
        // parse fails, and the raw string is delivered instead.
        let map = parse_arguments("message: hello, world");
        assert_eq!(map["input"], json!("message: hello, world"));
    }

    #[test]
    fn result_is_always_a_string_keyed_map() {
        for input in ["", "42", "a: 1", "free text", "{\"x\": null}", "- just\n- a\n- list"] {
            // Every cascade arm produces a Map<String, Value>; this just
            // exercises the corners.
            let _ = parse_arguments(input);
        }
    }
}
