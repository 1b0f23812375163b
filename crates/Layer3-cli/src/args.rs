//! Command-line argument → JSON arguments

use anyhow::{anyhow, bail, Context};
use conduit_exec::command::POSITIONAL_KEY;
use serde_json::{Map, Value};

/// Merge `--json`, `--arg key=value` pairs and trailing positionals into one
/// JSON object. Later `--arg` values for the same key collect into an array.
pub fn build_arguments(
    json: Option<&str>,
    pairs: &[String],
    positional: &[String],
) -> anyhow::Result<Value> {
    let mut map = match json {
        Some(text) => match serde_json::from_str(text).context("--json is not valid JSON")? {
            Value::Object(map) => map,
            other => bail!("--json must be an object, got {}", other),
        },
        None => Map::new(),
    };

    let mut seen = std::collections::HashSet::new();
    for pair in pairs {
        let (key, value) = parse_pair(pair)?;
        if seen.insert(key.clone()) {
            map.insert(key, value);
            continue;
        }
        match map.get_mut(&key) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(key, value);
            }
        }
    }

    if !positional.is_empty() {
        let items = positional.iter().cloned().map(Value::String).collect();
        map.insert(POSITIONAL_KEY.to_string(), Value::Array(items));
    }

    Ok(Value::Object(map))
}

/// `key=value`; the value is JSON when it parses as JSON, otherwise a string.
/// A bare `key` means `key=true`.
fn parse_pair(pair: &str) -> anyhow::Result<(String, Value)> {
    let (key, raw) = match pair.split_once('=') {
        Some((key, raw)) => (key.trim(), Some(raw)),
        None => (pair.trim(), None),
    };
    if key.is_empty() {
        return Err(anyhow!("argument '{}' has an empty key", pair));
    }

    let value = match raw {
        None => Value::Bool(true),
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
    };
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pairs_are_typed() {
        let args = build_arguments(
            None,
            &strings(&["limit=5", "query=todo", "verbose", "ratio=0.5", "name=\"quoted\""]),
            &[],
        )
        .unwrap();

        assert_eq!(
            args,
            json!({"limit": 5, "query": "todo", "verbose": true, "ratio": 0.5, "name": "quoted"})
        );
    }

    #[test]
    fn test_repeated_keys_collect() {
        let args = build_arguments(None, &strings(&["tag=a", "tag=b", "tag=c"]), &[]).unwrap();
        assert_eq!(args, json!({"tag": ["a", "b", "c"]}));
    }

    #[test]
    fn test_pairs_override_json_and_positionals_are_kept() {
        let args = build_arguments(
            Some(r#"{"limit": 1, "deep": true}"#),
            &strings(&["limit=10"]),
            &strings(&["src", "tests"]),
        )
        .unwrap();

        assert_eq!(args, json!({"limit": 10, "deep": true, "_": ["src", "tests"]}));
    }

    #[test]
    fn test_invalid_input() {
        assert!(build_arguments(Some("[1, 2]"), &[], &[]).is_err());
        assert!(build_arguments(Some("{oops"), &[], &[]).is_err());
        assert!(build_arguments(None, &strings(&["=value"]), &[]).is_err());
    }
}
