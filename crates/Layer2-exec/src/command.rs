//! Command results, invocation ids and argument handling

use chrono::{DateTime, Utc};
use conduit_foundation::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Longest accepted command name
pub const MAX_COMMAND_LEN: usize = 64;

/// Argument key whose values are passed as positional arguments
pub const POSITIONAL_KEY: &str = "_";

// ============================================================================
// Invocation ID
// ============================================================================

/// Unique identifier for one `execute` call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(String);

impl InvocationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for InvocationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Command Result
// ============================================================================

/// Outcome of one external tool invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Messages decoded from the tool's response channel, in arrival order
    #[serde(default)]
    pub messages: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Captured diagnostic output (truncated)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,

    /// True when served from the result cache
    #[serde(default)]
    pub cached: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_info: Option<CacheProvenance>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionMetadata>,
}

impl CommandResult {
    pub fn success(messages: Vec<Value>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            messages,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// The final message, which by convention carries the command's answer
    pub fn output(&self) -> Option<&Value> {
        self.messages.last()
    }

    /// Serialized size used for the cache size ceiling
    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(self)
            .map(|bytes| bytes.len())
            .unwrap_or(usize::MAX)
    }

    /// Human-readable failure description
    pub fn failure_message(&self) -> String {
        if let Some(ref error) = self.error {
            return error.clone();
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.lines().last().unwrap_or(stderr).to_string();
        }
        match self.exit_code {
            Some(code) => format!("exited with code {}", code),
            None => "terminated without exit code".to_string(),
        }
    }
}

/// Provenance attached to a cache hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheProvenance {
    pub key: String,
    pub hit_count: u64,
    pub cached_at: DateTime<Utc>,
}

/// Metadata attached to a freshly executed result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub invocation_id: String,
    pub execution_time_ms: u64,
}

// ============================================================================
// Validation
// ============================================================================

/// Command names are a single token: `[A-Za-z0-9][A-Za-z0-9:._-]*`
pub fn validate_command(command: &str) -> Result<()> {
    if command.is_empty() {
        return Err(Error::Validation("command name must not be empty".into()));
    }
    if command.len() > MAX_COMMAND_LEN {
        return Err(Error::Validation(format!(
            "command name exceeds {} characters",
            MAX_COMMAND_LEN
        )));
    }

    let mut chars = command.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '_' | '-'));
    if !first_ok || !rest_ok {
        return Err(Error::Validation(format!(
            "invalid command name '{}'",
            command
        )));
    }
    Ok(())
}

/// Arguments must be a JSON object (or null) with non-blank keys.
///
/// Keys are trimmed during normalization, so two keys that differ only in
/// surrounding whitespace are rejected instead of silently merged.
pub fn validate_args(args: &Value) -> Result<()> {
    match args {
        Value::Null => Ok(()),
        Value::Object(map) => validate_keys(map),
        other => Err(Error::Validation(format!(
            "arguments must be an object, got {}",
            json_type_name(other)
        ))),
    }
}

fn validate_keys(map: &Map<String, Value>) -> Result<()> {
    let mut seen = HashSet::with_capacity(map.len());
    for (key, value) in map {
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("argument names must not be blank".into()));
        }
        if !seen.insert(trimmed) {
            return Err(Error::Validation(format!(
                "argument '{}' is given more than once",
                trimmed
            )));
        }
        nested_keys(value)?;
    }
    Ok(())
}

fn nested_keys(value: &Value) -> Result<()> {
    match value {
        Value::Object(map) => validate_keys(map),
        Value::Array(items) => items.iter().try_for_each(nested_keys),
        _ => Ok(()),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Argument conversion
// ============================================================================

/// Convert normalized arguments into command-line flags.
///
/// `{"maxDepth": 2, "verbose": true, "_": ["src"]}` becomes
/// `["--max-depth", "2", "--verbose", "src"]`. `false` and `null` values are
/// omitted, arrays repeat the flag, nested objects are passed as JSON text.
pub fn to_cli_args(args: &Value) -> Vec<String> {
    let Value::Object(map) = args else {
        return Vec::new();
    };

    let mut flags = Vec::new();
    let mut positional = Vec::new();

    for (key, value) in map {
        if key == POSITIONAL_KEY {
            match value {
                Value::Array(items) => positional.extend(items.iter().filter_map(scalar_text)),
                other => positional.extend(scalar_text(other)),
            }
            continue;
        }

        let flag = flag_name(key);
        match value {
            Value::Null | Value::Bool(false) => {}
            Value::Bool(true) => flags.push(flag),
            Value::Array(items) => {
                for item in items {
                    if let Some(text) = scalar_text(item) {
                        flags.push(flag.clone());
                        flags.push(text);
                    }
                }
            }
            other => {
                if let Some(text) = scalar_text(other) {
                    flags.push(flag);
                    flags.push(text);
                }
            }
        }
    }

    flags.extend(positional);
    flags
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// `maxDepth` -> `--max-depth`; keys that already look like flags pass through
fn flag_name(key: &str) -> String {
    if key.starts_with('-') {
        return key.to_string();
    }
    let mut flag = String::with_capacity(key.len() + 4);
    flag.push_str("--");
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                flag.push('-');
            }
            flag.push(c.to_ascii_lowercase());
        } else if c == '_' {
            flag.push('-');
        } else {
            flag.push(c);
        }
    }
    flag
}
