//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ConduitSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `CONDUIT_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::ConduitSettings;

/// Resolve the path to the settings file (`~/.conduit/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".conduit").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ConduitSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. Invalid JSON or a value
/// rejected by [`ConduitSettings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ConduitSettings> {
    let defaults = serde_json::to_value(ConduitSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ConduitSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Integers must parse and fall inside the given range. Booleans accept
/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`. Invalid values are
/// logged and ignored.
pub fn apply_env_overrides(settings: &mut ConduitSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("CONDUIT_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u64("CONDUIT_SHUTDOWN_TIMEOUT_MS", 0, 600_000) {
        settings.server.shutdown_timeout_ms = v;
    }

    // ── WebSocket ───────────────────────────────────────────────────
    if let Some(v) = read_env_bool("CONDUIT_WS_ENABLED") {
        settings.websocket.enabled = v;
    }
    if let Some(v) = read_env_u16("CONDUIT_WS_PORT", 0, 65535) {
        settings.websocket.port = v;
    }
    if let Some(v) = read_env_usize("CONDUIT_WS_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.websocket.max_connections = v;
    }
    if let Some(v) = read_env_u64("CONDUIT_WS_HEARTBEAT_INTERVAL_MS", 100, 600_000) {
        settings.websocket.heartbeat_interval_ms = v;
    }
    if let Some(v) = read_env_u64("CONDUIT_WS_IDLE_TIMEOUT_MS", 100, 86_400_000) {
        settings.websocket.idle_timeout_ms = v;
    }

    // ── HTTP ────────────────────────────────────────────────────────
    if let Some(v) = read_env_bool("CONDUIT_HTTP_ENABLED") {
        settings.http.enabled = v;
    }
    if let Some(v) = read_env_u16("CONDUIT_HTTP_PORT", 0, 65535) {
        settings.http.port = v;
    }
    if let Some(v) = read_env_usize("CONDUIT_HTTP_MAX_CONCURRENT", 1, 100_000) {
        settings.http.max_concurrent = v;
    }
    if let Some(v) = read_env_usize("CONDUIT_HTTP_MAX_QUEUE_DEPTH", 0, 1_000_000) {
        settings.http.max_queue_depth = v;
    }
    if let Some(v) = read_env_u64("CONDUIT_HTTP_REQUEST_TIMEOUT_MS", 1, 3_600_000) {
        settings.http.request_timeout_ms = v;
    }

    // ── Streaming ───────────────────────────────────────────────────
    if let Some(v) = read_env_bool("CONDUIT_STREAM_ENABLED") {
        settings.streaming.enabled = v;
    }
    if let Some(v) = read_env_u16("CONDUIT_STREAM_PORT", 0, 65535) {
        settings.streaming.port = v;
    }

    // ── Dispatch / auth / logging ───────────────────────────────────
    if let Some(v) = read_env_u64("CONDUIT_HANDLER_TIMEOUT_MS", 1, 3_600_000) {
        settings.dispatch.handler_timeout_ms = v;
    }
    if let Some(v) = read_env_string("CONDUIT_AUTH_TOKENS") {
        settings.auth.tokens = parse_token_list(&v);
        settings.auth.required = !settings.auth.tokens.is_empty();
    }
    if let Some(v) = read_env_string("CONDUIT_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("CONDUIT_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Split a comma-separated token list, dropping blanks.
pub fn parse_token_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"http": {"port": 8080, "maxConcurrent": 4}});
        let source = serde_json::json!({"http": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["http"]["port"], 9090);
        assert_eq!(merged["http"]["maxConcurrent"], 4);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"tokens": ["a", "b"]});
        let source = serde_json::json!({"tokens": ["c"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["tokens"], serde_json::json!(["c"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        assert_eq!(deep_merge(target, source)["a"], 42);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        let defaults = ConduitSettings::default();
        assert_eq!(settings.http.max_concurrent, defaults.http.max_concurrent);
        assert_eq!(
            settings.websocket.heartbeat_interval_ms,
            defaults.websocket.heartbeat_interval_ms
        );
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"http": {"circuitBreaker": {"failureThreshold": 2}}, "streaming": {"maxLineSize": 1024}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.http.circuit_breaker.failure_threshold, 2);
        assert_eq!(settings.http.circuit_breaker.half_open_successes, 3);
        assert_eq!(settings.streaming.max_line_size, 1024);
        assert_eq!(settings.http.client_id_header, "x-client-id");
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Json(_)));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"dispatch": {"handlerTimeoutMs": 0}}"#).unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::InvalidValue(_)));
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for v in ["true", "1", "YES", "On"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "no", "OFF"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u16_range("70000", 1, 65535), None);
        assert_eq!(parse_u64_range("500", 100, 1000), Some(500));
        assert_eq!(parse_u64_range("-1", 0, 10), None);
        assert_eq!(parse_usize_range("abc", 0, 10), None);
    }

    #[test]
    fn parse_token_list_trims_and_drops_blanks() {
        assert_eq!(parse_token_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(parse_token_list(" , ").is_empty());
    }
}
