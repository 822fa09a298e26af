//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ParleySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `PARLEY_*` environment variable overrides
//! 4. Validate
//!
//! Merge rules: objects merge per key, arrays and primitives are replaced,
//! `null` in the file keeps the default.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{OverflowMode, ParleySettings};

/// Default settings file (`~/.parley/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley").join("settings.json")
}

/// Load from [`settings_path`] with env overrides.
pub fn load_settings() -> Result<ParleySettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` with env overrides. A missing file yields defaults;
/// a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ParleySettings> {
    let mut settings = merge_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn merge_file(path: &Path) -> Result<ParleySettings> {
    let defaults = serde_json::to_value(ParleySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive merge of `source` over `target`.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PARLEY_*` overrides. Unparseable or out-of-range values are
/// ignored with a warning.
pub fn apply_env_overrides(settings: &mut ParleySettings) {
    // ── Server ──
    if let Some(v) = read_env_string("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("PARLEY_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_usize("PARLEY_MAX_CONNECTIONS", 1, 100_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = read_env_u64("PARLEY_SESSION_GRACE_MS", 0, 86_400_000) {
        settings.server.session_grace_period_ms = v;
    }
    if let Some(v) = read_env_u64("PARLEY_SNAPSHOT_INTERVAL_MS", 100, 3_600_000) {
        settings.server.snapshot_interval_ms = v;
    }

    // ── Plugins ──
    if let Some(v) = read_env_string("PARLEY_PLUGINS_DIR") {
        settings.plugins.root_dir = PathBuf::from(v);
    }
    if let Some(v) = read_env_bool("PARLEY_PLUGINS_WATCH") {
        settings.plugins.watch = v;
    }
    if let Some(v) = read_env_usize("PARLEY_DISPATCH_CONCURRENCY", 1, 4096) {
        settings.plugins.dispatch_concurrency = v;
    }
    if let Some(v) = read_env_string("PARLEY_DISPATCH_OVERFLOW") {
        match parse_overflow(&v) {
            Some(mode) => settings.plugins.overflow = mode,
            None => tracing::warn!(key = "PARLEY_DISPATCH_OVERFLOW", value = %v, "invalid overflow mode, ignoring"),
        }
    }
    if let Some(v) = read_env_u64("PARLEY_HANDLER_TIMEOUT_MS", 100, 3_600_000) {
        settings.plugins.handler_timeout_ms = v;
    }

    if let Some(v) = read_env_string("PARLEY_STATE_DIR") {
        settings.plugins.state_dir = PathBuf::from(v);
    }

    // ── Audit / provider / logging ──
    if let Some(v) = read_env_string("PARLEY_AUDIT_DIR") {
        settings.audit.dir = PathBuf::from(v);
    }
    if let Some(v) = read_env_string("PARLEY_PROVIDER_COMMAND") {
        settings.provider.command = v;
    }
    if let Some(v) = read_env_string("PARLEY_PROVIDER_MODEL") {
        settings.provider.model = Some(v);
    }
    if let Some(v) = read_env_string("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("PARLEY_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──

/// Parse `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse `wait` or `drop`, any case.
pub fn parse_overflow(val: &str) -> Option<OverflowMode> {
    match val.to_lowercase().as_str() {
        "wait" => Some(OverflowMode::Wait),
        "drop" => Some(OverflowMode::Drop),
        _ => None,
    }
}

/// Parse a `u16` within `min..=max`.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `u64` within `min..=max`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `usize` within `min..=max`.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

// ── Env readers ──

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
