//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`HelmSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `HELM_*` environment variable overrides
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::HelmSettings;

/// Resolve the path to the settings file (`~/.helm/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".helm").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<HelmSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<HelmSettings> {
    let defaults = serde_json::to_value(HelmSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: HelmSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
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

/// Apply overrides read through `lookup` (the process environment in
/// production). Empty and unparsable values are ignored.
pub fn apply_overrides(settings: &mut HelmSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("HELM_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("HELM_PORT") {
        if let Some(port) = parse_in_range::<u16>(&v, 0, u16::MAX) {
            settings.server.port = port;
        } else {
            warn!(key = "HELM_PORT", value = %v, "invalid port env var, ignoring");
        }
    }
    if let Some(v) = read("HELM_CALL_TIMEOUT_MS") {
        match parse_in_range::<u64>(&v, 1, 3_600_000) {
            Some(ms) => settings.broker.call_timeout_ms = ms,
            None => warn!(key = "HELM_CALL_TIMEOUT_MS", value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read("HELM_GRACE_PERIOD_MS") {
        match parse_in_range::<u64>(&v, 1, 86_400_000) {
            Some(ms) => settings.broker.grace_period_ms = ms,
            None => warn!(key = "HELM_GRACE_PERIOD_MS", value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read("HELM_CONNECT_TIMEOUT_MS") {
        match parse_in_range::<u64>(&v, 1, 3_600_000) {
            Some(ms) => settings.broker.connect_timeout_ms = ms,
            None => warn!(key = "HELM_CONNECT_TIMEOUT_MS", value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read("HELM_PUBLIC_IP_URL") {
        settings.addressing.public_ip_url = v;
    }
    if let Some(v) = read("HELM_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

/// Reject settings the broker cannot run with.
pub fn validate(settings: &HelmSettings) -> Result<()> {
    if settings.broker.call_timeout_ms == 0 {
        return Err(SettingsError::InvalidValue("broker.callTimeoutMs must be positive".into()));
    }
    if settings.broker.grace_period_ms == 0 {
        return Err(SettingsError::InvalidValue("broker.gracePeriodMs must be positive".into()));
    }
    if settings.server.outbound_queue == 0 {
        return Err(SettingsError::InvalidValue("server.outboundQueue must be positive".into()));
    }
    Ok(())
}

/// Parse a string as a number within an inclusive range.
pub fn parse_in_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
