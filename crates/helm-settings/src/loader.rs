//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`HelmSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `HELM_*` environment variable overrides (highest priority)
//! 4. [`validate`] the result

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::HelmSettings;

/// Resolve the default settings file path (`~/.helm/settings.json`).
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
/// A missing file yields defaults; invalid JSON or values are errors.
pub fn load_settings_from_path(path: &Path) -> Result<HelmSettings> {
    let defaults = serde_json::to_value(HelmSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: HelmSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
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

/// Apply `HELM_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut HelmSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable lookup.
///
/// Invalid values are logged and ignored (the file/default value stays).
pub fn apply_overrides(settings: &mut HelmSettings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let parsed = |name: &str, parse: &dyn Fn(&str) -> bool| {
        let val = string(name)?;
        if parse(&val) {
            Some(val)
        } else {
            warn!(key = name, value = %val, "invalid env var, ignoring");
            None
        }
    };

    if let Some(v) = string("HELM_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = parsed("HELM_PORT", &|v| v.parse::<u16>().is_ok()) {
        settings.server.port = v.parse().unwrap_or(settings.server.port);
    }
    if let Some(v) = string("HELM_BROWSER_HOST") {
        settings.browser.host = v;
    }
    if let Some(v) = parsed("HELM_BROWSER_PORT", &|v| parse_u16_range(v, 1, 65535).is_some()) {
        settings.browser.port = v.parse().unwrap_or(settings.browser.port);
    }
    if let Some(v) = parsed("HELM_DRY_RUN", &|v| parse_bool(v).is_some()) {
        settings.safety.dry_run = parse_bool(&v).unwrap_or(settings.safety.dry_run);
    }
    if let Some(v) = string("HELM_DB_PATH") {
        settings.database.path = v;
    }
    if let Some(v) = string("HELM_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

/// Check cross-field invariants the types cannot express.
pub fn validate(settings: &HelmSettings) -> Result<()> {
    for (action, limit) in &settings.rate_limits {
        if limit.max == 0 {
            return Err(SettingsError::invalid(
                format!("rateLimits.{action}.max"),
                "must be greater than 0",
            ));
        }
        if limit.window_minutes == 0 {
            return Err(SettingsError::invalid(
                format!("rateLimits.{action}.windowMinutes"),
                "must be greater than 0",
            ));
        }
    }

    let mut names = HashSet::new();
    for task in &settings.tasks {
        if task.name.is_empty() {
            return Err(SettingsError::invalid("tasks[].name", "must not be empty"));
        }
        if !names.insert(task.name.as_str()) {
            return Err(SettingsError::invalid(
                "tasks[].name",
                format!("duplicate task name '{}'", task.name),
            ));
        }
    }

    if settings.browser.max_delay_ms < settings.browser.base_delay_ms {
        return Err(SettingsError::invalid(
            "browser.maxDelayMs",
            "must be >= browser.baseDelayMs",
        ));
    }
    if settings.server.heartbeat_interval_secs == 0 {
        return Err(SettingsError::invalid(
            "server.heartbeatIntervalSecs",
            "must be greater than 0",
        ));
    }
    Ok(())
}

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

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::types::{RateLimitSettings, TaskSettings};

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn task(name: &str) -> TaskSettings {
        TaskSettings {
            name: name.into(),
            module: "browser".into(),
            action: "version".into(),
            cron: "*/5 * * * *".into(),
            enabled: true,
            description: String::new(),
        }
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 3001, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"tasks": [1, 2, 3]});
        let source = serde_json::json!({"tasks": [4]});
        assert_eq!(deep_merge(target, source)["tasks"], serde_json::json!([4]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1});
        let source = serde_json::json!({"a": null});
        assert_eq!(deep_merge(target, source)["a"], 1);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server, HelmSettings::default().server);
    }

    #[test]
    fn load_partial_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "browser": {"port": 9333},
                "rateLimits": {"post": {"max": 3, "windowMinutes": 1}},
                "tasks": [{"name": "check", "module": "browser", "action": "version", "cron": "0 * * * *"}]
            }"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.browser.port, 9333);
        assert_eq!(settings.browser.host, "127.0.0.1");
        assert_eq!(settings.rate_limits["post"].max, 3);
        assert_eq!(settings.tasks.len(), 1);
        assert!(settings.tasks[0].enabled);
    }

    #[test]
    fn load_invalid_json_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Parse { path: p, .. }) if p == path
        ));
    }

    #[test]
    fn load_wrong_type_is_a_shape_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": "eighty"}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Shape(_))
        ));
    }

    #[test]
    fn overrides_apply_valid_values() {
        let mut settings = HelmSettings::default();
        apply_overrides(
            &mut settings,
            lookup_from(&[
                ("HELM_HOST", "0.0.0.0"),
                ("HELM_PORT", "4000"),
                ("HELM_BROWSER_PORT", "9223"),
                ("HELM_DRY_RUN", "yes"),
                ("HELM_DB_PATH", ":memory:"),
            ]),
        );
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 4000);
        assert_eq!(settings.browser.port, 9223);
        assert!(settings.safety.dry_run);
        assert_eq!(settings.database.path, ":memory:");
    }

    #[test]
    fn overrides_ignore_invalid_values() {
        let mut settings = HelmSettings::default();
        apply_overrides(
            &mut settings,
            lookup_from(&[
                ("HELM_PORT", "not-a-port"),
                ("HELM_BROWSER_PORT", "0"),
                ("HELM_DRY_RUN", "maybe"),
            ]),
        );
        assert_eq!(settings.server.port, 3001);
        assert_eq!(settings.browser.port, 9222);
        assert!(!settings.safety.dry_run);
    }

    #[test]
    fn validate_rejects_zero_max() {
        let mut settings = HelmSettings::default();
        let _ = settings.rate_limits.insert(
            "post".into(),
            RateLimitSettings {
                max: 0,
                window_minutes: 1,
            },
        );
        assert!(validate(&settings).is_err());
    }

    #[test]
    fn validate_rejects_duplicate_task_names() {
        let mut settings = HelmSettings::default();
        settings.tasks = vec![task("a"), task("a")];
        let err = validate(&settings).unwrap_err();
        assert!(err.to_string().contains("duplicate task name"));
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let mut settings = HelmSettings::default();
        settings.browser.base_delay_ms = 10_000;
        settings.browser.max_delay_ms = 1_000;
        assert!(validate(&settings).is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(validate(&HelmSettings::default()).is_ok());
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_u16_range_bounds() {
        assert_eq!(parse_u16_range("80", 1, 65535), Some(80));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u16_range("70000", 1, 65535), None);
    }
}
