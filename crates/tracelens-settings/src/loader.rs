use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{tracelens_dir, TracelensSettings};

/// Default settings file location.
pub fn settings_path() -> PathBuf {
    tracelens_dir().join("settings.json")
}

/// Load from the default path with env overrides. A missing file is not an
/// error; a malformed one is.
pub fn load_settings() -> Result<TracelensSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` (deep-merged over defaults), then apply env overrides.
pub fn load_settings_from_path(path: &Path) -> Result<TracelensSettings> {
    let defaults = serde_json::to_value(TracelensSettings::default()).map_err(|source| {
        SettingsError::Parse {
            path: path.to_owned(),
            source,
        }
    })?;

    let merged = match std::fs::read_to_string(path) {
        Ok(raw) => {
            let user: Value =
                serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
                    path: path.to_owned(),
                    source,
                })?;
            debug!(?path, "settings file loaded");
            deep_merge(defaults, user)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(?path, "no settings file, using defaults");
            defaults
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_owned(),
                source,
            })
        }
    };

    let settings: TracelensSettings =
        serde_json::from_value(merged).map_err(|source| SettingsError::Parse {
            path: path.to_owned(),
            source,
        })?;

    apply_env_overrides(settings)
}

/// Apply `DATABASE_PATH` and `TRACELENS_*` variables from the process env.
pub fn apply_env_overrides(settings: TracelensSettings) -> Result<TracelensSettings> {
    apply_env_with(settings, |var| std::env::var(var).ok())
}

pub(crate) fn apply_env_with(
    mut settings: TracelensSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<TracelensSettings> {
    if let Some(path) = lookup("DATABASE_PATH") {
        settings.database.path = PathBuf::from(path);
    }
    if let Some(v) = lookup("TRACELENS_MAX_STATE_SIZE") {
        settings.limits.max_state_bytes = parse_env("TRACELENS_MAX_STATE_SIZE", &v)?;
    }
    if let Some(v) = lookup("TRACELENS_WARN_STATE_SIZE") {
        settings.limits.warn_state_bytes = parse_env("TRACELENS_WARN_STATE_SIZE", &v)?;
    }
    if let Some(v) = lookup("TRACELENS_STORE_TIMEOUT_MS") {
        settings.database.operation_timeout_ms = parse_env("TRACELENS_STORE_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = lookup("TRACELENS_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = lookup("TRACELENS_LOG_JSON") {
        settings.logging.json = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
    }
    Ok(settings)
}

fn parse_env<T: FromStr>(var: &'static str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| SettingsError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; any
/// other overlay value replaces the base value.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn deep_merge_nested() {
        let merged = deep_merge(
            json!({"a": {"x": 1, "y": 2}, "b": 1}),
            json!({"a": {"y": 3}, "c": 4}),
        );
        assert_eq!(merged, json!({"a": {"x": 1, "y": 3}, "b": 1, "c": 4}));
    }

    #[test]
    fn deep_merge_scalar_replaces_object() {
        assert_eq!(deep_merge(json!({"a": {"x": 1}}), json!({"a": 5})), json!({"a": 5}));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(s.limits, TracelensSettings::default().limits);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"database": {"poolSize": 2}, "logging": {"json": true}}"#)
            .unwrap();
        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.database.pool_size, 2);
        assert!(s.logging.json);
        assert_eq!(s.database.busy_timeout_ms, 5_000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Parse { .. })
        ));
    }

    #[test]
    fn env_overrides_win() {
        let s = apply_env_with(
            TracelensSettings::default(),
            env(&[
                ("DATABASE_PATH", "/data/t.db"),
                ("TRACELENS_MAX_STATE_SIZE", "2048"),
                ("TRACELENS_STORE_TIMEOUT_MS", "250"),
                ("TRACELENS_LOG_JSON", "yes"),
            ]),
        )
        .unwrap();
        assert_eq!(s.database.path, PathBuf::from("/data/t.db"));
        assert_eq!(s.limits.max_state_bytes, 2048);
        assert_eq!(s.database.operation_timeout_ms, 250);
        assert!(s.logging.json);
    }

    #[test]
    fn bad_env_number_is_rejected() {
        let err = apply_env_with(
            TracelensSettings::default(),
            env(&[("TRACELENS_MAX_STATE_SIZE", "ten megs")]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SettingsError::InvalidEnv { var: "TRACELENS_MAX_STATE_SIZE", .. }
        ));
    }
}
