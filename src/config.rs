use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::settings::QueueSettings;

pub const DEFAULT_CONFIG_FILENAME: &str = "taurus.toml";
pub const ENV_CONFIG_KEY: &str = "TAURUS_CONFIG";

pub fn resolve_config_source(config_path: Option<&str>) -> (Option<String>, String) {
    if let Some(path) = config_path {
        return (Some(path.to_string()), "--config parameter".to_string());
    }

    if let Ok(env_path) = std::env::var(ENV_CONFIG_KEY) {
        if !env_path.is_empty() {
            return (Some(env_path), format!("{ENV_CONFIG_KEY} env var"));
        }
    }

    let default_path = Path::new(DEFAULT_CONFIG_FILENAME);
    if default_path.is_file() {
        return (
            Some(default_path.to_string_lossy().to_string()),
            format!("{DEFAULT_CONFIG_FILENAME} in cwd"),
        );
    }

    (None, "not found".to_string())
}

pub fn load_toml_settings(config_path: Option<&str>) -> Result<QueueSettings> {
    dotenvy::dotenv().ok();

    let (path, _) = resolve_config_source(config_path);
    let json_value = match path {
        Some(path) => {
            let payload = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {path}"))?;
            parse_toml_payload(&payload).with_context(|| format!("invalid config at {path}"))?
        }
        None => Value::Object(Map::new()),
    };

    let merged = deep_merge(json_value, env_overrides());
    let settings: QueueSettings =
        serde_json::from_value(merged).context("invalid queue config")?;
    settings.validate()?;
    Ok(settings)
}

fn parse_toml_payload(payload: &str) -> Result<Value> {
    let toml_value: toml::Value = toml::from_str(payload).context("failed to parse TOML")?;
    let mut json_value =
        serde_json::to_value(toml_value).context("failed to convert TOML to JSON")?;

    if let Value::Object(mut map) = json_value {
        if let Some(scoped) = map.remove("taurus") {
            json_value = scoped;
        } else {
            json_value = Value::Object(map);
        }
    }

    match json_value {
        Value::Object(_) => Ok(json_value),
        _ => Err(anyhow::anyhow!("queue config must be a TOML table")),
    }
}

fn env_overrides() -> Value {
    let mut payload = Map::new();

    set_env_string(&mut payload, "redis_dsn", "TAURUS_REDIS_DSN");
    set_env_string(&mut payload, "key_prefix", "TAURUS_KEY_PREFIX");
    set_env_string(&mut payload, "host", "TAURUS_REDIS_HOST");
    set_env_number(&mut payload, "port", "TAURUS_REDIS_PORT");
    set_env_number(&mut payload, "db", "TAURUS_REDIS_DB");
    set_env_string(&mut payload, "password", "TAURUS_REDIS_PASSWORD");

    Value::Object(payload)
}

fn set_env_string(payload: &mut Map<String, Value>, field: &str, env_key: &str) {
    if let Ok(value) = std::env::var(env_key) {
        if !value.is_empty() {
            payload.insert(field.to_string(), Value::String(value));
        }
    }
}

fn set_env_number(payload: &mut Map<String, Value>, field: &str, env_key: &str) {
    if let Ok(value) = std::env::var(env_key) {
        if let Ok(parsed) = value.parse::<i64>() {
            payload.insert(field.to_string(), Value::Number(parsed.into()));
        }
    }
}

fn deep_merge(base: Value, overrides: Value) -> Value {
    match (base, overrides) {
        (Value::Object(mut base_map), Value::Object(override_map)) => {
            for (key, value) in override_map {
                let merged = match base_map.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overrides) => overrides,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_toml_payload_unwraps_scoped_table() {
        let value = parse_toml_payload(
            "[taurus]\nredis_dsn = \"redis://example:6379/4\"\nkey_prefix = \"jobs\"\n",
        )
        .unwrap();
        assert_eq!(
            value.get("redis_dsn").and_then(Value::as_str),
            Some("redis://example:6379/4")
        );
        assert_eq!(value.get("key_prefix").and_then(Value::as_str), Some("jobs"));
    }

    #[test]
    fn parse_toml_payload_accepts_bare_table() {
        let value = parse_toml_payload("key_prefix = \"bare\"\n").unwrap();
        assert_eq!(value.get("key_prefix").and_then(Value::as_str), Some("bare"));
    }

    #[test]
    fn parse_toml_payload_rejects_garbage() {
        assert!(parse_toml_payload("not toml at all [").is_err());
    }

    #[test]
    fn deep_merge_prefers_overrides() {
        let base = serde_json::json!({"a": 1, "nested": {"x": 1, "y": 2}});
        let overrides = serde_json::json!({"nested": {"y": 3}, "b": 4});
        let merged = deep_merge(base, overrides);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 4);
        assert_eq!(merged["nested"]["x"], 1);
        assert_eq!(merged["nested"]["y"], 3);
    }

    #[test]
    fn settings_deserialize_from_partial_table() {
        let value = parse_toml_payload("[taurus]\nlock_duration_ms = 10000\n").unwrap();
        let settings: QueueSettings = serde_json::from_value(value).unwrap();
        assert_eq!(settings.lock_duration_ms, 10_000);
        assert_eq!(settings.key_prefix, "bull");
    }
}
