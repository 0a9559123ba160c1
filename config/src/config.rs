use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::settings::FaktorySettings;

pub const CONFIG_FILENAME: &str = "config.toml";
pub const CONF_D_DIRNAME: &str = "conf.d";

/// Loads `config.toml`, overlays every `conf.d/*.toml` in name order and
/// finally applies `FAKTORY_*` environment overrides.
///
/// A missing config directory or file is not an error: every key has a
/// default.
pub fn load_settings(config_dir: &Path) -> Result<FaktorySettings> {
    dotenvy::dotenv().ok();

    let mut merged = Value::Object(Map::new());
    let base = config_dir.join(CONFIG_FILENAME);
    if base.is_file() {
        merged = deep_merge(merged, read_toml(&base)?);
    }
    for path in overlay_files(config_dir)? {
        tracing::debug!(path = %path.display(), "applying config overlay");
        merged = deep_merge(merged, read_toml(&path)?);
    }
    merged = deep_merge(merged, env_overrides()?);

    serde_json::from_value(merged).map_err(|err| {
        anyhow::anyhow!(
            "invalid faktory config in {}: {err}",
            config_dir.display()
        )
    })
}

fn read_toml(path: &Path) -> Result<Value> {
    let payload = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let toml_value: toml::Value = toml::from_str(&payload)
        .with_context(|| format!("failed to parse TOML at {}", path.display()))?;
    let value = serde_json::to_value(toml_value).context("failed to convert TOML to JSON")?;
    if !value.is_object() {
        return Err(anyhow::anyhow!(
            "config at {} must be a TOML table",
            path.display()
        ));
    }
    Ok(value)
}

fn overlay_files(config_dir: &Path) -> Result<Vec<PathBuf>> {
    let dir = config_dir.join(CONF_D_DIRNAME);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(&dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn env_overrides() -> Result<Value> {
    let mut payload = Map::new();
    set_env_int(&mut payload, &["queues", "max_size"], "FAKTORY_QUEUE_MAX_SIZE")?;
    set_env_int(&mut payload, &["backups", "count"], "FAKTORY_BACKUP_COUNT")?;
    set_env_string(&mut payload, &["tls", "certificate"], "FAKTORY_TLS_CERTIFICATE");
    set_env_string(&mut payload, &["tls", "private_key"], "FAKTORY_TLS_PRIVATE_KEY");
    Ok(Value::Object(payload))
}

fn insert_path(map: &mut Map<String, Value>, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = map;
    for key in parents {
        let entry = cursor
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        cursor = next;
    }
    cursor.insert((*last).to_string(), value);
}

fn set_env_string(map: &mut Map<String, Value>, path: &[&str], env: &str) {
    if let Ok(value) = std::env::var(env)
        && !value.is_empty()
    {
        insert_path(map, path, Value::String(value));
    }
}

fn set_env_int(map: &mut Map<String, Value>, path: &[&str], env: &str) -> Result<()> {
    if let Ok(value) = std::env::var(env) {
        if value.is_empty() {
            return Ok(());
        }
        let parsed: u64 = value
            .parse()
            .with_context(|| format!("Invalid {env} value: {value}"))?;
        insert_path(map, path, Value::Number(parsed.into()));
    }
    Ok(())
}

fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay_value) => overlay_value,
    }
}

#[cfg(test)]
#[allow(unsafe_code)] // env var manipulation in tests
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    pub(crate) fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[test]
    fn missing_directory_yields_defaults() {
        let _lock = env_lock();
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("nope")).unwrap();
        assert_eq!(settings, FaktorySettings::default());
        assert_eq!(settings.queues.max_size, 100_000);
        assert_eq!(settings.backups.count, 24);
    }

    #[test]
    fn conf_d_overlays_merge_in_name_order() {
        let _lock = env_lock();
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILENAME),
            r#"
            [faktory]
            password = "base"
            [queues]
            max_size = 10
            "#,
        )
        .unwrap();
        let conf_d = dir.path().join(CONF_D_DIRNAME);
        fs::create_dir(&conf_d).unwrap();
        fs::write(conf_d.join("20-tls.toml"), "[tls]\ncertificate = \"second.pem\"\n").unwrap();
        fs::write(
            conf_d.join("10-tls.toml"),
            "[tls]\ncertificate = \"first.pem\"\nprivate_key = \"key.pem\"\n",
        )
        .unwrap();
        fs::write(conf_d.join("ignored.txt"), "not toml at all [").unwrap();

        let settings = load_settings(dir.path()).unwrap();
        assert_eq!(settings.faktory.password.as_deref(), Some("base"));
        assert_eq!(settings.queues.max_size, 10);
        assert_eq!(settings.tls.certificate.as_deref(), Some("second.pem"));
        assert_eq!(settings.tls.private_key.as_deref(), Some("key.pem"));
    }

    #[test]
    fn env_overrides_win_over_files() {
        let _lock = env_lock();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILENAME), "[backups]\ncount = 3\n").unwrap();
        unsafe {
            std::env::set_var("FAKTORY_BACKUP_COUNT", "7");
        }
        let settings = load_settings(dir.path());
        unsafe {
            std::env::remove_var("FAKTORY_BACKUP_COUNT");
        }
        assert_eq!(settings.unwrap().backups.count, 7);
    }

    #[test]
    fn invalid_env_override_is_reported() {
        let _lock = env_lock();
        let dir = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var("FAKTORY_QUEUE_MAX_SIZE", "lots");
        }
        let err = load_settings(dir.path()).unwrap_err();
        unsafe {
            std::env::remove_var("FAKTORY_QUEUE_MAX_SIZE");
        }
        assert!(err.to_string().contains("FAKTORY_QUEUE_MAX_SIZE"));
    }

    #[test]
    fn deep_merge_replaces_leaves_and_merges_tables() {
        let base = serde_json::json!({"a": {"b": 1, "c": 2}, "d": 3});
        let overlay = serde_json::json!({"a": {"c": 4}, "e": 5});
        assert_eq!(
            deep_merge(base, overlay),
            serde_json::json!({"a": {"b": 1, "c": 4}, "d": 3, "e": 5})
        );
    }
}
