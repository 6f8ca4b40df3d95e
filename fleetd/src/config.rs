//! Static (`config.yaml`) and dynamic (database-backed) configuration
//! (spec §4.K, §6 process startup contract).
//!
//! `FleetConfig` is the baseline loaded once from `config.yaml` at startup.
//! `ConfigStore` layers the runtime-reloadable subset (auth, invite code,
//! quota limits, a handful of `system.*` fields, jwt/cors/captcha/upload) on
//! top, re-synced from the `config_settings` table on a timer or on demand.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::Storage;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    pub env: String,
    pub addr: String,
    pub db_type: String,
    pub limits: i64,
    pub frontend_url: String,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            env: "production".into(),
            addr: "0.0.0.0:8080".into(),
            db_type: "postgres".into(),
            limits: 0,
            frontend_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    pub level_limits: HashMap<String, i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtSettings {
    pub secret: String,
    pub expire_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptchaSettings {
    pub enabled: bool,
    pub site_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub max_size_mb: u64,
    pub allowed_extensions: Vec<String>,
}

/// The full runtime configuration surface (spec §4.K). `config.yaml`
/// supplies `system`/`db_url`; everything else has a static default and is
/// overwritten by the first `ConfigStore::reload`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub system: SystemSettings,
    pub db_url: String,
    pub auth_enabled: bool,
    pub invite_code: String,
    pub quota: QuotaSettings,
    pub jwt: JwtSettings,
    pub cors: CorsSettings,
    pub captcha: CaptchaSettings,
    pub upload: UploadSettings,
    pub other: serde_json::Value,
}

impl FleetConfig {
    pub fn load_from_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }
}

type ChangeCallback = Box<dyn Fn(&FleetConfig) + Send + Sync>;

/// Owns the live, reloadable config and the callbacks notified on every
/// successful reload. Callbacks must be registered before the first
/// `reload()` call (spec §4.K ordering guarantee: "a change callback is
/// registered before the initial load").
pub struct ConfigStore {
    storage: Arc<dyn Storage>,
    inner: RwLock<FleetConfig>,
    callbacks: RwLock<Vec<ChangeCallback>>,
}

impl ConfigStore {
    pub fn new(storage: Arc<dyn Storage>, baseline: FleetConfig) -> Self {
        Self {
            storage,
            inner: RwLock::new(baseline),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn on_change(&self, callback: impl Fn(&FleetConfig) + Send + Sync + 'static) {
        self.callbacks.write().push(Box::new(callback));
    }

    pub fn current(&self) -> FleetConfig {
        self.inner.read().clone()
    }

    /// Pulls the `scope -> {key: value}` map from storage and applies it
    /// defensively: each known leaf is type-checked against its expected
    /// runtime type (numeric leaves accept both integer and float JSON
    /// values); unknown keys or a type mismatch log a warning and leave the
    /// previous value in place rather than failing the whole reload.
    pub async fn reload(&self) -> Result<(), crate::error::StorageError> {
        let raw = self.storage.get_config_settings().await?;
        let mut config = self.inner.read().clone();
        apply_settings(&mut config, &raw);
        *self.inner.write() = config.clone();
        for callback in self.callbacks.read().iter() {
            callback(&config);
        }
        Ok(())
    }
}

fn apply_settings(config: &mut FleetConfig, raw: &serde_json::Value) {
    let Some(scopes) = raw.as_object() else {
        warn!("config_settings payload was not a JSON object, ignoring reload");
        return;
    };
    for (scope, keys) in scopes {
        let Some(keys) = keys.as_object() else {
            warn!(scope, "config scope was not a JSON object, skipping");
            continue;
        };
        for (key, value) in keys {
            apply_leaf(config, scope, key, value);
        }
    }
}

fn apply_leaf(config: &mut FleetConfig, scope: &str, key: &str, value: &serde_json::Value) {
    match (scope, key) {
        ("auth", "enabled") => set_bool(&mut config.auth_enabled, value, scope, key),
        ("auth", "invite_code") => set_string(&mut config.invite_code, value, scope, key),
        ("system", "env") => set_string(&mut config.system.env, value, scope, key),
        ("system", "addr") => set_string(&mut config.system.addr, value, scope, key),
        ("system", "db_type") => set_string(&mut config.system.db_type, value, scope, key),
        ("system", "limits") => set_number(&mut config.system.limits, value, scope, key),
        ("system", "frontend_url") => set_string(&mut config.system.frontend_url, value, scope, key),
        ("jwt", "secret") => set_string(&mut config.jwt.secret, value, scope, key),
        ("jwt", "expire_seconds") => set_unumber(&mut config.jwt.expire_seconds, value, scope, key),
        ("captcha", "enabled") => set_bool(&mut config.captcha.enabled, value, scope, key),
        ("captcha", "site_key") => set_string(&mut config.captcha.site_key, value, scope, key),
        ("captcha", "secret_key") => set_string(&mut config.captcha.secret_key, value, scope, key),
        ("upload", "max_size_mb") => set_unumber(&mut config.upload.max_size_mb, value, scope, key),
        ("quota", "level_limits") => {
            if let Some(map) = value.as_object() {
                config.quota.level_limits = map
                    .iter()
                    .filter_map(|(k, v)| v.as_i64().map(|n| (k.clone(), n)))
                    .collect();
            } else {
                warn!(scope, key, "expected an object for quota.level_limits, leaving unchanged");
            }
        }
        ("other", _) => {
            if let serde_json::Value::Object(map) = &mut config.other {
                map.insert(key.to_string(), value.clone());
            } else {
                config.other = serde_json::json!({ key: value });
            }
        }
        _ => warn!(scope, key, "unknown config key, ignoring"),
    }
}

fn set_string(target: &mut String, value: &serde_json::Value, scope: &str, key: &str) {
    match value.as_str() {
        Some(s) => *target = s.to_string(),
        None => warn!(scope, key, "expected a string, leaving unchanged"),
    }
}

fn set_bool(target: &mut bool, value: &serde_json::Value, scope: &str, key: &str) {
    match value.as_bool() {
        Some(b) => *target = b,
        None => warn!(scope, key, "expected a bool, leaving unchanged"),
    }
}

fn set_number(target: &mut i64, value: &serde_json::Value, scope: &str, key: &str) {
    if let Some(n) = value.as_i64() {
        *target = n;
    } else if let Some(f) = value.as_f64() {
        *target = f as i64;
    } else {
        warn!(scope, key, "expected a number, leaving unchanged");
    }
}

fn set_unumber(target: &mut u64, value: &serde_json::Value, scope: &str, key: &str) {
    if let Some(n) = value.as_u64() {
        *target = n;
    } else if let Some(f) = value.as_f64().filter(|f| *f >= 0.0) {
        *target = f as u64;
    } else {
        warn!(scope, key, "expected a non-negative number, leaving unchanged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml_with_defaults_for_the_rest() {
        let config = FleetConfig::load_from_str("db_url: postgres://localhost/fleet\n").unwrap();
        assert_eq!(config.db_url, "postgres://localhost/fleet");
        assert_eq!(config.system.addr, "0.0.0.0:8080");
    }

    #[test]
    fn numeric_leaf_accepts_both_integer_and_float_json() {
        let mut config = FleetConfig::default();
        apply_leaf(&mut config, "system", "limits", &serde_json::json!(5));
        assert_eq!(config.system.limits, 5);
        apply_leaf(&mut config, "system", "limits", &serde_json::json!(7.0));
        assert_eq!(config.system.limits, 7);
    }

    #[test]
    fn type_mismatch_is_ignored_and_previous_value_kept() {
        let mut config = FleetConfig::default();
        config.system.env = "staging".into();
        apply_leaf(&mut config, "system", "env", &serde_json::json!(42));
        assert_eq!(config.system.env, "staging");
    }

    #[test]
    fn unknown_key_is_ignored() {
        let mut config = FleetConfig::default();
        let before = config.clone();
        apply_leaf(&mut config, "nonsense", "whatever", &serde_json::json!("x"));
        assert_eq!(config.system.env, before.system.env);
    }
}
