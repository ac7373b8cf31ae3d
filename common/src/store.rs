//! Flat JSON persistence for the three on-device config files.
//!
//! Files are small and read or rewritten wholesale on every access, which
//! keeps the store trivially crash safe on the flash filesystem. The async
//! runtimes wrap these calls in blocking tasks.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{HttpAuthConfig, MqttSettings, NetworkConfig};

pub const CONFIG_FILE: &str = "config.json";
pub const USER_CONFIG_FILE: &str = "userconfig.json";
pub const SECRET_FILE: &str = "secret.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config file missing")]
    Missing,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Key/value file store rooted at the device data directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn read(&self, name: &str) -> Result<String, StoreError> {
        let path = self.path(name);
        if !path.exists() {
            return Err(StoreError::Missing);
        }
        Ok(fs::read_to_string(path)?)
    }

    fn write(&self, name: &str, contents: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.path(name), contents)?;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        let path = self.path(name);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    // ---- config.json ----

    pub fn load_network(&self) -> Result<NetworkConfig, StoreError> {
        let raw = self.read(CONFIG_FILE)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save_network(&self, config: &NetworkConfig) -> Result<(), StoreError> {
        self.write(CONFIG_FILE, &serde_json::to_string_pretty(config)?)
    }

    pub fn network_config_exists(&self) -> bool {
        self.path(CONFIG_FILE).exists()
    }

    // ---- secret.json ----

    /// A missing or unreadable secrets file means auth is disabled.
    pub fn load_auth(&self) -> HttpAuthConfig {
        self.read(SECRET_FILE)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save_auth(&self, auth: &HttpAuthConfig) -> Result<(), StoreError> {
        self.write(SECRET_FILE, &serde_json::to_string_pretty(auth)?)
    }

    // ---- userconfig.json ----

    fn load_user_object(&self) -> Result<Map<String, Value>, StoreError> {
        match self.read(USER_CONFIG_FILE) {
            Ok(raw) => match serde_json::from_str::<Value>(&raw)? {
                Value::Object(map) => Ok(map),
                _ => Ok(Map::new()),
            },
            Err(StoreError::Missing) => {
                // First access creates an empty store.
                self.write(USER_CONFIG_FILE, "{}")?;
                Ok(Map::new())
            }
            Err(err) => Err(err),
        }
    }

    /// All values are persisted as strings, whatever their logical type.
    pub fn save_user_value(&self, name: &str, value: &str) -> Result<(), StoreError> {
        let mut map = self.load_user_object()?;
        map.insert(name.to_string(), Value::String(value.to_string()));
        self.write(USER_CONFIG_FILE, &serde_json::to_string(&Value::Object(map))?)
    }

    pub fn load_user_string(&self, name: &str) -> Option<String> {
        let map = self.load_user_object().ok()?;
        match map.get(name)? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn load_user_i64(&self, name: &str) -> Option<i64> {
        self.load_user_string(name)?.trim().parse().ok()
    }

    pub fn load_user_f64(&self, name: &str) -> Option<f64> {
        self.load_user_string(name)?.trim().parse().ok()
    }

    /// Sorted snapshot of the whole user store, for the `user` debug command.
    pub fn user_snapshot(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let map = self.load_user_object()?;
        Ok(map
            .into_iter()
            .map(|(name, value)| match value {
                Value::String(s) => (name, s),
                other => (name, other.to_string()),
            })
            .collect())
    }

    // ---- resets ----

    /// Forget network and auth config, forcing provisioning on next boot.
    pub fn clear_system_config(&self) -> Result<(), StoreError> {
        self.remove(CONFIG_FILE)?;
        self.remove(SECRET_FILE)
    }

    pub fn clear_user_config(&self) -> Result<(), StoreError> {
        self.remove(USER_CONFIG_FILE)
    }

    // ---- MQTT settings view ----

    /// Assemble the MQTT settings from their user-store keys, replacing an
    /// empty or foreign default client id with this chip's and persisting the
    /// replacement.
    pub fn mqtt_settings(&self, chip_id: u32) -> Result<MqttSettings, StoreError> {
        let mut settings = MqttSettings {
            host: self.load_user_string("MQTTHost").unwrap_or_default(),
            port: self
                .load_user_i64("MQTTPort")
                .and_then(|port| u16::try_from(port).ok())
                .unwrap_or(0),
            user: self.load_user_string("MQTTUser").unwrap_or_default(),
            pass: self.load_user_string("MQTTPass").unwrap_or_default(),
            client_id: self.load_user_string("MQTTClientID").unwrap_or_default(),
            topic: self.load_user_string("MQTTTopic").unwrap_or_default(),
            command_topic: self.load_user_string("MQTTCommandTopic").unwrap_or_default(),
            interval_secs: self.load_user_i64("MQTTInterval").unwrap_or(0),
        };

        if settings.client_id_is_stale(chip_id) {
            settings.client_id = MqttSettings::default_client_id(chip_id);
            self.save_user_value("MQTTClientID", &settings.client_id)?;
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn temp_store(tag: &str) -> ConfigStore {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "webnode-store-{tag}-{}-{seq}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        ConfigStore::new(dir)
    }

    #[test]
    fn missing_network_config_is_reported() {
        let store = temp_store("missing");
        assert!(matches!(store.load_network(), Err(StoreError::Missing)));
        assert!(!store.network_config_exists());
    }

    #[test]
    fn network_config_round_trips() {
        let store = temp_store("network");
        let mut config = NetworkConfig::default();
        config.ssid = "garage".into();
        config.dhcp = false;

        store.save_network(&config).unwrap();
        assert_eq!(store.load_network().unwrap(), config);
    }

    #[test]
    fn user_values_are_stored_as_strings() {
        let store = temp_store("user");
        store.save_user_value("MQTTPort", "1883").unwrap();
        store.save_user_value("threshold", "2.5").unwrap();

        let raw = fs::read_to_string(store.path(USER_CONFIG_FILE)).unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["MQTTPort"], "1883");

        assert_eq!(store.load_user_i64("MQTTPort"), Some(1883));
        assert_eq!(store.load_user_f64("threshold"), Some(2.5));
        assert_eq!(store.load_user_string("absent"), None);
    }

    #[test]
    fn first_user_write_creates_the_file() {
        let store = temp_store("create");
        assert!(!store.path(USER_CONFIG_FILE).exists());
        store.save_user_value("name", "value").unwrap();
        assert!(store.path(USER_CONFIG_FILE).exists());
        assert_eq!(store.load_user_string("name").as_deref(), Some("value"));
    }

    #[test]
    fn missing_secret_file_disables_auth() {
        let store = temp_store("auth");
        let auth = store.load_auth();
        assert!(!auth.auth);

        store
            .save_auth(&HttpAuthConfig {
                auth: true,
                user: "admin".into(),
                pass: "pw".into(),
            })
            .unwrap();
        assert!(store.load_auth().auth);
    }

    #[test]
    fn clearing_system_config_removes_both_files() {
        let store = temp_store("clear");
        store.save_network(&NetworkConfig::default()).unwrap();
        store.save_auth(&HttpAuthConfig::default()).unwrap();
        store.save_user_value("keep", "me").unwrap();

        store.clear_system_config().unwrap();
        assert!(!store.network_config_exists());
        assert!(!store.path(SECRET_FILE).exists());
        assert_eq!(store.load_user_string("keep").as_deref(), Some("me"));
    }

    #[test]
    fn mqtt_settings_come_from_user_keys() {
        let store = temp_store("mqtt");
        store.save_user_value("MQTTHost", "broker.local").unwrap();
        store.save_user_value("MQTTPort", "1883").unwrap();
        store.save_user_value("MQTTTopic", "node").unwrap();
        store.save_user_value("MQTTInterval", "60").unwrap();

        let settings = store.mqtt_settings(0xcafe).unwrap();
        assert!(settings.is_complete());
        assert_eq!(settings.client_id, "ESP_cafe");
        // The generated id is persisted back into the user store.
        assert_eq!(
            store.load_user_string("MQTTClientID").as_deref(),
            Some("ESP_cafe")
        );
    }

    #[test]
    fn foreign_default_client_id_is_replaced() {
        let store = temp_store("stale");
        store.save_user_value("MQTTClientID", "ESP_dead").unwrap();
        let settings = store.mqtt_settings(0xbeef).unwrap();
        assert_eq!(settings.client_id, "ESP_beef");

        store.save_user_value("MQTTClientID", "my-node").unwrap();
        let settings = store.mqtt_settings(0xbeef).unwrap();
        assert_eq!(settings.client_id, "my-node");
    }
}
