use serde::{Deserialize, Serialize};

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Network and system configuration, persisted as `config.json`.
///
/// Field names on the wire are kept compatible with the flat JSON files the
/// original firmware generation wrote, so a device upgraded in place keeps
/// its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub ssid: String,
    #[serde(rename = "pass")]
    pub password: String,
    pub ip: [u8; 4],
    pub netmask: [u8; 4],
    pub gateway: [u8; 4],
    pub dns: [u8; 4],
    pub dhcp: bool,
    #[serde(rename = "ntp")]
    pub ntp_server: String,
    /// NTP resync period in minutes. Zero disables NTP.
    #[serde(rename = "NTPperiod")]
    pub ntp_period_minutes: i64,
    /// Timezone offset in tenths of hours (e.g. 10 = UTC+1).
    #[serde(rename = "timeZone")]
    pub timezone: i64,
    pub daylight: bool,
    #[serde(rename = "deviceName")]
    pub device_name: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ssid: "WIFI_SSID".to_string(),
            password: "WIFI_PASSWD".to_string(),
            ip: [192, 168, 1, 4],
            netmask: [255, 255, 255, 0],
            gateway: [192, 168, 1, 1],
            dns: [192, 168, 1, 1],
            dhcp: true,
            ntp_server: "pool.ntp.org".to_string(),
            ntp_period_minutes: 15,
            timezone: 10,
            daylight: true,
            device_name: "webnode".to_string(),
        }
    }
}

impl NetworkConfig {
    /// Timezone offset in whole hours, as used when arming the NTP client.
    pub fn timezone_hours(&self) -> i64 {
        self.timezone / 10
    }

    pub fn ntp_enabled(&self) -> bool {
        self.ntp_period_minutes > 0
    }
}

/// Provisioning access point settings. The chip id is appended to the SSID
/// prefix so several unconfigured devices can coexist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApConfig {
    pub ssid_prefix: String,
    pub password: String,
    pub enabled: bool,
}

impl Default for ApConfig {
    fn default() -> Self {
        Self {
            ssid_prefix: "ESP".to_string(),
            password: "12345678".to_string(),
            enabled: false,
        }
    }
}

impl ApConfig {
    pub fn ssid(&self, chip_id: u32) -> String {
        format!("{}{}", self.ssid_prefix, chip_id)
    }
}

/// HTTP Basic auth secrets, persisted as `secret.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpAuthConfig {
    pub auth: bool,
    pub user: String,
    pub pass: String,
}

/// MQTT settings assembled from the user key/value store.
///
/// These deliberately live in `userconfig.json` rather than `config.json`:
/// user pages edit them through the generic `/pconfig` passthrough and the
/// firmware re-reads them on every config change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub client_id: String,
    /// Root topic prepended to all non-raw publishes and subscribes.
    pub topic: String,
    /// Optional topic whose payloads are routed to the command dispatcher.
    pub command_topic: String,
    /// Telemetry publish interval in seconds. Zero leaves MQTT unconfigured.
    pub interval_secs: i64,
}

impl MqttSettings {
    /// Minimum viable configuration check, gating MQTT startup.
    pub fn is_complete(&self) -> bool {
        !self.host.is_empty() && self.port != 0 && self.interval_secs != 0 && !self.topic.is_empty()
    }

    pub fn will_topic(&self) -> String {
        crate::topics::will_topic(&self.topic)
    }

    /// Default client id derived from the chip id.
    pub fn default_client_id(chip_id: u32) -> String {
        format!("ESP_{chip_id:x}")
    }

    /// True when the stored client id must be replaced by the default one:
    /// either it is empty, or it carries the default prefix but belongs to a
    /// different chip (config file copied from another device).
    pub fn client_id_is_stale(&self, chip_id: u32) -> bool {
        self.client_id.is_empty()
            || (self.client_id.starts_with("ESP_")
                && self.client_id != Self::default_client_id(chip_id))
    }
}

pub fn format_ip(octets: &[u8; 4]) -> String {
    format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn network_config_round_trips_with_legacy_keys() {
        let config = NetworkConfig::default();
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["ssid"], "WIFI_SSID");
        assert_eq!(json["pass"], "WIFI_PASSWD");
        assert_eq!(json["NTPperiod"], 15);
        assert_eq!(json["timeZone"], 10);
        assert_eq!(json["deviceName"], "webnode");

        let back: NetworkConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn timezone_is_tenths_of_hours() {
        let mut config = NetworkConfig::default();
        config.timezone = -25;
        assert_eq!(config.timezone_hours(), -2);
    }

    #[test]
    fn mqtt_settings_completeness() {
        let mut settings = MqttSettings {
            host: "broker.local".into(),
            port: 1883,
            topic: "webnode".into(),
            interval_secs: 60,
            ..Default::default()
        };
        assert!(settings.is_complete());

        settings.topic.clear();
        assert!(!settings.is_complete());
    }

    #[test]
    fn stale_client_ids_are_detected() {
        let mut settings = MqttSettings::default();
        assert!(settings.client_id_is_stale(0xabcd));

        settings.client_id = "ESP_1234".into();
        assert!(settings.client_id_is_stale(0xabcd));

        settings.client_id = MqttSettings::default_client_id(0xabcd);
        assert!(!settings.client_id_is_stale(0xabcd));

        // User-chosen ids are never overwritten.
        settings.client_id = "kitchen-node".into();
        assert!(!settings.client_id_is_stale(0xabcd));
    }

    #[test]
    fn ap_ssid_appends_chip_id() {
        let ap = ApConfig::default();
        assert_eq!(ap.ssid(1048576), "ESP1048576");
    }
}
