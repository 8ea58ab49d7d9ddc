//! Domain types shared across ingestion, storage and the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Runtime status of a device row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Enabled,
    Disabled,
}

impl DeviceStatus {
    pub fn from_i64(value: i64) -> Self {
        if value == 0 {
            DeviceStatus::Disabled
        } else {
            DeviceStatus::Enabled
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            DeviceStatus::Enabled => 1,
            DeviceStatus::Disabled => 0,
        }
    }
}

/// How readings arrive for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngressType {
    Mqtt,
    Tcp,
}

impl IngressType {
    pub fn from_i64(value: i64) -> Self {
        if value == 1 {
            IngressType::Tcp
        } else {
            IngressType::Mqtt
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            IngressType::Mqtt => 0,
            IngressType::Tcp => 1,
        }
    }
}

/// A metering endpoint and its ingress configuration.
///
/// The MAC is the stable per-device key used by the worker table, the
/// subscriber registry and the reading rows; it is always stored as 12
/// uppercase hex characters.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: Uuid,
    pub name: String,
    pub location: String,
    pub mac: String,
    pub broker: String,
    pub port: u16,
    pub pub_topic: String,
    pub sub_topic: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub status: DeviceStatus,
    pub collect_enabled: bool,
    pub description: Option<String>,
    pub ingress_type: IngressType,
    pub user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// True when the subscription manager should run a worker for this device.
    pub fn should_collect(&self) -> bool {
        self.status == DeviceStatus::Enabled && self.collect_enabled
    }

    /// Flattens the ingress columns into the map shape the admin API exchanges.
    pub fn ingress_config(&self) -> Map<String, Value> {
        let mut config = Map::new();
        config.insert("name".into(), Value::String(self.name.clone()));
        config.insert("location".into(), Value::String(self.location.clone()));
        config.insert("broker".into(), Value::String(self.broker.clone()));
        config.insert("port".into(), Value::from(self.port));
        config.insert("pub_topic".into(), Value::String(self.pub_topic.clone()));
        config.insert("sub_topic".into(), Value::String(self.sub_topic.clone()));
        config.insert("client_id".into(), Value::String(self.client_id.clone()));
        config.insert("username".into(), Value::String(self.username.clone()));
        config
    }
}

/// Normalizes a MAC to the canonical 12-char uppercase hex form.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let mac: String = raw
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect::<String>()
        .to_ascii_uppercase();
    if mac.len() == 12 && mac.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(mac)
    } else {
        None
    }
}

/// A rejected payload kept for operator inspection.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: i64,
    pub device_id: Option<Uuid>,
    pub mac: Option<String>,
    pub raw_payload: Value,
    pub failure_reason: String,
    pub occured_at: DateTime<Utc>,
    pub retryable: bool,
    pub meta: Option<Value>,
}

/// A dashboard account.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub pw_fail_count: u32,
}

/// In-transit record between ingress adapters and the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub mac: String,
    pub payload: Map<String, Value>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn normalize_mac_accepts_separators_and_lowercase() {
        assert_eq!(
            normalize_mac("aa:00:00:00:00:01").as_deref(),
            Some("AA0000000001")
        );
        assert_eq!(
            normalize_mac("aa-00-00-00-00-01").as_deref(),
            Some("AA0000000001")
        );
        assert_eq!(normalize_mac("AA0000000001").as_deref(), Some("AA0000000001"));
    }

    #[test]
    fn normalize_mac_rejects_bad_input() {
        assert_eq!(normalize_mac("AA00"), None);
        assert_eq!(normalize_mac("ZZ0000000001"), None);
        assert_eq!(normalize_mac("AA00000000012"), None);
    }

    #[test]
    fn should_collect_requires_both_flags() {
        let mut device = test_device();
        assert!(device.should_collect());
        device.collect_enabled = false;
        assert!(!device.should_collect());
        device.collect_enabled = true;
        device.status = DeviceStatus::Disabled;
        assert!(!device.should_collect());
    }

    pub(crate) fn test_device() -> Device {
        Device {
            id: Uuid::new_v4(),
            name: "Main Meter".into(),
            location: "Hangzhou".into(),
            mac: "AA0000000001".into(),
            broker: "broker.local".into(),
            port: 1883,
            pub_topic: "device/AA0000000001/pub".into(),
            sub_topic: "device/AA0000000001/sub".into(),
            client_id: "client-AA0000000001".into(),
            username: "device-user".into(),
            password: "secret".into(),
            status: DeviceStatus::Enabled,
            collect_enabled: true,
            description: None,
            ingress_type: IngressType::Mqtt,
            user_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
