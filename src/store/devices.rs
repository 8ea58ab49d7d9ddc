//! Device table access used by the admin API and the subscription manager.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::{format_ts, parse_ts, Store};
use crate::model::{Device, DeviceStatus, IngressType};

/// Fields accepted when creating a device. Ingress settings arrive as the
/// same flat config map the admin API exchanges.
#[derive(Debug, Clone)]
pub struct DeviceDraft {
    pub mac: String,
    pub status: DeviceStatus,
    pub collect_enabled: bool,
    pub ingress_type: IngressType,
    pub ingress_config: Map<String, Value>,
    pub description: Option<String>,
    pub user_id: Option<Uuid>,
}

/// Partial update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct DevicePatch {
    pub status: Option<DeviceStatus>,
    pub collect_enabled: Option<bool>,
    pub ingress_type: Option<IngressType>,
    pub ingress_config: Option<Map<String, Value>>,
    pub description: Option<String>,
}

fn config_str(config: &Map<String, Value>, key: &str) -> Option<String> {
    config.get(key).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn config_port(config: &Map<String, Value>) -> Option<u16> {
    match config.get("port") {
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn device_from_row(row: &SqliteRow) -> Result<Device> {
    let id: String = row.get("id");
    let user_id: Option<String> = row.get("user_id");
    Ok(Device {
        id: Uuid::parse_str(&id).context("bad device id column")?,
        name: row.get("name"),
        location: row.get("location"),
        mac: row.get("mac"),
        broker: row.get("broker"),
        port: row.get::<i64, _>("port") as u16,
        pub_topic: row.get("pub_topic"),
        sub_topic: row.get("sub_topic"),
        client_id: row.get("client_id"),
        username: row.get("username"),
        password: row.get("password"),
        status: DeviceStatus::from_i64(row.get("status")),
        collect_enabled: row.get::<i64, _>("collect_enabled") != 0,
        description: row.get("description"),
        ingress_type: IngressType::from_i64(row.get("ingress_type")),
        user_id: user_id
            .map(|id| Uuid::parse_str(&id))
            .transpose()
            .context("bad user_id column")?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

impl Store {
    pub async fn create_device(&self, draft: &DeviceDraft) -> Result<Device> {
        let config = &draft.ingress_config;
        let id = Uuid::new_v4();
        let now = format_ts(Utc::now());
        sqlx::query(
            "INSERT INTO device \
             (id, name, location, mac, broker, port, pub_topic, sub_topic, client_id, \
              username, password, status, collect_enabled, description, ingress_type, \
              user_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(config_str(config, "name").unwrap_or_else(|| draft.mac.clone()))
        .bind(config_str(config, "location").unwrap_or_default())
        .bind(&draft.mac)
        .bind(config_str(config, "broker").unwrap_or_default())
        .bind(config_port(config).unwrap_or(0) as i64)
        .bind(config_str(config, "pub_topic").unwrap_or_default())
        .bind(
            config_str(config, "topic")
                .or_else(|| config_str(config, "sub_topic"))
                .unwrap_or_default(),
        )
        .bind(config_str(config, "client_id").unwrap_or_default())
        .bind(config_str(config, "username").unwrap_or_default())
        .bind(config_str(config, "password").unwrap_or_default())
        .bind(draft.status.as_i64())
        .bind(draft.collect_enabled as i64)
        .bind(draft.description.as_deref())
        .bind(draft.ingress_type.as_i64())
        .bind(draft.user_id.map(|u| u.to_string()))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failed to insert device")?;

        self.device_by_mac(&draft.mac)
            .await?
            .context("device vanished after insert")
    }

    pub async fn device_by_mac(&self, mac: &str) -> Result<Option<Device>> {
        let row = sqlx::query("SELECT * FROM device WHERE mac = ?")
            .bind(mac)
            .fetch_optional(&self.pool)
            .await
            .context("failed to query device by mac")?;
        row.as_ref().map(device_from_row).transpose()
    }

    /// Owner-scoped lookup used by the dashboard endpoints.
    pub async fn device_by_id_and_user(
        &self,
        device_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Device>> {
        let row = sqlx::query("SELECT * FROM device WHERE id = ? AND user_id = ?")
            .bind(device_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to query device by id")?;
        row.as_ref().map(device_from_row).transpose()
    }

    pub async fn devices_by_user(&self, user_id: Uuid) -> Result<Vec<Device>> {
        let rows = sqlx::query("SELECT * FROM device WHERE user_id = ? ORDER BY name ASC")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("failed to query devices by user")?;
        rows.iter().map(device_from_row).collect()
    }

    /// Admin listing, optionally narrowed to one status.
    pub async fn list_devices(&self, status: Option<DeviceStatus>) -> Result<Vec<Device>> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM device WHERE status = ? ORDER BY mac ASC")
                    .bind(status.as_i64())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM device ORDER BY mac ASC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("failed to list devices")?;
        rows.iter().map(device_from_row).collect()
    }

    /// Devices the subscription manager should be running workers for.
    pub async fn enabled_collecting_devices(&self) -> Result<Vec<Device>> {
        let rows =
            sqlx::query("SELECT * FROM device WHERE status = 1 AND collect_enabled = 1")
                .fetch_all(&self.pool)
                .await
                .context("failed to query collecting devices")?;
        rows.iter().map(device_from_row).collect()
    }

    /// Applies a partial update; returns `None` when the MAC is unknown.
    pub async fn update_device(&self, mac: &str, patch: &DevicePatch) -> Result<Option<Device>> {
        let Some(mut device) = self.device_by_mac(mac).await? else {
            return Ok(None);
        };

        if let Some(status) = patch.status {
            device.status = status;
        }
        if let Some(collect_enabled) = patch.collect_enabled {
            device.collect_enabled = collect_enabled;
        }
        if let Some(ingress_type) = patch.ingress_type {
            device.ingress_type = ingress_type;
        }
        if let Some(config) = &patch.ingress_config {
            if let Some(name) = config_str(config, "name") {
                device.name = name;
            }
            if let Some(location) = config_str(config, "location") {
                device.location = location;
            }
            if let Some(broker) = config_str(config, "broker") {
                device.broker = broker;
            }
            if let Some(port) = config_port(config) {
                device.port = port;
            }
            if let Some(pub_topic) = config_str(config, "pub_topic") {
                device.pub_topic = pub_topic;
            }
            if let Some(sub_topic) =
                config_str(config, "topic").or_else(|| config_str(config, "sub_topic"))
            {
                device.sub_topic = sub_topic;
            }
            if let Some(client_id) = config_str(config, "client_id") {
                device.client_id = client_id;
            }
            if let Some(username) = config_str(config, "username") {
                device.username = username;
            }
            if let Some(password) = config_str(config, "password") {
                device.password = password;
            }
        }
        if let Some(description) = &patch.description {
            device.description = Some(description.clone());
        }
        device.updated_at = Utc::now();

        sqlx::query(
            "UPDATE device SET name = ?, location = ?, broker = ?, port = ?, pub_topic = ?, \
             sub_topic = ?, client_id = ?, username = ?, password = ?, status = ?, \
             collect_enabled = ?, description = ?, ingress_type = ?, updated_at = ? \
             WHERE mac = ?",
        )
        .bind(&device.name)
        .bind(&device.location)
        .bind(&device.broker)
        .bind(device.port as i64)
        .bind(&device.pub_topic)
        .bind(&device.sub_topic)
        .bind(&device.client_id)
        .bind(&device.username)
        .bind(&device.password)
        .bind(device.status.as_i64())
        .bind(device.collect_enabled as i64)
        .bind(device.description.as_deref())
        .bind(device.ingress_type.as_i64())
        .bind(format_ts(device.updated_at))
        .bind(mac)
        .execute(&self.pool)
        .await
        .context("failed to update device")?;

        Ok(Some(device))
    }
}
