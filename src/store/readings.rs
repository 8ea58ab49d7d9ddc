//! Idempotent reading persistence keyed by `(mac, ts, payload_hash)`.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::Row;
use uuid::Uuid;

use super::{format_ts, parse_decimal, parse_opt_decimal, parse_ts, Store};
use crate::metrics;
use crate::model::Device;

/// A normalized sample ready for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub ts: DateTime<Utc>,
    pub energy_kwh: Decimal,
    pub power: Option<Decimal>,
    pub voltage: Option<Decimal>,
    pub current: Option<Decimal>,
    pub key: Option<String>,
}

/// What `record_reading` did with the sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// The columns the bucketing aggregator consumes, ordered by `ts`.
#[derive(Debug, Clone)]
pub struct ReadingSample {
    pub ts: DateTime<Utc>,
    pub energy_kwh: Decimal,
    pub power: Option<Decimal>,
    pub voltage: Option<Decimal>,
    pub current: Option<Decimal>,
}

/// Hex sha-256 over the canonical form of the payload map.
///
/// Canonicalization sorts object keys recursively and serializes with compact
/// separators, so re-encoded payloads with shuffled key order hash the same.
pub fn payload_hash(payload: &Map<String, Value>) -> String {
    let canonical = canonical_json(&Value::Object(payload.clone()));
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

impl Store {
    /// Persists a reading unless an identical `(mac, ts, payload_hash)` row
    /// already exists. Duplicates are counted and silently dropped; only
    /// storage-layer failures surface to the caller.
    pub async fn record_reading(
        &self,
        device: &Device,
        reading: &NewReading,
        payload: &Map<String, Value>,
    ) -> Result<InsertOutcome> {
        let hash = payload_hash(payload);
        let result = sqlx::query(
            "INSERT INTO reading \
             (device_id, mac, ts, energy_kwh, power, voltage, current, key, payload, payload_hash, ingested_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (mac, ts, payload_hash) DO NOTHING",
        )
        .bind(device.id.to_string())
        .bind(&device.mac)
        .bind(format_ts(reading.ts))
        .bind(reading.energy_kwh.to_string())
        .bind(reading.power.map(|d| d.to_string()))
        .bind(reading.voltage.map(|d| d.to_string()))
        .bind(reading.current.map(|d| d.to_string()))
        .bind(reading.key.as_deref())
        .bind(serde_json::to_string(payload).unwrap_or_else(|_| "{}".into()))
        .bind(&hash)
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .context("failed to insert reading")?;

        if result.rows_affected() == 0 {
            metrics::DUPLICATE.with_label_values(&[&device.mac]).inc();
            Ok(InsertOutcome::Duplicate)
        } else {
            metrics::COMMIT.with_label_values(&[&device.mac]).inc();
            Ok(InsertOutcome::Inserted)
        }
    }

    /// Readings for one device inside `[start, end]`, ascending by `ts`.
    pub async fn readings_in_range(
        &self,
        device_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ReadingSample>> {
        let rows = sqlx::query(
            "SELECT ts, energy_kwh, power, voltage, current FROM reading \
             WHERE device_id = ? AND ts >= ? AND ts <= ? ORDER BY ts ASC",
        )
        .bind(device_id.to_string())
        .bind(format_ts(start))
        .bind(format_ts(end))
        .fetch_all(&self.pool)
        .await
        .context("failed to query readings")?;

        rows.into_iter()
            .map(|row| {
                Ok(ReadingSample {
                    ts: parse_ts(&row.get::<String, _>("ts"))?,
                    energy_kwh: parse_decimal(&row.get::<String, _>("energy_kwh"))?,
                    power: parse_opt_decimal(row.get::<Option<String>, _>("power"))?,
                    voltage: parse_opt_decimal(row.get::<Option<String>, _>("voltage"))?,
                    current: parse_opt_decimal(row.get::<Option<String>, _>("current"))?,
                })
            })
            .collect()
    }

    /// Most recent reading timestamp per device, for runtime-status derivation.
    pub async fn last_seen_map(
        &self,
        device_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, DateTime<Utc>>> {
        if device_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; device_ids.len()].join(", ");
        let sql = format!(
            "SELECT device_id, MAX(ts) AS last_seen FROM reading \
             WHERE device_id IN ({placeholders}) GROUP BY device_id",
        );
        let mut query = sqlx::query(&sql);
        for id in device_ids {
            query = query.bind(id.to_string());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("failed to query last seen timestamps")?;

        let mut map = HashMap::new();
        for row in rows {
            let id: String = row.get("device_id");
            let Some(last_seen) = row.get::<Option<String>, _>("last_seen") else {
                continue;
            };
            map.insert(
                Uuid::parse_str(&id).context("bad device_id column")?,
                parse_ts(&last_seen)?,
            );
        }
        Ok(map)
    }

    /// Total stored readings for one MAC (used by tests and ops tooling).
    pub async fn reading_count(&self, mac: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM reading WHERE mac = ?")
            .bind(mac)
            .fetch_one(&self.pool)
            .await
            .context("failed to count readings")?;
        Ok(row.get("n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::test_device;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample_payload() -> Map<String, Value> {
        let Value::Object(map) = json!({
            "mac": "AA0000000001",
            "ts": "2025-01-01T11:55:00Z",
            "energy": "11.2",
            "power": "1.7",
        }) else {
            unreachable!()
        };
        map
    }

    fn sample_reading() -> NewReading {
        NewReading {
            ts: Utc.with_ymd_and_hms(2025, 1, 1, 11, 55, 0).unwrap(),
            energy_kwh: Decimal::new(112, 1),
            power: Some(Decimal::new(17, 1)),
            voltage: None,
            current: None,
            key: None,
        }
    }

    #[test]
    fn payload_hash_ignores_key_order() {
        let Value::Object(a) = json!({"a": 1, "b": {"y": 2, "x": 3}}) else {
            unreachable!()
        };
        let Value::Object(b) = json!({"b": {"x": 3, "y": 2}, "a": 1}) else {
            unreachable!()
        };
        assert_eq!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn payload_hash_differs_for_different_payloads() {
        let Value::Object(a) = json!({"a": 1}) else { unreachable!() };
        let Value::Object(b) = json!({"a": 2}) else { unreachable!() };
        assert_ne!(payload_hash(&a), payload_hash(&b));
    }

    #[tokio::test]
    async fn duplicate_payload_leaves_count_unchanged() {
        let store = Store::in_memory().await.unwrap();
        let device = test_device();
        let payload = sample_payload();
        let reading = sample_reading();

        let first = store
            .record_reading(&device, &reading, &payload)
            .await
            .unwrap();
        let second = store
            .record_reading(&device, &reading, &payload)
            .await
            .unwrap();

        assert_eq!(first, InsertOutcome::Inserted);
        assert_eq!(second, InsertOutcome::Duplicate);
        assert_eq!(store.reading_count(&device.mac).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn same_ts_different_payload_creates_two_rows() {
        let store = Store::in_memory().await.unwrap();
        let device = test_device();
        let reading = sample_reading();

        let mut other_payload = sample_payload();
        other_payload.insert("power".into(), json!("1.8"));

        store
            .record_reading(&device, &reading, &sample_payload())
            .await
            .unwrap();
        let outcome = store
            .record_reading(&device, &reading, &other_payload)
            .await
            .unwrap();

        assert_eq!(outcome, InsertOutcome::Inserted);
        assert_eq!(store.reading_count(&device.mac).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn readings_in_range_is_ordered_and_inclusive() {
        let store = Store::in_memory().await.unwrap();
        let device = test_device();
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 11, 0, 0).unwrap();

        for (minutes, energy) in [(30, "10.2"), (0, "10.0"), (60, "10.4")] {
            let mut payload = sample_payload();
            payload.insert("energy".into(), json!(energy));
            let reading = NewReading {
                ts: base + chrono::Duration::minutes(minutes),
                energy_kwh: energy.parse().unwrap(),
                power: None,
                voltage: None,
                current: None,
                key: None,
            };
            store
                .record_reading(&device, &reading, &payload)
                .await
                .unwrap();
        }

        let samples = store
            .readings_in_range(device.id, base, base + chrono::Duration::minutes(60))
            .await
            .unwrap();
        assert_eq!(samples.len(), 3);
        assert!(samples.windows(2).all(|pair| pair[0].ts <= pair[1].ts));
        assert_eq!(samples[0].energy_kwh, Decimal::new(100, 1));
        assert_eq!(samples[2].energy_kwh, Decimal::new(104, 1));
    }
}
