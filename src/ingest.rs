//! Envelope normalization: raw payload maps become typed readings, and
//! anything that cannot be normalized or persisted is dead-lettered with an
//! `ingest_error:<kind>` tag.

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::metrics;
use crate::model::{Device, Envelope};
use crate::registry::SubscriberRegistry;
use crate::store::{NewReading, Store};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    /// `energy` is absent or not a parseable decimal.
    #[error("missing or invalid energy value")]
    MissingEnergy,
}

impl NormalizeError {
    fn kind(&self) -> &'static str {
        match self {
            NormalizeError::MissingEnergy => "missing_energy",
        }
    }
}

/// Parses the payload into a typed reading.
///
/// Timestamps accept ISO-8601 (naive values are treated as UTC) or numeric
/// epoch seconds and default to "now". Decimals are parsed from strings or
/// JSON numbers; `power`/`voltage`/`current` are optional, `energy` is not.
pub fn normalize(payload: &Map<String, Value>) -> Result<NewReading, NormalizeError> {
    let ts = parse_timestamp(payload);
    let energy_kwh = to_decimal(payload.get("energy")).ok_or(NormalizeError::MissingEnergy)?;

    Ok(NewReading {
        ts,
        energy_kwh,
        power: to_decimal(payload.get("power")),
        voltage: to_decimal(payload.get("voltage")),
        current: to_decimal(payload.get("current")),
        key: payload.get("key").and_then(opaque_string),
    })
}

fn parse_timestamp(payload: &Map<String, Value>) -> DateTime<Utc> {
    let raw = payload.get("ts").or_else(|| payload.get("timestamp"));
    match raw {
        Some(Value::Number(n)) => n
            .as_f64()
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
            .unwrap_or_else(Utc::now),
        Some(Value::String(s)) => parse_iso_utc(s).unwrap_or_else(Utc::now),
        _ => Utc::now(),
    }
}

fn parse_iso_utc(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    // Naive timestamps ("2025-01-01T12:00:00") are taken as UTC.
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

fn to_decimal(value: Option<&Value>) -> Option<Decimal> {
    match value? {
        Value::String(s) => Decimal::from_str(s.trim())
            .ok()
            .or_else(|| Decimal::from_scientific(s.trim()).ok()),
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .ok()
            .or_else(|| Decimal::from_scientific(&n.to_string()).ok()),
        _ => None,
    }
}

fn opaque_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Normalizes and persists one envelope. Failures never propagate: parse and
/// storage errors alike end up in the dead-letter store and the worker keeps
/// consuming.
pub async fn handle_envelope(
    store: &Store,
    registry: &SubscriberRegistry,
    device: &Device,
    envelope: Envelope,
) {
    let timer = metrics::INGEST_LATENCY.start_timer();
    let mac = envelope.mac.clone();
    match normalize(&envelope.payload) {
        Ok(reading) => {
            if let Err(err) = store.record_reading(device, &reading, &envelope.payload).await {
                warn!(mac = %device.mac, error = %err, "reading persist failed, dead-lettering");
                record_dead_letter(
                    store,
                    registry,
                    Some(device.id),
                    Some(&mac),
                    &Value::Object(envelope.payload),
                    "ingest_error:storage",
                    false,
                )
                .await;
            }
        }
        Err(err) => {
            warn!(mac = %device.mac, error = %err, "payload rejected by normalizer");
            record_dead_letter(
                store,
                registry,
                Some(device.id),
                Some(&mac),
                &Value::Object(envelope.payload),
                &format!("ingest_error:{}", err.kind()),
                false,
            )
            .await;
        }
    }
    timer.observe_duration();
}

/// Appends a dead letter and bumps the per-reason counter.
pub async fn record_dead_letter(
    store: &Store,
    registry: &SubscriberRegistry,
    device_id: Option<Uuid>,
    mac: Option<&str>,
    payload: &Value,
    reason: &str,
    retryable: bool,
) {
    registry.record_dead_letter(reason);
    if let Err(err) = store
        .append_dead_letter(device_id, mac, payload, reason, retryable, None)
        .await
    {
        warn!(error = %err, reason, "dead letter write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::test_device;
    use chrono::TimeZone;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        let Value::Object(map) = value else {
            unreachable!()
        };
        map
    }

    #[test]
    fn normalize_parses_full_payload() {
        let reading = normalize(&payload(json!({
            "mac": "AA0000000001",
            "ts": "2025-01-01T11:55:00Z",
            "energy": "11.2",
            "power": "1.7",
            "voltage": 221.3,
            "current": "1.7",
            "key": 1,
        })))
        .unwrap();

        assert_eq!(
            reading.ts,
            Utc.with_ymd_and_hms(2025, 1, 1, 11, 55, 0).unwrap()
        );
        assert_eq!(reading.energy_kwh, Decimal::from_str("11.2").unwrap());
        assert_eq!(reading.power, Some(Decimal::from_str("1.7").unwrap()));
        assert_eq!(reading.voltage, Some(Decimal::from_str("221.3").unwrap()));
        assert_eq!(reading.key.as_deref(), Some("1"));
    }

    #[test]
    fn normalize_accepts_epoch_and_naive_timestamps() {
        let epoch = normalize(&payload(json!({"energy": "1.0", "ts": 1735732500})))
            .unwrap()
            .ts;
        assert_eq!(epoch, DateTime::from_timestamp(1735732500, 0).unwrap());

        let naive = normalize(&payload(json!({"energy": "1.0", "ts": "2025-01-01T12:00:00"})))
            .unwrap()
            .ts;
        assert_eq!(naive, Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn normalize_defaults_missing_timestamp_to_now() {
        let before = Utc::now();
        let ts = normalize(&payload(json!({"energy": "1.0"}))).unwrap().ts;
        assert!(ts >= before && ts <= Utc::now());
    }

    #[test]
    fn normalize_rejects_missing_or_bad_energy() {
        assert_eq!(
            normalize(&payload(json!({"power": "1.0"}))),
            Err(NormalizeError::MissingEnergy)
        );
        assert_eq!(
            normalize(&payload(json!({"energy": "watts"}))),
            Err(NormalizeError::MissingEnergy)
        );
    }

    #[tokio::test]
    async fn handle_envelope_persists_good_payload() {
        let store = Store::in_memory().await.unwrap();
        let registry = SubscriberRegistry::new();
        let device = test_device();
        let envelope = Envelope {
            mac: device.mac.clone(),
            payload: payload(json!({
                "mac": device.mac,
                "ts": "2025-01-01T11:55:00Z",
                "energy": "11.2",
            })),
        };

        handle_envelope(&store, &registry, &device, envelope).await;
        assert_eq!(store.reading_count(&device.mac).await.unwrap(), 1);
        assert_eq!(store.dead_letter_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn handle_envelope_dead_letters_bad_energy() {
        let store = Store::in_memory().await.unwrap();
        let registry = SubscriberRegistry::new();
        let device = test_device();
        let envelope = Envelope {
            mac: device.mac.clone(),
            payload: payload(json!({"mac": device.mac, "energy": "not-a-number"})),
        };

        handle_envelope(&store, &registry, &device, envelope).await;
        assert_eq!(store.reading_count(&device.mac).await.unwrap(), 0);

        let letters = store
            .list_dead_letters(&crate::store::DeadLetterFilter {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].failure_reason, "ingest_error:missing_energy");
        assert!(!letters[0].retryable);
    }
}
