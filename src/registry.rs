//! Registry of currently active device subscriptions.
//!
//! Workers activate themselves once their adapter is connected and deactivate
//! on the way out; everything else here is thin bookkeeping over the metrics
//! registry so the pipeline has a single place to report from.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::metrics;
use crate::model::{Device, DeviceStatus, IngressType};

/// Runtime state for one active subscription; serialized into `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberRecord {
    pub mac: String,
    pub status: DeviceStatus,
    pub ingress_type: IngressType,
    pub collect_enabled: bool,
    pub activated_at: DateTime<Utc>,
    pub lag_seconds: f64,
}

/// Point-in-time view of the registry for `/health` and tests.
pub type RegistrySnapshot = HashMap<String, SubscriberRecord>;

#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    records: Mutex<RegistrySnapshot>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a device's worker as active and syncs the subscriber gauge.
    pub async fn activate(&self, device: &Device) {
        let mut records = self.records.lock().await;
        records.insert(
            device.mac.clone(),
            SubscriberRecord {
                mac: device.mac.clone(),
                status: device.status,
                ingress_type: device.ingress_type,
                collect_enabled: device.collect_enabled,
                activated_at: Utc::now(),
                lag_seconds: 0.0,
            },
        );
        metrics::ACTIVE_SUBSCRIBERS.set(records.len() as i64);
        info!(mac = %device.mac, ingress = ?device.ingress_type, "subscription activated");
    }

    /// Removes a device's record; safe to call when no record exists.
    pub async fn deactivate(&self, mac: &str) {
        let mut records = self.records.lock().await;
        records.remove(mac);
        metrics::ACTIVE_SUBSCRIBERS.set(records.len() as i64);
        info!(mac, "subscription deactivated");
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.records.lock().await.clone()
    }

    pub async fn active_count(&self) -> usize {
        self.records.lock().await.len()
    }

    pub fn record_ingress(&self, mac: &str) {
        metrics::INGRESS.with_label_values(&[mac]).inc();
    }

    pub fn record_commit(&self, mac: &str) {
        metrics::COMMIT.with_label_values(&[mac]).inc();
    }

    pub fn record_duplicate(&self, mac: &str) {
        metrics::DUPLICATE.with_label_values(&[mac]).inc();
    }

    pub fn record_dead_letter(&self, reason: &str) {
        metrics::DEAD_LETTER.with_label_values(&[reason]).inc();
    }

    pub fn record_reconnect(&self, mac: &str) {
        metrics::RECONNECT.with_label_values(&[mac]).inc();
    }

    pub fn record_retry_failure(&self, mac: &str, reason: &str) {
        metrics::RETRY.with_label_values(&[mac, reason]).inc();
    }

    /// Updates the lag gauge and the in-memory record, when one exists.
    pub async fn record_lag(&self, mac: &str, lag_seconds: f64) {
        metrics::LAG_SECONDS
            .with_label_values(&[mac])
            .set(lag_seconds);
        if let Some(record) = self.records.lock().await.get_mut(mac) {
            record.lag_seconds = lag_seconds;
        }
    }
}
