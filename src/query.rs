//! Dashboard queries: the bucketed energy-curve aggregation and the
//! owner-scoped device list.
//!
//! All arithmetic stays in fixed-precision decimals; floats appear only in
//! the emitted points. `now` is passed in by the caller so tests can pin it.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Device, DeviceStatus};
use crate::store::{ReadingSample, Store};

/// A device is online when its newest reading is at most this old.
fn online_threshold() -> Duration {
    Duration::minutes(10)
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("device_id is invalid or no longer exists")]
    DeviceNotFound,
    #[error("window must be one of 24h, 7d, 30d")]
    InvalidTimeRange,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// The three fixed query windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Last24h,
    Last7d,
    Last30d,
}

impl Window {
    pub fn parse(raw: &str) -> Result<Self, QueryError> {
        match raw {
            "24h" => Ok(Window::Last24h),
            "7d" => Ok(Window::Last7d),
            "30d" => Ok(Window::Last30d),
            _ => Err(QueryError::InvalidTimeRange),
        }
    }

    fn duration(self) -> Duration {
        match self {
            Window::Last24h => Duration::hours(24),
            Window::Last7d => Duration::days(7),
            Window::Last30d => Duration::days(30),
        }
    }

    fn bucket(self) -> Duration {
        match self {
            Window::Last24h => Duration::minutes(5),
            Window::Last7d => Duration::minutes(30),
            Window::Last30d => Duration::minutes(120),
        }
    }

    fn interval_label(self) -> &'static str {
        match self {
            Window::Last24h => "pt5m",
            Window::Last7d => "pt30m",
            Window::Last30d => "pt120m",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ElectricityPoint {
    pub timestamp: String,
    pub power_kw: f64,
    pub energy_kwh: f64,
    pub voltage_v: f64,
    pub current_a: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ElectricitySeries {
    pub device_id: String,
    pub start_time: String,
    pub end_time: String,
    pub interval: &'static str,
    pub points: Vec<ElectricityPoint>,
}

/// Runtime status derived from the latest reading; `Maintenance` wins when
/// the device is disabled or not collecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    Online,
    Offline,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Online,
    Offline,
    Maintenance,
    All,
}

impl StatusFilter {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "online" => Some(StatusFilter::Online),
            "offline" => Some(StatusFilter::Offline),
            "maintenance" => Some(StatusFilter::Maintenance),
            "all" => Some(StatusFilter::All),
            _ => None,
        }
    }

    fn matches(self, status: RuntimeStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Online => status == RuntimeStatus::Online,
            StatusFilter::Offline => status == RuntimeStatus::Offline,
            StatusFilter::Maintenance => status == RuntimeStatus::Maintenance,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceListItem {
    pub device_id: String,
    pub mac: String,
    pub name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub status: RuntimeStatus,
    pub last_seen_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceListData {
    pub page: u32,
    pub page_size: u32,
    pub total: usize,
    pub items: Vec<DeviceListItem>,
}

/// RFC 3339 UTC with trailing `Z`, second precision (bucket timestamps are
/// always second-aligned).
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Serves the fixed-window energy curve for one device.
pub async fn device_electricity(
    store: &Store,
    device_id: Uuid,
    user_id: Uuid,
    window: Window,
    now: DateTime<Utc>,
) -> Result<ElectricitySeries, QueryError> {
    let device = store
        .device_by_id_and_user(device_id, user_id)
        .await?
        .ok_or(QueryError::DeviceNotFound)?;

    let duration = window.duration();
    let bucket = window.bucket();
    let end_utc = now;
    let start_utc = end_utc - duration;
    let bucket_count = (duration.num_seconds() / bucket.num_seconds()) as usize;

    let readings = store
        .readings_in_range(device.id, start_utc, end_utc)
        .await?;
    let points = build_points(start_utc, bucket, bucket_count, &readings);

    Ok(ElectricitySeries {
        device_id: device.id.to_string(),
        start_time: format_timestamp(start_utc),
        end_time: format_timestamp(end_utc),
        interval: window.interval_label(),
        points,
    })
}

#[derive(Debug, Default, Clone)]
struct BucketStats {
    count: usize,
    last_power: Option<Decimal>,
    last_voltage: Option<Decimal>,
    last_current: Option<Decimal>,
    first_energy: Option<Decimal>,
    last_energy: Option<Decimal>,
}

/// The in-memory bucketing pass. Readings are consumed in `ts` order; the
/// running meter value is carried across buckets so each bucket's energy is
/// the cumulative delta since the previous sample, clamped non-negative to
/// absorb meter resets.
fn build_points(
    start: DateTime<Utc>,
    bucket: Duration,
    bucket_count: usize,
    readings: &[ReadingSample],
) -> Vec<ElectricityPoint> {
    let bucket_seconds = bucket.num_seconds();
    let mut buckets = vec![BucketStats::default(); bucket_count];
    let mut carry: Option<Decimal> = None;

    for reading in readings {
        if reading.ts < start {
            continue;
        }
        let index = ((reading.ts - start).num_seconds() / bucket_seconds) as usize;
        let Some(stats) = buckets.get_mut(index) else {
            continue;
        };
        stats.count += 1;
        stats.last_power = reading.power;
        stats.last_voltage = reading.voltage;
        stats.last_current = reading.current;
        if stats.first_energy.is_none() {
            stats.first_energy = Some(carry.unwrap_or(reading.energy_kwh));
        }
        stats.last_energy = Some(reading.energy_kwh);
        carry = Some(reading.energy_kwh);
    }

    buckets
        .into_iter()
        .enumerate()
        .filter(|(_, stats)| stats.count > 0)
        .map(|(index, stats)| {
            let energy = match (stats.first_energy, stats.last_energy) {
                (Some(first), Some(last)) if last >= first => last - first,
                _ => Decimal::ZERO,
            };
            ElectricityPoint {
                timestamp: format_timestamp(start + bucket * index as i32),
                power_kw: decimal_or_zero(stats.last_power),
                energy_kwh: energy.to_f64().unwrap_or(0.0),
                voltage_v: decimal_or_zero(stats.last_voltage),
                current_a: decimal_or_zero(stats.last_current),
            }
        })
        .collect()
}

fn decimal_or_zero(value: Option<Decimal>) -> f64 {
    value.and_then(|d| d.to_f64()).unwrap_or(0.0)
}

/// Owner-scoped, status-filtered, paginated device listing.
pub async fn list_devices(
    store: &Store,
    user_id: Uuid,
    filter: StatusFilter,
    page: u32,
    page_size: u32,
    now: DateTime<Utc>,
) -> Result<DeviceListData, QueryError> {
    let devices = store.devices_by_user(user_id).await?;
    let ids: Vec<Uuid> = devices.iter().map(|d| d.id).collect();
    let last_seen = store.last_seen_map(&ids).await?;

    let items: Vec<DeviceListItem> = devices
        .iter()
        .filter_map(|device| {
            let seen = last_seen.get(&device.id).copied();
            let status = determine_status(device, seen, now);
            if !filter.matches(status) {
                return None;
            }
            Some(DeviceListItem {
                device_id: device.id.to_string(),
                mac: device.mac.clone(),
                name: device.name.clone(),
                description: device.description.clone(),
                location: if device.location.is_empty() {
                    None
                } else {
                    Some(device.location.clone())
                },
                status,
                last_seen_at: seen.map(format_timestamp),
            })
        })
        .collect();

    let page = page.max(1);
    let page_size = page_size.max(1);
    let total = items.len();
    let offset = ((page - 1) * page_size) as usize;
    let items = items
        .into_iter()
        .skip(offset)
        .take(page_size as usize)
        .collect();

    Ok(DeviceListData {
        page,
        page_size,
        total,
        items,
    })
}

fn determine_status(
    device: &Device,
    last_seen: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> RuntimeStatus {
    if !device.collect_enabled || device.status == DeviceStatus::Disabled {
        return RuntimeStatus::Maintenance;
    }
    match last_seen {
        Some(seen) if now - seen <= online_threshold() => RuntimeStatus::Online,
        _ => RuntimeStatus::Offline,
    }
}
