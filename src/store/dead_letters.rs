//! Append-only store of rejected payloads.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::{format_ts, parse_ts, Store};
use crate::model::DeadLetter;

/// Query filters for the operator-facing dead-letter listing.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub mac: Option<String>,
    pub from_ts: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Store {
    /// Appends one dead letter and returns its row id.
    pub async fn append_dead_letter(
        &self,
        device_id: Option<Uuid>,
        mac: Option<&str>,
        raw_payload: &Value,
        reason: &str,
        retryable: bool,
        meta: Option<&Value>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO dead_letter \
             (device_id, mac, raw_payload, failure_reason, occured_at, retryable, meta) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(device_id.map(|id| id.to_string()))
        .bind(mac)
        .bind(serde_json::to_string(raw_payload).unwrap_or_else(|_| "{}".into()))
        .bind(reason)
        .bind(format_ts(Utc::now()))
        .bind(retryable as i64)
        .bind(meta.map(|m| serde_json::to_string(m).unwrap_or_else(|_| "{}".into())))
        .execute(&self.pool)
        .await
        .context("failed to insert dead letter")?;
        Ok(result.last_insert_rowid())
    }

    /// Dead letters newest first, with optional MAC / time filters.
    pub async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetter>> {
        let mut sql = String::from(
            "SELECT id, device_id, mac, raw_payload, failure_reason, occured_at, retryable, meta \
             FROM dead_letter WHERE 1 = 1",
        );
        if filter.mac.is_some() {
            sql.push_str(" AND mac = ?");
        }
        if filter.from_ts.is_some() {
            sql.push_str(" AND occured_at >= ?");
        }
        sql.push_str(" ORDER BY occured_at DESC, id DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(mac) = &filter.mac {
            query = query.bind(mac);
        }
        if let Some(from_ts) = filter.from_ts {
            query = query.bind(format_ts(from_ts));
        }
        query = query.bind(filter.limit.max(1)).bind(filter.offset.max(0));

        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("failed to query dead letters")?;

        rows.into_iter()
            .map(|row| {
                let device_id: Option<String> = row.get("device_id");
                let meta: Option<String> = row.get("meta");
                Ok(DeadLetter {
                    id: row.get("id"),
                    device_id: device_id
                        .map(|id| Uuid::parse_str(&id))
                        .transpose()
                        .context("bad device_id column")?,
                    mac: row.get("mac"),
                    raw_payload: serde_json::from_str(&row.get::<String, _>("raw_payload"))
                        .unwrap_or(Value::Null),
                    failure_reason: row.get("failure_reason"),
                    occured_at: parse_ts(&row.get::<String, _>("occured_at"))?,
                    retryable: row.get::<i64, _>("retryable") != 0,
                    meta: meta.map(|m| serde_json::from_str(&m).unwrap_or(Value::Null)),
                })
            })
            .collect()
    }

    pub async fn dead_letter_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM dead_letter")
            .fetch_one(&self.pool)
            .await
            .context("failed to count dead letters")?;
        Ok(row.get("n"))
    }
}
