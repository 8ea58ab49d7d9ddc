//! Operations surface: health, Prometheus exposition and dead-letter
//! inspection.

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use chrono::DateTime;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, AppState, AuthContext};
use crate::metrics::export as export_metrics;
use crate::query::format_timestamp;
use crate::store::DeadLetterFilter;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.snapshot().await;
    let workers = state.manager.active_macs().await;
    Json(json!({
        "status": "ok",
        "subscriber_count": snapshot.len(),
        "worker_count": workers.len(),
        "subscribers": snapshot,
    }))
}

pub async fn metrics() -> impl IntoResponse {
    let (body, content_type) = export_metrics();
    ([(header::CONTENT_TYPE, content_type)], body)
}

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct DeadLetterParams {
    pub mac: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub from_ts: Option<String>,
}

pub async fn list_dead_letters(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(params): Query<DeadLetterParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ApiError::validation("limit must be within [1, 200]"));
    }
    let offset = params.offset.unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::validation("offset must be >= 0"));
    }
    let from_ts = match params.from_ts.as_deref() {
        None => None,
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|_| ApiError::validation("from_ts must be RFC 3339"))?
                .to_utc(),
        ),
    };

    let letters = state
        .store
        .list_dead_letters(&DeadLetterFilter {
            mac: params.mac.clone(),
            from_ts,
            limit,
            offset,
        })
        .await?;

    let items: Vec<Value> = letters
        .iter()
        .map(|letter| {
            json!({
                "id": letter.id,
                "mac": letter.mac,
                "failure_reason": letter.failure_reason,
                "occured_at": format_timestamp(letter.occured_at),
                "retryable": letter.retryable,
                "payload": letter.raw_payload,
                "meta": letter.meta,
            })
        })
        .collect();
    let total = items.len();
    Ok(Json(json!({ "items": items, "total": total })))
}
