//! Dashboard endpoints: device list and electricity curves. Both record
//! request count, latency and emitted point counts.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{ApiError, AppState, AuthContext};
use crate::metrics::observe_device_api;
use crate::query::{self, QueryError, StatusFilter, Window};

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub status: Option<String>,
}

pub async fn list_devices(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let started = Instant::now();

    let page = params.page.unwrap_or(1);
    let page_size = params.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if page < 1 {
        observe_list("VALIDATION_ERROR", started, None);
        return Err(ApiError::validation("page must be >= 1"));
    }
    if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
        observe_list("VALIDATION_ERROR", started, None);
        return Err(ApiError::validation("page_size must be within [1, 100]"));
    }
    let filter = match params.status.as_deref() {
        None => StatusFilter::All,
        Some(raw) => match StatusFilter::parse(raw) {
            Some(filter) => filter,
            None => {
                observe_list("VALIDATION_ERROR", started, None);
                return Err(ApiError::validation(
                    "status must be one of online, offline, maintenance, all",
                ));
            }
        },
    };

    match query::list_devices(&state.store, auth.user_id, filter, page, page_size, Utc::now())
        .await
    {
        Ok(data) => {
            observe_list("success", started, Some(data.items.len()));
            Ok(Json(json!({ "success": true, "data": data })))
        }
        Err(err) => {
            observe_list("INTERNAL_ERROR", started, None);
            Err(match err {
                QueryError::Storage(err) => err.into(),
                _ => ApiError::internal(),
            })
        }
    }
}

fn observe_list(status: &str, started: Instant, points: Option<usize>) {
    observe_device_api("list_devices", status, started.elapsed().as_secs_f64(), points);
}

#[derive(Debug, Deserialize)]
pub struct ElectricityParams {
    pub window: Option<String>,
}

pub async fn device_electricity(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(device_id): Path<Uuid>,
    Query(params): Query<ElectricityParams>,
) -> Result<Json<Value>, ApiError> {
    let started = Instant::now();

    let window = match Window::parse(params.window.as_deref().unwrap_or("24h")) {
        Ok(window) => window,
        Err(_) => {
            observe_electricity("INVALID_TIME_RANGE", started, None);
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_TIME_RANGE",
                "window must be one of 24h, 7d, 30d",
            ));
        }
    };

    match query::device_electricity(&state.store, device_id, auth.user_id, window, Utc::now())
        .await
    {
        Ok(series) => {
            observe_electricity("success", started, Some(series.points.len()));
            Ok(Json(json!({ "success": true, "data": series })))
        }
        Err(QueryError::DeviceNotFound) => {
            observe_electricity("DEVICE_NOT_FOUND", started, None);
            Err(ApiError::new(
                StatusCode::NOT_FOUND,
                "DEVICE_NOT_FOUND",
                "device_id is invalid or no longer exists",
            ))
        }
        Err(QueryError::InvalidTimeRange) => {
            observe_electricity("INVALID_TIME_RANGE", started, None);
            Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_TIME_RANGE",
                "window must be one of 24h, 7d, 30d",
            ))
        }
        Err(QueryError::Storage(err)) => {
            observe_electricity("INTERNAL_ERROR", started, None);
            Err(err.into())
        }
    }
}

fn observe_electricity(status: &str, started: Instant, points: Option<usize>) {
    observe_device_api(
        "device_electricity",
        status,
        started.elapsed().as_secs_f64(),
        points,
    );
}
