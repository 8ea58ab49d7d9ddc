//! Device administration: CRUD over the device table plus settings publish.
//! Every mutation reconciles the subscription manager with the new row.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{ApiError, AppState, AuthContext};
use crate::model::{normalize_mac, Device, DeviceStatus, IngressType};
use crate::publish::{self, PublishError, TimerSettings};
use crate::query::format_timestamp;
use crate::store::{DeviceDraft, DevicePatch};

#[derive(Debug, Deserialize)]
pub struct DeviceCreateBody {
    pub mac: String,
    #[serde(default = "default_status")]
    pub status: DeviceStatus,
    #[serde(default)]
    pub collect_enabled: bool,
    #[serde(default = "default_ingress")]
    pub ingress_type: IngressType,
    pub ingress_config: Map<String, Value>,
    pub description: Option<String>,
}

fn default_status() -> DeviceStatus {
    DeviceStatus::Enabled
}

fn default_ingress() -> IngressType {
    IngressType::Mqtt
}

fn device_response(device: &Device) -> Value {
    json!({
        "mac": device.mac,
        "status": device.status,
        "collect_enabled": device.collect_enabled,
        "ingress_type": device.ingress_type,
        "ingress_config": device.ingress_config(),
        "description": device.description,
        "created_at": format_timestamp(device.created_at),
    })
}

pub async fn create_device(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<DeviceCreateBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Some(mac) = normalize_mac(&body.mac) else {
        return Err(ApiError::validation("mac must be 12 hex characters"));
    };
    if state.store.device_by_mac(&mac).await?.is_some() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "DEVICE_CONFLICT",
            "a device with this MAC already exists",
        ));
    }

    let device = state
        .store
        .create_device(&DeviceDraft {
            mac,
            status: body.status,
            collect_enabled: body.collect_enabled,
            ingress_type: body.ingress_type,
            ingress_config: body.ingress_config,
            description: body.description,
            user_id: Some(auth.user_id),
        })
        .await?;

    state.manager.apply_device(&device).await;
    Ok((StatusCode::CREATED, Json(device_response(&device))))
}

#[derive(Debug, Deserialize)]
pub struct AdminListParams {
    pub status: Option<String>,
}

pub async fn list_devices(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(params): Query<AdminListParams>,
) -> Result<Json<Value>, ApiError> {
    let status = match params.status.as_deref() {
        None => None,
        Some("enabled") => Some(DeviceStatus::Enabled),
        Some("disabled") => Some(DeviceStatus::Disabled),
        Some(_) => {
            return Err(ApiError::validation(
                "status must be one of enabled, disabled",
            ))
        }
    };
    let devices = state.store.list_devices(status).await?;
    let items: Vec<Value> = devices.iter().map(device_response).collect();
    Ok(Json(json!({ "items": items, "total": items.len() })))
}

#[derive(Debug, Deserialize)]
pub struct DeviceUpdateBody {
    pub status: Option<DeviceStatus>,
    pub collect_enabled: Option<bool>,
    pub ingress_type: Option<IngressType>,
    pub ingress_config: Option<Map<String, Value>>,
    pub description: Option<String>,
}

pub async fn update_device(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(mac): Path<String>,
    Json(body): Json<DeviceUpdateBody>,
) -> Result<Json<Value>, ApiError> {
    let Some(mac) = normalize_mac(&mac) else {
        return Err(ApiError::validation("mac must be 12 hex characters"));
    };
    let patch = DevicePatch {
        status: body.status,
        collect_enabled: body.collect_enabled,
        ingress_type: body.ingress_type,
        ingress_config: body.ingress_config,
        description: body.description,
    };
    let Some(device) = state.store.update_device(&mac, &patch).await? else {
        return Err(device_not_found());
    };

    state.manager.apply_device(&device).await;
    Ok(Json(device_response(&device)))
}

pub async fn publish_settings(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(mac): Path<String>,
    Json(settings): Json<TimerSettings>,
) -> Result<Json<Value>, ApiError> {
    let Some(mac) = normalize_mac(&mac) else {
        return Err(ApiError::validation("mac must be 12 hex characters"));
    };
    if let Err(message) = settings.validate() {
        return Err(ApiError::validation(message));
    }
    let Some(device) = state.store.device_by_mac(&mac).await? else {
        return Err(device_not_found());
    };

    publish::publish_settings(&state.pool, &device, settings)
        .await
        .map_err(|err| match err {
            PublishError::InvalidConfig(err) => ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_MQTT_CONFIG",
                err.to_string(),
            ),
            PublishError::Unavailable(message) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "MQTT_UNAVAILABLE",
                message,
            ),
        })?;
    Ok(Json(json!({ "success": true })))
}

fn device_not_found() -> ApiError {
    ApiError::new(
        StatusCode::NOT_FOUND,
        "DEVICE_NOT_FOUND",
        "no device with this MAC",
    )
}
