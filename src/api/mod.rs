//! HTTP surface: thin axum glue over the query engine, auth service,
//! subscription manager and stores.

mod admin;
mod auth_routes;
mod devices;
mod ops;

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use crate::auth::{decode_token, TokenError};
use crate::manager::SubscriptionManager;
use crate::mqtt::MqttPool;
use crate::registry::SubscriberRegistry;
use crate::store::Store;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub registry: Arc<SubscriberRegistry>,
    pub manager: Arc<SubscriptionManager>,
    pub pool: Arc<MqttPool>,
    pub jwt_secret: Arc<str>,
}

/// Uniform error envelope: `{success: false, error_code, message}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error_code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error_code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error_code,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "VALIDATION_ERROR",
            message,
        )
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "unexpected server error",
        )
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "request failed");
        Self::internal()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error_code": self.error_code,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

/// User context decoded from the `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("Missing Authorization header"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("Authorization header is not a bearer token"))?;

        let claims = decode_token(&state.jwt_secret, token).map_err(|err| match err {
            TokenError::Expired => ApiError::unauthorized("Token expired"),
            TokenError::WrongType => ApiError::new(
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                "Unsupported token type",
            ),
            TokenError::MissingSubject => ApiError::unauthorized("Token missing subject"),
            TokenError::Invalid => ApiError::unauthorized("Invalid token"),
        })?;

        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| ApiError::unauthorized("Token subject is not a user id"))?;
        Ok(AuthContext { user_id })
    }
}

/// Builds the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/auth/login", post(auth_routes::login))
        .route("/v1/devices", get(devices::list_devices))
        .route(
            "/v1/devices/{device_id}/electricity",
            get(devices::device_electricity),
        )
        .route(
            "/v1/device-admin/macs",
            post(admin::create_device).get(admin::list_devices),
        )
        .route("/v1/device-admin/macs/{mac}", patch(admin::update_device))
        .route(
            "/v1/device-admin/macs/{mac}/publish",
            post(admin::publish_settings),
        )
        .route("/v1/dead-letters", get(ops::list_dead_letters))
        .route("/health", get(ops::health))
        .route("/metrics", get(ops::metrics))
        .with_state(state)
}
