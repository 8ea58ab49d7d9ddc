//! `/v1/auth/login`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, AppState};
use crate::auth::{self, AuthError};
use crate::query::format_timestamp;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.username.is_empty() || body.username.len() > 64 {
        return Err(ApiError::validation("username must be 1-64 characters"));
    }
    if body.password.len() < 6 || body.password.len() > 128 {
        return Err(ApiError::validation("password must be 6-128 characters"));
    }

    let result = auth::login(
        &state.store,
        &state.jwt_secret,
        &body.username,
        &body.password,
        Utc::now(),
    )
    .await
    .map_err(|err| match err {
        AuthError::InvalidCredentials => {
            ApiError::unauthorized("invalid username or password")
        }
        AuthError::AccountLocked => ApiError::new(
            StatusCode::UNAUTHORIZED,
            "ACCOUNT_LOCKED",
            "account temporarily locked, retry in 15 minutes",
        ),
        AuthError::Storage(err) => err.into(),
    })?;

    let last_login = result
        .user
        .last_login_at
        .map(format_timestamp)
        .unwrap_or_else(|| format_timestamp(Utc::now()));
    Ok(Json(json!({
        "success": true,
        "data": {
            "token": result.token,
            "expires_at": format_timestamp(result.expires_at),
            "user": {
                "user_id": result.user.id.to_string(),
                "username": result.user.username,
                "last_login_at": last_login,
            },
        },
    })))
}
