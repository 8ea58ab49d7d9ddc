//! Login, lockout and access-token handling.
//!
//! Passwords are stored as argon2 hashes. Three consecutive failures inside a
//! 15-minute window (measured against `last_login_at`) lock the account; any
//! attempt while locked is rejected until the cooldown passes, and a
//! successful login resets the counter.

use anyhow::{anyhow, Result};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::model::User;
use crate::store::Store;

/// Consecutive failures that lock the account.
const LOCK_THRESHOLD: u32 = 3;

fn lock_window() -> Duration {
    Duration::minutes(15)
}

fn token_ttl() -> Duration {
    Duration::days(30)
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("account temporarily locked")]
    AccountLocked,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
    #[error("unsupported token type")]
    WrongType,
    #[error("token missing subject")]
    MissingSubject,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug)]
pub struct LoginResult {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| anyhow!("password hashing failed: {err}"))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .and_then(|parsed| Argon2::default().verify_password(password.as_bytes(), &parsed))
        .is_ok()
}

/// Validates credentials and issues a 30-day access token.
pub async fn login(
    store: &Store,
    secret: &str,
    username: &str,
    password: &str,
    now: DateTime<Utc>,
) -> Result<LoginResult, AuthError> {
    let Some(mut user) = store.user_by_username(username).await? else {
        warn!(username, "login failed: unknown user");
        return Err(AuthError::InvalidCredentials);
    };
    if !user.is_active {
        warn!(username, "login failed: inactive account");
        return Err(AuthError::InvalidCredentials);
    }

    if user.pw_fail_count >= LOCK_THRESHOLD {
        if let Some(last_login) = user.last_login_at {
            if now - last_login < lock_window() {
                warn!(username, "login rejected: account locked");
                return Err(AuthError::AccountLocked);
            }
        }
        // Cooldown passed: the counter starts over.
        user.pw_fail_count = 0;
        info!(username, "lockout cooldown expired, counter reset");
    }

    user.last_login_at = Some(now);

    if !verify_password(password, &user.password_hash) {
        user.pw_fail_count += 1;
        store
            .update_login_state(user.id, user.pw_fail_count, now)
            .await?;
        warn!(username, fail_count = user.pw_fail_count, "login failed: bad password");
        return Err(AuthError::InvalidCredentials);
    }

    user.pw_fail_count = 0;
    store.update_login_state(user.id, 0, now).await?;

    let expires_at = now + token_ttl();
    let token = create_token(secret, &user.id.to_string(), now)?;
    info!(username, "login succeeded");
    Ok(LoginResult {
        token,
        expires_at,
        user,
    })
}

/// Signs an HS256 access token carrying `sub`, `iat`, `exp` and `type`.
pub fn create_token(secret: &str, subject: &str, issued_at: DateTime<Utc>) -> Result<String> {
    let claims = Claims {
        sub: subject.to_string(),
        token_type: "access".into(),
        iat: issued_at.timestamp(),
        exp: (issued_at + token_ttl()).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|err| anyhow!("token signing failed: {err}"))
}

/// Decodes and validates an access token.
pub fn decode_token(secret: &str, token: &str) -> Result<Claims, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp", "sub"]);

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|err| match err.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
        _ => TokenError::Invalid,
    })?;

    if data.claims.token_type != "access" {
        return Err(TokenError::WrongType);
    }
    if data.claims.sub.is_empty() {
        return Err(TokenError::MissingSubject);
    }
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SECRET: &str = "test-secret";

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    async fn store_with_user(password: &str) -> Store {
        let store = Store::in_memory().await.unwrap();
        let hash = hash_password(password).unwrap();
        store.create_user("alice", &hash).await.unwrap();
        store
    }

    #[test]
    fn password_hash_round_trips() {
        let hash = hash_password("secret123").unwrap();
        assert!(verify_password("secret123", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn token_round_trips() {
        let token = create_token(SECRET, "user-1", Utc::now()).unwrap();
        let claims = decode_token(SECRET, &token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.token_type, "access");
    }

    #[test]
    fn expired_token_is_rejected() {
        // Issued far enough in the past that even the 30-day TTL has lapsed.
        let old = fixed_now() - Duration::days(365);
        let token = create_token(SECRET, "user-1", old).unwrap();
        assert_eq!(decode_token(SECRET, &token), Err(TokenError::Expired));
    }

    #[test]
    fn wrong_secret_and_wrong_type_are_rejected() {
        let token = create_token(SECRET, "user-1", fixed_now()).unwrap();
        assert_eq!(decode_token("other", &token), Err(TokenError::Invalid));

        let claims = Claims {
            sub: "user-1".into(),
            token_type: "refresh".into(),
            iat: Utc::now().timestamp(),
            exp: (Utc::now() + Duration::hours(1)).timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert_eq!(decode_token(SECRET, &token), Err(TokenError::WrongType));
    }

    #[tokio::test]
    async fn successful_login_issues_token_and_resets_counter() {
        let store = store_with_user("secret123").await;
        let now = fixed_now();

        let result = login(&store, SECRET, "alice", "secret123", now)
            .await
            .unwrap();
        assert_eq!(result.expires_at, now + Duration::days(30));
        assert!(!result.token.is_empty());

        let user = store.user_by_username("alice").await.unwrap().unwrap();
        assert_eq!(user.pw_fail_count, 0);
        assert!(user.last_login_at.is_some());
    }

    #[tokio::test]
    async fn three_failures_lock_the_fourth_attempt() {
        let store = store_with_user("secret123").await;
        let mut now = fixed_now();

        for _ in 0..3 {
            let err = login(&store, SECRET, "alice", "wrong", now).await.unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredentials));
            now += Duration::minutes(1);
        }

        // The fourth attempt inside the window is rejected even with the
        // right password.
        let err = login(&store, SECRET, "alice", "secret123", now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccountLocked));
    }

    #[tokio::test]
    async fn cooldown_unlocks_and_resets_the_counter() {
        let store = store_with_user("secret123").await;
        let mut now = fixed_now();

        for _ in 0..3 {
            let _ = login(&store, SECRET, "alice", "wrong", now).await;
            now += Duration::minutes(1);
        }
        // 16 minutes after the third failure the lock has expired.
        now = fixed_now() + Duration::minutes(2) + Duration::minutes(16);

        let result = login(&store, SECRET, "alice", "secret123", now)
            .await
            .unwrap();
        assert_eq!(result.user.username, "alice");

        let user = store.user_by_username("alice").await.unwrap().unwrap();
        assert_eq!(user.pw_fail_count, 0);
    }

    #[tokio::test]
    async fn unknown_user_is_invalid_credentials() {
        let store = Store::in_memory().await.unwrap();
        let err = login(&store, SECRET, "nobody", "pw", fixed_now())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }
}
