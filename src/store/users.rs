//! User table access for login and token validation.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::{format_ts, parse_opt_ts, Store};
use crate::model::User;

fn user_from_row(row: &SqliteRow) -> Result<User> {
    let id: String = row.get("id");
    Ok(User {
        id: Uuid::parse_str(&id).context("bad user id column")?,
        username: row.get("username"),
        password_hash: row.get("password_hash"),
        is_active: row.get::<i64, _>("is_active") != 0,
        last_login_at: parse_opt_ts(row.get::<Option<String>, _>("last_login_at"))?,
        pw_fail_count: row.get::<i64, _>("pw_fail_count") as u32,
    })
}

impl Store {
    pub async fn create_user(&self, username: &str, password_hash: &str) -> Result<User> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO account_user (id, username, password_hash, is_active, created_at, pw_fail_count) \
             VALUES (?, ?, ?, 1, ?, 0)",
        )
        .bind(id.to_string())
        .bind(username)
        .bind(password_hash)
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .context("failed to insert user")?;

        self.user_by_username(username)
            .await?
            .context("user vanished after insert")
    }

    pub async fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM account_user WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .context("failed to query user")?;
        row.as_ref().map(user_from_row).transpose()
    }

    /// Persists the lockout bookkeeping columns after a login attempt.
    pub async fn update_login_state(
        &self,
        user_id: Uuid,
        pw_fail_count: u32,
        last_login_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE account_user SET pw_fail_count = ?, last_login_at = ? WHERE id = ?",
        )
        .bind(pw_fail_count as i64)
        .bind(format_ts(last_login_at))
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await
        .context("failed to update login state")?;
        Ok(())
    }
}
