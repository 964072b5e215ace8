//! Settings row persistence.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use vmlab_protocol::now_ms;

use super::models::RuntimeSettings;

#[derive(Debug, Clone)]
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The stored settings, `None` until an administrator saved some.
    pub async fn get(&self) -> Result<Option<RuntimeSettings>> {
        let settings = sqlx::query_as::<_, RuntimeSettings>(
            r#"
            SELECT max_concurrent_sessions, per_user_session_limit, default_idle_timeout_minutes
            FROM settings WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("fetching runtime settings")?;

        Ok(settings)
    }

    pub async fn save(&self, settings: &RuntimeSettings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (
                id, max_concurrent_sessions, per_user_session_limit,
                default_idle_timeout_minutes, updated_at
            ) VALUES (1, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                max_concurrent_sessions = excluded.max_concurrent_sessions,
                per_user_session_limit = excluded.per_user_session_limit,
                default_idle_timeout_minutes = excluded.default_idle_timeout_minutes,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(settings.max_concurrent_sessions)
        .bind(settings.per_user_session_limit)
        .bind(settings.default_idle_timeout_minutes)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .context("saving runtime settings")?;

        Ok(())
    }
}
