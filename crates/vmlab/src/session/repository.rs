//! Session database repository.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use vmlab_protocol::SessionStatus;

use super::models::Session;

const SESSION_COLUMNS: &str = r#"
    id, owner, template_id, status, console_endpoint, idle_timeout_minutes,
    auto_delete_minutes, last_active_at, created_at, started_at, stopped_at, error_message
"#;

#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, owner, template_id, status, console_endpoint, idle_timeout_minutes,
                auto_delete_minutes, last_active_at, created_at, started_at, stopped_at, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.owner)
        .bind(&session.template_id)
        .bind(session.status.to_string())
        .bind(&session.console_endpoint)
        .bind(session.idle_timeout_minutes)
        .bind(session.auto_delete_minutes)
        .bind(session.last_active_at)
        .bind(session.created_at)
        .bind(session.started_at)
        .bind(session.stopped_at)
        .bind(&session.error_message)
        .execute(&self.pool)
        .await
        .context("creating session")?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let query = format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS);
        let session = sqlx::query_as::<_, Session>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session")?;

        Ok(session)
    }

    /// All sessions, newest first.
    pub async fn list(&self) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions ORDER BY created_at DESC",
            SESSION_COLUMNS
        );
        let sessions = sqlx::query_as::<_, Session>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions")?;

        Ok(sessions)
    }

    pub async fn list_for_owner(&self, owner: &str) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE owner = ? ORDER BY created_at DESC",
            SESSION_COLUMNS
        );
        let sessions = sqlx::query_as::<_, Session>(&query)
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions for owner")?;

        Ok(sessions)
    }

    /// Sessions holding (or about to hold) resources for `owner`.
    pub async fn count_active_for_owner(&self, owner: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sessions WHERE owner = ? AND status IN ('pending', 'running', 'stopping')",
        )
        .bind(owner)
        .fetch_one(&self.pool)
        .await
        .context("counting active sessions for owner")?;

        Ok(count)
    }

    /// Sessions counted against the cluster-wide limit.
    pub async fn count_provisioned(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sessions WHERE status IN ('pending', 'running')",
        )
        .fetch_one(&self.pool)
        .await
        .context("counting provisioned sessions")?;

        Ok(count)
    }

    pub async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session status")?;

        Ok(())
    }

    /// `pending -> running`. Returns false if the session is no longer pending.
    pub async fn mark_running(&self, id: &str, console_endpoint: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'running', console_endpoint = ?, started_at = ?, error_message = NULL
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(console_endpoint)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking session running")?;

        Ok(result.rows_affected() > 0)
    }

    /// Move to a terminal status and record when.
    pub async fn mark_stopped(
        &self,
        id: &str,
        status: SessionStatus,
        now: i64,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET status = ?, stopped_at = ?, error_message = COALESCE(?, error_message)
            WHERE id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(now)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking session stopped")?;

        Ok(())
    }

    /// Back to `pending` for a restart with fresh activity.
    pub async fn mark_restarting(&self, id: &str, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'pending', console_endpoint = NULL, stopped_at = NULL,
                error_message = NULL, last_active_at = MAX(last_active_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking session restarting")?;

        Ok(())
    }

    /// Record activity at `at`. Never moves `last_active_at` backwards.
    ///
    /// Only pending or running sessions take activity. Returns the stored value,
    /// or `None` if no such session accepted it.
    pub async fn touch_activity(&self, id: &str, at: i64) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE sessions
            SET last_active_at = MAX(last_active_at, ?)
            WHERE id = ? AND status IN ('pending', 'running')
            RETURNING last_active_at
            "#,
        )
        .bind(at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("touching session activity")?;

        Ok(row.map(|(ts,)| ts))
    }

    /// Returns whether a row was removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;

        Ok(result.rows_affected() > 0)
    }
}
