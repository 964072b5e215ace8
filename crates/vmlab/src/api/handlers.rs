//! API request handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;
use vmlab_protocol::api::{ActivityReport, Disposal, TerminateRequest, TerminateResponse, TerminateResult};
use vmlab_protocol::{SessionInfo, now_ms};

use crate::auth::{CurrentUser, RequireAdmin};
use crate::reaper::ReaperReport;
use crate::session::{Session, TerminateOutcome};
use crate::settings::{ConcurrencySettings, IdleTimeoutSettings, RuntimeSettings};
use crate::template::{CreateTemplateRequest, Template, UpdateTemplateRequest};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn not_found(session_id: &str) -> ApiError {
    ApiError::not_found(format!("session {} not found", session_id))
}

fn terminate_result(session_id: String, outcome: TerminateOutcome) -> TerminateResult {
    TerminateResult {
        session_id,
        ok: true,
        status: Some(outcome.status),
        error: None,
    }
}

/// Look up a session the caller may act on. Foreign sessions read as missing.
async fn visible_session(state: &AppState, user: &CurrentUser, session_id: &str) -> ApiResult<Session> {
    state
        .sessions
        .get_visible(user.id(), user.is_admin(), session_id)
        .await?
        .ok_or_else(|| not_found(session_id))
}

// ============================================================================
// Templates
// ============================================================================

/// Templates the caller may start.
#[instrument(skip(state))]
pub async fn list_templates(State(state): State<AppState>) -> ApiResult<Json<Vec<Template>>> {
    Ok(Json(state.templates.list_enabled().await?))
}

/// Start a session from a template.
#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn start_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(template_id): Path<String>,
) -> ApiResult<(StatusCode, Json<SessionInfo>)> {
    let session = state.sessions.start_session(user.id(), &template_id).await?;
    info!(session_id = %session.id, status = %session.status, "Started session");
    Ok((StatusCode::CREATED, Json(session.info())))
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ListSessionsQuery {
    /// Count this poll as activity on pending/running sessions.
    #[serde(default)]
    pub touch: bool,
}

/// The caller's sessions.
#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn list_sessions(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<ListSessionsQuery>,
) -> ApiResult<Json<Vec<SessionInfo>>> {
    let sessions = state.sessions.list_for_owner(user.id(), query.touch).await?;
    Ok(Json(sessions.iter().map(Session::info).collect()))
}

#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn get_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionInfo>> {
    let session = visible_session(&state, &user, &session_id).await?;
    Ok(Json(session.info()))
}

#[derive(Debug, Serialize)]
pub struct ActivityResponse {
    pub last_active_at: i64,
}

/// Record user activity. The stored timestamp never moves backwards.
#[instrument(skip(state, user, report), fields(user_id = %user.id()))]
pub async fn report_activity(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    Json(report): Json<ActivityReport>,
) -> ApiResult<Json<ActivityResponse>> {
    let session = visible_session(&state, &user, &session_id).await?;

    let last_active_at = state
        .sessions
        .report_activity(&session.id, report.timestamp)
        .await?
        .ok_or_else(|| {
            ApiError::Conflict(format!(
                "session {} is {} and does not accept activity",
                session.id, session.status
            ))
        })?;

    Ok(Json(ActivityResponse { last_active_at }))
}

/// Stop a session. Absent or already stopped sessions succeed.
#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn stop_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<TerminateResult>> {
    terminate_visible(&state, &user, session_id, Disposal::Stop).await
}

/// Delete a session, stopping it first if needed. Absent sessions succeed.
#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn delete_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<TerminateResult>> {
    terminate_visible(&state, &user, session_id, Disposal::Delete).await
}

async fn terminate_visible(
    state: &AppState,
    user: &CurrentUser,
    session_id: String,
    disposal: Disposal,
) -> ApiResult<Json<TerminateResult>> {
    let visible = state
        .sessions
        .get_visible(user.id(), user.is_admin(), &session_id)
        .await?;

    let outcome = match visible {
        Some(_) => state.sessions.terminate(&session_id, disposal).await?,
        None => TerminateOutcome {
            previous: None,
            status: vmlab_protocol::SessionStatus::Deleted,
        },
    };

    if outcome.changed() {
        info!(session_id = %session_id, status = %outcome.status, "Terminated session");
    }
    Ok(Json(terminate_result(session_id, outcome)))
}

/// Restart a stopped or completed session.
#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn restart_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionInfo>> {
    visible_session(&state, &user, &session_id).await?;
    let session = state.sessions.restart_session(&session_id).await?;
    info!(session_id = %session_id, status = %session.status, "Restarted session");
    Ok(Json(session.info()))
}

/// Terminate several sessions. Always 200; inspect `results` for failures.
#[instrument(skip(state, user, request), fields(user_id = %user.id(), count = request.session_ids.len()))]
pub async fn terminate_sessions(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<TerminateRequest>,
) -> ApiResult<Json<TerminateResponse>> {
    let results = state
        .sessions
        .terminate_batch(
            user.id(),
            user.is_admin(),
            &request.session_ids,
            request.disposal,
        )
        .await;

    Ok(Json(TerminateResponse { results }))
}

// ============================================================================
// Admin
// ============================================================================

/// Every session on the server.
#[instrument(skip(state, _admin))]
pub async fn admin_list_sessions(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
) -> ApiResult<Json<Vec<SessionInfo>>> {
    let sessions = state.sessions.list_sessions().await?;
    Ok(Json(sessions.iter().map(Session::info).collect()))
}

#[instrument(skip(state, admin), fields(admin = %admin.id()))]
pub async fn admin_stop_session(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(session_id): Path<String>,
) -> ApiResult<Json<TerminateResult>> {
    let outcome = state.sessions.stop_session(&session_id).await?;
    info!(session_id = %session_id, "Admin stopped session");
    Ok(Json(terminate_result(session_id, outcome)))
}

#[instrument(skip(state, admin), fields(admin = %admin.id()))]
pub async fn admin_delete_session(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(session_id): Path<String>,
) -> ApiResult<Json<TerminateResult>> {
    let outcome = state.sessions.delete_session(&session_id).await?;
    info!(session_id = %session_id, "Admin deleted session");
    Ok(Json(terminate_result(session_id, outcome)))
}

/// Run one reaper sweep now.
#[instrument(skip(state, admin), fields(admin = %admin.id()))]
pub async fn admin_run_reaper(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
) -> ApiResult<Json<ReaperReport>> {
    let report = state.reaper.tick(now_ms()).await?;
    Ok(Json(report))
}

#[instrument(skip(state, _admin))]
pub async fn admin_list_templates(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
) -> ApiResult<Json<Vec<Template>>> {
    Ok(Json(state.templates.list().await?))
}

#[instrument(skip(state, admin, request), fields(admin = %admin.id(), name = %request.name))]
pub async fn admin_create_template(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Json(request): Json<CreateTemplateRequest>,
) -> ApiResult<(StatusCode, Json<Template>)> {
    let default_idle_timeout = state
        .sessions
        .runtime_settings()
        .await?
        .default_idle_timeout_minutes;
    let template =
        request.into_template(Uuid::new_v4().to_string(), now_ms(), default_idle_timeout);
    template.validate()?;
    state.templates.create(&template).await?;
    info!(template_id = %template.id, "Created template");
    Ok((StatusCode::CREATED, Json(template)))
}

#[instrument(skip(state, admin, request), fields(admin = %admin.id()))]
pub async fn admin_update_template(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(template_id): Path<String>,
    Json(request): Json<UpdateTemplateRequest>,
) -> ApiResult<Json<Template>> {
    let existing = state
        .templates
        .get(&template_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("template {} not found", template_id)))?;

    let template = request.apply(existing);
    template.validate()?;
    state.templates.update(&template).await?;
    info!(template_id = %template.id, enabled = template.enabled, "Updated template");
    Ok(Json(template))
}

#[instrument(skip(state, admin), fields(admin = %admin.id()))]
pub async fn admin_delete_template(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(template_id): Path<String>,
) -> ApiResult<StatusCode> {
    if !state.templates.delete(&template_id).await? {
        return Err(ApiError::not_found(format!(
            "template {} not found",
            template_id
        )));
    }
    info!(template_id = %template_id, "Deleted template");
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Runtime settings
// ============================================================================

#[instrument(skip(state, _admin))]
pub async fn admin_get_settings(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
) -> ApiResult<Json<RuntimeSettings>> {
    Ok(Json(state.sessions.runtime_settings().await?))
}

#[instrument(skip(state, admin), fields(admin = %admin.id()))]
pub async fn admin_update_concurrency(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Json(request): Json<ConcurrencySettings>,
) -> ApiResult<Json<RuntimeSettings>> {
    Ok(Json(state.sessions.update_concurrency(request).await?))
}

/// Default idle timeout for templates created without one.
#[instrument(skip(state, admin), fields(admin = %admin.id()))]
pub async fn admin_update_idle_timeout(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Json(request): Json<IdleTimeoutSettings>,
) -> ApiResult<Json<RuntimeSettings>> {
    Ok(Json(state.sessions.update_default_idle_timeout(request).await?))
}
