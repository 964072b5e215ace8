//! Session lifecycle service.

use anyhow::{Result, anyhow, bail};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vmlab_protocol::api::{Disposal, TerminateResult};
use vmlab_protocol::{SessionStatus, now_ms};

use super::models::Session;
use super::repository::SessionRepository;
use crate::orchestrator::{OrchestratorApi, OrchestratorError, Phase, ProvisionRequest, VmState};
use crate::settings::{ConcurrencySettings, IdleTimeoutSettings, RuntimeSettings, SettingsRepository};
use crate::template::{DEFAULT_IDLE_TIMEOUT_MINUTES, Template, TemplateRepository};

#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    /// Cluster-wide cap on pending + running sessions, until overridden at runtime.
    pub max_concurrent_sessions: i64,
    /// Active sessions one user may hold at once, until overridden at runtime.
    pub per_user_session_limit: i64,
    /// How long a VM may take to become reachable before it is discarded.
    pub provisioning_timeout: Duration,
    pub provisioning_poll_interval: Duration,
    /// Honor `touch=true` on session listing as activity.
    pub touch_on_list: bool,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: SessionService::DEFAULT_MAX_CONCURRENT_SESSIONS,
            per_user_session_limit: 1,
            provisioning_timeout: Duration::from_secs(300),
            provisioning_poll_interval: Duration::from_secs(2),
            touch_on_list: true,
        }
    }
}

/// Result of a stop or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminateOutcome {
    /// Status before the call; `None` if the session did not exist.
    pub previous: Option<SessionStatus>,
    /// Status after the call; `Deleted` once the record is gone.
    pub status: SessionStatus,
}

impl TerminateOutcome {
    fn absent() -> Self {
        Self {
            previous: None,
            status: SessionStatus::Deleted,
        }
    }

    /// Whether this call changed anything.
    pub fn changed(&self) -> bool {
        self.previous != Some(self.status) && self.previous.is_some()
    }
}

/// Owns every session state transition.
#[derive(Clone)]
pub struct SessionService {
    repo: SessionRepository,
    templates: TemplateRepository,
    settings: SettingsRepository,
    orchestrator: Arc<dyn OrchestratorApi>,
    config: SessionServiceConfig,
    /// Serializes transitions per session id (and per owner for starts).
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    /// Provisioning watchers by session id.
    watchers: Arc<DashMap<String, CancellationToken>>,
}

impl SessionService {
    pub const DEFAULT_MAX_CONCURRENT_SESSIONS: i64 = 50;

    pub fn new(
        repo: SessionRepository,
        templates: TemplateRepository,
        settings: SettingsRepository,
        orchestrator: Arc<dyn OrchestratorApi>,
        config: SessionServiceConfig,
    ) -> Self {
        Self {
            repo,
            templates,
            settings,
            orchestrator,
            config,
            locks: Arc::new(DashMap::new()),
            watchers: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionServiceConfig {
        &self.config
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }

    /// Limits in force: the stored settings row, else the config file.
    pub async fn runtime_settings(&self) -> Result<RuntimeSettings> {
        Ok(self.settings.get().await?.unwrap_or(RuntimeSettings {
            max_concurrent_sessions: self.config.max_concurrent_sessions,
            per_user_session_limit: self.config.per_user_session_limit,
            default_idle_timeout_minutes: DEFAULT_IDLE_TIMEOUT_MINUTES,
        }))
    }

    pub async fn update_concurrency(&self, update: ConcurrencySettings) -> Result<RuntimeSettings> {
        let settings = update.apply(self.runtime_settings().await?);
        settings.validate()?;
        self.settings.save(&settings).await?;
        info!(
            "Session limits set to {} cluster-wide, {} per user",
            settings.max_concurrent_sessions, settings.per_user_session_limit
        );
        Ok(settings)
    }

    pub async fn update_default_idle_timeout(
        &self,
        update: IdleTimeoutSettings,
    ) -> Result<RuntimeSettings> {
        let settings = update.apply(self.runtime_settings().await?);
        settings.validate()?;
        self.settings.save(&settings).await?;
        info!(
            "Default idle timeout set to {} min",
            settings.default_idle_timeout_minutes
        );
        Ok(settings)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.repo.get(session_id).await
    }

    /// The session if `user_id` may see it. Other users' sessions read as absent.
    pub async fn get_visible(
        &self,
        user_id: &str,
        is_admin: bool,
        session_id: &str,
    ) -> Result<Option<Session>> {
        Ok(self
            .repo
            .get(session_id)
            .await?
            .filter(|s| is_admin || s.owner == user_id))
    }

    /// Every session, as stored.
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.repo.list().await
    }

    /// The owner's sessions, reconciled with the orchestrator.
    ///
    /// With `touch`, pending and running sessions count the listing as activity.
    pub async fn list_for_owner(&self, owner: &str, touch: bool) -> Result<Vec<Session>> {
        let touch = touch && self.config.touch_on_list;
        let now = now_ms();
        let stored = self.repo.list_for_owner(owner).await?;

        let vms = if stored.iter().any(|s| s.status == SessionStatus::Running) {
            match self.orchestrator.list_vms(Some(owner)).await {
                Ok(vms) => Some(
                    vms.into_iter()
                        .map(|vm| (vm.session_id.clone(), vm))
                        .collect::<HashMap<_, _>>(),
                ),
                Err(e) => {
                    debug!("Could not reconcile sessions for {}: {}", owner, e);
                    None
                }
            }
        } else {
            None
        };

        let mut sessions = Vec::with_capacity(stored.len());
        for session in stored {
            let mut session = match &vms {
                Some(vms) => {
                    let vm = vms.get(&session.id);
                    self.reconcile(session, vm).await?
                }
                None => session,
            };
            if touch && session.status.counts_for_idle() {
                if let Some(ts) = self.touch(&session.id, now).await? {
                    session.last_active_at = ts;
                }
            }
            sessions.push(session);
        }

        Ok(sessions)
    }

    /// Pick up VMs that stopped on their own. `vm` is `None` when the
    /// orchestrator no longer lists the session.
    async fn reconcile(&self, mut session: Session, vm: Option<&VmState>) -> Result<Session> {
        if session.status != SessionStatus::Running {
            return Ok(session);
        }

        let observed = match vm {
            Some(state) => match state.phase.session_status() {
                Some(status) if status.is_terminal() => Some((status, state.message.clone())),
                _ => None,
            },
            None => Some((
                SessionStatus::Stopped,
                Some("VM no longer exists".to_string()),
            )),
        };

        if let Some((status, message)) = observed {
            let now = now_ms();
            warn!(
                "Session {} is {} on the orchestrator, marking {}",
                session.id, status, status
            );
            self.repo
                .mark_stopped(&session.id, status, now, message.as_deref())
                .await?;
            session.status = status;
            session.stopped_at = Some(now);
            if message.is_some() {
                session.error_message = message;
            }
        }

        Ok(session)
    }

    async fn startable_template(&self, template_id: &str) -> Result<Template> {
        self.templates
            .get(template_id)
            .await?
            .filter(|t| t.enabled)
            .ok_or_else(|| anyhow!("template not found or disabled: {}", template_id))
    }

    async fn check_limits(&self, owner: &str) -> Result<()> {
        let limits = self.runtime_settings().await?;
        if self.repo.count_active_for_owner(owner).await? >= limits.per_user_session_limit {
            bail!(
                "session limit reached: you already have an active session. Delete it before starting a new one."
            );
        }
        if self.repo.count_provisioned().await? >= limits.max_concurrent_sessions {
            bail!("cluster session limit reached, try again later");
        }
        Ok(())
    }

    /// Start a new session from a template.
    ///
    /// Returns once the orchestrator accepted the request; the session is
    /// `pending` until a watcher sees the console come up.
    pub async fn start_session(&self, owner: &str, template_id: &str) -> Result<Session> {
        let template = self.startable_template(template_id).await?;

        let owner_lock = self.lock_for(&format!("owner:{}", owner));
        let _guard = owner_lock.lock().await;
        self.check_limits(owner).await?;

        let now = now_ms();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            template_id: template.id.clone(),
            status: SessionStatus::Pending,
            console_endpoint: None,
            idle_timeout_minutes: template.idle_timeout_minutes,
            auto_delete_minutes: template.auto_delete_minutes,
            last_active_at: now,
            created_at: now,
            started_at: None,
            stopped_at: None,
            error_message: None,
        };
        self.repo.create(&session).await?;
        info!(
            "Starting session {} for {} from template {}",
            session.id, owner, template.id
        );

        let request = ProvisionRequest::for_template(&session.id, owner, &template);
        self.provision(&request).await?;

        self.repo
            .get(&session.id)
            .await?
            .ok_or_else(|| anyhow!("session not found: {}", session.id))
    }

    /// Bring a stopped or completed session back up.
    pub async fn restart_session(&self, session_id: &str) -> Result<Session> {
        // The owner never changes, so it can be read before locking.
        let owner = self
            .repo
            .get(session_id)
            .await?
            .ok_or_else(|| anyhow!("session not found: {}", session_id))?
            .owner;

        let owner_lock = self.lock_for(&format!("owner:{}", owner));
        let _owner_guard = owner_lock.lock().await;
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let session = self
            .repo
            .get(session_id)
            .await?
            .ok_or_else(|| anyhow!("session not found: {}", session_id))?;
        if !matches!(
            session.status,
            SessionStatus::Stopped | SessionStatus::Completed
        ) {
            bail!("cannot restart a session that is {}", session.status);
        }

        let template = self.startable_template(&session.template_id).await?;
        self.check_limits(&session.owner).await?;

        match self.orchestrator.delete_vm(session_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("Failed to clear old VM for session {}: {}", session_id, e),
        }

        info!("Restarting session {}", session_id);
        self.repo.mark_restarting(session_id, now_ms()).await?;

        let request = ProvisionRequest::for_template(session_id, &session.owner, &template);
        self.provision(&request).await?;

        self.repo
            .get(session_id)
            .await?
            .ok_or_else(|| anyhow!("session not found: {}", session_id))
    }

    /// Ask the orchestrator for the VM. On failure nothing of the session is kept.
    async fn provision(&self, request: &ProvisionRequest) -> Result<()> {
        let session_id = request.session_id.as_str();
        let state = match self.orchestrator.start_vm(request).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Orchestrator rejected session {}: {}", session_id, e);
                self.discard(session_id).await;
                bail!("orchestrator failed to start VM: {}", e);
            }
        };

        match (state.phase, state.console_endpoint.as_deref()) {
            (Phase::Running, Some(endpoint)) => {
                self.repo.mark_running(session_id, endpoint, now_ms()).await?;
                info!("Session {} is running", session_id);
            }
            (Phase::Failed | Phase::Succeeded, _) => {
                self.discard(session_id).await;
                bail!(
                    "orchestrator failed to start VM: {}",
                    state.message.as_deref().unwrap_or("VM exited during startup")
                );
            }
            _ => self.spawn_provisioning_watch(session_id.to_string()),
        }

        Ok(())
    }

    /// Remove every trace of a session that never came up.
    async fn discard(&self, session_id: &str) {
        match self.orchestrator.delete_vm(session_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(
                "Failed to delete VM for discarded session {}: {}",
                session_id, e
            ),
        }
        if let Err(e) = self.repo.delete(session_id).await {
            warn!("Failed to remove discarded session {}: {:?}", session_id, e);
        }
    }

    /// Whether a watcher is still waiting for this session to come up.
    pub fn is_provisioning(&self, session_id: &str) -> bool {
        self.watchers.contains_key(session_id)
    }

    fn cancel_watch(&self, session_id: &str) {
        if let Some((_, token)) = self.watchers.remove(session_id) {
            token.cancel();
        }
    }

    fn spawn_provisioning_watch(&self, session_id: String) {
        let token = CancellationToken::new();
        if let Some(previous) = self.watchers.insert(session_id.clone(), token.clone()) {
            previous.cancel();
        }

        let service = self.clone();
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + service.config.provisioning_timeout;
            let outcome = tokio::select! {
                _ = token.cancelled() => None,
                outcome = service.await_ready(&session_id, deadline) => Some(outcome),
            };

            token.cancel();
            service
                .watchers
                .remove_if(&session_id, |_, t| t.is_cancelled());

            match outcome {
                None => debug!("Provisioning watch for {} cancelled", session_id),
                Some(Ok(())) => {}
                Some(Err(reason)) => {
                    if let Err(e) = service.abandon_provisioning(&session_id, &reason).await {
                        warn!(
                            "Failed to clean up session {} after provisioning failure: {:?}",
                            session_id, e
                        );
                    }
                }
            }
        });
    }

    async fn await_ready(
        &self,
        session_id: &str,
        deadline: tokio::time::Instant,
    ) -> Result<(), String> {
        loop {
            tokio::time::sleep(self.config.provisioning_poll_interval).await;

            match self.orchestrator.vm_state(session_id).await {
                Ok(state) => match (state.phase, state.console_endpoint.as_deref()) {
                    (Phase::Running, Some(endpoint)) => {
                        return match self.repo.mark_running(session_id, endpoint, now_ms()).await {
                            Ok(true) => {
                                info!("Session {} is running", session_id);
                                Ok(())
                            }
                            Ok(false) => {
                                debug!("Session {} left pending before it came up", session_id);
                                Ok(())
                            }
                            Err(e) => Err(e.to_string()),
                        };
                    }
                    (Phase::Failed | Phase::Succeeded, _) => {
                        return Err(format!(
                            "VM ended during provisioning: {}",
                            state.message.unwrap_or_default()
                        ));
                    }
                    _ => {}
                },
                Err(OrchestratorError::NotFound(_)) => {
                    return Err("VM disappeared during provisioning".to_string());
                }
                Err(e) => warn!("Provisioning check for {} failed: {}", session_id, e),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err("provisioning timed out".to_string());
            }
        }
    }

    /// Drop a session stuck in `pending`. No-op once it left `pending`.
    pub async fn abandon_provisioning(&self, session_id: &str, reason: &str) -> Result<bool> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let pending = self
            .repo
            .get(session_id)
            .await?
            .is_some_and(|s| s.status == SessionStatus::Pending);
        if !pending {
            return Ok(false);
        }

        warn!("Abandoning session {}: {}", session_id, reason);
        self.cancel_watch(session_id);
        self.discard(session_id).await;
        Ok(true)
    }

    /// Record user activity at `at` (Unix ms, client clock).
    ///
    /// Timestamps from the future are clamped to now. Returns the stored
    /// `last_active_at`, or `None` if the session does not take activity.
    pub async fn report_activity(&self, session_id: &str, at: i64) -> Result<Option<i64>> {
        let at = at.min(now_ms());
        self.touch(session_id, at).await
    }

    /// Move `last_active_at` forward under the session lock, so a disposal
    /// that already decided the session is idle sees the new value.
    async fn touch(&self, session_id: &str, at: i64) -> Result<Option<i64>> {
        let lock = self.lock_for(session_id);
        let touched = {
            let _guard = lock.lock().await;
            self.repo.touch_activity(session_id, at).await?
        };
        if touched.is_none() {
            drop(lock);
            self.locks
                .remove_if(session_id, |_, l| Arc::strong_count(l) == 1);
        }
        Ok(touched)
    }

    /// Stop a session. Absent or already terminal sessions are left alone.
    ///
    /// If the orchestrator fails the session stays `stopping` and the error is
    /// returned; the reaper retries it.
    pub async fn stop_session(&self, session_id: &str) -> Result<TerminateOutcome> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let Some(session) = self.repo.get(session_id).await? else {
            debug!("Stop of absent session {}", session_id);
            return Ok(TerminateOutcome::absent());
        };
        self.stop_locked(session).await
    }

    /// Caller holds the session lock.
    async fn stop_locked(&self, session: Session) -> Result<TerminateOutcome> {
        let session_id = session.id.as_str();
        if session.is_terminal() {
            debug!("Session {} is already {}", session_id, session.status);
            return Ok(TerminateOutcome {
                previous: Some(session.status),
                status: session.status,
            });
        }

        info!("Stopping session {} ({})", session_id, session.status);
        self.cancel_watch(session_id);
        self.repo
            .update_status(session_id, SessionStatus::Stopping)
            .await?;

        match self.orchestrator.stop_vm(session_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("VM for session {} already gone", session_id),
            Err(e) => {
                warn!("Failed to stop session {}: {}", session_id, e);
                bail!("orchestrator failed to stop session {}: {}", session_id, e);
            }
        }

        self.repo
            .mark_stopped(session_id, SessionStatus::Stopped, now_ms(), None)
            .await?;
        info!("Session {} stopped", session_id);

        Ok(TerminateOutcome {
            previous: Some(session.status),
            status: SessionStatus::Stopped,
        })
    }

    /// Delete a session, stopping it first if it still runs. Absent sessions are success.
    ///
    /// If the orchestrator cannot release the VM the record is kept (as
    /// `stopping` when it was active) so the reaper can retry.
    pub async fn delete_session(&self, session_id: &str) -> Result<TerminateOutcome> {
        let lock = self.lock_for(session_id);
        let guard = lock.lock().await;

        let Some(session) = self.repo.get(session_id).await? else {
            debug!("Delete of absent session {}", session_id);
            return Ok(TerminateOutcome::absent());
        };
        let outcome = self.delete_locked(session).await?;
        drop(guard);
        self.locks.remove(session_id);
        Ok(outcome)
    }

    /// Caller holds the session lock and drops it from `locks` afterwards.
    async fn delete_locked(&self, session: Session) -> Result<TerminateOutcome> {
        let session_id = session.id.as_str();
        self.cancel_watch(session_id);

        if session.is_active() {
            match self.orchestrator.stop_vm(session_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Best-effort stop of session {} failed: {}", session_id, e),
            }
        }

        match self.orchestrator.delete_vm(session_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("VM for session {} already deleted", session_id),
            Err(e) => {
                warn!("Failed to delete VM for session {}: {}", session_id, e);
                if session.is_active() {
                    self.repo
                        .update_status(session_id, SessionStatus::Stopping)
                        .await?;
                }
                bail!("orchestrator failed to delete session {}: {}", session_id, e);
            }
        }

        self.repo.delete(session_id).await?;
        info!("Deleted session {}", session_id);

        Ok(TerminateOutcome {
            previous: Some(session.status),
            status: SessionStatus::Deleted,
        })
    }

    pub async fn terminate(&self, session_id: &str, disposal: Disposal) -> Result<TerminateOutcome> {
        match disposal {
            Disposal::Stop => self.stop_session(session_id).await,
            Disposal::Delete => self.delete_session(session_id).await,
        }
    }

    /// Terminate the session only if it is still running and idle at `now`.
    ///
    /// The row is re-read under the session lock, so activity recorded after
    /// the caller's snapshot keeps the session alive. Returns `None` when
    /// nothing was done.
    pub async fn terminate_if_idle(
        &self,
        session_id: &str,
        now: i64,
        disposal: Disposal,
    ) -> Result<Option<TerminateOutcome>> {
        let lock = self.lock_for(session_id);
        let guard = lock.lock().await;

        let Some(session) = self.repo.get(session_id).await? else {
            return Ok(None);
        };
        if !session.is_idle_expired(now) {
            debug!(
                "Session {} is {} with activity at {}, not idle any more",
                session_id, session.status, session.last_active_at
            );
            return Ok(None);
        }

        let outcome = match disposal {
            Disposal::Stop => self.stop_locked(session).await?,
            Disposal::Delete => {
                let outcome = self.delete_locked(session).await?;
                drop(guard);
                self.locks.remove(session_id);
                outcome
            }
        };
        Ok(Some(outcome))
    }

    /// Terminate several sessions, reporting each one separately.
    ///
    /// Sessions the requester may not see are treated as absent.
    pub async fn terminate_batch(
        &self,
        user_id: &str,
        is_admin: bool,
        session_ids: &[String],
        disposal: Disposal,
    ) -> Vec<TerminateResult> {
        let tasks = session_ids.iter().map(|session_id| async move {
            let result = match self.get_visible(user_id, is_admin, session_id).await {
                Ok(Some(_)) => self.terminate(session_id, disposal).await,
                Ok(None) => Ok(TerminateOutcome::absent()),
                Err(e) => Err(e),
            };

            match result {
                Ok(outcome) => TerminateResult {
                    session_id: session_id.clone(),
                    ok: true,
                    status: Some(outcome.status),
                    error: None,
                },
                Err(e) => {
                    warn!("Batch {} of session {} failed: {}", disposal, session_id, e);
                    TerminateResult {
                        session_id: session_id.clone(),
                        ok: false,
                        status: None,
                        error: Some(e.to_string()),
                    }
                }
            }
        });

        futures::future::join_all(tasks).await
    }

    /// Cancel all provisioning watchers.
    pub fn shutdown(&self) {
        for entry in self.watchers.iter() {
            entry.value().cancel();
        }
        self.watchers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::orchestrator::OrchestratorResult;
    use crate::session::models::{MINUTE_MS, test_session};
    use crate::template::{NetworkMode, OsType};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakeOrchestrator {
        vms: StdMutex<HashMap<String, VmState>>,
        calls: StdMutex<Vec<String>>,
        /// VMs come up on the first status poll instead of immediately.
        slow_start: AtomicBool,
        /// VMs never come up.
        stuck: AtomicBool,
        fail_start: AtomicBool,
        fail_stop: AtomicBool,
        fail_delete: AtomicBool,
    }

    impl FakeOrchestrator {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn running(session_id: &str, owner: Option<String>) -> VmState {
            VmState {
                session_id: session_id.to_string(),
                owner,
                phase: Phase::Running,
                console_endpoint: Some(format!("https://console.test/{}", session_id)),
                message: None,
            }
        }

        fn unavailable() -> OrchestratorError {
            OrchestratorError::ConnectionFailed {
                url: "http://orchestrator.test".to_string(),
                message: "connection refused".to_string(),
            }
        }
    }

    #[async_trait]
    impl OrchestratorApi for FakeOrchestrator {
        async fn start_vm(&self, request: &ProvisionRequest) -> OrchestratorResult<VmState> {
            self.record(format!("start:{}", request.session_id));
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(Self::unavailable());
            }
            let state = if self.slow_start.load(Ordering::SeqCst) || self.stuck.load(Ordering::SeqCst)
            {
                VmState {
                    session_id: request.session_id.clone(),
                    owner: Some(request.owner.clone()),
                    phase: Phase::Pending,
                    console_endpoint: None,
                    message: None,
                }
            } else {
                Self::running(&request.session_id, Some(request.owner.clone()))
            };
            self.vms
                .lock()
                .unwrap()
                .insert(request.session_id.clone(), state.clone());
            Ok(state)
        }

        async fn vm_state(&self, session_id: &str) -> OrchestratorResult<VmState> {
            let mut vms = self.vms.lock().unwrap();
            let state = vms
                .get_mut(session_id)
                .ok_or_else(|| OrchestratorError::NotFound(session_id.to_string()))?;
            if state.phase == Phase::Pending && !self.stuck.load(Ordering::SeqCst) {
                *state = Self::running(session_id, state.owner.take());
            }
            Ok(state.clone())
        }

        async fn list_vms(&self, owner: Option<&str>) -> OrchestratorResult<Vec<VmState>> {
            Ok(self
                .vms
                .lock()
                .unwrap()
                .values()
                .filter(|vm| owner.is_none_or(|o| vm.owner.as_deref() == Some(o)))
                .cloned()
                .collect())
        }

        async fn stop_vm(&self, session_id: &str) -> OrchestratorResult<()> {
            self.record(format!("stop:{}", session_id));
            if self.fail_stop.load(Ordering::SeqCst) {
                return Err(Self::unavailable());
            }
            let mut vms = self.vms.lock().unwrap();
            let state = vms
                .get_mut(session_id)
                .ok_or_else(|| OrchestratorError::NotFound(session_id.to_string()))?;
            state.phase = Phase::Succeeded;
            Ok(())
        }

        async fn delete_vm(&self, session_id: &str) -> OrchestratorResult<()> {
            self.record(format!("delete:{}", session_id));
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(Self::unavailable());
            }
            self.vms
                .lock()
                .unwrap()
                .remove(session_id)
                .map(|_| ())
                .ok_or_else(|| OrchestratorError::NotFound(session_id.to_string()))
        }
    }

    fn template(id: &str, enabled: bool) -> Template {
        Template {
            id: id.to_string(),
            name: "Ubuntu".to_string(),
            description: None,
            os_type: OsType::Linux,
            image_id: "img".to_string(),
            cpu_cores: 2,
            ram_mb: 2048,
            idle_timeout_minutes: 30,
            auto_delete_minutes: 5,
            network_mode: NetworkMode::Bridge,
            enabled,
            created_at: 0,
        }
    }

    async fn setup_with(
        config: SessionServiceConfig,
    ) -> (SessionService, SessionRepository, Arc<FakeOrchestrator>) {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());
        let templates = TemplateRepository::new(db.pool().clone());
        templates.create(&template("t1", true)).await.unwrap();
        templates.create(&template("off", false)).await.unwrap();

        let fake = Arc::new(FakeOrchestrator::default());
        let orchestrator: Arc<dyn OrchestratorApi> = fake.clone();
        let settings = SettingsRepository::new(db.pool().clone());
        let service = SessionService::new(repo.clone(), templates, settings, orchestrator, config);
        (service, repo, fake)
    }

    async fn setup() -> (SessionService, SessionRepository, Arc<FakeOrchestrator>) {
        setup_with(SessionServiceConfig {
            provisioning_poll_interval: Duration::from_millis(10),
            provisioning_timeout: Duration::from_millis(200),
            ..SessionServiceConfig::default()
        })
        .await
    }

    /// Poll until the stored session matches `expected` (`None` = removed).
    async fn wait_for_status(repo: &SessionRepository, id: &str, expected: Option<SessionStatus>) {
        for _ in 0..200 {
            let status = repo.get(id).await.unwrap().map(|s| s.status);
            if status == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {id} never reached {expected:?}");
    }

    #[tokio::test]
    async fn test_start_resolves_template_limits() {
        let (service, _, _) = setup().await;
        let session = service.start_session("alice", "t1").await.unwrap();

        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.idle_timeout_minutes, 30);
        assert_eq!(session.auto_delete_minutes, 5);
        assert!(session.console_endpoint.is_some());
    }

    #[tokio::test]
    async fn test_watcher_promotes_pending_session() {
        let (service, repo, fake) = setup().await;
        fake.slow_start.store(true, Ordering::SeqCst);

        let session = service.start_session("alice", "t1").await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert!(session.console_endpoint.is_none());

        wait_for_status(&repo, &session.id, Some(SessionStatus::Running)).await;
        let running = repo.get(&session.id).await.unwrap().unwrap();
        assert!(running.console_endpoint.is_some());
        assert!(running.started_at.is_some());
    }

    #[tokio::test]
    async fn test_provisioning_timeout_leaves_no_record() {
        let (service, repo, fake) = setup().await;
        fake.stuck.store(true, Ordering::SeqCst);

        let session = service.start_session("alice", "t1").await.unwrap();
        wait_for_status(&repo, &session.id, None).await;

        assert!(fake.calls().contains(&format!("delete:{}", session.id)));
    }

    #[tokio::test]
    async fn test_start_failure_leaves_no_record() {
        let (service, repo, fake) = setup().await;
        fake.fail_start.store(true, Ordering::SeqCst);

        let err = service.start_session("alice", "t1").await.unwrap_err();
        assert!(err.to_string().starts_with("orchestrator"));
        assert!(repo.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_limits() {
        let (service, _, _) = setup().await;
        service.start_session("alice", "t1").await.unwrap();

        let err = service.start_session("alice", "t1").await.unwrap_err();
        assert!(err.to_string().contains("limit reached"));

        let err = service.start_session("bob", "off").await.unwrap_err();
        assert!(err.to_string().contains("not found or disabled"));
    }

    #[tokio::test]
    async fn test_cluster_limit() {
        let (service, _, _) = setup_with(SessionServiceConfig {
            max_concurrent_sessions: 1,
            ..SessionServiceConfig::default()
        })
        .await;
        service.start_session("alice", "t1").await.unwrap();

        let err = service.start_session("bob", "t1").await.unwrap_err();
        assert!(err.to_string().contains("cluster session limit"));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (service, _, fake) = setup().await;
        let session = service.start_session("alice", "t1").await.unwrap();

        let first = service.stop_session(&session.id).await.unwrap();
        assert_eq!(first.previous, Some(SessionStatus::Running));
        assert_eq!(first.status, SessionStatus::Stopped);
        assert!(first.changed());

        let second = service.stop_session(&session.id).await.unwrap();
        assert_eq!(second.status, SessionStatus::Stopped);
        assert!(!second.changed());

        let stops = fake.calls().iter().filter(|c| c.starts_with("stop:")).count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn test_stop_treats_missing_vm_as_stopped() {
        let (service, repo, _) = setup().await;
        repo.create(&test_session("ghost", "alice", SessionStatus::Running, now_ms()))
            .await
            .unwrap();

        let outcome = service.stop_session("ghost").await.unwrap();
        assert_eq!(outcome.status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_failure_keeps_stopping() {
        let (service, repo, fake) = setup().await;
        let session = service.start_session("alice", "t1").await.unwrap();
        fake.fail_stop.store(true, Ordering::SeqCst);

        assert!(service.stop_session(&session.id).await.is_err());
        let stored = repo.get(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Stopping);
    }

    #[tokio::test]
    async fn test_delete_stops_running_session_first() {
        let (service, repo, fake) = setup().await;
        let session = service.start_session("alice", "t1").await.unwrap();

        let outcome = service.delete_session(&session.id).await.unwrap();
        assert_eq!(outcome.status, SessionStatus::Deleted);
        assert!(repo.get(&session.id).await.unwrap().is_none());

        let calls = fake.calls();
        let stop = calls.iter().position(|c| *c == format!("stop:{}", session.id));
        let delete = calls.iter().position(|c| *c == format!("delete:{}", session.id));
        assert!(stop.unwrap() < delete.unwrap());
    }

    #[tokio::test]
    async fn test_delete_absent_is_success() {
        let (service, _, fake) = setup().await;
        let session = service.start_session("alice", "t1").await.unwrap();

        service.delete_session(&session.id).await.unwrap();
        let again = service.delete_session(&session.id).await.unwrap();
        assert_eq!(again.previous, None);
        assert_eq!(again.status, SessionStatus::Deleted);

        let deletes = fake.calls().iter().filter(|c| c.starts_with("delete:")).count();
        assert_eq!(deletes, 1);

        assert!(service.delete_session("never-existed").await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_record_for_retry() {
        let (service, repo, fake) = setup().await;
        let session = service.start_session("alice", "t1").await.unwrap();
        fake.fail_delete.store(true, Ordering::SeqCst);

        assert!(service.delete_session(&session.id).await.is_err());
        let stored = repo.get(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Stopping);

        fake.fail_delete.store(false, Ordering::SeqCst);
        service.delete_session(&session.id).await.unwrap();
        assert!(repo.get(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_cancels_provisioning_watch() {
        let (service, _, fake) = setup().await;
        fake.stuck.store(true, Ordering::SeqCst);
        let session = service.start_session("alice", "t1").await.unwrap();
        assert!(service.is_provisioning(&session.id));

        service.delete_session(&session.id).await.unwrap();
        assert!(!service.is_provisioning(&session.id));
    }

    #[tokio::test]
    async fn test_report_activity_clamps_and_never_rewinds() {
        let (service, _, _) = setup().await;
        let session = service.start_session("alice", "t1").await.unwrap();

        let far_future = now_ms() + 24 * 3_600_000;
        let stored = service
            .report_activity(&session.id, far_future)
            .await
            .unwrap()
            .unwrap();
        assert!(stored < far_future);

        let rewound = service
            .report_activity(&session.id, session.last_active_at - 60_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rewound, stored);
    }

    #[tokio::test]
    async fn test_list_reconciles_vanished_vm() {
        let (service, repo, _) = setup().await;
        repo.create(&test_session("ghost", "alice", SessionStatus::Running, now_ms()))
            .await
            .unwrap();

        let sessions = service.list_for_owner("alice", false).await.unwrap();
        assert_eq!(sessions[0].status, SessionStatus::Stopped);
        assert_eq!(sessions[0].error_message.as_deref(), Some("VM no longer exists"));
    }

    #[tokio::test]
    async fn test_list_picks_up_vm_that_exited() {
        let (service, repo, orchestrator) = setup().await;
        let session = service.start_session("alice", "t1").await.unwrap();
        service.start_session("bob", "t1").await.unwrap();
        wait_for_status(&repo, &session.id, Some(SessionStatus::Running)).await;

        if let Some(vm) = orchestrator.vms.lock().unwrap().get_mut(&session.id) {
            vm.phase = Phase::Succeeded;
        }

        let sessions = service.list_for_owner("alice", false).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Completed);
        assert!(sessions[0].stopped_at.is_some());
    }

    #[tokio::test]
    async fn test_list_with_touch_counts_as_activity() {
        let (service, repo, _) = setup().await;
        let session = service.start_session("alice", "t1").await.unwrap();

        let before = repo.get(&session.id).await.unwrap().unwrap().last_active_at;
        tokio::time::sleep(Duration::from_millis(5)).await;
        service.list_for_owner("alice", false).await.unwrap();
        assert_eq!(repo.get(&session.id).await.unwrap().unwrap().last_active_at, before);

        let listed = service.list_for_owner("alice", true).await.unwrap();
        assert!(listed[0].last_active_at > before);
    }

    #[tokio::test]
    async fn test_restart_stopped_session() {
        let (service, _, _) = setup().await;
        let session = service.start_session("alice", "t1").await.unwrap();
        service.stop_session(&session.id).await.unwrap();

        let restarted = service.restart_session(&session.id).await.unwrap();
        assert_eq!(restarted.status, SessionStatus::Running);
        assert!(restarted.stopped_at.is_none());

        let err = service.restart_session(&session.id).await.unwrap_err();
        assert!(err.to_string().contains("cannot restart"));
    }

    #[tokio::test]
    async fn test_batch_reports_partial_failure() {
        let (service, repo, fake) = setup().await;
        let ok = service.start_session("alice", "t1").await.unwrap();
        repo.create(&test_session("stuck", "alice", SessionStatus::Running, now_ms()))
            .await
            .unwrap();
        fake.vms
            .lock()
            .unwrap()
            .insert("stuck".to_string(), FakeOrchestrator::running("stuck", Some("alice".to_string())));
        repo.create(&test_session("other", "bob", SessionStatus::Running, now_ms()))
            .await
            .unwrap();

        let ids = vec![ok.id.clone(), "other".to_string(), "missing".to_string()];
        let results = service
            .terminate_batch("alice", false, &ids, Disposal::Delete)
            .await;
        assert!(results.iter().all(|r| r.ok));
        // bob's session is invisible to alice and must be untouched.
        assert!(repo.get("other").await.unwrap().is_some());

        fake.fail_delete.store(true, Ordering::SeqCst);
        let results = service
            .terminate_batch("alice", false, &["stuck".to_string()], Disposal::Delete)
            .await;
        assert!(!results[0].ok);
        assert!(results[0].error.as_deref().unwrap().contains("orchestrator"));
    }

    #[tokio::test]
    async fn test_activity_after_snapshot_blocks_idle_termination() {
        let (service, repo, fake) = setup().await;
        let stale = now_ms() - 31 * MINUTE_MS;
        repo.create(&test_session("s1", "alice", SessionStatus::Running, stale))
            .await
            .unwrap();
        let snapshot = repo.get("s1").await.unwrap().unwrap();
        assert!(snapshot.is_idle_expired(now_ms()));

        // The user comes back after the sweep read the row.
        service.report_activity("s1", now_ms()).await.unwrap();

        let outcome = service
            .terminate_if_idle("s1", now_ms(), Disposal::Delete)
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(
            repo.get("s1").await.unwrap().unwrap().status,
            SessionStatus::Running
        );
        assert!(fake.calls().is_empty());

        let outcome = service
            .terminate_if_idle("s1", now_ms() + 31 * MINUTE_MS, Disposal::Stop)
            .await
            .unwrap();
        assert_eq!(outcome.map(|o| o.status), Some(SessionStatus::Stopped));
    }

    #[tokio::test]
    async fn test_runtime_settings_override_config() {
        let (service, _, _) = setup().await;
        let defaults = service.runtime_settings().await.unwrap();
        assert_eq!(defaults.per_user_session_limit, 1);
        assert_eq!(defaults.default_idle_timeout_minutes, 30);

        let updated = service
            .update_concurrency(ConcurrencySettings {
                max_concurrent_sessions: 10,
                per_user_session_limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(updated.default_idle_timeout_minutes, 30);

        service.start_session("alice", "t1").await.unwrap();
        service.start_session("alice", "t1").await.unwrap();
        let err = service.start_session("alice", "t1").await.unwrap_err();
        assert!(err.to_string().contains("limit reached"));

        let err = service
            .update_default_idle_timeout(IdleTimeoutSettings {
                idle_timeout_minutes: 0,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("invalid settings"));
        assert_eq!(service.runtime_settings().await.unwrap(), updated);
    }

    #[tokio::test]
    async fn test_restart_racing_delete_leaves_nothing_behind() {
        let (service, repo, fake) = setup().await;
        let session = service.start_session("alice", "t1").await.unwrap();
        service.stop_session(&session.id).await.unwrap();

        let (restarted, deleted) = tokio::join!(
            service.restart_session(&session.id),
            service.delete_session(&session.id)
        );
        deleted.unwrap();
        if let Err(e) = restarted {
            assert!(e.to_string().contains("not found"), "{e}");
        }

        assert!(repo.get(&session.id).await.unwrap().is_none());
        assert!(!fake.vms.lock().unwrap().contains_key(&session.id));
    }
}
