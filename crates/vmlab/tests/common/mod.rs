//! Test utilities and common setup.

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

use vmlab::api;
use vmlab::auth::{AuthConfig, AuthState, DevUser, Role};
use vmlab::db::Database;
use vmlab::orchestrator::{
    OrchestratorApi, OrchestratorError, OrchestratorResult, Phase, ProvisionRequest, VmState,
};
use vmlab::reaper::{Reaper, ReaperConfig};
use vmlab::session::{SessionRepository, SessionService, SessionServiceConfig};
use vmlab::settings::SettingsRepository;
use vmlab::template::{NetworkMode, OsType, Template, TemplateRepository};

/// In-memory orchestrator. VMs are running as soon as they are requested.
#[derive(Default)]
pub struct FakeOrchestrator {
    pub vms: Mutex<HashMap<String, VmState>>,
    pub calls: Mutex<Vec<String>>,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_delete: AtomicBool,
    /// Held by a test to park `delete_vm` calls after they are recorded.
    pub hold_delete: tokio::sync::Mutex<()>,
}

impl FakeOrchestrator {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn has_vm(&self, session_id: &str) -> bool {
        self.vms.lock().unwrap().contains_key(session_id)
    }

    /// Simulate the VM vanishing behind the server's back.
    pub fn forget(&self, session_id: &str) {
        self.vms.lock().unwrap().remove(session_id);
    }

    pub fn set_failing(&self, stop: bool, delete: bool) {
        self.fail_stop.store(stop, Ordering::SeqCst);
        self.fail_delete.store(delete, Ordering::SeqCst);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn unavailable() -> OrchestratorError {
        OrchestratorError::Api {
            status: 503,
            message: "orchestrator overloaded".to_string(),
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
        let state = VmState {
            session_id: request.session_id.clone(),
            owner: Some(request.owner.clone()),
            phase: Phase::Running,
            console_endpoint: Some(format!("https://console.test/{}", request.session_id)),
            message: None,
        };
        self.vms
            .lock()
            .unwrap()
            .insert(request.session_id.clone(), state.clone());
        Ok(state)
    }

    async fn vm_state(&self, session_id: &str) -> OrchestratorResult<VmState> {
        self.vms
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(session_id.to_string()))
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
        let vm = vms
            .get_mut(session_id)
            .ok_or_else(|| OrchestratorError::NotFound(session_id.to_string()))?;
        vm.phase = Phase::Succeeded;
        Ok(())
    }

    async fn delete_vm(&self, session_id: &str) -> OrchestratorResult<()> {
        self.record(format!("delete:{}", session_id));
        let _released = self.hold_delete.lock().await;
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

pub struct TestApp {
    pub router: Router,
    pub sessions: SessionService,
    pub repo: SessionRepository,
    pub templates: TemplateRepository,
    pub reaper: Arc<Reaper>,
    pub orchestrator: Arc<FakeOrchestrator>,
}

fn test_auth_config() -> AuthConfig {
    let dev_user = |id: &str, role| DevUser {
        id: id.to_string(),
        name: id.to_string(),
        role,
    };

    AuthConfig {
        dev_mode: true,
        jwt_secret: Some("test-secret-for-integration-tests-minimum-32-chars".to_string()),
        dev_users: vec![
            dev_user("alice", Role::User),
            dev_user("bob", Role::User),
            dev_user("admin", Role::Admin),
        ],
        ..AuthConfig::default()
    }
}

pub fn template(id: &str, idle_timeout_minutes: i64) -> Template {
    Template {
        id: id.to_string(),
        name: format!("Template {id}"),
        description: None,
        os_type: OsType::Linux,
        image_id: "img-ubuntu".to_string(),
        cpu_cores: 2,
        ram_mb: 4096,
        idle_timeout_minutes,
        auto_delete_minutes: 5,
        network_mode: NetworkMode::Bridge,
        enabled: true,
        created_at: 0,
    }
}

/// App over an in-memory database with template `t1` (30 min idle timeout).
pub async fn test_app() -> TestApp {
    test_app_with(SessionServiceConfig::default()).await
}

pub async fn test_app_with(config: SessionServiceConfig) -> TestApp {
    let db = Database::in_memory().await.unwrap();
    let repo = SessionRepository::new(db.pool().clone());
    let templates = TemplateRepository::new(db.pool().clone());
    templates.create(&template("t1", 30)).await.unwrap();

    let orchestrator = Arc::new(FakeOrchestrator::default());
    let api_orchestrator: Arc<dyn OrchestratorApi> = orchestrator.clone();
    let sessions = SessionService::new(
        repo.clone(),
        templates.clone(),
        SettingsRepository::new(db.pool().clone()),
        api_orchestrator,
        config,
    );
    let reaper = Arc::new(Reaper::new(
        sessions.clone(),
        ReaperConfig {
            interval: Duration::from_secs(60),
            ..ReaperConfig::default()
        },
    ));

    let state = api::AppState::new(
        sessions.clone(),
        templates.clone(),
        reaper.clone(),
        AuthState::new(test_auth_config()),
    );

    TestApp {
        router: api::create_router(state),
        sessions,
        repo,
        templates,
        reaper,
        orchestrator,
    }
}

impl TestApp {
    /// Send a request as `user` (dev-mode header) and decode the JSON body.
    ///
    /// Empty bodies decode as `Value::Null`.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().uri(uri).method(method);
        if let Some(user) = user {
            builder = builder.header("X-Dev-User", user);
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&json).unwrap())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    /// Start a session from `t1` as `user` and return its id.
    pub async fn start(&self, user: &str) -> String {
        let (status, json) = self
            .request(Method::POST, "/templates/t1/start", Some(user), None)
            .await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        json["id"].as_str().unwrap().to_string()
    }
}
