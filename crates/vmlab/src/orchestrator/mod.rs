//! External VM orchestrator.
//!
//! The orchestrator owns pods, images and network policy. This module only
//! speaks to it: provision, query, stop and delete by session id.

mod client;
mod error;

pub use client::HttpOrchestrator;
pub use error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vmlab_protocol::SessionStatus;

use crate::template::{NetworkMode, OsType, Template};

/// What the orchestrator needs to bring up one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub session_id: String,
    pub owner: String,
    pub image_id: String,
    pub os_type: OsType,
    pub cpu_cores: i64,
    pub ram_mb: i64,
    pub network_mode: NetworkMode,
}

impl ProvisionRequest {
    pub fn for_template(session_id: &str, owner: &str, template: &Template) -> Self {
        Self {
            session_id: session_id.to_string(),
            owner: owner.to_string(),
            image_id: template.image_id.clone(),
            os_type: template.os_type,
            cpu_cores: template.cpu_cores,
            ram_mb: template.ram_mb,
            network_mode: template.network_mode,
        }
    }
}

/// Orchestrator-side phase of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

impl Phase {
    /// Session status implied by this phase, if it implies one.
    ///
    /// `Failed` collapses to `stopped`: the VM is gone and only deletion remains.
    pub fn session_status(self) -> Option<SessionStatus> {
        match self {
            Phase::Pending => Some(SessionStatus::Pending),
            Phase::Running => Some(SessionStatus::Running),
            Phase::Succeeded => Some(SessionStatus::Completed),
            Phase::Failed => Some(SessionStatus::Stopped),
            Phase::Unknown => None,
        }
    }
}

/// Orchestrator view of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmState {
    pub session_id: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub phase: Phase,
    /// Set once the console is reachable.
    #[serde(default)]
    pub console_endpoint: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl VmState {
    /// Ready means running with a reachable console.
    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Running && self.console_endpoint.is_some()
    }
}

#[async_trait]
pub trait OrchestratorApi: Send + Sync {
    /// Request a VM. Returns immediately; readiness is observed via `vm_state`.
    async fn start_vm(&self, request: &ProvisionRequest) -> OrchestratorResult<VmState>;

    async fn vm_state(&self, session_id: &str) -> OrchestratorResult<VmState>;

    /// Every VM the orchestrator knows, optionally only one owner's.
    async fn list_vms(&self, owner: Option<&str>) -> OrchestratorResult<Vec<VmState>>;

    /// Stop the VM. `NotFound` means it is already gone.
    async fn stop_vm(&self, session_id: &str) -> OrchestratorResult<()>;

    /// Release every resource for the VM. `NotFound` means already deleted.
    async fn delete_vm(&self, session_id: &str) -> OrchestratorResult<()>;
}
