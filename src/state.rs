use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::events::EventBus;
use crate::orchestrator::tracker::AgentTrackingSnapshot;
use crate::session_cache::WorkspaceSessionCache;
use crate::transport::AgentTransport;

/// User decision delivered to a run waiting at the confirmation gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationAction {
    Confirm,
    RegenerateAgent(String),
    RegenerateAll,
}

/// An orchestration currently owned by a driver task.
pub struct ActiveRun {
    pub workspace_id: Option<String>,
    pub cancel_token: CancellationToken,
}

/// A permission prompt waiting for a human decision, keyed by
/// `(task_run_id, request_id)`.
pub struct PendingPermission {
    pub agent_id: String,
    pub correlation_id: String,
}

pub struct AppState {
    /// SQLite database connection.
    pub db: Arc<std::sync::Mutex<Connection>>,
    /// The delegated agent-call interface.
    pub transport: Arc<dyn AgentTransport>,
    /// Outward progress event fan-out.
    pub events: EventBus,
    /// Active orchestration runs with their cancellation tokens.
    pub active_task_runs: Arc<Mutex<HashMap<String, ActiveRun>>>,
    /// Per-agent child cancellation tokens keyed by (task_run_id, agent_id).
    pub agent_cancellations: Arc<Mutex<HashMap<(String, String), CancellationToken>>>,
    /// Runs paused at the confirmation gate.
    pub pending_confirmations: Arc<Mutex<HashMap<String, oneshot::Sender<ConfirmationAction>>>>,
    /// Mid-call permission prompts awaiting a decision.
    pub pending_permissions: Arc<Mutex<HashMap<(String, String), PendingPermission>>>,
    /// Read-side mirrors of per-agent execution trackers, per run.
    pub tracker_snapshots: Arc<Mutex<HashMap<String, Vec<AgentTrackingSnapshot>>>>,
    /// Stashed UI session slices per workspace.
    pub session_cache: Arc<WorkspaceSessionCache>,
}

impl AppState {
    pub fn new(conn: Connection, transport: Arc<dyn AgentTransport>) -> Self {
        Self {
            db: Arc::new(std::sync::Mutex::new(conn)),
            transport,
            events: EventBus::new(),
            active_task_runs: Arc::new(Mutex::new(HashMap::new())),
            agent_cancellations: Arc::new(Mutex::new(HashMap::new())),
            pending_confirmations: Arc::new(Mutex::new(HashMap::new())),
            pending_permissions: Arc::new(Mutex::new(HashMap::new())),
            tracker_snapshots: Arc::new(Mutex::new(HashMap::new())),
            session_cache: Arc::new(WorkspaceSessionCache::new()),
        }
    }
}

// Implement Clone manually to allow state sharing in spawned tasks
impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            transport: Arc::clone(&self.transport),
            events: self.events.clone(),
            active_task_runs: Arc::clone(&self.active_task_runs),
            agent_cancellations: Arc::clone(&self.agent_cancellations),
            pending_confirmations: Arc::clone(&self.pending_confirmations),
            pending_permissions: Arc::clone(&self.pending_permissions),
            tracker_snapshots: Arc::clone(&self.tracker_snapshots),
            session_cache: Arc::clone(&self.session_cache),
        }
    }
}
