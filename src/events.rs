//! Outward progress events.
//!
//! Everything the engine tells the outside world goes through one closed
//! enum, fanned out over a broadcast channel. Delivery is at-least-once
//! from the consumer's point of view (a lagged subscriber may observe a
//! replay after resubscribing), so consumers reconcile by id.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::task_run::{AssignmentStatus, TaskPlan};
use crate::orchestrator::validator::PlanValidation;
use crate::transport::{PermissionOption, TokenUsage, ToolCallRecord};

#[derive(Debug, Clone, Serialize)]
pub struct AgentOutputSummary {
    pub agent_id: String,
    pub agent_name: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    Started {
        task_run_id: String,
        workspace_id: Option<String>,
    },
    PlanReady {
        task_run_id: String,
        plan: TaskPlan,
    },
    PlanValidated {
        task_run_id: String,
        validation: PlanValidation,
    },
    AgentStarted {
        task_run_id: String,
        assignment_id: String,
        agent_id: String,
        agent_name: String,
        model: String,
        sequence_order: i64,
        is_regeneration: bool,
    },
    AgentChunk {
        task_run_id: String,
        agent_id: String,
        text: String,
    },
    AgentToolCall {
        task_run_id: String,
        agent_id: String,
        tool_call: ToolCallRecord,
    },
    AgentA2aCall {
        task_run_id: String,
        caller_agent_id: String,
        target_agent_id: String,
        prompt: String,
    },
    AgentCompleted {
        task_run_id: String,
        assignment_id: String,
        agent_id: String,
        agent_name: String,
        status: AssignmentStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        usage: TokenUsage,
        duration_ms: i64,
    },
    AwaitingConfirmation {
        task_run_id: String,
        agent_outputs: Vec<AgentOutputSummary>,
    },
    PermissionRequest {
        task_run_id: String,
        agent_id: String,
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_call: Option<ToolCallRecord>,
        options: Vec<PermissionOption>,
    },
    Completed {
        task_run_id: String,
        summary: String,
        total_duration_ms: i64,
        usage: TokenUsage,
    },
    Error {
        task_run_id: String,
        error: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestrationEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.tx.subscribe()
    }

    /// No subscribers is fine; the send result is intentionally ignored.
    pub fn publish(&self, event: OrchestrationEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
