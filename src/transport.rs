//! Boundary to the per-agent call transport.
//!
//! The engine never talks to a concrete agent protocol; it hands an
//! [`InvokeRequest`] to an [`AgentTransport`] and consumes the returned
//! typed event stream. Payload validation happens here, at the boundary,
//! so everything downstream works with closed enums.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::AppResult;
use crate::models::agent::AgentConfig;

/// Token accounting reported by the transport on completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.tokens_in += other.tokens_in;
        self.tokens_out += other.tokens_out;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
    }
}

/// One tool invocation surfaced by an agent mid-call. Updates for the
/// same `id` supersede earlier status/output fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub title: String,
    pub status: String,
    #[serde(default)]
    pub raw_input: Option<serde_json::Value>,
    #[serde(default)]
    pub raw_output: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionOption {
    pub id: String,
    pub label: String,
}

/// A mid-call request for a human decision (e.g. a side-effecting tool).
/// The transport blocks the agent internally until `respond_permission`
/// is called with the matching `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    #[serde(default)]
    pub tool_call: Option<ToolCallRecord>,
    #[serde(default)]
    pub options: Vec<PermissionOption>,
}

/// Stream events for one agent call, delivered in transport order.
/// Exactly one of `Completed`/`Failed` ends the stream.
#[derive(Debug, Clone)]
pub enum AgentStreamEvent {
    Chunk { text: String },
    ToolCall(ToolCallRecord),
    ToolCallUpdate(ToolCallRecord),
    PermissionRequest(PermissionRequest),
    Completed {
        output: String,
        usage: TokenUsage,
        duration_ms: i64,
    },
    Failed { error: String },
}

/// One agent call. The `correlation_id` ties cancellation and permission
/// responses back to this call; the engine keys it as
/// `orch:{task_run_id}:{agent_id}` so each run gets its own sessions.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub correlation_id: String,
    pub agent: AgentConfig,
    pub input_text: String,
}

/// The delegated agent-call interface. Implementations spawn whatever
/// they need internally and feed the returned channel; `invoke` must not
/// block on the call itself.
pub trait AgentTransport: Send + Sync {
    fn invoke(&self, request: InvokeRequest) -> AppResult<mpsc::Receiver<AgentStreamEvent>>;

    /// Best-effort cooperative cancel of an in-flight call. The stream
    /// still terminates with `Completed` or `Failed`.
    fn cancel(&self, correlation_id: &str);

    /// Forward a human decision for a pending permission request.
    fn respond_permission(&self, correlation_id: &str, request_id: &str, option_id: &str);
}
