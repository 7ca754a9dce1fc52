//! Per-agent execution bookkeeping for one task run.
//!
//! Trackers live inside the run driver and are never shared by
//! reference; the read side only ever sees [`AgentTrackingSnapshot`]
//! clones mirrored into `AppState`, so progress display tolerates a
//! slightly stale view without taking the driver's locks.

use serde::Serialize;

use crate::models::task_run::AssignmentStatus;
use crate::transport::{TokenUsage, ToolCallRecord};

/// One outgoing agent-to-agent delegation observed mid-assignment.
#[derive(Debug, Clone, Serialize)]
pub struct A2aCallRecord {
    pub target_agent_id: String,
    pub prompt: String,
    pub result: Option<String>,
}

pub struct AgentExecutionTracker {
    assignment_id: String,
    agent_id: String,
    agent_name: String,
    correlation_id: String,
    status: AssignmentStatus,
    streamed_output: String,
    tool_calls: Vec<ToolCallRecord>,
    a2a_calls: Vec<A2aCallRecord>,
    usage: TokenUsage,
    duration_ms: i64,
    error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentTrackingSnapshot {
    pub assignment_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub correlation_id: String,
    pub status: AssignmentStatus,
    pub streamed_output: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub a2a_calls: Vec<A2aCallRecord>,
    pub usage: TokenUsage,
    pub duration_ms: i64,
    pub error: Option<String>,
}

impl AgentExecutionTracker {
    pub fn new(
        assignment_id: &str,
        agent_id: &str,
        agent_name: &str,
        correlation_id: &str,
    ) -> Self {
        Self {
            assignment_id: assignment_id.to_string(),
            agent_id: agent_id.to_string(),
            agent_name: agent_name.to_string(),
            correlation_id: correlation_id.to_string(),
            status: AssignmentStatus::Running,
            streamed_output: String::new(),
            tool_calls: Vec::new(),
            a2a_calls: Vec::new(),
            usage: TokenUsage::default(),
            duration_ms: 0,
            error: None,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn status(&self) -> AssignmentStatus {
        self.status
    }

    pub fn streamed_output(&self) -> &str {
        &self.streamed_output
    }

    /// Append-only stream buffer.
    pub fn append_chunk(&mut self, text: &str) {
        self.streamed_output.push_str(text);
    }

    /// Keyed upsert: a record with a known id overwrites that entry
    /// (last write wins on status/output); unknown ids append.
    pub fn upsert_tool_call(&mut self, record: ToolCallRecord) {
        match self.tool_calls.iter_mut().find(|tc| tc.id == record.id) {
            Some(existing) => *existing = record,
            None => self.tool_calls.push(record),
        }
    }

    pub fn record_a2a_call(&mut self, target_agent_id: &str, prompt: &str) {
        self.a2a_calls.push(A2aCallRecord {
            target_agent_id: target_agent_id.to_string(),
            prompt: prompt.to_string(),
            result: None,
        });
    }

    pub fn record_a2a_result(&mut self, target_agent_id: &str, result: &str) {
        if let Some(call) = self
            .a2a_calls
            .iter_mut()
            .rev()
            .find(|c| c.target_agent_id == target_agent_id && c.result.is_none())
        {
            call.result = Some(result.to_string());
        }
    }

    /// Single terminal write. Later calls are ignored so a racing cancel
    /// cannot overwrite a recorded completion.
    pub fn finish(
        &mut self,
        status: AssignmentStatus,
        usage: TokenUsage,
        duration_ms: i64,
        error: Option<String>,
    ) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.usage = usage;
        self.duration_ms = duration_ms;
        self.error = error;
    }

    pub fn snapshot(&self) -> AgentTrackingSnapshot {
        AgentTrackingSnapshot {
            assignment_id: self.assignment_id.clone(),
            agent_id: self.agent_id.clone(),
            agent_name: self.agent_name.clone(),
            correlation_id: self.correlation_id.clone(),
            status: self.status,
            streamed_output: self.streamed_output.clone(),
            tool_calls: self.tool_calls.clone(),
            a2a_calls: self.a2a_calls.clone(),
            usage: self.usage,
            duration_ms: self.duration_ms,
            error: self.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_call(id: &str, status: &str) -> ToolCallRecord {
        ToolCallRecord {
            id: id.into(),
            name: "read_file".into(),
            title: String::new(),
            status: status.into(),
            raw_input: None,
            raw_output: None,
        }
    }

    #[test]
    fn chunks_append_in_order() {
        let mut tracker = AgentExecutionTracker::new("as-1", "ag-1", "Researcher", "orch:r:a");
        tracker.append_chunk("hello ");
        tracker.append_chunk("world");
        assert_eq!(tracker.streamed_output(), "hello world");
    }

    #[test]
    fn tool_call_upsert_is_keyed_and_last_write_wins() {
        let mut tracker = AgentExecutionTracker::new("as-1", "ag-1", "Researcher", "orch:r:a");
        tracker.upsert_tool_call(tool_call("tc-1", "in_progress"));
        tracker.upsert_tool_call(tool_call("tc-2", "in_progress"));
        tracker.upsert_tool_call(tool_call("tc-1", "completed"));

        let snap = tracker.snapshot();
        assert_eq!(snap.tool_calls.len(), 2);
        assert_eq!(snap.tool_calls[0].status, "completed");
    }

    #[test]
    fn terminal_write_is_single_shot() {
        let mut tracker = AgentExecutionTracker::new("as-1", "ag-1", "Researcher", "orch:r:a");
        tracker.finish(
            AssignmentStatus::Completed,
            TokenUsage {
                tokens_in: 10,
                tokens_out: 5,
                ..Default::default()
            },
            1200,
            None,
        );
        // A racing cancel after completion must not win.
        tracker.finish(
            AssignmentStatus::Cancelled,
            TokenUsage::default(),
            1300,
            Some("cancelled".into()),
        );

        let snap = tracker.snapshot();
        assert_eq!(snap.status, AssignmentStatus::Completed);
        assert_eq!(snap.usage.tokens_in, 10);
        assert!(snap.error.is_none());
    }

    #[test]
    fn a2a_result_attaches_to_open_call() {
        let mut tracker = AgentExecutionTracker::new("as-1", "ag-1", "Researcher", "orch:r:a");
        tracker.record_a2a_call("ag-2", "summarize this");
        tracker.record_a2a_result("ag-2", "done");
        let snap = tracker.snapshot();
        assert_eq!(snap.a2a_calls[0].result.as_deref(), Some("done"));
    }
}
