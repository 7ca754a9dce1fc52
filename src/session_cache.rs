//! Per-workspace UI session snapshots.
//!
//! When the user switches workspaces, the caller stashes the leaving
//! workspace's session slice here and takes the entering workspace's
//! slice back out. State is replaced wholesale, never partially merged,
//! and nothing in here touches live orchestration state, so a run in
//! workspace A keeps executing while the user views workspace B.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// The bounded session slice worth preserving across a workspace switch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSessionState {
    pub watched_task_run_id: Option<String>,
    pub selected_agent_id: Option<String>,
    pub draft_prompt: String,
    pub expanded_assignment_ids: Vec<String>,
}

#[derive(Default)]
pub struct WorkspaceSessionCache {
    slots: Mutex<HashMap<String, WorkspaceSessionState>>,
}

impl WorkspaceSessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the session slice for a workspace the user is leaving,
    /// replacing any previous snapshot for that workspace.
    pub fn stash(&self, workspace_id: &str, state: WorkspaceSessionState) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.insert(workspace_id.to_string(), state);
    }

    /// Remove and return the snapshot for a workspace the user is
    /// entering. `None` means a fresh session.
    pub fn take(&self, workspace_id: &str) -> Option<WorkspaceSessionState> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.remove(workspace_id)
    }

    /// Read-only look without consuming the snapshot.
    pub fn peek(&self, workspace_id: &str) -> Option<WorkspaceSessionState> {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.get(workspace_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(draft: &str) -> WorkspaceSessionState {
        WorkspaceSessionState {
            draft_prompt: draft.into(),
            ..Default::default()
        }
    }

    #[test]
    fn take_consumes_the_snapshot() {
        let cache = WorkspaceSessionCache::new();
        cache.stash("ws-a", state("hello"));
        assert_eq!(cache.take("ws-a"), Some(state("hello")));
        assert_eq!(cache.take("ws-a"), None);
    }

    #[test]
    fn stash_replaces_wholesale() {
        let cache = WorkspaceSessionCache::new();
        cache.stash("ws-a", state("first"));
        cache.stash("ws-a", state("second"));
        assert_eq!(cache.peek("ws-a"), Some(state("second")));
    }

    #[test]
    fn workspaces_are_independent() {
        let cache = WorkspaceSessionCache::new();
        cache.stash("ws-a", state("a"));
        cache.stash("ws-b", state("b"));
        assert_eq!(cache.take("ws-b"), Some(state("b")));
        assert_eq!(cache.peek("ws-a"), Some(state("a")));
    }
}
