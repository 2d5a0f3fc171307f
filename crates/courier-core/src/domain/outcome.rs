//! TaskResult: what a handler reports back after executing a task.
//!
//! This module is policy-agnostic: it only defines the "shape" of results.
//! What happens to the store for each variant is decided by the drain
//! engine (`app::drain`).

use serde::{Deserialize, Serialize};

/// Follow-up the coordinator should apply to the originating lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultAction {
    /// Done; remove the task and keep draining.
    None,

    /// Done; delete dependents outright, then give the read queue a turn.
    CheckReadQueue,

    /// Could not reach the server; stop draining.
    ConnectionIssue,

    /// Failed for good; delete the task and everything that depends on it.
    RemoveRelated,

    /// Keep the task at the head. The handler owns the backoff.
    Retry,
}

/// A handler's report for one dispatched task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub action: ResultAction,

    /// Free-form context for logs. Never surfaced to callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TaskResult {
    pub fn new(action: ResultAction) -> Self {
        Self {
            action,
            reason: None,
        }
    }

    pub fn none() -> Self {
        Self::new(ResultAction::None)
    }

    pub fn check_read_queue() -> Self {
        Self::new(ResultAction::CheckReadQueue)
    }

    pub fn connection_issue() -> Self {
        Self::new(ResultAction::ConnectionIssue)
    }

    pub fn remove_related(reason: impl Into<String>) -> Self {
        Self::new(ResultAction::RemoveRelated).with_reason(reason)
    }

    pub fn retry() -> Self {
        Self::new(ResultAction::Retry)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Whether the lane should keep draining after this result.
    pub fn continues_draining(&self) -> bool {
        self.action != ResultAction::ConnectionIssue
    }
}

impl Default for TaskResult {
    fn default() -> Self {
        Self::none()
    }
}
