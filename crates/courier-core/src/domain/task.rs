use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

use super::action::TaskAction;
use super::ids::{TaskId, UserId};

/// One pending mutation: action + target + owner + what it waits for.
///
/// Identity is the `id`; two tasks with the same id are the same task even
/// when their dependency lists have drifted apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: TaskId,

    /// Message or conversation id; empty for user-scoped actions.
    pub target_id: String,

    pub action: TaskAction,

    pub user_id: UserId,

    /// Tasks that must leave the store before this one may run.
    #[serde(default)]
    pub dependency_ids: Vec<TaskId>,

    #[serde(default)]
    pub is_conversation: bool,
}

impl QueuedTask {
    pub fn new(
        id: TaskId,
        target_id: impl Into<String>,
        action: TaskAction,
        user_id: UserId,
    ) -> Self {
        Self {
            id,
            target_id: target_id.into(),
            action,
            user_id,
            dependency_ids: Vec::new(),
            is_conversation: false,
        }
    }

    pub fn with_conversation_scope(mut self, is_conversation: bool) -> Self {
        self.is_conversation = is_conversation;
        self
    }

    pub fn with_dependencies(mut self, dependency_ids: Vec<TaskId>) -> Self {
        self.dependency_ids = dependency_ids;
        self
    }

    pub fn is_blocked(&self) -> bool {
        !self.dependency_ids.is_empty()
    }

    pub fn depends_on(&self, id: TaskId) -> bool {
        self.dependency_ids.contains(&id)
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueuedTask {}

impl Hash for QueuedTask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
