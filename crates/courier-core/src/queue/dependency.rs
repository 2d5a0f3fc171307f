//! Dependency bookkeeping between tasks of the same lane.
//!
//! Edges live on the tasks themselves (`QueuedTask::dependency_ids`), so the
//! persisted blob is the whole graph. Two resolution paths exist and are kept
//! apart on purpose:
//! - `resolve`: a dependency *has been* satisfied (its task left the store);
//!   strip its id from same-target waiters.
//! - `remove_dependents`: a dependency *can never* be satisfied; delete every
//!   waiter outright.
//!
//! Only the store passed in is scanned. Dependencies are only ever created
//! inside the message lane (saveDraft/send chains).

use super::store::TaskStore;
use crate::domain::{QueuedTask, TaskId};

/// Ids of every queued task targeting `target_id`, head first.
pub async fn pending_ids_for_target(store: &TaskStore, target_id: &str) -> Vec<TaskId> {
    store
        .entries()
        .await
        .into_iter()
        .filter(|(_, t)| t.target_id == target_id)
        .map(|(id, _)| id)
        .collect()
}

/// Strip `removed.id` from the dependency lists of same-target tasks.
///
/// Returns the number of tasks that were waiting on it.
pub async fn resolve(store: &TaskStore, removed: &QueuedTask) -> usize {
    let id = removed.id;
    store
        .update_where(|t| {
            if t.target_id != removed.target_id || !t.depends_on(id) {
                return false;
            }
            t.dependency_ids.retain(|dep| *dep != id);
            true
        })
        .await
}

/// Delete every task that lists `id` as a dependency.
pub async fn remove_dependents(store: &TaskStore, id: TaskId) -> Vec<QueuedTask> {
    store.remove_where(|t| t.depends_on(id)).await
}
