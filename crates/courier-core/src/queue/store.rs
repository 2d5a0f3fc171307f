//! Durable ordered store.
//!
//! Design:
//! - Insertion order is the dispatch order (FIFO), except for explicit
//!   `insert` at an index.
//! - Every mutation happens under the store's own lock and re-serializes the
//!   whole list before the lock is released, so snapshots hit disk in order.
//! - Persistence failures are logged, never returned: the in-memory list
//!   stays authoritative for the life of the process.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use super::persistence::BlobFile;
use crate::domain::{QueuedTask, TaskId};

/// One record: `(id, item)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEntry<T> {
    pub id: TaskId,
    pub item: T,
}

/// Where a store keeps its snapshot.
#[derive(Debug, Clone)]
pub enum StoreLocation {
    /// Versioned blob on disk.
    File(BlobFile),
    /// Memory only (sandboxed extension contexts, tests).
    InMemory,
}

/// The queue's persistent list of pending tasks.
pub type TaskStore = DurableStore<QueuedTask>;

pub struct DurableStore<T> {
    entries: Mutex<Vec<StoreEntry<T>>>,
    blob: Option<BlobFile>,
}

impl<T> DurableStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open a store, restoring whatever snapshot the location holds.
    pub async fn open(location: StoreLocation) -> Self {
        match location {
            StoreLocation::File(blob) => {
                let entries = blob.load_or_empty().await;
                Self {
                    entries: Mutex::new(entries),
                    blob: Some(blob),
                }
            }
            StoreLocation::InMemory => Self::in_memory(),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            blob: None,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.blob.is_some()
    }

    /// Append to the tail.
    pub async fn add(&self, id: TaskId, item: T) -> TaskId {
        let mut entries = self.entries.lock().await;
        entries.push(StoreEntry { id, item });
        self.persist(&entries).await;
        id
    }

    /// Insert at `index` (clamped to the current length).
    pub async fn insert(&self, id: TaskId, item: T, index: usize) {
        let mut entries = self.entries.lock().await;
        let index = index.min(entries.len());
        entries.insert(index, StoreEntry { id, item });
        self.persist(&entries).await;
    }

    /// Replace the record with `id` in place. No-op when absent.
    pub async fn update(&self, id: TaskId, item: T) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        entry.item = item;
        self.persist(&entries).await;
        true
    }

    pub async fn remove(&self, id: TaskId) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(pos) = entries.iter().position(|e| e.id == id) else {
            return false;
        };
        entries.remove(pos);
        self.persist(&entries).await;
        true
    }

    /// Peek at the head without removing it.
    pub async fn next(&self) -> Option<(TaskId, T)> {
        let entries = self.entries.lock().await;
        entries.first().map(|e| (e.id, e.item.clone()))
    }

    pub async fn clear_all(&self) {
        let mut entries = self.entries.lock().await;
        entries.clear();
        self.persist(&entries).await;
    }

    pub async fn count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Snapshot of every record, head first.
    pub async fn entries(&self) -> Vec<(TaskId, T)> {
        let entries = self.entries.lock().await;
        entries.iter().map(|e| (e.id, e.item.clone())).collect()
    }

    pub async fn find<F>(&self, mut pred: F) -> Option<(TaskId, T)>
    where
        F: FnMut(&T) -> bool,
    {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .find(|e| pred(&e.item))
            .map(|e| (e.id, e.item.clone()))
    }

    /// Remove every record matching `pred`, persisting once.
    pub async fn remove_where<F>(&self, mut pred: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut entries = self.entries.lock().await;
        let mut removed = Vec::new();
        entries.retain(|e| {
            if pred(&e.item) {
                removed.push(e.item.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.persist(&entries).await;
        }
        removed
    }

    /// Mutate records in place; `f` returns whether it changed the record.
    /// Persists once if anything changed. Returns the number changed.
    pub async fn update_where<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&mut T) -> bool,
    {
        let mut entries = self.entries.lock().await;
        let mut changed = 0;
        for entry in entries.iter_mut() {
            if f(&mut entry.item) {
                changed += 1;
            }
        }
        if changed > 0 {
            self.persist(&entries).await;
        }
        changed
    }

    async fn persist(&self, entries: &[StoreEntry<T>]) {
        let Some(blob) = &self.blob else {
            return;
        };
        if let Err(e) = blob.save(entries).await {
            warn!(path = %blob.path().display(), error = %e, "failed to persist store");
        }
    }
}
