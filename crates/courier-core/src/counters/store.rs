//! Per-user, per-label counter cache.
//!
//! Records are keyed by `(user, label, mode)` and persisted as one versioned
//! blob of `(key, record)` pairs. Like the task lanes, a write failure is
//! logged and the in-memory map stays authoritative.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::record::{CountMode, CounterKey, CounterRecord};
use crate::domain::{LabelId, UserId};
use crate::ports::Clock;
use crate::queue::{BlobFile, StoreLocation};

/// One row of a batched unread-count refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadCountUpdate {
    pub label_id: LabelId,
    pub total: i32,
    pub unread: i32,
}

pub struct CounterStore {
    records: Mutex<HashMap<CounterKey, CounterRecord>>,
    blob: Option<BlobFile>,
    clock: Arc<dyn Clock>,
}

impl CounterStore {
    pub async fn open(location: StoreLocation, clock: Arc<dyn Clock>) -> Self {
        let (records, blob) = match location {
            StoreLocation::File(blob) => {
                let rows: Vec<(CounterKey, CounterRecord)> = blob.load_or_empty().await;
                (rows.into_iter().collect(), Some(blob))
            }
            StoreLocation::InMemory => (HashMap::new(), None),
        };
        Self {
            records: Mutex::new(records),
            blob,
            clock,
        }
    }

    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            blob: None,
            clock,
        }
    }

    pub async fn last_update(
        &self,
        label_id: &LabelId,
        user_id: &UserId,
        mode: CountMode,
    ) -> Option<CounterRecord> {
        let records = self.records.lock().await;
        records.get(&CounterKey::new(label_id, user_id, mode)).cloned()
    }

    /// Record that the window `start..end` of `label_id` has been fetched.
    ///
    /// `is_unread` selects the unread-only window. Creates the record if
    /// needed.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_last_updated_time(
        &self,
        label_id: &LabelId,
        user_id: &UserId,
        is_unread: bool,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        total: i32,
        mode: CountMode,
    ) {
        let now = self.clock.now();
        let mut records = self.records.lock().await;
        let record = records
            .entry(CounterKey::new(label_id, user_id, mode))
            .or_default();
        if is_unread {
            record.record_unread_window(start, end, total, now);
        } else {
            record.record_window(start, end, total, now);
        }
        self.persist(&records).await;
    }

    /// Overwrite both counts. With `should_save = false` the change stays in
    /// memory until the next persisting call or `save`.
    pub async fn update_unread_count(
        &self,
        label_id: &LabelId,
        user_id: &UserId,
        unread: i32,
        total: i32,
        mode: CountMode,
        should_save: bool,
    ) {
        let mut records = self.records.lock().await;
        let record = records
            .entry(CounterKey::new(label_id, user_id, mode))
            .or_default();
        record.unread = unread.max(0);
        record.total = total;
        if should_save {
            self.persist(&records).await;
        }
    }

    /// Shift the unread count by `delta`, never below zero.
    pub async fn apply_unread_delta(
        &self,
        label_id: &LabelId,
        user_id: &UserId,
        mode: CountMode,
        delta: i32,
    ) -> i32 {
        let mut records = self.records.lock().await;
        let record = records
            .entry(CounterKey::new(label_id, user_id, mode))
            .or_default();
        record.apply_unread_delta(delta);
        let unread = record.unread;
        self.persist(&records).await;
        unread
    }

    /// 0 when no record exists.
    pub async fn unread_count(&self, label_id: &LabelId, user_id: &UserId, mode: CountMode) -> i32 {
        let records = self.records.lock().await;
        records
            .get(&CounterKey::new(label_id, user_id, mode))
            .map(CounterRecord::unread_count)
            .unwrap_or(0)
    }

    /// Counts for every label that has a record; unknown labels are omitted.
    pub async fn unread_counts(
        &self,
        label_ids: &[LabelId],
        user_id: &UserId,
        mode: CountMode,
    ) -> HashMap<LabelId, i32> {
        let records = self.records.lock().await;
        label_ids
            .iter()
            .filter_map(|label| {
                records
                    .get(&CounterKey::new(label, user_id, mode))
                    .map(|r| (label.clone(), r.unread_count()))
            })
            .collect()
    }

    pub async fn batch_update_unread_counts(
        &self,
        updates: &[UnreadCountUpdate],
        user_id: &UserId,
        mode: CountMode,
    ) {
        if updates.is_empty() {
            return;
        }
        let mut records = self.records.lock().await;
        for update in updates {
            let record = records
                .entry(CounterKey::new(&update.label_id, user_id, mode))
                .or_default();
            record.unread = update.unread.max(0);
            record.total = update.total;
        }
        debug!(user_id = %user_id, count = updates.len(), "batched unread counts");
        self.persist(&records).await;
    }

    /// Zero the counts of `label_id` in both modes. Missing records stay missing.
    pub async fn reset_counter(&self, label_id: &LabelId, user_id: &UserId) {
        let mut records = self.records.lock().await;
        let mut touched = false;
        for mode in CountMode::ALL {
            if let Some(record) = records.get_mut(&CounterKey::new(label_id, user_id, mode)) {
                record.reset();
                touched = true;
            }
        }
        if touched {
            self.persist(&records).await;
        }
    }

    /// Forget everything about `user_id`.
    pub async fn remove_update_time(&self, user_id: &UserId) {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|key, _| key.user_id != *user_id);
        if records.len() != before {
            self.persist(&records).await;
        }
    }

    pub async fn remove_update_time_except_unread(&self, user_id: &UserId) {
        let mut records = self.records.lock().await;
        let mut touched = false;
        for (key, record) in records.iter_mut() {
            if key.user_id == *user_id {
                record.forget_read_window();
                touched = true;
            }
        }
        if touched {
            self.persist(&records).await;
        }
    }

    /// Flush the current map to disk.
    pub async fn save(&self) {
        let records = self.records.lock().await;
        self.persist(&records).await;
    }

    async fn persist(&self, records: &HashMap<CounterKey, CounterRecord>) {
        let Some(blob) = &self.blob else {
            return;
        };
        let rows: Vec<(&CounterKey, &CounterRecord)> = records.iter().collect();
        if let Err(e) = blob.save(&rows).await {
            warn!(path = %blob.path().display(), error = %e, "failed to persist counters");
        }
    }
}
