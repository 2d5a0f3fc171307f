//! Counter record: cached total/unread counts and refresh-window bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{LabelId, UserId};

/// "Never synced" timestamp.
pub fn distant_past() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// Whether counts roll up per message or per conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountMode {
    Single,
    Conversation,
}

impl CountMode {
    pub const ALL: [CountMode; 2] = [CountMode::Single, CountMode::Conversation];
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    pub user_id: UserId,
    pub label_id: LabelId,
    pub mode: CountMode,
}

impl CounterKey {
    pub fn new(label_id: &LabelId, user_id: &UserId, mode: CountMode) -> Self {
        Self {
            user_id: user_id.clone(),
            label_id: label_id.clone(),
            mode,
        }
    }
}

/// Counts for one `(user, label, mode)`.
///
/// - `start..end` bounds the window of items already fetched; `update` is
///   the last time that window was touched.
/// - The `unread_*` fields are an independent window for unread-only refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub update: DateTime<Utc>,
    pub unread_start: DateTime<Utc>,
    pub unread_end: DateTime<Utc>,
    pub unread_update: DateTime<Utc>,
    pub total: i32,
    pub unread: i32,
}

impl CounterRecord {
    pub fn new() -> Self {
        Self {
            start: distant_past(),
            end: distant_past(),
            update: distant_past(),
            unread_start: distant_past(),
            unread_end: distant_past(),
            unread_update: distant_past(),
            total: 0,
            unread: 0,
        }
    }

    /// Never synced.
    pub fn is_new(&self) -> bool {
        self.start == self.end && self.end == self.update
    }

    pub fn is_unread_new(&self) -> bool {
        self.unread_start == self.unread_end && self.unread_end == self.unread_update
    }

    /// Fold a fetched page into the read window.
    ///
    /// `start` and `total` are only taken from the first sync; `end` only moves
    /// earlier.
    pub fn record_window(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        total: i32,
        now: DateTime<Utc>,
    ) {
        let fresh = self.is_new();
        if fresh {
            self.start = start;
            self.total = total;
        }
        if fresh || self.end == distant_past() || end < self.end {
            self.end = end;
        }
        self.update = now;
    }

    /// Fold a fetched unread-only page into the unread window. `total` is
    /// overwritten every time.
    pub fn record_unread_window(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        total: i32,
        now: DateTime<Utc>,
    ) {
        let fresh = self.is_unread_new();
        if fresh {
            self.unread_start = start;
        }
        if fresh || self.unread_end == distant_past() || end < self.unread_end {
            self.unread_end = end;
        }
        self.unread_update = now;
        self.total = total;
    }

    pub fn apply_unread_delta(&mut self, delta: i32) {
        self.unread = self.unread.saturating_add(delta).max(0);
    }

    /// Stored value clamped to zero.
    pub fn unread_count(&self) -> i32 {
        self.unread.max(0)
    }

    /// Zero the counters and forget the unread window.
    pub fn reset(&mut self) {
        self.total = 0;
        self.unread = 0;
        self.unread_start = distant_past();
        self.unread_end = distant_past();
        self.unread_update = distant_past();
    }

    /// Forget the read window; unread bookkeeping stays.
    pub fn forget_read_window(&mut self) {
        self.start = distant_past();
        self.end = distant_past();
        self.update = distant_past();
    }
}

impl Default for CounterRecord {
    fn default() -> Self {
        Self::new()
    }
}
