//! Background budget - ホストが与えるバックグラウンド実行時間の管理
//!
//! ホストは締め切り (`Instant`) と完了通知 (`oneshot::Sender`) を渡します。
//! 完了通知は次のどちらかで一度だけ発火します:
//! - キューが空になった
//! - 残り時間が安全マージン以下になり、実行中のタスクがない

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) struct BackgroundBudget {
    margin: Duration,
    deadline: Option<Instant>,
    completion: Option<oneshot::Sender<()>>,
    alarm_fired: bool,
}

impl BackgroundBudget {
    pub fn new(margin: Duration) -> Self {
        Self {
            margin,
            deadline: None,
            completion: None,
            alarm_fired: false,
        }
    }

    /// Start a new window. A completion still pending from an earlier
    /// window is released first.
    pub fn arm(&mut self, deadline: Instant, completion: oneshot::Sender<()>) {
        self.fire();
        self.deadline = Some(deadline);
        self.completion = Some(completion);
        self.alarm_fired = false;
    }

    /// Foreground: no time limit. The pending completion is kept.
    pub fn clear_deadline(&mut self) {
        self.deadline = None;
        self.alarm_fired = false;
    }

    pub fn has_completion(&self) -> bool {
        self.completion.is_some()
    }

    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    /// Remaining time is at or below the margin.
    pub fn is_exhausted(&self, now: Instant) -> bool {
        self.deadline
            .is_some_and(|d| d.saturating_duration_since(now) <= self.margin)
    }

    /// When the engine should wake up to check the budget on its own.
    pub fn alarm_at(&self) -> Option<Instant> {
        if self.alarm_fired {
            return None;
        }
        let deadline = self.deadline?;
        Some(deadline.checked_sub(self.margin).unwrap_or(deadline))
    }

    pub fn mark_alarm_fired(&mut self) {
        self.alarm_fired = true;
    }

    /// Release the pending completion. Returns whether one was pending.
    pub fn fire(&mut self) -> bool {
        match self.completion.take() {
            Some(tx) => {
                // receiver may already be gone
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}
