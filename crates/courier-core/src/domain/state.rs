//! State - レーンの実行状態
//!
//! # 状態遷移
//! - Idle → Dispatching: オンライン、時間予算あり、先頭タスクあり
//! - Dispatching → Idle: ハンドラーの完了通知
//! - * → Blocked: オフライン、時間切れ、依存待ち、接続エラー

use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// One of the two durable task streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// saveDraft / send / attachment work.
    Message,
    /// Labels, contacts, read state and the rest.
    Misc,
}

impl Lane {
    pub fn other(self) -> Lane {
        match self {
            Lane::Message => Lane::Misc,
            Lane::Misc => Lane::Message,
        }
    }

    /// File stem of the lane's persisted blob.
    pub fn file_stem(self) -> &'static str {
        match self {
            Lane::Message => "message_queue",
            Lane::Misc => "misc_queue",
        }
    }
}

/// LaneState はレーンの状態を表現
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaneState {
    #[default]
    Idle,
    /// Exactly one task in flight.
    Dispatching(TaskId),
    Blocked(BlockReason),
}

impl LaneState {
    pub fn is_dispatching(&self) -> bool {
        matches!(self, LaneState::Dispatching(_))
    }

    pub fn in_flight(&self) -> Option<TaskId> {
        match self {
            LaneState::Dispatching(id) => Some(*id),
            _ => None,
        }
    }
}

/// BlockReason は Blocked の詳細理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// 接続なし
    Offline,
    /// バックグラウンドの時間予算切れ
    TimeBudget,
    /// 先頭タスクの依存が解決できなかった
    Dependencies,
    /// ハンドラーが接続エラーを報告した
    ConnectionIssue,
}
