//! Events - コーディネーターが外部に通知するイベント
//!
//! ユーザーに見える副作用は「キューが空になった」通知だけです。
//! エラー表示（トーストやバナー）はハンドラー側の責務です。

/// Broadcast to every `QueueCoordinator::subscribe` receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// Both lanes and the read queue drained; nothing in flight.
    QueueEmpty,
}
