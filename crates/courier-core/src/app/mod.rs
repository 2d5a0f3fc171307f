//! App - アプリケーション層
//!
//! ports と queue を組み合わせてコーディネーターを実装します。
//!
//! # 主要コンポーネント
//! - **CoordinatorBuilder**: 構築とワイヤリング（Fail-fast）
//! - **QueueCoordinator**: 呼び出し側のハンドル（Clone 可能）
//! - **Drainer**: 全状態を所有するアクター（drain / 結果ポリシー）
//! - **BackgroundBudget**: バックグラウンド実行の締め切りと完了通知

mod background;
pub mod builder;
pub mod coordinator;
mod drain;
mod read_queue;
mod registry;

#[cfg(test)]
mod tests;

pub use self::builder::{BuildError, CoordinatorBuilder};
pub use self::coordinator::{QueueActivity, QueueCoordinator};
pub use self::read_queue::{ReadBlock, ReadContext};
