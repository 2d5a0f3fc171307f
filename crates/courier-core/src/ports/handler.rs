//! TaskHandler port - ユーザーセッションごとの実行者
//!
//! コーディネーターはハンドラーの中身を知りません。典型的には、
//! タスクのアクションを 1 つ以上のリモート API 呼び出しに変換し、
//! ローカルの永続化を更新して、結果を TaskResult で返します。

use async_trait::async_trait;

use crate::domain::{QueuedTask, TaskResult, UserId};

/// Executes dispatched tasks for one signed-in user.
///
/// # 使用例
/// ```ignore
/// struct Session { user_id: UserId, api: ApiClient }
///
/// #[async_trait]
/// impl TaskHandler for Session {
///     fn user_id(&self) -> &UserId { &self.user_id }
///
///     async fn handle_task(&self, task: QueuedTask) -> TaskResult {
///         match self.api.replay(&task).await {
///             Ok(()) => TaskResult::none(),
///             Err(e) if e.is_offline() => TaskResult::connection_issue(),
///             Err(e) => TaskResult::remove_related(e.to_string()),
///         }
///     }
/// }
/// ```
///
/// Handlers own their network timeouts and any backoff before returning
/// `TaskResult::retry()`; the coordinator imposes neither.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn user_id(&self) -> &UserId;

    async fn handle_task(&self, task: QueuedTask) -> TaskResult;
}
