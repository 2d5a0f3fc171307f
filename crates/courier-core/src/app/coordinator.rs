//! QueueCoordinator - 呼び出し側のハンドル
//!
//! 各メソッドはコマンドをアクターに送り、返信を待つだけです。
//! 呼び出し側のスレッドをブロックしません。

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use super::drain::Command;
use super::read_queue::ReadContext;
use crate::counters::CounterStore;
use crate::domain::{
    Lane, LaneState, QueueError, QueueEvent, QueuedTask, TaskAction, TaskId, UserId,
};
use crate::ports::{IdGenerator, TaskHandler};

/// Snapshot of both lanes, published after every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueActivity {
    pub message: LaneState,
    pub misc: LaneState,
    pub message_count: usize,
    pub misc_count: usize,
    pub read_count: usize,
}

impl QueueActivity {
    pub fn lane(&self, lane: Lane) -> LaneState {
        match lane {
            Lane::Message => self.message,
            Lane::Misc => self.misc,
        }
    }

    /// No handler is running.
    pub fn is_settled(&self) -> bool {
        !self.message.is_dispatching() && !self.misc.is_dispatching()
    }

    pub fn is_empty(&self) -> bool {
        self.message_count == 0 && self.misc_count == 0 && self.read_count == 0
    }
}

/// Cloneable handle to the drain engine. Built by `CoordinatorBuilder`.
///
/// The engine stops once every clone is dropped.
#[derive(Clone)]
pub struct QueueCoordinator {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<QueueEvent>,
    activity: watch::Receiver<QueueActivity>,
    ids: Arc<dyn IdGenerator>,
    counters: Arc<CounterStore>,
}

impl QueueCoordinator {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        events: broadcast::Sender<QueueEvent>,
        activity: watch::Receiver<QueueActivity>,
        ids: Arc<dyn IdGenerator>,
        counters: Arc<CounterStore>,
    ) -> Self {
        Self {
            commands,
            events,
            activity,
            ids,
            counters,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| QueueError::CoordinatorStopped)?;
        rx.await.map_err(|_| QueueError::CoordinatorStopped)
    }

    /// Fresh id for a task about to be queued.
    pub fn next_task_id(&self) -> TaskId {
        self.ids.generate_task_id()
    }

    /// Build a task with a fresh id.
    pub fn new_task(
        &self,
        target_id: impl Into<String>,
        action: TaskAction,
        user_id: UserId,
    ) -> QueuedTask {
        QueuedTask::new(self.next_task_id(), target_id, action, user_id)
    }

    /// Queue `task`. `Ok(false)` when the task has no user id.
    ///
    /// With `auto_execute` a drain pass runs before this returns.
    pub async fn add_task(&self, task: QueuedTask, auto_execute: bool) -> Result<bool, QueueError> {
        self.request(|reply| Command::AddTask {
            task,
            auto_execute,
            reply,
        })
        .await
    }

    /// Run `block` once no task is queued.
    ///
    /// Tasks the block adds to its `ReadContext` are queued before any later
    /// block runs.
    pub async fn queue_read<F>(&self, block: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut ReadContext) + Send + 'static,
    {
        self.request(|reply| Command::QueueRead {
            block: Box::new(block),
            reply,
        })
        .await
    }

    /// One handler per user id; registering again replaces the old one.
    pub async fn register_handler(&self, handler: Arc<dyn TaskHandler>) -> Result<(), QueueError> {
        self.request(|reply| Command::RegisterHandler { handler, reply })
            .await
    }

    pub async fn unregister_handler(&self, user_id: &UserId) -> Result<(), QueueError> {
        let user_id = user_id.clone();
        self.request(|reply| Command::UnregisterHandler { user_id, reply })
            .await
    }

    /// Drain inside a host-imposed window ending at `deadline`.
    ///
    /// The returned receiver resolves once the queue is empty, or once less
    /// than the safety margin is left and nothing is in flight.
    pub async fn background_fetch(
        &self,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<()>, QueueError> {
        let (completion, done) = oneshot::channel();
        self.request(|reply| Command::BackgroundFetch {
            deadline,
            completion,
            reply,
        })
        .await?;
        Ok(done)
    }

    /// Lift the time limit and resume draining.
    pub async fn enter_foreground(&self) -> Result<(), QueueError> {
        self.request(|reply| Command::EnterForeground { reply }).await
    }

    /// Remove message-lane tasks for `target_id` whose action matches.
    pub async fn remove_all_tasks<P>(&self, target_id: &str, predicate: P) -> Result<usize, QueueError>
    where
        P: Fn(&TaskAction) -> bool + Send + Sync + 'static,
    {
        let target_id = target_id.to_string();
        self.request(|reply| Command::RemoveAllTasks {
            target_id,
            predicate: Box::new(predicate),
            reply,
        })
        .await
    }

    pub async fn is_any_queued_message(&self, user_id: &UserId) -> Result<bool, QueueError> {
        let user_id = user_id.clone();
        self.request(|reply| Command::IsAnyQueuedMessage { user_id, reply })
            .await
    }

    pub async fn delete_all_queued_message(&self, user_id: &UserId) -> Result<(), QueueError> {
        let user_id = user_id.clone();
        self.request(|reply| Command::DeleteAllQueuedMessage { user_id, reply })
            .await
    }

    /// Targets of every message-lane task.
    pub async fn queued_message_ids(&self) -> Result<HashSet<String>, QueueError> {
        self.request(|reply| Command::QueuedMessageIds { reply })
            .await
    }

    /// Empty both lanes and the read queue. Tasks already in flight finish.
    pub async fn clear_all(&self) -> Result<(), QueueError> {
        self.request(|reply| Command::ClearAll { reply }).await
    }

    /// Targets of matching tasks across both lanes, lane by lane in order.
    pub async fn message_ids_of_tasks<P>(&self, predicate: P) -> Result<Vec<String>, QueueError>
    where
        P: Fn(&QueuedTask) -> bool + Send + Sync + 'static,
    {
        self.request(|reply| Command::MessageIdsOfTasks {
            predicate: Box::new(predicate),
            reply,
        })
        .await
    }

    pub async fn message_tasks(&self) -> Result<Vec<QueuedTask>, QueueError> {
        self.request(|reply| Command::Tasks {
            lane: Lane::Message,
            reply,
        })
        .await
    }

    pub async fn misc_tasks(&self) -> Result<Vec<QueuedTask>, QueueError> {
        self.request(|reply| Command::Tasks {
            lane: Lane::Misc,
            reply,
        })
        .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn activity(&self) -> QueueActivity {
        *self.activity.borrow()
    }

    /// Wait until no lane has a task in flight.
    pub async fn wait_until_settled(&self) -> Result<QueueActivity, QueueError> {
        let mut rx = self.activity.clone();
        let settled = rx
            .wait_for(QueueActivity::is_settled)
            .await
            .map_err(|_| QueueError::CoordinatorStopped)?;
        Ok(*settled)
    }

    pub fn counters(&self) -> &Arc<CounterStore> {
        &self.counters
    }
}
