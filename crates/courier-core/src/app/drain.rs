//! Drain engine - コーディネーターの状態を所有するアクター
//!
//! すべての状態（両レーン、ハンドラー表、読み取りキュー、予算）はこのタスクだけが
//! 触ります。外部からは `Command`、ハンドラーの完了は `Completion` として届きます。
//!
//! # drain 1 回の流れ
//! 1. 空なら QueueEmpty を通知して完了通知を発火
//! 2. 時間切れなら（実行中がなければ）完了通知を発火して終了
//! 3. オフラインなら終了
//! 4. 初回のみ: 先頭がアップロードなら fetchMessageDetail を差し込む
//! 5. message レーン → misc レーンの順に先頭を dispatch
//! 6. 両レーンが空の間だけ読み取りキューを 1 つずつ実行

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::background::BackgroundBudget;
use super::coordinator::QueueActivity;
use super::read_queue::{ReadBlock, ReadContext, ReadQueue};
use super::registry::HandlerRegistry;
use crate::domain::{
    BlockReason, Lane, LaneState, QueueEvent, QueuedTask, ResultAction, Routing, TaskAction,
    TaskId, TaskResult, UserId,
};
use crate::ports::{ConnectivityMonitor, IdGenerator, TaskHandler};
use crate::queue::{dependency, TaskStore};

pub(crate) type ActionFilter = Box<dyn Fn(&TaskAction) -> bool + Send + Sync>;
pub(crate) type TaskFilter = Box<dyn Fn(&QueuedTask) -> bool + Send + Sync>;

/// Requests sent by `QueueCoordinator`. Every variant carries its reply.
pub(crate) enum Command {
    AddTask {
        task: QueuedTask,
        auto_execute: bool,
        reply: oneshot::Sender<bool>,
    },
    QueueRead {
        block: ReadBlock,
        reply: oneshot::Sender<()>,
    },
    RegisterHandler {
        handler: Arc<dyn TaskHandler>,
        reply: oneshot::Sender<()>,
    },
    UnregisterHandler {
        user_id: UserId,
        reply: oneshot::Sender<()>,
    },
    BackgroundFetch {
        deadline: Instant,
        completion: oneshot::Sender<()>,
        reply: oneshot::Sender<()>,
    },
    EnterForeground {
        reply: oneshot::Sender<()>,
    },
    RemoveAllTasks {
        target_id: String,
        predicate: ActionFilter,
        reply: oneshot::Sender<usize>,
    },
    IsAnyQueuedMessage {
        user_id: UserId,
        reply: oneshot::Sender<bool>,
    },
    DeleteAllQueuedMessage {
        user_id: UserId,
        reply: oneshot::Sender<()>,
    },
    QueuedMessageIds {
        reply: oneshot::Sender<HashSet<String>>,
    },
    ClearAll {
        reply: oneshot::Sender<()>,
    },
    MessageIdsOfTasks {
        predicate: TaskFilter,
        reply: oneshot::Sender<Vec<String>>,
    },
    Tasks {
        lane: Lane,
        reply: oneshot::Sender<Vec<QueuedTask>>,
    },
}

/// A handler finished; re-enters the actor.
pub(crate) struct Completion {
    lane: Lane,
    task: QueuedTask,
    result: TaskResult,
}

struct LaneSlot {
    store: Arc<TaskStore>,
    state: LaneState,
}

pub(crate) struct DrainParts {
    pub message: Arc<TaskStore>,
    pub misc: Arc<TaskStore>,
    pub connectivity: Arc<dyn ConnectivityMonitor>,
    pub ids: Arc<dyn IdGenerator>,
    pub safety_margin: Duration,
    pub events: broadcast::Sender<QueueEvent>,
    pub activity: watch::Sender<QueueActivity>,
}

pub(crate) struct Drainer {
    message: LaneSlot,
    misc: LaneSlot,
    reads: ReadQueue,
    handlers: HandlerRegistry,
    connectivity: Arc<dyn ConnectivityMonitor>,
    ids: Arc<dyn IdGenerator>,
    budget: BackgroundBudget,
    events: broadcast::Sender<QueueEvent>,
    activity: watch::Sender<QueueActivity>,
    completions: mpsc::UnboundedSender<Completion>,
    has_dequeued: bool,
    empty_announced: bool,
    /// Deferred until the next snapshot is published.
    notify_empty: bool,
    release_host: bool,
}

impl Drainer {
    pub fn new(parts: DrainParts) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (completions, completions_rx) = mpsc::unbounded_channel();
        let drainer = Self {
            message: LaneSlot {
                store: parts.message,
                state: LaneState::Idle,
            },
            misc: LaneSlot {
                store: parts.misc,
                state: LaneState::Idle,
            },
            reads: ReadQueue::default(),
            handlers: HandlerRegistry::new(),
            connectivity: parts.connectivity,
            ids: parts.ids,
            budget: BackgroundBudget::new(parts.safety_margin),
            events: parts.events,
            activity: parts.activity,
            completions,
            has_dequeued: false,
            empty_announced: false,
            notify_empty: false,
            release_host: false,
        };
        (drainer, completions_rx)
    }

    /// Serve until every `QueueCoordinator` handle is dropped.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        let mut connectivity = self.connectivity.subscribe();
        let mut online = *connectivity.borrow_and_update();
        let mut watching = true;
        self.publish_activity().await;

        loop {
            let alarm = self.budget.alarm_at();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                Some(done) = completions.recv() => {
                    self.complete(done.lane, done.task, done.result).await;
                    self.publish_activity().await;
                }
                changed = connectivity.changed(), if watching => {
                    if changed.is_err() {
                        debug!("connectivity monitor dropped");
                        watching = false;
                        continue;
                    }
                    let now_online = *connectivity.borrow_and_update();
                    self.on_connectivity(online, now_online).await;
                    online = now_online;
                    self.publish_activity().await;
                }
                _ = tokio::time::sleep_until(alarm.unwrap_or_else(Instant::now)), if alarm.is_some() => {
                    debug!("background budget alarm");
                    self.budget.mark_alarm_fired();
                    self.dequeue_if_needed().await;
                    self.publish_activity().await;
                }
            }
        }

        debug!("drain engine stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::AddTask {
                task,
                auto_execute,
                reply,
            } => {
                let accepted = self.add_task(task).await;
                if accepted && auto_execute {
                    self.dequeue_if_needed().await;
                }
                self.reply(reply, accepted).await;
            }
            Command::QueueRead { block, reply } => {
                self.reads.push(block);
                self.empty_announced = false;
                self.dequeue_if_needed().await;
                self.reply(reply, ()).await;
            }
            Command::RegisterHandler { handler, reply } => {
                let user_id = handler.user_id().clone();
                if self.handlers.register(handler).is_some() {
                    info!(user_id = %user_id, "handler replaced");
                } else {
                    info!(user_id = %user_id, handlers = self.handlers.len(), "handler registered");
                }
                self.reply(reply, ()).await;
            }
            Command::UnregisterHandler { user_id, reply } => {
                if self.handlers.unregister(&user_id).is_some() {
                    info!(user_id = %user_id, "handler unregistered");
                }
                self.reply(reply, ()).await;
            }
            Command::BackgroundFetch {
                deadline,
                completion,
                reply,
            } => {
                self.budget.arm(deadline, completion);
                self.dequeue_if_needed().await;
                self.reply(reply, ()).await;
            }
            Command::EnterForeground { reply } => {
                self.budget.clear_deadline();
                self.unblock(BlockReason::TimeBudget);
                self.dequeue_if_needed().await;
                self.reply(reply, ()).await;
            }
            Command::RemoveAllTasks {
                target_id,
                predicate,
                reply,
            } => {
                let removed = self
                    .remove_where(Lane::Message, |t| {
                        t.target_id == target_id && predicate(&t.action)
                    })
                    .await;
                self.announce_if_empty().await;
                self.reply(reply, removed.len()).await;
            }
            Command::IsAnyQueuedMessage { user_id, reply } => {
                let found = self
                    .message
                    .store
                    .find(|t| t.user_id == user_id)
                    .await
                    .is_some();
                self.reply(reply, found).await;
            }
            Command::DeleteAllQueuedMessage { user_id, reply } => {
                let removed = self
                    .remove_where(Lane::Message, |t| t.user_id == user_id)
                    .await;
                debug!(user_id = %user_id, removed = removed.len(), "deleted queued messages");
                self.announce_if_empty().await;
                self.reply(reply, ()).await;
            }
            Command::QueuedMessageIds { reply } => {
                let ids: HashSet<String> = self
                    .message
                    .store
                    .entries()
                    .await
                    .into_iter()
                    .map(|(_, t)| t.target_id)
                    .filter(|id| !id.is_empty())
                    .collect();
                self.reply(reply, ids).await;
            }
            Command::ClearAll { reply } => {
                self.message.store.clear_all().await;
                self.misc.store.clear_all().await;
                self.reads.clear();
                for lane in [Lane::Message, Lane::Misc] {
                    let slot = self.slot_mut(lane);
                    if !slot.state.is_dispatching() {
                        slot.state = LaneState::Idle;
                    }
                }
                info!("cleared all lanes");
                self.announce_if_empty().await;
                self.reply(reply, ()).await;
            }
            Command::MessageIdsOfTasks { predicate, reply } => {
                let mut ids = Vec::new();
                for lane in [Lane::Message, Lane::Misc] {
                    for (_, task) in self.slot(lane).store.entries().await {
                        if predicate(&task) && !task.target_id.is_empty() {
                            ids.push(task.target_id);
                        }
                    }
                }
                self.reply(reply, ids).await;
            }
            Command::Tasks { lane, reply } => {
                let tasks: Vec<QueuedTask> = self
                    .slot(lane)
                    .store
                    .entries()
                    .await
                    .into_iter()
                    .map(|(_, t)| t)
                    .collect();
                self.reply(reply, tasks).await;
            }
        }
    }

    /// Publish the settled state, then answer. Callers observing `activity`
    /// after the reply never see a stale snapshot.
    async fn reply<T>(&mut self, reply: oneshot::Sender<T>, value: T) {
        self.publish_activity().await;
        // caller may have given up waiting
        let _ = reply.send(value);
    }

    async fn add_task(&mut self, mut task: QueuedTask) -> bool {
        if task.user_id.is_empty() {
            warn!(task_id = %task.id, action = task.action.name(), "rejected task without user id");
            return false;
        }

        match task.action.routing() {
            Routing::MessageChain => {
                task.dependency_ids =
                    dependency::pending_ids_for_target(&self.message.store, &task.target_id).await;
                debug!(
                    task_id = %task.id,
                    dependencies = task.dependency_ids.len(),
                    "queued on message lane"
                );
                self.message.store.add(task.id, task).await;
            }
            Routing::Message => {
                self.message.store.add(task.id, task).await;
            }
            Routing::Misc => {
                self.misc.store.add(task.id, task).await;
            }
            Routing::Signout => self.sign_out(task).await,
            Routing::Signin => {
                self.sign_in(&task.user_id).await;
                self.announce_if_empty().await;
                return true;
            }
        }

        self.empty_announced = false;
        true
    }

    /// Every other task of the user is dropped; the signout jumps both lanes.
    async fn sign_out(&mut self, task: QueuedTask) {
        let user_id = task.user_id.clone();
        let mut dropped = 0;
        for lane in [Lane::Message, Lane::Misc] {
            dropped += self.remove_where(lane, |t| t.user_id == user_id).await.len();
            self.slot(lane).store.insert(task.id, task.clone(), 0).await;
        }
        info!(user_id = %user_id, dropped, "signout queued");
    }

    /// Cancel a signout that has not started yet.
    async fn sign_in(&mut self, user_id: &UserId) {
        for lane in [Lane::Message, Lane::Misc] {
            let slot = self.slot(lane);
            let Some((id, head)) = slot.store.next().await else {
                continue;
            };
            if !head.action.is_signout() || head.user_id != *user_id {
                continue;
            }
            if slot.state.in_flight() == Some(id) {
                continue;
            }
            self.remove_task(lane, &head).await;
            info!(user_id = %user_id, lane = ?lane, "signin cancelled pending signout");
        }
    }

    async fn on_connectivity(&mut self, was_online: bool, now_online: bool) {
        if now_online && !was_online {
            info!("back online");
            self.unblock(BlockReason::Offline);
            if !self.handlers.is_empty() {
                self.dequeue_if_needed().await;
            }
        } else if !now_online {
            info!("went offline");
            self.block_idle_lanes(BlockReason::Offline);
        }
    }

    async fn dequeue_if_needed(&mut self) {
        loop {
            if self.announce_if_empty().await {
                return;
            }

            if self.release_if_exhausted() {
                return;
            }

            if !self.connectivity.is_connected() {
                self.block_idle_lanes(BlockReason::Offline);
                return;
            }

            self.fetch_before_upload().await;

            let message_again = self.dequeue_lane(Lane::Message).await;
            let misc_again = self.dequeue_lane(Lane::Misc).await;
            let reads_queued = self.drain_read_queue().await;

            if !(message_again || misc_again || reads_queued) {
                self.announce_if_empty().await;
                return;
            }
        }
    }

    /// Returns `true` when stale work was dropped and another pass should run.
    async fn dequeue_lane(&mut self, lane: Lane) -> bool {
        loop {
            if self.slot(lane).state.is_dispatching() {
                return false;
            }
            let head = self.slot(lane).store.next().await;
            let Some((_, task)) = head else {
                self.slot_mut(lane).state = LaneState::Idle;
                return false;
            };

            if task.is_blocked() {
                let target_id = task.target_id.clone();
                let stale = self
                    .remove_where(Lane::Message, |t| {
                        t.target_id == target_id && t.action.is_draft_chain()
                    })
                    .await;
                warn!(
                    task_id = %task.id,
                    lane = ?lane,
                    target_id = %task.target_id,
                    dropped = stale.len(),
                    "head has unresolved dependencies, dropped stale draft chain"
                );
                if stale.iter().any(|t| t.id == task.id) {
                    self.slot_mut(lane).state = LaneState::Idle;
                    return true;
                }
                self.slot_mut(lane).state = LaneState::Blocked(BlockReason::Dependencies);
                return false;
            }

            let Some(handler) = self.handlers.get(&task.user_id).cloned() else {
                warn!(
                    task_id = %task.id,
                    user_id = %task.user_id,
                    action = task.action.name(),
                    "no handler for user, dropping task"
                );
                self.remove_task(lane, &task).await;
                continue;
            };

            if task.action.is_signout() {
                let user_id = task.user_id.clone();
                let twin = self
                    .slot(lane.other())
                    .store
                    .find(|t| t.action.is_signout() && t.user_id == user_id)
                    .await;
                if twin.is_some() {
                    debug!(task_id = %task.id, lane = ?lane, "signout twin in other lane, dropping copy");
                    self.remove_task(lane, &task).await;
                    continue;
                }
            }

            self.dispatch(lane, task, handler);
            return false;
        }
    }

    fn dispatch(&mut self, lane: Lane, task: QueuedTask, handler: Arc<dyn TaskHandler>) {
        info!(
            task_id = %task.id,
            lane = ?lane,
            action = task.action.name(),
            user_id = %task.user_id,
            "dispatching"
        );
        self.slot_mut(lane).state = LaneState::Dispatching(task.id);

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let job = {
                let task = task.clone();
                tokio::spawn(async move { handler.handle_task(task).await })
            };
            let result = match job.await {
                Ok(result) => result,
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "handler panicked");
                    TaskResult::connection_issue().with_reason("handler panicked")
                }
            };
            // engine may have shut down meanwhile
            let _ = completions.send(Completion { lane, task, result });
        });
    }

    async fn complete(&mut self, lane: Lane, task: QueuedTask, result: TaskResult) {
        let slot = self.slot_mut(lane);
        if slot.state.in_flight() == Some(task.id) {
            slot.state = LaneState::Idle;
        }
        debug!(
            task_id = %task.id,
            lane = ?lane,
            result = ?result.action,
            reason = result.reason.as_deref().unwrap_or(""),
            "task finished"
        );

        match result.action {
            ResultAction::None => {
                self.remove_task(lane, &task).await;
            }
            ResultAction::CheckReadQueue => {
                self.remove_dependents(lane, task.id).await;
                self.remove_task(lane, &task).await;
                self.drain_read_queue().await;
            }
            ResultAction::ConnectionIssue => {
                if task.action.is_dropped_when_offline() {
                    self.remove_task(lane, &task).await;
                }
                let slot = self.slot_mut(lane);
                if !slot.state.is_dispatching() {
                    slot.state = LaneState::Blocked(BlockReason::ConnectionIssue);
                }
                warn!(task_id = %task.id, lane = ?lane, "connection issue, draining paused");
            }
            ResultAction::RemoveRelated => {
                let dropped = self.remove_dependents(lane, task.id).await;
                self.remove_task(lane, &task).await;
                warn!(
                    task_id = %task.id,
                    dropped,
                    reason = result.reason.as_deref().unwrap_or(""),
                    "task failed, removed with dependents"
                );
            }
            ResultAction::Retry => {}
        }

        if result.continues_draining() {
            self.dequeue_if_needed().await;
        } else if !self.announce_if_empty().await {
            self.release_if_exhausted();
        }
    }

    /// On the first pass after start, an upload left at the head by a previous
    /// process gets a fresh copy of the message fetched ahead of it.
    async fn fetch_before_upload(&mut self) {
        if std::mem::replace(&mut self.has_dequeued, true) {
            return;
        }
        let store = Arc::clone(&self.message.store);
        let Some((_, head)) = store.next().await else {
            return;
        };
        if !head.action.is_upload() {
            return;
        }
        let id = self.ids.generate_task_id();
        let fetch = QueuedTask::new(
            id,
            head.target_id.clone(),
            TaskAction::FetchMessageDetail,
            head.user_id.clone(),
        );
        store.insert(id, fetch, 0).await;
        info!(task_id = %id, target_id = %head.target_id, "fetching message before resumed upload");
    }

    /// Run read blocks one at a time while no task is queued. Tasks a block
    /// adds are queued before the lanes are checked again, which stops the
    /// loop. Returns whether any block queued a task.
    async fn drain_read_queue(&mut self) -> bool {
        let mut queued = false;
        while self.lanes_empty().await {
            let Some(block) = self.reads.pop() else {
                break;
            };
            let mut ctx = ReadContext::default();
            if std::panic::catch_unwind(AssertUnwindSafe(|| block(&mut ctx))).is_err() {
                error!("read block panicked");
            }
            for task in ctx.into_tasks() {
                queued |= self.add_task(task).await;
            }
        }
        queued
    }

    /// Announce once per transition to empty and release the host.
    async fn announce_if_empty(&mut self) -> bool {
        if !self.is_empty().await {
            return false;
        }
        self.message.state = LaneState::Idle;
        self.misc.state = LaneState::Idle;
        if !self.empty_announced {
            self.empty_announced = true;
            self.notify_empty = true;
            info!("queue empty");
        }
        self.release_host = true;
        true
    }

    /// With the budget spent, park idle lanes and release the host once
    /// nothing is in flight. Returns whether the budget is spent.
    fn release_if_exhausted(&mut self) -> bool {
        if !self.budget.is_exhausted(Instant::now()) {
            return false;
        }
        self.block_idle_lanes(BlockReason::TimeBudget);
        if !self.any_in_flight() && self.budget.has_completion() {
            info!("background budget exhausted, releasing host");
            self.release_host = true;
        }
        true
    }

    async fn is_empty(&self) -> bool {
        self.reads.is_empty()
            && !self.any_in_flight()
            && self.message.store.count().await == 0
            && self.misc.store.count().await == 0
    }

    async fn lanes_empty(&self) -> bool {
        self.message.store.count().await == 0 && self.misc.store.count().await == 0
    }

    fn any_in_flight(&self) -> bool {
        self.message.state.is_dispatching() || self.misc.state.is_dispatching()
    }

    fn block_idle_lanes(&mut self, reason: BlockReason) {
        for lane in [Lane::Message, Lane::Misc] {
            let slot = self.slot_mut(lane);
            if !slot.state.is_dispatching() {
                slot.state = LaneState::Blocked(reason);
            }
        }
    }

    fn unblock(&mut self, reason: BlockReason) {
        for lane in [Lane::Message, Lane::Misc] {
            let slot = self.slot_mut(lane);
            if slot.state == LaneState::Blocked(reason) {
                slot.state = LaneState::Idle;
            }
        }
    }

    /// Remove one task and release same-target waiters.
    async fn remove_task(&self, lane: Lane, task: &QueuedTask) -> bool {
        let store = &self.slot(lane).store;
        if !store.remove(task.id).await {
            return false;
        }
        dependency::resolve(store, task).await;
        true
    }

    async fn remove_where<F>(&self, lane: Lane, pred: F) -> Vec<QueuedTask>
    where
        F: FnMut(&QueuedTask) -> bool,
    {
        let store = &self.slot(lane).store;
        let removed = store.remove_where(pred).await;
        for task in &removed {
            dependency::resolve(store, task).await;
        }
        removed
    }

    /// Coarse cascade: a dependency that will never be satisfied takes its
    /// waiters with it.
    async fn remove_dependents(&self, lane: Lane, id: TaskId) -> usize {
        let store = &self.slot(lane).store;
        let removed = dependency::remove_dependents(store, id).await;
        for task in &removed {
            dependency::resolve(store, task).await;
        }
        removed.len()
    }

    /// Publish the snapshot, then deliver whatever the last step decided to
    /// announce. Observers woken by an event always see the new state.
    async fn publish_activity(&mut self) {
        let snapshot = QueueActivity {
            message: self.message.state,
            misc: self.misc.state,
            message_count: self.message.store.count().await,
            misc_count: self.misc.store.count().await,
            read_count: self.reads.len(),
        };
        self.activity.send_replace(snapshot);

        if std::mem::take(&mut self.notify_empty) {
            // no subscribers is fine
            let _ = self.events.send(QueueEvent::QueueEmpty);
        }
        if std::mem::take(&mut self.release_host) && self.budget.fire() {
            debug!("background completion fired");
        }
    }

    fn slot(&self, lane: Lane) -> &LaneSlot {
        match lane {
            Lane::Message => &self.message,
            Lane::Misc => &self.misc,
        }
    }

    fn slot_mut(&mut self, lane: Lane) -> &mut LaneSlot {
        match lane {
            Lane::Message => &mut self.message,
            Lane::Misc => &mut self.misc,
        }
    }
}
