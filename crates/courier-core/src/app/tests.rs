use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rstest::rstest;
use tokio::sync::Semaphore;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::Instant;
use ulid::Ulid;

use super::{CoordinatorBuilder, QueueActivity, QueueCoordinator};
use crate::config::{PersistenceMode, QueueConfig};
use crate::counters::CountMode;
use crate::domain::{
    BlockReason, CardKind, ContactCard, LabelId, LaneState, QueueEvent, QueuedTask, TaskAction,
    TaskId, TaskResult, UserId,
};
use crate::ports::{ManualConnectivity, TaskHandler};
use crate::queue::TaskStore;

/// Records every dispatch and answers from a per-action script (default: done).
struct Recorder {
    user_id: UserId,
    seen: Mutex<Vec<(TaskId, &'static str)>>,
    script: Mutex<HashMap<&'static str, VecDeque<TaskResult>>>,
}

impl Recorder {
    fn new(user: &str) -> Arc<Self> {
        Arc::new(Self {
            user_id: UserId::new(user),
            seen: Mutex::new(Vec::new()),
            script: Mutex::new(HashMap::new()),
        })
    }

    fn on(&self, action: &'static str, result: TaskResult) {
        self.script
            .lock()
            .unwrap()
            .entry(action)
            .or_default()
            .push_back(result);
    }

    fn seen(&self) -> Vec<&'static str> {
        self.seen.lock().unwrap().iter().map(|(_, a)| *a).collect()
    }

    fn seen_ids(&self) -> Vec<TaskId> {
        self.seen.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }
}

#[async_trait]
impl TaskHandler for Recorder {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn handle_task(&self, task: QueuedTask) -> TaskResult {
        let name = task.action.name();
        self.seen.lock().unwrap().push((task.id, name));
        self.script
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default()
    }
}

/// Holds every task until the test lets it through.
struct Gated {
    inner: Arc<Recorder>,
    gate: Semaphore,
}

impl Gated {
    fn new(inner: Arc<Recorder>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gate: Semaphore::new(0),
        })
    }

    fn release(&self, tasks: usize) {
        self.gate.add_permits(tasks);
    }
}

#[async_trait]
impl TaskHandler for Gated {
    fn user_id(&self) -> &UserId {
        self.inner.user_id()
    }

    async fn handle_task(&self, task: QueuedTask) -> TaskResult {
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        self.inner.handle_task(task).await
    }
}

/// Takes `nap` of (paused) time per task.
struct Sleeper {
    inner: Arc<Recorder>,
    nap: Duration,
}

#[async_trait]
impl TaskHandler for Sleeper {
    fn user_id(&self) -> &UserId {
        self.inner.user_id()
    }

    async fn handle_task(&self, task: QueuedTask) -> TaskResult {
        tokio::time::sleep(self.nap).await;
        self.inner.handle_task(task).await
    }
}

struct Panicker(UserId);

#[async_trait]
impl TaskHandler for Panicker {
    fn user_id(&self) -> &UserId {
        &self.0
    }

    async fn handle_task(&self, _task: QueuedTask) -> TaskResult {
        panic!("handler blew up");
    }
}

fn in_memory() -> QueueConfig {
    QueueConfig::default().with_persistence(PersistenceMode::Disabled)
}

async fn queue_with(connectivity: Arc<ManualConnectivity>) -> QueueCoordinator {
    CoordinatorBuilder::new(in_memory())
        .connectivity(connectivity)
        .build()
        .await
        .unwrap()
}

async fn online_queue() -> QueueCoordinator {
    queue_with(Arc::new(ManualConnectivity::online())).await
}

/// Drain inside a generous background window and wait for its completion.
async fn drain(queue: &QueueCoordinator) {
    let done = queue
        .background_fetch(Instant::now() + Duration::from_secs(600))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), done)
        .await
        .expect("drain timed out")
        .unwrap();
}

/// Poll the published snapshot until `cond` holds.
async fn activity_until(
    queue: &QueueCoordinator,
    cond: impl Fn(&QueueActivity) -> bool,
) -> QueueActivity {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let activity = queue.activity();
            if cond(&activity) {
                return activity;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("activity never matched")
}

fn u(id: &str) -> UserId {
    UserId::new(id)
}

fn tid() -> TaskId {
    TaskId::from_ulid(Ulid::new())
}

fn task(target: &str, action: TaskAction, user: &str) -> QueuedTask {
    QueuedTask::new(tid(), target, action, u(user))
}

fn save_draft(target: &str) -> TaskAction {
    TaskAction::SaveDraft {
        message_object_uri: format!("obj://message/{target}"),
    }
}

fn send(target: &str) -> TaskAction {
    TaskAction::Send {
        message_object_uri: format!("obj://message/{target}"),
    }
}

fn upload(target: &str) -> TaskAction {
    TaskAction::UploadAttachment {
        attachment_object_uri: format!("obj://attachment/{target}"),
    }
}

fn mark_read(target: &str) -> TaskAction {
    TaskAction::MarkRead {
        item_ids: vec![target.to_string()],
        object_ids: vec![format!("obj://message/{target}")],
    }
}

fn add_label(label: &str) -> TaskAction {
    TaskAction::AddLabel {
        label_id: LabelId::new(label),
        item_ids: vec!["m1".into()],
        should_fetch: false,
    }
}

#[tokio::test]
async fn lanes_dispatch_in_fifo_order() {
    let queue = online_queue().await;
    let handler = Recorder::new("u1");

    let misc = [
        task("m1", mark_read("m1"), "u1"),
        task("m1", add_label("10"), "u1"),
        task("m2", TaskAction::Delete { item_ids: vec!["m2".into()] }, "u1"),
    ];
    let message = [
        task("m3", TaskAction::DeleteAttachment { attachment_id: "a1".into() }, "u1"),
        task(
            "m3",
            TaskAction::UpdateAttachmentKeyPacket {
                message_object_uri: "obj://message/m3".into(),
                address_id: "addr".into(),
            },
            "u1",
        ),
    ];
    for t in misc.iter().chain(message.iter()) {
        assert!(queue.add_task(t.clone(), false).await.unwrap());
    }

    queue.register_handler(handler.clone()).await.unwrap();
    drain(&queue).await;

    let seen = handler.seen_ids();
    let order_of = |ids: &[QueuedTask]| -> Vec<TaskId> {
        seen.iter()
            .copied()
            .filter(|id| ids.iter().any(|t| t.id == *id))
            .collect()
    };
    assert_eq!(order_of(&misc), misc.iter().map(|t| t.id).collect::<Vec<_>>());
    assert_eq!(
        order_of(&message),
        message.iter().map(|t| t.id).collect::<Vec<_>>()
    );
    assert!(queue.activity().is_empty());
}

#[tokio::test]
async fn draft_chain_waits_on_earlier_same_target_tasks() {
    let queue = online_queue().await;

    let save = task("m1", save_draft("m1"), "u1");
    let attach = task("m1", upload("m1"), "u1");
    let sending = task("m1", send("m1"), "u1");
    let other = task("m2", save_draft("m2"), "u1");
    for t in [&save, &attach, &sending, &other] {
        queue.add_task(t.clone(), false).await.unwrap();
    }

    let queued = queue.message_tasks().await.unwrap();
    let deps = |id: TaskId| {
        queued
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.dependency_ids.clone())
            .unwrap()
    };
    assert!(deps(save.id).is_empty());
    assert!(deps(attach.id).is_empty());
    assert_eq!(deps(sending.id), vec![save.id, attach.id]);
    assert!(deps(other.id).is_empty());
}

#[tokio::test]
async fn blocked_head_drops_stale_chain_and_lane_moves_on() {
    let store = TaskStore::in_memory();
    let stuck = task("m1", send("m1"), "u1").with_dependencies(vec![tid()]);
    let stale = task("m1", upload("m1"), "u1");
    let fine = task("m2", save_draft("m2"), "u1");
    for t in [&stuck, &stale, &fine] {
        store.add(t.id, t.clone()).await;
    }

    let queue = CoordinatorBuilder::new(in_memory())
        .connectivity(Arc::new(ManualConnectivity::online()))
        .message_store(Arc::new(store))
        .build()
        .await
        .unwrap();
    let handler = Recorder::new("u1");
    queue.register_handler(handler.clone()).await.unwrap();

    drain(&queue).await;

    assert_eq!(handler.seen_ids(), vec![fine.id]);
    assert!(queue.message_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn signout_purges_user_and_runs_once() {
    let queue = online_queue().await;
    queue
        .add_task(task("m1", save_draft("m1"), "u1"), false)
        .await
        .unwrap();
    queue
        .add_task(task("m1", mark_read("m1"), "u1"), false)
        .await
        .unwrap();
    let bystander = task("m9", add_label("3"), "u2");
    queue.add_task(bystander.clone(), false).await.unwrap();

    let signout = task("", TaskAction::Signout, "u1");
    assert!(queue.add_task(signout.clone(), false).await.unwrap());

    let message: Vec<TaskId> = queue
        .message_tasks()
        .await
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    let misc: Vec<TaskId> = queue
        .misc_tasks()
        .await
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(message, vec![signout.id]);
    assert_eq!(misc, vec![signout.id, bystander.id]);

    let (alice, bob) = (Recorder::new("u1"), Recorder::new("u2"));
    queue.register_handler(alice.clone()).await.unwrap();
    queue.register_handler(bob.clone()).await.unwrap();
    drain(&queue).await;

    assert_eq!(alice.seen(), vec!["signout"]);
    assert_eq!(bob.seen(), vec!["add_label"]);
}

#[tokio::test]
async fn signin_cancels_pending_signout() {
    let queue = online_queue().await;
    queue
        .add_task(task("", TaskAction::Signout, "u1"), false)
        .await
        .unwrap();

    assert!(
        queue
            .add_task(task("", TaskAction::Signin, "u1"), false)
            .await
            .unwrap()
    );
    assert!(queue.message_tasks().await.unwrap().is_empty());
    assert!(queue.misc_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn signin_leaves_other_users_signout() {
    let queue = online_queue().await;
    queue
        .add_task(task("", TaskAction::Signout, "u1"), false)
        .await
        .unwrap();
    queue
        .add_task(task("", TaskAction::Signin, "u2"), false)
        .await
        .unwrap();

    assert_eq!(queue.message_tasks().await.unwrap().len(), 1);
    assert_eq!(queue.misc_tasks().await.unwrap().len(), 1);
}

#[tokio::test]
async fn empty_queue_is_announced_once() {
    let queue = online_queue().await;
    let mut events = queue.subscribe();
    let handler = Recorder::new("u1");
    queue.register_handler(handler.clone()).await.unwrap();

    queue
        .add_task(task("m1", mark_read("m1"), "u1"), false)
        .await
        .unwrap();
    queue
        .add_task(task("m2", save_draft("m2"), "u1"), false)
        .await
        .unwrap();
    drain(&queue).await;

    assert_eq!(events.try_recv(), Ok(QueueEvent::QueueEmpty));
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

    // still empty: completion fires again, no second broadcast
    drain(&queue).await;
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(handler.seen().len(), 2);
}

#[tokio::test]
async fn empty_user_id_is_rejected() {
    let queue = online_queue().await;
    assert!(
        !queue
            .add_task(task("m1", mark_read("m1"), ""), true)
            .await
            .unwrap()
    );
    assert!(queue.misc_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn lanes_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = || QueueConfig::default().with_data_dir(dir.path());

    let save = task("m1", save_draft("m1"), "u1");
    let sending = task("m1", send("m1"), "u1");
    let contact = task(
        "",
        TaskAction::UpdateContact {
            contact_id: "c1".into(),
            cards: vec![ContactCard {
                kind: CardKind::SignedAndEncrypted,
                data: "BEGIN:VCARD\nEND:VCARD".into(),
                signature: Some("sig".into()),
            }],
        },
        "u1",
    );
    let snooze = task(
        "conv1",
        TaskAction::Snooze {
            conversation_ids: vec!["conv1".into()],
            until: Utc.with_ymd_and_hms(2030, 5, 1, 8, 30, 0).unwrap(),
        },
        "u1",
    )
    .with_conversation_scope(true);

    {
        let queue = CoordinatorBuilder::new(config())
            .connectivity(Arc::new(ManualConnectivity::offline()))
            .build()
            .await
            .unwrap();
        for t in [&save, &sending, &contact, &snooze] {
            queue.add_task(t.clone(), true).await.unwrap();
        }
    }

    let queue = CoordinatorBuilder::new(config())
        .connectivity(Arc::new(ManualConnectivity::offline()))
        .build()
        .await
        .unwrap();
    let as_json = |tasks: Vec<QueuedTask>| serde_json::to_value(tasks).unwrap();

    let mut expected_send = sending.clone();
    expected_send.dependency_ids = vec![save.id];
    assert_eq!(
        as_json(queue.message_tasks().await.unwrap()),
        as_json(vec![save.clone(), expected_send])
    );
    assert_eq!(
        as_json(queue.misc_tasks().await.unwrap()),
        as_json(vec![contact.clone(), snooze.clone()])
    );
}

#[tokio::test]
async fn foreign_schema_version_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    {
        let queue = CoordinatorBuilder::new(QueueConfig::default().with_data_dir(dir.path()))
            .connectivity(Arc::new(ManualConnectivity::offline()))
            .build()
            .await
            .unwrap();
        queue
            .add_task(task("m1", mark_read("m1"), "u1"), false)
            .await
            .unwrap();
    }

    let mut config = QueueConfig::default().with_data_dir(dir.path());
    config.schema_version = 2;
    let queue = CoordinatorBuilder::new(config)
        .connectivity(Arc::new(ManualConnectivity::offline()))
        .build()
        .await
        .unwrap();
    assert!(queue.misc_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn draft_upload_send_run_in_order() {
    let queue = online_queue().await;
    let handler = Recorder::new("u1");
    for action in [save_draft("m1"), upload("m1"), send("m1")] {
        queue.add_task(task("m1", action, "u1"), false).await.unwrap();
    }

    queue.register_handler(handler.clone()).await.unwrap();
    drain(&queue).await;

    assert_eq!(handler.seen(), vec!["save_draft", "upload_attachment", "send"]);
    let activity = queue.activity();
    assert_eq!((activity.message_count, activity.misc_count), (0, 0));
}

#[rstest]
#[case::mark_read_is_kept(task("m1", mark_read("m1"), "u1"), 1)]
#[case::upload_is_dropped(task("m1", upload("m1"), "u1"), 0)]
#[case::signout_is_dropped(task("", TaskAction::Signout, "u1"), 0)]
#[tokio::test]
async fn connection_issue_policy(#[case] queued: QueuedTask, #[case] left: usize) {
    let queue = online_queue().await;
    let handler = Recorder::new("u1");
    handler.on(queued.action.name(), TaskResult::connection_issue());
    queue.register_handler(handler.clone()).await.unwrap();

    queue.add_task(queued.clone(), true).await.unwrap();
    let activity = queue.wait_until_settled().await.unwrap();

    assert_eq!(activity.message_count + activity.misc_count, left);
    assert!(handler.seen().contains(&queued.action.name()));
}

#[tokio::test]
async fn connection_issue_pauses_the_lane() {
    let queue = online_queue().await;
    let handler = Recorder::new("u1");
    handler.on("mark_read", TaskResult::connection_issue());
    queue.register_handler(handler.clone()).await.unwrap();

    queue
        .add_task(task("m1", mark_read("m1"), "u1"), true)
        .await
        .unwrap();
    let activity = queue.wait_until_settled().await.unwrap();

    assert_eq!(activity.misc_count, 1);
    assert_eq!(
        activity.misc,
        LaneState::Blocked(BlockReason::ConnectionIssue)
    );
    assert_eq!(handler.seen(), vec!["mark_read"]);
}

#[tokio::test]
async fn task_without_handler_is_dropped() {
    let queue = online_queue().await;
    let other = Recorder::new("u2");
    queue.register_handler(other.clone()).await.unwrap();

    queue
        .add_task(
            task(
                "",
                TaskAction::DeleteLabel {
                    label_id: LabelId::new("label-7"),
                },
                "u1",
            ),
            true,
        )
        .await
        .unwrap();

    assert!(queue.misc_tasks().await.unwrap().is_empty());
    assert!(other.seen().is_empty());
}

#[tokio::test]
async fn unregistered_user_loses_queued_work() {
    let queue = online_queue().await;
    let handler = Recorder::new("u1");
    queue.register_handler(handler.clone()).await.unwrap();
    queue.unregister_handler(&u("u1")).await.unwrap();

    queue
        .add_task(task("m1", mark_read("m1"), "u1"), true)
        .await
        .unwrap();
    assert!(queue.misc_tasks().await.unwrap().is_empty());
    assert!(handler.seen().is_empty());
}

#[tokio::test]
async fn latest_registration_wins() {
    let queue = online_queue().await;
    let (old, new) = (Recorder::new("u1"), Recorder::new("u1"));
    queue.register_handler(old.clone()).await.unwrap();
    queue.register_handler(new.clone()).await.unwrap();

    queue
        .add_task(task("m1", mark_read("m1"), "u1"), false)
        .await
        .unwrap();
    drain(&queue).await;

    assert!(old.seen().is_empty());
    assert_eq!(new.seen(), vec!["mark_read"]);
}

#[tokio::test]
async fn resumed_upload_fetches_message_first() {
    let store = TaskStore::in_memory();
    let resumed = task("m1", upload("m1"), "u1");
    store.add(resumed.id, resumed.clone()).await;

    let queue = CoordinatorBuilder::new(in_memory())
        .connectivity(Arc::new(ManualConnectivity::online()))
        .message_store(Arc::new(store))
        .build()
        .await
        .unwrap();
    let handler = Recorder::new("u1");
    queue.register_handler(handler.clone()).await.unwrap();
    drain(&queue).await;

    assert_eq!(
        handler.seen(),
        vec!["fetch_message_detail", "upload_attachment"]
    );
}

#[tokio::test]
async fn check_read_queue_drops_dependents_and_runs_reads() {
    let queue = online_queue().await;
    let handler = Recorder::new("u1");
    handler.on("save_draft", TaskResult::check_read_queue());
    let gated = Gated::new(handler.clone());
    queue.register_handler(gated.clone()).await.unwrap();

    let save = task("m1", save_draft("m1"), "u1");
    queue.add_task(save.clone(), false).await.unwrap();
    queue
        .add_task(task("m1", send("m1"), "u1"), false)
        .await
        .unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    queue
        .queue_read(move |_| flag.store(true, Ordering::SeqCst))
        .await
        .unwrap();

    // save_draft is held in flight
    let activity = queue.activity();
    assert_eq!(activity.message, LaneState::Dispatching(save.id));
    assert_eq!(activity.read_count, 1);
    assert!(!ran.load(Ordering::SeqCst), "reads wait for the lanes");

    gated.release(1);
    let activity = queue.wait_until_settled().await.unwrap();
    assert_eq!(handler.seen_ids(), vec![save.id]);
    assert!(ran.load(Ordering::SeqCst));
    assert!(activity.is_empty());
    assert!(queue.message_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn read_block_work_holds_back_later_blocks() {
    let connectivity = Arc::new(ManualConnectivity::offline());
    let queue = queue_with(Arc::clone(&connectivity)).await;
    let handler = Recorder::new("u1");
    let gated = Gated::new(handler.clone());
    queue.register_handler(gated.clone()).await.unwrap();

    let follow_up = task("m1", mark_read("m1"), "u1");
    let queued = follow_up.clone();
    let (first, second) = (Arc::new(AtomicBool::new(false)), Arc::new(AtomicBool::new(false)));
    let (first_flag, second_flag) = (Arc::clone(&first), Arc::clone(&second));
    queue
        .queue_read(move |ctx| {
            first_flag.store(true, Ordering::SeqCst);
            ctx.add_task(queued);
        })
        .await
        .unwrap();
    queue
        .queue_read(move |_| second_flag.store(true, Ordering::SeqCst))
        .await
        .unwrap();
    assert_eq!(queue.activity().read_count, 2);

    connectivity.set_connected(true);
    let activity = activity_until(&queue, |a| a.misc.is_dispatching()).await;

    assert!(first.load(Ordering::SeqCst));
    assert!(!second.load(Ordering::SeqCst), "second block ran while a task was queued");
    assert_eq!(activity.misc, LaneState::Dispatching(follow_up.id));
    assert_eq!(activity.read_count, 1);

    gated.release(1);
    let activity = queue.wait_until_settled().await.unwrap();
    assert!(second.load(Ordering::SeqCst));
    assert_eq!(handler.seen_ids(), vec![follow_up.id]);
    assert!(activity.is_empty());
}

#[tokio::test]
async fn remove_related_cascades_within_target_only() {
    let queue = online_queue().await;
    let handler = Recorder::new("u1");
    handler.on("save_draft", TaskResult::remove_related("draft rejected"));

    let failing = task("m1", save_draft("m1"), "u1");
    let survivor = task("m2", save_draft("m2"), "u1");
    queue.add_task(failing.clone(), false).await.unwrap();
    queue
        .add_task(task("m1", send("m1"), "u1"), false)
        .await
        .unwrap();
    queue.add_task(survivor.clone(), false).await.unwrap();

    queue.register_handler(handler.clone()).await.unwrap();
    drain(&queue).await;

    assert_eq!(handler.seen_ids(), vec![failing.id, survivor.id]);
}

#[tokio::test]
async fn retry_keeps_task_at_head() {
    let queue = online_queue().await;
    let handler = Recorder::new("u1");
    handler.on("mark_read", TaskResult::retry());
    queue.register_handler(handler.clone()).await.unwrap();

    let t = task("m1", mark_read("m1"), "u1");
    queue.add_task(t.clone(), false).await.unwrap();
    drain(&queue).await;

    assert_eq!(handler.seen_ids(), vec![t.id, t.id]);
}

#[tokio::test]
async fn panicking_handler_does_not_wedge_the_lane() {
    let queue = online_queue().await;
    queue
        .register_handler(Arc::new(Panicker(u("u1"))))
        .await
        .unwrap();

    queue
        .add_task(task("m1", mark_read("m1"), "u1"), true)
        .await
        .unwrap();
    let activity = queue.wait_until_settled().await.unwrap();

    assert_eq!(activity.misc_count, 1);
    assert_eq!(
        activity.misc,
        LaneState::Blocked(BlockReason::ConnectionIssue)
    );
}

#[tokio::test]
async fn reconnect_resumes_draining() {
    let connectivity = Arc::new(ManualConnectivity::offline());
    let queue = queue_with(Arc::clone(&connectivity)).await;
    let handler = Recorder::new("u1");
    queue.register_handler(handler.clone()).await.unwrap();

    queue
        .add_task(task("m1", mark_read("m1"), "u1"), true)
        .await
        .unwrap();
    let activity = queue.activity();
    assert_eq!(activity.misc_count, 1);
    assert_eq!(activity.misc, LaneState::Blocked(BlockReason::Offline));

    let mut events = queue.subscribe();
    connectivity.set_connected(true);
    let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("no drain after reconnect")
        .unwrap();

    assert_eq!(event, QueueEvent::QueueEmpty);
    assert_eq!(handler.seen(), vec!["mark_read"]);
}

#[tokio::test(start_paused = true)]
async fn budget_alarm_releases_an_offline_queue() {
    let queue = queue_with(Arc::new(ManualConnectivity::offline())).await;
    queue
        .add_task(task("m1", mark_read("m1"), "u1"), false)
        .await
        .unwrap();

    let started = Instant::now();
    let done = queue
        .background_fetch(started + Duration::from_secs(30))
        .await
        .unwrap();
    done.await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(25));
    let activity = queue.activity();
    assert_eq!(activity.misc_count, 1);
    assert_eq!(activity.misc, LaneState::Blocked(BlockReason::TimeBudget));
}

#[rstest]
#[case::done(TaskResult::none(), 1)]
#[case::connection_issue(TaskResult::connection_issue(), 2)]
#[tokio::test(start_paused = true)]
async fn budget_running_out_mid_task_releases_host_on_completion(
    #[case] result: TaskResult,
    #[case] left: usize,
) {
    let queue = online_queue().await;
    let recorder = Recorder::new("u1");
    recorder.on("mark_read", result);
    queue
        .register_handler(Arc::new(Sleeper {
            inner: recorder.clone(),
            nap: Duration::from_secs(27),
        }))
        .await
        .unwrap();
    for target in ["m1", "m2"] {
        queue
            .add_task(task(target, mark_read(target), "u1"), false)
            .await
            .unwrap();
    }

    // the alarm at 25 s finds the first task still in flight
    let started = Instant::now();
    let done = queue
        .background_fetch(started + Duration::from_secs(30))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(3600), done)
        .await
        .expect("host window never released")
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(27));
    assert_eq!(recorder.seen(), vec!["mark_read"]);
    let activity = queue.activity();
    assert!(activity.is_settled());
    assert_eq!(activity.misc_count, left);
}

#[tokio::test]
async fn exhausted_budget_holds_work_until_foreground() {
    let queue = online_queue().await;
    let handler = Recorder::new("u1");
    queue.register_handler(handler.clone()).await.unwrap();
    queue
        .add_task(task("m1", mark_read("m1"), "u1"), false)
        .await
        .unwrap();

    let done = queue
        .background_fetch(Instant::now() + Duration::from_secs(2))
        .await
        .unwrap();
    done.await.unwrap();
    assert!(handler.seen().is_empty());

    queue.enter_foreground().await.unwrap();
    let activity = queue.wait_until_settled().await.unwrap();
    assert_eq!(handler.seen(), vec!["mark_read"]);
    assert!(activity.is_empty());
}

#[tokio::test]
async fn bulk_queries_and_removals() {
    let queue = queue_with(Arc::new(ManualConnectivity::offline())).await;
    let save = task("m1", save_draft("m1"), "u1");
    for t in [
        save.clone(),
        task("m1", send("m1"), "u1"),
        task("m2", upload("m2"), "u2"),
        task("c9", mark_read("c9"), "u1"),
    ] {
        queue.add_task(t, false).await.unwrap();
    }

    assert!(queue.is_any_queued_message(&u("u1")).await.unwrap());
    assert!(!queue.is_any_queued_message(&u("u3")).await.unwrap());
    assert_eq!(
        queue.queued_message_ids().await.unwrap(),
        HashSet::from(["m1".to_string(), "m2".to_string()])
    );
    assert_eq!(
        queue
            .message_ids_of_tasks(|t| t.user_id == UserId::new("u1"))
            .await
            .unwrap(),
        vec!["m1", "m1", "c9"]
    );

    let removed = queue
        .remove_all_tasks("m1", |a| matches!(a, TaskAction::Send { .. }))
        .await
        .unwrap();
    assert_eq!(removed, 1);

    queue.delete_all_queued_message(&u("u2")).await.unwrap();
    let left: Vec<TaskId> = queue
        .message_tasks()
        .await
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(left, vec![save.id]);

    queue.clear_all().await.unwrap();
    assert!(queue.message_tasks().await.unwrap().is_empty());
    assert!(queue.misc_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn clearing_the_queue_announces_empty_and_releases_host() {
    let queue = queue_with(Arc::new(ManualConnectivity::offline())).await;
    let mut events = queue.subscribe();
    queue
        .add_task(task("m1", mark_read("m1"), "u1"), false)
        .await
        .unwrap();

    let mut done = queue
        .background_fetch(Instant::now() + Duration::from_secs(600))
        .await
        .unwrap();
    queue.enter_foreground().await.unwrap();
    assert!(done.try_recv().is_err(), "completion fired with work queued");

    queue.clear_all().await.unwrap();
    assert_eq!(events.try_recv(), Ok(QueueEvent::QueueEmpty));
    assert!(done.try_recv().is_ok());
    assert!(queue.activity().is_empty());
}

#[rstest]
#[case::delete_all_queued_message(true)]
#[case::remove_all_tasks(false)]
#[tokio::test]
async fn bulk_removal_that_empties_the_queue_announces_it(#[case] by_user: bool) {
    let queue = queue_with(Arc::new(ManualConnectivity::offline())).await;
    let mut events = queue.subscribe();
    queue
        .add_task(task("m1", save_draft("m1"), "u1"), false)
        .await
        .unwrap();

    if by_user {
        queue.delete_all_queued_message(&u("u1")).await.unwrap();
    } else {
        queue.remove_all_tasks("m1", |_| true).await.unwrap();
    }

    assert_eq!(events.try_recv(), Ok(QueueEvent::QueueEmpty));
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test]
async fn signin_that_empties_the_queue_announces_it() {
    let queue = queue_with(Arc::new(ManualConnectivity::offline())).await;
    let mut events = queue.subscribe();
    queue
        .add_task(task("", TaskAction::Signout, "u1"), false)
        .await
        .unwrap();
    queue
        .add_task(task("", TaskAction::Signin, "u1"), false)
        .await
        .unwrap();

    assert_eq!(events.try_recv(), Ok(QueueEvent::QueueEmpty));
}

#[tokio::test]
async fn counters_are_shared_by_every_handle() {
    let queue = online_queue().await;
    let clone = queue.clone();
    let (label, user) = (LabelId::new("0"), u("u1"));

    queue
        .counters()
        .update_unread_count(&label, &user, 4, 20, CountMode::Conversation, true)
        .await;
    clone
        .counters()
        .apply_unread_delta(&label, &user, CountMode::Conversation, -1)
        .await;

    assert_eq!(
        queue
            .counters()
            .unread_count(&label, &user, CountMode::Conversation)
            .await,
        3
    );
}
