//! CoordinatorBuilder - コーディネーターの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - 接続状態モニターは必須（未設定なら `BuildError::MissingConnectivity`）
//! - 永続化が有効なのにデータディレクトリが決まらなければ `BuildError::MissingDataDir`
//! - それ以外（ID 生成、時計）は本番用の既定値を使う

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::info;

use super::coordinator::{QueueActivity, QueueCoordinator};
use super::drain::{DrainParts, Drainer};
use crate::config::QueueConfig;
use crate::counters::CounterStore;
use crate::domain::Lane;
use crate::ports::{Clock, ConnectivityMonitor, IdGenerator, SystemClock, UlidGenerator};
use crate::queue::{StoreLocation, TaskStore};

const EVENT_CAPACITY: usize = 16;

/// BuildError はコーディネーター構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no connectivity monitor configured")]
    MissingConnectivity,

    #[error("persistence is enabled but no data directory could be resolved")]
    MissingDataDir,
}

/// # 使用例
/// ```ignore
/// let queue = CoordinatorBuilder::new(QueueConfig::load(path)?.with_env_overrides()?)
///     .connectivity(Arc::new(ManualConnectivity::online()))
///     .build()
///     .await?;
/// queue.register_handler(session).await?;
/// ```
pub struct CoordinatorBuilder {
    config: QueueConfig,
    connectivity: Option<Arc<dyn ConnectivityMonitor>>,
    ids: Option<Arc<dyn IdGenerator>>,
    clock: Arc<dyn Clock>,
    message_store: Option<Arc<TaskStore>>,
    misc_store: Option<Arc<TaskStore>>,
    counters: Option<Arc<CounterStore>>,
}

impl CoordinatorBuilder {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            connectivity: None,
            ids: None,
            clock: Arc::new(SystemClock),
            message_store: None,
            misc_store: None,
            counters: None,
        }
    }

    pub fn connectivity(mut self, monitor: Arc<dyn ConnectivityMonitor>) -> Self {
        self.connectivity = Some(monitor);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Clock for counter timestamps and default task ids.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use an already opened store instead of the configured location.
    pub fn message_store(mut self, store: Arc<TaskStore>) -> Self {
        self.message_store = Some(store);
        self
    }

    pub fn misc_store(mut self, store: Arc<TaskStore>) -> Self {
        self.misc_store = Some(store);
        self
    }

    pub fn counter_store(mut self, counters: Arc<CounterStore>) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Open the stores and start the drain engine.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn build(self) -> Result<QueueCoordinator, BuildError> {
        let connectivity = self.connectivity.ok_or(BuildError::MissingConnectivity)?;

        let message = match self.message_store {
            Some(store) => store,
            None => Arc::new(TaskStore::open(lane_location(&self.config, Lane::Message)?).await),
        };
        let misc = match self.misc_store {
            Some(store) => store,
            None => Arc::new(TaskStore::open(lane_location(&self.config, Lane::Misc)?).await),
        };
        let counters = match self.counters {
            Some(counters) => counters,
            None => {
                let location = self
                    .config
                    .counters_location()
                    .ok_or(BuildError::MissingDataDir)?;
                Arc::new(CounterStore::open(location, Arc::clone(&self.clock)).await)
            }
        };
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(Arc::clone(&self.clock))),
        };

        let (message_count, misc_count) = (message.count().await, misc.count().await);
        info!(
            persistent = message.is_persistent(),
            message_count,
            misc_count,
            "starting queue coordinator"
        );

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (activity, activity_rx) = watch::channel(QueueActivity::default());

        let (drainer, completions) = Drainer::new(DrainParts {
            message,
            misc,
            connectivity,
            ids: Arc::clone(&ids),
            safety_margin: self.config.background_safety_margin(),
            events: events.clone(),
            activity,
        });
        tokio::spawn(drainer.run(commands_rx, completions));

        Ok(QueueCoordinator::new(
            commands,
            events,
            activity_rx,
            ids,
            counters,
        ))
    }
}

fn lane_location(config: &QueueConfig, lane: Lane) -> Result<StoreLocation, BuildError> {
    config.lane_location(lane).ok_or(BuildError::MissingDataDir)
}
