//! courier-core
//!
//! Offline-first mutation queue: user actions are persisted per lane and
//! replayed against a remote API once a handler is registered, the device is
//! online and the host grants execution time.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, action, task, outcome, state, errors, events）
//! - **ports**: 抽象化レイヤー（TaskHandler, ConnectivityMonitor, Clock, IdGenerator）
//! - **queue**: 永続化されたタスクストアと依存関係の解決
//! - **counters**: ラベルごとの未読数・総数キャッシュ
//! - **app**: コーディネーター（builder, handle, drain engine）
//! - **config**: TOML + 環境変数による設定

pub mod app;
pub mod config;
pub mod counters;
pub mod domain;
pub mod ports;
pub mod queue;

pub use app::{BuildError, CoordinatorBuilder, QueueActivity, QueueCoordinator, ReadContext};
pub use config::{ConfigError, PersistenceMode, QueueConfig};
pub use domain::{QueueError, QueueEvent, QueuedTask, TaskAction, TaskResult};
