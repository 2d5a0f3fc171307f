//! Ports - 抽象化レイヤー
//!
//! コーディネーターが外部に依存する部分（ハンドラー、接続状態、時刻、ID 生成）を
//! trait として定義します。実装の詳細（HTTP クライアント、OS の到達性 API など）は
//! ホストアプリ側に残ります。

pub mod clock;
pub mod connectivity;
pub mod handler;
pub mod id_generator;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::connectivity::{ConnectivityMonitor, ManualConnectivity};
pub use self::handler::TaskHandler;
pub use self::id_generator::{IdGenerator, UlidGenerator};
