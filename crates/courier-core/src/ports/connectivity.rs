//! ConnectivityMonitor port - オンライン/オフライン遷移の通知
//!
//! コーディネーターは構築時に一度だけ subscribe します。
//! オフライン→オンライン遷移でハンドラーが登録済みなら drain を再開します。

use tokio::sync::watch;

pub trait ConnectivityMonitor: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Receiver that observes every status change.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// In-process monitor; the host pushes reachability changes into it.
#[derive(Debug)]
pub struct ManualConnectivity {
    status: watch::Sender<bool>,
}

impl ManualConnectivity {
    pub fn new(connected: bool) -> Self {
        let (status, _) = watch::channel(connected);
        Self { status }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    pub fn set_connected(&self, connected: bool) {
        self.status.send_if_modified(|current| {
            if *current == connected {
                return false;
            }
            *current = connected;
            true
        });
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn is_connected(&self) -> bool {
        *self.status.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }
}
