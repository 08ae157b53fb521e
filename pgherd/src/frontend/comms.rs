//! Shutdown coordination shared between the listener and sessions.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

static COMMS: Lazy<Comms> = Lazy::new(Comms::new);

/// Get the global communication channel.
pub fn comms() -> Comms {
    COMMS.clone()
}

/// How hard to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop accepting, wait for sessions to finish.
    Smart,
    /// Stop accepting, abort sessions at the next loop boundary.
    Fast,
}

struct Global {
    shutdown: Notify,
    // 0 = online, 1 = smart, 2 = fast.
    mode: AtomicU8,
}

/// Sync primitives shared between all sessions.
#[derive(Clone)]
pub struct Comms {
    global: Arc<Global>,
}

impl Comms {
    fn new() -> Self {
        Self {
            global: Arc::new(Global {
                shutdown: Notify::new(),
                mode: AtomicU8::new(0),
            }),
        }
    }

    /// Begin shutting down.
    pub fn shutdown(&self, mode: ShutdownMode) {
        let value = match mode {
            ShutdownMode::Smart => 1,
            ShutdownMode::Fast => 2,
        };
        self.global.mode.store(value, Ordering::Relaxed);
        self.global.shutdown.notify_waiters();
    }

    /// Wait for a shutdown signal.
    pub async fn shutting_down(&self) {
        self.global.shutdown.notified().await
    }

    /// We are no longer accepting new clients.
    pub fn offline(&self) -> bool {
        self.global.mode.load(Ordering::Relaxed) != 0
    }

    /// Sessions should stop at the next loop boundary.
    pub fn fast_shutdown(&self) -> bool {
        self.global.mode.load(Ordering::Relaxed) == 2
    }
}
