//! Connection info shared across all sessions.
//!
//! Cancel requests arrive on their own connection and carry only the
//! key data we synthesized for the client. This map resolves it to
//! the real backend pids without any session involvement.

use dashmap::DashMap;
use fnv::FnvBuildHasher;
use once_cell::sync::Lazy;

use crate::net::messages::BackendKeyData;

static CONN_INFO: Lazy<DashMap<(i32, i32), Vec<SlotInfo>, FnvBuildHasher>> =
    Lazy::new(|| DashMap::with_hasher(FnvBuildHasher::default()));

/// Where one slot of an entry lives and how to cancel it.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub node_id: usize,
    pub addr: String,
    /// The backend's own pid and secret.
    pub key: BackendKeyData,
}

/// Make an entry's backends reachable for cancel requests.
pub fn register(frontend: BackendKeyData, slots: Vec<SlotInfo>) {
    CONN_INFO.insert((frontend.pid, frontend.secret), slots);
}

/// Entry closed; cancel requests for it are now unroutable.
pub fn deregister(frontend: &BackendKeyData) {
    CONN_INFO.remove(&(frontend.pid, frontend.secret));
}

/// Resolve a cancel request to backend connections.
pub fn lookup(pid: i32, secret: i32) -> Option<Vec<SlotInfo>> {
    CONN_INFO
        .get(&(pid, secret))
        .map(|entry| entry.value().clone())
}
