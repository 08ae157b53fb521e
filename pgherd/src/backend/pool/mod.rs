//! Connection pool.
//!
//! Idle entries are keyed by the canonical startup-packet bytes.
//! Reuse requires a byte-identical packet, every node the entry
//! holds still live, and (optionally) sockets that still pass a
//! probe.

pub mod conn_info;
pub mod entry;

pub use conn_info::SlotInfo;
pub use entry::{PoolEntry, TransactionState};

use futures::future::try_join_all;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::{debug, info};

use crate::cluster::{registry, NodeStatus};
use crate::config::{config, User};
use crate::net::messages::StartupPacket;

use super::{Error, Server};

static POOL: Lazy<Pool> = Lazy::new(Pool::new);

/// Get the global pool.
pub fn pool() -> &'static Pool {
    &POOL
}

/// Pool of idle backend entries.
pub struct Pool {
    idle: Mutex<Vec<PoolEntry>>,
    capacity: Option<usize>,
}

impl Pool {
    fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity: None,
        }
    }

    /// Pool with a fixed capacity, independent of configuration.
    #[cfg(test)]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity: Some(capacity),
        }
    }

    fn capacity(&self) -> usize {
        self.capacity.unwrap_or_else(|| config().general.max_pool)
    }

    /// Start the idle sweeper.
    pub fn launch(&'static self) {
        tokio::spawn(async move {
            loop {
                let life = config().general.connection_life_time();
                let tick = life
                    .map(|life| (life / 2).max(Duration::from_secs(1)))
                    .unwrap_or(Duration::from_secs(30));

                let mut timer = interval(tick);
                timer.tick().await; // first tick is immediate
                timer.tick().await;

                if let Some(life) = life {
                    self.sweep(life).await;
                }
            }
        });
    }

    /// Find an idle entry for this startup packet. The entry comes
    /// out of the pool marked in-use.
    pub async fn acquire(
        &self,
        startup: &StartupPacket,
        check_socket: bool,
    ) -> Option<PoolEntry> {
        loop {
            let mut candidate = {
                let mut idle = self.idle.lock();
                let pos = idle
                    .iter()
                    .position(|entry| entry.startup.canonical() == startup.canonical())?;
                idle.remove(pos)
            };

            // Every node this entry holds must still be live.
            let nodes = registry().snapshot();
            let nodes_ok = candidate
                .nodes()
                .iter()
                .all(|id| nodes.get(*id).map(|node| node.live()).unwrap_or(false));

            if !nodes_ok {
                debug!("discarding pooled entry, node went away");
                self.discard(candidate).await;
                continue;
            }

            // The sweeper may not have gotten to an expired entry yet;
            // it must never be reused either way.
            let expired = match (
                config().general.connection_life_time(),
                candidate.idle_since(),
            ) {
                (Some(life), Some(since)) => since.elapsed() >= life,
                _ => false,
            };
            if expired {
                debug!("discarding pooled entry past its lifetime");
                self.discard(candidate).await;
                continue;
            }

            if check_socket && !candidate.check_sockets().await {
                debug!("discarding pooled entry, backend hung up");
                self.discard(candidate).await;
                continue;
            }

            candidate.closetime = None;
            return Some(candidate);
        }
    }

    /// Connect to every live node and build a fresh entry.
    pub async fn create(&self, startup: &StartupPacket, user: &User) -> Result<PoolEntry, Error> {
        let nodes = registry().snapshot();
        let live: Vec<_> = nodes.iter().filter(|node| node.live()).collect();

        if live.is_empty() {
            return Err(Error::AllNodesDown);
        }

        let servers = try_join_all(
            live.iter()
                .map(|node| Server::connect(node, startup, user)),
        )
        .await?;

        let mut slots: Vec<Option<Server>> = (0..nodes.len()).map(|_| None).collect();
        let mut info = Vec::with_capacity(servers.len());

        for server in servers {
            let id = server.node_id();

            // First successful connection brings a waiting node up.
            if nodes[id].status == NodeStatus::ConnectWait {
                registry().set_status(id, NodeStatus::Up);
            }

            info.push(SlotInfo {
                node_id: id,
                addr: nodes[id].addr(),
                key: server.id(),
            });
            slots[id] = Some(server);
        }

        let entry = PoolEntry::new(startup.clone(), slots);
        conn_info::register(entry.key, info);

        Ok(entry)
    }

    /// Return an entry to the pool. Evicts the least recently used
    /// idle entry when full.
    pub async fn release(&self, mut entry: PoolEntry) {
        entry.closetime = Some(Instant::now());

        let evicted = {
            let mut idle = self.idle.lock();
            idle.push(entry);

            if idle.len() > self.capacity() {
                idle.iter()
                    .enumerate()
                    .min_by_key(|(_, entry)| entry.closetime)
                    .map(|(pos, _)| pos)
                    .map(|pos| idle.remove(pos))
            } else {
                None
            }
        };

        if let Some(entry) = evicted {
            debug!("pool full, evicting oldest idle entry");
            self.discard(entry).await;
        }
    }

    /// Close an entry for good.
    pub async fn discard(&self, entry: PoolEntry) {
        conn_info::deregister(&entry.key);
        entry.terminate().await;
    }

    /// Close idle entries older than `life`.
    pub async fn sweep(&self, life: Duration) {
        let now = Instant::now();
        let expired: Vec<PoolEntry> = {
            let mut idle = self.idle.lock();
            let mut expired = Vec::new();
            let mut i = 0;
            while i < idle.len() {
                let old = idle[i]
                    .idle_since()
                    .map(|since| now.duration_since(since) >= life)
                    .unwrap_or(false);
                if old {
                    expired.push(idle.remove(i));
                } else {
                    i += 1;
                }
            }
            expired
        };

        if !expired.is_empty() {
            info!("closing {} expired pooled entries", expired.len());
        }
        for entry in expired {
            self.discard(entry).await;
        }
    }

    /// Close every idle entry.
    pub async fn close_idle(&self) {
        let drained: Vec<PoolEntry> = { self.idle.lock().drain(..).collect() };
        for entry in drained {
            self.discard(entry).await;
        }
    }

    /// Close idle entries holding a connection to this node.
    /// Called when the node is detached.
    pub async fn close_node(&self, node: usize) {
        let affected: Vec<PoolEntry> = {
            let mut idle = self.idle.lock();
            let mut affected = Vec::new();
            let mut i = 0;
            while i < idle.len() {
                if idle[i].has_node(node) {
                    affected.push(idle.remove(i));
                } else {
                    i += 1;
                }
            }
            affected
        };

        for entry in affected {
            self.discard(entry).await;
        }
    }

    /// Idle entries currently pooled.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::messages::BackendKeyData;

    fn startup(user: &str) -> StartupPacket {
        StartupPacket::new_v3(vec![
            ("user".into(), user.into()),
            ("database".into(), "prod".into()),
        ])
    }

    fn idle_entry(user: &str) -> PoolEntry {
        let mut entry = PoolEntry::new(startup(user), vec![]);
        entry.closetime = Some(Instant::now());
        entry
    }

    #[tokio::test]
    async fn test_acquire_release_same_entry() {
        let pool = Pool::with_capacity(4);
        let entry = idle_entry("alice");
        let key = entry.key;
        pool.release(entry).await;

        let reused = pool.acquire(&startup("alice"), false).await.unwrap();
        assert_eq!(reused.key, key);
        assert!(reused.closetime.is_none());

        // Packet with different options doesn't match.
        assert!(pool.acquire(&startup("bob"), false).await.is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let pool = Pool::with_capacity(2);

        let oldest = idle_entry("a");
        let oldest_key = oldest.key;
        pool.release(oldest).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.release(idle_entry("b")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.release(idle_entry("c")).await;

        assert_eq!(pool.idle_count(), 2);
        // The oldest entry got evicted.
        assert!(pool.acquire(&startup("a"), false).await.is_none());
        let b = pool.acquire(&startup("b"), false).await.unwrap();
        assert_ne!(b.key, oldest_key);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let pool = Pool::with_capacity(4);
        pool.release(idle_entry("a")).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.sweep(Duration::from_millis(5)).await;

        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_close_idle() {
        let pool = Pool::with_capacity(4);
        pool.release(idle_entry("a")).await;
        pool.release(idle_entry("b")).await;
        assert_eq!(pool.idle_count(), 2);

        pool.close_idle().await;
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_conn_info_cleared_on_discard() {
        let pool = Pool::with_capacity(4);
        let entry = idle_entry("a");
        let key: BackendKeyData = entry.key;
        conn_info::register(key, vec![]);

        pool.discard(entry).await;
        assert!(conn_info::lookup(key.pid, key.secret).is_none());
    }
}
