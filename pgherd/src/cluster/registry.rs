//! Shared cluster registry.
//!
//! One writer per field: session tasks read snapshots, the failover
//! executor writes status transitions. A watch channel tells
//! long-lived readers to refresh their snapshot at the next loop
//! boundary.

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::info;

use crate::config::{Config, Role};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Status of a backend node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Accepting connections.
    Up,
    /// Valid but no connection made yet.
    ConnectWait,
    /// Detached.
    Down,
    /// Excluded from routing, pending consensus to go Down.
    Quarantined,
}

impl NodeStatus {
    /// The node may serve traffic.
    pub fn live(&self) -> bool {
        matches!(self, NodeStatus::Up | NodeStatus::ConnectWait)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Up => write!(f, "up"),
            NodeStatus::ConnectWait => write!(f, "waiting"),
            NodeStatus::Down => write!(f, "down"),
            NodeStatus::Quarantined => write!(f, "quarantine"),
        }
    }
}

/// Get the global registry.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// One backend node as seen by every part of the proxy.
#[derive(Debug, Clone)]
pub struct BackendNode {
    pub id: usize,
    pub host: String,
    pub port: u16,
    pub weight: f64,
    pub role: Role,
    pub status: NodeStatus,
    /// When the status last changed.
    pub since: SystemTime,
}

impl BackendNode {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Node can serve traffic.
    pub fn live(&self) -> bool {
        self.status.live()
    }
}

#[derive(Default)]
struct Inner {
    nodes: Vec<BackendNode>,
    primary: Option<usize>,
    switching: bool,
}

/// Shared cluster registry.
pub struct Registry {
    inner: RwLock<Inner>,
    conn_counter: Mutex<usize>,
    version: watch::Sender<u64>,
}

impl Registry {
    fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: RwLock::new(Inner::default()),
            conn_counter: Mutex::new(0),
            version,
        }
    }

    /// Populate the registry from configuration, optionally seeding
    /// statuses persisted by a previous run.
    pub fn init(&self, config: &Config, statuses: Option<Vec<NodeStatus>>) {
        let mut inner = self.inner.write();

        inner.nodes = config
            .backends
            .iter()
            .enumerate()
            .map(|(id, backend)| BackendNode {
                id,
                host: backend.host.clone(),
                port: backend.port,
                weight: backend.weight,
                role: backend.role,
                status: statuses
                    .as_ref()
                    .and_then(|s| s.get(id).copied())
                    .unwrap_or(NodeStatus::ConnectWait),
                since: SystemTime::now(),
            })
            .collect();

        inner.primary = inner
            .nodes
            .iter()
            .find(|node| node.role == Role::Primary && node.live())
            .map(|node| node.id);
        inner.switching = false;

        drop(inner);
        self.bump();
    }

    /// Copy of the node table. Long-lived readers hold one of these
    /// and refresh when the version changes.
    pub fn snapshot(&self) -> Vec<BackendNode> {
        self.inner.read().nodes.clone()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    /// Lowest-indexed live node.
    pub fn master_node_id(&self) -> Option<usize> {
        self.inner.read().nodes.iter().find(|n| n.live()).map(|n| n.id)
    }

    /// Current primary in streaming-replication mode.
    pub fn primary_node_id(&self) -> Option<usize> {
        self.inner.read().primary
    }

    pub fn set_primary(&self, primary: Option<usize>) {
        {
            let mut inner = self.inner.write();
            if inner.primary == primary {
                return;
            }
            inner.primary = primary;
            if let Some(id) = primary {
                if let Some(node) = inner.nodes.get_mut(id) {
                    node.role = Role::Primary;
                }
            }
        }
        self.bump();
    }

    /// Change one node's status. Returns false if it was already there.
    pub fn set_status(&self, id: usize, status: NodeStatus) -> bool {
        {
            let mut inner = self.inner.write();
            let Some(node) = inner.nodes.get_mut(id) else {
                return false;
            };
            if node.status == status {
                return false;
            }
            info!(
                "backend {} ({}) status {} -> {}",
                id,
                node.addr(),
                node.status,
                status
            );
            node.status = status;
            node.since = SystemTime::now();

            // A primary that went away is no longer the primary.
            if !status.live() && inner.primary == Some(id) {
                inner.primary = None;
            }
        }
        self.bump();
        true
    }

    /// Any node is accepting connections.
    pub fn any_live(&self) -> bool {
        self.inner.read().nodes.iter().any(|n| n.live())
    }

    /// Failover in progress.
    pub fn switching(&self) -> bool {
        self.inner.read().switching
    }

    pub fn set_switching(&self, switching: bool) {
        self.inner.write().switching = switching;
        self.bump();
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Count a new frontend connection. Returns the new total.
    pub fn connect(&self) -> usize {
        let mut counter = self.conn_counter.lock();
        *counter += 1;
        *counter
    }

    /// A frontend disconnected.
    pub fn disconnect(&self) {
        let mut counter = self.conn_counter.lock();
        *counter = counter.saturating_sub(1);
    }

    /// Currently connected frontends.
    pub fn connections(&self) -> usize {
        *self.conn_counter.lock()
    }

    #[cfg(test)]
    pub fn reset_for_tests(&self) {
        *self.inner.write() = Inner::default();
        *self.conn_counter.lock() = 0;
    }
}
