//! Node operation request channel.
//!
//! Any session or health probe can ask for a backend state change.
//! Requests land in a bounded ring and are drained by the failover
//! executor, which coalesces duplicates before acting.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::warn;

const QUEUE_CAPACITY: usize = 128;

static QUEUE: Lazy<RequestQueue> = Lazy::new(RequestQueue::new);

/// Get the global request queue.
pub fn requests() -> &'static RequestQueue {
    &QUEUE
}

/// What should happen to a set of nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeOpKind {
    /// Attach a node.
    Up,
    /// Detach a node.
    Down,
    /// Online recovery of a node.
    Recovery,
    /// Close idle pooled connections.
    CloseIdle,
    /// Promote a node to primary.
    Promote,
    /// Exclude from routing pending consensus.
    Quarantine,
}

/// Request modifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NodeOpFlags {
    /// Planned switchover, not a failure.
    pub switchover: bool,
    /// Originated from a watchdog peer.
    pub from_watchdog: bool,
    /// Consensus already reached; execute without another round.
    pub confirmed: bool,
    /// Only rewrite statuses, don't run failover machinery.
    pub update_only: bool,
}

/// One queued request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeOpRequest {
    pub kind: NodeOpKind,
    /// Affected node ids, kept sorted so identical requests compare equal.
    pub nodes: Vec<usize>,
    pub flags: NodeOpFlags,
}

impl NodeOpRequest {
    pub fn new(kind: NodeOpKind, mut nodes: Vec<usize>, flags: NodeOpFlags) -> Self {
        nodes.sort_unstable();
        nodes.dedup();
        Self { kind, nodes, flags }
    }

    /// A node failure report with default flags.
    pub fn down(node: usize) -> Self {
        Self::new(NodeOpKind::Down, vec![node], NodeOpFlags::default())
    }
}

/// Bounded request ring.
pub struct RequestQueue {
    ring: Mutex<VecDeque<NodeOpRequest>>,
    notify: Notify,
}

impl RequestQueue {
    fn new() -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            notify: Notify::new(),
        }
    }

    /// Queue a request. Returns false when the ring is full.
    pub fn submit(&self, request: NodeOpRequest) -> bool {
        {
            let mut ring = self.ring.lock();
            if ring.len() >= QUEUE_CAPACITY {
                warn!("node operation queue full, dropping {:?}", request);
                return false;
            }
            ring.push_back(request);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for requests and drain them all, deduplicated in
    /// arrival order.
    pub async fn next_batch(&self) -> Vec<NodeOpRequest> {
        loop {
            {
                let mut ring = self.ring.lock();
                if !ring.is_empty() {
                    let mut batch: Vec<NodeOpRequest> = Vec::with_capacity(ring.len());
                    while let Some(request) = ring.pop_front() {
                        if !batch.contains(&request) {
                            batch.push(request);
                        }
                    }
                    return batch;
                }
            }

            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    pub fn drain_for_tests(&self) -> Vec<NodeOpRequest> {
        self.ring.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_coalescing() {
        let queue = RequestQueue::new();
        assert!(queue.submit(NodeOpRequest::down(1)));
        assert!(queue.submit(NodeOpRequest::down(1)));
        assert!(queue.submit(NodeOpRequest::down(2)));

        let batch = queue.next_batch().await;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].nodes, vec![1]);
        assert_eq!(batch[1].nodes, vec![2]);
    }

    #[test]
    fn test_bounded() {
        let queue = RequestQueue::new();
        for _ in 0..QUEUE_CAPACITY {
            assert!(queue.submit(NodeOpRequest::down(1)));
        }
        assert!(!queue.submit(NodeOpRequest::down(1)));
    }

    #[test]
    fn test_node_list_sorted() {
        let request = NodeOpRequest::new(
            NodeOpKind::Down,
            vec![3, 1, 2, 1],
            NodeOpFlags::default(),
        );
        assert_eq!(request.nodes, vec![1, 2, 3]);
    }
}
