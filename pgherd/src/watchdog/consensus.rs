//! Failover consensus engine.
//!
//! Runs only at the coordinator. Votes for the same `(kind, nodes)`
//! accumulate in a failover object until the minimum is reached or
//! the object times out.

use tracing::debug;

use crate::cluster::{NodeOpKind, NodeOpRequest};

/// Objects older than this are retired unexecuted.
pub const FAILOVER_OBJECT_TIMEOUT_SECS: u64 = 15;

/// What the engine decided for one incoming vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Execute the failover now.
    Proceed,
    /// Not enough live standbys to decide anything.
    NoQuorum,
    /// Vote counted; waiting for more.
    BuildingConsensus,
    /// Duplicate vote from the same node; consensus may never build.
    ConsensusMayFail,
}

/// Cluster facts the engine needs to resolve a vote.
#[derive(Debug, Clone, Copy)]
pub struct ClusterView {
    /// Watchdog nodes in the cluster, including us.
    pub total: usize,
    pub quorum_ok: bool,
    pub require_consensus: bool,
    pub half_votes: bool,
    pub allow_multi_vote: bool,
}

/// Accumulates votes for one failover request.
#[derive(Debug, Clone)]
pub struct FailoverObject {
    pub id: u32,
    pub kind: NodeOpKind,
    pub nodes: Vec<usize>,
    /// Who voted; None is the local node.
    pub requesting_peers: Vec<Option<usize>>,
    pub vote_count: usize,
    pub start_time: u64,
    pub request: NodeOpRequest,
}

/// Minimum votes needed to execute a failover.
pub fn min_votes(total: usize, half_votes: bool) -> usize {
    if total % 2 == 1 {
        total.div_ceil(2)
    } else if half_votes {
        total / 2
    } else {
        total / 2 + 1
    }
}

/// The cluster has enough members to make decisions.
/// `voting` includes the local node.
pub fn quorum_exists(voting: usize, total: usize, half_votes: bool) -> bool {
    if total % 2 == 0 && half_votes {
        voting * 2 >= total
    } else {
        voting * 2 > total
    }
}

/// Kinds that change cluster topology and therefore need votes.
fn requires_consensus(kind: NodeOpKind) -> bool {
    matches!(kind, NodeOpKind::Down | NodeOpKind::Promote)
}

#[derive(Debug, Default)]
pub struct ConsensusEngine {
    objects: Vec<FailoverObject>,
    next_id: u32,
}

impl ConsensusEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one vote and decide.
    pub fn resolve(
        &mut self,
        request: &NodeOpRequest,
        from: Option<usize>,
        view: &ClusterView,
        now: u64,
    ) -> Verdict {
        // Fast paths: some requests never wait for votes.
        if !view.require_consensus
            || request.flags.confirmed
            || !requires_consensus(request.kind)
        {
            return Verdict::Proceed;
        }

        if !view.quorum_ok {
            return Verdict::NoQuorum;
        }

        let needed = min_votes(view.total, view.half_votes);

        let object = match self
            .objects
            .iter_mut()
            .find(|object| object.kind == request.kind && object.nodes == request.nodes)
        {
            Some(object) => object,
            None => {
                let id = self.next_id;
                self.next_id = self.next_id.wrapping_add(1);
                self.objects.push(FailoverObject {
                    id,
                    kind: request.kind,
                    nodes: request.nodes.clone(),
                    requesting_peers: Vec::new(),
                    vote_count: 0,
                    start_time: now,
                    request: request.clone(),
                });
                self.objects.last_mut().unwrap()
            }
        };

        if object.requesting_peers.contains(&from) && !view.allow_multi_vote {
            return Verdict::ConsensusMayFail;
        }

        object.requesting_peers.push(from);
        object.vote_count += 1;

        debug!(
            "failover object {:?}/{:?} has {}/{} votes",
            object.kind, object.nodes, object.vote_count, needed
        );

        if object.vote_count >= needed {
            let position = self
                .objects
                .iter()
                .position(|object| object.kind == request.kind && object.nodes == request.nodes)
                .unwrap();
            self.objects.remove(position);
            Verdict::Proceed
        } else {
            Verdict::BuildingConsensus
        }
    }

    /// Retire objects that never reached consensus.
    pub fn sweep(&mut self, now: u64) -> Vec<FailoverObject> {
        let mut expired = Vec::new();
        let mut i = 0;
        while i < self.objects.len() {
            if now.saturating_sub(self.objects[i].start_time) >= FAILOVER_OBJECT_TIMEOUT_SECS {
                expired.push(self.objects.remove(i));
            } else {
                i += 1;
            }
        }
        expired
    }

    /// Drop everything; called when coordinatorship is lost.
    pub fn clear(&mut self) {
        self.objects.clear();
    }

    pub fn pending(&self) -> usize {
        self.objects.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn view(total: usize) -> ClusterView {
        ClusterView {
            total,
            quorum_ok: true,
            require_consensus: true,
            half_votes: false,
            allow_multi_vote: false,
        }
    }

    #[test]
    fn test_min_votes() {
        assert_eq!(min_votes(3, false), 2);
        assert_eq!(min_votes(5, false), 3);
        assert_eq!(min_votes(4, false), 3);
        assert_eq!(min_votes(4, true), 2);
        assert_eq!(min_votes(2, true), 1);
        assert_eq!(min_votes(2, false), 2);
    }

    #[test]
    fn test_quorum() {
        assert!(quorum_exists(2, 3, false));
        assert!(!quorum_exists(1, 3, false));
        assert!(quorum_exists(3, 5, false));
        assert!(!quorum_exists(2, 4, false));
        assert!(quorum_exists(2, 4, true));
    }

    #[test]
    fn test_five_node_consensus() {
        // Three of five peers vote the same node down.
        let mut engine = ConsensusEngine::new();
        let request = NodeOpRequest::down(2);
        let view = view(5);

        assert_eq!(
            engine.resolve(&request, None, &view, 100),
            Verdict::BuildingConsensus
        );
        assert_eq!(
            engine.resolve(&request, Some(1), &view, 101),
            Verdict::BuildingConsensus
        );
        assert_eq!(engine.resolve(&request, Some(2), &view, 102), Verdict::Proceed);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_duplicate_vote_rejected() {
        let mut engine = ConsensusEngine::new();
        let request = NodeOpRequest::down(1);
        let view = view(5);

        engine.resolve(&request, Some(1), &view, 100);
        assert_eq!(
            engine.resolve(&request, Some(1), &view, 101),
            Verdict::ConsensusMayFail
        );

        // Vote count didn't move.
        assert_eq!(engine.pending(), 1);
    }

    #[test]
    fn test_multi_vote_allowed() {
        let mut engine = ConsensusEngine::new();
        let request = NodeOpRequest::down(1);
        let mut view = view(3);
        view.allow_multi_vote = true;

        assert_eq!(
            engine.resolve(&request, Some(1), &view, 100),
            Verdict::BuildingConsensus
        );
        assert_eq!(engine.resolve(&request, Some(1), &view, 101), Verdict::Proceed);
    }

    #[test]
    fn test_vote_count_bounded_by_peers_plus_one() {
        // Without multi-vote, every voter is distinct: the local node
        // plus one vote per peer.
        let mut engine = ConsensusEngine::new();
        let request = NodeOpRequest::down(1);
        let mut view = view(100);
        view.quorum_ok = true;

        engine.resolve(&request, None, &view, 100);
        for peer in 0..4 {
            engine.resolve(&request, Some(peer), &view, 100);
        }
        // Replays change nothing.
        engine.resolve(&request, None, &view, 100);
        engine.resolve(&request, Some(3), &view, 100);

        assert_eq!(engine.pending(), 1);
        let object = &engine.sweep(200)[0];
        assert_eq!(object.vote_count, 5);
        assert!(object.vote_count <= 4 + 1);
    }

    #[test]
    fn test_no_quorum() {
        let mut engine = ConsensusEngine::new();
        let request = NodeOpRequest::down(1);
        let mut view = view(5);
        view.quorum_ok = false;

        assert_eq!(engine.resolve(&request, None, &view, 100), Verdict::NoQuorum);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_confirmed_skips_consensus() {
        let mut engine = ConsensusEngine::new();
        let mut request = NodeOpRequest::down(1);
        request.flags.confirmed = true;

        assert_eq!(engine.resolve(&request, None, &view(5), 100), Verdict::Proceed);
    }

    #[test]
    fn test_sweep() {
        let mut engine = ConsensusEngine::new();
        let request = NodeOpRequest::down(1);
        engine.resolve(&request, None, &view(5), 100);

        assert!(engine.sweep(114).is_empty());
        let expired = engine.sweep(115);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].vote_count, 1);
        assert_eq!(engine.pending(), 0);
    }
}
