//! Remote peer bookkeeping.

use crate::config::WatchdogPeer;

use super::beacon::Beacon;
use super::state::WdState;

/// Everything the state machine knows about one remote peer.
/// Socket handles live in the transport; this is pure state.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: usize,
    pub name: String,
    pub host: String,
    pub wd_port: u16,
    pub pgherd_port: u16,
    /// Last state the peer reported.
    pub state: WdState,
    pub priority: i32,
    pub startup_time: u64,
    pub escalated: bool,
    pub quorum: i32,
    pub standby_count: u32,
    pub state_time: u64,
    /// Any socket to this peer is connected.
    pub reachable: bool,
    /// Peer joined us as a standby (we are coordinator).
    pub is_standby: bool,
    /// Last time we heard anything from the peer, epoch seconds.
    pub last_rcv: u64,
}

impl Peer {
    pub fn from_config(id: usize, config: &WatchdogPeer) -> Self {
        Self {
            id,
            name: config.node_name.clone(),
            host: config.host.clone(),
            wd_port: config.wd_port,
            pgherd_port: config.pgherd_port,
            state: WdState::Dead,
            priority: 0,
            startup_time: 0,
            escalated: false,
            quorum: -1,
            standby_count: 0,
            state_time: 0,
            reachable: false,
            is_standby: false,
            last_rcv: 0,
        }
    }

    /// Fold a received beacon or info payload into the peer record.
    pub fn absorb(&mut self, beacon: &Beacon, now: u64) {
        self.state = WdState::from_i32(beacon.state);
        self.priority = beacon.priority;
        self.startup_time = beacon.startup_time;
        if let Some(escalated) = beacon.escalated {
            self.escalated = escalated;
        }
        if let Some(quorum) = beacon.quorum {
            self.quorum = quorum;
        }
        if let Some(standby_count) = beacon.standby_count {
            self.standby_count = standby_count;
        }
        if let Some(state_time) = beacon.state_time {
            self.state_time = state_time;
        }
        self.last_rcv = now;
    }

    /// The peer matches a handshake identity.
    pub fn matches(&self, name: &str, wd_port: u16, pgherd_port: u16) -> bool {
        self.name == name && self.wd_port == wd_port && self.pgherd_port == pgherd_port
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_peer() -> Peer {
        Peer::from_config(
            0,
            &WatchdogPeer {
                node_name: "herd1".into(),
                host: "10.0.1.2".into(),
                wd_port: 9000,
                pgherd_port: 9999,
            },
        )
    }

    #[test]
    fn test_absorb() {
        let mut peer = test_peer();
        peer.absorb(
            &Beacon {
                node_name: "herd1".into(),
                state: WdState::Coordinator.as_i32(),
                priority: 5,
                startup_time: 100,
                escalated: Some(true),
                quorum: Some(1),
                standby_count: Some(2),
                state_time: Some(500),
            },
            1000,
        );

        assert_eq!(peer.state, WdState::Coordinator);
        assert_eq!(peer.priority, 5);
        assert!(peer.escalated);
        assert_eq!(peer.standby_count, 2);
        assert_eq!(peer.last_rcv, 1000);
    }

    #[test]
    fn test_matches() {
        let peer = test_peer();
        assert!(peer.matches("herd1", 9000, 9999));
        assert!(!peer.matches("herd1", 9001, 9999));
        assert!(!peer.matches("herd2", 9000, 9999));
    }
}
