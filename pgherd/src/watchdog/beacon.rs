//! JSON payloads exchanged between watchdog peers.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::cluster::{NodeOpFlags, NodeOpKind, NodeOpRequest};

/// AddNode handshake payload: who we are plus an auth hash.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeIdentity {
    pub node_name: String,
    pub wd_port: u16,
    pub pgherd_port: u16,
    pub state: i32,
    pub priority: i32,
    pub startup_time: u64,
    pub auth_hash: String,
    /// Handshake compatibility version.
    pub version: u8,
}

pub const HANDSHAKE_VERSION: u8 = 1;

impl NodeIdentity {
    /// Compute the auth hash for these identity fields. The canonical
    /// string must stay bit-identical across versions so deployed
    /// peers keep interoperating.
    pub fn compute_hash(state: i32, wd_port: u16, auth_key: &str) -> String {
        let canonical = format!("state={} wd_port={}", state, wd_port);
        let mut hasher = Sha1::new();
        hasher.update(canonical.as_bytes());
        hasher.update(auth_key.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect()
    }

    /// Verify the embedded hash against the shared key.
    pub fn verify(&self, auth_key: &str) -> bool {
        self.auth_hash == Self::compute_hash(self.state, self.wd_port, auth_key)
    }
}

/// Node info and coordinator beacon payload.
///
/// Arbitration fields are optional: a peer running an older build
/// may omit them, which arbitration treats as insufficient data.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Beacon {
    pub node_name: String,
    pub state: i32,
    pub priority: i32,
    pub startup_time: u64,
    #[serde(default)]
    pub escalated: Option<bool>,
    #[serde(default)]
    pub quorum: Option<i32>,
    #[serde(default)]
    pub standby_count: Option<u32>,
    #[serde(default)]
    pub state_time: Option<u64>,
}

/// A failover request forwarded between peers (Data frames).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FailoverRequestMsg {
    pub kind: String,
    pub nodes: Vec<usize>,
    #[serde(default)]
    pub switchover: bool,
    #[serde(default)]
    pub confirmed: bool,
}

impl FailoverRequestMsg {
    pub fn from_request(request: &NodeOpRequest) -> Self {
        Self {
            kind: match request.kind {
                NodeOpKind::Up => "up",
                NodeOpKind::Down => "down",
                NodeOpKind::Recovery => "recovery",
                NodeOpKind::CloseIdle => "close_idle",
                NodeOpKind::Promote => "promote",
                NodeOpKind::Quarantine => "quarantine",
            }
            .into(),
            nodes: request.nodes.clone(),
            switchover: request.flags.switchover,
            confirmed: request.flags.confirmed,
        }
    }

    pub fn to_request(&self) -> Option<NodeOpRequest> {
        let kind = match self.kind.as_str() {
            "up" => NodeOpKind::Up,
            "down" => NodeOpKind::Down,
            "recovery" => NodeOpKind::Recovery,
            "close_idle" => NodeOpKind::CloseIdle,
            "promote" => NodeOpKind::Promote,
            "quarantine" => NodeOpKind::Quarantine,
            _ => return None,
        };

        Some(NodeOpRequest::new(
            kind,
            self.nodes.clone(),
            NodeOpFlags {
                switchover: self.switchover,
                from_watchdog: true,
                confirmed: self.confirmed,
                update_only: false,
            },
        ))
    }
}

/// Backend statuses attached to FailoverEnd so standbys converge.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BackendStateSync {
    /// (node id, status name) pairs.
    pub nodes: Vec<(usize, String)>,
}

/// Reply payloads for forwarded failover requests.
pub mod verdicts {
    pub const WILL_BE_DONE: &str = "WILL_BE_DONE";
    pub const BUILDING_CONSENSUS: &str = "BUILDING_CONSENSUS";
    pub const NO_QUORUM: &str = "NO_QUORUM";
    pub const CONSENSUS_MAY_FAIL: &str = "CONSENSUS_MAY_FAIL";
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_auth_hash_stable() {
        let a = NodeIdentity::compute_hash(4, 9000, "secret");
        let b = NodeIdentity::compute_hash(4, 9000, "secret");
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);

        assert_ne!(a, NodeIdentity::compute_hash(4, 9001, "secret"));
        assert_ne!(a, NodeIdentity::compute_hash(4, 9000, "other"));
    }

    #[test]
    fn test_identity_verify() {
        let identity = NodeIdentity {
            node_name: "herd0".into(),
            wd_port: 9000,
            pgherd_port: 9999,
            state: 1,
            priority: 1,
            startup_time: 1000,
            auth_hash: NodeIdentity::compute_hash(1, 9000, "key"),
            version: HANDSHAKE_VERSION,
        };

        assert!(identity.verify("key"));
        assert!(!identity.verify("wrong"));
    }

    #[test]
    fn test_beacon_missing_fields() {
        // A beacon without arbitration fields still parses.
        let beacon: Beacon =
            serde_json::from_str(r#"{"node_name":"x","state":4,"priority":1,"startup_time":1}"#)
                .unwrap();
        assert!(beacon.escalated.is_none());
        assert!(beacon.state_time.is_none());
    }

    #[test]
    fn test_failover_request_roundtrip() {
        let request = NodeOpRequest::down(2);
        let msg = FailoverRequestMsg::from_request(&request);
        let back = msg.to_request().unwrap();
        assert_eq!(back.kind, request.kind);
        assert_eq!(back.nodes, request.nodes);
        assert!(back.flags.from_watchdog);
    }
}
