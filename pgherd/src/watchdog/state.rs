//! Watchdog node states.

use serde::{Deserialize, Serialize};

/// Life cycle of a watchdog node, local or remote.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WdState {
    #[default]
    Dead,
    Loading,
    Joining,
    Initializing,
    Coordinator,
    ParticipateInElection,
    StandForCoordinator,
    Standby,
    Lost,
    InNetworkTrouble,
    Shutdown,
    /// We sent this peer an AddNode and are waiting for its reply.
    AddMessageSent,
}

impl WdState {
    /// Numeric form used in the handshake auth hash and beacons.
    pub fn as_i32(&self) -> i32 {
        use WdState::*;
        match self {
            Dead => 0,
            Loading => 1,
            Joining => 2,
            Initializing => 3,
            Coordinator => 4,
            ParticipateInElection => 5,
            StandForCoordinator => 6,
            Standby => 7,
            Lost => 8,
            InNetworkTrouble => 9,
            Shutdown => 10,
            AddMessageSent => 11,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        use WdState::*;
        match value {
            1 => Loading,
            2 => Joining,
            3 => Initializing,
            4 => Coordinator,
            5 => ParticipateInElection,
            6 => StandForCoordinator,
            7 => Standby,
            8 => Lost,
            9 => InNetworkTrouble,
            10 => Shutdown,
            11 => AddMessageSent,
            _ => Dead,
        }
    }
}

impl std::fmt::Display for WdState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use WdState::*;
        let name = match self {
            Dead => "DEAD",
            Loading => "LOADING",
            Joining => "JOINING",
            Initializing => "INITIALIZING",
            Coordinator => "MASTER",
            ParticipateInElection => "PARTICIPATING IN ELECTION",
            StandForCoordinator => "STANDING FOR MASTER",
            Standby => "STANDBY",
            Lost => "LOST",
            InNetworkTrouble => "IN NETWORK TROUBLE",
            Shutdown => "SHUTDOWN",
            AddMessageSent => "ADD MESSAGE SENT",
        };
        write!(f, "{}", name)
    }
}
