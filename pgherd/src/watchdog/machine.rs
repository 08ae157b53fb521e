//! Watchdog state machine.
//!
//! A synchronous core: events go in, actions come out. Sockets,
//! timers and process control live in the async shell (`run`), which
//! keeps this logic deterministic and testable.

use tracing::{debug, info, warn};

use crate::cluster::{registry, NodeOpKind, NodeOpRequest, NodeStatus};
use crate::config::WatchdogPeer;

use super::beacon::{
    verdicts, Beacon, FailoverRequestMsg, NodeIdentity, HANDSHAKE_VERSION,
};
use super::command::{ClusterCommand, CommandBus, CommandOutcome};
use super::consensus::{ClusterView, ConsensusEngine, Verdict};
use super::packet::{ClusterServiceMsg, PacketType, WdPacket};
use super::peer::Peer;
use super::state::WdState;

/// Coordinator beacon period.
pub const BEACON_INTERVAL_SECS: u64 = 10;
/// Loading and election wait.
pub const ELECTION_TIMEOUT_SECS: u64 = 5;
/// Initializing decision delay.
pub const INIT_TIMEOUT_SECS: u64 = 1;
/// StandForCoordinator / DeclareCoordinator command deadline.
pub const COMMAND_TIMEOUT_SECS: u64 = 4;
/// JoinCoordinator command deadline.
pub const JOIN_TIMEOUT_SECS: u64 = 5;
/// ReqInfo command deadline.
pub const REQ_INFO_TIMEOUT_SECS: u64 = 5;

/// Input to the state machine.
#[derive(Debug)]
pub enum WdEvent {
    /// The single state timer fired.
    Timeout,
    /// One-second housekeeping tick.
    Tick,
    PacketReceived { peer: usize, packet: WdPacket },
    SendFailed { peer: usize, command_id: u32 },
    NewOutboundConnection { peer: usize },
    RemoteNodeLost { peer: usize },
    RemoteNodeFound { peer: usize },
    /// We can't see our own network anymore.
    LocalNodeLost,
    NwIpRemoved,
    NwIpAssigned,
    NwLinkInactive,
    NwLinkActive,
    /// A failover request from this node's request channel.
    LocalFailoverRequest(NodeOpRequest),
    ShutdownRequested,
}

/// Output of the state machine, applied by the shell.
#[derive(Debug, Clone, PartialEq)]
pub enum WdAction {
    Send { peer: usize, packet: WdPacket },
    Broadcast(WdPacket),
    /// (Re)arm the state timer.
    SetTimer(u64),
    CancelTimer,
    /// Acquire the delegate IP via the external command.
    Escalate,
    /// Release the delegate IP.
    DeEscalate,
    /// Run a node operation through the cluster registry.
    ExecuteFailover(NodeOpRequest),
    /// Broadcast FailoverEnd with current backend statuses.
    BroadcastFailoverEnd,
    /// Mark failover in progress for local sessions.
    SetSwitching(bool),
    /// Apply backend statuses announced by the coordinator.
    SyncBackendState(Vec<(usize, String)>),
    /// Network isolation; die rather than act on stale authority.
    FatalExit(String),
}

/// Who we currently believe is coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterNode {
    Local,
    Peer(usize),
}

/// Split-brain arbitration verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitBrainDecision {
    IStay,
    PeerStays,
    NeedsElection,
}

/// Local coordinator facts fed into arbitration.
#[derive(Debug, Clone)]
pub struct ArbitrationView {
    pub node_name: String,
    pub escalated: bool,
    pub quorum: i32,
    pub standby_count: u32,
    pub state_time: u64,
}

/// Decide which of two simultaneous coordinators survives. Both
/// sides run this against the other's beacon and must reach
/// opposite conclusions.
pub fn resolve_split_brain(local: &ArbitrationView, remote: &Beacon) -> SplitBrainDecision {
    use SplitBrainDecision::*;

    let (Some(r_escalated), Some(r_quorum), Some(r_standby), Some(r_time)) = (
        remote.escalated,
        remote.quorum,
        remote.standby_count,
        remote.state_time,
    ) else {
        return NeedsElection;
    };

    // The holder of the delegate IP wins outright.
    if r_escalated != local.escalated {
        return if r_escalated { PeerStays } else { IStay };
    }

    if r_quorum != local.quorum {
        return if r_quorum > local.quorum {
            PeerStays
        } else {
            IStay
        };
    }

    if r_standby != local.standby_count {
        return if r_standby > local.standby_count {
            PeerStays
        } else {
            IStay
        };
    }

    match (local.state_time, r_time) {
        // Neither side has a usable clock; break the tie on names so
        // the two sides still disagree about who resigns.
        (0, 0) => name_tie_break(local, &remote.node_name),
        // One-sided missing data can't be arbitrated.
        (0, _) | (_, 0) => NeedsElection,
        (l, r) if l == r => name_tie_break(local, &remote.node_name),
        // The longer-standing coordinator wins.
        (l, r) => {
            if r < l {
                PeerStays
            } else {
                IStay
            }
        }
    }
}

fn name_tie_break(local: &ArbitrationView, remote_name: &str) -> SplitBrainDecision {
    if remote_name < local.node_name.as_str() {
        SplitBrainDecision::PeerStays
    } else {
        SplitBrainDecision::IStay
    }
}

/// Machine construction parameters, decoupled from the config file.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub node_name: String,
    pub wd_port: u16,
    pub pgherd_port: u16,
    pub priority: i32,
    pub auth_key: String,
    pub peers: Vec<WatchdogPeer>,
    pub require_consensus: bool,
    pub half_votes: bool,
    pub allow_multi_vote: bool,
    pub startup_time: u64,
}

/// The watchdog state machine.
pub struct Machine {
    name: String,
    wd_port: u16,
    pgherd_port: u16,
    priority: i32,
    auth_key: String,
    startup_time: u64,

    state: WdState,
    state_time: u64,
    escalated: bool,
    quorum_ok: bool,
    master: Option<MasterNode>,
    master_last_seen: u64,
    last_beacon: u64,
    last_probe: u64,

    peers: Vec<Peer>,
    commands: CommandBus,
    consensus: ConsensusEngine,

    require_consensus: bool,
    half_votes: bool,
    allow_multi_vote: bool,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        let peers = config
            .peers
            .iter()
            .enumerate()
            .map(|(id, peer)| Peer::from_config(id, peer))
            .collect();

        Self {
            name: config.node_name,
            wd_port: config.wd_port,
            pgherd_port: config.pgherd_port,
            priority: config.priority,
            auth_key: config.auth_key,
            startup_time: config.startup_time,
            state: WdState::Dead,
            state_time: 0,
            escalated: false,
            quorum_ok: false,
            master: None,
            master_last_seen: 0,
            last_beacon: 0,
            last_probe: 0,
            peers,
            commands: CommandBus::new(),
            consensus: ConsensusEngine::new(),
            require_consensus: config.require_consensus,
            half_votes: config.half_votes,
            allow_multi_vote: config.allow_multi_vote,
        }
    }

    pub fn state(&self) -> WdState {
        self.state
    }

    pub fn master(&self) -> Option<MasterNode> {
        self.master
    }

    pub fn escalated(&self) -> bool {
        self.escalated
    }

    /// Quorum from this node's point of view.
    pub fn quorum_ok(&self) -> bool {
        self.compute_quorum()
    }

    /// Peers currently joined to us as standbys.
    pub fn standby_count(&self) -> u32 {
        self.peers
            .iter()
            .filter(|peer| peer.reachable && peer.is_standby)
            .count() as u32
    }

    pub fn peer(&self, id: usize) -> Option<&Peer> {
        self.peers.get(id)
    }

    /// Boot the machine.
    pub fn start(&mut self, now: u64) -> Vec<WdAction> {
        let mut actions = Vec::new();
        self.transition(WdState::Loading, now, &mut actions);
        actions
    }

    /// The single entry point: fold one event into the machine.
    pub fn dispatch(&mut self, event: WdEvent, now: u64) -> Vec<WdAction> {
        let mut actions = Vec::new();

        match event {
            WdEvent::Timeout => self.on_timeout(now, &mut actions),
            WdEvent::Tick => self.on_tick(now, &mut actions),
            WdEvent::PacketReceived { peer, packet } => {
                self.on_packet(peer, packet, now, &mut actions)
            }
            WdEvent::SendFailed { peer, command_id } => {
                self.commands.on_send_failed(command_id, peer);
            }
            WdEvent::NewOutboundConnection { peer } => {
                if let Some(record) = self.peers.get_mut(peer) {
                    record.reachable = true;
                }
                // Introduce ourselves on every fresh connection.
                actions.push(WdAction::Send {
                    peer,
                    packet: self.add_node_packet(0),
                });
            }
            WdEvent::RemoteNodeLost { peer } => {
                self.on_remote_lost(peer, now, &mut actions);
            }
            WdEvent::RemoteNodeFound { peer } => {
                if let Some(record) = self.peers.get_mut(peer) {
                    record.reachable = true;
                    record.last_rcv = now;
                }
            }
            WdEvent::LocalNodeLost => {
                self.transition(WdState::Lost, now, &mut actions);
            }
            WdEvent::NwIpRemoved | WdEvent::NwLinkInactive => {
                self.transition(WdState::InNetworkTrouble, now, &mut actions);
            }
            WdEvent::NwIpAssigned | WdEvent::NwLinkActive => {}
            WdEvent::LocalFailoverRequest(request) => {
                self.on_local_failover(request, now, &mut actions);
            }
            WdEvent::ShutdownRequested => {
                self.transition(WdState::Shutdown, now, &mut actions);
            }
        }

        actions
    }

    // ---- state transitions -------------------------------------------------

    fn transition(&mut self, state: WdState, now: u64, actions: &mut Vec<WdAction>) {
        if self.state == state {
            return;
        }

        info!("watchdog state {} -> {}", self.state, state);

        let was_coordinator = self.state == WdState::Coordinator;
        self.state = state;
        self.state_time = now;

        if was_coordinator && state != WdState::Coordinator {
            // Leadership lost: forget votes, drop the delegate IP.
            self.consensus.clear();
            if self.escalated {
                self.escalated = false;
                actions.push(WdAction::DeEscalate);
            }
            if self.master == Some(MasterNode::Local) {
                self.master = None;
            }
            for peer in self.peers.iter_mut() {
                peer.is_standby = false;
            }
        }

        match state {
            WdState::Loading => {
                let id = self.commands.next_id();
                let recipients: Vec<usize> = self.peers.iter().map(|peer| peer.id).collect();
                for peer in self.peers.iter_mut() {
                    peer.state = WdState::AddMessageSent;
                }
                let packet = self.add_node_packet(id);
                self.commands.track(
                    id,
                    PacketType::AddNode,
                    &recipients,
                    ELECTION_TIMEOUT_SECS,
                    now,
                );
                actions.push(WdAction::Broadcast(packet));
                actions.push(WdAction::SetTimer(ELECTION_TIMEOUT_SECS));
            }

            WdState::Joining => {
                self.master = None;
                let id = self.commands.next_id();
                let recipients: Vec<usize> = self
                    .peers
                    .iter()
                    .filter(|peer| peer.reachable)
                    .map(|peer| peer.id)
                    .collect();
                match self.commands.track(
                    id,
                    PacketType::ReqInfo,
                    &recipients,
                    REQ_INFO_TIMEOUT_SECS,
                    now,
                ) {
                    Some(_) => {
                        // Nobody to ask.
                        self.transition(WdState::Initializing, now, actions);
                    }
                    None => {
                        actions.push(WdAction::Broadcast(WdPacket::new(PacketType::ReqInfo, id)));
                    }
                }
            }

            WdState::Initializing => {
                actions.push(WdAction::SetTimer(INIT_TIMEOUT_SECS));
            }

            WdState::StandForCoordinator => {
                let id = self.commands.next_id();
                let recipients: Vec<usize> = self
                    .peers
                    .iter()
                    .filter(|peer| peer.reachable)
                    .map(|peer| peer.id)
                    .collect();
                match self.commands.track(
                    id,
                    PacketType::StandForCoordinator,
                    &recipients,
                    COMMAND_TIMEOUT_SECS,
                    now,
                ) {
                    Some(CommandOutcome::AllReplied) => {
                        // Alone in the cluster.
                        self.transition(WdState::Coordinator, now, actions);
                    }
                    _ => {
                        actions.push(WdAction::Broadcast(WdPacket::new(
                            PacketType::StandForCoordinator,
                            id,
                        )));
                    }
                }
            }

            WdState::ParticipateInElection => {
                actions.push(WdAction::SetTimer(ELECTION_TIMEOUT_SECS));
            }

            WdState::Coordinator => {
                self.master = Some(MasterNode::Local);
                let id = self.commands.next_id();
                let recipients: Vec<usize> = self
                    .peers
                    .iter()
                    .filter(|peer| peer.reachable)
                    .map(|peer| peer.id)
                    .collect();
                match self.commands.track(
                    id,
                    PacketType::DeclareCoordinator,
                    &recipients,
                    COMMAND_TIMEOUT_SECS,
                    now,
                ) {
                    Some(CommandOutcome::AllReplied) => {
                        self.coordinator_established(now, actions);
                    }
                    _ => {
                        actions.push(WdAction::Broadcast(WdPacket::new(
                            PacketType::DeclareCoordinator,
                            id,
                        )));
                    }
                }
            }

            WdState::Standby => {
                self.master_last_seen = now;
                if let Some(MasterNode::Peer(master)) = self.master {
                    let id = self.commands.next_id();
                    self.commands.track(
                        id,
                        PacketType::JoinCoordinator,
                        &[master],
                        JOIN_TIMEOUT_SECS,
                        now,
                    );
                    actions.push(WdAction::Send {
                        peer: master,
                        packet: WdPacket::new(PacketType::JoinCoordinator, id),
                    });
                } else {
                    self.transition(WdState::Joining, now, actions);
                }
            }

            WdState::Lost => {
                actions.push(WdAction::FatalExit("node lost its own network".into()));
            }

            WdState::InNetworkTrouble => {
                // Stale authority is worse than no authority.
                actions.push(WdAction::FatalExit(
                    "no monitored network interface is up".into(),
                ));
            }

            WdState::Shutdown => {
                if self.escalated {
                    self.escalated = false;
                    actions.push(WdAction::DeEscalate);
                }
                actions.push(WdAction::Broadcast(WdPacket::new(
                    PacketType::InformIAmGoingDown,
                    0,
                )));
            }

            WdState::Dead | WdState::AddMessageSent => {}
        }
    }

    fn coordinator_established(&mut self, now: u64, actions: &mut Vec<WdAction>) {
        self.master = Some(MasterNode::Local);
        self.quorum_ok = self.compute_quorum();
        self.last_beacon = now;

        info!(
            "established as coordinator, quorum {}",
            if self.quorum_ok { "present" } else { "absent" }
        );

        actions.push(WdAction::Broadcast(self.beacon_packet(now)));

        if self.quorum_ok && !self.escalated {
            self.escalated = true;
            actions.push(WdAction::Escalate);
        }
    }

    // ---- timers ------------------------------------------------------------

    fn on_timeout(&mut self, now: u64, actions: &mut Vec<WdAction>) {
        match self.state {
            WdState::Loading => self.transition(WdState::Joining, now, actions),

            WdState::Initializing => {
                if let Some(coordinator) = self
                    .peers
                    .iter()
                    .find(|peer| peer.reachable && peer.state == WdState::Coordinator)
                {
                    self.master = Some(MasterNode::Peer(coordinator.id));
                    self.transition(WdState::Standby, now, actions);
                } else if !self.peers.iter().any(|peer| peer.reachable) {
                    self.transition(WdState::Coordinator, now, actions);
                } else if self
                    .peers
                    .iter()
                    .any(|peer| peer.reachable && peer.state == WdState::StandForCoordinator)
                {
                    self.transition(WdState::ParticipateInElection, now, actions);
                } else {
                    self.transition(WdState::StandForCoordinator, now, actions);
                }
            }

            WdState::ParticipateInElection => {
                self.transition(WdState::Joining, now, actions);
            }

            _ => {}
        }
    }

    fn on_tick(&mut self, now: u64, actions: &mut Vec<WdAction>) {
        // Command deadlines.
        for (command, outcome) in self.commands.expired(now) {
            self.on_command_finished(command, outcome, now, actions);
        }

        // Failover objects that never built consensus.
        for object in self.consensus.sweep(now) {
            warn!(
                "failover request {:?}/{:?} expired with {} votes",
                object.kind, object.nodes, object.vote_count
            );
            self.check_resignation(&object, now, actions);
        }

        match self.state {
            WdState::Coordinator => {
                if now.saturating_sub(self.last_beacon) >= BEACON_INTERVAL_SECS {
                    self.last_beacon = now;
                    actions.push(WdAction::Broadcast(self.beacon_packet(now)));
                }
            }

            WdState::Standby => {
                let silent = now.saturating_sub(self.master_last_seen);
                if silent >= 2 * BEACON_INTERVAL_SECS {
                    warn!("coordinator silent for {}s, rejoining", silent);
                    self.transition(WdState::Joining, now, actions);
                } else if silent >= BEACON_INTERVAL_SECS
                    && now.saturating_sub(self.last_probe) >= BEACON_INTERVAL_SECS
                {
                    if let Some(MasterNode::Peer(master)) = self.master {
                        self.last_probe = now;
                        let id = self.commands.next_id();
                        self.commands.track(
                            id,
                            PacketType::ReqInfo,
                            &[master],
                            REQ_INFO_TIMEOUT_SECS,
                            now,
                        );
                        actions.push(WdAction::Send {
                            peer: master,
                            packet: WdPacket::new(PacketType::ReqInfo, id),
                        });
                    }
                }
            }

            _ => {}
        }
    }

    /// The coordinator itself failed to down the primary: nobody
    /// else sees the problem, so our view is suspect. Resign.
    fn check_resignation(
        &mut self,
        object: &super::consensus::FailoverObject,
        now: u64,
        actions: &mut Vec<WdAction>,
    ) {
        if self.state != WdState::Coordinator
            || object.kind != NodeOpKind::Down
            || !object.requesting_peers.contains(&None)
        {
            return;
        }

        let nodes = registry().snapshot();
        let quarantined_primary = object.nodes.iter().any(|id| {
            nodes
                .get(*id)
                .map(|node| {
                    node.status == NodeStatus::Quarantined
                        && node.role == crate::config::Role::Primary
                })
                .unwrap_or(false)
        });
        let other_primary_up = nodes.iter().any(|node| {
            node.role == crate::config::Role::Primary
                && node.status == NodeStatus::Up
                && !object.nodes.contains(&node.id)
        });

        if quarantined_primary && !other_primary_up {
            warn!("could not build consensus to fail the primary, resigning from coordinator");
            self.priority = -1;
            actions.push(WdAction::Broadcast(WdPacket::service(
                ClusterServiceMsg::ResigningFromLeader,
                0,
            )));
            self.transition(WdState::Joining, now, actions);
        }
    }

    // ---- packets -----------------------------------------------------------

    fn on_packet(
        &mut self,
        peer: usize,
        packet: WdPacket,
        now: u64,
        actions: &mut Vec<WdAction>,
    ) {
        if peer >= self.peers.len() {
            return;
        }

        {
            let record = &mut self.peers[peer];
            record.last_rcv = now;
            record.reachable = true;
        }
        if self.master == Some(MasterNode::Peer(peer)) {
            self.master_last_seen = now;
        }

        // A peer announcing shutdown is gone, whatever else is in flight.
        if packet.ptype == PacketType::InformIAmGoingDown {
            self.peers[peer].state = WdState::Shutdown;
            self.on_remote_lost(peer, now, actions);
            return;
        }

        // Replies to tracked commands route by command id.
        if packet.ptype.is_reply() && packet.command_id != 0 {
            // Info replies carry data worth absorbing first.
            if packet.ptype == PacketType::Info {
                if let Ok(beacon) = packet.json::<Beacon>() {
                    self.peers[peer].absorb(&beacon, now);
                }
            }

            if let Some((command, outcome)) =
                self.commands.on_reply(packet.command_id, peer, packet.ptype)
            {
                self.on_command_finished(command, outcome, now, actions);
                return;
            }
        }

        match packet.ptype {
            PacketType::AddNode => self.on_add_node(peer, &packet, now, actions),

            PacketType::ReqInfo => {
                actions.push(WdAction::Send {
                    peer,
                    packet: self
                        .info_packet(PacketType::Info, packet.command_id, now),
                });
            }

            PacketType::Info => {
                if let Ok(beacon) = packet.json::<Beacon>() {
                    self.peers[peer].absorb(&beacon, now);
                }
            }

            PacketType::DeclareCoordinator => {
                self.on_declare_coordinator(peer, &packet, now, actions)
            }

            PacketType::IAmCoordinator => self.on_beacon(peer, &packet, now, actions),

            PacketType::StandForCoordinator => {
                self.on_stand_for_coordinator(peer, &packet, now, actions)
            }

            PacketType::JoinCoordinator => {
                if self.state == WdState::Coordinator {
                    self.peers[peer].is_standby = true;
                    self.peers[peer].state = WdState::Standby;
                    actions.push(WdAction::Send {
                        peer,
                        packet: WdPacket::new(PacketType::Accept, packet.command_id),
                    });
                    actions.push(WdAction::Send {
                        peer,
                        packet: WdPacket::new(PacketType::AskForPoolConfig, 0),
                    });
                    self.check_quorum_change(now, actions);
                } else {
                    actions.push(WdAction::Send {
                        peer,
                        packet: WdPacket::new(PacketType::Reject, packet.command_id),
                    });
                }
            }

            PacketType::QuorumIsLost => {
                self.peers[peer].quorum = -1;
            }

            PacketType::IAmInNwTrouble => {
                self.peers[peer].state = WdState::InNetworkTrouble;
            }

            PacketType::AskForPoolConfig => {
                let payload = serde_json::json!({
                    "max_pool": crate::config::config().general.max_pool,
                    "max_connections": crate::config::config().general.max_connections,
                });
                actions.push(WdAction::Send {
                    peer,
                    packet: WdPacket::with_data(
                        PacketType::PoolConfigData,
                        packet.command_id,
                        payload.to_string().into_bytes(),
                    ),
                });
            }

            PacketType::PoolConfigData => {
                debug!("received pool config from peer {}", peer);
            }

            PacketType::FailoverStart => {
                actions.push(WdAction::SetSwitching(true));
            }

            PacketType::FailoverEnd => {
                if let Ok(sync) = packet.json::<super::beacon::BackendStateSync>() {
                    actions.push(WdAction::SyncBackendState(sync.nodes));
                }
                actions.push(WdAction::SetSwitching(false));
            }

            PacketType::FailoverWaitingForConsensus => {
                self.resend_quarantine_reports(actions);
            }

            PacketType::Data => {
                if self.state == WdState::Coordinator {
                    if let Ok(msg) = packet.json::<FailoverRequestMsg>() {
                        if let Some(request) = msg.to_request() {
                            self.handle_failover_vote(
                                Some(peer),
                                request,
                                packet.command_id,
                                now,
                                actions,
                            );
                        }
                    }
                }
            }

            PacketType::ClusterService => {
                self.on_cluster_service(peer, &packet, now, actions)
            }

            // Stray replies with command id 0 or for finished commands.
            PacketType::Accept
            | PacketType::Reject
            | PacketType::Error
            | PacketType::CmdReplyInData => {
                debug!("unmatched {:?} from peer {}", packet.ptype, peer);
            }

            PacketType::InformIAmGoingDown => unreachable!("handled above"),
        }
    }

    fn on_add_node(
        &mut self,
        peer: usize,
        packet: &WdPacket,
        now: u64,
        actions: &mut Vec<WdAction>,
    ) {
        let Ok(identity) = packet.json::<NodeIdentity>() else {
            actions.push(WdAction::Send {
                peer,
                packet: WdPacket::new(PacketType::Reject, packet.command_id),
            });
            return;
        };

        if !identity.verify(&self.auth_key) {
            warn!("peer {} failed the AddNode authentication", peer);
            actions.push(WdAction::Send {
                peer,
                packet: WdPacket::new(PacketType::Reject, packet.command_id),
            });
            return;
        }

        let record = &mut self.peers[peer];
        record.state = WdState::from_i32(identity.state);
        record.priority = identity.priority;
        record.startup_time = identity.startup_time;
        record.last_rcv = now;
        record.reachable = true;

        actions.push(WdAction::Send {
            peer,
            packet: WdPacket::new(PacketType::Accept, packet.command_id),
        });

        // Let a (re)joining node know who is in charge.
        if self.state == WdState::Coordinator {
            actions.push(WdAction::Send {
                peer,
                packet: self.beacon_packet(now),
            });
        }
    }

    fn on_declare_coordinator(
        &mut self,
        peer: usize,
        packet: &WdPacket,
        now: u64,
        actions: &mut Vec<WdAction>,
    ) {
        match self.state {
            WdState::Coordinator => {
                // We hold the role; the beacons will arbitrate.
                actions.push(WdAction::Send {
                    peer,
                    packet: WdPacket::new(PacketType::Reject, packet.command_id),
                });
                actions.push(WdAction::Send {
                    peer,
                    packet: self.beacon_packet(now),
                });
            }

            WdState::ParticipateInElection => {
                if self.peers[peer].priority >= self.priority {
                    self.peers[peer].state = WdState::Coordinator;
                    self.master = Some(MasterNode::Peer(peer));
                    actions.push(WdAction::Send {
                        peer,
                        packet: WdPacket::new(PacketType::Accept, packet.command_id),
                    });
                    self.transition(WdState::Initializing, now, actions);
                } else {
                    actions.push(WdAction::Send {
                        peer,
                        packet: WdPacket::new(PacketType::Reject, packet.command_id),
                    });
                }
            }

            _ => {
                self.peers[peer].state = WdState::Coordinator;
                self.master = Some(MasterNode::Peer(peer));
                actions.push(WdAction::Send {
                    peer,
                    packet: WdPacket::new(PacketType::Accept, packet.command_id),
                });
                if self.state != WdState::Standby {
                    self.transition(WdState::Standby, now, actions);
                }
            }
        }
    }

    fn on_beacon(
        &mut self,
        peer: usize,
        packet: &WdPacket,
        now: u64,
        actions: &mut Vec<WdAction>,
    ) {
        let Ok(beacon) = packet.json::<Beacon>() else {
            return;
        };
        self.peers[peer].absorb(&beacon, now);
        self.peers[peer].state = WdState::Coordinator;

        match self.state {
            WdState::Coordinator => {
                // Two coordinators: arbitrate.
                let decision = resolve_split_brain(&self.arbitration_view(), &beacon);
                info!(
                    "split brain with {}: {:?}",
                    self.peers[peer].name, decision
                );

                match decision {
                    SplitBrainDecision::IStay => {
                        actions.push(WdAction::Send {
                            peer,
                            packet: WdPacket::service(ClusterServiceMsg::IAmTrueLeader, 0),
                        });
                    }
                    SplitBrainDecision::PeerStays => {
                        actions.push(WdAction::Broadcast(WdPacket::service(
                            ClusterServiceMsg::IAmNotTrueLeader,
                            0,
                        )));
                        self.transition(WdState::Joining, now, actions);
                    }
                    SplitBrainDecision::NeedsElection => {
                        actions.push(WdAction::Broadcast(WdPacket::service(
                            ClusterServiceMsg::NeedsElection,
                            0,
                        )));
                        self.transition(WdState::Joining, now, actions);
                    }
                }
            }

            WdState::ParticipateInElection | WdState::StandForCoordinator => {
                // A coordinator already exists; rejoin through it.
                self.master = Some(MasterNode::Peer(peer));
                self.transition(WdState::Joining, now, actions);
            }

            WdState::Standby => match self.master {
                Some(MasterNode::Peer(master)) if master == peer => {
                    self.master_last_seen = now;
                }
                None => {
                    self.master = Some(MasterNode::Peer(peer));
                    self.transition(WdState::Joining, now, actions);
                }
                _ => {
                    // Beacon from somebody who isn't our master; the
                    // coordinators will sort it out between them.
                    debug!("beacon from non-master peer {}", peer);
                }
            },

            WdState::Joining | WdState::Initializing => {
                self.master = Some(MasterNode::Peer(peer));
                self.transition(WdState::Standby, now, actions);
            }

            _ => {}
        }
    }

    fn on_stand_for_coordinator(
        &mut self,
        peer: usize,
        packet: &WdPacket,
        now: u64,
        actions: &mut Vec<WdAction>,
    ) {
        self.peers[peer].state = WdState::StandForCoordinator;

        match self.state {
            WdState::Coordinator => {
                actions.push(WdAction::Send {
                    peer,
                    packet: WdPacket::new(PacketType::Reject, packet.command_id),
                });
                actions.push(WdAction::Send {
                    peer,
                    packet: self.beacon_packet(now),
                });
            }

            WdState::StandForCoordinator => {
                // Contention: priority first, then the older node.
                if self.wins_contention(peer) {
                    actions.push(WdAction::Send {
                        peer,
                        packet: WdPacket::new(PacketType::Reject, packet.command_id),
                    });
                } else {
                    actions.push(WdAction::Send {
                        peer,
                        packet: WdPacket::new(PacketType::Accept, packet.command_id),
                    });
                    self.transition(WdState::ParticipateInElection, now, actions);
                }
            }

            WdState::Loading => {
                if self.priority > self.peers[peer].priority {
                    actions.push(WdAction::Send {
                        peer,
                        packet: WdPacket::new(PacketType::Reject, packet.command_id),
                    });
                    self.transition(WdState::StandForCoordinator, now, actions);
                } else {
                    actions.push(WdAction::Send {
                        peer,
                        packet: WdPacket::new(PacketType::Accept, packet.command_id),
                    });
                    self.transition(WdState::ParticipateInElection, now, actions);
                }
            }

            WdState::Standby => {
                // We already follow a coordinator.
                if self.master.is_some() {
                    actions.push(WdAction::Send {
                        peer,
                        packet: WdPacket::new(PacketType::Reject, packet.command_id),
                    });
                } else {
                    actions.push(WdAction::Send {
                        peer,
                        packet: WdPacket::new(PacketType::Accept, packet.command_id),
                    });
                }
            }

            _ => {
                actions.push(WdAction::Send {
                    peer,
                    packet: WdPacket::new(PacketType::Accept, packet.command_id),
                });
                if self.state == WdState::Initializing || self.state == WdState::Joining {
                    self.transition(WdState::ParticipateInElection, now, actions);
                }
            }
        }
    }

    /// Contention between two candidates: higher priority wins, then
    /// the earlier startup time, then the smaller node name. Every
    /// comparison is strict so the two sides always reach opposite
    /// conclusions, like split-brain arbitration does.
    fn wins_contention(&self, peer: usize) -> bool {
        let remote = &self.peers[peer];
        if self.priority != remote.priority {
            self.priority > remote.priority
        } else if self.startup_time != remote.startup_time {
            self.startup_time < remote.startup_time
        } else {
            self.name < remote.name
        }
    }

    fn on_cluster_service(
        &mut self,
        peer: usize,
        packet: &WdPacket,
        now: u64,
        actions: &mut Vec<WdAction>,
    ) {
        let Some(msg) = packet.service_msg() else {
            return;
        };

        match msg {
            ClusterServiceMsg::IAmTrueLeader => {
                if self.state == WdState::Coordinator {
                    // We lost the arbitration.
                    info!("{} is the true leader, resigning", self.peers[peer].name);
                    self.transition(WdState::Joining, now, actions);
                }
                self.peers[peer].state = WdState::Coordinator;
            }

            ClusterServiceMsg::IAmNotTrueLeader => {
                self.peers[peer].state = WdState::Joining;
                if self.master == Some(MasterNode::Peer(peer)) {
                    self.master = None;
                }
            }

            ClusterServiceMsg::ResigningFromLeader => {
                self.peers[peer].state = WdState::Joining;
                if self.master == Some(MasterNode::Peer(peer)) {
                    self.master = None;
                    if self.state == WdState::Standby {
                        self.transition(WdState::Joining, now, actions);
                    }
                }
            }

            ClusterServiceMsg::NeedsElection => {
                if self.state != WdState::Joining {
                    self.transition(WdState::Joining, now, actions);
                }
            }

            ClusterServiceMsg::NodeAppearingLost
            | ClusterServiceMsg::NodeAppearingFound
            | ClusterServiceMsg::BackendStateSync
            | ClusterServiceMsg::InvalidVip => {
                debug!("cluster service {:?} from peer {}", msg, peer);
            }
        }
    }

    // ---- command completion ------------------------------------------------

    fn on_command_finished(
        &mut self,
        command: ClusterCommand,
        outcome: CommandOutcome,
        now: u64,
        actions: &mut Vec<WdAction>,
    ) {
        debug!("command {:?} finished: {:?}", command.ptype, outcome);

        match command.ptype {
            PacketType::AddNode => {
                if self.state == WdState::Loading && outcome == CommandOutcome::AllReplied {
                    self.transition(WdState::Initializing, now, actions);
                }
            }

            PacketType::ReqInfo => {
                if self.state == WdState::Joining {
                    self.transition(WdState::Initializing, now, actions);
                }
            }

            PacketType::StandForCoordinator => {
                if self.state != WdState::StandForCoordinator {
                    return;
                }
                match outcome {
                    CommandOutcome::AllReplied | CommandOutcome::FinishedTimeout => {
                        self.transition(WdState::Coordinator, now, actions);
                    }
                    CommandOutcome::Rejected(_) => {
                        self.transition(WdState::ParticipateInElection, now, actions);
                    }
                    CommandOutcome::Errored(_) => {
                        self.transition(WdState::Joining, now, actions);
                    }
                }
            }

            PacketType::DeclareCoordinator => {
                if self.state != WdState::Coordinator {
                    return;
                }
                match outcome {
                    CommandOutcome::AllReplied | CommandOutcome::FinishedTimeout => {
                        self.coordinator_established(now, actions);
                    }
                    CommandOutcome::Rejected(_) | CommandOutcome::Errored(_) => {
                        self.transition(WdState::Joining, now, actions);
                    }
                }
            }

            PacketType::JoinCoordinator => {
                if self.state != WdState::Standby {
                    return;
                }
                match outcome {
                    CommandOutcome::AllReplied => {
                        info!("joined the coordinator as standby");
                    }
                    _ => {
                        self.transition(WdState::Joining, now, actions);
                    }
                }
            }

            _ => {}
        }
    }

    // ---- failover ----------------------------------------------------------

    fn on_local_failover(
        &mut self,
        request: NodeOpRequest,
        now: u64,
        actions: &mut Vec<WdAction>,
    ) {
        match self.state {
            WdState::Coordinator => {
                self.handle_failover_vote(None, request, 0, now, actions);
            }

            WdState::Standby => {
                if let Some(MasterNode::Peer(master)) = self.master {
                    let msg = FailoverRequestMsg::from_request(&request);
                    if let Ok(packet) = WdPacket::with_json(PacketType::Data, 0, &msg) {
                        actions.push(WdAction::Send {
                            peer: master,
                            packet,
                        });
                    }
                } else if let Some(request) = quarantine_fallback(&request) {
                    actions.push(WdAction::ExecuteFailover(request));
                }
            }

            _ => {
                // No coordinator yet. Quarantine so traffic stops
                // hitting the node; consensus will settle it later.
                if let Some(request) = quarantine_fallback(&request) {
                    actions.push(WdAction::ExecuteFailover(request));
                }
            }
        }
    }

    fn handle_failover_vote(
        &mut self,
        from: Option<usize>,
        request: NodeOpRequest,
        reply_id: u32,
        now: u64,
        actions: &mut Vec<WdAction>,
    ) {
        let view = ClusterView {
            total: self.peers.len() + 1,
            quorum_ok: self.compute_quorum(),
            require_consensus: self.require_consensus,
            half_votes: self.half_votes,
            allow_multi_vote: self.allow_multi_vote,
        };

        let verdict = self.consensus.resolve(&request, from, &view, now);
        debug!("failover verdict for {:?}: {:?}", request, verdict);

        let reply = |payload: &str| -> Option<WdAction> {
            from.map(|peer| WdAction::Send {
                peer,
                packet: WdPacket::with_data(
                    PacketType::CmdReplyInData,
                    reply_id,
                    payload.as_bytes().to_vec(),
                ),
            })
        };

        match verdict {
            Verdict::Proceed => {
                actions.push(WdAction::Broadcast(WdPacket::new(
                    PacketType::FailoverStart,
                    0,
                )));
                let mut confirmed = request.clone();
                confirmed.flags.confirmed = true;
                actions.push(WdAction::ExecuteFailover(confirmed));
                actions.push(WdAction::BroadcastFailoverEnd);
                if let Some(action) = reply(verdicts::WILL_BE_DONE) {
                    actions.push(action);
                }
            }

            Verdict::NoQuorum => {
                if let Some(request) = quarantine_fallback(&request) {
                    actions.push(WdAction::ExecuteFailover(request));
                }
                if let Some(action) = reply(verdicts::NO_QUORUM) {
                    actions.push(action);
                }
            }

            Verdict::BuildingConsensus => {
                // Nudge peers into resending reports they gave up on.
                actions.push(WdAction::Broadcast(WdPacket::new(
                    PacketType::FailoverWaitingForConsensus,
                    0,
                )));
                if let Some(action) = reply(verdicts::BUILDING_CONSENSUS) {
                    actions.push(action);
                }
            }

            Verdict::ConsensusMayFail => {
                if let Some(action) = reply(verdicts::CONSENSUS_MAY_FAIL) {
                    actions.push(action);
                }
            }
        }
    }

    /// The coordinator asked for dormant reports: resubmit every
    /// node we hold in quarantine as a Down vote.
    fn resend_quarantine_reports(&mut self, actions: &mut Vec<WdAction>) {
        let Some(MasterNode::Peer(master)) = self.master else {
            return;
        };

        for node in registry().snapshot() {
            if node.status == NodeStatus::Quarantined {
                let request = NodeOpRequest::down(node.id);
                let msg = FailoverRequestMsg::from_request(&request);
                if let Ok(packet) = WdPacket::with_json(PacketType::Data, 0, &msg) {
                    actions.push(WdAction::Send {
                        peer: master,
                        packet,
                    });
                }
            }
        }
    }

    // ---- membership --------------------------------------------------------

    fn on_remote_lost(&mut self, peer: usize, now: u64, actions: &mut Vec<WdAction>) {
        if peer >= self.peers.len() {
            return;
        }

        {
            let record = &mut self.peers[peer];
            if record.state != WdState::Shutdown {
                record.state = WdState::Lost;
            }
            record.reachable = false;
            record.is_standby = false;
        }

        warn!("lost contact with peer {}", self.peers[peer].name);

        for (command, outcome) in self.commands.on_peer_lost(peer) {
            self.on_command_finished(command, outcome, now, actions);
        }

        if self.master == Some(MasterNode::Peer(peer)) {
            self.master = None;
            if self.state == WdState::Standby {
                self.transition(WdState::Joining, now, actions);
            }
        }

        if self.state == WdState::Coordinator {
            self.check_quorum_change(now, actions);
        }
    }

    fn compute_quorum(&self) -> bool {
        let standby_count = self
            .peers
            .iter()
            .filter(|peer| peer.reachable && peer.is_standby)
            .count();
        super::consensus::quorum_exists(standby_count + 1, self.peers.len() + 1, self.half_votes)
    }

    fn check_quorum_change(&mut self, now: u64, actions: &mut Vec<WdAction>) {
        let quorum = self.compute_quorum();
        if quorum == self.quorum_ok {
            return;
        }
        self.quorum_ok = quorum;

        if self.state != WdState::Coordinator {
            return;
        }

        if quorum {
            info!("quorum regained");
            if !self.escalated {
                self.escalated = true;
                actions.push(WdAction::Escalate);
            }
            // Quarantined nodes can now be settled for real.
            for node in registry().snapshot() {
                if node.status == NodeStatus::Quarantined {
                    self.handle_failover_vote(
                        None,
                        NodeOpRequest::down(node.id),
                        0,
                        now,
                        actions,
                    );
                }
            }
        } else {
            warn!("quorum lost, keeping coordinator role without the delegate IP");
            if self.escalated {
                self.escalated = false;
                actions.push(WdAction::DeEscalate);
            }
            actions.push(WdAction::Broadcast(WdPacket::new(
                PacketType::QuorumIsLost,
                0,
            )));
        }
    }

    // ---- payload builders --------------------------------------------------

    fn arbitration_view(&self) -> ArbitrationView {
        ArbitrationView {
            node_name: self.name.clone(),
            escalated: self.escalated,
            quorum: if self.compute_quorum() { 1 } else { -1 },
            standby_count: self
                .peers
                .iter()
                .filter(|peer| peer.reachable && peer.is_standby)
                .count() as u32,
            state_time: self.state_time,
        }
    }

    fn my_beacon(&self, _now: u64) -> Beacon {
        let view = self.arbitration_view();
        Beacon {
            node_name: self.name.clone(),
            state: self.state.as_i32(),
            priority: self.priority,
            startup_time: self.startup_time,
            escalated: Some(view.escalated),
            quorum: Some(view.quorum),
            standby_count: Some(view.standby_count),
            state_time: Some(view.state_time),
        }
    }

    fn beacon_packet(&self, now: u64) -> WdPacket {
        WdPacket::with_json(PacketType::IAmCoordinator, 0, &self.my_beacon(now))
            .expect("beacon serializes")
    }

    fn info_packet(&self, ptype: PacketType, command_id: u32, now: u64) -> WdPacket {
        WdPacket::with_json(ptype, command_id, &self.my_beacon(now)).expect("info serializes")
    }

    fn add_node_packet(&self, command_id: u32) -> WdPacket {
        let state = self.state.as_i32();
        let identity = NodeIdentity {
            node_name: self.name.clone(),
            wd_port: self.wd_port,
            pgherd_port: self.pgherd_port,
            state,
            priority: self.priority,
            startup_time: self.startup_time,
            auth_hash: NodeIdentity::compute_hash(state, self.wd_port, &self.auth_key),
            version: HANDSHAKE_VERSION,
        };
        WdPacket::with_json(PacketType::AddNode, command_id, &identity)
            .expect("identity serializes")
    }
}

/// Convert a failover request into its quarantine form for when
/// consensus can't be reached. Irreversible kinds are dropped.
fn quarantine_fallback(request: &NodeOpRequest) -> Option<NodeOpRequest> {
    match request.kind {
        NodeOpKind::Down | NodeOpKind::Quarantine => Some(NodeOpRequest::new(
            NodeOpKind::Quarantine,
            request.nodes.clone(),
            request.flags,
        )),
        NodeOpKind::Up | NodeOpKind::Recovery | NodeOpKind::CloseIdle => Some(request.clone()),
        NodeOpKind::Promote => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;

    fn peer_config(name: &str) -> WatchdogPeer {
        WatchdogPeer {
            node_name: name.into(),
            host: "127.0.0.1".into(),
            wd_port: 9000,
            pgherd_port: 9999,
        }
    }

    fn machine_config(name: &str, peers: &[&str], startup_time: u64) -> MachineConfig {
        MachineConfig {
            node_name: name.into(),
            wd_port: 9000,
            pgherd_port: 9999,
            priority: 50,
            auth_key: "cluster-secret".into(),
            peers: peers.iter().map(|peer| peer_config(peer)).collect(),
            require_consensus: true,
            half_votes: false,
            allow_multi_vote: false,
            startup_time,
        }
    }

    /// In-memory cluster: machine i's peer p maps to the global
    /// machine p (p < i) or p + 1 (p >= i).
    struct Cluster {
        machines: Vec<Machine>,
        queue: VecDeque<(usize, usize, WdPacket)>,
        side_effects: Vec<(usize, WdAction)>,
        now: u64,
    }

    impl Cluster {
        fn new(configs: Vec<MachineConfig>, now: u64) -> Self {
            Self {
                machines: configs.into_iter().map(Machine::new).collect(),
                queue: VecDeque::new(),
                side_effects: Vec::new(),
                now,
            }
        }

        fn global_of(&self, from: usize, peer: usize) -> usize {
            if peer < from {
                peer
            } else {
                peer + 1
            }
        }

        fn peer_index(&self, on: usize, of: usize) -> usize {
            if of < on {
                of
            } else {
                of - 1
            }
        }

        fn absorb(&mut self, from: usize, actions: Vec<WdAction>) {
            for action in actions {
                match action {
                    WdAction::Send { peer, packet } => {
                        let to = self.global_of(from, peer);
                        self.queue.push_back((from, to, packet));
                    }
                    WdAction::Broadcast(packet) => {
                        for to in 0..self.machines.len() {
                            if to != from {
                                self.queue.push_back((from, to, packet.clone()));
                            }
                        }
                    }
                    WdAction::SetTimer(_) | WdAction::CancelTimer => {}
                    other => self.side_effects.push((from, other)),
                }
            }
        }

        /// Deliver queued packets until the cluster goes quiet.
        fn settle(&mut self) {
            while let Some((from, to, packet)) = self.queue.pop_front() {
                let peer = self.peer_index(to, from);
                let actions = self.machines[to].dispatch(
                    WdEvent::PacketReceived { peer, packet },
                    self.now,
                );
                self.absorb(to, actions);
            }
        }

        fn start(&mut self, machine: usize) {
            let actions = self.machines[machine].start(self.now);
            self.absorb(machine, actions);
        }

        fn timeout(&mut self, machine: usize) {
            let actions = self.machines[machine].dispatch(WdEvent::Timeout, self.now);
            self.absorb(machine, actions);
        }
    }

    #[test]
    fn test_two_peer_election_startup_time_tiebreak() {
        // Equal priorities; the node that booted first wins.
        let mut cluster = Cluster::new(
            vec![
                machine_config("herd0", &["herd1"], 100),
                machine_config("herd1", &["herd0"], 200),
            ],
            1000,
        );

        cluster.start(0);
        cluster.start(1);
        assert_eq!(cluster.machines[0].state(), WdState::Loading);
        assert_eq!(cluster.machines[1].state(), WdState::Loading);

        // AddNode handshakes complete the Loading phase.
        cluster.settle();
        assert_eq!(cluster.machines[0].state(), WdState::Initializing);
        assert_eq!(cluster.machines[1].state(), WdState::Initializing);

        // Nobody is coordinator: both stand.
        cluster.timeout(0);
        cluster.timeout(1);
        cluster.settle();

        assert_eq!(cluster.machines[0].state(), WdState::Coordinator);
        assert_eq!(cluster.machines[1].state(), WdState::Standby);
        assert_eq!(cluster.machines[1].master(), Some(MasterNode::Peer(0)));
        assert_eq!(cluster.machines[0].master(), Some(MasterNode::Local));
        assert!(cluster.machines[0].peer(0).unwrap().is_standby);
    }

    #[test]
    fn test_two_peer_election_node_name_tiebreak() {
        // Equal priorities AND equal startup times: the node name
        // breaks the tie so one side still wins every round.
        let mut cluster = Cluster::new(
            vec![
                machine_config("herd0", &["herd1"], 100),
                machine_config("herd1", &["herd0"], 100),
            ],
            1000,
        );

        cluster.start(0);
        cluster.start(1);
        cluster.settle();
        cluster.timeout(0);
        cluster.timeout(1);
        cluster.settle();

        assert_eq!(cluster.machines[0].state(), WdState::Coordinator);
        assert_eq!(cluster.machines[1].state(), WdState::Standby);
        assert_eq!(cluster.machines[1].master(), Some(MasterNode::Peer(0)));
    }

    #[test]
    fn test_higher_priority_wins_election() {
        let mut low = machine_config("herd0", &["herd1"], 100);
        low.priority = 10;
        let mut high = machine_config("herd1", &["herd0"], 200);
        high.priority = 90;

        let mut cluster = Cluster::new(vec![low, high], 1000);
        cluster.start(0);
        cluster.start(1);
        cluster.settle();
        cluster.timeout(0);
        cluster.timeout(1);
        cluster.settle();

        assert_eq!(cluster.machines[1].state(), WdState::Coordinator);
        assert_eq!(cluster.machines[0].state(), WdState::Standby);
    }

    #[test]
    fn test_lone_node_becomes_coordinator() {
        let mut cluster = Cluster::new(vec![machine_config("herd0", &["herd1"], 100)], 1000);

        cluster.start(0);
        // Peer is unreachable; drop its AddNode.
        cluster.queue.clear();
        cluster.timeout(0); // Loading -> Joining -> Initializing
        cluster.timeout(0); // Initializing decision

        assert_eq!(cluster.machines[0].state(), WdState::Coordinator);
        // Alone means no quorum and no escalation.
        assert!(!cluster.machines[0].escalated());
    }

    #[test]
    fn test_split_brain_older_coordinator_wins() {
        // Both nodes became coordinator in isolation, A before B.
        let mut a = machine_config("herd0", &["herd1"], 100);
        a.half_votes = true;
        let mut b = machine_config("herd1", &["herd0"], 200);
        b.half_votes = true;

        let mut cluster = Cluster::new(vec![a, b], 1000);

        cluster.start(0);
        cluster.queue.clear();
        cluster.timeout(0);
        cluster.timeout(0);
        assert_eq!(cluster.machines[0].state(), WdState::Coordinator);

        cluster.now = 1500;
        cluster.start(1);
        cluster.queue.clear();
        cluster.timeout(1);
        cluster.timeout(1);
        assert_eq!(cluster.machines[1].state(), WdState::Coordinator);

        // The partition heals: beacons cross.
        cluster.now = 1511;
        let beacons_a = cluster.machines[0].dispatch(WdEvent::Tick, cluster.now);
        cluster.absorb(0, beacons_a);
        let beacons_b = cluster.machines[1].dispatch(WdEvent::Tick, cluster.now);
        cluster.absorb(1, beacons_b);
        cluster.settle();

        // The loser resigned and is re-initializing.
        assert_eq!(cluster.machines[0].state(), WdState::Coordinator);
        assert_eq!(cluster.machines[1].state(), WdState::Initializing);

        // Its init timer lands it back under the survivor.
        cluster.timeout(1);
        cluster.settle();

        // The longer-standing coordinator keeps the role; the other
        // resigned and rejoined as standby.
        assert_eq!(cluster.machines[0].state(), WdState::Coordinator);
        assert_eq!(cluster.machines[1].state(), WdState::Standby);
        assert_eq!(cluster.machines[1].master(), Some(MasterNode::Peer(0)));
    }

    #[test]
    fn test_split_brain_escalated_wins() {
        // Escalation beats everything else.
        let local = ArbitrationView {
            node_name: "herd0".into(),
            escalated: true,
            quorum: 1,
            standby_count: 1,
            state_time: 500,
        };
        let remote = Beacon {
            node_name: "herd1".into(),
            state: WdState::Coordinator.as_i32(),
            priority: 50,
            startup_time: 200,
            escalated: Some(false),
            quorum: Some(1),
            standby_count: Some(1),
            state_time: Some(100),
        };

        // A holds the VIP: A stays even though B is older.
        assert_eq!(
            resolve_split_brain(&local, &remote),
            SplitBrainDecision::IStay
        );

        // And B, seeing A escalated, resigns: opposite decisions.
        let local_b = ArbitrationView {
            node_name: "herd1".into(),
            escalated: false,
            quorum: 1,
            standby_count: 1,
            state_time: 100,
        };
        let remote_a = Beacon {
            node_name: "herd0".into(),
            state: WdState::Coordinator.as_i32(),
            priority: 50,
            startup_time: 100,
            escalated: Some(true),
            quorum: Some(1),
            standby_count: Some(1),
            state_time: Some(500),
        };
        assert_eq!(
            resolve_split_brain(&local_b, &remote_a),
            SplitBrainDecision::PeerStays
        );
    }

    #[test]
    fn test_split_brain_decisions_are_opposite() {
        // For any complete pair of views, the two sides never both
        // keep and never both resign.
        let views = [
            (false, 1, 0u32, 100u64),
            (false, 1, 2, 300),
            (true, 1, 1, 300),
            (false, -1, 1, 100),
            (true, 1, 1, 100),
        ];

        for a in &views {
            for b in &views {
                let view_a = ArbitrationView {
                    node_name: "a".into(),
                    escalated: a.0,
                    quorum: a.1,
                    standby_count: a.2,
                    state_time: a.3,
                };
                let view_b = ArbitrationView {
                    node_name: "b".into(),
                    escalated: b.0,
                    quorum: b.1,
                    standby_count: b.2,
                    state_time: b.3,
                };
                let beacon_a = Beacon {
                    node_name: "a".into(),
                    state: WdState::Coordinator.as_i32(),
                    priority: 50,
                    startup_time: 1,
                    escalated: Some(a.0),
                    quorum: Some(a.1),
                    standby_count: Some(a.2),
                    state_time: Some(a.3),
                };
                let beacon_b = Beacon {
                    node_name: "b".into(),
                    state: WdState::Coordinator.as_i32(),
                    priority: 50,
                    startup_time: 1,
                    escalated: Some(b.0),
                    quorum: Some(b.1),
                    standby_count: Some(b.2),
                    state_time: Some(b.3),
                };

                let decision_a = resolve_split_brain(&view_a, &beacon_b);
                let decision_b = resolve_split_brain(&view_b, &beacon_a);

                match decision_a {
                    SplitBrainDecision::IStay => {
                        assert_eq!(decision_b, SplitBrainDecision::PeerStays)
                    }
                    SplitBrainDecision::PeerStays => {
                        assert_eq!(decision_b, SplitBrainDecision::IStay)
                    }
                    SplitBrainDecision::NeedsElection => {
                        assert_eq!(decision_b, SplitBrainDecision::NeedsElection)
                    }
                }
            }
        }
    }

    #[test]
    fn test_split_brain_missing_beacon_data() {
        let local = ArbitrationView {
            node_name: "herd0".into(),
            escalated: false,
            quorum: 1,
            standby_count: 1,
            state_time: 100,
        };
        let remote = Beacon {
            node_name: "herd1".into(),
            state: WdState::Coordinator.as_i32(),
            priority: 50,
            startup_time: 200,
            escalated: None,
            quorum: Some(1),
            standby_count: Some(1),
            state_time: Some(100),
        };

        assert_eq!(
            resolve_split_brain(&local, &remote),
            SplitBrainDecision::NeedsElection
        );
    }

    fn coordinator_with_standbys(peers: &[&str], standbys: usize) -> Machine {
        let mut machine = Machine::new(machine_config("herd0", peers, 100));
        machine.start(1000);
        machine.dispatch(WdEvent::Timeout, 1005); // Loading -> Joining -> Initializing
        machine.dispatch(WdEvent::Timeout, 1006); // -> Coordinator
        assert_eq!(machine.state(), WdState::Coordinator);

        for peer in 0..standbys {
            let identity = NodeIdentity {
                node_name: format!("peer{}", peer),
                wd_port: 9000,
                pgherd_port: 9999,
                state: WdState::Joining.as_i32(),
                priority: 50,
                startup_time: 500,
                auth_hash: NodeIdentity::compute_hash(
                    WdState::Joining.as_i32(),
                    9000,
                    "cluster-secret",
                ),
                version: HANDSHAKE_VERSION,
            };
            machine.dispatch(
                WdEvent::PacketReceived {
                    peer,
                    packet: WdPacket::with_json(PacketType::AddNode, 0, &identity).unwrap(),
                },
                1010,
            );
            machine.dispatch(
                WdEvent::PacketReceived {
                    peer,
                    packet: WdPacket::new(PacketType::JoinCoordinator, 0),
                },
                1010,
            );
        }

        machine
    }

    #[test]
    fn test_failover_consensus_three_of_five() {
        // Five watchdog nodes: local coordinator plus four peers,
        // two of them joined as standbys (quorum holds).
        let mut machine =
            coordinator_with_standbys(&["peer0", "peer1", "peer2", "peer3"], 2);

        let vote = |machine: &mut Machine, peer: Option<usize>, now: u64| -> Vec<WdAction> {
            match peer {
                None => machine.dispatch(
                    WdEvent::LocalFailoverRequest(NodeOpRequest::down(0)),
                    now,
                ),
                Some(peer) => {
                    let msg = FailoverRequestMsg::from_request(&NodeOpRequest::down(0));
                    machine.dispatch(
                        WdEvent::PacketReceived {
                            peer,
                            packet: WdPacket::with_json(PacketType::Data, 9, &msg).unwrap(),
                        },
                        now,
                    )
                }
            }
        };

        // First vote: consensus building, peers are nudged.
        let actions = vote(&mut machine, None, 1020);
        assert!(actions.iter().any(|action| matches!(
            action,
            WdAction::Broadcast(packet)
                if packet.ptype == PacketType::FailoverWaitingForConsensus
        )));
        assert!(!actions
            .iter()
            .any(|action| matches!(action, WdAction::ExecuteFailover(_))));

        // Second vote from a peer: still building, peer is told so.
        let actions = vote(&mut machine, Some(0), 1021);
        assert!(actions.iter().any(|action| matches!(
            action,
            WdAction::Send { packet, .. }
                if packet.ptype == PacketType::CmdReplyInData
                    && packet.data.as_ref() == verdicts::BUILDING_CONSENSUS.as_bytes()
        )));

        // Third vote reaches 3/5: failover executes, bracketed by
        // start and end broadcasts, and the voter hears WILL_BE_DONE.
        let actions = vote(&mut machine, Some(1), 1022);
        let mut saw_start = false;
        let mut saw_execute = false;
        let mut saw_end = false;
        for action in &actions {
            match action {
                WdAction::Broadcast(packet) if packet.ptype == PacketType::FailoverStart => {
                    assert!(!saw_execute);
                    saw_start = true;
                }
                WdAction::ExecuteFailover(request) => {
                    assert_eq!(request.kind, NodeOpKind::Down);
                    assert_eq!(request.nodes, vec![0]);
                    assert!(request.flags.confirmed);
                    saw_execute = true;
                }
                WdAction::BroadcastFailoverEnd => {
                    assert!(saw_execute);
                    saw_end = true;
                }
                _ => {}
            }
        }
        assert!(saw_start && saw_execute && saw_end);
        assert!(actions.iter().any(|action| matches!(
            action,
            WdAction::Send { packet, .. }
                if packet.ptype == PacketType::CmdReplyInData
                    && packet.data.as_ref() == verdicts::WILL_BE_DONE.as_bytes()
        )));
    }

    #[test]
    fn test_no_quorum_quarantines() {
        // Coordinator without standbys has no quorum: the failing
        // node is quarantined, not detached.
        let mut machine =
            coordinator_with_standbys(&["peer0", "peer1", "peer2", "peer3"], 0);

        let actions = machine.dispatch(
            WdEvent::LocalFailoverRequest(NodeOpRequest::down(2)),
            1020,
        );

        assert!(actions.iter().any(|action| matches!(
            action,
            WdAction::ExecuteFailover(request)
                if request.kind == NodeOpKind::Quarantine && request.nodes == vec![2]
        )));
    }

    #[test]
    fn test_standby_forwards_failover_to_coordinator() {
        let mut cluster = Cluster::new(
            vec![
                machine_config("herd0", &["herd1"], 100),
                machine_config("herd1", &["herd0"], 200),
            ],
            1000,
        );
        cluster.start(0);
        cluster.start(1);
        cluster.settle();
        cluster.timeout(0);
        cluster.timeout(1);
        cluster.settle();
        assert_eq!(cluster.machines[1].state(), WdState::Standby);

        let actions = cluster.machines[1].dispatch(
            WdEvent::LocalFailoverRequest(NodeOpRequest::down(1)),
            1100,
        );

        assert!(actions.iter().any(|action| matches!(
            action,
            WdAction::Send { peer: 0, packet } if packet.ptype == PacketType::Data
        )));
    }

    #[test]
    fn test_standby_rejoins_after_silent_coordinator() {
        let mut cluster = Cluster::new(
            vec![
                machine_config("herd0", &["herd1"], 100),
                machine_config("herd1", &["herd0"], 200),
            ],
            1000,
        );
        cluster.start(0);
        cluster.start(1);
        cluster.settle();
        cluster.timeout(0);
        cluster.timeout(1);
        cluster.settle();
        assert_eq!(cluster.machines[1].state(), WdState::Standby);

        // One beacon interval of silence: the standby probes.
        let actions = cluster.machines[1].dispatch(WdEvent::Tick, 1000 + 11);
        assert!(actions.iter().any(|action| matches!(
            action,
            WdAction::Send { peer: 0, packet } if packet.ptype == PacketType::ReqInfo
        )));

        // Two intervals: give up and rejoin.
        let actions = cluster.machines[1].dispatch(WdEvent::Tick, 1000 + 21);
        cluster.absorb(1, actions);
        assert_ne!(cluster.machines[1].state(), WdState::Standby);
    }

    #[test]
    fn test_remote_lost_cancels_commands_and_master() {
        let mut cluster = Cluster::new(
            vec![
                machine_config("herd0", &["herd1"], 100),
                machine_config("herd1", &["herd0"], 200),
            ],
            1000,
        );
        cluster.start(0);
        cluster.start(1);
        cluster.settle();
        cluster.timeout(0);
        cluster.timeout(1);
        cluster.settle();

        // Standby loses the coordinator connection entirely.
        let actions = cluster.machines[1].dispatch(WdEvent::RemoteNodeLost { peer: 0 }, 1100);
        cluster.absorb(1, actions);

        assert_ne!(cluster.machines[1].state(), WdState::Standby);
        assert_ne!(cluster.machines[1].master(), Some(MasterNode::Peer(0)));
    }

    #[test]
    fn test_going_down_notice_is_remote_lost() {
        let mut machine = Machine::new(machine_config("herd0", &["herd1"], 100));
        machine.start(1000);

        machine.dispatch(
            WdEvent::PacketReceived {
                peer: 0,
                packet: WdPacket::new(PacketType::InformIAmGoingDown, 0),
            },
            1001,
        );

        let peer = machine.peer(0).unwrap();
        assert_eq!(peer.state, WdState::Shutdown);
        assert!(!peer.reachable);
    }

    #[test]
    fn test_network_trouble_is_fatal() {
        let mut machine = Machine::new(machine_config("herd0", &["herd1"], 100));
        machine.start(1000);

        let actions = machine.dispatch(WdEvent::NwLinkInactive, 1001);
        assert!(actions
            .iter()
            .any(|action| matches!(action, WdAction::FatalExit(_))));
    }

    #[test]
    fn test_shutdown_broadcasts_notice() {
        let mut machine = Machine::new(machine_config("herd0", &["herd1"], 100));
        machine.start(1000);

        let actions = machine.dispatch(WdEvent::ShutdownRequested, 1001);
        assert!(actions.iter().any(|action| matches!(
            action,
            WdAction::Broadcast(packet) if packet.ptype == PacketType::InformIAmGoingDown
        )));
    }
}
