//! Cluster coordinator ("watchdog").
//!
//! Peers elect a single coordinator, exchange beacons, arbitrate
//! split brain and build consensus for failover requests. The state
//! machine itself is synchronous; this module is the async shell
//! that feeds it events and applies its actions.

pub mod beacon;
pub mod command;
pub mod consensus;
pub mod error;
pub mod ipc;
pub mod machine;
pub mod packet;
pub mod peer;
pub mod state;
pub mod transport;

pub use error::Error;
pub use machine::{Machine, MachineConfig, WdAction, WdEvent};
pub use state::WdState;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, sleep_until, Instant};
use tracing::{error, info};

use crate::cluster::{registry, NodeOpRequest};
use crate::config::config;
use crate::frontend::comms;

use beacon::BackendStateSync;
use ipc::ClusterSnapshot;
use machine::MasterNode;
use packet::{PacketType, WdPacket};
use transport::Transport;

/// Start the watchdog if it's enabled. Returns the channel the
/// failover drain task forwards requests into.
pub fn launch() -> Option<mpsc::Sender<NodeOpRequest>> {
    if !config().watchdog.enabled {
        return None;
    }

    let (requests_tx, requests_rx) = mpsc::channel(64);
    tokio::spawn(async move {
        run(requests_rx).await;
    });

    Some(requests_tx)
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

async fn run(mut local_requests: mpsc::Receiver<NodeOpRequest>) {
    let cfg = config();
    let wd = &cfg.watchdog;
    let auth_key = wd.resolve_auth_key();

    let (events_tx, mut events_rx) = mpsc::channel::<WdEvent>(256);
    let transport = Transport::new(&wd.peers, events_tx.clone(), auth_key.clone());
    transport.start(wd.listen_addr());

    let (snapshot_tx, snapshot_rx) = watch::channel(ClusterSnapshot::default());
    let (notify_tx, _) = broadcast::channel(16);
    tokio::spawn(ipc::run(
        wd.ipc_socket.clone(),
        auth_key.clone(),
        snapshot_rx,
        notify_tx.clone(),
    ));

    let mut machine = Machine::new(MachineConfig {
        node_name: wd.node_name.clone(),
        wd_port: wd.wd_port,
        pgherd_port: wd.pgherd_port,
        priority: wd.priority,
        auth_key,
        peers: wd.peers.clone(),
        require_consensus: cfg.general.failover_require_consensus,
        half_votes: cfg.general.enable_consensus_with_half_votes,
        allow_multi_vote: cfg.general.allow_multiple_failover_requests_from_node,
        startup_time: epoch_secs(),
    });

    let mut timer: Option<Instant> = None;
    let mut tick = interval(Duration::from_secs(1));
    let shutdown = comms();

    let actions = machine.start(epoch_secs());
    apply(actions, &transport, &events_tx, &mut timer, &notify_tx).await;

    loop {
        let actions = tokio::select! {
            Some(event) = events_rx.recv() => {
                machine.dispatch(event, epoch_secs())
            }

            _ = tick.tick() => {
                machine.dispatch(WdEvent::Tick, epoch_secs())
            }

            _ = async { sleep_until(timer.unwrap()).await }, if timer.is_some() => {
                timer = None;
                machine.dispatch(WdEvent::Timeout, epoch_secs())
            }

            Some(request) = local_requests.recv() => {
                machine.dispatch(WdEvent::LocalFailoverRequest(request), epoch_secs())
            }

            _ = shutdown.shutting_down() => {
                let actions = machine.dispatch(WdEvent::ShutdownRequested, epoch_secs());
                apply(actions, &transport, &events_tx, &mut timer, &notify_tx).await;
                info!("watchdog stopped");
                return;
            }
        };

        apply(actions, &transport, &events_tx, &mut timer, &notify_tx).await;

        let _ = snapshot_tx.send_replace(snapshot_of(&machine));
    }
}

async fn apply(
    actions: Vec<WdAction>,
    transport: &Transport,
    events: &mpsc::Sender<WdEvent>,
    timer: &mut Option<Instant>,
    notify: &broadcast::Sender<u8>,
) {
    for action in actions {
        match action {
            WdAction::Send { peer, packet } => {
                let command_id = packet.command_id;
                if !transport.send(peer, &packet).await && command_id != 0 {
                    let _ = events.send(WdEvent::SendFailed { peer, command_id }).await;
                }
            }

            WdAction::Broadcast(packet) => {
                let command_id = packet.command_id;
                for peer in 0..config().watchdog.peers.len() {
                    if !transport.send(peer, &packet).await && command_id != 0 {
                        let _ = events.send(WdEvent::SendFailed { peer, command_id }).await;
                    }
                }
            }

            WdAction::SetTimer(secs) => {
                *timer = Some(Instant::now() + Duration::from_secs(secs));
            }

            WdAction::CancelTimer => {
                *timer = None;
            }

            WdAction::Escalate => {
                run_hook(config().watchdog.escalation_command.clone(), "escalation");
            }

            WdAction::DeEscalate => {
                run_hook(
                    config().watchdog.de_escalation_command.clone(),
                    "de-escalation",
                );
            }

            WdAction::ExecuteFailover(request) => {
                crate::cluster::failover::execute(&request).await;
            }

            WdAction::BroadcastFailoverEnd => {
                let sync = BackendStateSync {
                    nodes: registry()
                        .snapshot()
                        .iter()
                        .map(|node| (node.id, node.status.to_string()))
                        .collect(),
                };
                if let Ok(packet) = WdPacket::with_json(PacketType::FailoverEnd, 0, &sync) {
                    for peer in 0..config().watchdog.peers.len() {
                        transport.send(peer, &packet).await;
                    }
                }
                let _ = notify.send(ipc::NOTICE_FAILOVER_END);
            }

            WdAction::SetSwitching(switching) => {
                registry().set_switching(switching);
                let _ = notify.send(if switching {
                    ipc::NOTICE_FAILOVER_START
                } else {
                    ipc::NOTICE_FAILOVER_END
                });
            }

            WdAction::SyncBackendState(nodes) => {
                crate::cluster::failover::apply_sync(&nodes);
            }

            WdAction::FatalExit(reason) => {
                error!("watchdog fatal: {}", reason);
                // Operating with stale authority is worse than dying.
                std::process::exit(3);
            }
        }
    }
}

fn snapshot_of(machine: &Machine) -> ClusterSnapshot {
    ClusterSnapshot {
        state: machine.state().to_string(),
        master: match machine.master() {
            Some(MasterNode::Local) => Some(config().watchdog.node_name.clone()),
            Some(MasterNode::Peer(peer)) => machine.peer(peer).map(|peer| peer.name.clone()),
            None => None,
        },
        escalated: machine.escalated(),
        quorum: machine.quorum_ok(),
        standby_count: machine.standby_count(),
    }
}

fn run_hook(command: Option<String>, what: &'static str) {
    let Some(command) = command else {
        info!("no {} command configured", what);
        return;
    };

    tokio::spawn(async move {
        info!("running {} command: {}", what, command);
        match tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => error!("{} command exited with {}", what, status),
            Err(err) => error!("{} command failed to start: {}", what, err),
        }
    });
}
