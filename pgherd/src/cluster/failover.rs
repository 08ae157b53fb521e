//! Failover execution.
//!
//! The drain task consumes the request queue. With the watchdog
//! running, requests go through cluster consensus first; standalone,
//! they execute directly.

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::backend::pool::pool;
use crate::config::config;

use super::{registry, NodeOpKind, NodeOpRequest, NodeStatus, StatusFile};

/// Drain the request queue forever.
///
/// `coordinator` is the watchdog ingress when the watchdog is
/// enabled; requests sent there come back through [`execute`] once
/// consensus allows.
pub async fn run(coordinator: Option<mpsc::Sender<NodeOpRequest>>) {
    loop {
        for request in super::requests().next_batch().await {
            if request.flags.update_only {
                apply_status_only(&request);
                continue;
            }

            // Closing idle pools is local to this instance; it never
            // needs cluster consensus.
            if request.kind == NodeOpKind::CloseIdle {
                execute(&request).await;
                continue;
            }

            match &coordinator {
                Some(tx) => {
                    if tx.send(request.clone()).await.is_err() {
                        error!("watchdog gone, executing {:?} locally", request);
                        execute(&request).await;
                    }
                }
                None => execute(&request).await,
            }
        }
    }
}

/// Rewrite statuses without running the failover machinery.
fn apply_status_only(request: &NodeOpRequest) {
    let status = match request.kind {
        NodeOpKind::Up | NodeOpKind::Recovery => NodeStatus::Up,
        NodeOpKind::Down => NodeStatus::Down,
        NodeOpKind::Quarantine => NodeStatus::Quarantined,
        NodeOpKind::Promote | NodeOpKind::CloseIdle => return,
    };

    for node in &request.nodes {
        registry().set_status(*node, status);
    }
    persist();
}

/// Execute a node operation: registry transition, pool teardown,
/// external failover command.
pub async fn execute(request: &NodeOpRequest) {
    info!("executing node operation {:?}", request);

    registry().set_switching(true);

    match request.kind {
        NodeOpKind::Down | NodeOpKind::Quarantine => {
            let status = if request.kind == NodeOpKind::Down {
                NodeStatus::Down
            } else {
                NodeStatus::Quarantined
            };

            for node in &request.nodes {
                if registry().set_status(*node, status) {
                    pool().close_node(*node).await;
                    // Quarantine is reversible; only a real detach
                    // runs the failover command.
                    if status == NodeStatus::Down {
                        run_failover_command(*node).await;
                    }
                }
            }
        }

        NodeOpKind::Up | NodeOpKind::Recovery => {
            for node in &request.nodes {
                registry().set_status(*node, NodeStatus::Up);
            }
        }

        NodeOpKind::Promote => {
            if let Some(node) = request.nodes.first() {
                registry().set_status(*node, NodeStatus::Up);
                registry().set_primary(Some(*node));
                pool().close_idle().await;
            }
        }

        NodeOpKind::CloseIdle => {
            pool().close_idle().await;
        }
    }

    persist();
    registry().set_switching(false);
}

/// Apply backend statuses announced by the coordinator after a
/// failover, so every proxy instance converges.
pub fn apply_sync(nodes: &[(usize, String)]) {
    for (id, status) in nodes {
        let status = match status.as_str() {
            "up" => NodeStatus::Up,
            "down" => NodeStatus::Down,
            "quarantine" => NodeStatus::Quarantined,
            "waiting" => NodeStatus::ConnectWait,
            _ => continue,
        };
        registry().set_status(*id, status);
    }
    persist();
}

fn persist() {
    let path = config().general.status_file.clone();
    let file = StatusFile::new(path);
    if let Err(err) = file.write(&registry().snapshot()) {
        error!("could not write status file: {}", err);
    }
}

/// Delegate to the operator-provided command. We decide when, it
/// decides how.
async fn run_failover_command(node: usize) {
    let Some(template) = config().general.failover_command.clone() else {
        return;
    };

    let nodes = registry().snapshot();
    let Some(failed) = nodes.iter().find(|n| n.id == node) else {
        return;
    };
    let new_master = nodes.iter().find(|n| n.live());

    let command = template
        .replace("%d", &failed.id.to_string())
        .replace("%h", &failed.host)
        .replace("%p", &failed.port.to_string())
        .replace("%m", &new_master.map(|n| n.id.to_string()).unwrap_or_default())
        .replace("%H", &new_master.map(|n| n.host.clone()).unwrap_or_default());

    info!("running failover command: {}", command);

    match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .status()
        .await
    {
        Ok(status) if status.success() => {}
        Ok(status) => error!("failover command exited with {}", status),
        Err(err) => error!("failover command failed to start: {}", err),
    }
}
