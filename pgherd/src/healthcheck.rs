//! Periodic backend health probes.
//!
//! Each round connects to every live node with the health-check
//! credentials. A node that fails `health_check_max_retries` rounds
//! in a row is reported down through the failover channel.

use tokio::time::interval;
use tracing::{debug, warn};

use crate::backend::Server;
use crate::cluster::{registry, requests, NodeOpRequest};
use crate::config::{config, AuthType, User};
use crate::net::messages::StartupPacket;

/// Start the health checker if a period is configured.
pub fn launch() {
    let Some(period) = config().general.health_check_period() else {
        return;
    };

    tokio::spawn(async move {
        let mut failures: Vec<usize> = vec![0; registry().node_count()];
        let mut timer = interval(period);
        timer.tick().await;

        loop {
            timer.tick().await;
            round(&mut failures).await;
        }
    });
}

async fn round(failures: &mut [usize]) {
    let cfg = config();
    let max_retries = cfg.general.health_check_max_retries;

    let user = User {
        name: cfg
            .general
            .health_check_user
            .clone()
            .unwrap_or_else(|| "pgherd".into()),
        password: cfg.general.health_check_password.clone(),
        auth: if cfg.general.health_check_password.is_some() {
            AuthType::Md5
        } else {
            AuthType::Trust
        },
    };

    let startup = StartupPacket::new_v3(vec![
        ("user".into(), user.name.clone()),
        ("database".into(), "postgres".into()),
        ("application_name".into(), "pgherd_health_check".into()),
    ]);

    for node in registry().snapshot() {
        if !node.live() {
            continue;
        }

        match Server::connect(&node, &startup, &user).await {
            Ok(server) => {
                if failures[node.id] > 0 {
                    debug!("backend {} recovered before being reported", node.id);
                }
                failures[node.id] = 0;
                server.terminate().await;
            }
            Err(err) => {
                failures[node.id] += 1;
                warn!(
                    "health check for backend {} failed ({}/{}): {}",
                    node.id, failures[node.id], max_retries, err
                );

                if failures[node.id] >= max_retries {
                    failures[node.id] = 0;
                    requests().submit(NodeOpRequest::down(node.id));
                }
            }
        }
    }
}
