//! Cancel request routing.
//!
//! A cancel arrives on its own connection carrying the key data we
//! synthesized for the client. It fans out to every backend of the
//! owning pool entry with that backend's own pid and secret.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::backend::pool::conn_info;
use crate::backend::Server;
use crate::cluster::registry;

/// Pause between per-backend cancel forwards so each backend's
/// cancel takes effect before the next one is targeted.
const CANCEL_FORWARD_PAUSE: Duration = Duration::from_secs(1);

/// Forward a client cancel request to the backends of the session
/// it belongs to. Unknown key data is logged and dropped.
pub async fn route(pid: i32, secret: i32) {
    let Some(slots) = conn_info::lookup(pid, secret) else {
        info!("cancel request for unknown session (pid={})", pid);
        return;
    };

    let nodes = registry().snapshot();

    for (i, slot) in slots.iter().enumerate() {
        let valid = nodes
            .get(slot.node_id)
            .map(|node| node.live())
            .unwrap_or(false);
        if !valid {
            continue;
        }

        debug!(
            "forwarding cancel to backend {} ({})",
            slot.node_id, slot.addr
        );

        if let Err(err) = Server::cancel(&slot.addr, &slot.key).await {
            debug!("cancel to {} failed: {}", slot.addr, err);
        }

        if i + 1 < slots.len() {
            sleep(CANCEL_FORWARD_PAUSE).await;
        }
    }
}
