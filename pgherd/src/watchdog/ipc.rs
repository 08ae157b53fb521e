//! Local IPC over a UNIX socket.
//!
//! Frame: `type:1 | len:u32 BE | data`. Collaborators on the same
//! host submit failover commands, query cluster state, or register
//! for failover notifications.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::cluster::{registry, requests, NodeOpFlags, NodeOpKind, NodeOpRequest};

use super::beacon::FailoverRequestMsg;

// Command types.
pub const GET_NODES_LIST: u8 = b'l';
pub const NODE_STATUS_CHANGE: u8 = b'n';
pub const REGISTER_FOR_NOTIFICATION: u8 = b'r';
pub const FAILOVER_COMMAND: u8 = b'f';
pub const ONLINE_RECOVERY_COMMAND: u8 = b'o';
pub const FAILOVER_INDICATION: u8 = b'i';
pub const GET_MASTER_DATA_REQUEST: u8 = b'm';
pub const GET_RUNTIME_VARIABLE_VALUE: u8 = b'v';

// Reply types.
pub const IPC_CMD_RESULT_OK: u8 = b'k';
pub const IPC_CMD_RESULT_BAD: u8 = b'b';
pub const IPC_CMD_CLUSTER_IN_TRAN: u8 = b't';
pub const IPC_CMD_TIMEOUT: u8 = b'w';

// Notification payloads pushed to registered clients.
pub const NOTICE_FAILOVER_START: u8 = b'F';
pub const NOTICE_FAILOVER_END: u8 = b'H';

const MAX_IPC_FRAME: u32 = 256 * 1024;

/// Cluster state the IPC surface reads; refreshed by the watchdog
/// loop after every event.
#[derive(Serialize, Clone, Debug, Default)]
pub struct ClusterSnapshot {
    pub state: String,
    pub master: Option<String>,
    pub escalated: bool,
    pub quorum: bool,
    pub standby_count: u32,
}

/// Commands that mutate cluster state must present the shared key.
/// Other payload fields are parsed separately by each handler.
#[derive(Deserialize, Debug)]
struct AuthenticatedPayload {
    #[serde(default)]
    auth_key: Option<String>,
}

#[derive(Deserialize, Debug)]
struct FailoverIndication {
    start: bool,
}

#[derive(Deserialize, Debug)]
struct RuntimeVariable {
    name: String,
}

/// Serve IPC requests forever.
pub async fn run(
    path: PathBuf,
    auth_key: String,
    snapshot: watch::Receiver<ClusterSnapshot>,
    notifications: broadcast::Sender<u8>,
) {
    let _ = std::fs::remove_file(&path);

    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(err) => {
            warn!("could not bind IPC socket {}: {}", path.display(), err);
            return;
        }
    };
    info!("watchdog IPC on {}", path.display());

    loop {
        let Ok((stream, _)) = listener.accept().await else {
            continue;
        };
        let auth_key = auth_key.clone();
        let snapshot = snapshot.clone();
        let notifications = notifications.subscribe();

        tokio::spawn(async move {
            if let Err(err) = serve(stream, auth_key, snapshot, notifications).await {
                debug!("IPC connection ended: {}", err);
            }
        });
    }
}

async fn serve(
    mut stream: UnixStream,
    auth_key: String,
    snapshot: watch::Receiver<ClusterSnapshot>,
    mut notifications: broadcast::Receiver<u8>,
) -> Result<(), super::Error> {
    loop {
        let (ctype, data) = read_frame(&mut stream).await?;

        match ctype {
            GET_NODES_LIST => {
                let nodes: Vec<serde_json::Value> = registry()
                    .snapshot()
                    .iter()
                    .map(|node| {
                        serde_json::json!({
                            "id": node.id,
                            "host": node.host,
                            "port": node.port,
                            "status": node.status.to_string(),
                            "weight": node.weight,
                        })
                    })
                    .collect();
                write_frame(
                    &mut stream,
                    IPC_CMD_RESULT_OK,
                    serde_json::to_vec(&nodes)?,
                )
                .await?;
            }

            GET_MASTER_DATA_REQUEST => {
                let data = serde_json::to_vec(&*snapshot.borrow())?;
                write_frame(&mut stream, IPC_CMD_RESULT_OK, data).await?;
            }

            GET_RUNTIME_VARIABLE_VALUE => {
                let request: RuntimeVariable = serde_json::from_slice(&data)?;
                let view = snapshot.borrow().clone();
                let value = match request.name.as_str() {
                    "state" => serde_json::json!(view.state),
                    "escalated" => serde_json::json!(view.escalated),
                    "quorum" => serde_json::json!(view.quorum),
                    "standby_count" => serde_json::json!(view.standby_count),
                    _ => serde_json::Value::Null,
                };
                write_frame(&mut stream, IPC_CMD_RESULT_OK, serde_json::to_vec(&value)?)
                    .await?;
            }

            NODE_STATUS_CHANGE | FAILOVER_COMMAND | ONLINE_RECOVERY_COMMAND => {
                if !authorized(&auth_key, &data) {
                    write_frame(&mut stream, IPC_CMD_RESULT_BAD, vec![]).await?;
                    continue;
                }

                if ctype == FAILOVER_COMMAND && registry().switching() {
                    write_frame(&mut stream, IPC_CMD_CLUSTER_IN_TRAN, vec![]).await?;
                    continue;
                }

                let Ok(msg) = serde_json::from_slice::<FailoverRequestMsg>(&data) else {
                    write_frame(&mut stream, IPC_CMD_RESULT_BAD, vec![]).await?;
                    continue;
                };

                let request = match ctype {
                    ONLINE_RECOVERY_COMMAND => Some(NodeOpRequest::new(
                        NodeOpKind::Recovery,
                        msg.nodes.clone(),
                        NodeOpFlags::default(),
                    )),
                    NODE_STATUS_CHANGE => msg.to_request().map(|mut request| {
                        // Status changes bypass the consensus round.
                        request.flags.update_only = true;
                        request
                    }),
                    _ => msg.to_request(),
                };

                match request {
                    Some(request) if requests().submit(request.clone()) => {
                        write_frame(&mut stream, IPC_CMD_RESULT_OK, vec![]).await?;
                    }
                    Some(_) => {
                        write_frame(&mut stream, IPC_CMD_TIMEOUT, vec![]).await?;
                    }
                    None => {
                        write_frame(&mut stream, IPC_CMD_RESULT_BAD, vec![]).await?;
                    }
                }
            }

            FAILOVER_INDICATION => {
                if !authorized(&auth_key, &data) {
                    write_frame(&mut stream, IPC_CMD_RESULT_BAD, vec![]).await?;
                    continue;
                }

                match serde_json::from_slice::<FailoverIndication>(&data) {
                    Ok(indication) => {
                        registry().set_switching(indication.start);
                        write_frame(&mut stream, IPC_CMD_RESULT_OK, vec![]).await?;
                    }
                    Err(_) => {
                        write_frame(&mut stream, IPC_CMD_RESULT_BAD, vec![]).await?;
                    }
                }
            }

            REGISTER_FOR_NOTIFICATION => {
                write_frame(&mut stream, IPC_CMD_RESULT_OK, vec![]).await?;

                // From here on the connection only carries
                // failover notifications.
                loop {
                    match notifications.recv().await {
                        Ok(notice) => {
                            if write_frame(&mut stream, notice, vec![]).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }

            other => {
                debug!("unknown IPC command type '{}'", other as char);
                write_frame(&mut stream, IPC_CMD_RESULT_BAD, vec![]).await?;
            }
        }
    }
}

/// Internal-only commands must carry the shared key when one is set.
fn authorized(auth_key: &str, data: &[u8]) -> bool {
    if auth_key.is_empty() {
        return true;
    }
    serde_json::from_slice::<AuthenticatedPayload>(data)
        .ok()
        .and_then(|payload| payload.auth_key)
        .map(|key| key == auth_key)
        .unwrap_or(false)
}

async fn read_frame(stream: &mut UnixStream) -> Result<(u8, Vec<u8>), super::Error> {
    let ctype = stream.read_u8().await?;
    let len = stream.read_u32().await?;

    if len > MAX_IPC_FRAME {
        return Err(crate::net::Error::FrameTooLarge(len).into());
    }

    let mut data = vec![0u8; len as usize];
    stream.read_exact(&mut data).await?;

    Ok((ctype, data))
}

async fn write_frame(
    stream: &mut UnixStream,
    ctype: u8,
    data: Vec<u8>,
) -> Result<(), super::Error> {
    stream.write_u8(ctype).await?;
    stream.write_u32(data.len() as u32).await?;
    stream.write_all(&data).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    async fn setup() -> (PathBuf, tempfile::TempDir, broadcast::Sender<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        let (_, snapshot_rx) = watch::channel(ClusterSnapshot {
            state: "STANDBY".into(),
            ..Default::default()
        });
        let (notify_tx, _) = broadcast::channel(8);

        tokio::spawn(run(
            path.clone(),
            "".into(),
            snapshot_rx,
            notify_tx.clone(),
        ));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        (path, dir, notify_tx)
    }

    async fn request(stream: &mut UnixStream, ctype: u8, data: &[u8]) -> (u8, Vec<u8>) {
        stream.write_u8(ctype).await.unwrap();
        stream.write_u32(data.len() as u32).await.unwrap();
        stream.write_all(data).await.unwrap();
        stream.flush().await.unwrap();

        let reply = stream.read_u8().await.unwrap();
        let len = stream.read_u32().await.unwrap();
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload).await.unwrap();
        (reply, payload)
    }

    #[tokio::test]
    async fn test_get_nodes_list() {
        let (path, _dir, _notify) = setup().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();

        let (reply, payload) = request(&mut stream, GET_NODES_LIST, b"{}").await;
        assert_eq!(reply, IPC_CMD_RESULT_OK);
        let nodes: Vec<serde_json::Value> = serde_json::from_slice(&payload).unwrap();
        // The global registry is empty in tests.
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn test_get_master_data() {
        let (path, _dir, _notify) = setup().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();

        let (reply, payload) = request(&mut stream, GET_MASTER_DATA_REQUEST, b"{}").await;
        assert_eq!(reply, IPC_CMD_RESULT_OK);
        let snapshot: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(snapshot["state"], "STANDBY");
    }

    #[tokio::test]
    async fn test_notifications() {
        let (path, _dir, notify) = setup().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();

        let (reply, _) = request(&mut stream, REGISTER_FOR_NOTIFICATION, b"{}").await;
        assert_eq!(reply, IPC_CMD_RESULT_OK);

        notify.send(NOTICE_FAILOVER_START).unwrap();
        let notice = stream.read_u8().await.unwrap();
        assert_eq!(notice, NOTICE_FAILOVER_START);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (path, _dir, _notify) = setup().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();

        let (reply, _) = request(&mut stream, b'z', b"{}").await;
        assert_eq!(reply, IPC_CMD_RESULT_BAD);
    }
}
