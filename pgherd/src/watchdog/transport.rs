//! Watchdog peer transport.
//!
//! Every remote peer has two potential socket identities: the one we
//! dialed (`outbound`) and the one it dialed (`inbound`). Either can
//! carry traffic; sends prefer the outbound. The state machine never
//! touches sockets, it only sees events.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::WatchdogPeer;
use crate::net::tweak;

use super::beacon::NodeIdentity;
use super::machine::WdEvent;
use super::packet::{PacketType, WdPacket};

/// Outbound reconnects are attempted no more often than this.
pub const MIN_SECS_CONNECTION_RETRY: u64 = 10;

/// Unidentified inbound connections must introduce themselves
/// within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    Outbound,
    Inbound,
}

struct PeerLink {
    addr: String,
    name: String,
    wd_port: u16,
    pgherd_port: u16,
    outbound: Mutex<Option<OwnedWriteHalf>>,
    inbound: Mutex<Option<OwnedWriteHalf>>,
}

/// Socket manager for all configured peers.
pub struct Transport {
    links: Vec<PeerLink>,
    events: mpsc::Sender<WdEvent>,
    auth_key: String,
}

impl Transport {
    pub fn new(
        peers: &[WatchdogPeer],
        events: mpsc::Sender<WdEvent>,
        auth_key: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            links: peers
                .iter()
                .map(|peer| PeerLink {
                    addr: peer.addr(),
                    name: peer.node_name.clone(),
                    wd_port: peer.wd_port,
                    pgherd_port: peer.pgherd_port,
                    outbound: Mutex::new(None),
                    inbound: Mutex::new(None),
                })
                .collect(),
            events,
            auth_key,
        })
    }

    /// Bring up the listener and the per-peer dialers.
    pub fn start(self: &Arc<Self>, listen_addr: String) {
        let transport = self.clone();
        tokio::spawn(async move {
            if let Err(err) = transport.listen(listen_addr).await {
                warn!("watchdog listener failed: {}", err);
            }
        });

        for peer in 0..self.links.len() {
            let transport = self.clone();
            tokio::spawn(async move {
                transport.dial_loop(peer).await;
            });
        }
    }

    /// Send a frame to a peer. Prefers the connection we dialed,
    /// falls back to the one the peer dialed.
    pub async fn send(&self, peer: usize, packet: &WdPacket) -> bool {
        let Some(link) = self.links.get(peer) else {
            return false;
        };

        for direction in [Direction::Outbound, Direction::Inbound] {
            let slot = match direction {
                Direction::Outbound => &link.outbound,
                Direction::Inbound => &link.inbound,
            };

            let mut guard = slot.lock().await;
            if let Some(writer) = guard.as_mut() {
                match packet.write_to(writer).await {
                    Ok(()) => return true,
                    Err(err) => {
                        debug!("send to {} over {:?} failed: {}", link.addr, direction, err);
                        *guard = None;
                    }
                }
            }
        }

        self.maybe_lost(peer).await;
        false
    }

    async fn listen(self: Arc<Self>, addr: String) -> std::io::Result<()> {
        let listener = TcpListener::bind(&addr).await?;
        info!("watchdog listening on {}", addr);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let transport = self.clone();

            tokio::spawn(async move {
                if let Err(err) = transport.identify(stream).await {
                    debug!("inbound watchdog connection from {} rejected: {}", peer_addr, err);
                }
            });
        }
    }

    /// An inbound connection stays unidentified until a valid
    /// AddNode arrives.
    async fn identify(self: Arc<Self>, stream: TcpStream) -> Result<(), super::Error> {
        tweak(&stream)?;
        let (mut read, write) = stream.into_split();

        let packet = timeout(HANDSHAKE_TIMEOUT, WdPacket::read_from(&mut read))
            .await
            .map_err(|_| super::Error::BadHandshake)??;

        if packet.ptype != PacketType::AddNode {
            return Err(super::Error::BadHandshake);
        }

        let identity: NodeIdentity = packet.json()?;
        if !identity.verify(&self.auth_key) {
            return Err(super::Error::AuthFailed);
        }

        let peer = self
            .links
            .iter()
            .position(|link| {
                link.name == identity.node_name
                    && link.wd_port == identity.wd_port
                    && link.pgherd_port == identity.pgherd_port
            })
            .ok_or_else(|| super::Error::UnknownPeer(identity.node_name.clone()))?;

        debug!("identified inbound connection from {}", identity.node_name);

        *self.links[peer].inbound.lock().await = Some(write);
        let _ = self.events.send(WdEvent::RemoteNodeFound { peer }).await;
        // The machine still sees the handshake so it can reply.
        let _ = self
            .events
            .send(WdEvent::PacketReceived { peer, packet })
            .await;

        self.spawn_reader(peer, read, Direction::Inbound);
        Ok(())
    }

    async fn dial_loop(self: Arc<Self>, peer: usize) {
        loop {
            match TcpStream::connect(&self.links[peer].addr).await {
                Ok(stream) => {
                    if tweak(&stream).is_err() {
                        sleep(Duration::from_secs(MIN_SECS_CONNECTION_RETRY)).await;
                        continue;
                    }

                    debug!("connected to watchdog peer {}", self.links[peer].addr);

                    let (read, write) = stream.into_split();
                    *self.links[peer].outbound.lock().await = Some(write);
                    let _ = self
                        .events
                        .send(WdEvent::NewOutboundConnection { peer })
                        .await;

                    self.spawn_reader(peer, read, Direction::Outbound);

                    // Hold off redialing until this connection dies.
                    loop {
                        sleep(Duration::from_secs(1)).await;
                        if self.links[peer].outbound.lock().await.is_none() {
                            break;
                        }
                    }
                }
                Err(err) => {
                    debug!("peer {} unreachable: {}", self.links[peer].addr, err);
                }
            }

            sleep(Duration::from_secs(MIN_SECS_CONNECTION_RETRY)).await;
        }
    }

    fn spawn_reader(self: &Arc<Self>, peer: usize, mut read: OwnedReadHalf, direction: Direction) {
        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                match WdPacket::read_from(&mut read).await {
                    Ok(packet) => {
                        if transport
                            .events
                            .send(WdEvent::PacketReceived { peer, packet })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(err) => {
                        debug!(
                            "watchdog {:?} connection to peer {} closed: {}",
                            direction, peer, err
                        );
                        break;
                    }
                }
            }

            let slot = match direction {
                Direction::Outbound => &transport.links[peer].outbound,
                Direction::Inbound => &transport.links[peer].inbound,
            };
            *slot.lock().await = None;

            transport.maybe_lost(peer).await;
        });
    }

    /// Both socket identities are gone: the peer is lost.
    async fn maybe_lost(&self, peer: usize) {
        let link = &self.links[peer];
        let dead =
            link.outbound.lock().await.is_none() && link.inbound.lock().await.is_none();
        if dead {
            let _ = self.events.send(WdEvent::RemoteNodeLost { peer }).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::watchdog::beacon::HANDSHAKE_VERSION;
    use crate::watchdog::state::WdState;

    fn identity(auth_key: &str) -> NodeIdentity {
        let state = WdState::Loading.as_i32();
        NodeIdentity {
            node_name: "herd1".into(),
            wd_port: 9000,
            pgherd_port: 9999,
            state,
            priority: 1,
            startup_time: 42,
            auth_hash: NodeIdentity::compute_hash(state, 9000, auth_key),
            version: HANDSHAKE_VERSION,
        }
    }

    fn peers() -> Vec<WatchdogPeer> {
        vec![WatchdogPeer {
            node_name: "herd1".into(),
            host: "127.0.0.1".into(),
            wd_port: 9000,
            pgherd_port: 9999,
        }]
    }

    #[tokio::test]
    async fn test_inbound_handshake() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let transport = Transport::new(&peers(), events_tx, "secret".into());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        transport.start(addr.to_string());

        // Give the listener a moment to bind.
        sleep(Duration::from_millis(50)).await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        let packet = WdPacket::with_json(PacketType::AddNode, 1, &identity("secret")).unwrap();
        packet.write_to(&mut conn).await.unwrap();

        // The machine hears about the new peer and its handshake.
        let found = events_rx.recv().await.unwrap();
        assert!(matches!(found, WdEvent::RemoteNodeFound { peer: 0 }));
        let received = events_rx.recv().await.unwrap();
        match received {
            WdEvent::PacketReceived { peer, packet } => {
                assert_eq!(peer, 0);
                assert_eq!(packet.ptype, PacketType::AddNode);
            }
            other => panic!("expected handshake packet, got {:?}", other),
        }

        // Replies can flow over the inbound socket.
        assert!(
            transport
                .send(0, &WdPacket::new(PacketType::Accept, 1))
                .await
        );
        let reply = WdPacket::read_from(&mut conn).await.unwrap();
        assert_eq!(reply.ptype, PacketType::Accept);
    }

    #[tokio::test]
    async fn test_inbound_bad_key_rejected() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let transport = Transport::new(&peers(), events_tx, "secret".into());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        transport.start(addr.to_string());
        sleep(Duration::from_millis(50)).await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        let packet = WdPacket::with_json(PacketType::AddNode, 1, &identity("wrong")).unwrap();
        packet.write_to(&mut conn).await.unwrap();

        // No events; the connection just goes away.
        let received = tokio::time::timeout(Duration::from_millis(200), events_rx.recv()).await;
        assert!(received.is_err());
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let transport = Transport::new(&peers(), events_tx, "secret".into());

        assert!(
            !transport
                .send(0, &WdPacket::new(PacketType::ReqInfo, 1))
                .await
        );
        // Both identities dead: peer reported lost.
        let lost = events_rx.recv().await.unwrap();
        assert!(matches!(lost, WdEvent::RemoteNodeLost { peer: 0 }));
    }
}
