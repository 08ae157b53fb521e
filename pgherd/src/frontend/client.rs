//! One client session: startup, authentication, pool checkout,
//! proxy loop, reset pass.

use tokio::time::timeout;
use tracing::{debug, info};

use crate::backend::pool::{pool, PoolEntry, TransactionState};
use crate::cluster::{registry, requests, NodeOpRequest};
use crate::config::{config, User};
use crate::net::messages::{
    ErrorResponse, FromBytes, ParameterStatus, ReadyForQuery, Startup, StartupPacket,
};
use crate::net::Stream;

use super::{auth, cancel, comms, lb, Error, SessionResult};

/// Databases whose connections are never cached: tooling connects to
/// these briefly and pooling them only wastes slots.
const TEMPLATE_DATABASES: &[&str] = &["template0", "template1", "postgres", "regression"];

/// Serve one accepted client to completion.
pub async fn handle(mut stream: Stream) -> Result<(), Error> {
    let connected = registry().connect();
    let result = session(&mut stream, connected).await;
    registry().disconnect();
    result
}

async fn session(stream: &mut Stream, connected: usize) -> Result<(), Error> {
    let cfg = config();

    if comms().offline() {
        let _ = stream.fatal(ErrorResponse::shutting_down()).await;
        return Ok(());
    }

    if connected > cfg.general.client_limit() {
        let _ = stream.fatal(ErrorResponse::too_many_clients()).await;
        return Ok(());
    }

    // Startup and authentication run under the auth timeout.
    let negotiated = match timeout(
        cfg.general.authentication_timeout(),
        negotiate_and_authenticate(stream),
    )
    .await
    {
        Err(_) => {
            let _ = stream.fatal(ErrorResponse::auth_timeout()).await;
            return Ok(());
        }
        Ok(Err(err)) => return Err(err),
        Ok(Ok(None)) => return Ok(()),
        Ok(Ok(Some(negotiated))) => negotiated,
    };

    let (packet, user) = negotiated;

    // Checkout: reuse a pooled entry or build a fresh one.
    let (mut entry, reused) = match pool().acquire(&packet, true).await {
        Some(entry) => (entry, true),
        None => match pool().create(&packet, &user).await {
            Ok(entry) => (entry, false),
            Err(err) => {
                let _ = send_fatal(stream, packet.major, ErrorResponse::from_err(&err)).await;
                return Ok(());
            }
        },
    };

    // The client sees the same parameter set and key data a fresh
    // connection would have produced.
    let tstate = if reused {
        debug!("reusing pooled entry for {}@{}", packet.user, packet.database);
        entry.tstate
    } else {
        TransactionState::Idle
    };

    let greeting = async {
        for param in entry.params() {
            stream.send(&param).await?;
        }
        stream.send(&entry.key).await?;
        stream
            .send_flush(&ReadyForQuery {
                status: tstate.as_char(),
            })
            .await?;
        Ok::<(), crate::net::Error>(())
    }
    .await;

    if let Err(err) = greeting {
        pool().discard(entry).await;
        return Err(err.into());
    }

    // Session's load-balance node.
    let node = select_session_node(&entry, &packet);
    let Some(node) = node else {
        pool().discard(entry).await;
        let _ = send_fatal(stream, packet.major, ErrorResponse::all_backends_down()).await;
        return Ok(());
    };

    // Inner proxy loop; every iteration is a recovery boundary.
    let mut tstate = tstate;
    let outcome = loop {
        let Some(server) = entry.slot(node) else {
            break SessionResult::BackendGone(node);
        };

        match process(stream, server, &mut tstate).await {
            SessionResult::Continue => continue,
            outcome => break outcome,
        }
    };

    entry.tstate = tstate;
    finish(stream, entry, &packet, node, outcome).await;

    Ok(())
}

/// Read startup frames until a real startup packet arrives, then
/// authenticate. Cancel requests are routed and end the connection.
async fn negotiate_and_authenticate(
    stream: &mut Stream,
) -> Result<Option<(StartupPacket, User)>, Error> {
    let packet = loop {
        match Startup::from_stream(stream).await? {
            // TLS termination is handled upstream; GSS we don't speak.
            Startup::Ssl | Startup::GssEnc => stream.send_bytes(b"N").await?,

            Startup::Cancel { pid, secret } => {
                cancel::route(pid, secret).await;
                return Ok(None);
            }

            Startup::Startup(packet) => break packet,
        }
    };

    // Even with every backend down the client gets a well-formed
    // error, not a dropped socket.
    if !registry().any_live() {
        let _ = send_fatal(stream, packet.major, ErrorResponse::all_backends_down()).await;
        return Ok(None);
    }

    if packet.user.is_empty() {
        let _ = send_fatal(stream, packet.major, ErrorResponse::no_user()).await;
        return Ok(None);
    }

    let cfg = config();
    let Some(user) = cfg.user(&packet.user).cloned() else {
        let _ = send_fatal(stream, packet.major, ErrorResponse::auth(&packet.user)).await;
        return Ok(None);
    };

    match auth::authenticate(stream, &user).await {
        Ok(()) => Ok(Some((packet, user))),
        Err(Error::Auth) => {
            let _ = send_fatal(stream, packet.major, ErrorResponse::auth(&packet.user)).await;
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Pick the node this session talks to, constrained to nodes the
/// entry actually holds.
fn select_session_node(entry: &PoolEntry, packet: &StartupPacket) -> Option<usize> {
    let cfg = config();
    let nodes = registry().snapshot();

    let preferred = if cfg.general.load_balance_mode {
        let db_rules = cfg
            .general
            .database_redirect_preference_list
            .as_deref()
            .map(lb::parse_rules)
            .unwrap_or_default();
        let app_rules = cfg
            .general
            .app_name_redirect_preference_list
            .as_deref()
            .map(lb::parse_rules)
            .unwrap_or_default();

        lb::select_node(
            &nodes,
            registry().primary_node_id(),
            registry().master_node_id(),
            &packet.database,
            packet.application_name.as_deref(),
            &db_rules,
            &app_rules,
            &mut rand::rng(),
        )
    } else {
        registry().master_node_id()
    };

    preferred
        .filter(|id| entry.has_node(*id))
        .or_else(|| entry.nodes().first().copied())
}

/// One proxy-loop iteration: relay a message in either direction.
async fn process(
    client: &mut Stream,
    server: &mut crate::backend::Server,
    tstate: &mut TransactionState,
) -> SessionResult {
    let comms = comms();

    tokio::select! {
        message = client.read() => {
            let message = match message {
                Ok(message) => message,
                // Client hung up without Terminate.
                Err(_) => return SessionResult::Error,
            };

            use crate::net::messages::Protocol;
            if message.code() == 'X' {
                return SessionResult::End;
            }

            if server.send(&message).await.is_err() || server.flush().await.is_err() {
                return SessionResult::BackendGone(server.node_id());
            }

            SessionResult::Continue
        }

        message = server.read() => {
            let message = match message {
                Ok(message) => message,
                Err(_) => return SessionResult::BackendGone(server.node_id()),
            };

            use crate::net::messages::Protocol;
            let code = message.code();

            // Keep the cached session state current before relaying.
            match code {
                'Z' => {
                    if let Ok(rfq) = ReadyForQuery::from_bytes(message.payload()) {
                        *tstate = TransactionState::from_char(rfq.status);
                    }
                }
                'S' => {
                    if let Ok(param) = ParameterStatus::from_bytes(message.payload()) {
                        server.update_param(param);
                    }
                }
                _ => {}
            }

            if client.send(&message).await.is_err() {
                return SessionResult::Error;
            }
            // RFQ ends a response cycle; everything up to it can sit
            // in the write buffer.
            if code == 'Z' {
                use tokio::io::AsyncWriteExt;
                if client.flush().await.is_err() {
                    return SessionResult::Error;
                }
            }

            if code == 'E' {
                if let Ok(error) = ErrorResponse::from_bytes(message.payload()) {
                    if error.code == "40P01" {
                        return SessionResult::Deadlock;
                    }
                }
            }

            SessionResult::Continue
        }

        _ = comms.shutting_down() => {
            if comms.fast_shutdown() {
                let _ = client.fatal(ErrorResponse::shutting_down()).await;
                SessionResult::Error
            } else if *tstate == TransactionState::Idle {
                // Smart shutdown takes sessions that are between
                // transactions; the rest finish on their own.
                let _ = client.fatal(ErrorResponse::shutting_down()).await;
                SessionResult::Idle
            } else {
                SessionResult::Continue
            }
        }
    }
}

/// Tear the session down according to how it ended.
async fn finish(
    stream: &mut Stream,
    mut entry: PoolEntry,
    packet: &StartupPacket,
    node: usize,
    outcome: SessionResult,
) {
    let cfg = config();

    match outcome {
        SessionResult::End | SessionResult::Idle => {
            // Reset pass: only a clean backend goes back to the pool.
            let clean = entry.reset(&cfg.general.reset_query_list).await.is_ok();
            let template = TEMPLATE_DATABASES.contains(&packet.database.as_str());

            if clean && !template {
                pool().release(entry).await;
            } else {
                pool().discard(entry).await;
            }
        }

        SessionResult::BackendGone(gone) => {
            info!("backend {} failed mid-session", gone);
            if cfg.general.failover_on_backend_error {
                requests().submit(NodeOpRequest::down(gone));
            }
            let _ = send_fatal(stream, packet.major, ErrorResponse::backend_failure(gone)).await;
            pool().discard(entry).await;
        }

        SessionResult::Deadlock => {
            // A deadlocked backend gets a forced failover report.
            requests().submit(NodeOpRequest::down(node));
            pool().discard(entry).await;
        }

        SessionResult::Error | SessionResult::Fatal | SessionResult::Continue => {
            pool().discard(entry).await;
        }
    }
}

async fn send_fatal(stream: &mut Stream, major: i16, error: ErrorResponse) -> Result<(), Error> {
    if major == 2 {
        stream.send_bytes(&error.to_v2_bytes()).await?;
    } else {
        stream.fatal(error).await?;
    }
    Ok(())
}
