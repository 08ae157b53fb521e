//! Connection listener. Handles all client connections.

use std::path::PathBuf;

use tokio::net::{TcpListener, UnixListener};
use tokio::select;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::config;
use crate::net::Stream;

use super::{client, comms, Error};

/// Client connections listener and handler.
#[derive(Debug)]
pub struct Listener {
    addr: String,
}

impl Listener {
    /// Create new client listener.
    pub fn new(addr: impl ToString) -> Self {
        Self {
            addr: addr.to_string(),
        }
    }

    /// Listen for client connections and handle them until
    /// shutdown.
    pub async fn listen(&mut self) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("pgherd listening on {}", self.addr);

        let unix = match unix_socket_path() {
            Some(path) => {
                // A previous unclean shutdown leaves the socket file.
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path)?;
                info!("pgherd listening on {}", path.display());
                Some((listener, path))
            }
            None => None,
        };

        let tracker = TaskTracker::new();
        let comms = comms();

        loop {
            select! {
                connection = listener.accept() => {
                    let (stream, addr) = connection?;
                    if let Err(err) = crate::net::tweak(&stream) {
                        warn!("socket tweak failed for {}: {}", addr, err);
                    }
                    Self::spawn_session(&tracker, Stream::plain(stream));
                }

                connection = accept_unix(&unix), if unix.is_some() => {
                    let stream = connection?;
                    Self::spawn_session(&tracker, Stream::unix(stream));
                }

                _ = comms.shutting_down() => {
                    break;
                }
            }
        }

        // Stop accepting; drain sessions.
        tracker.close();

        if comms.fast_shutdown() {
            info!("fast shutdown, not waiting for clients");
        } else {
            let wait = config().general.shutdown_timeout();
            info!(
                "waiting up to {:.3}s for {} clients to finish",
                wait.as_secs_f64(),
                tracker.len(),
            );
            if timeout(wait, tracker.wait()).await.is_err() {
                warn!(
                    "terminating {} client connections due to shutdown timeout",
                    tracker.len()
                );
            }
        }

        if let Some((_, path)) = unix {
            let _ = std::fs::remove_file(path);
        }

        Ok(())
    }

    fn spawn_session(tracker: &TaskTracker, stream: Stream) {
        tracker.spawn(async move {
            match client::handle(stream).await {
                Ok(_) => (),
                Err(err) => {
                    if !err.disconnect() {
                        error!("client crashed: {:?}", err);
                    }
                }
            }
        });
    }
}

fn unix_socket_path() -> Option<PathBuf> {
    let general = &config().general;
    general
        .unix_socket_dir
        .as_ref()
        .map(|dir| dir.join(format!(".s.PGSQL.{}", general.port)))
}

async fn accept_unix(
    unix: &Option<(UnixListener, PathBuf)>,
) -> Result<tokio::net::UnixStream, std::io::Error> {
    match unix {
        Some((listener, _)) => listener.accept().await.map(|(stream, _)| stream),
        // Guarded by `if unix.is_some()` in the select.
        None => std::future::pending().await,
    }
}
