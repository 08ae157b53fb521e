//! Watchdog errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("net: {0}")]
    Net(#[from] crate::net::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("peer \"{0}\" is not configured")]
    UnknownPeer(String),

    #[error("peer authentication failed")]
    AuthFailed,

    #[error("handshake did not start with AddNode")]
    BadHandshake,
}
