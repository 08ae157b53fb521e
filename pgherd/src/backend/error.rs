//! Backend errors.

use thiserror::Error;

use crate::net::messages::ErrorResponse;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("net: {0}")]
    Net(#[from] crate::net::Error),

    #[error("backend refused connection: {0}")]
    ConnectionError(Box<ErrorResponse>),

    #[error("unexpected message: '{0}'")]
    UnexpectedMessage(char),

    #[error("backend did not send key data")]
    NoBackendKeyData,

    #[error("no credentials configured for user \"{0}\"")]
    NoCredentials(String),

    #[error("reset query failed")]
    ResetFailed,

    #[error("no live backend nodes")]
    AllNodesDown,
}

impl Error {
    /// The backend went away mid-session.
    pub fn disconnect(&self) -> bool {
        matches!(self, Error::Net(crate::net::Error::UnexpectedEof))
    }
}
