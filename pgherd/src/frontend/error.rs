//! Frontend errors.

use thiserror::Error;

/// Frontend error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("net: {0}")]
    Net(#[from] crate::net::Error),

    #[error("{0}")]
    Backend(#[from] crate::backend::Error),

    #[error("authentication failed")]
    Auth,

    #[error("\"{0}\" parameter is missing")]
    Parameter(String),

    #[error("unexpected message: '{0}'")]
    UnexpectedMessage(char),

    #[error("authentication timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),
}

impl Error {
    /// The client simply hung up; not worth logging as a crash.
    pub(crate) fn disconnect(&self) -> bool {
        matches!(self, Error::Net(crate::net::Error::UnexpectedEof))
    }
}
