//! Network errors.

use thiserror::Error;

/// Wire protocol and socket errors.
///
/// EOF is split out from generic I/O because EOF on an authenticated
/// session is routine (the client quit) while other I/O errors are not.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected eof")]
    UnexpectedEof,

    #[error("expected message '{0}', got '{1}'")]
    UnexpectedCode(char, char),

    #[error("unexpected message: '{0}'")]
    UnexpectedMessage(char),

    #[error("startup packet length out of bounds: {0}")]
    StartupPacketSize(i32),

    #[error("startup packet protocol {0} is not supported")]
    UnsupportedProtocol(i32),

    #[error("authentication type {0} is not supported")]
    UnsupportedAuthentication(i32),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown watchdog packet type: {0}")]
    UnknownPacketType(u8),

    #[error("watchdog frame too large: {0} bytes")]
    FrameTooLarge(u32),
}
