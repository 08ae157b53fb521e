//! PostgreSQL protocol messages.
//!
//! Each message type lives in its own module and implements
//! [`ToBytes`], [`FromBytes`] and [`Protocol`].

pub mod auth;
pub mod backend_key;
pub mod buffer;
pub mod cancel;
pub mod error_response;
pub mod parameter_status;
pub mod query;
pub mod rfq;
pub mod startup;
pub mod terminate;

pub use auth::{Authentication, Password};
pub use backend_key::BackendKeyData;
pub use buffer::MessageBuffer;
pub use cancel::CancelRequest;
pub use error_response::ErrorResponse;
pub use parameter_status::ParameterStatus;
pub use query::Query;
pub use rfq::ReadyForQuery;
pub use startup::{Startup, StartupPacket};
pub use terminate::Terminate;

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub use super::Error;

/// Convert a message to its wire representation.
pub trait ToBytes {
    fn to_bytes(&self) -> Result<Bytes, Error>;
}

/// Parse a message from its wire representation.
pub trait FromBytes: Sized {
    fn from_bytes(bytes: Bytes) -> Result<Self, Error>;
}

/// A protocol message with a one-byte kind.
pub trait Protocol: ToBytes + std::fmt::Debug {
    fn code(&self) -> char;
}

/// Assert the message code at the front of the buffer.
macro_rules! code {
    ($bytes:expr, $code:expr) => {
        let code = $bytes.get_u8() as char;
        if code != $code {
            return Err($crate::net::Error::UnexpectedCode($code, code));
        }
    };
}

pub(crate) use code;

/// Commonly used imports for message modules.
pub mod prelude {
    pub use super::{Error, FromBytes, Payload, Protocol, ToBytes};
    pub use bytes::{Buf, BufMut, Bytes};
}

/// Wire payload builder. Computes the length prefix on freeze
/// so message modules don't have to.
pub struct Payload {
    code: Option<char>,
    buf: BytesMut,
}

impl Payload {
    /// Payload for a tagged message, e.g. `ReadyForQuery` (Z).
    pub fn named(code: char) -> Self {
        Self {
            code: Some(code),
            buf: BytesMut::new(),
        }
    }

    /// Payload for an untagged message, e.g. the startup packet.
    pub fn wrapped() -> Self {
        Self {
            code: None,
            buf: BytesMut::new(),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_i16(&mut self, value: i16) {
        self.buf.put_i16(value);
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    /// Write a null-terminated string.
    pub fn put_string(&mut self, value: &str) {
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
    }

    pub fn put(&mut self, value: impl AsRef<[u8]>) {
        self.buf.put_slice(value.as_ref());
    }

    /// Finish the message, prepending the kind byte (if any)
    /// and the length, which includes itself but not the kind.
    pub fn freeze(self) -> Bytes {
        let mut message = BytesMut::with_capacity(self.buf.len() + 5);
        if let Some(code) = self.code {
            message.put_u8(code as u8);
        }
        message.put_i32(self.buf.len() as i32 + 4);
        message.put_slice(&self.buf);
        message.freeze()
    }
}

/// A raw protocol message as read off the wire:
/// kind byte, length, payload.
#[derive(Clone, PartialEq)]
pub struct Message {
    bytes: Bytes,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("code", &self.code())
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Message {
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    /// Total size on the wire, including the kind byte.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Full message bytes, kind byte included. Message modules
    /// re-check the kind themselves.
    pub fn payload(&self) -> Bytes {
        self.bytes.clone()
    }
}

impl ToBytes for Message {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        Ok(self.bytes.clone())
    }
}

impl FromBytes for Message {
    fn from_bytes(bytes: Bytes) -> Result<Self, Error> {
        Ok(Self { bytes })
    }
}

impl Protocol for Message {
    fn code(&self) -> char {
        self.bytes[0] as char
    }
}
