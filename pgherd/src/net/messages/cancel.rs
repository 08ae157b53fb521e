//! CancelRequest (F) frame.

use super::prelude::*;
use super::startup::CANCEL_REQUEST_CODE;
use super::BackendKeyData;

/// CancelRequest (F). Sent on a fresh connection, never on an
/// established session.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CancelRequest {
    pub pid: i32,
    pub secret: i32,
}

impl From<BackendKeyData> for CancelRequest {
    fn from(key: BackendKeyData) -> Self {
        Self {
            pid: key.pid,
            secret: key.secret,
        }
    }
}

impl ToBytes for CancelRequest {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::wrapped();

        payload.put_i32(CANCEL_REQUEST_CODE);
        payload.put_i32(self.pid);
        payload.put_i32(self.secret);

        Ok(payload.freeze())
    }
}
