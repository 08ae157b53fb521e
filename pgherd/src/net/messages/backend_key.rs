//! BackendKeyData (B) message.

use std::fmt::Display;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

use once_cell::sync::Lazy;
use rand::Rng;

use super::{code, prelude::*};

static COUNTER: Lazy<AtomicI32> = Lazy::new(|| AtomicI32::new(1));

// This wraps around.
fn next_counter() -> i32 {
    COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// BackendKeyData (B).
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Default)]
pub struct BackendKeyData {
    /// Process ID.
    pub pid: i32,
    /// Cancel secret.
    pub secret: i32,
}

impl Display for BackendKeyData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid={}, secret={}", self.pid, self.secret)
    }
}

impl BackendKeyData {
    /// Key data for a connected client. The pid is synthesized since
    /// clients never talk to a real backend process directly.
    pub fn new_client() -> Self {
        Self {
            pid: next_counter(),
            secret: rand::rng().random(),
        }
    }
}

impl ToBytes for BackendKeyData {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());

        payload.put_i32(self.pid);
        payload.put_i32(self.secret);

        Ok(payload.freeze())
    }
}

impl FromBytes for BackendKeyData {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'K');

        let _len = bytes.get_i32();

        Ok(Self {
            pid: bytes.get_i32(),
            secret: bytes.get_i32(),
        })
    }
}

impl Protocol for BackendKeyData {
    fn code(&self) -> char {
        'K'
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let key = BackendKeyData {
            pid: 42,
            secret: -559038737,
        };
        let parsed = BackendKeyData::from_bytes(key.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_client_keys_unique() {
        let a = BackendKeyData::new_client();
        let b = BackendKeyData::new_client();
        assert_ne!(a.pid, b.pid);
    }
}
