//! ReadyForQuery (B) message.

use super::{code, prelude::*};

/// ReadyForQuery (B) message.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ReadyForQuery {
    /// Transaction status: 'I', 'T' or 'E'.
    pub status: char,
}

impl ReadyForQuery {
    /// Not in a transaction.
    pub fn idle() -> Self {
        Self { status: 'I' }
    }

    /// Inside a transaction block.
    pub fn in_transaction() -> Self {
        Self { status: 'T' }
    }

    /// Transaction block failed.
    pub fn error() -> Self {
        Self { status: 'E' }
    }
}

impl ToBytes for ReadyForQuery {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_u8(self.status as u8);
        Ok(payload.freeze())
    }
}

impl FromBytes for ReadyForQuery {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'Z');
        let _len = bytes.get_i32();
        Ok(Self {
            status: bytes.get_u8() as char,
        })
    }
}

impl Protocol for ReadyForQuery {
    fn code(&self) -> char {
        'Z'
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_roundtrip() {
        for rfq in [
            ReadyForQuery::idle(),
            ReadyForQuery::in_transaction(),
            ReadyForQuery::error(),
        ] {
            let parsed = ReadyForQuery::from_bytes(rfq.to_bytes().unwrap()).unwrap();
            assert_eq!(parsed, rfq);
        }
    }
}
