//! Terminate (F) message.

use super::prelude::*;

/// Terminate (F) message.
#[derive(Debug, Copy, Clone)]
pub struct Terminate;

impl ToBytes for Terminate {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        Ok(Payload::named(self.code()).freeze())
    }
}

impl Protocol for Terminate {
    fn code(&self) -> char {
        'X'
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encode() {
        let bytes = Terminate.to_bytes().unwrap();
        assert_eq!(&bytes[..], b"X\x00\x00\x00\x04");
    }
}
