//! ParameterStatus (B) message.

use super::{code, prelude::*};
use crate::net::c_string_buf;

/// ParameterStatus (B) message.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterStatus {
    /// Parameter name, e.g. `client_encoding`.
    pub name: String,
    /// Parameter value, e.g. `UTF8`.
    pub value: String,
}

impl<T: ToString> From<(T, T)> for ParameterStatus {
    fn from(value: (T, T)) -> Self {
        Self {
            name: value.0.to_string(),
            value: value.1.to_string(),
        }
    }
}

impl ToBytes for ParameterStatus {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());

        payload.put_string(&self.name);
        payload.put_string(&self.value);

        Ok(payload.freeze())
    }
}

impl FromBytes for ParameterStatus {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'S');

        let _len = bytes.get_i32();

        let name = c_string_buf(&mut bytes);
        let value = c_string_buf(&mut bytes);

        Ok(Self { name, value })
    }
}

impl Protocol for ParameterStatus {
    fn code(&self) -> char {
        'S'
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let status = ParameterStatus::from(("client_encoding", "UTF8"));
        let parsed = ParameterStatus::from_bytes(status.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, status);
    }
}
