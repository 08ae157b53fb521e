//! Query (F) message.

use super::{code, prelude::*};
use crate::net::c_string_buf;

/// Query (F) message: a simple-protocol statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub query: String,
}

impl Query {
    pub fn new(query: impl ToString) -> Self {
        Self {
            query: query.to_string(),
        }
    }
}

impl ToBytes for Query {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_string(&self.query);
        Ok(payload.freeze())
    }
}

impl FromBytes for Query {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'Q');
        let _len = bytes.get_i32();
        Ok(Self {
            query: c_string_buf(&mut bytes),
        })
    }
}

impl Protocol for Query {
    fn code(&self) -> char {
        'Q'
    }
}
