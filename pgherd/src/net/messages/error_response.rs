//! ErrorResponse (B) message.

use std::fmt::Display;

use bytes::{BufMut, BytesMut};

use super::{code, prelude::*};
use crate::net::c_string_buf;

/// ErrorResponse (B) message.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub file: Option<String>,
    pub line: Option<String>,
}

impl Default for ErrorResponse {
    fn default() -> Self {
        Self {
            severity: "ERROR".into(),
            code: String::default(),
            message: String::default(),
            detail: None,
            hint: None,
            file: None,
            line: None,
        }
    }
}

impl ErrorResponse {
    /// Connection limit reached.
    pub fn too_many_clients() -> ErrorResponse {
        ErrorResponse {
            severity: "FATAL".into(),
            code: "53300".into(),
            message: "sorry, too many clients already".into(),
            ..Default::default()
        }
    }

    /// Authentication failed.
    pub fn auth(user: &str) -> ErrorResponse {
        ErrorResponse {
            severity: "FATAL".into(),
            code: "28000".into(),
            message: format!("password authentication failed for user \"{}\"", user),
            ..Default::default()
        }
    }

    /// Startup packet without a user parameter.
    pub fn no_user() -> ErrorResponse {
        ErrorResponse {
            severity: "FATAL".into(),
            code: "28000".into(),
            message: "no PostgreSQL user name specified in startup packet".into(),
            ..Default::default()
        }
    }

    /// No backend is accepting connections.
    pub fn all_backends_down() -> ErrorResponse {
        ErrorResponse {
            severity: "FATAL".into(),
            code: "08000".into(),
            message: "all backend nodes are down".into(),
            hint: Some("check backend status and failover state".into()),
            ..Default::default()
        }
    }

    /// A backend connection died mid-session.
    pub fn backend_failure(node: usize) -> ErrorResponse {
        ErrorResponse {
            severity: "FATAL".into(),
            code: "57P01".into(),
            message: format!("connection to backend {} was lost", node),
            detail: Some("the session cannot continue and a failover may be in progress".into()),
            ..Default::default()
        }
    }

    /// The proxy is shutting down.
    pub fn shutting_down() -> ErrorResponse {
        ErrorResponse {
            severity: "FATAL".into(),
            code: "57P01".into(),
            message: "pgherd is shutting down".into(),
            ..Default::default()
        }
    }

    /// Client took too long to authenticate.
    pub fn auth_timeout() -> ErrorResponse {
        ErrorResponse {
            severity: "FATAL".into(),
            code: "57P05".into(),
            message: "authentication timeout".into(),
            ..Default::default()
        }
    }

    pub fn from_err(err: &impl std::error::Error) -> Self {
        Self {
            severity: "ERROR".into(),
            code: "58000".into(),
            message: err.to_string(),
            ..Default::default()
        }
    }

    /// Legacy single-string form used by protocol major 2 clients.
    pub fn to_v2_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'E');
        buf.put_slice(format!("{}:  {}\n", self.severity, self.message).as_bytes());
        buf.put_u8(0);
        buf.freeze()
    }
}

impl Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} {}", self.severity, self.code, self.message)?;
        if let Some(ref detail) = self.detail {
            write!(f, "\n{}", detail)?
        }
        Ok(())
    }
}

impl FromBytes for ErrorResponse {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'E');

        let _len = bytes.get_i32();

        let mut error_response = ErrorResponse::default();

        while bytes.has_remaining() {
            let field = bytes.get_u8() as char;
            if field == '\0' {
                break;
            }
            let value = c_string_buf(&mut bytes);

            match field {
                'S' => error_response.severity = value,
                'C' => error_response.code = value,
                'M' => error_response.message = value,
                'D' => error_response.detail = Some(value),
                'H' => error_response.hint = Some(value),
                'F' => error_response.file = Some(value),
                'L' => error_response.line = Some(value),
                _ => continue,
            }
        }

        Ok(error_response)
    }
}

impl ToBytes for ErrorResponse {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());

        payload.put_u8(b'S');
        payload.put_string(&self.severity);

        payload.put_u8(b'V');
        payload.put_string(&self.severity);

        payload.put_u8(b'C');
        payload.put_string(&self.code);

        payload.put_u8(b'M');
        payload.put_string(&self.message);

        if let Some(ref detail) = self.detail {
            payload.put_u8(b'D');
            payload.put_string(detail);
        }

        if let Some(ref hint) = self.hint {
            payload.put_u8(b'H');
            payload.put_string(hint);
        }

        if let Some(ref file) = self.file {
            payload.put_u8(b'F');
            payload.put_string(file);
        }

        if let Some(ref line) = self.line {
            payload.put_u8(b'L');
            payload.put_string(line);
        }

        payload.put_u8(0);

        Ok(payload.freeze())
    }
}

impl Protocol for ErrorResponse {
    fn code(&self) -> char {
        'E'
    }
}
