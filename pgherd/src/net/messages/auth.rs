//! Authentication (R) and PasswordMessage (p) messages.
//!
//! Both directions are needed: we parse these when talking to
//! backends and generate them when challenging frontends.

use super::{code, prelude::*};
use crate::net::c_string_buf;

/// Authentication (R) message.
#[derive(Debug, Clone, PartialEq)]
pub enum Authentication {
    /// AuthenticationOk.
    Ok,
    /// AuthenticationCleartextPassword.
    CleartextPassword,
    /// AuthenticationMD5Password with 4-byte salt.
    Md5([u8; 4]),
}

impl FromBytes for Authentication {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'R');

        let _len = bytes.get_i32();
        let status = bytes.get_i32();

        match status {
            0 => Ok(Authentication::Ok),
            3 => Ok(Authentication::CleartextPassword),
            5 => {
                let mut salt = [0u8; 4];
                bytes.copy_to_slice(&mut salt);
                Ok(Authentication::Md5(salt))
            }
            status => Err(Error::UnsupportedAuthentication(status)),
        }
    }
}

impl ToBytes for Authentication {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());

        match self {
            Authentication::Ok => payload.put_i32(0),
            Authentication::CleartextPassword => payload.put_i32(3),
            Authentication::Md5(salt) => {
                payload.put_i32(5);
                payload.put(salt);
            }
        }

        Ok(payload.freeze())
    }
}

impl Protocol for Authentication {
    fn code(&self) -> char {
        'R'
    }
}

/// PasswordMessage (F).
#[derive(Debug, Clone)]
pub struct Password {
    pub password: String,
}

impl Password {
    pub fn new(password: impl ToString) -> Self {
        Self {
            password: password.to_string(),
        }
    }

    /// MD5 response for the given credentials and salt:
    /// `md5(md5(password + user) + salt)` with an `md5` prefix.
    pub fn md5(user: &str, password: &str, salt: &[u8; 4]) -> Self {
        Self {
            password: md5_response(user, password, salt),
        }
    }
}

/// Compute the md5-auth response string.
pub fn md5_response(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let stored = md5_stored(user, password);
    md5_salted(&stored, salt)
}

/// The stored form, `md5` + `md5(password + user)`. Password files
/// carry this form so clear text never has to be kept.
pub fn md5_stored(user: &str, password: &str) -> String {
    let mut input = Vec::with_capacity(user.len() + password.len());
    input.extend_from_slice(password.as_bytes());
    input.extend_from_slice(user.as_bytes());
    format!("md5{:x}", md5::compute(&input))
}

/// Salt a stored md5 secret for one authentication exchange.
pub fn md5_salted(stored: &str, salt: &[u8; 4]) -> String {
    let hex = stored.strip_prefix("md5").unwrap_or(stored);
    let mut input = Vec::with_capacity(hex.len() + salt.len());
    input.extend_from_slice(hex.as_bytes());
    input.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&input))
}

impl FromBytes for Password {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'p');

        let _len = bytes.get_i32();
        let password = c_string_buf(&mut bytes);

        Ok(Self { password })
    }
}

impl ToBytes for Password {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_string(&self.password);
        Ok(payload.freeze())
    }
}

impl Protocol for Password {
    fn code(&self) -> char {
        'p'
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_authentication_roundtrip() {
        for auth in [
            Authentication::Ok,
            Authentication::CleartextPassword,
            Authentication::Md5([1, 2, 3, 4]),
        ] {
            let bytes = auth.to_bytes().unwrap();
            let parsed = Authentication::from_bytes(bytes).unwrap();
            assert_eq!(parsed, auth);
        }
    }

    #[test]
    fn test_md5_response() {
        // psql sends md5(md5("secret" + "alice") + salt).
        let salt = [0x01, 0x02, 0x03, 0x04];
        let response = md5_response("alice", "secret", &salt);
        assert!(response.starts_with("md5"));
        assert_eq!(response.len(), 35);

        // Pre-hashed stored secrets produce the same response.
        let stored = md5_stored("alice", "secret");
        assert_eq!(md5_salted(&stored, &salt), response);
    }

    #[test]
    fn test_password_roundtrip() {
        let password = Password::new("hunter2");
        let bytes = password.to_bytes().unwrap();
        let parsed = Password::from_bytes(bytes).unwrap();
        assert_eq!(parsed.password, "hunter2");
    }
}
