//! Client authentication.
//!
//! The proxy terminates authentication: clients prove themselves
//! against configured credentials, backends get authenticated
//! separately with the same stored secrets.

use rand::Rng;

use crate::config::{AuthType, User};
use crate::net::messages::auth::{md5_response, md5_salted};
use crate::net::messages::{Authentication, FromBytes, Password, Protocol};
use crate::net::Stream;

use super::Error;

/// Run the authentication exchange. Sends `AuthenticationOk` on
/// success; the caller decides what follows it.
pub async fn authenticate(stream: &mut Stream, user: &User) -> Result<(), Error> {
    match user.auth {
        AuthType::Trust => {}

        AuthType::Cleartext => {
            stream
                .send_flush(&Authentication::CleartextPassword)
                .await?;
            let offered = read_password(stream).await?;

            if Some(offered.as_str()) != user.password.as_deref() {
                return Err(Error::Auth);
            }
        }

        AuthType::Md5 => {
            let salt: [u8; 4] = rand::rng().random();
            stream.send_flush(&Authentication::Md5(salt)).await?;
            let offered = read_password(stream).await?;

            let stored = user.password.as_deref().unwrap_or("");
            let expected = if stored.starts_with("md5") {
                md5_salted(stored, &salt)
            } else {
                md5_response(&user.name, stored, &salt)
            };

            if offered != expected {
                return Err(Error::Auth);
            }
        }
    }

    stream.send(&Authentication::Ok).await?;
    Ok(())
}

async fn read_password(stream: &mut Stream) -> Result<String, Error> {
    let message = stream.read().await?;
    if message.code() != 'p' {
        return Err(Error::UnexpectedMessage(message.code()));
    }
    Ok(Password::from_bytes(message.payload())?.password)
}
