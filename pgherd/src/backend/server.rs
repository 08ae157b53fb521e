//! PostgreSQL backend connection.

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::cluster::BackendNode;
use crate::config::User;
use crate::net::messages::auth::{md5_response, md5_salted};
use crate::net::messages::{
    Authentication, BackendKeyData, CancelRequest, ErrorResponse, FromBytes, Message,
    ParameterStatus, Password, Protocol, Query, ReadyForQuery, StartupPacket, Terminate, ToBytes,
};
use crate::net::{tweak, Stream};

use super::Error;

/// One authenticated connection to a backend node.
#[derive(Debug)]
pub struct Server {
    node_id: usize,
    addr: String,
    stream: Stream,
    id: BackendKeyData,
    params: Vec<ParameterStatus>,
}

impl Server {
    /// Connect and authenticate with the node using the session's
    /// startup packet and configured credentials.
    pub async fn connect(
        node: &BackendNode,
        startup: &StartupPacket,
        user: &User,
    ) -> Result<Self, Error> {
        let addr = node.addr();
        debug!("=> {}", addr);

        let tcp = TcpStream::connect(&addr).await?;
        tweak(&tcp)?;
        let mut stream = Stream::plain(tcp);

        stream.send_bytes(&startup.to_bytes()?).await?;

        // Authentication handoff.
        loop {
            let message = stream.read().await?;

            match message.code() {
                'E' => {
                    let error = ErrorResponse::from_bytes(message.payload())?;
                    return Err(Error::ConnectionError(Box::new(error)));
                }
                'R' => {
                    let auth = Authentication::from_bytes(message.payload())?;

                    match auth {
                        Authentication::Ok => break,
                        Authentication::CleartextPassword => {
                            let password = Password::new(user.backend_password());
                            stream.send_flush(&password).await?;
                        }
                        Authentication::Md5(salt) => {
                            let stored = user.backend_password();
                            let response = if stored.starts_with("md5") {
                                md5_salted(stored, &salt)
                            } else {
                                md5_response(&user.name, stored, &salt)
                            };
                            stream.send_flush(&Password::new(response)).await?;
                        }
                    }
                }

                code => return Err(Error::UnexpectedMessage(code)),
            }
        }

        // Session parameters and cancellation key.
        let mut params = Vec::new();
        let mut key_data: Option<BackendKeyData> = None;

        loop {
            let message = stream.read().await?;

            match message.code() {
                // ReadyForQuery (B)
                'Z' => break,
                // ParameterStatus (B)
                'S' => params.push(ParameterStatus::from_bytes(message.payload())?),
                // BackendKeyData (B)
                'K' => key_data = Some(BackendKeyData::from_bytes(message.payload())?),
                // ErrorResponse (B)
                'E' => {
                    let error = ErrorResponse::from_bytes(message.payload())?;
                    return Err(Error::ConnectionError(Box::new(error)));
                }
                // NoticeResponse (B)
                'N' => {
                    warn!("notice during connect [{}]", addr);
                }

                code => return Err(Error::UnexpectedMessage(code)),
            }
        }

        let id = key_data.ok_or(Error::NoBackendKeyData)?;

        info!("new backend connection [{}]", addr);

        Ok(Server {
            node_id: node.id,
            addr,
            stream,
            id,
            params,
        })
    }

    /// Backend node this connection belongs to.
    pub fn node_id(&self) -> usize {
        self.node_id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Backend-side pid and cancel secret.
    pub fn id(&self) -> BackendKeyData {
        self.id
    }

    /// ParameterStatus set captured at connection time, updated as
    /// the backend reports changes.
    pub fn params(&self) -> &[ParameterStatus] {
        &self.params
    }

    /// Record a parameter change reported mid-session so reuse
    /// replays the current values.
    pub fn update_param(&mut self, update: ParameterStatus) {
        match self.params.iter_mut().find(|p| p.name == update.name) {
            Some(param) => param.value = update.value,
            None => self.params.push(update),
        }
    }

    pub async fn send(&mut self, message: &impl Protocol) -> Result<usize, Error> {
        Ok(self.stream.send(message).await?)
    }

    pub async fn send_flush(&mut self, message: &impl Protocol) -> Result<usize, Error> {
        Ok(self.stream.send_flush(message).await?)
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        use tokio::io::AsyncWriteExt;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn read(&mut self) -> Result<Message, Error> {
        Ok(self.stream.read().await?)
    }

    /// The socket looks alive. Used before reusing a pooled
    /// connection; a silently-dead backend fails here.
    pub async fn check(&mut self) -> Result<(), Error> {
        Ok(self.stream.check().await?)
    }

    /// Run the reset statements and verify the connection comes back
    /// clean, ready for the next session.
    pub async fn reset(&mut self, statements: &[String]) -> Result<(), Error> {
        let mut failed = false;

        for statement in statements {
            self.stream.send_flush(&Query::new(statement)).await?;

            loop {
                let message = self.stream.read().await?;
                match message.code() {
                    'Z' => {
                        let rfq = ReadyForQuery::from_bytes(message.payload())?;
                        if rfq.status != 'I' {
                            failed = true;
                        }
                        break;
                    }
                    'E' => {
                        // "there is no transaction in progress" style
                        // warnings come back as plain notices; a real
                        // error means the connection is not clean.
                        failed = true;
                    }
                    _ => continue,
                }
            }
        }

        if failed {
            Err(Error::ResetFailed)
        } else {
            Ok(())
        }
    }

    /// Close gracefully: tell the backend we're done first.
    pub async fn terminate(mut self) {
        let _ = self.stream.send_flush(&Terminate).await;
    }

    /// One-shot cancel connection. Opens a fresh socket, fires the
    /// CancelRequest, and hangs up, as the protocol requires.
    pub async fn cancel(addr: &str, id: &BackendKeyData) -> Result<(), Error> {
        let tcp = TcpStream::connect(addr).await?;
        tweak(&tcp)?;
        let mut stream = Stream::plain(tcp);
        stream
            .send_bytes(&CancelRequest::from(*id).to_bytes()?)
            .await?;

        Ok(())
    }
}
