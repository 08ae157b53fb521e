//! Startup-stage frames: StartupMessage (F), SSLRequest (F),
//! GSSENCRequest (F) and CancelRequest (F).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::prelude::*;

/// CancelRequest magic.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;
/// SSLRequest magic.
pub const SSL_REQUEST_CODE: i32 = 80877103;
/// GSSENCRequest magic.
pub const GSSENC_REQUEST_CODE: i32 = 80877104;

/// Startup packets larger than this are nonsense and rejected
/// before we allocate anything.
const MAX_STARTUP_PACKET_SIZE: i32 = 10000;

/// Protocol 3.0.
pub const PROTOCOL_V3: i32 = 196608;
/// Protocol 2.0.
pub const PROTOCOL_V2: i32 = 131072;

// V2 startup packets have a fixed layout.
const V2_DATABASE_LEN: usize = 64;
const V2_USER_LEN: usize = 32;
const V2_OPTIONS_LEN: usize = 64;
const V2_UNUSED_LEN: usize = 64;
const V2_TTY_LEN: usize = 64;

/// First frame on a client connection.
#[derive(Debug)]
pub enum Startup {
    /// SSLRequest (F).
    Ssl,
    /// GSSENCRequest (F).
    GssEnc,
    /// CancelRequest (F).
    Cancel { pid: i32, secret: i32 },
    /// StartupMessage (F).
    Startup(StartupPacket),
}

impl Startup {
    /// Read a startup-stage frame off the stream. These frames
    /// have no kind byte, just a length and a 4-byte code.
    pub async fn from_stream(stream: &mut (impl AsyncRead + Unpin)) -> Result<Self, Error> {
        let len = stream.read_i32().await?;

        if len <= 0 || len >= MAX_STARTUP_PACKET_SIZE {
            return Err(Error::StartupPacketSize(len));
        }

        if len < 8 {
            return Err(Error::StartupPacketSize(len));
        }

        let mut body = vec![0u8; len as usize - 4];
        stream.read_exact(&mut body).await?;
        let mut body = Bytes::from(body);

        let code = body.get_i32();

        match code {
            SSL_REQUEST_CODE => Ok(Startup::Ssl),
            GSSENC_REQUEST_CODE => Ok(Startup::GssEnc),
            CANCEL_REQUEST_CODE => {
                let pid = body.get_i32();
                let secret = body.get_i32();
                Ok(Startup::Cancel { pid, secret })
            }
            version => Ok(Startup::Startup(StartupPacket::parse(version, body)?)),
        }
    }
}

/// Parsed startup packet. Parameters are canonicalized (sorted by
/// name) so two packets asking for the same session are
/// byte-comparable; the canonical bytes are the pool key.
#[derive(Debug, Clone, PartialEq)]
pub struct StartupPacket {
    /// Protocol major version: 2 or 3.
    pub major: i16,
    /// Protocol minor version.
    pub minor: i16,
    /// `user` parameter. Empty means the client didn't send one.
    pub user: String,
    /// `database` parameter, defaulted to the user name.
    pub database: String,
    /// `application_name` parameter, V3 only.
    pub application_name: Option<String>,
    params: Vec<(String, String)>,
    canonical: Bytes,
}

impl StartupPacket {
    /// Parse a V2 or V3 startup packet body (version code already consumed).
    pub fn parse(version: i32, body: Bytes) -> Result<Self, Error> {
        match version >> 16 {
            3 => Self::parse_v3(version, body),
            2 => Self::parse_v2(version, body),
            _ => Err(Error::UnsupportedProtocol(version)),
        }
    }

    /// Build a V3 startup packet from parameters. Used for backend
    /// connections we originate ourselves.
    pub fn new_v3(params: Vec<(String, String)>) -> Self {
        Self::assemble(PROTOCOL_V3, params)
    }

    fn parse_v3(version: i32, mut body: Bytes) -> Result<Self, Error> {
        let mut params = Vec::new();

        while body.has_remaining() {
            let name = crate::net::c_string_buf(&mut body);
            if name.is_empty() {
                break;
            }
            let value = crate::net::c_string_buf(&mut body);
            params.push((name, value));
        }

        Ok(Self::assemble(version, params))
    }

    fn parse_v2(version: i32, mut body: Bytes) -> Result<Self, Error> {
        let database = fixed_string(&mut body, V2_DATABASE_LEN);
        let user = fixed_string(&mut body, V2_USER_LEN);
        let options = fixed_string(&mut body, V2_OPTIONS_LEN);
        let _unused = fixed_string(&mut body, V2_UNUSED_LEN);
        let tty = fixed_string(&mut body, V2_TTY_LEN);

        let mut params = vec![("user".into(), user), ("database".into(), database)];
        if !options.is_empty() {
            params.push(("options".into(), options));
        }
        if !tty.is_empty() {
            params.push(("tty".into(), tty));
        }

        Ok(Self::assemble(version, params))
    }

    fn assemble(version: i32, mut params: Vec<(String, String)>) -> Self {
        // Canonical order. Sort is stable so duplicate names keep
        // their relative order.
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let user = param(&params, "user").unwrap_or_default();
        let database = param(&params, "database").unwrap_or_else(|| user.clone());
        let application_name = param(&params, "application_name");

        let canonical = encode(version, &params);

        Self {
            major: (version >> 16) as i16,
            minor: (version & 0xffff) as i16,
            user,
            database,
            application_name,
            params,
            canonical,
        }
    }

    /// Canonical wire form: what gets sent to backends and compared
    /// for pool reuse.
    pub fn canonical(&self) -> &Bytes {
        &self.canonical
    }

    /// All parameters in canonical order.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }
}

impl ToBytes for StartupPacket {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        Ok(self.canonical.clone())
    }
}

fn param(params: &[(String, String)], name: &str) -> Option<String> {
    params
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
}

fn fixed_string(body: &mut Bytes, len: usize) -> String {
    let take = len.min(body.remaining());
    let mut raw = vec![0u8; take];
    body.copy_to_slice(&mut raw);
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).to_string()
}

fn encode(version: i32, params: &[(String, String)]) -> Bytes {
    match version >> 16 {
        3 => {
            let mut payload = Payload::wrapped();
            payload.put_i32(version);
            for (name, value) in params {
                payload.put_string(name);
                payload.put_string(value);
            }
            payload.put_u8(0);
            payload.freeze()
        }
        _ => {
            // Fixed V2 layout is its own canonical form.
            let mut buf = BytesMut::new();
            buf.put_i32(4 + 4 + (V2_DATABASE_LEN
                + V2_USER_LEN
                + V2_OPTIONS_LEN
                + V2_UNUSED_LEN
                + V2_TTY_LEN) as i32);
            buf.put_i32(version);
            put_fixed(&mut buf, param(params, "database"), V2_DATABASE_LEN);
            put_fixed(&mut buf, param(params, "user"), V2_USER_LEN);
            put_fixed(&mut buf, param(params, "options"), V2_OPTIONS_LEN);
            put_fixed(&mut buf, None, V2_UNUSED_LEN);
            put_fixed(&mut buf, param(params, "tty"), V2_TTY_LEN);
            buf.freeze()
        }
    }
}

fn put_fixed(buf: &mut BytesMut, value: Option<String>, len: usize) {
    let value = value.unwrap_or_default();
    let bytes = value.as_bytes();
    let take = bytes.len().min(len);
    buf.put_slice(&bytes[..take]);
    for _ in take..len {
        buf.put_u8(0);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn v3_packet(params: &[(&str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&PROTOCOL_V3.to_be_bytes());
        for (name, value) in params {
            body.extend_from_slice(name.as_bytes());
            body.push(0);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);

        let mut packet = Vec::new();
        packet.extend_from_slice(&(body.len() as i32 + 4).to_be_bytes());
        packet.extend_from_slice(&body);
        packet
    }

    async fn parse(packet: Vec<u8>) -> Result<Startup, Error> {
        Startup::from_stream(&mut Cursor::new(packet)).await
    }

    #[tokio::test]
    async fn test_parse_v3() {
        let startup = parse(v3_packet(&[
            ("user", "alice"),
            ("database", "prod"),
            ("application_name", "psql"),
        ]))
        .await
        .unwrap();

        match startup {
            Startup::Startup(packet) => {
                assert_eq!(packet.major, 3);
                assert_eq!(packet.user, "alice");
                assert_eq!(packet.database, "prod");
                assert_eq!(packet.application_name.as_deref(), Some("psql"));
            }
            other => panic!("expected startup, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_database_defaults_to_user() {
        let startup = parse(v3_packet(&[("user", "alice")])).await.unwrap();

        match startup {
            Startup::Startup(packet) => assert_eq!(packet.database, "alice"),
            other => panic!("expected startup, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_canonical_is_order_independent() {
        let a = parse(v3_packet(&[
            ("user", "alice"),
            ("database", "prod"),
            ("client_encoding", "UTF8"),
        ]))
        .await
        .unwrap();
        let b = parse(v3_packet(&[
            ("client_encoding", "UTF8"),
            ("database", "prod"),
            ("user", "alice"),
        ]))
        .await
        .unwrap();

        match (a, b) {
            (Startup::Startup(a), Startup::Startup(b)) => {
                assert_eq!(a.canonical(), b.canonical());
            }
            _ => panic!("expected startup packets"),
        }
    }

    #[tokio::test]
    async fn test_canonical_differs_on_values() {
        let a = parse(v3_packet(&[("user", "alice")])).await.unwrap();
        let b = parse(v3_packet(&[("user", "bob")])).await.unwrap();

        match (a, b) {
            (Startup::Startup(a), Startup::Startup(b)) => {
                assert_ne!(a.canonical(), b.canonical());
            }
            _ => panic!("expected startup packets"),
        }
    }

    #[tokio::test]
    async fn test_cancel_request() {
        let mut packet = Vec::new();
        packet.extend_from_slice(&16i32.to_be_bytes());
        packet.extend_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
        packet.extend_from_slice(&42i32.to_be_bytes());
        packet.extend_from_slice(&0xDEADBEEFu32.to_be_bytes());

        match parse(packet).await.unwrap() {
            Startup::Cancel { pid, secret } => {
                assert_eq!(pid, 42);
                assert_eq!(secret, 0xDEADBEEFu32 as i32);
            }
            other => panic!("expected cancel, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ssl_request() {
        let mut packet = Vec::new();
        packet.extend_from_slice(&8i32.to_be_bytes());
        packet.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());

        assert!(matches!(parse(packet).await.unwrap(), Startup::Ssl));
    }

    #[tokio::test]
    async fn test_length_bounds() {
        let mut packet = Vec::new();
        packet.extend_from_slice(&(-1i32).to_be_bytes());
        assert!(matches!(
            parse(packet).await,
            Err(Error::StartupPacketSize(-1))
        ));

        let mut packet = Vec::new();
        packet.extend_from_slice(&10000i32.to_be_bytes());
        assert!(matches!(
            parse(packet).await,
            Err(Error::StartupPacketSize(10000))
        ));
    }

    #[tokio::test]
    async fn test_parse_v2() {
        let mut body = Vec::new();
        body.extend_from_slice(&PROTOCOL_V2.to_be_bytes());
        let mut field = |value: &str, len: usize| {
            let mut raw = value.as_bytes().to_vec();
            raw.resize(len, 0);
            body.extend_from_slice(&raw);
        };
        field("prod", V2_DATABASE_LEN);
        field("alice", V2_USER_LEN);
        field("", V2_OPTIONS_LEN);
        field("", V2_UNUSED_LEN);
        field("", V2_TTY_LEN);

        let mut packet = Vec::new();
        packet.extend_from_slice(&(body.len() as i32 + 4).to_be_bytes());
        packet.extend_from_slice(&body);

        match parse(packet).await.unwrap() {
            Startup::Startup(startup) => {
                assert_eq!(startup.major, 2);
                assert_eq!(startup.user, "alice");
                assert_eq!(startup.database, "prod");
                assert!(startup.application_name.is_none());
            }
            other => panic!("expected startup, got {:?}", other),
        }
    }
}
