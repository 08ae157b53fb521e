//! TCP socket settings.

use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;

/// Apply socket settings we want on every connection:
/// no Nagle and TCP keep-alives so dead peers are noticed.
pub fn tweak(stream: &TcpStream) -> Result<(), std::io::Error> {
    stream.set_nodelay(true)?;

    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10));
    sock.set_tcp_keepalive(&keepalive)?;

    Ok(())
}
