//! Network primitives: the PostgreSQL wire codec and the
//! buffered socket wrapper shared by frontends and backends.

pub mod error;
pub mod messages;
pub mod stream;
pub mod tweaks;

pub use error::Error;
pub use messages::{FromBytes, Message, Payload, Protocol, ToBytes};
pub use stream::Stream;
pub use tweaks::tweak;

use bytes::Buf;

/// Read a null-terminated C string out of the buffer.
pub fn c_string_buf(buf: &mut impl Buf) -> String {
    let mut result = Vec::new();

    while buf.has_remaining() {
        let byte = buf.get_u8();
        if byte == 0 {
            break;
        }
        result.push(byte);
    }

    String::from_utf8_lossy(&result).to_string()
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_c_string_buf() {
        let mut buf = Bytes::from_static(b"hello\0world\0");
        assert_eq!(c_string_buf(&mut buf), "hello");
        assert_eq!(c_string_buf(&mut buf), "world");
        assert_eq!(c_string_buf(&mut buf), "");
    }
}
