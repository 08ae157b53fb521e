//! Cancel-safe read buffer for protocol messages.
//!
//! The proxy loop selects over two sockets at once, so reads must
//! survive cancellation: partial frames stay in the buffer.

use std::io::Cursor;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Error, Message};

const HEADER_SIZE: usize = 5;
const BUFFER_SIZE: usize = 4096;

#[derive(Default, Debug)]
pub struct MessageBuffer {
    buffer: BytesMut,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
        }
    }

    /// Read one protocol message off the stream.
    ///
    /// # Cancellation safety
    ///
    /// This method is cancel-safe: bytes consumed from the socket are
    /// retained in the buffer across calls.
    pub async fn read(
        &mut self,
        stream: &mut (impl AsyncRead + Unpin),
    ) -> Result<Message, Error> {
        loop {
            if let Some(size) = self.message_size() {
                if self.buffer.len() >= size {
                    return Ok(Message::new(self.buffer.split_to(size).freeze()));
                }
                self.buffer.reserve(size - self.buffer.len());
            }

            if self.buffer.capacity() == self.buffer.len() {
                self.buffer.reserve(BUFFER_SIZE);
            }

            let read = stream.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return Err(Error::UnexpectedEof);
            }
        }
    }

    fn message_size(&self) -> Option<usize> {
        if self.buffer.len() >= HEADER_SIZE {
            let mut cur = Cursor::new(&self.buffer);
            let _code = cur.get_u8();
            let len = cur.get_i32();
            if len < 4 {
                return None;
            }
            Some(len as usize + 1)
        } else {
            None
        }
    }
}
