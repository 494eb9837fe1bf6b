//! Connection state management.

use std::io::{self, Read, Write};

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Token};
use serde::Serialize;

use crate::EngineResult;
use crate::http::{self, HttpRequest};
use crate::transport::{self, TransportRequest};

const BUFFER_SIZE: usize = 8 * 1024;

/// Which listener accepted the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protocol {
    Http,
    Transport,
}

/// State of one accepted connection.
pub(crate) struct Connection {
    /// Kept for debugging.
    #[allow(dead_code)]
    pub token: Token,
    pub stream: TcpStream,
    pub protocol: Protocol,
    pub read_buf: BytesMut,
    pub write_buf: BytesMut,
    /// Close once the write buffer drains.
    pub closing: bool,
    /// Transport connections must handshake before anything else.
    pub handshaken: bool,
}

impl Connection {
    pub fn new(token: Token, stream: TcpStream, protocol: Protocol) -> Self {
        Self {
            token,
            stream,
            protocol,
            read_buf: BytesMut::with_capacity(BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(BUFFER_SIZE),
            closing: false,
            handshaken: false,
        }
    }

    /// Reads data from the socket into the read buffer.
    ///
    /// Returns `true` if the connection is still open.
    pub fn read(&mut self) -> io::Result<bool> {
        let mut temp_buf = [0u8; 4096];

        loop {
            match self.stream.read(&mut temp_buf) {
                Ok(0) => return Ok(false),
                Ok(n) => self.read_buf.extend_from_slice(&temp_buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes data from the write buffer to the socket.
    ///
    /// Returns `true` if all data was written.
    pub fn write(&mut self) -> io::Result<bool> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ));
                }
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Attempts to decode a transport request from the read buffer.
    pub fn try_decode_request(&mut self) -> EngineResult<Option<TransportRequest>> {
        transport::decode_frame(&mut self.read_buf)
    }

    /// Attempts to take one complete HTTP request off the read buffer.
    pub fn try_take_http_request(&mut self) -> Result<Option<HttpRequest>, http::ParseError> {
        http::parse_request(&mut self.read_buf)
    }

    /// Queues a transport frame to be sent.
    pub fn queue_frame<T: Serialize>(&mut self, message: &T) -> EngineResult<()> {
        transport::encode_frame(message, &mut self.write_buf)
    }

    /// Queues raw bytes to be sent.
    pub fn queue_bytes(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
    }

    /// Returns the interest flags for this connection.
    pub fn interest(&self) -> Interest {
        if self.write_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// True once a closing connection has flushed everything.
    pub fn is_done(&self) -> bool {
        self.closing && self.write_buf.is_empty()
    }
}
