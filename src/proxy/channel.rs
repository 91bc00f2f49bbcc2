//! One side of a proxied conversation
//!
//! A `Channel` owns a non-blocking socket, the receive buffer its bytes land
//! in, the parser that walks that buffer, and a queue of bytes still waiting
//! to be written to the socket.

use super::parser::{encode_head, ChannelKind, ChannelStatus, MessageParser, ParseEvent};
use super::{Headers, ProxyConfig, Result};
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::ops::Range;
use tracing::{debug, trace};

/// Result of draining the socket into the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` fresh bytes are in the buffer
    Data(usize),
    /// Nothing to read right now
    WouldBlock,
    /// The peer closed the connection or the socket failed
    Closed,
}

/// Socket plus incremental parser for one HTTP byte stream
pub struct Channel {
    token: Token,
    stream: TcpStream,
    parser: MessageParser,
    buffer: Box<[u8]>,
    filled: usize,
    cursor: usize,
    pending: BytesMut,
    connected: bool,
    closed: bool,
}

impl Channel {
    /// Wrap a connected client socket
    pub fn request(stream: TcpStream, token: Token, config: &ProxyConfig) -> Self {
        Self::new(ChannelKind::Request, stream, token, config, true)
    }

    /// Wrap an upstream socket whose connect may still be in progress
    pub fn response(stream: TcpStream, token: Token, config: &ProxyConfig) -> Self {
        Self::new(ChannelKind::Response, stream, token, config, false)
    }

    fn new(
        kind: ChannelKind,
        stream: TcpStream,
        token: Token,
        config: &ProxyConfig,
        connected: bool,
    ) -> Self {
        Channel {
            token,
            stream,
            parser: MessageParser::new(kind, config.line_capacity),
            buffer: vec![0u8; config.buffer_size].into_boxed_slice(),
            filled: 0,
            cursor: 0,
            pending: BytesMut::new(),
            connected,
            closed: false,
        }
    }

    /// Register for read and write readiness
    pub fn register(&mut self, registry: &Registry) -> Result<()> {
        registry.register(
            &mut self.stream,
            self.token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(())
    }

    /// Read up to one buffer of bytes from the socket
    ///
    /// Any bytes from the previous read that the parser has not reached yet
    /// are discarded, so callers drain `next_event` before reading again.
    pub fn read(&mut self) -> ReadOutcome {
        if self.closed {
            return ReadOutcome::Closed;
        }

        self.filled = 0;
        self.cursor = 0;

        loop {
            match self.stream.read(&mut self.buffer) {
                Ok(0) => return ReadOutcome::Closed,
                Ok(n) => {
                    self.filled = n;
                    trace!(token = self.token.0, bytes = n, "read");
                    return ReadOutcome::Data(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(token = self.token.0, error = %e, "read failed");
                    return ReadOutcome::Closed;
                }
            }
        }
    }

    /// Next parser event for the bytes of the last read
    pub fn next_event(&mut self) -> ParseEvent {
        self.parser
            .next_event(&self.buffer[..self.filled], &mut self.cursor)
    }

    /// Bytes of the receive buffer named by a content event
    pub fn socket_buffer(&self, range: Range<usize>) -> &[u8] {
        &self.buffer[range]
    }

    /// Queue bytes for the socket and write as much as it accepts now
    ///
    /// Returns the number of bytes written immediately. Whatever the socket
    /// does not take stays queued until the next write-readiness event.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.closed || buf.is_empty() {
            return Ok(0);
        }
        self.pending.extend_from_slice(buf);
        self.flush()
    }

    /// Write queued bytes until the socket would block
    pub fn flush(&mut self) -> Result<usize> {
        if !self.connected || self.closed {
            return Ok(0);
        }

        let mut written = 0;
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.pending.advance(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(written)
    }

    /// Check whether a pending connect has completed
    ///
    /// Returns `Ok(false)` while the connect is still in flight.
    pub fn finish_connect(&mut self) -> Result<bool> {
        if self.connected {
            return Ok(true);
        }
        if let Some(e) = self.stream.take_error()? {
            return Err(e.into());
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.connected = true;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Deregister and shut down the socket; never fails
    pub fn close(&mut self, registry: &Registry) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = registry.deregister(&mut self.stream) {
            trace!(token = self.token.0, error = %e, "deregister failed");
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!(token = self.token.0, error = %e, "shutdown failed");
        }
    }

    /// Re-arm the parser for the next message on this connection
    pub fn reset(&mut self) {
        self.parser.reset();
    }

    /// Resolve the upstream host for the parsed request
    pub fn resolve_host(&mut self) -> Option<&str> {
        self.parser.resolve_host()
    }

    /// Path and query of the parsed request URI
    pub fn url_path(&self) -> String {
        self.parser.url_path()
    }

    /// Stored headers as CRLF-joined lines
    pub fn build_header_string(&self) -> String {
        self.parser.build_header_string()
    }

    /// Head to forward upstream for a plain request
    pub fn request_head(&self) -> BytesMut {
        encode_head(&self.parser.request_line(), self.parser.headers())
    }

    /// Head to relay back to the client for a response
    pub fn response_head(&self) -> BytesMut {
        encode_head(
            self.parser.status_line().unwrap_or_default(),
            self.parser.headers(),
        )
    }

    pub fn set_status(&mut self, status: ChannelStatus) {
        self.parser.set_status(status);
    }

    pub fn status(&self) -> ChannelStatus {
        self.parser.status()
    }

    pub fn kind(&self) -> ChannelKind {
        self.parser.kind()
    }

    pub fn is_connect(&self) -> bool {
        self.parser.is_connect()
    }

    pub fn status_line(&self) -> Option<&str> {
        self.parser.status_line()
    }

    pub fn method(&self) -> Option<&str> {
        self.parser.method()
    }

    pub fn protocol(&self) -> &str {
        self.parser.protocol()
    }

    pub fn host(&self) -> Option<&str> {
        self.parser.host()
    }

    pub fn port(&self) -> u16 {
        self.parser.port()
    }

    pub fn headers(&self) -> &Headers {
        self.parser.headers()
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Take the queued bytes that have not reached the socket yet
    pub fn take_pending(&mut self) -> BytesMut {
        self.pending.split()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
