//! Incremental HTTP head parser
//!
//! The parser walks a byte buffer one line at a time: first the status line,
//! then the header block, then everything else is opaque content. It never
//! owns the bytes it reads; callers hand in the filled part of a receive
//! buffer plus a cursor and get back one event at a time.

use super::{Headers, CRLF, DEFAULT_HTTP_PORT, DEFAULT_TUNNEL_PORT};
use bytes::{BufMut, BytesMut};
use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;

/// Absolute request URI (`http://host[:port]/...`)
static ABSOLUTE_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"http://([^/:]+)(?::(\d+))?").expect("absolute URI pattern is valid")
});

/// Which side of a proxied conversation a parser reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Client-facing; carries requests
    Request,
    /// Upstream-facing; carries responses
    Response,
}

/// Position of the parser within one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    StatusLine,
    Headers,
    Content,
}

/// Parser events, produced in strict order for each message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// The status line was parsed
    StatusLine,
    /// The blank line closing the header block was seen
    Headers,
    /// Opaque content bytes, as a range of the input buffer
    Content(Range<usize>),
    /// The input is exhausted
    NeedMore,
}

/// Fixed-capacity line accumulator
///
/// Drops `\r`, ends a line on `\n` and silently truncates lines longer than
/// its capacity.
#[derive(Debug)]
struct LineReader {
    buf: Vec<u8>,
    capacity: usize,
}

impl LineReader {
    fn new(capacity: usize) -> Self {
        LineReader {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Consume bytes from `input[*pos..]` until a full line is available
    fn next_line(&mut self, input: &[u8], pos: &mut usize) -> Option<String> {
        while *pos < input.len() {
            let byte = input[*pos];
            *pos += 1;

            match byte {
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.buf).trim().to_string();
                    self.buf.clear();
                    return Some(line);
                }
                b'\r' => {}
                _ => {
                    if self.buf.len() < self.capacity {
                        self.buf.push(byte);
                    }
                }
            }
        }
        None
    }

    fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Incremental parser for one direction of a proxied connection
#[derive(Debug)]
pub struct MessageParser {
    kind: ChannelKind,
    status: ChannelStatus,
    status_line: Option<String>,
    method: Option<String>,
    uri: Option<String>,
    protocol: String,
    host: Option<String>,
    port: u16,
    headers: Headers,
    line: LineReader,
    body_remaining: Option<u64>,
}

impl MessageParser {
    /// Create a parser with the given line-buffer capacity
    pub fn new(kind: ChannelKind, line_capacity: usize) -> Self {
        MessageParser {
            kind,
            status: ChannelStatus::StatusLine,
            status_line: None,
            method: None,
            uri: None,
            protocol: "HTTP/1.1".to_string(),
            host: None,
            port: DEFAULT_HTTP_PORT,
            headers: Headers::new(),
            line: LineReader::new(line_capacity),
            body_remaining: None,
        }
    }

    /// Advance over `input[*pos..]` and return the next event
    ///
    /// Content events carry a range of `input`; the cursor has already
    /// moved past it when the event is returned.
    pub fn next_event(&mut self, input: &[u8], pos: &mut usize) -> ParseEvent {
        if *pos >= input.len() {
            return ParseEvent::NeedMore;
        }

        // A request whose body has been fully seen starts over on new bytes
        if self.status == ChannelStatus::Content && self.body_remaining == Some(0) {
            self.reset();
        }

        if self.status == ChannelStatus::Content {
            let start = *pos;
            let available = (input.len() - start) as u64;
            let take = match self.body_remaining.as_mut() {
                Some(remaining) => {
                    let take = available.min(*remaining);
                    *remaining -= take;
                    take
                }
                None => available,
            };
            *pos = start + take as usize;
            return ParseEvent::Content(start..*pos);
        }

        while let Some(line) = self.line.next_line(input, pos) {
            match self.status {
                ChannelStatus::StatusLine => {
                    // Stray CRLF between keep-alive messages
                    if line.is_empty() {
                        continue;
                    }
                    self.parse_status_line(line);
                    self.status = ChannelStatus::Headers;
                    return ParseEvent::StatusLine;
                }
                ChannelStatus::Headers => {
                    if line.is_empty() {
                        self.status = ChannelStatus::Content;
                        self.body_remaining = self.content_length();
                        return ParseEvent::Headers;
                    }
                    if let Some((name, value)) = Headers::parse_header_line(&line) {
                        self.headers.insert(name, value);
                    }
                }
                ChannelStatus::Content => unreachable!("content is handled before line parsing"),
            }
        }

        ParseEvent::NeedMore
    }

    fn parse_status_line(&mut self, line: String) {
        self.method = None;
        self.uri = None;
        self.protocol = "HTTP/1.1".to_string();
        self.host = None;
        self.port = DEFAULT_HTTP_PORT;

        if self.kind == ChannelKind::Request {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 {
                self.method = Some(parts[0].to_string());
                self.uri = Some(parts[1].to_string());
                if let Some(protocol) = parts.get(2) {
                    self.protocol = protocol.to_string();
                }

                if parts[0] == "CONNECT" {
                    let (host, port) = split_authority(parts[1], DEFAULT_TUNNEL_PORT);
                    self.host = Some(host).filter(|h| !h.is_empty());
                    self.port = port;
                }
            }
        }

        self.status_line = Some(line);
    }

    /// Body length to count down before the next request is parsed
    ///
    /// Tunnels and responses are relayed until they are reset from outside.
    fn content_length(&self) -> Option<u64> {
        if self.kind != ChannelKind::Request || self.is_connect() {
            return None;
        }
        if self.headers.contains("Transfer-Encoding") {
            return None;
        }
        match self.headers.get("Content-Length") {
            Some(value) => value.trim().parse().ok(),
            None => Some(0),
        }
    }

    /// Clear headers and the line cursor for the next message
    ///
    /// Tunnel parsers stay in content mode for good.
    pub fn reset(&mut self) {
        self.status = if self.is_connect() {
            ChannelStatus::Content
        } else {
            ChannelStatus::StatusLine
        };
        self.headers.clear();
        self.line.clear();
        self.body_remaining = None;
    }

    /// Resolve the upstream host for a request
    ///
    /// CONNECT requests use the authority from the status line. Other
    /// requests prefer the `Host` header and fall back to an absolute
    /// `http://` request URI. The matching port is available from `port()`.
    pub fn resolve_host(&mut self) -> Option<&str> {
        if self.is_connect() {
            return self.host.as_deref();
        }

        let uri = self.uri.as_deref()?;

        if let Some(host_header) = self.headers.get("Host") {
            let (host, port) = split_authority(host_header, DEFAULT_HTTP_PORT);
            self.host = Some(host);
            self.port = port;
        } else if let Some(caps) = ABSOLUTE_URI.captures(uri) {
            self.host = Some(caps[1].to_string());
            self.port = caps
                .get(2)
                .and_then(|p| p.as_str().parse().ok())
                .unwrap_or(DEFAULT_HTTP_PORT);
        }

        self.host.as_deref().filter(|h| !h.is_empty())
    }

    /// Path and query of the request URI, without an absolute-form prefix
    pub fn url_path(&self) -> String {
        let uri = self.uri.as_deref().unwrap_or("/");

        if uri.starts_with("http") {
            return match uri.get(8..).and_then(|rest| rest.find('/')) {
                Some(idx) => uri[8 + idx..].to_string(),
                None => "/".to_string(),
            };
        }
        uri.to_string()
    }

    /// Request line to send upstream: `METHOD PATH PROTOCOL`
    pub fn request_line(&self) -> String {
        format!(
            "{} {} {}",
            self.method.as_deref().unwrap_or_default(),
            self.url_path(),
            self.protocol
        )
    }

    /// Serialize the stored headers as CRLF-joined `Name: Value` lines
    pub fn build_header_string(&self) -> String {
        self.headers.to_header_string()
    }

    /// Whether the parsed request is a CONNECT
    pub fn is_connect(&self) -> bool {
        self.method.as_deref() == Some("CONNECT")
    }

    /// Force the parser into content mode
    pub fn set_status(&mut self, status: ChannelStatus) {
        self.status = status;
        if status == ChannelStatus::Content && self.is_connect() {
            self.body_remaining = None;
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn status_line(&self) -> Option<&str> {
        self.status_line.as_deref()
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Split `host[:port]`, accepting bracketed IPv6 literals
///
/// A missing or unparsable port falls back to `default_port`.
pub fn split_authority(authority: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }

    let mut parts = authority.split(':');
    let host = parts.next().unwrap_or_default().to_string();
    let port = parts
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(default_port);
    (host, port)
}

/// Encode a message head: first line, headers, blank line
pub fn encode_head(first_line: &str, headers: &Headers) -> BytesMut {
    let mut wire = BytesMut::with_capacity(first_line.len() + 64 * (headers.len() + 1));

    wire.put_slice(first_line.as_bytes());
    wire.put_slice(CRLF.as_bytes());
    for (name, value) in headers.iter() {
        wire.put_slice(name.as_bytes());
        wire.put_slice(b": ");
        wire.put_slice(value.as_bytes());
        wire.put_slice(CRLF.as_bytes());
    }
    wire.put_slice(CRLF.as_bytes());

    wire
}
