//! HTTP proxy engine
//!
//! This module implements the local proxy: a single worker thread drives a
//! readiness multiplexer, accepts client connections and relays them to
//! upstream hosts.
//!
//! # Architecture
//!
//! - `Channel` wraps one non-blocking socket together with an incremental
//!   message parser (status line, headers, then opaque content)
//! - `ChannelPair` couples the client channel with its upstream channel and
//!   implements the proxy protocol (request rewriting, CONNECT tunneling,
//!   keep-alive reuse of the upstream connection)
//! - `ProxyServer` owns the listening socket and the worker thread and
//!   exposes the start/stop lifecycle
//!
//! # Examples
//!
//! ```no_run
//! use hotspot_proxy::proxy::{ProxyConfig, ProxyServer};
//!
//! let server = ProxyServer::new(ProxyConfig::default());
//! if server.start() {
//!     println!("proxy listening on port {}", server.port());
//! }
//! server.stop();
//! ```

pub mod channel;
pub mod config;
pub mod headers;
pub mod pair;
pub mod parser;
pub mod server;

pub use channel::{Channel, ReadOutcome};
pub use config::ProxyConfig;
pub use headers::Headers;
pub use pair::ChannelPair;
pub use parser::{ChannelKind, ChannelStatus, MessageParser, ParseEvent};
pub use server::ProxyServer;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Proxy engine errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No free port in range {start}..{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("Cannot resolve upstream host for request: {0}")]
    UnresolvedHost(String),

    #[error("No address found for {host}:{port}")]
    NoAddress { host: String, port: u16 },

    #[error("Connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("Socket failure on {0} channel")]
    SocketFailed(&'static str),

    #[error("Event for unknown token {0}")]
    UnknownToken(usize),
}

/// First port probed when binding the listener
pub const DEFAULT_PORT: u16 = 7071;

/// Exclusive upper bound of the probed port range
pub const MAX_PORT: u16 = 50146;

/// Default port for plain HTTP targets
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default port for CONNECT targets
pub const DEFAULT_TUNNEL_PORT: u16 = 443;

/// Reply sent to the client once a CONNECT tunnel is established
pub const CONNECT_OK: &[u8] =
    b"HTTP/1.1 200 Connection Established\r\nProxy-agent: NekoProxy\r\n\r\n";

/// CRLF line ending
pub const CRLF: &str = "\r\n";
