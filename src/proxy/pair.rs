//! Client/upstream session
//!
//! A `ChannelPair` couples the channel of one accepted client with the
//! channel it opened towards the requested host, and implements the proxy
//! protocol between them:
//!
//! - awaiting request: only the client channel exists
//! - connecting upstream: request headers parsed, upstream connect in flight
//! - proxying: request head rewritten to origin form and forwarded, bytes
//!   relayed both ways; the next request on the same client connection
//!   re-arms the upstream parser
//! - tunneling: after CONNECT both channels relay raw bytes for good
//! - closed: terminal
//!
//! Every callback runs on the event-loop thread, so a pair is never touched
//! concurrently.

use super::channel::{Channel, ReadOutcome};
use super::parser::{ChannelStatus, ParseEvent};
use super::{Error, ProxyConfig, Result, CONNECT_OK};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Registry, Token};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::Range;
use std::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Request,
    Response,
}

impl Side {
    fn opposite(self) -> Self {
        match self {
            Side::Request => Side::Response,
            Side::Response => Side::Request,
        }
    }

    fn index(self) -> usize {
        match self {
            Side::Request => 0,
            Side::Response => 1,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Side::Request => "request",
            Side::Response => "response",
        }
    }
}

/// Readiness reported by the multiplexer for one socket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub failed: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Readiness {
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable(),
            failed: event.is_error(),
        }
    }
}

/// Maps socket tokens to the session that owns them
///
/// Sessions are keyed by the token of their client socket. Tokens are never
/// reused within one event loop, so a late event for a released token is
/// simply dropped.
#[derive(Debug)]
pub(crate) struct TokenTable {
    next: usize,
    owners: HashMap<Token, Token>,
}

impl TokenTable {
    /// Create a table handing out tokens from `first` upward
    pub fn new(first: usize) -> Self {
        TokenTable {
            next: first,
            owners: HashMap::new(),
        }
    }

    /// Issue a token owned by `session`, or by itself for a new session
    pub fn issue(&mut self, session: Option<Token>) -> Token {
        let token = Token(self.next);
        self.next += 1;
        self.owners.insert(token, session.unwrap_or(token));
        token
    }

    pub fn owner(&self, token: Token) -> Option<Token> {
        self.owners.get(&token).copied()
    }

    pub fn release(&mut self, token: Token) {
        self.owners.remove(&token);
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }
}

/// Event-loop state a session needs while handling one event
pub(crate) struct SessionContext<'a> {
    pub registry: &'a Registry,
    pub tokens: &'a mut TokenTable,
    pub config: &'a ProxyConfig,
}

/// One client session and its upstream connection
pub struct ChannelPair {
    id: Token,
    peer: SocketAddr,
    request: Option<Channel>,
    response: Option<Channel>,
    target: Option<(String, u16)>,
    fallback_addrs: VecDeque<SocketAddr>,
    connect_deadline: Option<Instant>,
    tunnel_pending: bool,
    paused: [bool; 2],
    draining: bool,
    closed: bool,
}

impl ChannelPair {
    /// Accept one client from the listener and register its channel
    ///
    /// Returns `Ok(None)` when no connection is waiting.
    pub(crate) fn accept(
        listener: &TcpListener,
        ctx: &mut SessionContext<'_>,
    ) -> Result<Option<ChannelPair>> {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = stream.set_nodelay(true) {
            trace!(%peer, error = %e, "TCP_NODELAY not applied");
        }

        let token = ctx.tokens.issue(None);
        let mut channel = Channel::request(stream, token, ctx.config);
        if let Err(e) = channel.register(ctx.registry) {
            ctx.tokens.release(token);
            return Err(e);
        }

        debug!(%peer, session = token.0, "client accepted");

        Ok(Some(ChannelPair {
            id: token,
            peer,
            request: Some(channel),
            response: None,
            target: None,
            fallback_addrs: VecDeque::new(),
            connect_deadline: None,
            tunnel_pending: false,
            paused: [false; 2],
            draining: false,
            closed: false,
        }))
    }

    /// Handle readiness of one of this pair's sockets
    ///
    /// An error means the session is unusable; the caller closes it.
    pub(crate) fn handle_event(
        &mut self,
        token: Token,
        ready: Readiness,
        ctx: &mut SessionContext<'_>,
    ) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let side = self.side_of(token).ok_or(Error::UnknownToken(token.0))?;

        if side == Side::Response && self.connect_deadline.is_some() {
            if !(ready.writable || ready.failed) {
                return Ok(());
            }
            if !self.finish_connect(ctx)? {
                return Ok(());
            }
        } else if ready.failed && !ready.readable {
            return Err(Error::SocketFailed(side.name()));
        }

        if ready.writable {
            self.flush_side(side, ctx)?;
        }
        if ready.readable && !self.closed {
            self.pump(side, ctx)?;
        }
        Ok(())
    }

    /// Complete the in-flight upstream connect
    ///
    /// A refused address moves on to the next resolved one, if any.
    fn finish_connect(&mut self, ctx: &mut SessionContext<'_>) -> Result<bool> {
        let tunnel = self.tunnel_pending;
        let outcome = match self.response.as_mut() {
            Some(response) => response.finish_connect(),
            None => return Ok(false),
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) if !self.fallback_addrs.is_empty() => {
                debug!(session = self.id.0, error = %e, "upstream address failed, trying next");
                self.connect_next(ctx)?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        self.connect_deadline = None;
        debug!(session = self.id.0, target = %self.target_label(), "upstream connected");

        if tunnel {
            self.tunnel_pending = false;
            if let Some(request) = self.request.as_mut() {
                request.set_status(ChannelStatus::Content);
                request.write(CONNECT_OK)?;
            }
        }
        Ok(true)
    }

    /// Drain readable bytes from one side and react to parser events
    fn pump(&mut self, side: Side, ctx: &mut SessionContext<'_>) -> Result<()> {
        while !self.closed {
            if self.backlogged(side.opposite(), ctx.config) {
                trace!(session = self.id.0, side = side.name(), "peer backlogged, pausing reads");
                self.paused[side.index()] = true;
                return Ok(());
            }

            let outcome = match self.channel_mut(side) {
                Some(channel) => channel.read(),
                None => return Ok(()),
            };

            match outcome {
                ReadOutcome::Data(_) => self.dispatch(side, ctx)?,
                ReadOutcome::WouldBlock => return Ok(()),
                ReadOutcome::Closed => {
                    self.on_close(side, ctx);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, side: Side, ctx: &mut SessionContext<'_>) -> Result<()> {
        while !self.closed {
            let event = match self.channel_mut(side) {
                Some(channel) => channel.next_event(),
                None => return Ok(()),
            };

            match event {
                ParseEvent::NeedMore => return Ok(()),
                ParseEvent::StatusLine => self.on_status_line(side),
                ParseEvent::Headers => self.on_headers(side, ctx)?,
                ParseEvent::Content(range) => self.on_content(side, range)?,
            }
        }
        Ok(())
    }

    fn on_status_line(&self, side: Side) {
        if let Some(channel) = self.channel(side) {
            trace!(
                session = self.id.0,
                side = side.name(),
                line = channel.status_line().unwrap_or_default(),
                "status line"
            );
        }
    }

    fn on_headers(&mut self, side: Side, ctx: &mut SessionContext<'_>) -> Result<()> {
        match side {
            Side::Request => self.connect_upstream(ctx),
            Side::Response => {
                let head = match self.response.as_ref() {
                    Some(response) => response.response_head(),
                    None => return Ok(()),
                };
                if let Some(request) = self.request.as_mut() {
                    request.write(&head)?;
                }
                Ok(())
            }
        }
    }

    /// Route the parsed request to its upstream
    ///
    /// Opens a new upstream connection unless the previous one targets the
    /// same host and port, in which case it is re-armed for the next
    /// response. CONNECT requests are answered once the connect completes.
    fn connect_upstream(&mut self, ctx: &mut SessionContext<'_>) -> Result<()> {
        let Some(request) = self.request.as_mut() else {
            return Ok(());
        };

        let host = request.resolve_host().map(str::to_owned);
        let Some(host) = host else {
            return Err(Error::UnresolvedHost(
                request.status_line().unwrap_or_default().to_string(),
            ));
        };
        let port = request.port();
        let is_connect = request.is_connect();
        let head = (!is_connect).then(|| request.request_head());
        let target = (host, port);

        let reusable = !is_connect
            && self.target.as_ref() == Some(&target)
            && self.response.as_ref().map_or(false, |r| !r.is_closed());

        if reusable {
            if let Some(response) = self.response.as_mut() {
                response.reset();
            }
            debug!(session = self.id.0, host = %target.0, port = target.1, "reusing upstream");
        } else {
            if let Some(mut stale) = self.response.take() {
                stale.close(ctx.registry);
                ctx.tokens.release(stale.token());
            }
            self.tunnel_pending = is_connect;
            self.open_upstream(&target, ctx)?;
        }
        self.target = Some(target);

        if let (Some(head), Some(response)) = (head, self.response.as_mut()) {
            response.write(&head)?;
        }
        Ok(())
    }

    fn open_upstream(&mut self, target: &(String, u16), ctx: &mut SessionContext<'_>) -> Result<()> {
        let (host, port) = (target.0.as_str(), target.1);
        self.fallback_addrs = (host, port).to_socket_addrs()?.collect();
        if self.fallback_addrs.is_empty() {
            return Err(Error::NoAddress {
                host: host.to_string(),
                port,
            });
        }
        self.connect_next(ctx)
    }

    /// Start a connect to the next resolved address
    ///
    /// Bytes already queued for a failed attempt move to the new channel.
    fn connect_next(&mut self, ctx: &mut SessionContext<'_>) -> Result<()> {
        let queued = self.response.take().map(|mut failed| {
            let queued = failed.take_pending();
            failed.close(ctx.registry);
            ctx.tokens.release(failed.token());
            queued
        });

        let mut last_error = None;
        while let Some(addr) = self.fallback_addrs.pop_front() {
            let stream = match TcpStream::connect(addr) {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(session = self.id.0, %addr, error = %e, "upstream address refused");
                    last_error = Some(e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                trace!(%addr, error = %e, "TCP_NODELAY not applied");
            }

            let token = ctx.tokens.issue(Some(self.id));
            let mut channel = Channel::response(stream, token, ctx.config);
            if let Err(e) = channel.register(ctx.registry) {
                ctx.tokens.release(token);
                return Err(e);
            }
            if self.tunnel_pending {
                channel.set_status(ChannelStatus::Content);
            }
            if let Some(queued) = queued.as_deref() {
                channel.write(queued)?;
            }

            debug!(session = self.id.0, %addr, "connecting upstream");
            self.connect_deadline = Some(Instant::now() + ctx.config.connect_timeout);
            self.response = Some(channel);
            return Ok(());
        }

        self.connect_deadline = None;
        Err(match last_error {
            Some(e) => e.into(),
            None => Error::ConnectTimeout(self.target_label()),
        })
    }

    /// Relay content bytes from `side` to the opposite channel
    fn on_content(&mut self, side: Side, range: Range<usize>) -> Result<()> {
        let (source, target) = match side {
            Side::Request => (&self.request, &mut self.response),
            Side::Response => (&self.response, &mut self.request),
        };

        if let (Some(source), Some(target)) = (source.as_ref(), target.as_mut()) {
            if !target.is_closed() {
                target.write(source.socket_buffer(range))?;
            }
        }
        Ok(())
    }

    fn flush_side(&mut self, side: Side, ctx: &mut SessionContext<'_>) -> Result<()> {
        let drained = match self.channel_mut(side) {
            Some(channel) if !channel.is_closed() => {
                channel.flush()?;
                channel.pending_len() == 0
            }
            _ => true,
        };

        if self.draining && drained {
            self.close(ctx.registry);
            return Ok(());
        }

        let source = side.opposite();
        if self.paused[source.index()] && !self.backlogged(side, ctx.config) {
            self.paused[source.index()] = false;
            self.pump(source, ctx)?;
        }
        Ok(())
    }

    fn on_close(&mut self, side: Side, ctx: &mut SessionContext<'_>) {
        if let Some(channel) = self.channel_mut(side) {
            channel.close(ctx.registry);
        }

        let peer_pending = self
            .channel(side.opposite())
            .filter(|c| !c.is_closed() && c.is_connected())
            .map_or(0, Channel::pending_len);

        if peer_pending > 0 {
            debug!(session = self.id.0, side = side.name(), pending = peer_pending, "peer closed, draining");
            self.draining = true;
        } else {
            debug!(session = self.id.0, side = side.name(), "peer closed");
            self.close(ctx.registry);
        }
    }

    fn backlogged(&self, side: Side, config: &ProxyConfig) -> bool {
        self.channel(side)
            .map_or(false, |c| c.pending_len() > config.write_high_water)
    }

    /// Close both channels; safe to call repeatedly
    pub(crate) fn close(&mut self, registry: &Registry) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(request) = self.request.as_mut() {
            request.close(registry);
        }
        if let Some(response) = self.response.as_mut() {
            response.close(registry);
        }
    }

    fn side_of(&self, token: Token) -> Option<Side> {
        if self.request.as_ref().map(Channel::token) == Some(token) {
            Some(Side::Request)
        } else if self.response.as_ref().map(Channel::token) == Some(token) {
            Some(Side::Response)
        } else {
            None
        }
    }

    fn channel(&self, side: Side) -> Option<&Channel> {
        match side {
            Side::Request => self.request.as_ref(),
            Side::Response => self.response.as_ref(),
        }
    }

    fn channel_mut(&mut self, side: Side) -> Option<&mut Channel> {
        match side {
            Side::Request => self.request.as_mut(),
            Side::Response => self.response.as_mut(),
        }
    }

    fn target_label(&self) -> String {
        match &self.target {
            Some((host, port)) => format!("{}:{}", host, port),
            None => "-".to_string(),
        }
    }

    /// Tokens of every socket this session registered
    pub(crate) fn tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.request
            .iter()
            .chain(self.response.iter())
            .map(Channel::token)
    }

    /// When the in-flight upstream connect gives up, if any
    pub(crate) fn connect_deadline(&self) -> Option<Instant> {
        self.connect_deadline
    }

    /// Token of the client socket, which also names the session
    pub fn id(&self) -> Token {
        self.id
    }

    /// Address of the client
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn connect_timeout_error(&self) -> Error {
        Error::ConnectTimeout(self.target_label())
    }
}
