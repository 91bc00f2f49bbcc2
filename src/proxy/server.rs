//! Proxy engine lifecycle and event loop
//!
//! `ProxyServer` is the handle the rest of the application holds. Starting
//! it binds the listener, spawns one worker thread and runs the readiness
//! loop on it; stopping it wakes the loop, waits briefly for the worker and
//! lets it release every socket it owns.

use super::pair::{ChannelPair, Readiness, SessionContext, TokenTable};
use super::{Error, ProxyConfig, Result};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use once_cell::sync::OnceCell;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_SESSION_TOKEN: usize = 2;

/// Pause after a failed multiplexer wait
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(50);

static GLOBAL: OnceCell<Arc<ProxyServer>> = OnceCell::new();

/// Handle to the local proxy engine
///
/// `start()` and `stop()` are synchronous, idempotent and serialized by an
/// internal lock, so the handle can be shared between threads.
pub struct ProxyServer {
    config: ProxyConfig,
    worker: Mutex<Option<Worker>>,
    running: AtomicBool,
    port: AtomicU16,
}

/// A live event-loop thread
struct Worker {
    alive: Arc<AtomicBool>,
    waker: Waker,
    handle: JoinHandle<()>,
    exited: mpsc::Receiver<()>,
}

impl ProxyServer {
    /// Create a stopped engine
    pub fn new(config: ProxyConfig) -> Self {
        ProxyServer {
            config,
            worker: Mutex::new(None),
            running: AtomicBool::new(false),
            port: AtomicU16::new(0),
        }
    }

    /// Process-wide engine with the default configuration, created on first use
    pub fn global() -> Arc<ProxyServer> {
        GLOBAL
            .get_or_init(|| Arc::new(ProxyServer::new(ProxyConfig::default())))
            .clone()
    }

    /// Bind the listener and start the event loop
    ///
    /// Returns `true` if the engine is running afterwards, including when it
    /// was already running. Failures are logged and reported as `false`.
    pub fn start(&self) -> bool {
        let mut worker = self.lock_worker();
        if worker.is_some() {
            return true;
        }

        info!(bind = %self.config.bind_addr, "starting proxy server");
        match self.launch() {
            Ok(launched) => {
                *worker = Some(launched);
                true
            }
            Err(e) => {
                error!(error = %e, "proxy server failed to start");
                self.running.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Stop the event loop and release its sockets
    ///
    /// Returns `false` if the engine was not running.
    pub fn stop(&self) -> bool {
        let mut slot = self.lock_worker();
        let Some(worker) = slot.take() else {
            return false;
        };

        info!(port = self.port(), "stopping proxy server");
        self.running.store(false, Ordering::Release);
        worker.alive.store(false, Ordering::Release);

        if let Err(e) = worker.waker.wake() {
            warn!(error = %e, "failed to wake event loop");
        }

        match worker.exited.recv_timeout(self.config.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    error!("event loop thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = self.config.join_timeout.as_millis() as u64,
                    "event loop still busy, detaching"
                );
            }
        }
        true
    }

    /// Port the listener is (or was last) bound to; 0 before the first start
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn launch(&self) -> Result<Worker> {
        let poll = Poll::new()?;
        let (mut listener, port) = bind_listener(&self.config)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let alive = Arc::new(AtomicBool::new(true));
        let event_loop = EventLoop {
            poll,
            listener,
            config: self.config.clone(),
            alive: Arc::clone(&alive),
            sessions: HashMap::new(),
            tokens: TokenTable::new(FIRST_SESSION_TOKEN),
        };

        let (exited_tx, exited) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("hotspot-proxy".to_string())
            .spawn(move || {
                event_loop.run();
                let _ = exited_tx.send(());
            })?;

        self.port.store(port, Ordering::Release);
        self.running.store(true, Ordering::Release);
        info!(port, "proxy server listening");

        Ok(Worker {
            alive,
            waker,
            handle,
            exited,
        })
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind the first free port of the configured range
fn bind_listener(config: &ProxyConfig) -> Result<(TcpListener, u16)> {
    for port in config.port_start..config.port_end {
        let addr = SocketAddr::new(config.bind_addr, port);
        match open_listener(addr, config.backlog) {
            Ok(listener) => return Ok((listener, port)),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
                ) =>
            {
                trace!(port, error = %e, "port unavailable");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(Error::PortsExhausted {
        start: config.port_start,
        end: config.port_end,
    })
}

fn open_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// State owned by the worker thread
struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    config: ProxyConfig,
    alive: Arc<AtomicBool>,
    sessions: HashMap<Token, ChannelPair>,
    tokens: TokenTable,
}

impl EventLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(1024);
        debug!("event loop started");

        while self.alive.load(Ordering::Acquire) {
            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!(error = %e, "multiplexer wait failed");
                    thread::sleep(POLL_ERROR_BACKOFF);
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    LISTENER => self.accept_clients(),
                    token => self.dispatch(token, Readiness::from(event)),
                }
            }

            self.expire_connects();
        }

        self.shutdown();
    }

    fn accept_clients(&mut self) {
        loop {
            let mut ctx = SessionContext {
                registry: self.poll.registry(),
                tokens: &mut self.tokens,
                config: &self.config,
            };

            match ChannelPair::accept(&self.listener, &mut ctx) {
                Ok(Some(pair)) => {
                    self.sessions.insert(pair.id(), pair);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, token: Token, ready: Readiness) {
        let Some(id) = self.tokens.owner(token) else {
            trace!(token = token.0, "event for released token");
            return;
        };
        let Some(pair) = self.sessions.get_mut(&id) else {
            return;
        };

        let mut ctx = SessionContext {
            registry: self.poll.registry(),
            tokens: &mut self.tokens,
            config: &self.config,
        };

        let closed = match pair.handle_event(token, ready, &mut ctx) {
            Ok(()) => pair.is_closed(),
            Err(e) => {
                debug!(session = id.0, peer = %pair.peer(), error = %e, "closing session");
                true
            }
        };

        if closed {
            self.remove_session(id);
        }
    }

    fn expire_connects(&mut self) {
        let now = Instant::now();
        let expired: Vec<Token> = self
            .sessions
            .iter()
            .filter(|(_, pair)| pair.connect_deadline().map_or(false, |d| d <= now))
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(pair) = self.sessions.get(&id) {
                warn!(session = id.0, error = %pair.connect_timeout_error(), "closing session");
            }
            self.remove_session(id);
        }
    }

    /// Wait no longer than the nearest connect deadline
    fn poll_timeout(&self) -> Duration {
        let now = Instant::now();
        self.sessions
            .values()
            .filter_map(ChannelPair::connect_deadline)
            .map(|deadline| deadline.saturating_duration_since(now))
            .fold(self.config.select_timeout, Duration::min)
    }

    fn remove_session(&mut self, id: Token) {
        if let Some(mut pair) = self.sessions.remove(&id) {
            pair.close(self.poll.registry());
            for token in pair.tokens() {
                self.tokens.release(token);
            }
            trace!(
                session = id.0,
                live = self.sessions.len(),
                tokens = self.tokens.len(),
                "session removed"
            );
        }
    }

    fn shutdown(&mut self) {
        let ids: Vec<Token> = self.sessions.keys().copied().collect();
        let count = ids.len();
        for id in ids {
            self.remove_session(id);
        }

        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            trace!(error = %e, "listener deregister failed");
        }
        debug!(sessions = count, "event loop stopped");
    }
}
