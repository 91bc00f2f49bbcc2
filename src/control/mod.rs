//! Control plane for the proxy engine
//!
//! The host application never drives `ProxyServer` sockets directly. It
//! talks to the engine through `ProxyControl`, usually via a `ProxyService`
//! which also keeps the user-facing "proxy is running" notice in step with
//! the engine state.

pub mod notice;
pub mod service;

pub use notice::{LogNotifier, Notice, Notifier};
pub use service::ProxyService;

use crate::proxy::ProxyServer;
use std::sync::Arc;

/// Start/stop/query surface of the proxy engine
///
/// Every method is synchronous, never panics and may be called repeatedly;
/// failures are reported as `false` and details go to the log.
pub trait ProxyControl: Send + Sync {
    /// Start the engine; `true` if it is running afterwards
    fn start(&self) -> bool;

    /// Stop the engine; `false` if it was not running
    fn stop(&self) -> bool;

    fn is_running(&self) -> bool;

    /// Bound port of the running engine
    fn port(&self) -> u16;
}

impl ProxyControl for ProxyServer {
    fn start(&self) -> bool {
        ProxyServer::start(self)
    }

    fn stop(&self) -> bool {
        ProxyServer::stop(self)
    }

    fn is_running(&self) -> bool {
        ProxyServer::is_running(self)
    }

    fn port(&self) -> u16 {
        ProxyServer::port(self)
    }
}

impl<T: ProxyControl + ?Sized> ProxyControl for Arc<T> {
    fn start(&self) -> bool {
        (**self).start()
    }

    fn stop(&self) -> bool {
        (**self).stop()
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }

    fn port(&self) -> u16 {
        (**self).port()
    }
}
