//! Proxy service
//!
//! Long-lived owner of the engine handle on behalf of the host application.
//! It forwards control calls to the engine and keeps the foreground notice
//! tied to the engine state: posted when the service is started, refreshed
//! when the engine comes up, withdrawn when it is stopped. Dropping the
//! service stops the engine.

use super::notice::{LogNotifier, Notice, Notifier, NOTICE_ID};
use super::ProxyControl;
use crate::net;
use crate::proxy::ProxyServer;
use std::net::SocketAddrV4;
use std::sync::Arc;
use tracing::{debug, warn};

/// Control-plane wrapper around a proxy engine
pub struct ProxyService<C: ProxyControl = Arc<ProxyServer>, N: Notifier = LogNotifier> {
    control: C,
    notifier: N,
}

impl ProxyService {
    /// Service over the process-wide engine, reporting to the log
    pub fn global() -> Self {
        ProxyService::new(ProxyServer::global(), LogNotifier)
    }
}

impl<C: ProxyControl, N: Notifier> ProxyService<C, N> {
    pub fn new(control: C, notifier: N) -> Self {
        ProxyService { control, notifier }
    }

    /// Post the foreground notice for the current engine state
    pub fn on_start_command(&self) {
        self.notifier.post(&self.notice());
    }

    /// Notice describing the current engine state
    pub fn notice(&self) -> Notice {
        Notice::for_state(self.control.is_running(), self.control.port())
    }

    /// Address other devices should use as their proxy, while running
    pub fn share_address(&self) -> Option<SocketAddrV4> {
        if !self.control.is_running() {
            return None;
        }
        Some(SocketAddrV4::new(net::local_ip_address(), self.control.port()))
    }
}

impl<C: ProxyControl, N: Notifier> ProxyControl for ProxyService<C, N> {
    fn start(&self) -> bool {
        let started = self.control.start();
        if started {
            self.notifier.post(&self.notice());
        } else {
            warn!("proxy engine unavailable");
        }
        started
    }

    fn stop(&self) -> bool {
        let stopped = self.control.stop();
        self.notifier.cancel(NOTICE_ID);
        debug!(stopped, "proxy service stopped");
        stopped
    }

    fn is_running(&self) -> bool {
        self.control.is_running()
    }

    fn port(&self) -> u16 {
        self.control.port()
    }
}

impl<C: ProxyControl, N: Notifier> Drop for ProxyService<C, N> {
    fn drop(&mut self) {
        self.control.stop();
    }
}
