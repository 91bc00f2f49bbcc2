//! Proxy engine configuration

use super::{DEFAULT_PORT, MAX_PORT};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Settings for one proxy engine
///
/// The defaults match a hotspot-sharing deployment: listen on every
/// interface, probe ports upward from 7071 and keep buffers small.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Address the listener binds to
    pub bind_addr: IpAddr,
    /// First port probed
    pub port_start: u16,
    /// Exclusive end of the probed range
    pub port_end: u16,
    /// Listen backlog
    pub backlog: i32,
    /// Longest wait in the multiplexer before re-checking for shutdown
    pub select_timeout: Duration,
    /// How long `stop()` waits for the worker thread
    pub join_timeout: Duration,
    /// Budget for an upstream connect to complete
    pub connect_timeout: Duration,
    /// Receive buffer size per channel
    pub buffer_size: usize,
    /// Longest header or status line kept; longer lines are truncated
    pub line_capacity: usize,
    /// Queued bytes on one channel above which its peer stops being read
    pub write_high_water: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_start: DEFAULT_PORT,
            port_end: MAX_PORT,
            backlog: 128,
            select_timeout: Duration::from_secs(1),
            join_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(500),
            buffer_size: 16 * 1024,
            line_capacity: 4096,
            write_high_water: 256 * 1024,
        }
    }
}

impl ProxyConfig {
    /// Set the listen address
    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the probed port range `[start, end)`
    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_start = start;
        self.port_end = end;
        self
    }

    /// Set the upstream connect budget
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the multiplexer wait
    pub fn with_select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = timeout;
        self
    }

    /// Set the worker join wait used by `stop()`
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.port_start, 7071);
        assert_eq!(config.port_end, 50146);
        assert_eq!(config.buffer_size, 16384);
        assert_eq!(config.line_capacity, 4096);
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.join_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_builder() {
        let config = ProxyConfig::default()
            .with_bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_port_range(9000, 9010)
            .with_connect_timeout(Duration::from_secs(2));

        assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!((config.port_start, config.port_end), (9000, 9010));
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
    }
}
