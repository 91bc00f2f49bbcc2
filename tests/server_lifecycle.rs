//! Integration tests for starting and stopping the proxy engine

use hotspot_proxy::control::{Notice, Notifier, ProxyControl, ProxyService};
use hotspot_proxy::proxy::{ProxyConfig, ProxyServer, DEFAULT_PORT, MAX_PORT};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn local_config(start: u16, end: u16) -> ProxyConfig {
    ProxyConfig::default()
        .with_bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_port_range(start, end)
        .with_select_timeout(Duration::from_millis(100))
}

fn accepts_connections(port: u16) -> bool {
    TcpStream::connect_timeout(
        &SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        Duration::from_secs(1),
    )
    .is_ok()
}

#[test]
fn test_default_port_range() {
    let config = ProxyConfig::default();
    assert_eq!(config.port_start, DEFAULT_PORT);
    assert_eq!(config.port_end, MAX_PORT);
    assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
}

#[test]
fn test_start_twice_keeps_port() {
    let server = ProxyServer::new(local_config(32000, 32500));
    assert!(server.start());
    let port = server.port();
    assert!((32000..32500).contains(&port));

    assert!(server.start());
    assert_eq!(server.port(), port);
    assert!(accepts_connections(port));
    assert!(server.stop());
}

#[test]
fn test_stop_before_start() {
    let server = ProxyServer::new(local_config(32500, 32600));
    assert!(!server.stop());
    assert!(!server.is_running());
    assert_eq!(server.port(), 0);
}

#[test]
fn test_occupied_port_probes_upward() {
    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = occupied.local_addr().unwrap().port();
    let end = taken.saturating_add(100);

    let server = ProxyServer::new(local_config(taken, end));
    assert!(server.start());
    assert!(server.port() > taken);
    assert!(server.port() < end);
    assert!(server.stop());
}

#[test]
fn test_exhausted_range_fails_start() {
    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = occupied.local_addr().unwrap().port();

    let server = ProxyServer::new(local_config(taken, taken + 1));
    assert!(!server.start());
    assert!(!server.is_running());
    assert!(!server.stop());
}

#[test]
fn test_restart_after_stop() {
    let server = ProxyServer::new(local_config(33000, 33500));
    assert!(server.start());
    assert!(server.stop());
    assert!(!server.is_running());

    assert!(server.start());
    assert!(server.is_running());
    assert!(accepts_connections(server.port()));
    assert!(server.stop());
}

#[test]
fn test_stopped_server_refuses_connections() {
    let server = ProxyServer::new(local_config(33500, 34000));
    assert!(server.start());
    let port = server.port();
    assert!(server.stop());

    // The port stays reported after stop
    assert_eq!(server.port(), port);
    assert!(!accepts_connections(port));
}

#[test]
fn test_global_is_shared() {
    let first = ProxyServer::global();
    let second = ProxyServer::global();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(!first.is_running());
}

#[derive(Default)]
struct Recorder {
    posted: Mutex<Vec<Notice>>,
    cancelled: Mutex<Vec<u32>>,
}

impl Notifier for Recorder {
    fn post(&self, notice: &Notice) {
        self.posted.lock().unwrap().push(notice.clone());
    }

    fn cancel(&self, id: u32) {
        self.cancelled.lock().unwrap().push(id);
    }
}

#[test]
fn test_service_drives_engine() {
    let recorder = Arc::new(Recorder::default());
    let engine = Arc::new(ProxyServer::new(local_config(34000, 34500)));
    let service = ProxyService::new(Arc::clone(&engine), Arc::clone(&recorder));

    service.on_start_command();
    assert!(service.start());
    assert!(engine.is_running());
    assert_eq!(service.port(), engine.port());

    let shared = service.share_address().unwrap();
    assert_eq!(shared.port(), engine.port());

    {
        let posted = recorder.posted.lock().unwrap();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0].text, "Service active");
        assert_eq!(posted[1].text, format!("Running on port {}", engine.port()));
    }

    assert!(service.stop());
    assert!(!engine.is_running());
    assert_eq!(*recorder.cancelled.lock().unwrap(), vec![101]);
}

#[test]
fn test_dropping_service_stops_engine() {
    let engine = Arc::new(ProxyServer::new(local_config(34500, 35000)));
    let service = ProxyService::new(Arc::clone(&engine), Arc::new(Recorder::default()));

    assert!(service.start());
    drop(service);
    assert!(!engine.is_running());
}
