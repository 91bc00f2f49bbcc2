//! Hotspot Proxy - local HTTP proxy engine for connection sharing
//!
//! This crate provides a single-threaded, non-blocking HTTP/1.1 proxy
//! (plain forwarding and CONNECT tunneling), the control surface used to
//! start and stop it, and the network helpers a host application needs to
//! tell clients where to point their proxy settings.

pub mod control;
pub mod net;
pub mod proxy;
