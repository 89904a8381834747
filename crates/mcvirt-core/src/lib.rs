//! # mcvirt-core
//!
//! Core shared library for MCVirt.
//! Provides async networking, length-prefixed framing, the peer transports
//! (plain TCP and TLS) and the shell-out adapter every storage, DRBD and
//! libvirt operation goes through.

pub mod command;
pub mod conn_cache;
pub mod frame;
pub mod net;
pub mod tcp_transport;
pub mod tls;
pub mod transport;
