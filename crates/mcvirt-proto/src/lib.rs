//! # mcvirt-proto
//!
//! Protocol types, persisted configuration and error types shared by the
//! MCVirt node daemon (`mcvirtd`) and the operator CLI (`mcvirt`).
//!
//! Everything that crosses the wire or lands in a JSON config file is
//! defined here, so that both ends agree on a single representation.

pub mod auth;
pub mod config;
pub mod connect_string;
pub mod constants;
pub mod defaults;
pub mod drbd;
pub mod error;
pub mod hard_drive;
pub mod id;
pub mod node;
pub mod request;
pub mod storage;
pub mod vm;

// Re-export commonly used types at the crate root
pub use error::{McvError, McvResult};
pub use request::{Envelope, Outcome, Reply, Request, Response};
