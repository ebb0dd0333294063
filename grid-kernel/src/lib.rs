//! Grid kernel: homelab fleet inventory (Proxmox VMs, Docker containers)
//! cached in NATS KV, plus multi-provider DNS record management.
//!
//! The `grid` binary is a thin shell over [`cli::run`]; everything else is
//! usable as a library, which is how the devkit scenario tests drive it.

pub mod cli;
pub mod collector;
pub mod config;
pub mod dns;
pub mod error;
pub mod http;
pub mod models;
pub mod resolver;
pub mod store;
pub mod sync;

pub use error::{GridError, GridResult};
