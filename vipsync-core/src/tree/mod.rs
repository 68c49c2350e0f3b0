//! Concrete resource nodes.
//!
//! ```text
//! EntrypointGroup ─ Entrypoint ─┬─ VirtualServerA10 ─ VirtualPortA10 ─ ServiceGroupA10 ─ ServerA10
//!                               └─ VirtualServerF5 ─ PoolF5 ─ NodeF5
//! ```
//!
//! Nodes are built fresh for every operation and own their siblings by
//! value. A child only receives resolved values (names, addresses,
//! endpoints) plus the shared [`Scope`].

pub mod entrypoint;
pub mod entrypoint_group;
pub mod pool;
pub mod server;
pub mod virtual_port;
pub mod virtual_server;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::backend::Balancers;
use crate::config::StaticConfig;
use crate::retry::RetryPolicy;
use crate::services::{EnvironmentInfo, Services};

pub use entrypoint::Entrypoint;
pub use entrypoint_group::EntrypointGroup;
pub use pool::Pool;
pub use server::Server;
pub use virtual_port::VirtualPortA10;
pub use virtual_server::{VirtualServerA10, VirtualServerF5};

/// Inventory interface holding the host's primary address.
pub const PRIMARY_INTERFACE: &str = "nic0";

/// One host running the service behind an entrypoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    /// Address the balancer sends traffic to.
    pub ip: String,
    /// `(interface name, ip)` pairs registered for the host, sorted.
    pub interfaces: Vec<(String, String)>,
}

/// Endpoints keyed by short host name.
pub type Endpoints = BTreeMap<String, Endpoint>;

/// Everything a node needs besides its own identity.
pub struct Scope {
    pub config: Arc<StaticConfig>,
    pub services: Services,
    pub balancers: Balancers,
    pub env: EnvironmentInfo,
    pub retry: RetryPolicy,
    pub data_dir: PathBuf,
}

/// Name of the entrypoint for `interface` in an environment.
pub fn entrypoint_name(interface: &str, suffix: &str) -> String {
    format!("{}-{}", interface, suffix)
}

/// Client SSL profile for https listeners.
pub fn client_ssl_profile(domain: &str) -> String {
    format!("star.{}", domain)
}
