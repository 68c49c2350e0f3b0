//! Load balancer adapters.
//!
//! Both balancer families are driven through the vendor-neutral
//! [`LoadBalancer`] trait:
//! - A10 (aXAPI v3): one virtual server carries many ports, each port points
//!   at a service group of servers
//! - F5 (iControl REST): one virtual server per port, pointing at a pool of
//!   nodes
//!
//! Adapters normalize vendor conflict signals into
//! [`ConflictKind`](crate::error::ConflictKind) and keep collection caches
//! that are invalidated after every mutation of the cached object type.

pub mod a10;
pub mod cache;
pub mod f5;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{Settings, StaticConfig};
use crate::error::{BackendError, Error, Result};

pub use a10::A10Client;
pub use f5::F5Client;

/// Result type for adapter calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Balancer vendor family, selected once per entrypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum Family {
    A10,
    F5,
}

impl Family {
    pub fn virtual_kind(self) -> &'static str {
        match self {
            Family::A10 => "VirtualServerA10",
            Family::F5 => "VirtualServerF5",
        }
    }

    pub fn pool_kind(self) -> &'static str {
        match self {
            Family::A10 => "ServiceGroupA10",
            Family::F5 => "PoolF5",
        }
    }

    pub fn server_kind(self) -> &'static str {
        match self {
            Family::A10 => "ServerA10",
            Family::F5 => "NodeF5",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::A10 => write!(f, "A10"),
            Family::F5 => write!(f, "F5"),
        }
    }
}

impl FromStr for Family {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "A10" => Ok(Family::A10),
            "F5" => Ok(Family::F5),
            other => Err(Error::Config(format!("unknown balancer family: {}", other))),
        }
    }
}

impl TryFrom<String> for Family {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

// =============================================================================
// Records
// =============================================================================

/// A server (A10) or node (F5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub name: String,
    pub address: String,
}

/// A pool member: a server name and the port traffic is sent to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolMember {
    pub server: String,
    pub port: u16,
}

impl PoolMember {
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        Self {
            server: server.into(),
            port,
        }
    }

    /// Parse the `host:port` form.
    pub fn parse(label: &str) -> Option<Self> {
        let (server, port) = label.rsplit_once(':')?;
        Some(Self::new(server, port.parse().ok()?))
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

/// A service group (A10) or pool (F5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub name: String,
    pub monitor: String,
    pub members: Vec<PoolMember>,
}

/// One listening port of a virtual server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualPortRecord {
    pub port: u16,
    pub protocol: String,
    pub pool: Option<String>,
    pub http_template: Option<String>,
    pub client_ssl: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualRecord {
    pub name: String,
    pub address: String,
    pub partition: Option<String>,
    pub ports: Vec<VirtualPortRecord>,
    /// Profiles attached to the virtual server (F5 only).
    pub profiles: Vec<String>,
}

/// Per-port virtual server settings (F5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub port: u16,
    pub pool: String,
    pub profiles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualSpec {
    pub name: String,
    pub address: String,
    /// Required by per-port balancers, absent for multi-port ones.
    pub listener: Option<Listener>,
}

/// A virtual port bound to a service group (A10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: String,
    pub pool: String,
    pub http_template: Option<String>,
    pub client_ssl: Option<String>,
}

// =============================================================================
// LoadBalancer
// =============================================================================

/// Vendor-neutral balancer operations.
///
/// Getters return `None` for absent objects; deletes return `false` when
/// there was nothing to delete.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    fn family(&self) -> Family;

    async fn get_server(&self, name: &str) -> BackendResult<Option<ServerRecord>>;

    async fn get_server_by_address(&self, address: &str) -> BackendResult<Option<ServerRecord>>;

    async fn create_server(&self, name: &str, address: &str) -> BackendResult<()>;

    async fn delete_server(&self, name: &str) -> BackendResult<bool>;

    /// Pools that still list the server as a member.
    async fn server_references(&self, name: &str) -> BackendResult<BTreeSet<String>>;

    async fn get_pool(&self, name: &str) -> BackendResult<Option<PoolRecord>>;

    async fn create_pool(&self, name: &str, monitor: &str, members: &[PoolMember]) -> BackendResult<()>;

    async fn delete_pool(&self, name: &str) -> BackendResult<bool>;

    /// Virtual servers that still send traffic to the pool.
    async fn pool_references(&self, name: &str) -> BackendResult<BTreeSet<String>>;

    async fn add_pool_members(&self, pool: &str, members: &[PoolMember]) -> BackendResult<Vec<PoolMember>>;

    /// Remove every member, returning what was removed.
    async fn remove_all_pool_members(&self, pool: &str) -> BackendResult<Vec<PoolMember>>;

    /// Remove the members pointing at `server`, returning what was removed.
    async fn remove_server_members(&self, pool: &str, server: &str) -> BackendResult<Vec<PoolMember>>;

    async fn get_virtual(&self, name: &str) -> BackendResult<Option<VirtualRecord>>;

    async fn create_virtual(&self, spec: &VirtualSpec) -> BackendResult<()>;

    async fn delete_virtual(&self, name: &str) -> BackendResult<bool>;

    async fn get_virtual_port(
        &self,
        _virtual_name: &str,
        _port: u16,
        _protocol: &str,
    ) -> BackendResult<Option<VirtualPortRecord>> {
        Err(BackendError::Unsupported {
            family: self.family(),
            operation: "get_virtual_port",
        })
    }

    async fn create_virtual_port(&self, _virtual_name: &str, _spec: &PortSpec) -> BackendResult<()> {
        Err(BackendError::Unsupported {
            family: self.family(),
            operation: "create_virtual_port",
        })
    }

    async fn delete_virtual_port(&self, _virtual_name: &str, _port: u16, _protocol: &str) -> BackendResult<bool> {
        Err(BackendError::Unsupported {
            family: self.family(),
            operation: "delete_virtual_port",
        })
    }
}

/// Pools listing `server` among their members.
pub fn pools_using_server(pools: &[PoolRecord], server: &str) -> BTreeSet<String> {
    pools
        .iter()
        .filter(|pool| pool.members.iter().any(|m| m.server == server))
        .map(|pool| pool.name.clone())
        .collect()
}

/// Virtual servers with a port bound to `pool`.
pub fn virtuals_using_pool(virtuals: &[VirtualRecord], pool: &str) -> BTreeSet<String> {
    virtuals
        .iter()
        .filter(|v| v.ports.iter().any(|p| p.pool.as_deref() == Some(pool)))
        .map(|v| v.name.clone())
        .collect()
}

// =============================================================================
// Balancers
// =============================================================================

/// Balancers available at one location, at most one per family.
#[derive(Clone, Default)]
pub struct Balancers {
    location: String,
    by_family: BTreeMap<Family, Arc<dyn LoadBalancer>>,
}

impl Balancers {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            by_family: BTreeMap::new(),
        }
    }

    pub fn with(mut self, balancer: Arc<dyn LoadBalancer>) -> Self {
        self.by_family.insert(balancer.family(), balancer);
        self
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn get(&self, family: Family) -> Result<Arc<dyn LoadBalancer>> {
        self.by_family
            .get(&family)
            .cloned()
            .ok_or_else(|| Error::NoBalancerMapping {
                location: self.location.clone(),
                family,
            })
    }

    /// Build HTTP adapters for every balancer configured at `location`.
    pub fn connect(config: &StaticConfig, settings: &Settings, location: &str) -> Result<Self> {
        let configured = config
            .balancers
            .get(location)
            .ok_or_else(|| Error::NoBalancers(location.to_string()))?;
        let timeout = Duration::from_secs(settings.request_timeout_secs);

        let mut balancers = Self::new(location);
        for (family, balancer) in configured {
            let family: Family = family.parse()?;
            let credentials = settings.credentials(location, family)?;
            info!(%family, address = %balancer.address, "connecting balancer");
            let adapter: Arc<dyn LoadBalancer> = match family {
                Family::A10 => Arc::new(A10Client::new(
                    &balancer.address,
                    credentials,
                    timeout,
                    settings.accept_invalid_certs,
                )?),
                Family::F5 => Arc::new(F5Client::new(
                    &balancer.address,
                    credentials,
                    balancer.partition.as_deref().unwrap_or("Common"),
                    timeout,
                    settings.accept_invalid_certs,
                )?),
            };
            balancers = balancers.with(adapter);
        }
        Ok(balancers)
    }
}

/// Shared reqwest client setup for both adapters.
pub(crate) fn http_client(timeout: Duration, accept_invalid_certs: bool) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()?)
}

/// Management address as a URL without trailing slash; bare hosts get https.
pub(crate) fn base_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("https://{}", address)
    }
}
