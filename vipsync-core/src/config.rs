//! Static topology and runtime settings.
//!
//! Both are JSON documents. The static config describes entrypoints,
//! balancers per location, health checks and the entrypoint sharing table;
//! settings carry collaborator URLs, credentials and tuning knobs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::Family;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Fallback monitor when no health check is configured.
pub const DEFAULT_HEALTHCHECK: &str = "tcp";

// =============================================================================
// Static configuration
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticConfig {
    /// family → service (or `default`) → monitor name
    #[serde(default)]
    pub healthchecks: BTreeMap<String, BTreeMap<String, String>>,
    /// location → family → balancer
    #[serde(default)]
    pub balancers: BTreeMap<String, BTreeMap<String, BalancerConfig>>,
    /// entrypoint → environments it may be shared from, in match order
    #[serde(default)]
    pub shared_entrypoints: BTreeMap<String, Vec<SharedEnvironment>>,
    #[serde(default)]
    pub entrypoints: BTreeMap<String, EntrypointConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedEnvironment {
    pub suffix: String,
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrypointConfig {
    #[serde(rename = "LB", alias = "lb")]
    pub balancer: Family,
    #[serde(default)]
    pub mandatory: bool,
    pub service: String,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
    /// Environment variables that must carry this entrypoint's hostname,
    /// mapped to a template such as `api{ENV.DNS_PREFIX}`.
    #[serde(default, alias = "adsvars")]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub port: u16,
    pub target_port: u16,
    pub protocol: String,
    #[serde(default)]
    pub template_http: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    pub address: String,
    /// Network VIP addresses are reserved from.
    pub network: String,
    pub prefix: u8,
    #[serde(default)]
    pub partition: Option<String>,
}

impl StaticConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, entrypoint) in &self.entrypoints {
            if entrypoint.service.is_empty() {
                return Err(Error::Config(format!("entrypoint {} has no service", name)));
            }
            if entrypoint.ports.is_empty() {
                return Err(Error::Config(format!("entrypoint {} has no ports", name)));
            }
        }
        for (location, balancers) in &self.balancers {
            for family in balancers.keys() {
                family
                    .parse::<Family>()
                    .map_err(|e| Error::Config(format!("balancers.{}: {}", location, e)))?;
            }
        }
        for family in self.healthchecks.keys() {
            family.parse::<Family>()?;
        }
        Ok(())
    }

    pub fn entrypoint(&self, name: &str) -> Result<&EntrypointConfig> {
        self.entrypoints
            .get(name)
            .ok_or_else(|| Error::UnknownEntrypoint(name.to_string()))
    }

    pub fn service_of(&self, entrypoint: &str) -> Result<&str> {
        self.entrypoints
            .get(entrypoint)
            .map(|e| e.service.as_str())
            .ok_or_else(|| Error::NoOwningService(entrypoint.to_string()))
    }

    /// Entrypoints owned by `service`, sorted by name.
    pub fn entrypoints_of_service(&self, service: &str) -> Vec<String> {
        self.entrypoints
            .iter()
            .filter(|(_, e)| e.service == service)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn services(&self) -> BTreeSet<String> {
        self.entrypoints.values().map(|e| e.service.clone()).collect()
    }

    /// Resolve a CLI selection: explicit names (unknown ones dropped), else
    /// every entrypoint of the given services, else the mandatory ones when
    /// `mandatory` is set.
    pub fn select_entrypoints(&self, entrypoints: &[String], services: &[String], mandatory: bool) -> Vec<String> {
        if !entrypoints.is_empty() {
            return entrypoints
                .iter()
                .filter(|name| {
                    let known = self.entrypoints.contains_key(name.as_str());
                    if !known {
                        warn!(entrypoint = %name, "unknown entrypoint, skipping");
                    }
                    known
                })
                .cloned()
                .collect();
        }
        if !services.is_empty() {
            return services
                .iter()
                .flat_map(|service| self.entrypoints_of_service(service))
                .collect();
        }
        if mandatory {
            return self
                .entrypoints
                .iter()
                .filter(|(_, e)| e.mandatory)
                .map(|(name, _)| name.clone())
                .collect();
        }
        Vec::new()
    }

    pub fn have_balancers(&self, location: &str) -> bool {
        self.balancers.get(location).is_some_and(|b| !b.is_empty())
    }

    pub fn balancer(&self, location: &str, family: Family) -> Result<&BalancerConfig> {
        let balancers = self
            .balancers
            .get(location)
            .ok_or_else(|| Error::NoBalancers(location.to_string()))?;
        balancers
            .iter()
            .find(|(name, _)| name.parse::<Family>().ok() == Some(family))
            .map(|(_, balancer)| balancer)
            .ok_or_else(|| Error::NoBalancerMapping {
                location: location.to_string(),
                family,
            })
    }

    /// Monitor for `service`: the service entry, then `default`, then tcp.
    pub fn healthcheck(&self, family: Family, service: &str) -> String {
        self.healthchecks
            .iter()
            .find(|(name, _)| name.parse::<Family>().ok() == Some(family))
            .and_then(|(_, checks)| checks.get(service).or_else(|| checks.get("default")))
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTHCHECK.to_string())
    }

    /// Suffix of the first environment sharing `entrypoint` with any of
    /// `hosts`.
    pub fn shared_suffix<'a, I>(&self, entrypoint: &str, hosts: I) -> Option<&str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let hosts: BTreeSet<&str> = hosts.into_iter().collect();
        self.shared_entrypoints
            .get(entrypoint)?
            .iter()
            .find(|shared| shared.hosts.iter().any(|h| hosts.contains(h.as_str())))
            .map(|shared| shared.suffix.as_str())
    }
}

/// Pool name for a service: the first endpoint host without its two-digit
/// index, then the target port (`lem01-t01-pwr01` → `lem01-t01-pwr_80`).
pub fn pool_name(first_host: &str, target_port: u16) -> String {
    let stem = first_host
        .len()
        .checked_sub(2)
        .and_then(|end| first_host.get(..end))
        .unwrap_or(first_host);
    format!("{}_{}", stem, target_port)
}

// =============================================================================
// Settings
// =============================================================================

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub dns: ServiceEndpoint,
    pub resolver: ServiceEndpoint,
    pub inventory: ServiceEndpoint,
    pub environment: ServiceEndpoint,
    /// location → family → credentials
    #[serde(default)]
    pub balancers: BTreeMap<String, BTreeMap<String, Credentials>>,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default)]
    pub check_entrypoint_group: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_retry_count() -> u32 {
    2
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_request_timeout() -> u64 {
    30
}

impl Settings {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn credentials(&self, location: &str, family: Family) -> Result<&Credentials> {
        self.balancers
            .get(location)
            .and_then(|families| {
                families
                    .iter()
                    .find(|(name, _)| name.parse::<Family>().ok() == Some(family))
            })
            .map(|(_, credentials)| credentials)
            .ok_or_else(|| Error::Config(format!("no {} credentials for location {}", family, location)))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_attempts(self.retry_count)
    }
}
