//! Virtual servers: one multi-port VIP on A10, one VIP per port on F5.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::{client_ssl_profile, Endpoints, Pool, VirtualPortA10};
use crate::backend::{Listener, LoadBalancer, VirtualSpec};
use crate::config::{pool_name, PortConfig};
use crate::error::{BackendError, ConflictKind, Result};
use crate::guard::refused;
use crate::resource::{Cells, Node, Reconcile, SiblingOrder, Siblings};

/// Profiles the balancer attaches on its own.
const IMPLICIT_PROFILES: [&str; 2] = ["fastL4", "tcp"];

// =============================================================================
// A10
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VirtualServerA10Model {
    pub name: String,
    pub ip: String,
    pub ports: Vec<u16>,
}

pub struct VirtualServerA10 {
    lb: Arc<dyn LoadBalancer>,
    name: String,
    ip: String,
    ports: Vec<PortConfig>,
    monitor: String,
    domain: String,
    endpoints: Endpoints,
    cells: Cells<VirtualServerA10Model>,
}

impl VirtualServerA10 {
    pub fn new(
        lb: Arc<dyn LoadBalancer>,
        name: impl Into<String>,
        ip: impl Into<String>,
        ports: Vec<PortConfig>,
        monitor: impl Into<String>,
        domain: impl Into<String>,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            lb,
            name: name.into(),
            ip: ip.into(),
            ports,
            monitor: monitor.into(),
            domain: domain.into(),
            endpoints,
            cells: Cells::default(),
        }
    }
}

#[async_trait]
impl Reconcile for VirtualServerA10 {
    type Model = VirtualServerA10Model;

    fn kind(&self) -> &'static str {
        "VirtualServerA10"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn cells(&mut self) -> &mut Cells<VirtualServerA10Model> {
        &mut self.cells
    }

    async fn observe(&mut self) -> Result<Option<VirtualServerA10Model>> {
        Ok(self.lb.get_virtual(&self.name).await?.map(|vs| {
            let mut ports: Vec<u16> = vs.ports.iter().map(|p| p.port).collect();
            ports.sort_unstable();
            VirtualServerA10Model {
                name: vs.name,
                ip: vs.address,
                ports,
            }
        }))
    }

    async fn desire(&mut self) -> Result<VirtualServerA10Model> {
        let mut ports: Vec<u16> = self.ports.iter().map(|p| p.port).collect();
        ports.sort_unstable();
        Ok(VirtualServerA10Model {
            name: self.name.clone(),
            ip: self.ip.clone(),
            ports,
        })
    }

    fn validate_plan(&self, plan: &VirtualServerA10Model) -> bool {
        !plan.ip.is_empty() && !plan.ports.is_empty()
    }

    async fn create(&mut self) -> Result<bool> {
        let spec = VirtualSpec {
            name: self.name.clone(),
            address: self.ip.clone(),
            listener: None,
        };
        let result = self.lb.create_virtual(&spec).await;
        self.forget_state();
        match result {
            Ok(()) => {
                info!(virtual_server = %self.name, ip = %self.ip, "created virtual server");
                Ok(true)
            }
            Err(BackendError::Conflict {
                kind: ConflictKind::NameExists,
                ..
            }) => self.accept_existing().await,
            Err(e) if e.is_rejection() => {
                warn!(virtual_server = %self.name, ip = %self.ip, error = %e, "virtual server create refused");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&mut self) -> Result<bool> {
        let result = self.lb.delete_virtual(&self.name).await;
        self.forget_state();
        let deleted = refused(result, "virtual server", &self.name)?;
        if deleted {
            info!(virtual_server = %self.name, "deleted virtual server");
        }
        Ok(deleted)
    }

    async fn build_siblings(&mut self) -> Result<Siblings> {
        Ok(self
            .ports
            .iter()
            .map(|port| {
                let node = VirtualPortA10::new(
                    self.lb.clone(),
                    self.name.clone(),
                    port.clone(),
                    self.monitor.clone(),
                    self.domain.clone(),
                    self.endpoints.clone(),
                );
                (node.key().to_string(), Box::new(node) as Box<dyn Node>)
            })
            .collect())
    }
}

// =============================================================================
// F5
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VirtualServerF5Model {
    pub name: String,
    pub partition: String,
    pub destination: String,
    pub port: u16,
    pub pool: String,
    pub profiles: BTreeSet<String>,
}

pub struct VirtualServerF5 {
    lb: Arc<dyn LoadBalancer>,
    name: String,
    ip: String,
    port: PortConfig,
    partition: String,
    monitor: String,
    domain: String,
    endpoints: Endpoints,
    cells: Cells<VirtualServerF5Model>,
}

impl VirtualServerF5 {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lb: Arc<dyn LoadBalancer>,
        entrypoint_name: &str,
        ip: impl Into<String>,
        port: PortConfig,
        partition: impl Into<String>,
        monitor: impl Into<String>,
        domain: impl Into<String>,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            lb,
            name: format!("{}_{}", entrypoint_name, port.port),
            ip: ip.into(),
            port,
            partition: partition.into(),
            monitor: monitor.into(),
            domain: domain.into(),
            endpoints,
            cells: Cells::default(),
        }
    }

    fn pool_name(&self) -> String {
        self.endpoints
            .keys()
            .next()
            .map(|host| pool_name(host, self.port.target_port))
            .unwrap_or_default()
    }

    fn profiles(&self) -> BTreeSet<String> {
        let mut profiles = BTreeSet::new();
        if let Some(template) = &self.port.template_http {
            profiles.insert(template.clone());
        }
        if self.port.protocol == "https" {
            profiles.insert(client_ssl_profile(&self.domain));
        }
        profiles
    }
}

#[async_trait]
impl Reconcile for VirtualServerF5 {
    type Model = VirtualServerF5Model;

    fn kind(&self) -> &'static str {
        "VirtualServerF5"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self) -> SiblingOrder {
        SiblingOrder::ChildrenFirst
    }

    fn cells(&mut self) -> &mut Cells<VirtualServerF5Model> {
        &mut self.cells
    }

    async fn observe(&mut self) -> Result<Option<VirtualServerF5Model>> {
        let partition = self.partition.clone();
        Ok(self.lb.get_virtual(&self.name).await?.map(|vs| {
            let listener = vs.ports.first();
            VirtualServerF5Model {
                partition: vs.partition.unwrap_or(partition),
                destination: vs.address,
                port: listener.map(|p| p.port).unwrap_or_default(),
                pool: listener.and_then(|p| p.pool.clone()).unwrap_or_default(),
                profiles: vs
                    .profiles
                    .into_iter()
                    .filter(|p| !IMPLICIT_PROFILES.contains(&p.as_str()))
                    .collect(),
                name: vs.name,
            }
        }))
    }

    async fn desire(&mut self) -> Result<VirtualServerF5Model> {
        Ok(VirtualServerF5Model {
            name: self.name.clone(),
            partition: self.partition.clone(),
            destination: self.ip.clone(),
            port: self.port.port,
            pool: self.pool_name(),
            profiles: self.profiles(),
        })
    }

    fn validate_plan(&self, plan: &VirtualServerF5Model) -> bool {
        !plan.destination.is_empty() && !plan.pool.is_empty()
    }

    async fn create(&mut self) -> Result<bool> {
        let spec = VirtualSpec {
            name: self.name.clone(),
            address: self.ip.clone(),
            listener: Some(Listener {
                port: self.port.port,
                pool: self.pool_name(),
                profiles: self.profiles().into_iter().collect(),
            }),
        };
        let result = self.lb.create_virtual(&spec).await;
        self.forget_state();
        match result {
            Ok(()) => {
                info!(virtual_server = %self.name, ip = %self.ip, port = self.port.port, "created virtual server");
                Ok(true)
            }
            Err(BackendError::Conflict {
                kind: ConflictKind::NameExists,
                ..
            }) => self.accept_existing().await,
            Err(e) if e.is_rejection() => {
                warn!(virtual_server = %self.name, ip = %self.ip, error = %e, "virtual server create refused");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&mut self) -> Result<bool> {
        let result = self.lb.delete_virtual(&self.name).await;
        self.forget_state();
        let deleted = refused(result, "virtual server", &self.name)?;
        if deleted {
            info!(virtual_server = %self.name, "deleted virtual server");
        }
        Ok(deleted)
    }

    async fn build_siblings(&mut self) -> Result<Siblings> {
        let name = self.pool_name();
        if name.is_empty() {
            return Ok(Vec::new());
        }
        let pool = Pool::new(
            self.lb.clone(),
            name.clone(),
            self.monitor.clone(),
            self.port.target_port,
            self.endpoints.clone(),
        );
        Ok(vec![(name, Box::new(pool) as Box<dyn Node>)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Family;
    use crate::test_util::{endpoints, MemoryBalancer};

    fn https(port: u16, target_port: u16) -> PortConfig {
        PortConfig {
            port,
            target_port,
            protocol: "https".into(),
            template_http: Some("xff".into()),
        }
    }

    #[tokio::test]
    async fn test_a10_tree_creates_ports_after_virtual_server() {
        let lb = Arc::new(MemoryBalancer::new(Family::A10));
        let mut vs = VirtualServerA10::new(
            lb.clone(),
            "api-lablemams",
            "10.62.0.10",
            vec![https(443, 80)],
            "http_pwr",
            "example.net",
            endpoints(&[("lem01-t01-pwr01", "10.61.0.11")]),
        );

        let outcome = vs.global_patch().await.unwrap();
        assert!(outcome.is_success(), "{:?}", outcome.failures());
        assert_eq!(
            lb.mutations(),
            vec![
                "create_virtual api-lablemams 10.62.0.10",
                "create_server lem01-t01-pwr01 10.61.0.11",
                "create_pool lem01-t01-pwr_80 lem01-t01-pwr01:80",
                "create_port api-lablemams 443+https lem01-t01-pwr_80",
            ]
        );

        let port = lb.virtual_port("api-lablemams", 443, "https").unwrap();
        assert_eq!(port.client_ssl.as_deref(), Some("star.example.net"));
        assert_eq!(port.http_template.as_deref(), Some("xff"));
    }

    #[tokio::test]
    async fn test_f5_profiles_ignore_implicit_ones() {
        let lb = Arc::new(MemoryBalancer::new(Family::F5));
        let mut vs = VirtualServerF5::new(
            lb.clone(),
            "web-lablemams",
            "10.63.0.10",
            https(443, 80),
            "ams-up",
            "tcp",
            "example.net",
            endpoints(&[("lem01-t01-gpr01", "10.61.1.11")]),
        );

        assert!(vs.global_patch().await.unwrap().is_success());
        assert!(lb.virtual_server("web-lablemams_443").unwrap().profiles.contains(&"tcp".to_string()));

        let mut again = VirtualServerF5::new(
            lb.clone(),
            "web-lablemams",
            "10.63.0.10",
            https(443, 80),
            "ams-up",
            "tcp",
            "example.net",
            endpoints(&[("lem01-t01-gpr01", "10.61.1.11")]),
        );
        assert!(again.diff().await.unwrap().is_empty());
    }
}
