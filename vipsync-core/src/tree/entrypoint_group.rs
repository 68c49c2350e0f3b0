//! `EntrypointGroup`: every entrypoint of one service and the hosts behind
//! them.
//!
//! The group is never created or deleted itself. It resolves the service's
//! endpoints once, checks that the inventory carries no interfaces it does
//! not know about, and hands the endpoints to each `Entrypoint`.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use super::{Endpoint, Endpoints, Entrypoint, Scope, PRIMARY_INTERFACE};
use crate::error::Result;
use crate::resource::{Cells, Memo, Node, Reconcile, Siblings};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupModel {
    pub service: String,
    /// `host:interface`, sorted.
    pub interfaces: Vec<String>,
}

pub struct EntrypointGroup {
    scope: Arc<Scope>,
    service: String,
    entrypoints: Vec<String>,
    endpoints: Memo<Endpoints>,
    cells: Cells<GroupModel>,
}

impl EntrypointGroup {
    pub fn new(scope: Arc<Scope>, service: impl Into<String>) -> Self {
        let service = service.into();
        let entrypoints = scope.config.entrypoints_of_service(&service);
        Self {
            scope,
            service,
            entrypoints,
            endpoints: Memo::Empty,
            cells: Cells::default(),
        }
    }

    pub fn entrypoints(&self) -> &[String] {
        &self.entrypoints
    }

    /// Hosts of the service with their address and inventory interfaces.
    /// Hosts that do not resolve are skipped.
    pub async fn endpoints(&mut self) -> Result<Endpoints> {
        if let Some(endpoints) = self.endpoints.get() {
            return Ok(endpoints.clone());
        }

        let services = self.scope.services.clone();
        let mut endpoints = Endpoints::new();
        for host in services.environment.hosts_by_service(&self.service).await? {
            let records = services.resolver.lookup(&host).await?;
            let Some(ip) = records.a.first().cloned() else {
                warn!(service = %self.service, host = %host, "host does not resolve, skipping");
                continue;
            };
            let short = host.split('.').next().unwrap_or(&host).to_string();
            let mut interfaces: Vec<(String, String)> = services
                .inventory
                .interfaces_by_host(&short)
                .await?
                .into_iter()
                .map(|i| (i.name, i.ip))
                .collect();
            interfaces.sort();
            debug!(service = %self.service, host = %short, ip = %ip, interfaces = interfaces.len(), "endpoint");
            endpoints.insert(short, Endpoint { ip, interfaces });
        }

        self.endpoints.set(endpoints.clone());
        Ok(endpoints)
    }

    fn planned_interfaces(&self) -> Vec<String> {
        let Some(endpoints) = self.endpoints.get() else {
            return Vec::new();
        };
        let mut interfaces: Vec<String> = endpoints
            .keys()
            .flat_map(|host| self.entrypoints.iter().map(move |ep| format!("{}:{}", host, ep)))
            .collect();
        interfaces.sort();
        interfaces
    }
}

#[async_trait]
impl Reconcile for EntrypointGroup {
    type Model = GroupModel;

    fn kind(&self) -> &'static str {
        "EntrypointGroup"
    }

    fn name(&self) -> &str {
        &self.service
    }

    fn cells(&mut self) -> &mut Cells<GroupModel> {
        &mut self.cells
    }

    async fn observe(&mut self) -> Result<Option<GroupModel>> {
        let endpoints = self.endpoints().await?;
        let mut interfaces: Vec<String> = endpoints
            .iter()
            .flat_map(|(host, endpoint)| {
                endpoint
                    .interfaces
                    .iter()
                    .filter(|(name, _)| name != PRIMARY_INTERFACE)
                    .map(move |(name, _)| format!("{}:{}", host, name))
            })
            .collect();
        interfaces.sort();
        interfaces.dedup();
        Ok(Some(GroupModel {
            service: self.service.clone(),
            interfaces,
        }))
    }

    async fn desire(&mut self) -> Result<GroupModel> {
        self.endpoints().await?;
        Ok(GroupModel {
            service: self.service.clone(),
            interfaces: self.planned_interfaces(),
        })
    }

    fn validate_plan(&self, plan: &GroupModel) -> bool {
        if plan.interfaces.is_empty() {
            warn!(service = %self.service, "no endpoints or no entrypoints for service");
            return false;
        }
        true
    }

    fn validate_state(&self, state: Option<&GroupModel>) -> bool {
        let Some(state) = state else {
            return true;
        };
        let planned: BTreeSet<String> = self.planned_interfaces().into_iter().collect();
        let unknown: Vec<&String> = state.interfaces.iter().filter(|i| !planned.contains(*i)).collect();
        if !unknown.is_empty() {
            warn!(service = %self.service, unknown = ?unknown, "inventory has interfaces without an entrypoint");
            return false;
        }
        true
    }

    async fn create(&mut self) -> Result<bool> {
        warn!(service = %self.service, "entrypoint groups are not created, patch the entrypoints instead");
        Ok(false)
    }

    async fn delete(&mut self) -> Result<bool> {
        warn!(service = %self.service, "entrypoint groups are not deleted, delete the entrypoints instead");
        Ok(false)
    }

    async fn build_siblings(&mut self) -> Result<Siblings> {
        if !self.is_good().await? {
            return Ok(Vec::new());
        }
        let endpoints = self.endpoints().await?;
        let mut siblings: Siblings = Vec::with_capacity(self.entrypoints.len());
        for interface in &self.entrypoints {
            let entrypoint = Entrypoint::new(self.scope.clone(), interface, endpoints.clone())?;
            siblings.push((Reconcile::name(&entrypoint).to_string(), Box::new(entrypoint) as Box<dyn Node>));
        }
        Ok(siblings)
    }
}
