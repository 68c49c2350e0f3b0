//! `ServiceGroupA10` / `PoolF5`: the endpoints behind a listener.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::{Endpoints, Server};
use crate::backend::{LoadBalancer, PoolMember};
use crate::error::{BackendError, ConflictKind, Result};
use crate::guard;
use crate::resource::{Cells, Node, Reconcile, SiblingOrder, Siblings};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolModel {
    pub name: String,
    pub monitor: String,
    /// `host:port`, sorted.
    pub members: Vec<String>,
}

pub struct Pool {
    lb: Arc<dyn LoadBalancer>,
    name: String,
    monitor: String,
    target_port: u16,
    endpoints: Endpoints,
    cells: Cells<PoolModel>,
}

impl Pool {
    pub fn new(
        lb: Arc<dyn LoadBalancer>,
        name: impl Into<String>,
        monitor: impl Into<String>,
        target_port: u16,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            lb,
            name: name.into(),
            monitor: monitor.into(),
            target_port,
            endpoints,
            cells: Cells::default(),
        }
    }

    fn planned_members(&self) -> Vec<PoolMember> {
        self.endpoints
            .keys()
            .map(|host| PoolMember::new(host.clone(), self.target_port))
            .collect()
    }

    /// Swap the member list in place; the pool itself stays referenced.
    async fn replace_members(&mut self) -> Result<bool> {
        let removed = self.lb.remove_all_pool_members(&self.name).await?;
        let added = self.lb.add_pool_members(&self.name, &self.planned_members()).await?;
        info!(pool = %self.name, removed = removed.len(), added = added.len(), "replaced pool members");
        self.forget_state();
        Ok(true)
    }
}

#[async_trait]
impl Reconcile for Pool {
    type Model = PoolModel;

    fn kind(&self) -> &'static str {
        self.lb.family().pool_kind()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self) -> SiblingOrder {
        SiblingOrder::ChildrenFirst
    }

    fn cells(&mut self) -> &mut Cells<PoolModel> {
        &mut self.cells
    }

    async fn observe(&mut self) -> Result<Option<PoolModel>> {
        Ok(self.lb.get_pool(&self.name).await?.map(|pool| {
            let mut members: Vec<String> = pool.members.iter().map(PoolMember::label).collect();
            members.sort();
            PoolModel {
                name: pool.name,
                monitor: pool.monitor,
                members,
            }
        }))
    }

    async fn desire(&mut self) -> Result<PoolModel> {
        Ok(PoolModel {
            name: self.name.clone(),
            monitor: self.monitor.clone(),
            members: self.planned_members().iter().map(PoolMember::label).collect(),
        })
    }

    fn validate_plan(&self, plan: &PoolModel) -> bool {
        !plan.members.is_empty()
    }

    async fn create(&mut self) -> Result<bool> {
        let result = self
            .lb
            .create_pool(&self.name, &self.monitor, &self.planned_members())
            .await;
        self.forget_state();
        match result {
            Ok(()) => {
                info!(kind = self.kind(), pool = %self.name, "created pool");
                Ok(true)
            }
            Err(BackendError::Conflict {
                kind: ConflictKind::NameExists,
                ..
            }) => self.accept_existing().await,
            Err(e) if e.is_rejection() => {
                warn!(kind = self.kind(), pool = %self.name, error = %e, "pool create refused");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&mut self) -> Result<bool> {
        let deleted = guard::delete_pool(self.lb.as_ref(), &self.name).await?;
        self.forget_state();
        Ok(deleted)
    }

    async fn patch(&mut self) -> Result<bool> {
        if !self.is_good().await? {
            return Ok(false);
        }
        let diff = self.diff().await?;
        if diff.is_empty() {
            info!(kind = self.kind(), name = %self.name, "no diff");
            return Ok(true);
        }

        if self.state().await?.is_none() {
            return self.create().await;
        }
        if diff.touches("members") {
            return self.replace_members().await;
        }
        warn!(kind = self.kind(), name = %self.name, changes = %diff, "drift not corrected");
        Ok(true)
    }

    async fn build_siblings(&mut self) -> Result<Siblings> {
        let plan = self.plan().await?;
        if !self.validate_plan(&plan) {
            return Ok(Vec::new());
        }
        Ok(self
            .endpoints
            .iter()
            .map(|(host, endpoint)| {
                let server = Server::new(self.lb.clone(), host.clone(), endpoint.ip.clone());
                (host.clone(), Box::new(server) as Box<dyn Node>)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Family;
    use crate::test_util::{endpoints, MemoryBalancer};

    fn pool(lb: &Arc<MemoryBalancer>, hosts: &[(&str, &str)]) -> Pool {
        Pool::new(lb.clone(), "pwr_80", "http_pwr", 80, endpoints(hosts))
    }

    #[tokio::test]
    async fn test_servers_are_created_before_the_pool() {
        let lb = Arc::new(MemoryBalancer::new(Family::A10));
        let mut pool = pool(&lb, &[("pwr01", "10.61.0.11"), ("pwr02", "10.61.0.12")]);

        let outcome = pool.global_patch().await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(
            lb.mutations(),
            vec![
                "create_server pwr01 10.61.0.11",
                "create_server pwr02 10.61.0.12",
                "create_pool pwr_80 pwr01:80,pwr02:80",
            ]
        );
    }

    #[tokio::test]
    async fn test_member_drift_is_fixed_in_place() {
        let lb = Arc::new(MemoryBalancer::new(Family::F5));
        lb.seed_server("pwr01", "10.61.0.11");
        lb.seed_server("pwr02", "10.61.0.12");
        lb.seed_pool("pwr_80", "http_pwr", &[PoolMember::new("pwr01", 80)]);

        let mut pool = pool(&lb, &[("pwr01", "10.61.0.11"), ("pwr02", "10.61.0.12")]);
        assert!(pool.patch().await.unwrap());
        assert!(!lb.mutations().iter().any(|m| m.starts_with("delete_pool")));
        assert_eq!(
            lb.pool("pwr_80").unwrap().members,
            vec![PoolMember::new("pwr01", 80), PoolMember::new("pwr02", 80)]
        );
    }

    #[tokio::test]
    async fn test_monitor_drift_is_only_reported() {
        let lb = Arc::new(MemoryBalancer::new(Family::A10));
        lb.seed_server("pwr01", "10.61.0.11");
        lb.seed_pool("pwr_80", "tcp", &[PoolMember::new("pwr01", 80)]);

        let mut pool = pool(&lb, &[("pwr01", "10.61.0.11")]);
        assert!(pool.patch().await.unwrap());
        assert!(lb.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_empty_pool_is_invalid() {
        let lb = Arc::new(MemoryBalancer::new(Family::A10));
        let mut pool = pool(&lb, &[]);

        let outcome = pool.global_patch().await.unwrap();
        assert!(!outcome.ok);
        assert!(outcome.siblings.is_empty());
        assert!(lb.mutations().is_empty());
    }
}
