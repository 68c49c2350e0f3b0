//! `ServerA10` / `NodeF5`: one endpoint address.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::LoadBalancer;
use crate::conflict;
use crate::error::Result;
use crate::guard;
use crate::resource::{Cells, Reconcile};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerModel {
    pub name: String,
    pub ip: String,
}

pub struct Server {
    lb: Arc<dyn LoadBalancer>,
    name: String,
    ip: String,
    cells: Cells<ServerModel>,
}

impl Server {
    pub fn new(lb: Arc<dyn LoadBalancer>, name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            lb,
            name: name.into(),
            ip: ip.into(),
            cells: Cells::default(),
        }
    }

    /// Move the server to its planned address without losing pool
    /// membership: detach it, recreate it, then re-add the same members.
    async fn readdress(&mut self) -> Result<bool> {
        let lb = self.lb.clone();
        let mut detached = Vec::new();
        for pool in lb.server_references(&self.name).await? {
            let members = lb.remove_server_members(&pool, &self.name).await?;
            info!(server = %self.name, pool = %pool, members = members.len(), "detached server");
            detached.push((pool, members));
        }

        let recreated = guard::delete_server(lb.as_ref(), &self.name).await? && self.create().await?;
        if !recreated {
            warn!(server = %self.name, ip = %self.ip, "could not recreate server, members stay detached");
            return Ok(false);
        }

        for (pool, members) in detached {
            lb.add_pool_members(&pool, &members).await?;
            info!(server = %self.name, pool = %pool, "reattached server");
        }
        Ok(true)
    }
}

#[async_trait]
impl Reconcile for Server {
    type Model = ServerModel;

    fn kind(&self) -> &'static str {
        self.lb.family().server_kind()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn cells(&mut self) -> &mut Cells<ServerModel> {
        &mut self.cells
    }

    async fn observe(&mut self) -> Result<Option<ServerModel>> {
        Ok(self.lb.get_server(&self.name).await?.map(|server| ServerModel {
            name: server.name,
            ip: server.address,
        }))
    }

    async fn desire(&mut self) -> Result<ServerModel> {
        Ok(ServerModel {
            name: self.name.clone(),
            ip: self.ip.clone(),
        })
    }

    fn validate_plan(&self, plan: &ServerModel) -> bool {
        !plan.name.is_empty() && !plan.ip.is_empty()
    }

    async fn create(&mut self) -> Result<bool> {
        let created = conflict::create_server(self.lb.as_ref(), &self.name, &self.ip).await?;
        self.forget_state();
        Ok(created)
    }

    async fn delete(&mut self) -> Result<bool> {
        let deleted = guard::delete_server(self.lb.as_ref(), &self.name).await?;
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

        match self.state().await? {
            None => self.create().await,
            Some(current) if current.ip != self.ip => {
                info!(server = %self.name, from = %current.ip, to = %self.ip, "server address changed");
                self.readdress().await
            }
            Some(_) => {
                warn!(kind = self.kind(), name = %self.name, changes = %diff, "drift not corrected");
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Family, PoolMember};
    use crate::resource::Node;
    use crate::test_util::MemoryBalancer;

    #[tokio::test]
    async fn test_readdress_keeps_pool_membership() {
        let lb = Arc::new(MemoryBalancer::new(Family::A10));
        lb.seed_server("pwr01", "10.61.0.99");
        lb.seed_pool("pwr_80", "tcp", &[PoolMember::new("pwr01", 80)]);

        let mut server = Server::new(lb.clone(), "pwr01", "10.61.0.11");
        let outcome = server.global_patch().await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(lb.server("pwr01").unwrap().address, "10.61.0.11");
        assert_eq!(lb.pool("pwr_80").unwrap().members, vec![PoolMember::new("pwr01", 80)]);
    }

    #[tokio::test]
    async fn test_converged_server_is_left_alone() {
        let lb = Arc::new(MemoryBalancer::new(Family::F5));
        lb.seed_server("gpr01", "10.61.1.11");

        let mut server = Server::new(lb.clone(), "gpr01", "10.61.1.11");
        assert!(server.patch().await.unwrap());
        assert!(lb.mutations().is_empty());
    }
}
