//! `VirtualPortA10`: one listener of an A10 virtual server.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::{client_ssl_profile, Endpoints, Pool};
use crate::backend::{LoadBalancer, PortSpec};
use crate::config::{pool_name, PortConfig};
use crate::error::{BackendError, ConflictKind, Result};
use crate::guard::refused;
use crate::resource::{Cells, Node, Reconcile, SiblingOrder, Siblings};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VirtualPortModel {
    #[serde(rename = "port-number")]
    pub port: u16,
    pub protocol: String,
    #[serde(rename = "service-group")]
    pub service_group: String,
    #[serde(rename = "client-ssl")]
    pub client_ssl: Option<String>,
    #[serde(rename = "template-http")]
    pub template_http: Option<String>,
}

pub struct VirtualPortA10 {
    lb: Arc<dyn LoadBalancer>,
    virtual_name: String,
    key: String,
    port: PortConfig,
    monitor: String,
    domain: String,
    endpoints: Endpoints,
    cells: Cells<VirtualPortModel>,
}

impl VirtualPortA10 {
    pub fn new(
        lb: Arc<dyn LoadBalancer>,
        virtual_name: impl Into<String>,
        port: PortConfig,
        monitor: impl Into<String>,
        domain: impl Into<String>,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            lb,
            virtual_name: virtual_name.into(),
            key: format!("{}_{}", port.port, port.protocol),
            port,
            monitor: monitor.into(),
            domain: domain.into(),
            endpoints,
            cells: Cells::default(),
        }
    }

    /// Sibling key within the virtual server: `{port}_{protocol}`.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn service_group(&self) -> String {
        self.endpoints
            .keys()
            .next()
            .map(|host| pool_name(host, self.port.target_port))
            .unwrap_or_default()
    }

    fn spec(&self) -> PortSpec {
        let plan = self.planned();
        PortSpec {
            port: plan.port,
            protocol: plan.protocol,
            pool: plan.service_group,
            http_template: plan.template_http,
            client_ssl: plan.client_ssl,
        }
    }

    fn planned(&self) -> VirtualPortModel {
        let client_ssl = (self.port.protocol == "https").then(|| client_ssl_profile(&self.domain));
        VirtualPortModel {
            port: self.port.port,
            protocol: self.port.protocol.clone(),
            service_group: self.service_group(),
            client_ssl,
            template_http: self.port.template_http.clone(),
        }
    }
}

#[async_trait]
impl Reconcile for VirtualPortA10 {
    type Model = VirtualPortModel;

    fn kind(&self) -> &'static str {
        "VirtualPortA10"
    }

    fn name(&self) -> &str {
        &self.key
    }

    fn order(&self) -> SiblingOrder {
        SiblingOrder::ChildrenFirst
    }

    fn cells(&mut self) -> &mut Cells<VirtualPortModel> {
        &mut self.cells
    }

    async fn observe(&mut self) -> Result<Option<VirtualPortModel>> {
        let port = self
            .lb
            .get_virtual_port(&self.virtual_name, self.port.port, &self.port.protocol)
            .await?;
        Ok(port.map(|port| VirtualPortModel {
            port: port.port,
            protocol: port.protocol,
            service_group: port.pool.unwrap_or_default(),
            client_ssl: port.client_ssl,
            template_http: port.http_template,
        }))
    }

    async fn desire(&mut self) -> Result<VirtualPortModel> {
        Ok(self.planned())
    }

    fn validate_plan(&self, plan: &VirtualPortModel) -> bool {
        !plan.service_group.is_empty()
    }

    async fn create(&mut self) -> Result<bool> {
        let spec = self.spec();
        let result = self.lb.create_virtual_port(&self.virtual_name, &spec).await;
        self.forget_state();
        match result {
            Ok(()) => {
                info!(virtual_server = %self.virtual_name, port = %self.key, pool = %spec.pool, "created virtual port");
                Ok(true)
            }
            Err(BackendError::Conflict {
                kind: ConflictKind::NameExists,
                ..
            }) => self.accept_existing().await,
            Err(e) if e.is_rejection() => {
                warn!(virtual_server = %self.virtual_name, port = %self.key, error = %e, "virtual port create refused");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&mut self) -> Result<bool> {
        let result = self
            .lb
            .delete_virtual_port(&self.virtual_name, self.port.port, &self.port.protocol)
            .await;
        self.forget_state();
        let deleted = refused(result, "virtual port", &self.key)?;
        if deleted {
            info!(virtual_server = %self.virtual_name, port = %self.key, "deleted virtual port");
        }
        Ok(deleted)
    }

    async fn build_siblings(&mut self) -> Result<Siblings> {
        let name = self.service_group();
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
