//! `Entrypoint`: the DNS name and inventory interface behind a VIP.
//!
//! An owned entrypoint reserves one IP for its interface on every endpoint
//! host, publishes it as an A record and then drives the balancer tree. A
//! shared entrypoint only publishes a CNAME to the sharing environment.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::{entrypoint_name, Endpoints, Scope, VirtualServerA10, VirtualServerF5, PRIMARY_INTERFACE};
use crate::backend::Family;
use crate::config::EntrypointConfig;
use crate::error::Result;
use crate::resource::{Cells, Node, Reconcile, Siblings};
use crate::retry::retry_transient;
use crate::services::{DnsRecords, Environment, Interface, RecordType, Reservation};
use crate::snapshot;

/// Planned A record while the inventory holds no IP for the interface.
pub const UNRESERVED_IP: &str = "Need to reserve IP";

/// Planned node list of a shared entrypoint.
pub const SHARED_NODES: &str = "Shared nodes";

/// Placeholder in variable templates.
const DNS_PREFIX_PLACEHOLDER: &str = "{ENV.DNS_PREFIX}";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsModel {
    pub fqdn: String,
    pub ips: DnsRecords,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrypointModel {
    pub name: String,
    pub dns: DnsModel,
    pub nodes: Vec<String>,
}

pub struct Entrypoint {
    scope: Arc<Scope>,
    interface: String,
    name: String,
    fqdn: String,
    config: EntrypointConfig,
    endpoints: Endpoints,
    shared_suffix: Option<String>,
    /// IP handed out by the inventory during this run. Published records
    /// may not resolve yet.
    reserved_ip: Option<String>,
    cells: Cells<EntrypointModel>,
}

impl Entrypoint {
    pub fn new(scope: Arc<Scope>, interface: &str, endpoints: Endpoints) -> Result<Self> {
        let config = scope.config.entrypoint(interface)?.clone();
        let name = entrypoint_name(interface, &scope.env.suffix);
        let fqdn = format!("{}.{}", name, scope.env.domain);
        let shared_suffix = scope
            .config
            .shared_suffix(interface, endpoints.keys().map(String::as_str))
            .map(str::to_string);

        Ok(Self {
            scope,
            interface: interface.to_string(),
            name,
            fqdn,
            config,
            endpoints,
            shared_suffix,
            reserved_ip: None,
            cells: Cells::default(),
        })
    }

    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    pub fn family(&self) -> Family {
        self.config.balancer
    }

    pub fn is_shared(&self) -> bool {
        self.shared_suffix.is_some()
    }

    /// Hostname of the sharing environment's entrypoint.
    fn shared_target(&self) -> Option<String> {
        self.shared_suffix
            .as_ref()
            .map(|suffix| format!("{}.{}", entrypoint_name(&self.interface, suffix), self.scope.env.domain))
    }

    /// IP the inventory already holds for the interface.
    async fn planned_ip(&mut self) -> Result<Option<String>> {
        let plan = self.plan().await?;
        Ok(plan.dns.ips.a.iter().find(|ip| *ip != UNRESERVED_IP).cloned())
    }

    /// The entrypoint's IP: the one reserved by this run, else the planned
    /// one, else the published one.
    pub async fn ip(&mut self) -> Result<Option<String>> {
        if let Some(ip) = &self.reserved_ip {
            return Ok(Some(ip.clone()));
        }
        if let Some(ip) = self.planned_ip().await? {
            return Ok(Some(ip));
        }
        Ok(self.state().await?.and_then(|state| state.dns.ips.a.first().cloned()))
    }

    fn planned_ips(&self) -> Vec<String> {
        let ips: BTreeSet<&String> = self
            .endpoints
            .values()
            .flat_map(|endpoint| endpoint.interfaces.iter())
            .filter(|(name, _)| *name == self.interface)
            .map(|(_, ip)| ip)
            .collect();
        if ips.is_empty() {
            vec![UNRESERVED_IP.to_string()]
        } else {
            ips.into_iter().cloned().collect()
        }
    }

    async fn create_shared(&mut self, target: String) -> Result<bool> {
        let published = self
            .scope
            .services
            .dns
            .add_record(RecordType::Cname, &self.fqdn, &target, true)
            .await?;
        info!(entrypoint = %self.name, target = %target, published, "published shared entrypoint");
        self.forget_state();
        Ok(published)
    }

    async fn create_owned(&mut self) -> Result<bool> {
        let previous_ip = self.planned_ip().await?;
        let scope = self.scope.clone();
        let balancer = scope.config.balancer(&scope.env.location, self.family())?;
        let reservation = Reservation {
            network: balancer.network.clone(),
            prefix: balancer.prefix,
            interface: self.interface.clone(),
            hosts: self.endpoints.keys().cloned().collect(),
            previous_ip,
        };

        let ip = self.scope.services.inventory.reserve_ip(&reservation).await?;
        if ip.is_empty() {
            warn!(entrypoint = %self.name, network = %reservation.network, "no ip reserved");
            self.forget_state();
            return Ok(false);
        }

        let published = scope.services.dns.add_record(RecordType::A, &self.fqdn, &ip, true).await?;
        info!(entrypoint = %self.name, ip = %ip, published, "published entrypoint");
        self.reserved_ip = Some(ip);

        self.sync_variables().await?;
        self.forget_state();
        Ok(published)
    }

    /// Make sure configured variables point at this entrypoint.
    async fn sync_variables(&self) -> Result<()> {
        if self.config.variables.is_empty() {
            return Ok(());
        }
        let prefix = format!("-{}.{}", self.scope.env.suffix, self.scope.env.domain);
        let bindings: Vec<(String, String)> = self
            .config
            .variables
            .iter()
            .map(|(name, template)| (name.clone(), template.replace(DNS_PREFIX_PLACEHOLDER, &prefix)))
            .collect();
        let environment = self.scope.services.environment.as_ref();

        retry_transient(&self.scope.retry, "sync entrypoint variables", || {
            check_bindings(environment, &self.name, &bindings)
        })
        .await
    }

    /// Remove interfaces that hold planned IPs nobody published. Only logs
    /// the removals unless `apply` is set. Returns the affected interfaces.
    pub async fn clean(&mut self, apply: bool) -> Result<Vec<Interface>> {
        let plan = self.plan().await?;
        if self.validate_plan(&plan) {
            info!(entrypoint = %self.name, "plan is valid, nothing to clean");
            return Ok(Vec::new());
        }

        let state = self.state().await?;
        snapshot::save(&self.scope.data_dir, "Entrypoint", &self.name, &state, &plan).await?;

        let published: BTreeSet<&String> = state.iter().flat_map(|s| s.dns.ips.a.iter()).collect();
        let wrong_ips: BTreeSet<&String> = plan.dns.ips.a.iter().filter(|ip| !published.contains(ip)).collect();
        let nodes = state.as_ref().map(|s| s.nodes.clone()).unwrap_or_default();

        let inventory = self.scope.services.inventory.clone();
        let mut affected = Vec::new();
        for node in nodes {
            for interface in inventory.interfaces_by_host(&node).await? {
                if interface.name != self.interface || !wrong_ips.contains(&interface.ip) {
                    continue;
                }
                if apply {
                    inventory.delete_interface(&node, &interface.ip).await?;
                    info!(entrypoint = %self.name, host = %node, ip = %interface.ip, "removed unpublished interface");
                } else {
                    info!(entrypoint = %self.name, host = %node, ip = %interface.ip, "would remove unpublished interface");
                }
                affected.push(interface);
            }
        }
        self.forget_state();
        Ok(affected)
    }
}

async fn check_bindings(environment: &dyn Environment, entrypoint: &str, bindings: &[(String, String)]) -> Result<()> {
    for (variable, expected) in bindings {
        if environment.variable_matches(variable, expected).await? {
            continue;
        }
        environment.set_variable(variable, "").await?;
        warn!(
            entrypoint,
            variable = %variable,
            expected = %expected,
            "variable did not match the entrypoint, override reset; redeploy services reading it"
        );
    }
    Ok(())
}

#[async_trait]
impl Reconcile for Entrypoint {
    type Model = EntrypointModel;

    fn kind(&self) -> &'static str {
        "Entrypoint"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn cells(&mut self) -> &mut Cells<EntrypointModel> {
        &mut self.cells
    }

    async fn observe(&mut self) -> Result<Option<EntrypointModel>> {
        let records = self.scope.services.resolver.lookup(&self.fqdn).await?;

        let nodes = if self.is_shared() {
            vec![SHARED_NODES.to_string()]
        } else {
            let inventory = self.scope.services.inventory.clone();
            let mut nodes = BTreeSet::new();
            for ip in &records.a {
                for interface in inventory.interfaces_by_ip(ip).await? {
                    if interface.name != PRIMARY_INTERFACE {
                        nodes.insert(interface.host_name);
                    }
                }
            }
            for host in self.endpoints.keys() {
                for interface in inventory.interfaces_by_host(host).await? {
                    if interface.name == self.interface {
                        nodes.insert(interface.host_name);
                    }
                }
            }
            nodes.into_iter().collect::<Vec<_>>()
        };

        if records.is_empty() && (self.is_shared() || nodes.is_empty()) {
            return Ok(None);
        }
        Ok(Some(EntrypointModel {
            name: self.name.clone(),
            dns: DnsModel {
                fqdn: self.fqdn.clone(),
                ips: records,
            },
            nodes,
        }))
    }

    async fn desire(&mut self) -> Result<EntrypointModel> {
        let (ips, nodes) = match self.shared_target() {
            Some(target) => (
                DnsRecords {
                    a: Vec::new(),
                    cname: vec![target],
                },
                vec![SHARED_NODES.to_string()],
            ),
            None => (
                DnsRecords {
                    a: self.planned_ips(),
                    cname: Vec::new(),
                },
                self.endpoints.keys().cloned().collect(),
            ),
        };
        Ok(EntrypointModel {
            name: self.name.clone(),
            dns: DnsModel {
                fqdn: self.fqdn.clone(),
                ips,
            },
            nodes,
        })
    }

    fn validate_plan(&self, plan: &EntrypointModel) -> bool {
        let ips = &plan.dns.ips;
        if ips.a.len() > 1 {
            warn!(entrypoint = %self.name, planned = ?ips.a, "more than one planned A record");
            return false;
        }
        if !ips.a.is_empty() && !ips.cname.is_empty() {
            warn!(entrypoint = %self.name, "planned CNAME next to an A record");
            return false;
        }
        true
    }

    fn validate_state(&self, state: Option<&EntrypointModel>) -> bool {
        let Some(state) = state else {
            return true;
        };
        let ips = &state.dns.ips;
        if ips.a.len() > 1 {
            warn!(entrypoint = %self.name, published = ?ips.a, "more than one published A record");
            return false;
        }
        if !ips.cname.is_empty() && !self.is_shared() {
            warn!(entrypoint = %self.name, cname = ?ips.cname, "published CNAME on an owned entrypoint");
            return false;
        }
        true
    }

    async fn create(&mut self) -> Result<bool> {
        match self.shared_target() {
            Some(target) => self.create_shared(target).await,
            None => self.create_owned().await,
        }
    }

    async fn delete(&mut self) -> Result<bool> {
        let Some(state) = self.state().await? else {
            return Ok(true);
        };
        let dns = self.scope.services.dns.clone();

        if self.is_shared() {
            for target in &state.dns.ips.cname {
                dns.delete_record(RecordType::Cname, &self.fqdn, target).await?;
            }
            info!(entrypoint = %self.name, "removed shared entrypoint");
            self.forget_state();
            return Ok(true);
        }

        for ip in &state.dns.ips.a {
            dns.delete_record(RecordType::A, &self.fqdn, ip).await?;
        }
        let inventory = self.scope.services.inventory.clone();
        for node in &state.nodes {
            let interfaces = inventory.interfaces_by_host(node).await?;
            if let Some(interface) = interfaces.iter().find(|i| i.name == self.interface) {
                inventory.delete_interface(node, &interface.ip).await?;
                dns.delete_record(RecordType::A, &self.fqdn, &interface.ip).await?;
            }
        }
        info!(entrypoint = %self.name, "removed entrypoint");
        self.reserved_ip = None;
        self.forget_state();
        Ok(true)
    }

    async fn patch(&mut self) -> Result<bool> {
        if !self.is_good().await? {
            return Ok(false);
        }
        let diff = self.diff().await?;
        if diff.is_empty() {
            info!(entrypoint = %self.name, "no diff");
            return Ok(true);
        }

        let plan = self.plan().await?;
        if let Some(state) = self.state().await? {
            if plan.dns.ips.a == [UNRESERVED_IP] && !state.dns.ips.a.is_empty() {
                warn!(
                    entrypoint = %self.name,
                    published = ?state.dns.ips.a,
                    "interface has no ip in the inventory, reserving again"
                );
                return self.create().await;
            }
            info!(entrypoint = %self.name, changes = %diff, "replacing");
            if !self.delete().await? {
                return Ok(false);
            }
        }
        self.create().await
    }

    async fn build_siblings(&mut self) -> Result<Siblings> {
        if self.is_shared() || !self.is_good().await? {
            return Ok(Vec::new());
        }
        let Some(ip) = self.ip().await? else {
            return Ok(Vec::new());
        };

        let family = self.family();
        let lb = self.scope.balancers.get(family)?;
        let monitor = self.scope.config.healthcheck(family, &self.config.service);
        let domain = self.scope.env.domain.clone();

        let siblings: Siblings = match family {
            Family::A10 => {
                let vs = VirtualServerA10::new(
                    lb,
                    self.name.clone(),
                    ip,
                    self.config.ports.clone(),
                    monitor,
                    domain,
                    self.endpoints.clone(),
                );
                vec![(self.name.clone(), Box::new(vs) as Box<dyn Node>)]
            }
            Family::F5 => {
                let partition = self
                    .scope
                    .config
                    .balancer(&self.scope.env.location, family)?
                    .partition
                    .clone()
                    .unwrap_or_else(|| "Common".to_string());
                self.config
                    .ports
                    .iter()
                    .map(|port| {
                        let vs = VirtualServerF5::new(
                            lb.clone(),
                            &self.name,
                            ip.clone(),
                            port.clone(),
                            partition.clone(),
                            monitor.clone(),
                            domain.clone(),
                            self.endpoints.clone(),
                        );
                        (Reconcile::name(&vs).to_string(), Box::new(vs) as Box<dyn Node>)
                    })
                    .collect()
            }
        };
        Ok(siblings)
    }
}
