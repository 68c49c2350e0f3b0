//! Entry point of the engine: resolves entrypoints to their service, builds
//! the resource tree and applies it.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use tracing::{error, info};

use crate::backend::{Balancers, Family, LoadBalancer};
use crate::config::{Settings, StaticConfig};
use crate::error::{Error, Result};
use crate::report::{Action, Inspection, MemberSummary, Outcome, PoolSummary, PortSummary, VipSummary};
use crate::resource::{Node, Reconcile};
use crate::retry::RetryPolicy;
use crate::services::{EnvironmentInfo, Interface, Services};
use crate::tree::{entrypoint_name, Entrypoint, EntrypointGroup, Scope};

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Refuse to touch an entrypoint whose group does not validate.
    pub check_entrypoint_group: bool,
    pub retry: RetryPolicy,
    /// Where snapshots go.
    pub data_dir: PathBuf,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            check_entrypoint_group: false,
            retry: RetryPolicy::default(),
            data_dir: PathBuf::from("data"),
        }
    }
}

impl ManagerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            check_entrypoint_group: settings.check_entrypoint_group,
            retry: settings.retry_policy(),
            data_dir: settings.data_dir.clone(),
        }
    }
}

/// Outcome of one entrypoint within a run.
#[derive(Debug)]
pub struct EntrypointRun {
    pub entrypoint: String,
    pub result: std::result::Result<Outcome, String>,
}

impl EntrypointRun {
    /// Patches must converge everywhere; deletes are decided by the
    /// entrypoint itself, blocked shared children are only reported.
    pub fn is_success(&self, action: Action) -> bool {
        match (&self.result, action) {
            (Ok(outcome), Action::Patch) => outcome.is_success(),
            (Ok(outcome), Action::Delete) => outcome.ok,
            (Err(_), _) => false,
        }
    }
}

/// Per-entrypoint results of a create or delete run.
#[derive(Debug)]
pub struct RunSummary {
    pub action: Action,
    pub runs: Vec<EntrypointRun>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.runs.iter().all(|run| run.is_success(self.action))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.runs
            .iter()
            .filter(|run| !run.is_success(self.action))
            .map(|run| run.entrypoint.as_str())
            .collect()
    }
}

/// `{entrypoint: outcome}`, or `{entrypoint: {"error": message}}`.
impl Serialize for RunSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.runs.len()))?;
        for run in &self.runs {
            match &run.result {
                Ok(outcome) => map.serialize_entry(&run.entrypoint, outcome)?,
                Err(message) => map.serialize_entry(&run.entrypoint, &serde_json::json!({"error": message}))?,
            }
        }
        map.end()
    }
}

pub struct EntrypointManager {
    scope: Arc<Scope>,
    check_entrypoint_group: bool,
    groups: BTreeMap<String, EntrypointGroup>,
}

impl EntrypointManager {
    /// Fails before any mutation when the environment is unknown or its
    /// location has no balancers.
    pub async fn new(
        config: Arc<StaticConfig>,
        services: Services,
        balancers: Balancers,
        options: ManagerOptions,
    ) -> Result<Self> {
        let env = services.environment.info().await?;
        if !config.have_balancers(&env.location) {
            return Err(Error::NoBalancers(env.location));
        }
        info!(environment = %env.name, location = %env.location, domain = %env.domain, "managing environment");

        Ok(Self {
            scope: Arc::new(Scope {
                config,
                services,
                balancers,
                env,
                retry: options.retry,
                data_dir: options.data_dir,
            }),
            check_entrypoint_group: options.check_entrypoint_group,
            groups: BTreeMap::new(),
        })
    }

    pub fn environment(&self) -> &EnvironmentInfo {
        &self.scope.env
    }

    pub fn config(&self) -> &StaticConfig {
        &self.scope.config
    }

    fn group(&mut self, service: &str) -> &mut EntrypointGroup {
        match self.groups.entry(service.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(EntrypointGroup::new(self.scope.clone(), service)),
        }
    }

    /// Balancer for `entrypoint`, failing before any mutation when the
    /// location has none of its family.
    fn balancer_for(&self, entrypoint: &str) -> Result<Arc<dyn LoadBalancer>> {
        let family = self.scope.config.entrypoint(entrypoint)?.balancer;
        self.scope.balancers.get(family)
    }

    async fn build_entrypoint(&mut self, entrypoint: &str, action: Action) -> Result<Entrypoint> {
        let service = self.scope.config.service_of(entrypoint)?.to_string();
        self.balancer_for(entrypoint)?;
        let check = self.check_entrypoint_group;
        let group = self.group(&service);

        if check {
            let valid = match action {
                Action::Patch => group.is_good().await?,
                Action::Delete => {
                    let state = group.state().await?;
                    group.validate_state(state.as_ref())
                }
            };
            if !valid {
                return Err(Error::InvalidGroup {
                    service,
                    entrypoint: entrypoint.to_string(),
                });
            }
        }

        let endpoints = group.endpoints().await?;
        if action == Action::Patch && endpoints.is_empty() {
            return Err(Error::NoEndpoints(service));
        }
        Entrypoint::new(self.scope.clone(), entrypoint, endpoints)
    }

    pub async fn create_entrypoint(&mut self, entrypoint: &str) -> Result<Outcome> {
        let mut node = self.build_entrypoint(entrypoint, Action::Patch).await?;
        info!(entrypoint, fqdn = node.fqdn(), "creating entrypoint");
        node.global_patch().await
    }

    pub async fn delete_entrypoint(&mut self, entrypoint: &str) -> Result<Outcome> {
        let mut node = self.build_entrypoint(entrypoint, Action::Delete).await?;
        info!(entrypoint, fqdn = node.fqdn(), "deleting entrypoint");
        node.global_delete().await
    }

    pub async fn create_entrypoints(&mut self, entrypoints: &[String]) -> Result<RunSummary> {
        self.run(Action::Patch, entrypoints).await
    }

    pub async fn delete_entrypoints(&mut self, entrypoints: &[String]) -> Result<RunSummary> {
        self.run(Action::Delete, entrypoints).await
    }

    /// Process entrypoints one after another. A failing entrypoint is
    /// recorded and the run goes on; setup errors end the run.
    async fn run(&mut self, action: Action, entrypoints: &[String]) -> Result<RunSummary> {
        let mut runs = Vec::with_capacity(entrypoints.len());
        for entrypoint in entrypoints {
            let result = match action {
                Action::Patch => self.create_entrypoint(entrypoint).await,
                Action::Delete => self.delete_entrypoint(entrypoint).await,
            };
            let result = match result {
                Ok(outcome) => {
                    if !outcome.is_success() {
                        info!(entrypoint = %entrypoint, failures = ?outcome.failures(), "entrypoint did not fully converge");
                    }
                    Ok(outcome)
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(entrypoint = %entrypoint, error = %e, "entrypoint failed");
                    Err(e.to_string())
                }
            };
            runs.push(EntrypointRun {
                entrypoint: entrypoint.clone(),
                result,
            });
        }
        Ok(RunSummary { action, runs })
    }

    pub async fn global_plan(&mut self, service: &str) -> Result<Inspection> {
        self.group(service).global_plan().await
    }

    pub async fn global_state(&mut self, service: &str) -> Result<Inspection> {
        self.group(service).global_state().await
    }

    pub async fn global_diff(&mut self, service: &str) -> Result<Inspection> {
        self.group(service).global_diff().await
    }

    /// What the balancer currently serves for `entrypoint`.
    pub async fn describe_vip(&self, entrypoint: &str) -> Result<Vec<VipSummary>> {
        let config = self.scope.config.entrypoint(entrypoint)?;
        let lb = self.balancer_for(entrypoint)?;
        let name = entrypoint_name(entrypoint, &self.scope.env.suffix);
        let names: Vec<String> = match config.balancer {
            Family::A10 => vec![name],
            Family::F5 => config.ports.iter().map(|p| format!("{}_{}", name, p.port)).collect(),
        };

        let mut summaries = Vec::new();
        for name in names {
            let Some(vs) = lb.get_virtual(&name).await? else {
                continue;
            };
            let mut ports = Vec::with_capacity(vs.ports.len());
            for port in &vs.ports {
                let pool = match &port.pool {
                    Some(pool) => describe_pool(lb.as_ref(), pool).await?,
                    None => None,
                };
                ports.push(PortSummary {
                    port_number: port.port,
                    pool,
                });
            }
            summaries.push(VipSummary {
                name: vs.name,
                address: vs.address,
                ports,
            });
        }
        Ok(summaries)
    }

    /// Drop inventory interfaces holding IPs that were never published.
    pub async fn clean_entrypoint(&mut self, entrypoint: &str, apply: bool) -> Result<Vec<Interface>> {
        let service = self.scope.config.service_of(entrypoint)?.to_string();
        let endpoints = self.group(&service).endpoints().await?;
        let mut node = Entrypoint::new(self.scope.clone(), entrypoint, endpoints)?;
        node.clean(apply).await
    }

    /// Services known to the environment.
    pub async fn all_services(&self) -> Result<Vec<String>> {
        self.scope.services.environment.services().await
    }

    /// Entrypoint names a CLI selection resolves to.
    pub fn select_entrypoints(&self, entrypoints: &[String], services: &[String], mandatory: bool) -> Vec<String> {
        self.scope.config.select_entrypoints(entrypoints, services, mandatory)
    }
}

async fn describe_pool(lb: &dyn LoadBalancer, name: &str) -> Result<Option<PoolSummary>> {
    let Some(pool) = lb.get_pool(name).await? else {
        return Ok(None);
    };
    let mut members = Vec::with_capacity(pool.members.len());
    for member in pool.members {
        let address = lb.get_server(&member.server).await?.map(|s| s.address);
        members.push(MemberSummary {
            name: member.server,
            address,
            port: member.port,
        });
    }
    Ok(Some(PoolSummary {
        name: pool.name,
        members,
    }))
}
