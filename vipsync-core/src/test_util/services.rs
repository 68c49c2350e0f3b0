//! In-memory collaborators and a wired-up lab environment.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::MemoryBalancer;
use crate::backend::{Balancers, Family};
use crate::config::StaticConfig;
use crate::error::{Error, Result};
use crate::manager::{EntrypointManager, ManagerOptions};
use crate::retry::RetryPolicy;
use crate::services::{
    DnsRecords, DnsRegistry, Environment, EnvironmentInfo, Interface, Inventory, RecordType, Reservation, Resolver,
    Services,
};
use crate::tree::PRIMARY_INTERFACE;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// DNS
// =============================================================================

/// Registry and resolver over one record table.
#[derive(Default)]
pub struct FakeDns {
    records: Mutex<BTreeMap<String, DnsRecords>>,
    mutations: Mutex<Vec<String>>,
}

impl FakeDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, record_type: RecordType, source: &str, value: &str) {
        let mut records = lock(&self.records);
        let entry = records.entry(source.to_string()).or_default();
        match record_type {
            RecordType::A => entry.a.push(value.to_string()),
            RecordType::Cname => entry.cname.push(value.to_string()),
        }
    }

    pub fn records(&self, source: &str) -> DnsRecords {
        lock(&self.records).get(source).cloned().unwrap_or_default()
    }

    pub fn mutations(&self) -> Vec<String> {
        lock(&self.mutations).clone()
    }

    pub fn clear_mutations(&self) {
        lock(&self.mutations).clear();
    }
}

#[async_trait]
impl DnsRegistry for FakeDns {
    async fn add_record(&self, record_type: RecordType, source: &str, value: &str, force: bool) -> Result<bool> {
        let mut records = lock(&self.records);
        let entry = records.entry(source.to_string()).or_default();
        if force {
            *entry = DnsRecords::default();
        }
        let values = match record_type {
            RecordType::A => &mut entry.a,
            RecordType::Cname => &mut entry.cname,
        };
        if !values.iter().any(|v| v == value) {
            values.push(value.to_string());
        }
        lock(&self.mutations).push(format!("add {} {} {}", record_type, source, value));
        Ok(true)
    }

    async fn delete_record(&self, record_type: RecordType, source: &str, value: &str) -> Result<bool> {
        let mut records = lock(&self.records);
        let Some(entry) = records.get_mut(source) else {
            return Ok(false);
        };
        let values = match record_type {
            RecordType::A => &mut entry.a,
            RecordType::Cname => &mut entry.cname,
        };
        let before = values.len();
        values.retain(|v| v != value);
        let removed = values.len() != before;
        if entry.is_empty() {
            records.remove(source);
        }
        if removed {
            lock(&self.mutations).push(format!("delete {} {} {}", record_type, source, value));
        }
        Ok(removed)
    }
}

#[async_trait]
impl Resolver for FakeDns {
    async fn lookup(&self, name: &str) -> Result<DnsRecords> {
        Ok(self.records(name))
    }
}

/// Resolver behind a cache: names in `stale` keep answering with the
/// records they had when the resolver was created.
pub struct StaleResolver {
    dns: Arc<FakeDns>,
    cached: BTreeMap<String, DnsRecords>,
}

impl StaleResolver {
    pub fn new(dns: Arc<FakeDns>, stale: &[&str]) -> Self {
        let cached = stale.iter().map(|name| (name.to_string(), dns.records(name))).collect();
        Self { dns, cached }
    }
}

#[async_trait]
impl Resolver for StaleResolver {
    async fn lookup(&self, name: &str) -> Result<DnsRecords> {
        match self.cached.get(name) {
            Some(records) => Ok(records.clone()),
            None => self.dns.lookup(name).await,
        }
    }
}

// =============================================================================
// Inventory
// =============================================================================

#[derive(Default)]
struct InventoryState {
    interfaces: Vec<Interface>,
    next_host: u8,
    refuse_reservations: bool,
    reservations: Vec<Reservation>,
}

/// Inventory handing out addresses sequentially from `.10` of the
/// requested network.
pub struct FakeInventory {
    state: Mutex<InventoryState>,
}

impl Default for FakeInventory {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeInventory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InventoryState {
                next_host: 10,
                ..InventoryState::default()
            }),
        }
    }

    pub fn seed(&self, host: &str, name: &str, ip: &str) {
        lock(&self.state).interfaces.push(Interface {
            host_name: host.to_string(),
            name: name.to_string(),
            ip: ip.to_string(),
        });
    }

    /// Answer every reservation with an empty address.
    pub fn refuse_reservations(&self, refuse: bool) {
        lock(&self.state).refuse_reservations = refuse;
    }

    /// Every reservation request, in order.
    pub fn reservations(&self) -> Vec<Reservation> {
        lock(&self.state).reservations.clone()
    }

    pub fn interfaces(&self) -> Vec<Interface> {
        let mut interfaces = lock(&self.state).interfaces.clone();
        interfaces.sort();
        interfaces
    }

    /// Interfaces called `name`, across hosts.
    pub fn named(&self, name: &str) -> Vec<Interface> {
        self.interfaces().into_iter().filter(|i| i.name == name).collect()
    }
}

fn network_prefix(network: &str) -> &str {
    network.rsplit_once('.').map(|(head, _)| head).unwrap_or(network)
}

#[async_trait]
impl Inventory for FakeInventory {
    async fn interfaces_by_host(&self, host: &str) -> Result<Vec<Interface>> {
        Ok(self.interfaces().into_iter().filter(|i| i.host_name == host).collect())
    }

    async fn interfaces_by_ip(&self, ip: &str) -> Result<Vec<Interface>> {
        Ok(self.interfaces().into_iter().filter(|i| i.ip == ip).collect())
    }

    async fn reserve_ip(&self, reservation: &Reservation) -> Result<String> {
        let mut state = lock(&self.state);
        state.reservations.push(reservation.clone());
        if state.refuse_reservations {
            return Ok(String::new());
        }

        let reusable = reservation.previous_ip.as_ref().filter(|ip| {
            state
                .interfaces
                .iter()
                .all(|i| &i.ip != *ip || i.name == reservation.interface)
        });
        let ip = match reusable {
            Some(ip) => ip.clone(),
            None => {
                let ip = format!("{}.{}", network_prefix(&reservation.network), state.next_host);
                state.next_host += 1;
                ip
            }
        };

        for host in &reservation.hosts {
            state
                .interfaces
                .retain(|i| !(i.host_name == *host && i.name == reservation.interface));
            state.interfaces.push(Interface {
                host_name: host.clone(),
                name: reservation.interface.clone(),
                ip: ip.clone(),
            });
        }
        Ok(ip)
    }

    async fn delete_interface(&self, host: &str, ip: &str) -> Result<bool> {
        let mut state = lock(&self.state);
        let before = state.interfaces.len();
        state.interfaces.retain(|i| !(i.host_name == host && i.ip == ip));
        Ok(state.interfaces.len() != before)
    }
}

// =============================================================================
// Environment
// =============================================================================

#[derive(Default)]
struct EnvironmentState {
    hosts: BTreeMap<String, Vec<String>>,
    variables: BTreeMap<String, String>,
    assignments: Vec<String>,
    /// Remaining variable reads answered with a server-side error.
    unavailable: u32,
}

pub struct FakeEnvironment {
    info: Option<EnvironmentInfo>,
    state: Mutex<EnvironmentState>,
}

impl FakeEnvironment {
    pub fn new(info: EnvironmentInfo) -> Self {
        Self {
            info: Some(info),
            state: Mutex::new(EnvironmentState::default()),
        }
    }

    /// An environment the configuration service does not know.
    pub fn unknown() -> Self {
        Self {
            info: None,
            state: Mutex::new(EnvironmentState::default()),
        }
    }

    pub fn add_host(&self, service: &str, host: &str) {
        lock(&self.state)
            .hosts
            .entry(service.to_string())
            .or_default()
            .push(host.to_string());
    }

    pub fn set(&self, name: &str, value: &str) {
        lock(&self.state).variables.insert(name.to_string(), value.to_string());
    }

    pub fn variable(&self, name: &str) -> Option<String> {
        lock(&self.state).variables.get(name).cloned()
    }

    /// `name=value` for every write made through the trait.
    pub fn assignments(&self) -> Vec<String> {
        lock(&self.state).assignments.clone()
    }

    pub fn fail_variable_reads(&self, times: u32) {
        lock(&self.state).unavailable = times;
    }
}

#[async_trait]
impl Environment for FakeEnvironment {
    async fn info(&self) -> Result<EnvironmentInfo> {
        self.info
            .clone()
            .ok_or_else(|| Error::UnknownEnvironment("unknown".to_string()))
    }

    async fn hosts_by_service(&self, service: &str) -> Result<Vec<String>> {
        let mut hosts = lock(&self.state).hosts.get(service).cloned().unwrap_or_default();
        hosts.sort();
        Ok(hosts)
    }

    async fn services(&self) -> Result<Vec<String>> {
        Ok(lock(&self.state).hosts.keys().cloned().collect())
    }

    async fn variable_matches(&self, name: &str, value: &str) -> Result<bool> {
        let mut state = lock(&self.state);
        if state.unavailable > 0 {
            state.unavailable -= 1;
            return Err(Error::Unavailable(format!("variable {}", name)));
        }
        Ok(state.variables.get(name).is_some_and(|v| v == value))
    }

    async fn set_variable(&self, name: &str, value: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.variables.insert(name.to_string(), value.to_string());
        state.assignments.push(format!("{}={}", name, value));
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

pub const LAB_SUFFIX: &str = "lablemams";
pub const LAB_DOMAIN: &str = "example.net";
pub const LAB_LOCATION: &str = "AMS02";

/// Static config of the lab: two A10 entrypoints on `pwr`, one F5
/// entrypoint on `gpr` and one F5 entrypoint on `cdn` that is shared from
/// the `sharedenv` environment.
pub const LAB_CONFIG: &str = r#"{
    "healthchecks": {"A10": {"pwr": "http_pwr"}},
    "balancers": {
        "AMS02": {
            "A10": {"address": "a10.ams02", "network": "10.62.0.0", "prefix": 19},
            "F5": {"address": "f5.ams02", "network": "10.63.0.0", "prefix": 19, "partition": "ams-up"}
        }
    },
    "shared_entrypoints": {
        "service": [{"suffix": "sharedenv", "hosts": ["lem01-t01-cdn01"]}]
    },
    "entrypoints": {
        "api": {"LB": "A10", "mandatory": true, "service": "pwr",
                "ports": [{"port": 443, "target_port": 80, "protocol": "https"}],
                "adsvars": {"PWR_API_HOST": "api{ENV.DNS_PREFIX}"}},
        "intapi": {"LB": "A10", "service": "pwr",
                   "ports": [{"port": 80, "target_port": 80, "protocol": "http"}]},
        "web": {"LB": "F5", "mandatory": true, "service": "gpr",
                "ports": [{"port": 443, "target_port": 80, "protocol": "https", "template_http": "xff"}]},
        "service": {"LB": "F5", "service": "cdn",
                    "ports": [{"port": 80, "target_port": 8080, "protocol": "http"}]}
    }
}"#;

const LAB_HOSTS: [(&str, &str, &str); 5] = [
    ("pwr", "lem01-t01-pwr01", "10.61.0.11"),
    ("pwr", "lem01-t01-pwr02", "10.61.0.12"),
    ("gpr", "lem01-t01-gpr01", "10.61.1.11"),
    ("gpr", "lem01-t01-gpr02", "10.61.1.12"),
    ("cdn", "lem01-t01-cdn01", "10.61.2.11"),
];

pub fn lab_environment() -> EnvironmentInfo {
    EnvironmentInfo {
        name: "lab".to_string(),
        suffix: LAB_SUFFIX.to_string(),
        domain: LAB_DOMAIN.to_string(),
        location: LAB_LOCATION.to_string(),
    }
}

/// Every collaborator of one lab environment, in memory.
pub struct Harness {
    pub config: Arc<StaticConfig>,
    pub dns: Arc<FakeDns>,
    pub inventory: Arc<FakeInventory>,
    pub environment: Arc<FakeEnvironment>,
    pub a10: Arc<MemoryBalancer>,
    pub f5: Arc<MemoryBalancer>,
    pub data_dir: PathBuf,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_environment(FakeEnvironment::new(lab_environment()))
    }

    pub fn with_environment(environment: FakeEnvironment) -> Self {
        let config = match StaticConfig::from_json(LAB_CONFIG) {
            Ok(config) => config,
            Err(e) => panic!("lab config does not parse: {}", e),
        };
        let dns = FakeDns::new();
        let inventory = FakeInventory::new();
        for (service, host, ip) in LAB_HOSTS {
            let fqdn = format!("{}.{}", host, LAB_DOMAIN);
            environment.add_host(service, &fqdn);
            dns.seed(RecordType::A, &fqdn, ip);
            inventory.seed(host, PRIMARY_INTERFACE, ip);
        }
        environment.set("PWR_API_HOST", &format!("api-{}.{}", LAB_SUFFIX, LAB_DOMAIN));

        Self {
            config: Arc::new(config),
            dns: Arc::new(dns),
            inventory: Arc::new(inventory),
            environment: Arc::new(environment),
            a10: Arc::new(MemoryBalancer::new(Family::A10)),
            f5: Arc::new(MemoryBalancer::new(Family::F5)),
            data_dir: std::env::temp_dir().join(format!("vipsync-{}", std::process::id())),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            dns: self.dns.clone(),
            resolver: self.dns.clone(),
            inventory: self.inventory.clone(),
            environment: self.environment.clone(),
        }
    }

    pub fn balancers(&self) -> Balancers {
        Balancers::new(LAB_LOCATION).with(self.a10.clone()).with(self.f5.clone())
    }

    pub fn options(&self) -> ManagerOptions {
        ManagerOptions {
            check_entrypoint_group: false,
            retry: RetryPolicy::immediate(2),
            data_dir: self.data_dir.clone(),
        }
    }

    /// A fresh manager, so nothing observed by earlier runs is reused.
    pub async fn manager(&self) -> Result<EntrypointManager> {
        self.manager_with(self.balancers(), self.options()).await
    }

    pub async fn manager_with(&self, balancers: Balancers, options: ManagerOptions) -> Result<EntrypointManager> {
        EntrypointManager::new(self.config.clone(), self.services(), balancers, options).await
    }

    /// A manager whose lookups of `entrypoints` do not see later changes.
    pub async fn manager_with_stale_dns(&self, entrypoints: &[&str]) -> Result<EntrypointManager> {
        let fqdns: Vec<String> = entrypoints
            .iter()
            .map(|e| format!("{}-{}.{}", e, LAB_SUFFIX, LAB_DOMAIN))
            .collect();
        let names: Vec<&str> = fqdns.iter().map(String::as_str).collect();
        let services = Services {
            resolver: Arc::new(StaleResolver::new(self.dns.clone(), &names)),
            ..self.services()
        };
        EntrypointManager::new(self.config.clone(), services, self.balancers(), self.options()).await
    }

    /// Address published for `entrypoint` in the lab.
    pub fn published(&self, entrypoint: &str) -> DnsRecords {
        self.dns
            .records(&format!("{}-{}.{}", entrypoint, LAB_SUFFIX, LAB_DOMAIN))
    }

    pub fn mutations(&self) -> Vec<String> {
        let mut mutations = self.a10.mutations();
        mutations.extend(self.f5.mutations());
        mutations.extend(self.dns.mutations());
        mutations
    }

    pub fn clear_mutations(&self) {
        self.a10.clear_mutations();
        self.f5.clear_mutations();
        self.dns.clear_mutations();
    }
}
