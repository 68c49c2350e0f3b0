//! In-memory balancer with vendor-like conflict and reference rules.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::backend::{
    pools_using_server, virtuals_using_pool, BackendResult, Family, LoadBalancer, PoolMember, PoolRecord, PortSpec,
    ServerRecord, VirtualPortRecord, VirtualRecord, VirtualSpec,
};
use crate::error::{BackendError, ConflictKind};

#[derive(Default)]
struct Objects {
    servers: BTreeMap<String, ServerRecord>,
    pools: BTreeMap<String, PoolRecord>,
    virtuals: BTreeMap<String, VirtualRecord>,
    mutations: Vec<String>,
    /// operation → status answered instead of running it
    failures: BTreeMap<String, u16>,
}

impl Objects {
    fn check(&self, operation: &str) -> BackendResult<()> {
        match self.failures.get(operation) {
            Some(status) => Err(BackendError::Api {
                status: *status,
                message: format!("injected failure of {}", operation),
            }),
            None => Ok(()),
        }
    }

    fn pools(&self) -> Vec<PoolRecord> {
        self.pools.values().cloned().collect()
    }

    fn virtuals(&self) -> Vec<VirtualRecord> {
        self.virtuals.values().cloned().collect()
    }
}

/// Balancer double for one family.
///
/// Creating an object under a taken name or address fails with the
/// matching [`ConflictKind`]; deleting an object that is still referenced
/// fails with a 400. Successful mutations are recorded in order.
pub struct MemoryBalancer {
    family: Family,
    objects: Mutex<Objects>,
}

fn conflict(kind: ConflictKind, object: &str, message: String) -> BackendError {
    BackendError::Conflict {
        kind,
        object: object.to_string(),
        message,
    }
}

fn rejected(message: String) -> BackendError {
    BackendError::Api { status: 400, message }
}

impl MemoryBalancer {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            objects: Mutex::new(Objects::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Objects> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn seed_server(&self, name: &str, address: &str) {
        self.lock().servers.insert(
            name.to_string(),
            ServerRecord {
                name: name.to_string(),
                address: address.to_string(),
            },
        );
    }

    pub fn seed_pool(&self, name: &str, monitor: &str, members: &[PoolMember]) {
        self.lock().pools.insert(
            name.to_string(),
            PoolRecord {
                name: name.to_string(),
                monitor: monitor.to_string(),
                members: members.to_vec(),
            },
        );
    }

    pub fn seed_virtual(&self, record: VirtualRecord) {
        self.lock().virtuals.insert(record.name.clone(), record);
    }

    /// Answer `operation` (a trait method name) with `status` until cleared.
    pub fn fail_operation(&self, operation: &str, status: u16) {
        self.lock().failures.insert(operation.to_string(), status);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn mutations(&self) -> Vec<String> {
        self.lock().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.lock().mutations.clear();
    }

    pub fn server(&self, name: &str) -> Option<ServerRecord> {
        self.lock().servers.get(name).cloned()
    }

    pub fn pool(&self, name: &str) -> Option<PoolRecord> {
        self.lock().pools.get(name).cloned()
    }

    pub fn virtual_server(&self, name: &str) -> Option<VirtualRecord> {
        self.lock().virtuals.get(name).cloned()
    }

    pub fn virtual_port(&self, virtual_name: &str, port: u16, protocol: &str) -> Option<VirtualPortRecord> {
        self.virtual_server(virtual_name)?
            .ports
            .into_iter()
            .find(|p| p.port == port && p.protocol == protocol)
    }

    pub fn server_names(&self) -> Vec<String> {
        self.lock().servers.keys().cloned().collect()
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.lock().pools.keys().cloned().collect()
    }

    pub fn virtual_names(&self) -> Vec<String> {
        self.lock().virtuals.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        let objects = self.lock();
        objects.servers.is_empty() && objects.pools.is_empty() && objects.virtuals.is_empty()
    }

    fn port_ops_supported(&self, operation: &'static str) -> BackendResult<()> {
        match self.family {
            Family::A10 => Ok(()),
            Family::F5 => Err(BackendError::Unsupported {
                family: self.family,
                operation,
            }),
        }
    }
}

#[async_trait]
impl LoadBalancer for MemoryBalancer {
    fn family(&self) -> Family {
        self.family
    }

    async fn get_server(&self, name: &str) -> BackendResult<Option<ServerRecord>> {
        let objects = self.lock();
        objects.check("get_server")?;
        Ok(objects.servers.get(name).cloned())
    }

    async fn get_server_by_address(&self, address: &str) -> BackendResult<Option<ServerRecord>> {
        let objects = self.lock();
        objects.check("get_server_by_address")?;
        Ok(objects.servers.values().find(|s| s.address == address).cloned())
    }

    async fn create_server(&self, name: &str, address: &str) -> BackendResult<()> {
        let mut objects = self.lock();
        objects.check("create_server")?;
        if objects.servers.contains_key(name) {
            return Err(conflict(ConflictKind::NameExists, "server", format!("server {} already exists", name)));
        }
        if let Some(owner) = objects.servers.values().find(|s| s.address == address) {
            return Err(conflict(
                ConflictKind::AddressInUse,
                "server",
                format!("{} is used by server {}", address, owner.name),
            ));
        }
        objects.servers.insert(
            name.to_string(),
            ServerRecord {
                name: name.to_string(),
                address: address.to_string(),
            },
        );
        objects.mutations.push(format!("create_server {} {}", name, address));
        Ok(())
    }

    async fn delete_server(&self, name: &str) -> BackendResult<bool> {
        let mut objects = self.lock();
        objects.check("delete_server")?;
        if !objects.servers.contains_key(name) {
            return Ok(false);
        }
        let references = pools_using_server(&objects.pools(), name);
        if !references.is_empty() {
            return Err(rejected(format!("server {} is used by {:?}", name, references)));
        }
        objects.servers.remove(name);
        objects.mutations.push(format!("delete_server {}", name));
        Ok(true)
    }

    async fn server_references(&self, name: &str) -> BackendResult<BTreeSet<String>> {
        let objects = self.lock();
        objects.check("server_references")?;
        Ok(pools_using_server(&objects.pools(), name))
    }

    async fn get_pool(&self, name: &str) -> BackendResult<Option<PoolRecord>> {
        let objects = self.lock();
        objects.check("get_pool")?;
        Ok(objects.pools.get(name).cloned())
    }

    async fn create_pool(&self, name: &str, monitor: &str, members: &[PoolMember]) -> BackendResult<()> {
        let mut objects = self.lock();
        objects.check("create_pool")?;
        if objects.pools.contains_key(name) {
            return Err(conflict(ConflictKind::NameExists, "pool", format!("pool {} already exists", name)));
        }
        if let Some(missing) = members.iter().find(|m| !objects.servers.contains_key(&m.server)) {
            return Err(rejected(format!("member server {} does not exist", missing.server)));
        }
        objects.pools.insert(
            name.to_string(),
            PoolRecord {
                name: name.to_string(),
                monitor: monitor.to_string(),
                members: members.to_vec(),
            },
        );
        let labels: Vec<String> = members.iter().map(PoolMember::label).collect();
        objects.mutations.push(format!("create_pool {} {}", name, labels.join(",")));
        Ok(())
    }

    async fn delete_pool(&self, name: &str) -> BackendResult<bool> {
        let mut objects = self.lock();
        objects.check("delete_pool")?;
        if !objects.pools.contains_key(name) {
            return Ok(false);
        }
        let references = virtuals_using_pool(&objects.virtuals(), name);
        if !references.is_empty() {
            return Err(rejected(format!("pool {} is used by {:?}", name, references)));
        }
        objects.pools.remove(name);
        objects.mutations.push(format!("delete_pool {}", name));
        Ok(true)
    }

    async fn pool_references(&self, name: &str) -> BackendResult<BTreeSet<String>> {
        let objects = self.lock();
        objects.check("pool_references")?;
        Ok(virtuals_using_pool(&objects.virtuals(), name))
    }

    async fn add_pool_members(&self, pool: &str, members: &[PoolMember]) -> BackendResult<Vec<PoolMember>> {
        let mut objects = self.lock();
        objects.check("add_pool_members")?;
        if let Some(missing) = members.iter().find(|m| !objects.servers.contains_key(&m.server)) {
            return Err(rejected(format!("member server {} does not exist", missing.server)));
        }
        let record = objects
            .pools
            .get_mut(pool)
            .ok_or_else(|| rejected(format!("pool {} does not exist", pool)))?;
        let mut added = Vec::new();
        for member in members {
            if !record.members.contains(member) {
                record.members.push(member.clone());
                added.push(member.clone());
            }
        }
        record.members.sort();
        for member in &added {
            objects.mutations.push(format!("add_member {} {}", pool, member.label()));
        }
        Ok(added)
    }

    async fn remove_all_pool_members(&self, pool: &str) -> BackendResult<Vec<PoolMember>> {
        let mut objects = self.lock();
        objects.check("remove_all_pool_members")?;
        let removed = match objects.pools.get_mut(pool) {
            Some(record) => std::mem::take(&mut record.members),
            None => return Ok(Vec::new()),
        };
        for member in &removed {
            objects.mutations.push(format!("remove_member {} {}", pool, member.label()));
        }
        Ok(removed)
    }

    async fn remove_server_members(&self, pool: &str, server: &str) -> BackendResult<Vec<PoolMember>> {
        let mut objects = self.lock();
        objects.check("remove_server_members")?;
        let removed: Vec<PoolMember> = match objects.pools.get_mut(pool) {
            Some(record) => {
                let (removed, kept) = std::mem::take(&mut record.members)
                    .into_iter()
                    .partition(|m| m.server == server);
                record.members = kept;
                removed
            }
            None => return Ok(Vec::new()),
        };
        for member in &removed {
            objects.mutations.push(format!("remove_member {} {}", pool, member.label()));
        }
        Ok(removed)
    }

    async fn get_virtual(&self, name: &str) -> BackendResult<Option<VirtualRecord>> {
        let objects = self.lock();
        objects.check("get_virtual")?;
        Ok(objects.virtuals.get(name).cloned())
    }

    async fn create_virtual(&self, spec: &VirtualSpec) -> BackendResult<()> {
        let mut objects = self.lock();
        objects.check("create_virtual")?;
        if objects.virtuals.contains_key(&spec.name) {
            return Err(conflict(
                ConflictKind::NameExists,
                "virtual",
                format!("virtual server {} already exists", spec.name),
            ));
        }

        let record = match (self.family, &spec.listener) {
            (Family::A10, _) => {
                if let Some(owner) = objects.virtuals.values().find(|v| v.address == spec.address) {
                    return Err(conflict(
                        ConflictKind::AddressInUse,
                        "virtual",
                        format!("{} is used by virtual server {}", spec.address, owner.name),
                    ));
                }
                VirtualRecord {
                    name: spec.name.clone(),
                    address: spec.address.clone(),
                    partition: None,
                    ports: Vec::new(),
                    profiles: Vec::new(),
                }
            }
            (Family::F5, Some(listener)) => {
                let shared = objects.virtuals.values().find(|v| {
                    v.address == spec.address && v.ports.iter().any(|p| p.port == listener.port)
                });
                if let Some(owner) = shared {
                    return Err(conflict(
                        ConflictKind::AddressInUse,
                        "virtual",
                        format!("{} illegally shares destination address with {}", spec.name, owner.name),
                    ));
                }
                if !objects.pools.contains_key(&listener.pool) {
                    return Err(rejected(format!("pool {} does not exist", listener.pool)));
                }
                let mut profiles = listener.profiles.clone();
                profiles.push("tcp".to_string());
                VirtualRecord {
                    name: spec.name.clone(),
                    address: spec.address.clone(),
                    partition: None,
                    ports: vec![VirtualPortRecord {
                        port: listener.port,
                        protocol: "tcp".to_string(),
                        pool: Some(listener.pool.clone()),
                        http_template: None,
                        client_ssl: None,
                    }],
                    profiles,
                }
            }
            (Family::F5, None) => {
                return Err(BackendError::Unsupported {
                    family: self.family,
                    operation: "create_virtual without a listener",
                })
            }
        };

        objects.virtuals.insert(spec.name.clone(), record);
        objects.mutations.push(format!("create_virtual {} {}", spec.name, spec.address));
        Ok(())
    }

    async fn delete_virtual(&self, name: &str) -> BackendResult<bool> {
        let mut objects = self.lock();
        objects.check("delete_virtual")?;
        if objects.virtuals.remove(name).is_none() {
            return Ok(false);
        }
        objects.mutations.push(format!("delete_virtual {}", name));
        Ok(true)
    }

    async fn get_virtual_port(&self, virtual_name: &str, port: u16, protocol: &str) -> BackendResult<Option<VirtualPortRecord>> {
        self.port_ops_supported("get_virtual_port")?;
        let objects = self.lock();
        objects.check("get_virtual_port")?;
        Ok(objects
            .virtuals
            .get(virtual_name)
            .and_then(|v| v.ports.iter().find(|p| p.port == port && p.protocol == protocol).cloned()))
    }

    async fn create_virtual_port(&self, virtual_name: &str, spec: &PortSpec) -> BackendResult<()> {
        self.port_ops_supported("create_virtual_port")?;
        let mut objects = self.lock();
        objects.check("create_virtual_port")?;
        if !objects.pools.contains_key(&spec.pool) {
            return Err(rejected(format!("service group {} does not exist", spec.pool)));
        }
        let record = objects
            .virtuals
            .get_mut(virtual_name)
            .ok_or_else(|| rejected(format!("virtual server {} does not exist", virtual_name)))?;
        if record.ports.iter().any(|p| p.port == spec.port && p.protocol == spec.protocol) {
            return Err(conflict(
                ConflictKind::NameExists,
                "port",
                format!("port {}+{} already exists", spec.port, spec.protocol),
            ));
        }
        record.ports.push(VirtualPortRecord {
            port: spec.port,
            protocol: spec.protocol.clone(),
            pool: Some(spec.pool.clone()),
            http_template: spec.http_template.clone(),
            client_ssl: spec.client_ssl.clone(),
        });
        objects.mutations.push(format!(
            "create_port {} {}+{} {}",
            virtual_name, spec.port, spec.protocol, spec.pool
        ));
        Ok(())
    }

    async fn delete_virtual_port(&self, virtual_name: &str, port: u16, protocol: &str) -> BackendResult<bool> {
        self.port_ops_supported("delete_virtual_port")?;
        let mut objects = self.lock();
        objects.check("delete_virtual_port")?;
        let Some(record) = objects.virtuals.get_mut(virtual_name) else {
            return Ok(false);
        };
        let before = record.ports.len();
        record.ports.retain(|p| !(p.port == port && p.protocol == protocol));
        if record.ports.len() == before {
            return Ok(false);
        }
        objects
            .mutations
            .push(format!("delete_port {} {}+{}", virtual_name, port, protocol));
        Ok(true)
    }
}
