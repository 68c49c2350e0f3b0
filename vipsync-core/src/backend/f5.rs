//! F5 adapter over iControl REST.
//!
//! All objects live in one administrative partition. The REST API reports
//! names and addresses as full paths (`/ams-up/10.63.0.10%1:443`); values
//! read back are reduced with [`clean_value`] before they reach a model.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::cache::{ObjectCache, ObjectType};
use super::{
    base_url, http_client, pools_using_server, virtuals_using_pool, BackendResult, Family, LoadBalancer,
    PoolMember, PoolRecord, ServerRecord, VirtualPortRecord, VirtualRecord, VirtualSpec,
};
use crate::config::Credentials;
use crate::error::{BackendError, ConflictKind, Result};

const EXPAND: &str = "expandSubcollections=true";

pub struct F5Client {
    http: reqwest::Client,
    base: String,
    credentials: Credentials,
    partition: String,
    cache: ObjectCache,
}

impl F5Client {
    pub fn new(
        address: &str,
        credentials: &Credentials,
        partition: &str,
        timeout: Duration,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        Ok(Self {
            http: http_client(timeout, accept_invalid_certs)?,
            base: base_url(address),
            credentials: credentials.clone(),
            partition: partition.to_string(),
            cache: ObjectCache::default(),
        })
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    fn url(&self, path: &str) -> String {
        format!("{}/mgmt/tm/ltm/{}", self.base, path)
    }

    /// `~partition~name`, the path form of a partitioned object.
    fn full(&self, name: &str) -> String {
        format!("~{}~{}", self.partition, name)
    }

    /// Send one request. `Ok(None)` means the object does not exist.
    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> BackendResult<Option<Value>> {
        debug!(%method, path, "icontrol request");
        let mut request = self
            .http
            .request(method, self.url(path))
            .basic_auth(&self.credentials.user, Some(&self.credentials.password));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = response.text().await?;
        if !status.is_success() {
            return Err(classify(status.as_u16(), &text, path));
        }
        if text.trim().is_empty() {
            return Ok(Some(Value::Null));
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| BackendError::Decode(format!("{}: {}", path, e)))
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> BackendResult<Option<T>> {
        match self.call(Method::GET, path, None).await? {
            Some(body) => decode(body, path).map(Some),
            None => Ok(None),
        }
    }

    async fn list<T: DeserializeOwned>(&self, path: &str) -> BackendResult<Vec<T>> {
        let items: Option<WireItems<T>> = self.fetch(path).await?;
        Ok(items.map(|i| i.items).unwrap_or_default())
    }

    async fn mutate(&self, method: Method, path: &str, body: Option<Value>, object: ObjectType) -> BackendResult<Option<Value>> {
        let result = self.call(method, path, body).await;
        self.cache.invalidate(object).await;
        result
    }

    fn in_partition(&self, partition: &Option<String>) -> bool {
        partition.as_deref().map_or(true, |p| p == self.partition)
    }

    async fn servers(&self) -> BackendResult<Vec<ServerRecord>> {
        self.cache
            .servers
            .get_or_fetch(|| async {
                let nodes: Vec<WireNode> = self.list("node").await?;
                Ok(nodes
                    .into_iter()
                    .filter(|n| self.in_partition(&n.partition))
                    .map(ServerRecord::from)
                    .collect())
            })
            .await
    }

    async fn pools(&self) -> BackendResult<Vec<PoolRecord>> {
        self.cache
            .pools
            .get_or_fetch(|| async {
                let pools: Vec<WirePool> = self.list(&format!("pool?{}", EXPAND)).await?;
                Ok(pools
                    .into_iter()
                    .filter(|p| self.in_partition(&p.partition))
                    .map(PoolRecord::from)
                    .collect())
            })
            .await
    }

    async fn virtuals(&self) -> BackendResult<Vec<VirtualRecord>> {
        self.cache
            .virtuals
            .get_or_fetch(|| async {
                let virtuals: Vec<WireVirtual> = self.list(&format!("virtual?{}", EXPAND)).await?;
                Ok(virtuals
                    .into_iter()
                    .filter(|v| self.in_partition(&v.partition))
                    .map(VirtualRecord::from)
                    .collect())
            })
            .await
    }

    async fn remove_members(&self, pool: &str, members: Vec<PoolMember>) -> BackendResult<Vec<PoolMember>> {
        let mut removed = Vec::with_capacity(members.len());
        for member in members {
            let path = format!("pool/{}/members/{}", self.full(pool), self.full(&member.label()));
            if self.mutate(Method::DELETE, &path, None, ObjectType::Pool).await?.is_some() {
                removed.push(member);
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl LoadBalancer for F5Client {
    fn family(&self) -> Family {
        Family::F5
    }

    async fn get_server(&self, name: &str) -> BackendResult<Option<ServerRecord>> {
        let node: Option<WireNode> = self.fetch(&format!("node/{}", self.full(name))).await?;
        Ok(node.map(ServerRecord::from))
    }

    async fn get_server_by_address(&self, address: &str) -> BackendResult<Option<ServerRecord>> {
        Ok(self.servers().await?.into_iter().find(|s| s.address == address))
    }

    async fn create_server(&self, name: &str, address: &str) -> BackendResult<()> {
        let body = json!({
            "name": name,
            "partition": self.partition,
            "address": address,
            "monitor": "icmp",
        });
        self.mutate(Method::POST, "node", Some(body), ObjectType::Server)
            .await
            .map(|_| ())
    }

    async fn delete_server(&self, name: &str) -> BackendResult<bool> {
        let path = format!("node/{}", self.full(name));
        Ok(self.mutate(Method::DELETE, &path, None, ObjectType::Server).await?.is_some())
    }

    async fn server_references(&self, name: &str) -> BackendResult<BTreeSet<String>> {
        Ok(pools_using_server(&self.pools().await?, name))
    }

    async fn get_pool(&self, name: &str) -> BackendResult<Option<PoolRecord>> {
        let pool: Option<WirePool> = self
            .fetch(&format!("pool/{}?{}", self.full(name), EXPAND))
            .await?;
        Ok(pool.map(PoolRecord::from))
    }

    async fn create_pool(&self, name: &str, monitor: &str, members: &[PoolMember]) -> BackendResult<()> {
        let members: Vec<Value> = members
            .iter()
            .map(|m| json!({"name": m.label(), "partition": self.partition}))
            .collect();
        let body = json!({
            "name": name,
            "partition": self.partition,
            "monitor": monitor,
            "members": members,
        });
        self.mutate(Method::POST, "pool", Some(body), ObjectType::Pool)
            .await
            .map(|_| ())
    }

    async fn delete_pool(&self, name: &str) -> BackendResult<bool> {
        let path = format!("pool/{}", self.full(name));
        Ok(self.mutate(Method::DELETE, &path, None, ObjectType::Pool).await?.is_some())
    }

    async fn pool_references(&self, name: &str) -> BackendResult<BTreeSet<String>> {
        Ok(virtuals_using_pool(&self.virtuals().await?, name))
    }

    async fn add_pool_members(&self, pool: &str, members: &[PoolMember]) -> BackendResult<Vec<PoolMember>> {
        let path = format!("pool/{}/members", self.full(pool));
        let mut added = Vec::with_capacity(members.len());
        for member in members {
            let body = json!({"name": member.label(), "partition": self.partition});
            self.mutate(Method::POST, &path, Some(body), ObjectType::Pool).await?;
            added.push(member.clone());
        }
        Ok(added)
    }

    async fn remove_all_pool_members(&self, pool: &str) -> BackendResult<Vec<PoolMember>> {
        let members = self.get_pool(pool).await?.map(|p| p.members).unwrap_or_default();
        self.remove_members(pool, members).await
    }

    async fn remove_server_members(&self, pool: &str, server: &str) -> BackendResult<Vec<PoolMember>> {
        let members = self
            .get_pool(pool)
            .await?
            .map(|p| p.members)
            .unwrap_or_default()
            .into_iter()
            .filter(|m| m.server == server)
            .collect();
        self.remove_members(pool, members).await
    }

    async fn get_virtual(&self, name: &str) -> BackendResult<Option<VirtualRecord>> {
        let virtual_server: Option<WireVirtual> = self
            .fetch(&format!("virtual/{}?{}", self.full(name), EXPAND))
            .await?;
        Ok(virtual_server.map(VirtualRecord::from))
    }

    async fn create_virtual(&self, spec: &VirtualSpec) -> BackendResult<()> {
        let listener = spec.listener.as_ref().ok_or(BackendError::Unsupported {
            family: Family::F5,
            operation: "create_virtual without a listener",
        })?;
        let profiles: Vec<Value> = listener.profiles.iter().map(|p| json!({"name": p})).collect();
        let body = json!({
            "name": spec.name,
            "partition": self.partition,
            "destination": format!("/{}/{}:{}", self.partition, spec.address, listener.port),
            "ipProtocol": "tcp",
            "pool": format!("/{}/{}", self.partition, listener.pool),
            "profiles": profiles,
            "sourceAddressTranslation": {"type": "automap"},
        });
        self.mutate(Method::POST, "virtual", Some(body), ObjectType::Virtual)
            .await
            .map(|_| ())
    }

    async fn delete_virtual(&self, name: &str) -> BackendResult<bool> {
        let path = format!("virtual/{}", self.full(name));
        Ok(self.mutate(Method::DELETE, &path, None, ObjectType::Virtual).await?.is_some())
    }
}

/// Reduce an iControl value to its bare name or address:
/// `/ams-up/10.63.0.10%1:443` becomes `10.63.0.10`.
pub fn clean_value(value: &str) -> &str {
    let last = value.rsplit('/').next().unwrap_or(value);
    let last = last.split('%').next().unwrap_or(last);
    last.split(':').next().unwrap_or(last)
}

/// Port of an iControl destination, `/p/10.63.0.10%1:443` gives 443.
fn destination_port(destination: &str) -> Option<u16> {
    destination.rsplit_once(':')?.1.parse().ok()
}

/// Normalize an iControl error response.
pub(crate) fn classify(status: u16, body: &str, object: &str) -> BackendError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string());

    let kind = if status == 409 && message.contains("01020066:3") {
        Some(ConflictKind::NameExists)
    } else if status == 400
        && (message.contains("0107176c:3") || message.contains("illegally shares destination address"))
    {
        Some(ConflictKind::AddressInUse)
    } else {
        None
    };

    match kind {
        Some(kind) => BackendError::Conflict {
            kind,
            object: object.to_string(),
            message,
        },
        None => BackendError::Api { status, message },
    }
}

fn decode<T: DeserializeOwned>(body: Value, path: &str) -> BackendResult<T> {
    serde_json::from_value(body).map_err(|e| BackendError::Decode(format!("{}: {}", path, e)))
}

// iControl payloads

#[derive(Deserialize)]
struct WireItems<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct WireNode {
    name: String,
    #[serde(default)]
    partition: Option<String>,
    #[serde(default)]
    address: String,
}

#[derive(Deserialize)]
struct WireNamed {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePool {
    name: String,
    #[serde(default)]
    partition: Option<String>,
    #[serde(default)]
    monitor: String,
    #[serde(default)]
    members_reference: Option<WireItems<WireNamed>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireVirtual {
    name: String,
    #[serde(default)]
    partition: Option<String>,
    #[serde(default)]
    destination: String,
    #[serde(default)]
    ip_protocol: Option<String>,
    #[serde(default)]
    pool: Option<String>,
    #[serde(default)]
    profiles_reference: Option<WireItems<WireNamed>>,
}

impl From<WireNode> for ServerRecord {
    fn from(node: WireNode) -> Self {
        Self {
            address: clean_value(&node.address).to_string(),
            name: node.name,
        }
    }
}

impl From<WirePool> for PoolRecord {
    fn from(pool: WirePool) -> Self {
        let members = pool
            .members_reference
            .map(|r| r.items)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| PoolMember::parse(m.name.rsplit('/').next().unwrap_or(&m.name)))
            .collect();
        Self {
            monitor: clean_value(pool.monitor.trim()).to_string(),
            name: pool.name,
            members,
        }
    }
}

impl From<WireVirtual> for VirtualRecord {
    fn from(virtual_server: WireVirtual) -> Self {
        let port = VirtualPortRecord {
            port: destination_port(&virtual_server.destination).unwrap_or_default(),
            protocol: virtual_server.ip_protocol.unwrap_or_else(|| "tcp".to_string()),
            pool: virtual_server.pool.as_deref().map(|p| clean_value(p).to_string()),
            http_template: None,
            client_ssl: None,
        };
        Self {
            address: clean_value(&virtual_server.destination).to_string(),
            name: virtual_server.name,
            partition: virtual_server.partition,
            ports: vec![port],
            profiles: virtual_server
                .profiles_reference
                .map(|r| r.items)
                .unwrap_or_default()
                .into_iter()
                .map(|p| p.name)
                .collect(),
        }
    }
}
