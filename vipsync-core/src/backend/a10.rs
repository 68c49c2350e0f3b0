//! A10 adapter over aXAPI v3.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use super::cache::{ObjectCache, ObjectType};
use super::{
    base_url, http_client, pools_using_server, virtuals_using_pool, BackendResult, Family, LoadBalancer,
    PoolMember, PoolRecord, PortSpec, ServerRecord, VirtualPortRecord, VirtualRecord, VirtualSpec,
};
use crate::config::Credentials;
use crate::error::{BackendError, ConflictKind, Result};

/// aXAPI error codes meaning another object already holds the address:
/// a real server (654311496) or a virtual server (654311495).
const ADDRESS_IN_USE_CODES: [i64; 2] = [654311495, 654311496];

pub struct A10Client {
    http: reqwest::Client,
    base: String,
    credentials: Credentials,
    signature: Mutex<Option<String>>,
    cache: ObjectCache,
}

impl A10Client {
    pub fn new(address: &str, credentials: &Credentials, timeout: Duration, accept_invalid_certs: bool) -> Result<Self> {
        Ok(Self {
            http: http_client(timeout, accept_invalid_certs)?,
            base: base_url(address),
            credentials: credentials.clone(),
            signature: Mutex::new(None),
            cache: ObjectCache::default(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/axapi/v3/{}", self.base, path)
    }

    /// Session signature, obtained on first use.
    async fn signature(&self) -> BackendResult<String> {
        let mut signature = self.signature.lock().await;
        if let Some(signature) = signature.as_ref() {
            return Ok(signature.clone());
        }

        let response = self
            .http
            .post(self.url("auth"))
            .json(&json!({
                "credentials": {
                    "username": self.credentials.user,
                    "password": self.credentials.password,
                }
            }))
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let body: Value = serde_json::from_str(&text).map_err(|e| BackendError::Decode(format!("auth: {}", e)))?;
        let value = body
            .pointer("/authresponse/signature")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Decode("auth response without signature".into()))?
            .to_string();
        *signature = Some(value.clone());
        Ok(value)
    }

    /// Send one request. `Ok(None)` means the object does not exist.
    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> BackendResult<Option<Value>> {
        let signature = self.signature().await?;
        debug!(%method, path, "axapi request");

        let mut request = self
            .http
            .request(method, self.url(path))
            .header(AUTHORIZATION, format!("A10 {}", signature));
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

    async fn fetch<T: DeserializeOwned>(&self, path: &str, key: &str) -> BackendResult<Option<T>> {
        match self.call(Method::GET, path, None).await? {
            Some(body) => extract(body, key).map(Some),
            None => Ok(None),
        }
    }

    async fn list<T: DeserializeOwned>(&self, path: &str, key: &str) -> BackendResult<Vec<T>> {
        match self.call(Method::GET, path, None).await? {
            // Empty collections come back without the list key.
            Some(body) if body.get(key).is_some() => extract(body, key),
            _ => Ok(Vec::new()),
        }
    }

    async fn mutate(&self, method: Method, path: &str, body: Option<Value>, object: ObjectType) -> BackendResult<Option<Value>> {
        let result = self.call(method, path, body).await;
        self.cache.invalidate(object).await;
        result
    }

    async fn servers(&self) -> BackendResult<Vec<ServerRecord>> {
        self.cache
            .servers
            .get_or_fetch(|| async {
                let servers: Vec<WireServer> = self.list("slb/server", "server-list").await?;
                Ok(servers.into_iter().map(ServerRecord::from).collect())
            })
            .await
    }

    async fn pools(&self) -> BackendResult<Vec<PoolRecord>> {
        self.cache
            .pools
            .get_or_fetch(|| async {
                let groups: Vec<WireGroup> = self.list("slb/service-group", "service-group-list").await?;
                Ok(groups.into_iter().map(PoolRecord::from).collect())
            })
            .await
    }

    async fn virtuals(&self) -> BackendResult<Vec<VirtualRecord>> {
        self.cache
            .virtuals
            .get_or_fetch(|| async {
                let virtuals: Vec<WireVirtual> = self.list("slb/virtual-server", "virtual-server-list").await?;
                Ok(virtuals.into_iter().map(VirtualRecord::from).collect())
            })
            .await
    }

    async fn remove_members(&self, pool: &str, members: Vec<PoolMember>) -> BackendResult<Vec<PoolMember>> {
        let mut removed = Vec::with_capacity(members.len());
        for member in members {
            let path = format!("slb/service-group/{}/member/{}+{}", pool, member.server, member.port);
            if self.mutate(Method::DELETE, &path, None, ObjectType::Pool).await?.is_some() {
                removed.push(member);
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl LoadBalancer for A10Client {
    fn family(&self) -> Family {
        Family::A10
    }

    async fn get_server(&self, name: &str) -> BackendResult<Option<ServerRecord>> {
        let server: Option<WireServer> = self.fetch(&format!("slb/server/{}", name), "server").await?;
        Ok(server.map(ServerRecord::from))
    }

    async fn get_server_by_address(&self, address: &str) -> BackendResult<Option<ServerRecord>> {
        Ok(self.servers().await?.into_iter().find(|s| s.address == address))
    }

    async fn create_server(&self, name: &str, address: &str) -> BackendResult<()> {
        let body = json!({"server": {"name": name, "host": address}});
        self.mutate(Method::POST, "slb/server", Some(body), ObjectType::Server)
            .await
            .map(|_| ())
    }

    async fn delete_server(&self, name: &str) -> BackendResult<bool> {
        let path = format!("slb/server/{}", name);
        Ok(self.mutate(Method::DELETE, &path, None, ObjectType::Server).await?.is_some())
    }

    async fn server_references(&self, name: &str) -> BackendResult<BTreeSet<String>> {
        Ok(pools_using_server(&self.pools().await?, name))
    }

    async fn get_pool(&self, name: &str) -> BackendResult<Option<PoolRecord>> {
        let group: Option<WireGroup> = self
            .fetch(&format!("slb/service-group/{}", name), "service-group")
            .await?;
        Ok(group.map(PoolRecord::from))
    }

    async fn create_pool(&self, name: &str, monitor: &str, members: &[PoolMember]) -> BackendResult<()> {
        let body = json!({
            "service-group": {
                "name": name,
                "protocol": "tcp",
                "health-check": monitor,
                "member-list": members.iter().map(wire_member).collect::<Vec<_>>(),
            }
        });
        self.mutate(Method::POST, "slb/service-group", Some(body), ObjectType::Pool)
            .await
            .map(|_| ())
    }

    async fn delete_pool(&self, name: &str) -> BackendResult<bool> {
        let path = format!("slb/service-group/{}", name);
        Ok(self.mutate(Method::DELETE, &path, None, ObjectType::Pool).await?.is_some())
    }

    async fn pool_references(&self, name: &str) -> BackendResult<BTreeSet<String>> {
        Ok(virtuals_using_pool(&self.virtuals().await?, name))
    }

    async fn add_pool_members(&self, pool: &str, members: &[PoolMember]) -> BackendResult<Vec<PoolMember>> {
        let path = format!("slb/service-group/{}/member", pool);
        let mut added = Vec::with_capacity(members.len());
        for member in members {
            let body = json!({"member": wire_member(member)});
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
            .fetch(&format!("slb/virtual-server/{}", name), "virtual-server")
            .await?;
        Ok(virtual_server.map(VirtualRecord::from))
    }

    async fn create_virtual(&self, spec: &VirtualSpec) -> BackendResult<()> {
        let body = json!({"virtual-server": {"name": spec.name, "ip-address": spec.address}});
        self.mutate(Method::POST, "slb/virtual-server", Some(body), ObjectType::Virtual)
            .await
            .map(|_| ())
    }

    async fn delete_virtual(&self, name: &str) -> BackendResult<bool> {
        let path = format!("slb/virtual-server/{}", name);
        Ok(self.mutate(Method::DELETE, &path, None, ObjectType::Virtual).await?.is_some())
    }

    async fn get_virtual_port(&self, virtual_name: &str, port: u16, protocol: &str) -> BackendResult<Option<VirtualPortRecord>> {
        let path = format!("slb/virtual-server/{}/port/{}+{}", virtual_name, port, protocol);
        let port: Option<WirePort> = self.fetch(&path, "port").await?;
        Ok(port.map(VirtualPortRecord::from))
    }

    async fn create_virtual_port(&self, virtual_name: &str, spec: &PortSpec) -> BackendResult<()> {
        let mut port = Map::new();
        port.insert("port-number".into(), json!(spec.port));
        port.insert("protocol".into(), json!(spec.protocol));
        port.insert("name".into(), json!(format!("{}:{}@{}", virtual_name, spec.port, spec.pool)));
        port.insert("service-group".into(), json!(spec.pool));
        port.insert("auto".into(), json!(1));
        port.insert("use-rcv-hop-for-resp".into(), json!(1));
        if let Some(template) = &spec.http_template {
            port.insert("template-http".into(), json!(template));
        }
        if let Some(client_ssl) = &spec.client_ssl {
            port.insert("template-client-ssl".into(), json!(client_ssl));
        }

        let path = format!("slb/virtual-server/{}/port", virtual_name);
        self.mutate(Method::POST, &path, Some(json!({"port": port})), ObjectType::Virtual)
            .await
            .map(|_| ())
    }

    async fn delete_virtual_port(&self, virtual_name: &str, port: u16, protocol: &str) -> BackendResult<bool> {
        let path = format!("slb/virtual-server/{}/port/{}+{}", virtual_name, port, protocol);
        Ok(self.mutate(Method::DELETE, &path, None, ObjectType::Virtual).await?.is_some())
    }
}

/// Normalize an aXAPI error response.
pub(crate) fn classify(status: u16, body: &str, object: &str) -> BackendError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|v| v.pointer("/response/err/code"))
        .and_then(Value::as_i64);
    let message = parsed
        .as_ref()
        .and_then(|v| v.pointer("/response/err/msg"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());

    let kind = if code.is_some_and(|c| ADDRESS_IN_USE_CODES.contains(&c)) {
        Some(ConflictKind::AddressInUse)
    } else if status == 409 || message.to_lowercase().contains("already exists") {
        Some(ConflictKind::NameExists)
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

fn extract<T: DeserializeOwned>(mut body: Value, key: &str) -> BackendResult<T> {
    let value = body
        .get_mut(key)
        .map(Value::take)
        .ok_or_else(|| BackendError::Decode(format!("response without {}", key)))?;
    serde_json::from_value(value).map_err(|e| BackendError::Decode(format!("{}: {}", key, e)))
}

fn wire_member(member: &PoolMember) -> Value {
    json!({"name": member.server, "port": member.port})
}

// aXAPI payloads

#[derive(Deserialize)]
struct WireServer {
    name: String,
    #[serde(default)]
    host: String,
}

#[derive(Deserialize)]
struct WireMember {
    name: String,
    port: u16,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WireGroup {
    name: String,
    #[serde(default)]
    health_check: Option<String>,
    #[serde(default)]
    member_list: Vec<WireMember>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WirePort {
    port_number: u16,
    protocol: String,
    #[serde(default)]
    service_group: Option<String>,
    #[serde(default)]
    template_http: Option<String>,
    #[serde(default)]
    template_client_ssl: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WireVirtual {
    name: String,
    #[serde(default)]
    ip_address: String,
    #[serde(default)]
    port_list: Vec<WirePort>,
}

impl From<WireServer> for ServerRecord {
    fn from(server: WireServer) -> Self {
        Self {
            name: server.name,
            address: server.host,
        }
    }
}

impl From<WireGroup> for PoolRecord {
    fn from(group: WireGroup) -> Self {
        Self {
            name: group.name,
            monitor: group.health_check.unwrap_or_default(),
            members: group
                .member_list
                .into_iter()
                .map(|m| PoolMember::new(m.name, m.port))
                .collect(),
        }
    }
}

impl From<WirePort> for VirtualPortRecord {
    fn from(port: WirePort) -> Self {
        Self {
            port: port.port_number,
            protocol: port.protocol,
            pool: port.service_group,
            http_template: port.template_http,
            client_ssl: port.template_client_ssl,
        }
    }
}

impl From<WireVirtual> for VirtualRecord {
    fn from(virtual_server: WireVirtual) -> Self {
        Self {
            name: virtual_server.name,
            address: virtual_server.ip_address,
            partition: None,
            ports: virtual_server.port_list.into_iter().map(VirtualPortRecord::from).collect(),
            profiles: Vec::new(),
        }
    }
}
