//! Host interface inventory and IP reservations.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::check_status;
use crate::config::ServiceEndpoint;
use crate::error::{Error, Result};

/// A named interface holding one IP on a host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interface {
    pub host_name: String,
    pub name: String,
    pub ip: String,
}

/// Request for one IP shared by an interface across several hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub network: String,
    pub prefix: u8,
    pub interface: String,
    pub hosts: Vec<String>,
    /// Reuse this IP when it is still free.
    pub previous_ip: Option<String>,
}

#[async_trait]
pub trait Inventory: Send + Sync {
    async fn interfaces_by_host(&self, host: &str) -> Result<Vec<Interface>>;

    async fn interfaces_by_ip(&self, ip: &str) -> Result<Vec<Interface>>;

    /// Reserve an IP and register the interface on every host. An empty
    /// string means nothing could be reserved.
    async fn reserve_ip(&self, reservation: &Reservation) -> Result<String>;

    async fn delete_interface(&self, host: &str, ip: &str) -> Result<bool>;
}

pub struct InventoryClient {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct ReservedIp {
    #[serde(default)]
    ip: String,
}

impl InventoryClient {
    pub fn new(http: reqwest::Client, endpoint: &ServiceEndpoint) -> Self {
        Self {
            http,
            url: endpoint.url.trim_end_matches('/').to_string(),
            token: endpoint.token.clone(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.request(method, format!("{}/api/{}", self.url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn interfaces(&self, key: &str, value: &str) -> Result<Vec<Interface>> {
        let response = self
            .request(reqwest::Method::GET, "interfaces")
            .query(&[(key, value)])
            .send()
            .await?;
        let response = check_status(response, "inventory", Error::Inventory).await?;
        let mut interfaces: Vec<Interface> = response.json().await?;
        interfaces.sort();
        Ok(interfaces)
    }
}

#[async_trait]
impl Inventory for InventoryClient {
    async fn interfaces_by_host(&self, host: &str) -> Result<Vec<Interface>> {
        self.interfaces("host", host).await
    }

    async fn interfaces_by_ip(&self, ip: &str) -> Result<Vec<Interface>> {
        self.interfaces("ip", ip).await
    }

    async fn reserve_ip(&self, reservation: &Reservation) -> Result<String> {
        let response = self
            .request(reqwest::Method::POST, "reservations")
            .json(reservation)
            .send()
            .await?;
        if response.status().is_client_error() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(interface = %reservation.interface, network = %reservation.network, %status, body = body.trim(), "ip reservation rejected");
            return Ok(String::new());
        }
        let response = check_status(response, "inventory reservation", Error::Inventory).await?;
        let reserved: ReservedIp = response.json().await?;
        info!(interface = %reservation.interface, ip = %reserved.ip, hosts = ?reservation.hosts, "reserved ip");
        Ok(reserved.ip)
    }

    async fn delete_interface(&self, host: &str, ip: &str) -> Result<bool> {
        let response = self
            .request(reqwest::Method::DELETE, "interfaces")
            .query(&[("host", host), ("ip", ip)])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response, "inventory", Error::Inventory).await?;
        info!(host, ip, "deleted interface");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::backend::http_client;

    async fn inventory() -> (MockServer, InventoryClient) {
        let server = MockServer::start().await;
        let endpoint = ServiceEndpoint {
            url: format!("{}/", server.uri()),
            token: None,
        };
        let http = http_client(std::time::Duration::from_secs(5), false).unwrap();
        (server, InventoryClient::new(http, &endpoint))
    }

    fn reservation() -> Reservation {
        Reservation {
            network: "10.62.0.0".into(),
            prefix: 19,
            interface: "api".into(),
            hosts: vec!["lem01-t01-pwr01".into(), "lem01-t01-pwr02".into()],
            previous_ip: None,
        }
    }

    #[tokio::test]
    async fn test_reserve_ip() {
        let (server, client) = inventory().await;
        Mock::given(method("POST"))
            .and(path("/api/reservations"))
            .and(body_partial_json(json!({"interface": "api", "network": "10.62.0.0", "previous_ip": null})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ip": "10.62.0.10"})))
            .expect(1)
            .mount(&server)
            .await;

        assert_eq!(client.reserve_ip(&reservation()).await.unwrap(), "10.62.0.10");
    }

    #[tokio::test]
    async fn test_refused_reservation_is_empty() {
        let (server, client) = inventory().await;
        Mock::given(method("POST"))
            .and(path("/api/reservations"))
            .respond_with(ResponseTemplate::new(409).set_body_string("network exhausted"))
            .mount(&server)
            .await;

        assert_eq!(client.reserve_ip(&reservation()).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_interfaces_by_host_are_sorted() {
        let (server, client) = inventory().await;
        Mock::given(method("GET"))
            .and(path("/api/interfaces"))
            .and(query_param("host", "lem01-t01-pwr01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"host_name": "lem01-t01-pwr01", "name": "eth0", "ip": "10.61.0.11"},
                {"host_name": "lem01-t01-pwr01", "name": "api", "ip": "10.62.0.10"}
            ])))
            .mount(&server)
            .await;

        let names: Vec<String> = client
            .interfaces_by_host("lem01-t01-pwr01")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["api", "eth0"]);
    }

    #[tokio::test]
    async fn test_delete_missing_interface() {
        let (server, client) = inventory().await;
        Mock::given(method("DELETE"))
            .and(path("/api/interfaces"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(!client.delete_interface("lem01-t01-pwr01", "10.62.0.10").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_inventory() {
        let (server, client) = inventory().await;
        Mock::given(method("GET"))
            .and(path("/api/interfaces"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        assert!(matches!(
            client.interfaces_by_ip("10.62.0.10").await,
            Err(Error::Unavailable(_))
        ));
    }
}
