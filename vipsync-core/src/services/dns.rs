//! DNS record submission and non-recursive lookups.

use std::fmt;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::check_status;
use crate::config::ServiceEndpoint;
use crate::error::{Error, Result};

/// Submitted records live this long in caches.
const RECORD_TTL: u32 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    A,
    #[serde(rename = "CNAME")]
    Cname,
}

impl RecordType {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Cname => "CNAME",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records published directly under one name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecords {
    #[serde(rename = "A", default)]
    pub a: Vec<String>,
    #[serde(rename = "CNAME", default)]
    pub cname: Vec<String>,
}

impl DnsRecords {
    pub fn is_empty(&self) -> bool {
        self.a.is_empty() && self.cname.is_empty()
    }
}

/// Authoritative record store.
#[async_trait]
pub trait DnsRegistry: Send + Sync {
    /// Publish `source → value`. With `force`, records already present under
    /// `source` are replaced.
    async fn add_record(&self, record_type: RecordType, source: &str, value: &str, force: bool) -> Result<bool>;

    async fn delete_record(&self, record_type: RecordType, source: &str, value: &str) -> Result<bool>;
}

#[async_trait]
pub trait Resolver: Send + Sync {
    /// A and CNAME records owned by `name`; CNAMEs are not followed.
    async fn lookup(&self, name: &str) -> Result<DnsRecords>;
}

// =============================================================================
// HTTP registry
// =============================================================================

/// Record submission API: `POST {url}/api/submit`.
pub struct DnsApiClient {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl DnsApiClient {
    pub fn new(http: reqwest::Client, endpoint: &ServiceEndpoint) -> Self {
        Self {
            http,
            url: endpoint.url.trim_end_matches('/').to_string(),
            token: endpoint.token.clone(),
        }
    }

    async fn submit(&self, action: &str, record_type: RecordType, source: &str, value: &str, force: bool) -> Result<bool> {
        let mut request = self.http.post(format!("{}/api/submit", self.url)).json(&json!({
            "action": action,
            "record_type": record_type,
            "source": source,
            "value": value,
            "ttl": RECORD_TTL,
            "force": force,
            "ptr": false,
        }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if response.status().is_client_error() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(action, %record_type, source, value, %status, body = body.trim(), "dns submission rejected");
            return Ok(false);
        }
        check_status(response, "dns submit", Error::Dns).await?;
        info!(action, %record_type, source, value, "dns record submitted");
        Ok(true)
    }
}

#[async_trait]
impl DnsRegistry for DnsApiClient {
    async fn add_record(&self, record_type: RecordType, source: &str, value: &str, force: bool) -> Result<bool> {
        self.submit("add", record_type, source, value, force).await
    }

    async fn delete_record(&self, record_type: RecordType, source: &str, value: &str) -> Result<bool> {
        self.submit("delete", record_type, source, value, false).await
    }
}

// =============================================================================
// DNS-over-HTTPS resolver
// =============================================================================

/// JSON DNS-over-HTTPS resolver (`application/dns-json`).
pub struct DohResolver {
    http: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Deserialize)]
struct DohAnswer {
    name: String,
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

const TYPE_A: u16 = 1;
const TYPE_CNAME: u16 = 5;

impl DohResolver {
    pub fn new(http: reqwest::Client, endpoint: &ServiceEndpoint) -> Self {
        Self {
            http,
            url: endpoint.url.clone(),
        }
    }
}

#[async_trait]
impl Resolver for DohResolver {
    async fn lookup(&self, name: &str) -> Result<DnsRecords> {
        let response = self
            .http
            .get(&self.url)
            .query(&[("name", name), ("type", "A")])
            .header(ACCEPT, "application/dns-json")
            .send()
            .await?;
        let response = check_status(response, "resolver", Error::Dns).await?;
        let body: DohResponse = response.json().await?;
        Ok(records_for(name, body.answer))
    }
}

/// Keep answers owned by `name`; a resolver following a CNAME also returns
/// the target's records, which belong to another name.
fn records_for(name: &str, answers: Vec<DohAnswer>) -> DnsRecords {
    let wanted = name.trim_end_matches('.');
    let mut records = DnsRecords::default();
    for answer in answers {
        if !answer.name.trim_end_matches('.').eq_ignore_ascii_case(wanted) {
            continue;
        }
        match answer.record_type {
            TYPE_A => records.a.push(answer.data),
            TYPE_CNAME => records.cname.push(answer.data.trim_end_matches('.').to_string()),
            _ => {}
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::backend::http_client;

    fn endpoint(server: &MockServer, path: &str) -> ServiceEndpoint {
        ServiceEndpoint {
            url: format!("{}{}", server.uri(), path),
            token: Some("dns-token".into()),
        }
    }

    fn http() -> reqwest::Client {
        http_client(std::time::Duration::from_secs(5), false).unwrap()
    }

    #[test]
    fn test_only_owned_answers_are_kept() {
        let body: DohResponse = serde_json::from_str(
            r#"{
                "Status": 0,
                "Answer": [
                    {"name": "service-lablemams.example.net.", "type": 5, "TTL": 300, "data": "service-sharedenv.example.net."},
                    {"name": "service-sharedenv.example.net.", "type": 1, "TTL": 300, "data": "10.63.0.44"}
                ]
            }"#,
        )
        .unwrap();
        let records = records_for("service-lablemams.example.net", body.answer);
        assert!(records.a.is_empty());
        assert_eq!(records.cname, vec!["service-sharedenv.example.net"]);
    }

    #[test]
    fn test_nxdomain_has_no_records() {
        let body: DohResponse = serde_json::from_str(r#"{"Status": 3}"#).unwrap();
        assert!(records_for("missing.example.net", body.answer).is_empty());
    }

    #[test]
    fn test_records_serialize_with_record_type_keys() {
        let records = DnsRecords {
            a: vec!["10.62.0.10".into()],
            cname: vec![],
        };
        assert_eq!(
            serde_json::to_value(&records).unwrap(),
            serde_json::json!({"A": ["10.62.0.10"], "CNAME": []})
        );
        assert_eq!(serde_json::to_value(RecordType::Cname).unwrap(), "CNAME");
    }

    #[tokio::test]
    async fn test_submit_forced_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/submit"))
            .and(header("authorization", "Bearer dns-token"))
            .and(body_partial_json(json!({
                "action": "add",
                "record_type": "A",
                "source": "api-lablemams.example.net",
                "value": "10.62.0.10",
                "force": true
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = DnsApiClient::new(http(), &endpoint(&server, ""));
        assert!(client
            .add_record(RecordType::A, "api-lablemams.example.net", "10.62.0.10", true)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_rejected_submission_is_false() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/submit"))
            .respond_with(ResponseTemplate::new(422).set_body_string("record does not exist"))
            .mount(&server)
            .await;

        let client = DnsApiClient::new(http(), &endpoint(&server, ""));
        assert!(!client
            .delete_record(RecordType::A, "api-lablemams.example.net", "10.62.0.10")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/submit"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let client = DnsApiClient::new(http(), &endpoint(&server, ""));
        let err = client
            .add_record(RecordType::Cname, "service-lablemams.example.net", "service-sharedenv.example.net", true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_lookup_keeps_owned_answers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dns-query"))
            .and(query_param("name", "service-lablemams.example.net"))
            .and(header("accept", "application/dns-json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Status": 0,
                "Answer": [
                    {"name": "service-lablemams.example.net.", "type": 5, "TTL": 300, "data": "service-sharedenv.example.net."},
                    {"name": "service-sharedenv.example.net.", "type": 1, "TTL": 300, "data": "10.63.0.44"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = DohResolver::new(http(), &endpoint(&server, "/dns-query"));
        let records = resolver.lookup("service-lablemams.example.net").await.unwrap();
        assert!(records.a.is_empty());
        assert_eq!(records.cname, vec!["service-sharedenv.example.net"]);
    }
}
