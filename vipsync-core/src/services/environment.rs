//! Environment identity, service hosts and configuration variables.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::check_status;
use crate::config::ServiceEndpoint;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub name: String,
    /// Appended to interface names to form entrypoint names.
    pub suffix: String,
    pub domain: String,
    /// Datacenter code selecting the balancers, upper case.
    pub location: String,
}

#[async_trait]
pub trait Environment: Send + Sync {
    async fn info(&self) -> Result<EnvironmentInfo>;

    /// Fully qualified hosts running `service`.
    async fn hosts_by_service(&self, service: &str) -> Result<Vec<String>>;

    async fn services(&self) -> Result<Vec<String>>;

    /// Whether the effective value of `name` equals `value`.
    async fn variable_matches(&self, name: &str, value: &str) -> Result<bool>;

    /// Set the environment-level override of `name`.
    async fn set_variable(&self, name: &str, value: &str) -> Result<()>;
}

pub struct EnvironmentClient {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    environment: String,
}

#[derive(Deserialize)]
struct VariableValue {
    #[serde(default)]
    value: String,
}

impl EnvironmentClient {
    pub fn new(http: reqwest::Client, endpoint: &ServiceEndpoint, environment: &str) -> Self {
        Self {
            http,
            url: endpoint.url.trim_end_matches('/').to_string(),
            token: endpoint.token.clone(),
            environment: environment.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = if path.is_empty() {
            format!("{}/api/environments/{}", self.url, self.environment)
        } else {
            format!("{}/api/environments/{}/{}", self.url, self.environment, path)
        };
        let request = self.http.request(method, url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl Environment for EnvironmentClient {
    async fn info(&self) -> Result<EnvironmentInfo> {
        let response = self.request(reqwest::Method::GET, "").send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::UnknownEnvironment(self.environment.clone()));
        }
        let response = check_status(response, "environment", Error::Environment).await?;
        let mut info: EnvironmentInfo = response.json().await?;
        info.location = info.location.to_uppercase();
        Ok(info)
    }

    async fn hosts_by_service(&self, service: &str) -> Result<Vec<String>> {
        let response = self
            .request(reqwest::Method::GET, &format!("services/{}/hosts", service))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = check_status(response, "environment", Error::Environment).await?;
        let mut hosts: Vec<String> = response.json().await?;
        hosts.sort();
        Ok(hosts)
    }

    async fn services(&self) -> Result<Vec<String>> {
        let response = self.request(reqwest::Method::GET, "services").send().await?;
        let response = check_status(response, "environment", Error::Environment).await?;
        Ok(response.json().await?)
    }

    async fn variable_matches(&self, name: &str, value: &str) -> Result<bool> {
        let response = self
            .request(reqwest::Method::GET, &format!("variables/{}", name))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let response = check_status(response, "environment", Error::Environment).await?;
        let current: VariableValue = response.json().await?;
        Ok(current.value == value)
    }

    async fn set_variable(&self, name: &str, value: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, &format!("variables/{}", name))
            .json(&json!({"value": value}))
            .send()
            .await?;
        check_status(response, "environment", Error::Environment).await?;
        info!(environment = %self.environment, variable = name, value, "variable set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::backend::http_client;

    async fn environment() -> (MockServer, EnvironmentClient) {
        let server = MockServer::start().await;
        let endpoint = ServiceEndpoint {
            url: server.uri(),
            token: None,
        };
        let http = http_client(std::time::Duration::from_secs(5), false).unwrap();
        (server, EnvironmentClient::new(http, &endpoint, "lab"))
    }

    #[tokio::test]
    async fn test_info_normalizes_location() {
        let (server, client) = environment().await;
        Mock::given(method("GET"))
            .and(path("/api/environments/lab"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "lab",
                "suffix": "lablemams",
                "domain": "example.net",
                "location": "ams02"
            })))
            .mount(&server)
            .await;

        let info = client.info().await.unwrap();
        assert_eq!(info.location, "AMS02");
        assert_eq!(info.suffix, "lablemams");
    }

    #[tokio::test]
    async fn test_unknown_environment() {
        let (server, client) = environment().await;
        Mock::given(method("GET"))
            .and(path("/api/environments/lab"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(matches!(client.info().await, Err(Error::UnknownEnvironment(name)) if name == "lab"));
    }

    #[tokio::test]
    async fn test_variables() {
        let (server, client) = environment().await;
        Mock::given(method("GET"))
            .and(path("/api/environments/lab/variables/PWR_API_HOST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": "api-otherenv.example.net"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/environments/lab/variables/MISSING"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/environments/lab/variables/PWR_API_HOST"))
            .and(body_json(json!({"value": ""})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        assert!(!client
            .variable_matches("PWR_API_HOST", "api-lablemams.example.net")
            .await
            .unwrap());
        assert!(client
            .variable_matches("PWR_API_HOST", "api-otherenv.example.net")
            .await
            .unwrap());
        assert!(!client.variable_matches("MISSING", "").await.unwrap());
        client.set_variable("PWR_API_HOST", "").await.unwrap();
    }

    #[tokio::test]
    async fn test_variable_read_during_outage_is_transient() {
        let (server, client) = environment().await;
        Mock::given(method("GET"))
            .and(path("/api/environments/lab/variables/PWR_API_HOST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client.variable_matches("PWR_API_HOST", "").await.unwrap_err();
        assert!(err.is_transient());
    }
}
