//! Collaborators outside the balancers: DNS registry and resolver,
//! inventory and environment configuration.
//!
//! The engine only sees the traits; the HTTP clients here are the
//! production implementations and `test_util` carries in-memory fakes.

pub mod dns;
pub mod environment;
pub mod inventory;

use std::sync::Arc;
use std::time::Duration;

use crate::backend::http_client;
use crate::config::Settings;
use crate::error::{Error, Result};

pub use dns::{DnsApiClient, DnsRecords, DnsRegistry, DohResolver, RecordType, Resolver};
pub use environment::{Environment, EnvironmentClient, EnvironmentInfo};
pub use inventory::{Interface, Inventory, InventoryClient, Reservation};

/// Handles to every collaborator, shared by all nodes of a run.
#[derive(Clone)]
pub struct Services {
    pub dns: Arc<dyn DnsRegistry>,
    pub resolver: Arc<dyn Resolver>,
    pub inventory: Arc<dyn Inventory>,
    pub environment: Arc<dyn Environment>,
}

impl Services {
    /// HTTP clients for `environment`, configured from settings.
    pub fn connect(settings: &Settings, environment: &str) -> Result<Self> {
        let http = http_client(
            Duration::from_secs(settings.request_timeout_secs),
            settings.accept_invalid_certs,
        )?;
        Ok(Self {
            dns: Arc::new(DnsApiClient::new(http.clone(), &settings.dns)),
            resolver: Arc::new(DohResolver::new(http.clone(), &settings.resolver)),
            inventory: Arc::new(InventoryClient::new(http.clone(), &settings.inventory)),
            environment: Arc::new(EnvironmentClient::new(http, &settings.environment, environment)),
        })
    }
}

/// Pass successful responses through. Server-side failures become
/// [`Error::Unavailable`] (retried where retries apply), anything else is
/// wrapped with `failure`.
pub(crate) async fn check_status(
    response: reqwest::Response,
    what: &str,
    failure: fn(String) -> Error,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{} returned {}: {}", what, status, body.trim());
    if status.is_server_error() {
        Err(Error::Unavailable(message))
    } else {
        Err(failure(message))
    }
}
