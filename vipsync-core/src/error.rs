//! Error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::backend::Family;

/// How a balancer refused to create an object that collides with an
/// existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// An object with the same name already exists.
    NameExists,
    /// A differently named object already holds the address.
    AddressInUse,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::NameExists => write!(f, "name exists"),
            ConflictKind::AddressInUse => write!(f, "address in use"),
        }
    }
}

/// Errors reported by a balancer adapter.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Create collided with an existing object.
    #[error("{kind} conflict on {object}: {message}")]
    Conflict {
        kind: ConflictKind,
        object: String,
        message: String,
    },

    /// Operation does not exist for this balancer family.
    #[error("{operation} is not supported by {family} balancers")]
    Unsupported {
        family: Family,
        operation: &'static str,
    },

    /// The balancer answered with an error status.
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Transport failure.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// The balancer answered with something we could not interpret.
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Refusals are reported as a `false` outcome instead of aborting the
    /// entrypoint.
    pub fn is_rejection(&self) -> bool {
        match self {
            BackendError::Conflict { .. } | BackendError::Unsupported { .. } => true,
            BackendError::Api { status, .. } => *status < 500,
            BackendError::Http(_) | BackendError::Decode(_) => false,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Api { status, .. } => *status >= 500,
            BackendError::Http(e) => http_is_transient(e),
            _ => false,
        }
    }
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error("no balancers configured for location {0}")]
    NoBalancers(String),

    #[error("no {family} balancer configured for location {location}")]
    NoBalancerMapping { location: String, family: Family },

    #[error("no owning service for entrypoint {0}")]
    NoOwningService(String),

    #[error("unknown entrypoint: {0}")]
    UnknownEntrypoint(String),

    #[error("'{entrypoint}' - entrypoint group '{service}' is not valid, see logs")]
    InvalidGroup { service: String, entrypoint: String },

    #[error("no hosts found for service {0}")]
    NoEndpoints(String),

    #[error("backend: {0}")]
    Backend(#[from] BackendError),

    #[error("dns: {0}")]
    Dns(String),

    #[error("inventory: {0}")]
    Inventory(String),

    #[error("environment: {0}")]
    Environment(String),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// A collaborator answered with a server-side error.
    #[error("{0} unavailable")]
    Unavailable(String),

    #[error("{operation} did not finish within {after:?}")]
    Deadline { operation: String, after: Duration },

    #[error("config: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Network and server-side failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Backend(e) => e.is_transient(),
            Error::Http(e) => http_is_transient(e),
            Error::Unavailable(_) => true,
            _ => false,
        }
    }

    /// Setup errors that abort the whole invocation rather than a single
    /// entrypoint.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnknownEnvironment(_)
                | Error::NoBalancers(_)
                | Error::NoBalancerMapping { .. }
                | Error::NoOwningService(_)
                | Error::Config(_)
        )
    }
}

fn http_is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout()
        || e.is_connect()
        || e.status().is_some_and(|status| status.is_server_error())
}

/// Result type for vipsync operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_are_client_side() {
        let conflict = BackendError::Conflict {
            kind: ConflictKind::NameExists,
            object: "pool".into(),
            message: "exists".into(),
        };
        assert!(conflict.is_rejection());
        assert!(!conflict.is_transient());

        let bad_request = BackendError::Api {
            status: 400,
            message: "bad".into(),
        };
        assert!(bad_request.is_rejection());

        let unavailable = BackendError::Api {
            status: 503,
            message: "busy".into(),
        };
        assert!(!unavailable.is_rejection());
        assert!(Error::from(unavailable).is_transient());
    }

    #[test]
    fn test_setup_errors_are_fatal() {
        assert!(Error::UnknownEnvironment("lab".into()).is_fatal());
        assert!(Error::NoBalancerMapping {
            location: "AMS02".into(),
            family: Family::F5,
        }
        .is_fatal());
        assert!(Error::NoOwningService("ghost".into()).is_fatal());
        assert!(!Error::NoEndpoints("pwr".into()).is_fatal());
        assert!(!Error::Dns("timeout".into()).is_transient());
    }
}
