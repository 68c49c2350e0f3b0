//! vipsync-core: reconciliation engine for load balancer entrypoints.
//!
//! An entrypoint is a named ingress (for example `api`) that owns a DNS
//! record, inventory interfaces on its member hosts and one or more virtual
//! servers on an A10 or F5 balancer. This crate:
//! - Derives the desired state ("plan") of every object from static config
//!   and the environment's hosts
//! - Observes the current state from DNS, inventory and the balancers
//! - Applies the minimal create/delete operations to converge, children and
//!   parents in dependency order
//! - Reports a nested per-object outcome tree

pub mod backend;
pub mod config;
pub mod conflict;
pub mod diff;
pub mod error;
pub mod guard;
pub mod manager;
pub mod report;
pub mod resource;
pub mod retry;
pub mod services;
pub mod snapshot;
pub mod test_util;
pub mod tree;

pub use backend::{Balancers, Family, LoadBalancer};
pub use config::{Settings, StaticConfig};
pub use error::{BackendError, ConflictKind, Error, Result};
pub use manager::{EntrypointManager, ManagerOptions, RunSummary};
pub use report::{Action, Inspection, Outcome};
pub use services::Services;
