//! Test utilities: an in-memory balancer, fake collaborators and a lab
//! environment wiring them together.

pub mod balancer;
pub mod services;

pub use balancer::MemoryBalancer;
pub use services::{lab_environment, FakeDns, FakeEnvironment, FakeInventory, Harness, StaleResolver};

use crate::tree::{Endpoint, Endpoints, PRIMARY_INTERFACE};

/// Endpoints for `(host, ip)` pairs, each with only its primary interface.
pub fn endpoints(hosts: &[(&str, &str)]) -> Endpoints {
    hosts
        .iter()
        .map(|(host, ip)| {
            (
                host.to_string(),
                Endpoint {
                    ip: ip.to_string(),
                    interfaces: vec![(PRIMARY_INTERFACE.to_string(), ip.to_string())],
                },
            )
        })
        .collect()
}
