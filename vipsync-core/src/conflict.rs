//! Server creation that recovers from stale colliding objects.
//!
//! A previous partial apply can leave a server behind under the wanted name
//! or holding the wanted address. The colliding server is accepted when it
//! already matches, otherwise deleted (reference-guarded) before a single
//! retry of the create.

use tracing::{info, warn};

use crate::backend::LoadBalancer;
use crate::error::{BackendError, ConflictKind, Result};
use crate::guard;

/// Create `name` at `address`, resolving name and address conflicts.
pub async fn create_server(lb: &dyn LoadBalancer, name: &str, address: &str) -> Result<bool> {
    match lb.create_server(name, address).await {
        Ok(()) => {
            info!(server = name, address, "created server");
            Ok(true)
        }
        Err(BackendError::Conflict { kind, message, .. }) => {
            warn!(server = name, address, conflict = %kind, message, "server create conflict");
            resolve(lb, kind, name, address).await
        }
        Err(e) if e.is_rejection() => {
            warn!(server = name, address, error = %e, "server create refused");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

async fn resolve(lb: &dyn LoadBalancer, kind: ConflictKind, name: &str, address: &str) -> Result<bool> {
    let by_name = match kind {
        ConflictKind::NameExists => lb.get_server(name).await?,
        ConflictKind::AddressInUse => None,
    };

    let blocker = match by_name {
        Some(existing) if existing.address == address => {
            info!(server = name, address, "server already exists with the wanted address");
            return Ok(true);
        }
        Some(existing) => existing.name,
        None => match lb.get_server_by_address(address).await? {
            Some(owner) if owner.name == name => return Ok(true),
            Some(owner) => owner.name,
            None => {
                warn!(server = name, address, conflict = %kind, "conflicting server not found");
                return Ok(false);
            }
        },
    };

    info!(server = name, address, blocker = %blocker, "removing conflicting server");
    if !guard::delete_server(lb, &blocker).await? {
        return Ok(false);
    }

    match lb.create_server(name, address).await {
        Ok(()) => {
            info!(server = name, address, "created server after resolving conflict");
            Ok(true)
        }
        Err(e) if e.is_rejection() => {
            warn!(server = name, address, error = %e, "server create failed again");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}
