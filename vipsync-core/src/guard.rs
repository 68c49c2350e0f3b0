//! Reference-guarded deletes.
//!
//! A server or pool still pointed at by another balancer object is never
//! deleted; the refusal is logged and reported as `false`.

use tracing::{info, warn};

use crate::backend::{BackendResult, LoadBalancer};
use crate::error::Result;

pub async fn delete_server(lb: &dyn LoadBalancer, name: &str) -> Result<bool> {
    let references = lb.server_references(name).await?;
    if !references.is_empty() {
        warn!(server = name, referenced_by = ?references, "server still referenced, not deleting");
        return Ok(false);
    }
    let deleted = refused(lb.delete_server(name).await, "server", name)?;
    if deleted {
        info!(server = name, "deleted server");
    }
    Ok(deleted)
}

pub async fn delete_pool(lb: &dyn LoadBalancer, name: &str) -> Result<bool> {
    let references = lb.pool_references(name).await?;
    if !references.is_empty() {
        warn!(pool = name, referenced_by = ?references, "pool still referenced, not deleting");
        return Ok(false);
    }
    let deleted = refused(lb.delete_pool(name).await, "pool", name)?;
    if deleted {
        info!(pool = name, "deleted pool");
    }
    Ok(deleted)
}

/// Map a balancer refusal to `false`; transport and server errors propagate.
pub(crate) fn refused(result: BackendResult<bool>, object: &str, name: &str) -> Result<bool> {
    match result {
        Ok(done) => Ok(done),
        Err(e) if e.is_rejection() => {
            warn!(object, name, error = %e, "balancer refused");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Family, Listener, PoolMember, VirtualSpec};
    use crate::error::BackendError;
    use crate::test_util::MemoryBalancer;

    #[tokio::test]
    async fn test_referenced_pool_is_kept() {
        let lb = MemoryBalancer::new(Family::F5);
        lb.seed_server("gpr01", "10.61.1.11");
        lb.seed_pool("gpr_80", "tcp", &[PoolMember::new("gpr01", 80)]);
        lb.create_virtual(&VirtualSpec {
            name: "web_443".into(),
            address: "10.63.0.10".into(),
            listener: Some(Listener {
                port: 443,
                pool: "gpr_80".into(),
                profiles: vec![],
            }),
        })
        .await
        .unwrap();
        lb.clear_mutations();

        assert!(!delete_pool(&lb, "gpr_80").await.unwrap());
        assert!(!delete_server(&lb, "gpr01").await.unwrap());
        assert!(lb.mutations().is_empty());
        assert!(lb.pool("gpr_80").is_some());
    }

    #[tokio::test]
    async fn test_unreferenced_objects_are_deleted() {
        let lb = MemoryBalancer::new(Family::A10);
        lb.seed_server("pwr01", "10.61.0.11");

        assert!(delete_server(&lb, "pwr01").await.unwrap());
        assert!(!delete_server(&lb, "pwr01").await.unwrap());
        assert!(lb.server("pwr01").is_none());
    }

    #[test]
    fn test_refusals_become_false() {
        let rejected: BackendResult<bool> = Err(BackendError::Api {
            status: 400,
            message: "in use".into(),
        });
        assert!(!refused(rejected, "pool", "gpr_80").unwrap());

        let unavailable: BackendResult<bool> = Err(BackendError::Api {
            status: 502,
            message: "gateway".into(),
        });
        assert!(refused(unavailable, "pool", "gpr_80").is_err());
    }
}
