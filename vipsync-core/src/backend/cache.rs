//! Collection caches used for reference and by-address lookups.

use std::future::Future;

use tokio::sync::Mutex;

use super::{BackendResult, PoolRecord, ServerRecord, VirtualRecord};
use crate::resource::Memo;

/// Object types whose collections are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Server,
    Pool,
    Virtual,
}

/// A lazily fetched list, refetched after invalidation.
pub struct CachedList<T> {
    cell: Mutex<Memo<Vec<T>>>,
}

impl<T> Default for CachedList<T> {
    fn default() -> Self {
        Self {
            cell: Mutex::new(Memo::Empty),
        }
    }
}

impl<T: Clone> CachedList<T> {
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> BackendResult<Vec<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BackendResult<Vec<T>>>,
    {
        let mut cell = self.cell.lock().await;
        if let Some(items) = cell.get() {
            return Ok(items.clone());
        }
        let items = fetch().await?;
        cell.set(items.clone());
        Ok(items)
    }

    pub async fn invalidate(&self) {
        self.cell.lock().await.invalidate();
    }

    pub async fn is_cached(&self) -> bool {
        self.cell.lock().await.is_cached()
    }
}

/// Servers, pools and virtual servers of one balancer.
#[derive(Default)]
pub struct ObjectCache {
    pub servers: CachedList<ServerRecord>,
    pub pools: CachedList<PoolRecord>,
    pub virtuals: CachedList<VirtualRecord>,
}

impl ObjectCache {
    /// Called right after every mutating call on `object`.
    pub async fn invalidate(&self, object: ObjectType) {
        match object {
            ObjectType::Server => self.servers.invalidate().await,
            ObjectType::Pool => self.pools.invalidate().await,
            ObjectType::Virtual => self.virtuals.invalidate().await,
        }
    }
}
