//! A thin proxy that routes all storage access through an internal
//! [`AccessManager`], so any backend can be shared safely by concurrent
//! callers.

use std::sync::Arc;

use crate::access::{Access, AccessManager};
use crate::endpoint::Endpoint;
use crate::error::{PagewalError, Result};
use crate::storage::{Storage, StorageKind};

/// Wraps any [`Storage`] backend and arbitrates concurrent callers through
/// an [`AccessManager`]. `acquire_endpoint_at`/`release_endpoint` are
/// disallowed here — callers must go through [`ThreadSafeStorage::access`]
/// instead, which is the only way to obtain bounded, disjoint-checked I/O
/// on the proxy.
pub struct ThreadSafeStorage {
    backend: Arc<dyn Storage>,
    manager: Arc<AccessManager>,
}

impl ThreadSafeStorage {
    pub fn new(backend: Arc<dyn Storage>) -> Self {
        let manager = Arc::new(AccessManager::new(backend.clone()));
        Self { backend, manager }
    }

    /// Request a scoped, range-arbitrated access over this storage.
    pub fn access(&self, offset: u64, length: u64, writable: bool) -> Result<Access> {
        self.manager.access(offset, length, writable)
    }
}

impl Storage for ThreadSafeStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::ThreadSafeProxy
    }

    fn is_writable(&self) -> bool {
        self.backend.is_writable()
    }

    fn size(&self) -> u64 {
        self.backend.size()
    }

    fn flush(&self) -> Result<()> {
        self.backend.flush()
    }

    fn acquire_endpoint_at(&self, _offset: u64) -> Result<Box<dyn Endpoint>> {
        Err(PagewalError::InvalidState(
            "ThreadSafeStorage requires callers to go through access(), not acquire_endpoint_at",
        ))
    }

    fn release_endpoint(&self, _endpoint: Box<dyn Endpoint>) {
        log::warn!("release_endpoint called on a ThreadSafeStorage proxy; this is a no-op");
    }

    fn truncate(&self, length: u64) -> Result<bool> {
        self.backend.truncate(length)
    }

    fn cut(&self, from: u64, to: u64) -> Result<bool> {
        self.backend.cut(from, to)
    }

    fn extend_to(&self, length: u64) -> Result<bool> {
        self.backend.extend_to(length)
    }

    fn close(&self) -> Result<()> {
        self.manager.close();
        self.backend.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn acquire_endpoint_is_disallowed() {
        let proxy = ThreadSafeStorage::new(Arc::new(MemoryStorage::new(true)));
        assert!(proxy.acquire_endpoint_at(0).is_err());
    }

    #[test]
    fn access_delegates_to_backend() {
        let proxy = ThreadSafeStorage::new(Arc::new(MemoryStorage::new(true)));
        proxy.extend_to(crate::PAGE_SIZE as u64).unwrap();
        let access = proxy.access(0, 4, true).unwrap();
        access.write_u32(0, 99).unwrap();
        assert_eq!(access.read_u32(0).unwrap(), 99);
    }
}
