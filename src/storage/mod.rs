//! Backing storage: a byte-addressable, growable, flush-capable surface
//! partitioned into fixed-size pages.
//!
//! Four variants are provided, all implementing the same [`Storage`]
//! trait: [`memory::MemoryStorage`], [`direct::DirectFileStorage`],
//! [`mapped::MappedStorage`] and [`split::SplitStorage`]. A fifth,
//! [`proxy::ThreadSafeStorage`], wraps any of the above with a
//! [`crate::access::AccessManager`] so that disjoint readers and writers can
//! share one storage without page-level locking.
//!
//! Dispatch between variants is never on type identity — callers hold a
//! `dyn Storage` and never need to know which backend they have.

pub mod direct;
pub mod mapped;
pub mod memory;
pub mod proxy;
pub mod split;

use std::sync::atomic::{AtomicU8, Ordering};

use crate::endpoint::Endpoint;
use crate::error::{PagewalError, Result};

pub use direct::DirectFileStorage;
pub use mapped::MappedStorage;
pub use memory::MemoryStorage;
pub use proxy::ThreadSafeStorage;
pub use split::SplitStorage;

/// Named identifier for a [`Storage`] variant, used only for diagnostics
/// and logging — never for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    DirectFile,
    MappedFile,
    Split,
    ThreadSafeProxy,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StorageKind::Memory => "memory",
            StorageKind::DirectFile => "direct-file",
            StorageKind::MappedFile => "mapped-file",
            StorageKind::Split => "split",
            StorageKind::ThreadSafeProxy => "thread-safe-proxy",
        };
        f.write_str(s)
    }
}

/// A byte-addressable, growable, flush-capable backing surface partitioned
/// into fixed-size pages.
///
/// Size only grows through writes (`extend_to`) or, for direct/mapped
/// variants, the file's own growth; it never shrinks except via
/// [`Storage::truncate`] or [`Storage::cut`]. `Closed` is a terminal state.
pub trait Storage: Send + Sync {
    /// Which concrete backend this is, for diagnostics only.
    fn kind(&self) -> StorageKind;

    fn is_writable(&self) -> bool;

    /// Current logical size in bytes.
    fn size(&self) -> u64;

    /// Persist durably to the underlying medium.
    fn flush(&self) -> Result<()>;

    /// Get an [`Endpoint`] for the page containing `offset`.
    fn acquire_endpoint_at(&self, offset: u64) -> Result<Box<dyn Endpoint>>;

    /// Release a previously acquired endpoint. Rust's ownership already
    /// drops the endpoint's resources when it goes out of scope, so the
    /// default implementation is just that drop; backends that pool
    /// endpoints can override it.
    fn release_endpoint(&self, endpoint: Box<dyn Endpoint>) {
        drop(endpoint);
    }

    /// Drop all bytes at or beyond `length`, zeroing a partial tail page.
    /// Returns `true` iff the size changed.
    fn truncate(&self, length: u64) -> Result<bool>;

    /// Zero the range `[from, to)`. If `to >= size()`, also shortens the
    /// size to `from`. A zero-length range is a no-op. Errors if
    /// `from > to`.
    fn cut(&self, from: u64, to: u64) -> Result<bool>;

    /// Ensure `size() >= length` without writing any data. Returns `true`
    /// iff the size increased.
    fn extend_to(&self, length: u64) -> Result<bool>;

    /// Close the storage. Idempotent from the caller's perspective only via
    /// state inspection — calling `close` again is a diagnostic error.
    fn close(&self) -> Result<()>;
}

/// `Ready -> Busy` while a mutation is in flight, `Busy -> Ready` on
/// completion, and either may transition to the terminal `Closed`.
/// Concurrent callers spin on an atomic compare-and-swap to acquire `Busy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum StorageState {
    Ready = 0,
    Busy = 1,
    Closed = 2,
}

/// Atomic holder for a [`StorageState`], shared by the memory and direct
/// file backends.
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(StorageState::Ready as u8))
    }

    fn load(&self) -> StorageState {
        match self.0.load(Ordering::Acquire) {
            0 => StorageState::Ready,
            1 => StorageState::Busy,
            _ => StorageState::Closed,
        }
    }

    /// Spin until `Ready` is observed and atomically claim `Busy`, or
    /// return `StorageClosed` if the storage has been closed.
    pub(crate) fn begin_busy(&self) -> Result<()> {
        loop {
            match self.0.compare_exchange_weak(
                StorageState::Ready as u8,
                StorageState::Busy as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) if observed == StorageState::Closed as u8 => {
                    return Err(PagewalError::StorageClosed)
                }
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    pub(crate) fn end_busy(&self) {
        let _ = self.0.compare_exchange(
            StorageState::Busy as u8,
            StorageState::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.load() == StorageState::Closed {
            Err(PagewalError::StorageClosed)
        } else {
            Ok(())
        }
    }

    /// Transition to `Closed`. Errors with `InvalidState` if already
    /// closed — closing twice is a diagnostic error, not a silent no-op.
    pub(crate) fn close(&self) -> Result<()> {
        loop {
            let observed = self.0.load(Ordering::Acquire);
            if observed == StorageState::Closed as u8 {
                return Err(PagewalError::InvalidState("storage already closed"));
            }
            if self
                .0
                .compare_exchange_weak(
                    observed,
                    StorageState::Closed as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(());
            }
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_cell_lifecycle() {
        let cell = StateCell::new();
        cell.begin_busy().unwrap();
        cell.end_busy();
        cell.close().unwrap();
        assert!(cell.begin_busy().is_err());
        assert!(cell.close().is_err());
    }
}
