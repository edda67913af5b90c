//! In-memory backing storage: a dynamic array of lazily materialized page
//! buffers.

use std::sync::{Arc, Mutex, RwLock};

use crate::endpoint::{bounds_check, Endpoint};
use crate::error::{PagewalError, Result};
use crate::storage::{StateCell, Storage, StorageKind};
use crate::PAGE_SIZE;

type PageBuf = Arc<RwLock<Box<[u8]>>>;

struct Inner {
    /// One slot per page. `None` is an implicit zero page, materialized on
    /// first write.
    pages: Vec<Option<PageBuf>>,
    size: u64,
}

impl Inner {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn ensure_page(&mut self, index: usize) -> PageBuf {
        if index >= self.pages.len() {
            self.pages.resize(index + 1, None);
        }
        self.pages[index]
            .get_or_insert_with(|| Arc::new(RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice())))
            .clone()
    }
}

/// A backing storage held entirely in memory. Not durable: `flush` is a
/// no-op.
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    state: StateCell,
    writable: bool,
}

impl MemoryStorage {
    pub fn new(writable: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pages: Vec::new(),
                size: 0,
            }),
            state: StateCell::new(),
            writable,
        }
    }

    pub fn with_initial_size(writable: bool, size: u64) -> Self {
        let storage = Self::new(writable);
        let _ = storage.extend_to(size);
        storage
    }

    /// Construct with `options.initial_size` preallocated.
    pub fn with_options(options: &crate::wal::StorageOptions, writable: bool) -> Self {
        Self::with_initial_size(writable, options.initial_size)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(true)
    }
}

struct MemoryEndpoint {
    page: PageBuf,
    base: u64,
}

impl Endpoint for MemoryEndpoint {
    fn base_offset(&self) -> u64 {
        self.base
    }

    fn region_len(&self) -> usize {
        PAGE_SIZE
    }

    fn read_bytes(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let local = bounds_check(self.base, PAGE_SIZE, pos, buf.len())?;
        let page = self.page.read().unwrap();
        buf.copy_from_slice(&page[local..local + buf.len()]);
        Ok(())
    }

    fn write_bytes(&self, pos: u64, data: &[u8]) -> Result<()> {
        let local = bounds_check(self.base, PAGE_SIZE, pos, data.len())?;
        let mut page = self.page.write().unwrap();
        page[local..local + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn size(&self) -> u64 {
        self.inner.lock().unwrap().size
    }

    fn flush(&self) -> Result<()> {
        self.state.check_open()?;
        Ok(())
    }

    fn acquire_endpoint_at(&self, offset: u64) -> Result<Box<dyn Endpoint>> {
        self.state.check_open()?;
        let base = crate::page_floor(offset);
        let index = (base / PAGE_SIZE as u64) as usize;
        let mut inner = self.inner.lock().unwrap();
        if offset >= inner.size {
            return Err(PagewalError::OutOfBounds {
                offset,
                len: 0,
                size: inner.size,
            });
        }
        let page = inner.ensure_page(index);
        Ok(Box::new(MemoryEndpoint { page, base }))
    }

    fn truncate(&self, length: u64) -> Result<bool> {
        self.state.check_open()?;
        let mut inner = self.inner.lock().unwrap();
        if length >= inner.size {
            return Ok(false);
        }
        let changed = length < inner.size;
        let last_index = if length == 0 {
            0
        } else {
            ((length - 1) / PAGE_SIZE as u64) as usize + 1
        };
        // Zero the partial tail page, if any.
        if length > 0 {
            let tail_local = crate::page_local(length);
            if tail_local != 0 {
                let tail_index = ((length - 1) / PAGE_SIZE as u64) as usize;
                if let Some(Some(page)) = inner.pages.get(tail_index) {
                    let mut page = page.write().unwrap();
                    page[tail_local..].fill(0);
                }
            }
        }
        if last_index < inner.page_count() {
            inner.pages.truncate(last_index);
        }
        inner.size = length;
        Ok(changed)
    }

    fn cut(&self, from: u64, to: u64) -> Result<bool> {
        self.state.check_open()?;
        if from > to {
            return Err(PagewalError::OutOfBounds {
                offset: from,
                len: 0,
                size: to,
            });
        }
        if from == to {
            return Ok(false);
        }
        let mut inner = self.inner.lock().unwrap();
        let size = inner.size;
        let zero_to = to.min(size);
        if from < zero_to {
            let mut pos = from;
            while pos < zero_to {
                let index = (pos / PAGE_SIZE as u64) as usize;
                let page_start = crate::page_floor(pos);
                let local = (pos - page_start) as usize;
                let end = ((zero_to - page_start).min(PAGE_SIZE as u64)) as usize;
                if let Some(Some(page)) = inner.pages.get(index) {
                    let mut page = page.write().unwrap();
                    page[local..end].fill(0);
                }
                pos = page_start + end as u64;
            }
        }
        if to >= size {
            drop(inner);
            return self.truncate(from);
        }
        Ok(true)
    }

    fn extend_to(&self, length: u64) -> Result<bool> {
        self.state.check_open()?;
        let mut inner = self.inner.lock().unwrap();
        if length <= inner.size {
            return Ok(false);
        }
        inner.size = length;
        Ok(true)
    }

    fn close(&self) -> Result<()> {
        self.state.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip() {
        let storage = MemoryStorage::new(true);
        storage.extend_to(PAGE_SIZE as u64).unwrap();
        let ep = storage.acquire_endpoint_at(10).unwrap();
        ep.write_u32(10, 0xdead_beef).unwrap();
        assert_eq!(ep.read_u32(10).unwrap(), 0xdead_beef);
    }

    #[test]
    fn extend_to_zero_is_noop() {
        let storage = MemoryStorage::new(true);
        assert!(!storage.extend_to(0).unwrap());
        assert_eq!(storage.size(), 0);
    }

    #[test]
    fn cut_equal_bounds_returns_false() {
        let storage = MemoryStorage::new(true);
        storage.extend_to(100).unwrap();
        assert!(!storage.cut(10, 10).unwrap());
    }

    #[test]
    fn cut_whole_range_shrinks_to_zero() {
        let storage = MemoryStorage::new(true);
        storage.extend_to(100).unwrap();
        assert!(storage.cut(0, 100).unwrap());
        assert_eq!(storage.size(), 0);
    }

    #[test]
    fn boundary_write_touches_one_or_two_pages() {
        let storage = MemoryStorage::new(true);
        storage.extend_to(2 * PAGE_SIZE as u64).unwrap();
        let ep = storage
            .acquire_endpoint_at(PAGE_SIZE as u64 - 1)
            .unwrap();
        assert_eq!(ep.base_offset(), 0);
        ep.write_u8(PAGE_SIZE as u64 - 1, 7).unwrap();
        assert_eq!(ep.read_u8(PAGE_SIZE as u64 - 1).unwrap(), 7);
    }

    #[test]
    fn closed_storage_rejects_access() {
        let storage = MemoryStorage::new(true);
        storage.extend_to(PAGE_SIZE as u64).unwrap();
        storage.close().unwrap();
        assert!(storage.acquire_endpoint_at(0).is_err());
        assert!(storage.close().is_err());
    }

    #[test]
    fn with_options_preallocates() {
        let options = crate::wal::StorageOptions::new().initial_size(PAGE_SIZE as u64);
        let storage = MemoryStorage::with_options(&options, true);
        assert_eq!(storage.size(), PAGE_SIZE as u64);
    }
}
