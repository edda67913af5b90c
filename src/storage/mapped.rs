//! Memory-mapped file storage: one mapped region covering the backing
//! file, grown by remapping when the file is extended.
//!
//! Per the data model, this variant is **not internally thread-safe** on
//! its own — callers that need concurrent access must wrap it in
//! [`crate::storage::proxy::ThreadSafeStorage`]. Content access is guarded
//! by a single mutex around the map, which is what makes that true: two
//! threads can both safely call into this backend, but they do not make
//! progress in parallel the way the memory or direct-file backends do.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use memmap2::{MmapMut, MmapOptions};

use crate::endpoint::{bounds_check, Endpoint};
use crate::error::{PagewalError, Result};
use crate::storage::{StateCell, Storage, StorageKind};
use crate::PAGE_SIZE;

struct MapGuts {
    file: File,
    map: MmapMut,
}

/// Backing storage over a single memory-mapped file.
pub struct MappedStorage {
    inner: Arc<Mutex<MapGuts>>,
    size: AtomicU64,
    state: StateCell,
    writable: bool,
}

impl MappedStorage {
    /// Open `path`, taking an advisory exclusive lock for a writable
    /// storage or a shared lock for a read-only one. The lock is released
    /// when the file handle is dropped.
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        use fs4::fs_std::FileExt;

        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .truncate(false)
            .open(path)?;
        if writable {
            file.try_lock_exclusive()?;
        } else {
            file.try_lock_shared()?;
        }
        Self::from_file(file, writable)
    }

    pub fn from_file(file: File, writable: bool) -> Result<Self> {
        if PAGE_SIZE % page_size::get() != 0 {
            log::warn!(
                "PAGE_SIZE ({PAGE_SIZE}) is not a multiple of the OS page size ({}); \
                 mmap remapping may be less efficient",
                page_size::get()
            );
        }
        let len = file.metadata()?.len();
        let map = if len == 0 {
            // `memmap2` cannot map a zero-length file; start with an empty
            // placeholder map that gets replaced on the first `extend_to`.
            unsafe { MmapOptions::new().len(1).map_mut(&file)? }
        } else {
            unsafe { MmapOptions::new().map_mut(&file)? }
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(MapGuts { file, map })),
            size: AtomicU64::new(len),
            state: StateCell::new(),
            writable,
        })
    }

    /// Open `path`, then ensure `options.initial_size` bytes are
    /// preallocated if the file was freshly created.
    pub fn open_with_options<P: AsRef<Path>>(
        path: P,
        writable: bool,
        options: &crate::wal::StorageOptions,
    ) -> Result<Self> {
        let storage = Self::open(path, writable)?;
        storage.extend_to(options.initial_size)?;
        Ok(storage)
    }

    fn remap(guts: &mut MapGuts, new_len: u64) -> Result<()> {
        guts.file.set_len(new_len)?;
        let map = unsafe { MmapOptions::new().len(new_len as usize).map_mut(&guts.file)? };
        guts.map = map;
        Ok(())
    }
}

struct MappedEndpoint {
    inner: Arc<Mutex<MapGuts>>,
    base: u64,
    region_len: usize,
}

impl Endpoint for MappedEndpoint {
    fn base_offset(&self) -> u64 {
        self.base
    }

    fn region_len(&self) -> usize {
        self.region_len
    }

    fn read_bytes(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let local = bounds_check(self.base, self.region_len, pos, buf.len())?;
        let guts = self.inner.lock().unwrap();
        let start = self.base as usize + local;
        buf.copy_from_slice(&guts.map[start..start + buf.len()]);
        Ok(())
    }

    fn write_bytes(&self, pos: u64, data: &[u8]) -> Result<()> {
        let local = bounds_check(self.base, self.region_len, pos, data.len())?;
        let mut guts = self.inner.lock().unwrap();
        let start = self.base as usize + local;
        guts.map[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Storage for MappedStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::MappedFile
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn flush(&self) -> Result<()> {
        self.state.check_open()?;
        let guts = self.inner.lock().unwrap();
        guts.map.flush()?;
        Ok(())
    }

    fn acquire_endpoint_at(&self, offset: u64) -> Result<Box<dyn Endpoint>> {
        self.state.check_open()?;
        let size = self.size();
        if offset >= size {
            return Err(PagewalError::OutOfBounds {
                offset,
                len: 0,
                size,
            });
        }
        let base = crate::page_floor(offset);
        Ok(Box::new(MappedEndpoint {
            inner: self.inner.clone(),
            base,
            region_len: PAGE_SIZE,
        }))
    }

    fn truncate(&self, length: u64) -> Result<bool> {
        self.state.begin_busy()?;
        let result = (|| {
            let size = self.size();
            if length >= size {
                return Ok(false);
            }
            let mut guts = self.inner.lock().unwrap();
            if length > 0 {
                let tail_local = crate::page_local(length);
                if tail_local != 0 {
                    let start = length as usize;
                    let page_end = (crate::page_floor(length) as usize + PAGE_SIZE).min(size as usize);
                    guts.map[start..page_end].fill(0);
                }
            }
            Self::remap(&mut guts, length.max(1))?;
            self.size.store(length, Ordering::Release);
            Ok(true)
        })();
        self.state.end_busy();
        result
    }

    fn cut(&self, from: u64, to: u64) -> Result<bool> {
        if from > to {
            return Err(PagewalError::OutOfBounds {
                offset: from,
                len: 0,
                size: to,
            });
        }
        if from == to {
            self.state.check_open()?;
            return Ok(false);
        }
        self.state.begin_busy()?;
        let result = (|| {
            let size = self.size();
            let zero_to = to.min(size);
            if from < zero_to {
                let mut guts = self.inner.lock().unwrap();
                guts.map[from as usize..zero_to as usize].fill(0);
            }
            if to >= size {
                let mut guts = self.inner.lock().unwrap();
                Self::remap(&mut guts, from.max(1))?;
                self.size.store(from, Ordering::Release);
            }
            Ok(true)
        })();
        self.state.end_busy();
        result
    }

    fn extend_to(&self, length: u64) -> Result<bool> {
        self.state.begin_busy()?;
        let result = (|| {
            let size = self.size();
            if length <= size {
                return Ok(false);
            }
            let mut guts = self.inner.lock().unwrap();
            Self::remap(&mut guts, length)?;
            self.size.store(length, Ordering::Release);
            Ok(true)
        })();
        self.state.end_busy();
        result
    }

    fn close(&self) -> Result<()> {
        self.state.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapped.bin");
        let storage = MappedStorage::open(&path, true).unwrap();
        assert!(storage.extend_to(PAGE_SIZE as u64).unwrap());
        let ep = storage.acquire_endpoint_at(0).unwrap();
        ep.write_u64(0, 0x1122_3344_5566_7788).unwrap();
        storage.flush().unwrap();
        drop(ep);
        drop(storage);

        let reopened = MappedStorage::open(&path, true).unwrap();
        assert_eq!(reopened.size(), PAGE_SIZE as u64);
        let ep = reopened.acquire_endpoint_at(0).unwrap();
        assert_eq!(ep.read_u64(0).unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn open_with_options_preallocates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opts.bin");
        let options = crate::wal::StorageOptions::new().initial_size(PAGE_SIZE as u64);
        let storage = MappedStorage::open_with_options(&path, true, &options).unwrap();
        assert_eq!(storage.size(), PAGE_SIZE as u64);
    }
}
