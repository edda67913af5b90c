//! Split multi-file storage: a logical storage composed of `N` files
//! `<prefix>N<suffix>`, each at most `max_size` bytes.
//!
//! An endpoint at offset `o` selects file `o / max_size` and sub-offset
//! `o mod max_size`. Opening enumerates matching files in numeric order.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::endpoint::{bounds_check, Endpoint};
use crate::error::{PagewalError, Result};
use crate::storage::direct::DirectFileStorage;
use crate::storage::{StateCell, Storage, StorageKind};
use crate::PAGE_SIZE;

/// Backing storage spread across a numbered sequence of files, none larger
/// than `max_size` bytes.
pub struct SplitStorage {
    dir: PathBuf,
    prefix: String,
    suffix: String,
    max_size: u64,
    segments: RwLock<Vec<Arc<DirectFileStorage>>>,
    writable: bool,
    state: StateCell,
}

fn segment_path(dir: &Path, prefix: &str, suffix: &str, n: usize) -> PathBuf {
    dir.join(format!("{prefix}{n}{suffix}"))
}

/// Parse the numeric infix out of a `<prefix>N<suffix>` file name.
fn parse_segment_index(name: &str, prefix: &str, suffix: &str) -> Option<usize> {
    let rest = name.strip_prefix(prefix)?;
    let digits = rest.strip_suffix(suffix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

impl SplitStorage {
    pub fn open<P: AsRef<Path>>(
        dir: P,
        prefix: &str,
        suffix: &str,
        max_size: u64,
        writable: bool,
    ) -> Result<Self> {
        assert!(max_size as usize % PAGE_SIZE == 0, "max_size must be page-aligned");
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut indices = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(idx) = parse_segment_index(name, prefix, suffix) {
                    indices.push(idx);
                }
            }
        }
        indices.sort_unstable();
        for (expected, found) in indices.iter().enumerate() {
            if expected != *found {
                return Err(PagewalError::Corruption(
                    "split storage segment files are not numbered contiguously from 0",
                ));
            }
        }

        let mut segments = Vec::with_capacity(indices.len());
        for idx in &indices {
            let path = segment_path(&dir, prefix, suffix, *idx);
            segments.push(Arc::new(DirectFileStorage::open(path, writable)?));
        }
        if segments.is_empty() {
            let path = segment_path(&dir, prefix, suffix, 0);
            segments.push(Arc::new(DirectFileStorage::open(path, writable)?));
        }

        Ok(Self {
            dir,
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            max_size,
            segments: RwLock::new(segments),
            writable,
            state: StateCell::new(),
        })
    }

    /// Open using `options.max_segment_size` as the per-segment cap and
    /// `options.initial_size` as the amount to preallocate.
    pub fn open_with_options<P: AsRef<Path>>(
        dir: P,
        prefix: &str,
        suffix: &str,
        writable: bool,
        options: &crate::wal::StorageOptions,
    ) -> Result<Self> {
        let storage = Self::open(dir, prefix, suffix, options.max_segment_size, writable)?;
        storage.extend_to(options.initial_size)?;
        Ok(storage)
    }

    fn segment_and_local(&self, offset: u64) -> (usize, u64) {
        ((offset / self.max_size) as usize, offset % self.max_size)
    }
}

struct SplitEndpoint {
    inner: Box<dyn Endpoint>,
    absolute_base: u64,
}

impl Endpoint for SplitEndpoint {
    fn base_offset(&self) -> u64 {
        self.absolute_base
    }

    fn region_len(&self) -> usize {
        self.inner.region_len()
    }

    fn read_bytes(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        bounds_check(self.absolute_base, self.region_len(), pos, buf.len())?;
        let local_pos = pos - self.absolute_base + self.inner.base_offset();
        self.inner.read_bytes(local_pos, buf)
    }

    fn write_bytes(&self, pos: u64, data: &[u8]) -> Result<()> {
        bounds_check(self.absolute_base, self.region_len(), pos, data.len())?;
        let local_pos = pos - self.absolute_base + self.inner.base_offset();
        self.inner.write_bytes(local_pos, data)
    }
}

impl Storage for SplitStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Split
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn size(&self) -> u64 {
        let segments = self.segments.read().unwrap();
        if segments.is_empty() {
            return 0;
        }
        let full = (segments.len() as u64 - 1) * self.max_size;
        full + segments.last().unwrap().size()
    }

    fn flush(&self) -> Result<()> {
        self.state.check_open()?;
        for segment in self.segments.read().unwrap().iter() {
            segment.flush()?;
        }
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
        let (index, local) = self.segment_and_local(offset);
        let segments = self.segments.read().unwrap();
        let segment = segments
            .get(index)
            .ok_or(PagewalError::OutOfBounds { offset, len: 0, size })?
            .clone();
        let inner = segment.acquire_endpoint_at(local)?;
        let absolute_base = index as u64 * self.max_size + inner.base_offset();
        Ok(Box::new(SplitEndpoint { inner, absolute_base }))
    }

    fn truncate(&self, length: u64) -> Result<bool> {
        self.state.begin_busy()?;
        let result = (|| {
            let size = self.size();
            if length >= size {
                return Ok(false);
            }
            let mut segments = self.segments.write().unwrap();
            let (keep_index, local_len) = self.segment_and_local(length);
            let keep_to = if local_len == 0 && length > 0 {
                keep_index
            } else {
                keep_index + 1
            };
            for segment in segments.drain(keep_to..) {
                segment.truncate(0)?;
            }
            if let Some(last) = segments.last() {
                last.truncate(local_len)?;
            }
            if segments.is_empty() {
                let path = segment_path(&self.dir, &self.prefix, &self.suffix, 0);
                segments.push(Arc::new(DirectFileStorage::open(path, self.writable)?));
            }
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
            let mut pos = from;
            let segments = self.segments.read().unwrap();
            while pos < zero_to {
                let (index, local) = self.segment_and_local(pos);
                let seg_end = (pos / self.max_size + 1) * self.max_size;
                let end = zero_to.min(seg_end);
                let local_end = local + (end - pos);
                segments[index].cut(local, local_end)?;
                pos = end;
            }
            drop(segments);
            if to >= size {
                return self
                    .truncate_unlocked(from)
                    .map(|_| true);
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
            let mut segments = self.segments.write().unwrap();
            if let Some(last) = segments.last() {
                last.extend_to(self.max_size.min(length - (segments.len() as u64 - 1) * self.max_size))?;
            }
            let mut next_index = segments.len();
            while (next_index as u64) * self.max_size < length {
                let remaining = length - next_index as u64 * self.max_size;
                let path = segment_path(&self.dir, &self.prefix, &self.suffix, next_index);
                let segment = DirectFileStorage::open(path, self.writable)?;
                segment.extend_to(remaining.min(self.max_size))?;
                segments.push(Arc::new(segment));
                next_index += 1;
            }
            Ok(true)
        })();
        self.state.end_busy();
        result
    }

    fn close(&self) -> Result<()> {
        self.state.close()
    }
}

impl SplitStorage {
    /// Truncate implementation shared with `cut`'s "shrink size" path; the
    /// caller already holds `Busy`, so this must not try to acquire it
    /// again.
    fn truncate_unlocked(&self, length: u64) -> Result<()> {
        let mut segments = self.segments.write().unwrap();
        let (keep_index, local_len) = self.segment_and_local(length);
        let keep_to = if local_len == 0 && length > 0 {
            keep_index
        } else {
            keep_index + 1
        };
        for segment in segments.drain(keep_to..) {
            segment.truncate(0)?;
        }
        if let Some(last) = segments.last() {
            last.truncate(local_len)?;
        }
        if segments.is_empty() {
            let path = segment_path(&self.dir, &self.prefix, &self.suffix, 0);
            segments.push(Arc::new(DirectFileStorage::open(path, self.writable)?));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEG: u64 = 2 * PAGE_SIZE as u64;

    #[test]
    fn spans_multiple_segment_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SplitStorage::open(dir.path(), "seg-", ".dat", SEG, true).unwrap();
        storage.extend_to(SEG * 3).unwrap();
        assert_eq!(storage.size(), SEG * 3);

        let ep = storage.acquire_endpoint_at(SEG + 5).unwrap();
        ep.write_u32(SEG + 5, 42).unwrap();
        assert_eq!(ep.read_u32(SEG + 5).unwrap(), 42);

        assert!(dir.path().join("seg-0.dat").exists());
        assert!(dir.path().join("seg-1.dat").exists());
        assert!(dir.path().join("seg-2.dat").exists());
    }

    #[test]
    fn reopen_enumerates_in_numeric_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = SplitStorage::open(dir.path(), "seg-", ".dat", SEG, true).unwrap();
            storage.extend_to(SEG * 2 + PAGE_SIZE as u64).unwrap();
            let ep = storage.acquire_endpoint_at(0).unwrap();
            ep.write_u64(0, 7).unwrap();
            storage.flush().unwrap();
        }
        let reopened = SplitStorage::open(dir.path(), "seg-", ".dat", SEG, true).unwrap();
        assert_eq!(reopened.size(), SEG * 2 + PAGE_SIZE as u64);
        let ep = reopened.acquire_endpoint_at(0).unwrap();
        assert_eq!(ep.read_u64(0).unwrap(), 7);
    }

    #[test]
    fn open_with_options_uses_configured_segment_size() {
        let dir = tempfile::tempdir().unwrap();
        let options = crate::wal::StorageOptions::new()
            .max_segment_size(SEG)
            .initial_size(SEG + 1);
        let storage = SplitStorage::open_with_options(dir.path(), "seg-", ".dat", true, &options).unwrap();
        assert_eq!(storage.size(), SEG + 1);
        assert!(dir.path().join("seg-0.dat").exists());
        assert!(dir.path().join("seg-1.dat").exists());
    }
}
