//! On-disk log format: the 32-byte anchor, transaction records, checksum
//! verification, and the shared scan/apply routines used by both recovery
//! (on open) and checkpointing.

use std::collections::BTreeMap;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use bytemuck::{Pod, Zeroable};

use crate::error::{PagewalError, Result};
use crate::page_edits::PageEdits;
use crate::storage::ThreadSafeStorage;

pub(crate) const ANCHOR_SIZE: usize = 32;
pub(crate) const ANCHOR_MAGIC: [u8; 8] = *b"PAGEWAL\0";
pub(crate) const ANCHOR_VERSION: u32 = 1;
pub(crate) const RECORD_HEADER_SIZE: usize = 24;

/// The first 32 bytes of the log file.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct Anchor {
    pub magic: [u8; 8],
    pub version: u32,
    pub reserved: u32,
    pub last_committed_seq: u64,
    pub checkpoint_offset: u64,
}

impl Anchor {
    pub fn fresh() -> Self {
        Self {
            magic: ANCHOR_MAGIC,
            version: ANCHOR_VERSION,
            reserved: 0,
            last_committed_seq: 0,
            checkpoint_offset: ANCHOR_SIZE as u64,
        }
    }
}

const _: () = assert!(std::mem::size_of::<Anchor>() == ANCHOR_SIZE);

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RecordHeader {
    seq: u64,
    timestamp: u64,
    byte_len: u32,
    page_count: u32,
}

const _: () = assert!(std::mem::size_of::<RecordHeader>() == RECORD_HEADER_SIZE);

pub(crate) fn read_anchor(log: &ThreadSafeStorage) -> Result<Anchor> {
    let access = log.access(0, ANCHOR_SIZE as u64, false)?;
    let mut buf = [0u8; ANCHOR_SIZE];
    access.read_bytes(0, &mut buf)?;
    let anchor: Anchor = *bytemuck::from_bytes(&buf);
    if anchor.magic != ANCHOR_MAGIC || anchor.version != ANCHOR_VERSION {
        return Err(PagewalError::Corruption("log anchor magic/version mismatch"));
    }
    Ok(anchor)
}

pub(crate) fn write_anchor(log: &ThreadSafeStorage, anchor: &Anchor) -> Result<()> {
    log.extend_to(ANCHOR_SIZE as u64)?;
    let access = log.access(0, ANCHOR_SIZE as u64, true)?;
    access.write_bytes(0, bytemuck::bytes_of(anchor))?;
    Ok(())
}

/// Where, within the log, a single page's edits for a given committed
/// record can be found.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PageBlobLocation {
    pub seq: u64,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug)]
pub(crate) struct ScannedRecord {
    pub seq: u64,
    pub record_start: u64,
    pub record_end: u64,
    pub pages: Vec<(u64, PageBlobLocation)>,
}

/// Scan `[start, end)` of the log for valid, checksum-verified records.
/// Stops at the first record that doesn't fully fit, or whose checksum
/// fails — that record and everything after it is a torn tail.
pub(crate) fn scan_records(
    log: &ThreadSafeStorage,
    start: u64,
    end: u64,
) -> Result<Vec<ScannedRecord>> {
    let mut records = Vec::new();
    let mut pos = start;

    while pos + RECORD_HEADER_SIZE as u64 <= end {
        let header_access = log.access(pos, RECORD_HEADER_SIZE as u64, false)?;
        let mut header_buf = [0u8; RECORD_HEADER_SIZE];
        header_access.read_bytes(pos, &mut header_buf)?;
        drop(header_access);
        let header: RecordHeader = *bytemuck::from_bytes(&header_buf);

        let total_len = RECORD_HEADER_SIZE as u64 + header.byte_len as u64 + 4;
        if pos + total_len > end {
            log::warn!("torn WAL tail at offset {pos}: record does not fully fit");
            break;
        }

        let record_access = log.access(pos, total_len, false)?;
        let mut record_buf = vec![0u8; total_len as usize];
        record_access.read_bytes(pos, &mut record_buf)?;
        drop(record_access);

        let body = &record_buf[..RECORD_HEADER_SIZE + header.byte_len as usize];
        let stored_crc = LittleEndian::read_u32(&record_buf[record_buf.len() - 4..]);
        let computed_crc = crc32fast::hash(body);
        if computed_crc != stored_crc {
            log::warn!("checksum mismatch at WAL offset {pos}; treating as torn tail");
            break;
        }

        let pages_bytes = &record_buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + header.byte_len as usize];
        let mut pages = Vec::with_capacity(header.page_count as usize);
        let mut rel = 0usize;
        for _ in 0..header.page_count {
            let (page_location, edits, consumed) = PageEdits::deserialize(&pages_bytes[rel..])?;
            let blob_offset = pos + RECORD_HEADER_SIZE as u64 + rel as u64;
            pages.push((
                page_location,
                PageBlobLocation {
                    seq: header.seq,
                    offset: blob_offset,
                    length: consumed as u64,
                },
            ));
            rel += consumed;
            drop(edits);
        }

        records.push(ScannedRecord {
            seq: header.seq,
            record_start: pos,
            record_end: pos + total_len,
            pages,
        });
        pos += total_len;
    }

    Ok(records)
}

/// Append one transaction's committed pages as a new record at the log's
/// current tail. Returns the new tail offset and the per-page blob
/// locations to feed into the in-memory index.
pub(crate) fn append_record(
    log: &ThreadSafeStorage,
    tail: u64,
    seq: u64,
    timestamp: u64,
    pages: &[(u64, PageEdits)],
) -> Result<(u64, Vec<(u64, PageBlobLocation)>)> {
    let mut pages_bytes = Vec::new();
    let mut locations = Vec::with_capacity(pages.len());
    for (location, edits) in pages {
        let start = pages_bytes.len();
        edits.serialize(*location, &mut pages_bytes);
        locations.push((
            *location,
            PageBlobLocation {
                seq,
                offset: tail + RECORD_HEADER_SIZE as u64 + start as u64,
                length: (pages_bytes.len() - start) as u64,
            },
        ));
    }

    let header = RecordHeader {
        seq,
        timestamp,
        byte_len: pages_bytes.len() as u32,
        page_count: pages.len() as u32,
    };

    let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + pages_bytes.len() + 4);
    record.extend_from_slice(bytemuck::bytes_of(&header));
    record.extend_from_slice(&pages_bytes);
    let crc = crc32fast::hash(&record);
    let mut crc_buf = [0u8; 4];
    LittleEndian::write_u32(&mut crc_buf, crc);
    record.extend_from_slice(&crc_buf);

    let new_tail = tail + record.len() as u64;
    log.extend_to(new_tail)?;
    let access = log.access(tail, record.len() as u64, true)?;
    access.write_bytes(tail, &record)?;

    Ok((new_tail, locations))
}

/// Read one page's edits back out of the log at a known blob location.
pub(crate) fn read_page_edits(log: &ThreadSafeStorage, blob: PageBlobLocation) -> Result<PageEdits> {
    let access = log.access(blob.offset, blob.length, false)?;
    let mut buf = vec![0u8; blob.length as usize];
    access.read_bytes(blob.offset, &mut buf)?;
    drop(access);

    let (_, edits, _) = PageEdits::deserialize(&buf)?;
    Ok(edits)
}

/// Read one page's edits back out of the log at a known blob location and
/// apply them onto `base`.
pub(crate) fn apply_page_blob(
    base: &ThreadSafeStorage,
    log: &ThreadSafeStorage,
    page_location: u64,
    blob: PageBlobLocation,
) -> Result<()> {
    let edits = read_page_edits(log, blob)?;
    for (edit_offset, edit_length, content) in edits.iter() {
        let dest_offset = page_location + edit_offset as u64;
        base.extend_to(dest_offset + edit_length as u64)?;
        let dest = base.access(dest_offset, edit_length as u64, true)?;
        dest.write_bytes(dest_offset, content)?;
    }
    Ok(())
}

/// An in-memory index of committed-but-not-yet-checkpointed pages: for
/// each page location, the locations (newest last) of its edits across
/// still-live log records.
#[derive(Debug, Default)]
pub(crate) struct LogIndex {
    pub(crate) by_page: BTreeMap<u64, Vec<PageBlobLocation>>,
}

impl LogIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, page_location: u64, blob: PageBlobLocation) {
        self.by_page.entry(page_location).or_default().push(blob);
    }

    /// Whether any entry for `page_location` has `seq > since`.
    pub fn has_newer_than(&self, page_location: u64, since: u64) -> bool {
        self.by_page
            .get(&page_location)
            .into_iter()
            .flatten()
            .any(|b| b.seq > since)
    }
}

/// Rebuild the index (and return the highest committed seq observed) by
/// scanning every record currently in the log, from just past the anchor.
pub(crate) fn rebuild_index(log: &ThreadSafeStorage, from: u64) -> Result<(LogIndex, Vec<ScannedRecord>)> {
    let end = log.size();
    let records = scan_records(log, from, end)?;
    let mut index = LogIndex::new();
    for record in &records {
        for (page_location, blob) in &record.pages {
            index.record(*page_location, *blob);
        }
    }
    Ok((index, records))
}

pub(crate) fn now_unix_nanos() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    fn fresh_log() -> Arc<ThreadSafeStorage> {
        Arc::new(ThreadSafeStorage::new(Arc::new(MemoryStorage::new(true))))
    }

    #[test]
    fn anchor_roundtrip() {
        let log = fresh_log();
        let anchor = Anchor::fresh();
        write_anchor(&log, &anchor).unwrap();
        let read_back = read_anchor(&log).unwrap();
        assert_eq!(read_back.last_committed_seq, 0);
        assert_eq!(read_back.checkpoint_offset, ANCHOR_SIZE as u64);
    }

    #[test]
    fn append_and_scan_single_record() {
        let log = fresh_log();
        log.extend_to(ANCHOR_SIZE as u64).unwrap();

        let mut edits = PageEdits::new();
        edits.record(0, &[1, 2, 3, 4]).unwrap();
        let (new_tail, locations) =
            append_record(&log, ANCHOR_SIZE as u64, 1, now_unix_nanos(), &[(0, edits)]).unwrap();
        assert_eq!(locations.len(), 1);

        let records = scan_records(&log, ANCHOR_SIZE as u64, new_tail).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].seq, 1);
        assert_eq!(records[0].pages.len(), 1);
    }

    #[test]
    fn corrupted_record_ends_scan() {
        let _ = env_logger::try_init();
        let log = fresh_log();
        log.extend_to(ANCHOR_SIZE as u64).unwrap();
        let mut edits = PageEdits::new();
        edits.record(0, &[1, 2, 3, 4]).unwrap();
        let (tail, _) =
            append_record(&log, ANCHOR_SIZE as u64, 1, now_unix_nanos(), &[(0, edits)]).unwrap();

        // Flip a byte inside the first record's content to break its crc.
        let access = log.access(ANCHOR_SIZE as u64 + 30, 1, true).unwrap();
        let mut byte = [0u8; 1];
        access.read_bytes(ANCHOR_SIZE as u64 + 30, &mut byte).unwrap();
        access
            .write_bytes(ANCHOR_SIZE as u64 + 30, &[byte[0] ^ 0xff])
            .unwrap();

        let records = scan_records(&log, ANCHOR_SIZE as u64, tail).unwrap();
        assert!(records.is_empty());
    }
}
