//! The write-ahead log itself: transaction lifecycle, snapshot isolation,
//! commit-time conflict detection, crash recovery, and checkpointing.
//!
//! A [`WriteAheadLog`] owns two storages — `base` and `log` — each wrapped
//! internally in a [`crate::storage::ThreadSafeStorage`] so that ordinary
//! reads/writes and the checkpoint path share the same range-arbitrated
//! access discipline as any other caller.

mod log;
pub mod options;
mod transaction;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::Result;
use crate::storage::{Storage, ThreadSafeStorage};

pub use options::{StorageOptions, WalOptions};
pub use transaction::{Transaction, TxnAccess};

struct CommitState {
    last_committed_seq: u64,
    log_tail: u64,
}

/// State shared between a [`WriteAheadLog`] and every [`Transaction`] it
/// has live.
pub(crate) struct WalShared {
    base: Arc<ThreadSafeStorage>,
    log: Arc<ThreadSafeStorage>,
    log_index: Mutex<log::LogIndex>,
    commit: Mutex<CommitState>,
    live: Mutex<BTreeMap<u64, u64>>,
    next_txn_id: AtomicU64,
    options: WalOptions,
    /// Held for read by a transaction lazily materializing a page (looking
    /// up `log_index` and reading the log at the offsets it names), and for
    /// write by [`WalShared::checkpoint_to`] while it truncates and rewrites
    /// the log out from under those offsets. Readers run concurrently with
    /// each other; a checkpoint excludes all of them for its duration.
    checkpoint_lock: RwLock<()>,
}

impl WalShared {
    fn current_committed_seq(&self) -> u64 {
        self.commit.lock().unwrap().last_committed_seq
    }

    fn register(&self, id: u64, start_mark: u64) {
        self.live.lock().unwrap().insert(id, start_mark);
    }

    fn unregister(&self, id: u64) {
        self.live.lock().unwrap().remove(&id);
    }

    fn horizon_with(&self, commit_state: &CommitState) -> u64 {
        let live = self.live.lock().unwrap();
        live.values().copied().min().unwrap_or(commit_state.last_committed_seq)
    }

    /// Apply every record with `seq <= horizon` onto the base, then
    /// rewrite the anchor and compact the log so only records with
    /// `seq > horizon` remain, contiguous right after the anchor.
    fn checkpoint_to(&self, horizon: u64) -> Result<()> {
        let mut commit_guard = self.commit.lock().unwrap();
        let _materialize_guard = self.checkpoint_lock.write().unwrap();

        let (_, records) = log::rebuild_index(&self.log, log::ANCHOR_SIZE as u64)?;
        let safe: Vec<&log::ScannedRecord> = records.iter().filter(|r| r.seq <= horizon).collect();
        if safe.is_empty() {
            return Ok(());
        }

        for record in &safe {
            for (page_location, blob) in &record.pages {
                log::apply_page_blob(&self.base, &self.log, *page_location, *blob)?;
            }
        }
        self.base.flush()?;

        // Capture the raw bytes of every not-yet-safe record before the
        // log gets truncated out from under their offsets.
        let not_yet_safe: Vec<&log::ScannedRecord> = records.iter().filter(|r| r.seq > horizon).collect();
        let mut rewritten = Vec::with_capacity(not_yet_safe.len());
        for record in &not_yet_safe {
            let len = record.record_end - record.record_start;
            let access = self.log.access(record.record_start, len, false)?;
            let mut buf = vec![0u8; len as usize];
            access.read_bytes(record.record_start, &mut buf)?;
            drop(access);
            rewritten.push(buf);
        }

        self.log.truncate(log::ANCHOR_SIZE as u64)?;
        let new_anchor = log::Anchor {
            magic: log::ANCHOR_MAGIC,
            version: log::ANCHOR_VERSION,
            reserved: 0,
            last_committed_seq: commit_guard.last_committed_seq,
            checkpoint_offset: log::ANCHOR_SIZE as u64,
        };
        log::write_anchor(&self.log, &new_anchor)?;

        let mut tail = log::ANCHOR_SIZE as u64;
        for buf in &rewritten {
            self.log.extend_to(tail + buf.len() as u64)?;
            let access = self.log.access(tail, buf.len() as u64, true)?;
            access.write_bytes(tail, buf)?;
            tail += buf.len() as u64;
        }
        self.log.flush()?;

        commit_guard.log_tail = tail;
        drop(commit_guard);

        let (fresh_index, _) = log::rebuild_index(&self.log, log::ANCHOR_SIZE as u64)?;
        *self.log_index.lock().unwrap() = fresh_index;

        Ok(())
    }

    fn cleanup(&self, forced: bool) -> Result<()> {
        let horizon = {
            let commit_guard = self.commit.lock().unwrap();
            if !forced {
                let no_writers = self.live.lock().unwrap().is_empty();
                let aggregate = self.log.size().saturating_sub(log::ANCHOR_SIZE as u64);
                if !no_writers && aggregate < self.options.checkpoint_threshold_bytes {
                    return Ok(());
                }
            }
            self.horizon_with(&commit_guard)
        };
        self.checkpoint_to(horizon)
    }
}

/// A paged storage engine backed by a write-ahead log, providing ACID
/// transactions with snapshot isolation over `base`.
pub struct WriteAheadLog {
    shared: Arc<WalShared>,
}

impl WriteAheadLog {
    /// Open (and, if necessary, recover) a write-ahead log over `base` and
    /// `log`. If the log storage is shorter than the anchor, it is
    /// initialised fresh. Otherwise every valid record is replayed onto
    /// `base` and the log is compacted back down to just its anchor,
    /// exactly as a normal [`WriteAheadLog::close`] would have left it.
    pub fn open(
        base: Arc<dyn Storage>,
        log: Arc<dyn Storage>,
        options: WalOptions,
    ) -> Result<Arc<Self>> {
        ::log::debug!(
            "opening WAL: base storage kind={}, log storage kind={}",
            base.kind(),
            log.kind()
        );
        let base = Arc::new(ThreadSafeStorage::new(base));
        let log = Arc::new(ThreadSafeStorage::new(log));

        let last_committed_seq = if log.size() < log::ANCHOR_SIZE as u64 {
            log::write_anchor(&log, &log::Anchor::fresh())?;
            0
        } else {
            let anchor = log::read_anchor(&log)?;
            let (_, records) = log::rebuild_index(&log, anchor.checkpoint_offset)?;

            for record in &records {
                for (page_location, blob) in &record.pages {
                    log::apply_page_blob(&base, &log, *page_location, *blob)?;
                }
            }
            base.flush()?;

            let last_committed_seq = records
                .last()
                .map(|r| r.seq)
                .unwrap_or(anchor.last_committed_seq);

            log.truncate(log::ANCHOR_SIZE as u64)?;
            log::write_anchor(
                &log,
                &log::Anchor {
                    magic: log::ANCHOR_MAGIC,
                    version: log::ANCHOR_VERSION,
                    reserved: 0,
                    last_committed_seq,
                    checkpoint_offset: log::ANCHOR_SIZE as u64,
                },
            )?;
            log.flush()?;
            last_committed_seq
        };

        let shared = Arc::new(WalShared {
            base,
            log,
            log_index: Mutex::new(log::LogIndex::new()),
            commit: Mutex::new(CommitState {
                last_committed_seq,
                log_tail: log::ANCHOR_SIZE as u64,
            }),
            live: Mutex::new(BTreeMap::new()),
            next_txn_id: AtomicU64::new(0),
            options,
            checkpoint_lock: RwLock::new(()),
        });

        Ok(Arc::new(Self { shared }))
    }

    /// Start a new transaction. `start_mark` is captured as the currently
    /// committed sequence, so the transaction's reads are stable regardless
    /// of commits that happen afterward.
    pub fn new_transaction(self: &Arc<Self>, writable: bool, autocommit: bool) -> Arc<Transaction> {
        let id = self.shared.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let start_mark = self.shared.current_committed_seq();
        self.shared.register(id, start_mark);
        Transaction::new(self.shared.clone(), id, start_mark, writable, autocommit)
    }

    /// Checkpoint eligible records onto `base` and compact the log.
    /// `forced` bypasses the threshold/no-writers gate.
    pub fn cleanup(&self, forced: bool) -> Result<()> {
        self.shared.cleanup(forced)
    }

    /// Force a full checkpoint (ignoring any still-live transaction's
    /// snapshot) and close both backing storages. After this, the log is
    /// exactly 32 bytes, matching what a crash-and-recover cycle produces.
    pub fn close(&self) -> Result<()> {
        let live_count = self.shared.live.lock().unwrap().len();
        if live_count > 0 {
            ::log::warn!("closing WAL with {live_count} live transaction(s) still open");
        }
        let horizon = self.shared.current_committed_seq();
        self.shared.checkpoint_to(horizon)?;
        self.shared.base.close()?;
        self.shared.log.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::thread;

    fn open_fresh() -> (Arc<dyn Storage>, Arc<dyn Storage>, Arc<WriteAheadLog>) {
        let base: Arc<dyn Storage> = Arc::new(MemoryStorage::new(true));
        let log: Arc<dyn Storage> = Arc::new(MemoryStorage::new(true));
        let wal = WriteAheadLog::open(base.clone(), log.clone(), WalOptions::new()).unwrap();
        (base, log, wal)
    }

    #[test]
    fn s1_commit_persistence() {
        let (base, _log, wal) = open_fresh();

        let txn = wal.new_transaction(true, false);
        let access = txn.access(0, crate::PAGE_SIZE as u64 + 4, true).unwrap();
        access.write_u32(0, 0xFFFF_FFFF).unwrap();
        access.write_u32(crate::PAGE_SIZE as u64, 0xFFFF_FFFF).unwrap();
        drop(access);

        assert_eq!(base.size(), 0);
        txn.commit().unwrap();
        txn.close().unwrap();

        assert_eq!(base.size(), 0);
        wal.cleanup(true).unwrap();

        assert_eq!(base.size(), crate::PAGE_SIZE as u64 + 4);
        let check = ThreadSafeStorage::new(base);
        let a = check.access(0, 4, false).unwrap();
        assert_eq!(a.read_u32(0).unwrap(), 0xFFFF_FFFF);
        let b = check.access(crate::PAGE_SIZE as u64, 4, false).unwrap();
        assert_eq!(b.read_u32(crate::PAGE_SIZE as u64).unwrap(), 0xFFFF_FFFF);
    }

    #[test]
    fn s2_abort() {
        let (base, _log, wal) = open_fresh();

        let txn = wal.new_transaction(true, false);
        let access = txn.access(0, 4, true).unwrap();
        access.write_u32(0, 0xFFFF_FFFF).unwrap();
        drop(access);
        txn.abort().unwrap();
        txn.close().unwrap();

        let reader = wal.new_transaction(false, false);
        let access = reader.access(0, 4, false).unwrap();
        assert_eq!(access.read_u32(0).unwrap(), 0);
        reader.close().unwrap();

        wal.cleanup(true).unwrap();
        assert_eq!(base.size(), 0);
    }

    #[test]
    fn s3_snapshot_isolation() {
        let (_base, _log, wal) = open_fresh();

        let t1 = wal.new_transaction(true, false);
        let t2 = wal.new_transaction(false, false);

        let a1 = t1.access(0, 4, true).unwrap();
        a1.write_u32(0, 0xFFFF_FFFF).unwrap();
        drop(a1);
        t1.commit().unwrap();
        t1.close().unwrap();

        let a2 = t2.access(0, 4, false).unwrap();
        assert_eq!(a2.read_u32(0).unwrap(), 0);
        drop(a2);
        t2.close().unwrap();
    }

    #[test]
    fn s4_write_write_conflict() {
        let (_base, _log, wal) = open_fresh();

        let t1 = wal.new_transaction(true, false);
        let t2 = wal.new_transaction(true, false);

        let a1 = t1.access(0, 4, true).unwrap();
        a1.write_u32(0, 1).unwrap();
        drop(a1);
        t1.commit().unwrap();

        let a2 = t2.access(0, 4, true).unwrap();
        a2.write_u32(0, 2).unwrap();
        drop(a2);
        assert!(matches!(t2.commit(), Err(crate::PagewalError::Conflict)));
        t2.close().unwrap();
        t1.close().unwrap();

        let reader = wal.new_transaction(false, false);
        let a = reader.access(0, 4, false).unwrap();
        assert_eq!(a.read_u32(0).unwrap(), 1);
        reader.close().unwrap();
    }

    #[test]
    fn s5_crash_without_checkpoint() {
        let _ = env_logger::try_init();
        let base: Arc<dyn Storage> = Arc::new(MemoryStorage::new(true));
        let log: Arc<dyn Storage> = Arc::new(MemoryStorage::new(true));

        {
            let wal = WriteAheadLog::open(base.clone(), log.clone(), WalOptions::new()).unwrap();

            let t1 = wal.new_transaction(true, false);
            let a1 = t1.access(0, 4, true).unwrap();
            a1.write_u32(0, 10).unwrap();
            drop(a1);
            t1.commit().unwrap();
            t1.close().unwrap();

            let t2 = wal.new_transaction(true, false);
            let a2 = t2.access(crate::PAGE_SIZE as u64, 4, true).unwrap();
            a2.write_u32(crate::PAGE_SIZE as u64, 20).unwrap();
            drop(a2);
            t2.commit().unwrap();
            t2.close().unwrap();

            // No cleanup, no close: simulated crash.
            assert_eq!(base.size(), 0);
            assert!(log.size() > log::ANCHOR_SIZE as u64);
        }

        let recovered = WriteAheadLog::open(base.clone(), log.clone(), WalOptions::new()).unwrap();
        assert_eq!(base.size(), crate::PAGE_SIZE as u64 + 4);
        assert_eq!(log.size(), log::ANCHOR_SIZE as u64);

        let reader = recovered.new_transaction(false, false);
        let a = reader.access(0, 4, false).unwrap();
        assert_eq!(a.read_u32(0).unwrap(), 10);
        let b = reader.access(crate::PAGE_SIZE as u64, 4, false).unwrap();
        assert_eq!(b.read_u32(crate::PAGE_SIZE as u64).unwrap(), 20);
        reader.close().unwrap();
    }

    #[test]
    fn s6_crash_after_checkpoint() {
        let base: Arc<dyn Storage> = Arc::new(MemoryStorage::new(true));
        let log: Arc<dyn Storage> = Arc::new(MemoryStorage::new(true));

        {
            let wal = WriteAheadLog::open(base.clone(), log.clone(), WalOptions::new()).unwrap();

            let t1 = wal.new_transaction(true, false);
            let a1 = t1.access(0, 4, true).unwrap();
            a1.write_u32(0, 10).unwrap();
            drop(a1);
            t1.commit().unwrap();
            t1.close().unwrap();

            wal.cleanup(true).unwrap();

            let t2 = wal.new_transaction(true, false);
            let a2 = t2.access(crate::PAGE_SIZE as u64 + 4, 4, true).unwrap();
            a2.write_u32(crate::PAGE_SIZE as u64 + 4, 20).unwrap();
            drop(a2);
            t2.commit().unwrap();
            t2.close().unwrap();

            // Crash: no final cleanup, no close.
        }

        let recovered = WriteAheadLog::open(base.clone(), log.clone(), WalOptions::new()).unwrap();
        assert_eq!(base.size(), crate::PAGE_SIZE as u64 + 8);
        assert_eq!(log.size(), log::ANCHOR_SIZE as u64);

        let reader = recovered.new_transaction(false, false);
        let a = reader.access(0, 4, false).unwrap();
        assert_eq!(a.read_u32(0).unwrap(), 10);
        let b = reader.access(crate::PAGE_SIZE as u64 + 4, 4, false).unwrap();
        assert_eq!(b.read_u32(crate::PAGE_SIZE as u64 + 4).unwrap(), 20);
        reader.close().unwrap();
    }

    #[test]
    fn disjoint_writers_both_commit() {
        let (_base, _log, wal) = open_fresh();

        let t1 = wal.new_transaction(true, false);
        let t2 = wal.new_transaction(true, false);

        let a1 = t1.access(0, 4, true).unwrap();
        a1.write_u32(0, 1).unwrap();
        drop(a1);
        let a2 = t2.access(crate::PAGE_SIZE as u64, 4, true).unwrap();
        a2.write_u32(crate::PAGE_SIZE as u64, 2).unwrap();
        drop(a2);

        t1.commit().unwrap();
        t2.commit().unwrap();
        t1.close().unwrap();
        t2.close().unwrap();
    }

    #[test]
    fn read_only_commit_and_double_commit_are_no_ops() {
        let (_base, _log, wal) = open_fresh();
        let reader = wal.new_transaction(false, false);
        reader.commit().unwrap();
        reader.commit().unwrap();
        reader.close().unwrap();

        let writer = wal.new_transaction(true, false);
        writer.commit().unwrap();
        writer.commit().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn autocommit_close_commits_pending_edits() {
        let (base, _log, wal) = open_fresh();
        let txn = wal.new_transaction(true, true);
        let access = txn.access(0, 4, true).unwrap();
        access.write_u32(0, 7).unwrap();
        drop(access);
        txn.close().unwrap();

        wal.cleanup(true).unwrap();
        assert_eq!(base.size(), 4);
    }

    #[test]
    fn reader_materializes_correctly_across_a_concurrent_checkpoint() {
        let (_base, _log, wal) = open_fresh();

        let writer = wal.new_transaction(true, false);
        let access = writer.access(0, 4, true).unwrap();
        access.write_u32(0, 0xAAAA_AAAA).unwrap();
        drop(access);
        writer.commit().unwrap();
        writer.close().unwrap();

        // A reader whose start_mark already covers the committed write.
        let reader = wal.new_transaction(false, false);

        let wal_for_checkpoint = wal.clone();
        let handle = thread::spawn(move || wal_for_checkpoint.cleanup(true).unwrap());

        let access = reader.access(0, 4, false).unwrap();
        let value = access.read_u32(0).unwrap();
        drop(access);
        handle.join().unwrap();

        assert_eq!(value, 0xAAAA_AAAA);
        reader.close().unwrap();
    }
}
