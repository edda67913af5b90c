//! Transaction lifecycle, snapshot buffering, and the commit protocol.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::endpoint::{bounds_check, Endpoint};
use crate::error::{PagewalError, Result};
use crate::page_edits::PageEdits;
use crate::PAGE_SIZE;

use super::log;
use super::WalShared;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnState {
    Running,
    Committed,
    Aborted,
    Closed,
}

struct PageBuffered {
    data: Box<[u8]>,
    edits: PageEdits,
    dirty: bool,
}

/// A single transaction against a [`super::WriteAheadLog`].
///
/// Readers observe the committed prefix as of `start_mark`; writers
/// additionally buffer their own edits on top of that snapshot until
/// commit. There is no thread-local "current transaction" registry —
/// callers pass the `Arc<Transaction>` handle explicitly to whatever needs
/// it.
pub struct Transaction {
    shared: Arc<WalShared>,
    id: u64,
    start_mark: u64,
    writable: bool,
    autocommit: bool,
    state: Mutex<TxnState>,
    pages: Mutex<HashMap<u64, PageBuffered>>,
}

impl Transaction {
    pub(crate) fn new(
        shared: Arc<WalShared>,
        id: u64,
        start_mark: u64,
        writable: bool,
        autocommit: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared,
            id,
            start_mark,
            writable,
            autocommit,
            state: Mutex::new(TxnState::Running),
            pages: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn start_mark(&self) -> u64 {
        self.start_mark
    }

    pub(crate) fn state(&self) -> TxnState {
        *self.state.lock().unwrap()
    }

    /// Request a scoped access over `[offset, offset+length)` of this
    /// transaction's buffered overlay. `writable` accesses are rejected on
    /// a read-only transaction.
    pub fn access(self: &Arc<Self>, offset: u64, length: u64, writable: bool) -> Result<TxnAccess> {
        if self.state() != TxnState::Running {
            return Err(PagewalError::InvalidState(
                "transaction is not in the running state",
            ));
        }
        if writable && !self.writable {
            return Err(PagewalError::InvalidState(
                "cannot open a writable access on a read-only transaction",
            ));
        }
        Ok(TxnAccess {
            txn: self.clone(),
            offset,
            length,
            writable,
        })
    }

    /// Commit. A no-op success for read-only transactions and for
    /// transactions with no pending edits. Double-commit is a no-op.
    /// Conflicting writable commits are discarded (left `Aborted`).
    pub fn commit(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                TxnState::Committed => return Ok(()),
                TxnState::Running => {}
                _ => {
                    return Err(PagewalError::InvalidState(
                        "cannot commit a transaction that is not running",
                    ))
                }
            }
            if !self.writable {
                *state = TxnState::Committed;
                return Ok(());
            }
        }

        let write_set: Vec<(u64, PageEdits)> = {
            let mut pages = self.pages.lock().unwrap();
            pages
                .iter_mut()
                .filter(|(_, page)| page.dirty && !page.edits.is_empty())
                .map(|(&location, page)| (location, std::mem::take(&mut page.edits)))
                .collect()
        };

        if write_set.is_empty() {
            *self.state.lock().unwrap() = TxnState::Committed;
            return Ok(());
        }

        let mut commit_guard = self.shared.commit.lock().unwrap();

        {
            let index = self.shared.log_index.lock().unwrap();
            for (location, _) in &write_set {
                if index.has_newer_than(*location, self.start_mark) {
                    drop(index);
                    drop(commit_guard);
                    *self.state.lock().unwrap() = TxnState::Aborted;
                    return Err(PagewalError::Conflict);
                }
            }
        }

        let seq = commit_guard.last_committed_seq + 1;
        let timestamp = log::now_unix_nanos();
        let (new_tail, locations) = log::append_record(
            &self.shared.log,
            commit_guard.log_tail,
            seq,
            timestamp,
            &write_set,
        )?;
        self.shared.log.flush()?;

        {
            let mut index = self.shared.log_index.lock().unwrap();
            for (location, blob) in locations {
                index.record(location, blob);
            }
        }

        commit_guard.last_committed_seq = seq;
        commit_guard.log_tail = new_tail;
        drop(commit_guard);

        *self.state.lock().unwrap() = TxnState::Committed;

        if self.shared.options.checkpoint_on_commit {
            if let Err(e) = self.shared.cleanup(false) {
                ::log::warn!("opportunistic checkpoint after commit failed: {e}");
            }
        }

        Ok(())
    }

    /// Discard buffered edits. A no-op if already aborted.
    pub fn abort(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match *state {
            TxnState::Aborted => Ok(()),
            TxnState::Running => {
                self.pages.lock().unwrap().clear();
                *state = TxnState::Aborted;
                Ok(())
            }
            _ => Err(PagewalError::InvalidState(
                "cannot abort a transaction that is not running",
            )),
        }
    }

    /// If running and `autocommit`, attempt a commit; otherwise abort.
    /// Idempotent, and removes this transaction from the WAL's live table.
    pub fn close(self: &Arc<Self>) -> Result<()> {
        let current = self.state();
        match current {
            TxnState::Closed => return Ok(()),
            TxnState::Running => {
                if self.autocommit {
                    self.commit()?;
                } else {
                    self.abort()?;
                }
            }
            TxnState::Committed | TxnState::Aborted => {}
        }
        *self.state.lock().unwrap() = TxnState::Closed;
        self.shared.unregister(self.id);
        Ok(())
    }

    fn with_page<R>(&self, page_location: u64, f: impl FnOnce(&mut PageBuffered) -> R) -> Result<R> {
        let mut pages = self.pages.lock().unwrap();
        if !pages.contains_key(&page_location) {
            let buffered = self.materialize_page(page_location)?;
            pages.insert(page_location, buffered);
        }
        Ok(f(pages.get_mut(&page_location).expect("just inserted")))
    }

    /// Build a page's initial content: the base image (or zeros beyond the
    /// base's current size) with every committed-but-not-yet-checkpointed
    /// edit at `seq <= start_mark` replayed on top, oldest first, so later
    /// commits correctly shadow earlier ones on overlapping bytes.
    fn materialize_page(&self, page_location: u64) -> Result<PageBuffered> {
        let mut data = vec![0u8; PAGE_SIZE].into_boxed_slice();

        // Excludes a concurrent checkpoint, which truncates and rewrites the
        // log out from under the offsets `log_index` names.
        let _checkpoint_guard = self.shared.checkpoint_lock.read().unwrap();

        let base_size = self.shared.base.size();
        if page_location < base_size {
            let want = (PAGE_SIZE as u64).min(base_size - page_location) as usize;
            let access = self.shared.base.access(page_location, want as u64, false)?;
            access.read_bytes(page_location, &mut data[..want])?;
        }

        let mut entries = {
            let index = self.shared.log_index.lock().unwrap();
            index
                .by_page
                .get(&page_location)
                .cloned()
                .unwrap_or_default()
        };
        entries.retain(|blob| blob.seq <= self.start_mark);
        entries.sort_by_key(|blob| blob.seq);

        for blob in entries {
            let edits = log::read_page_edits(&self.shared.log, blob)?;
            edits.apply_to(&mut data);
        }

        Ok(PageBuffered {
            data,
            edits: PageEdits::new(),
            dirty: false,
        })
    }

    fn read_range(&self, page_location: u64, local_offset: usize, buf: &mut [u8]) -> Result<()> {
        self.with_page(page_location, |page| {
            buf.copy_from_slice(&page.data[local_offset..local_offset + buf.len()]);
        })
    }

    fn write_range(&self, page_location: u64, local_offset: usize, data: &[u8]) -> Result<()> {
        self.with_page(page_location, |page| -> Result<()> {
            page.data[local_offset..local_offset + data.len()].copy_from_slice(data);
            page.edits.record(local_offset as u32, data)?;
            page.dirty = true;
            Ok(())
        })?
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let current = *self.state.lock().unwrap();
        if current == TxnState::Running {
            self.pages.lock().unwrap().clear();
        }
        self.shared.unregister(self.id);
    }
}

/// A scoped access over a [`Transaction`]'s buffered overlay.
pub struct TxnAccess {
    txn: Arc<Transaction>,
    offset: u64,
    length: u64,
    writable: bool,
}

impl TxnAccess {
    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl Endpoint for TxnAccess {
    fn base_offset(&self) -> u64 {
        self.offset
    }

    fn region_len(&self) -> usize {
        self.length as usize
    }

    fn read_bytes(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        bounds_check(self.offset, self.length as usize, pos, buf.len())?;
        let mut done = 0usize;
        while done < buf.len() {
            let abs = pos + done as u64;
            let page_base = crate::page_floor(abs);
            let page_local = crate::page_local(abs);
            let chunk = (PAGE_SIZE - page_local).min(buf.len() - done);
            self.txn
                .read_range(page_base, page_local, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    fn write_bytes(&self, pos: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(PagewalError::InvalidState("access is read-only"));
        }
        bounds_check(self.offset, self.length as usize, pos, data.len())?;
        let mut done = 0usize;
        while done < data.len() {
            let abs = pos + done as u64;
            let page_base = crate::page_floor(abs);
            let page_local = crate::page_local(abs);
            let chunk = (PAGE_SIZE - page_local).min(data.len() - done);
            self.txn
                .write_range(page_base, page_local, &data[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }
}
