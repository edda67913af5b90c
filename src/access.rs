//! Range-based access arbitration: lets disjoint readers and writers share
//! one storage concurrently without page-level locking.
//!
//! The live set of granted accesses is a circular singly-linked list
//! ordered by start offset, backed by a fixed-capacity freelist so the hot
//! path (admit/release) never allocates beyond what the freelist already
//! holds. Waiters are admitted in strict FIFO order among themselves: a
//! blocked request only proceeds once it holds the smallest ticket number
//! of all currently-blocked, currently-compatible requests, which prevents
//! a steady stream of readers from starving a waiting writer.

use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};

use crate::endpoint::{bounds_check, Endpoint};
use crate::error::{PagewalError, Result};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy)]
struct Node {
    offset: u64,
    length: u64,
    writable: bool,
    next: Option<usize>,
}

struct Inner {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    closed: bool,
    next_ticket: u64,
    pending: BTreeSet<u64>,
}

impl Inner {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            closed: false,
            next_ticket: 0,
            pending: BTreeSet::new(),
        }
    }

    fn compatible_with_active(&self, offset: u64, length: u64, writable: bool) -> bool {
        let end = offset + length;
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let node = self.slots[idx].expect("linked index must be occupied");
            let node_end = node.offset + node.length;
            let disjoint = end <= node.offset || node_end <= offset;
            if !(disjoint || (!writable && !node.writable)) {
                return false;
            }
            cursor = node.next;
        }
        true
    }

    fn insert_ordered(&mut self, node: Node) -> usize {
        let idx = self.free.pop().unwrap_or_else(|| {
            self.slots.push(None);
            self.slots.len() - 1
        });

        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(cur_idx) = cursor {
            let cur = self.slots[cur_idx].expect("linked index must be occupied");
            if cur.offset > node.offset {
                break;
            }
            prev = Some(cur_idx);
            cursor = cur.next;
        }

        let mut node = node;
        node.next = cursor;
        self.slots[idx] = Some(node);

        match prev {
            Some(prev_idx) => {
                self.slots[prev_idx].as_mut().unwrap().next = Some(idx);
            }
            None => self.head = Some(idx),
        }
        idx
    }

    fn remove(&mut self, idx: usize) {
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(cur_idx) = cursor {
            if cur_idx == idx {
                break;
            }
            prev = Some(cur_idx);
            cursor = self.slots[cur_idx].unwrap().next;
        }
        let next = self.slots[idx].take().unwrap().next;
        match prev {
            Some(prev_idx) => self.slots[prev_idx].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        self.free.push(idx);
    }
}

/// Arbitrates concurrent [`Access`] requests over one storage.
pub struct AccessManager {
    storage: Arc<dyn Storage>,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl AccessManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            inner: Mutex::new(Inner::new()),
            cond: Condvar::new(),
        }
    }

    /// Request a scoped, disjoint-from-all-writers access to
    /// `[offset, offset+length)`. Blocks until admitted; fails with
    /// [`PagewalError::Conflict`] only if the manager has been closed.
    pub fn access(self: &Arc<Self>, offset: u64, length: u64, writable: bool) -> Result<Access> {
        let mut guard = self.inner.lock().unwrap();
        if guard.closed {
            return Err(PagewalError::Conflict);
        }
        let ticket = guard.next_ticket;
        guard.next_ticket += 1;
        guard.pending.insert(ticket);

        loop {
            if guard.closed {
                guard.pending.remove(&ticket);
                self.cond.notify_all();
                return Err(PagewalError::Conflict);
            }
            let is_oldest_pending = guard.pending.iter().next() == Some(&ticket);
            if is_oldest_pending && guard.compatible_with_active(offset, length, writable) {
                guard.pending.remove(&ticket);
                let idx = guard.insert_ordered(Node {
                    offset,
                    length,
                    writable,
                    next: None,
                });
                drop(guard);
                return Ok(Access {
                    manager: self.clone(),
                    slot: idx,
                    offset,
                    length,
                    writable,
                    released: false,
                });
            }
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// Close the manager; any access request still waiting, or arriving
    /// after this call, fails with `Conflict`.
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.closed = true;
        self.cond.notify_all();
    }

    fn release(&self, idx: usize) {
        let mut guard = self.inner.lock().unwrap();
        guard.remove(idx);
        self.cond.notify_all();
    }
}

/// A scoped, acquired sub-range of a storage. Releases on drop.
pub struct Access {
    manager: Arc<AccessManager>,
    slot: usize,
    offset: u64,
    length: u64,
    writable: bool,
    released: bool,
}

impl Access {
    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Explicitly release this access before it would otherwise drop.
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if !self.released {
            self.manager.release(self.slot);
            self.released = true;
        }
    }

    fn endpoint_for_page(&self, page_base: u64) -> Result<Box<dyn Endpoint>> {
        self.manager.storage.acquire_endpoint_at(page_base)
    }
}

impl Drop for Access {
    fn drop(&mut self) {
        self.do_release();
    }
}

impl Endpoint for Access {
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
            let chunk = (crate::PAGE_SIZE - page_local).min(buf.len() - done);
            let endpoint = self.endpoint_for_page(page_base)?;
            endpoint.read_bytes(abs, &mut buf[done..done + chunk])?;
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
            let chunk = (crate::PAGE_SIZE - page_local).min(data.len() - done);
            let endpoint = self.endpoint_for_page(page_base)?;
            endpoint.write_bytes(abs, &data[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::thread;
    use std::time::Duration;

    fn manager_with_size(size: u64) -> Arc<AccessManager> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(true));
        storage.extend_to(size).unwrap();
        Arc::new(AccessManager::new(storage))
    }

    #[test]
    fn disjoint_writers_both_admitted() {
        let mgr = manager_with_size(4 * crate::PAGE_SIZE as u64);
        let a = mgr.access(0, crate::PAGE_SIZE as u64, true).unwrap();
        let b = mgr
            .access(crate::PAGE_SIZE as u64, crate::PAGE_SIZE as u64, true)
            .unwrap();
        drop(a);
        drop(b);
    }

    #[test]
    fn overlapping_writers_serialize() {
        let mgr = manager_with_size(4 * crate::PAGE_SIZE as u64);
        let a = mgr.access(0, 100, true).unwrap();
        let mgr2 = mgr.clone();
        let handle = thread::spawn(move || {
            let _b = mgr2.access(50, 50, true).unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        drop(a);
        handle.join().unwrap();
    }

    #[test]
    fn concurrent_readers_allowed() {
        let mgr = manager_with_size(crate::PAGE_SIZE as u64);
        let a = mgr.access(0, 100, false).unwrap();
        let b = mgr.access(0, 100, false).unwrap();
        drop(a);
        drop(b);
    }

    #[test]
    fn close_fails_pending_and_future_requests() {
        let mgr = manager_with_size(crate::PAGE_SIZE as u64);
        mgr.close();
        assert!(matches!(
            mgr.access(0, 1, false),
            Err(PagewalError::Conflict)
        ));
    }

    #[test]
    fn read_write_roundtrip_crosses_page() {
        let mgr = manager_with_size(3 * crate::PAGE_SIZE as u64);
        let access = mgr
            .access(crate::PAGE_SIZE as u64 - 4, 8, true)
            .unwrap();
        access.write_bytes(crate::PAGE_SIZE as u64 - 4, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut buf = [0u8; 8];
        access
            .read_bytes(crate::PAGE_SIZE as u64 - 4, &mut buf)
            .unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
