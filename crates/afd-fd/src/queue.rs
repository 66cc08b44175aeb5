//! Priority queue of transfer jobs (QB)
//!
//! A mapped array of [`QueueEntry`] kept sorted ascending by msg-number.
//! Entries with equal msg-number keep arrival order. The buffer outlives the
//! supervisor; [`Queue::recover_after_restart`] turns what a previous run
//! left behind back into pending work.
//!
//! Counters that mirror the queue (host `jobs_queued`, FRA `queued`) are
//! kept by the supervisor, not here.

use std::path::Path;

use afd_config::{log_queue_debug, log_queue_warn};
use afd_ipc::{QueueEntry, AWAIT_BURST_ACK, PENDING};

use crate::ageing;
use crate::error::Result;
use crate::region::MappedTable;

/// What [`Queue::recover_after_restart`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Recovery {
    pub reset: usize,
    pub dropped_fetch: usize,
}

pub struct Queue {
    table: MappedTable<QueueEntry>,
}

impl Queue {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            table: MappedTable::create_or_open(path, 0)?,
        })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    pub fn entries(&self) -> &[QueueEntry] {
        self.table.as_slice()
    }

    pub fn get(&self, pos: usize) -> Option<&QueueEntry> {
        self.table.get(pos)
    }

    pub fn get_mut(&mut self, pos: usize) -> Option<&mut QueueEntry> {
        self.table.get_mut(pos)
    }

    /// First position whose msg-number is strictly greater than `key`.
    fn insertion_point(&self, key: f64) -> usize {
        self.entries().partition_point(|e| e.msg_number <= key)
    }

    /// Insert keeping the order; returns the position of the new entry.
    pub fn insert(&mut self, entry: QueueEntry) -> Result<usize> {
        let entries = self.entries();
        let pos = match (entries.first(), entries.last()) {
            (None, _) => 0,
            (Some(head), _) if entry.msg_number < head.msg_number => 0,
            (_, Some(tail)) if entry.msg_number >= tail.msg_number => entries.len(),
            _ => self.insertion_point(entry.msg_number),
        };
        self.table.insert(pos, entry)?;
        log_queue_debug!(
            "Queued",
            pos = pos,
            msg_name = entry.msg_name(),
            queued = self.len()
        );
        Ok(pos)
    }

    pub fn remove(&mut self, pos: usize) -> QueueEntry {
        let entry = self.table.remove(pos);
        log_queue_debug!("Removed", pos = pos, msg_name = entry.msg_name());
        entry
    }

    /// Age the entry at `pos` after a failed attempt and move it back to
    /// its ordered place. `retries` must already count this failure.
    /// Returns the new position.
    pub fn resort_on_failure(&mut self, pos: usize, ageing: u8, now: i64) -> usize {
        let Some(entry) = self.table.get_mut(pos) else {
            return pos;
        };
        let aged = ageing::aged_msg_number(entry.msg_number, entry.retries, ageing, now);
        if aged == entry.msg_number {
            return pos;
        }
        entry.msg_number = aged;

        let entries = self.table.as_mut_slice();
        let mut i = pos;
        while i + 1 < entries.len() && entries[i + 1].msg_number <= aged {
            entries.swap(i, i + 1);
            i += 1;
        }
        i
    }

    pub fn position_by_msg_name(&self, name: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.msg_name() == name)
    }

    /// Entry currently worked on by `pid`.
    pub fn position_by_pid(&self, pid: i32) -> Option<usize> {
        if pid <= 0 {
            return None;
        }
        self.entries()
            .iter()
            .position(|e| e.pid == pid && e.special_flag & AWAIT_BURST_ACK == 0)
    }

    /// Reset state a previous run left behind: every entry becomes pending
    /// and fetch jobs are dropped, their FRA positions may be stale.
    pub fn recover_after_restart(&mut self) -> Recovery {
        let dropped_fetch = self.table.retain(|e| !e.is_fetch());
        let mut reset = 0;
        for e in self.table.as_mut_slice() {
            if e.pid != PENDING {
                reset += 1;
            }
            e.pid = PENDING;
            e.connect_pos = -1;
            e.special_flag &= !AWAIT_BURST_ACK;
        }
        if reset > 0 || dropped_fetch > 0 {
            log_queue_warn!(
                "Recovered queue from previous run",
                reset = reset,
                dropped_fetch = dropped_fetch,
                remaining = self.len()
            );
        }
        Recovery {
            reset,
            dropped_fetch,
        }
    }

    /// True when the entries are sorted ascending by msg-number.
    pub fn is_sorted(&self) -> bool {
        self.entries()
            .windows(2)
            .all(|w| w[0].msg_number <= w[1].msg_number)
    }

    pub fn flush(&self) -> Result<()> {
        self.table.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afd_ipc::{msg_number, FETCH_JOB};

    fn entry(name: &str, priority: u8, ct: i64, unique: u32) -> QueueEntry {
        let mut e = QueueEntry::new(name, priority, ct, 0);
        e.msg_number = msg_number(priority, ct, unique, 0);
        e
    }

    fn open() -> (tempfile::TempDir, Queue) {
        let tmp = tempfile::tempdir().unwrap();
        let q = Queue::open(&tmp.path().join("msg_queue")).unwrap();
        (tmp, q)
    }

    fn names(q: &Queue) -> Vec<&str> {
        q.entries().iter().map(|e| e.msg_name()).collect()
    }

    #[test]
    fn test_insert_orders_by_msg_number() {
        let (_tmp, mut q) = open();
        assert_eq!(q.insert(entry("b", b'5', 1001, 0)).unwrap(), 0);
        assert_eq!(q.insert(entry("c", b'5', 1002, 0)).unwrap(), 1);
        assert_eq!(q.insert(entry("a", b'5', 1000, 0)).unwrap(), 0);
        assert_eq!(q.insert(entry("urgent", b'0', 1005, 0)).unwrap(), 0);
        assert_eq!(q.insert(entry("bb", b'5', 1001, 5)).unwrap(), 3);
        assert_eq!(names(&q), ["urgent", "a", "b", "bb", "c"]);
        assert!(q.is_sorted());
    }

    #[test]
    fn test_equal_keys_keep_arrival_order() {
        let (_tmp, mut q) = open();
        q.insert(entry("x", b'5', 1000, 0)).unwrap();
        q.insert(entry("z", b'5', 2000, 0)).unwrap();
        assert_eq!(q.insert(entry("y1", b'5', 1500, 0)).unwrap(), 1);
        assert_eq!(q.insert(entry("y2", b'5', 1500, 0)).unwrap(), 2);
        assert_eq!(q.insert(entry("z2", b'5', 2000, 0)).unwrap(), 4);
        assert_eq!(names(&q), ["x", "y1", "y2", "z", "z2"]);
    }

    #[test]
    fn test_insert_then_remove_restores() {
        let (_tmp, mut q) = open();
        for (i, ct) in [1000, 1010, 1020, 1030].into_iter().enumerate() {
            q.insert(entry(&format!("j{i}"), b'5', ct, 0)).unwrap();
        }
        let before: Vec<QueueEntry> = q.entries().to_vec();
        let pos = q.insert(entry("mid", b'5', 1015, 0)).unwrap();
        let removed = q.remove(pos);
        assert_eq!(removed.msg_name(), "mid");
        assert_eq!(q.entries(), &before[..]);
    }

    #[test]
    fn test_resort_moves_entry_back() {
        let (_tmp, mut q) = open();
        q.insert(entry("a", b'5', 1000, 0)).unwrap();
        q.insert(entry("b", b'5', 1001, 0)).unwrap();
        q.insert(entry("c", b'5', 1100, 0)).unwrap();
        q.get_mut(0).unwrap().retries = 1;
        let before = q.get(0).unwrap().msg_number;
        // class 4 adds 100000, which lands between b and c.
        let pos = q.resort_on_failure(0, 4, 1_000_000);
        assert_eq!(pos, 1);
        assert_eq!(names(&q), ["b", "a", "c"]);
        assert_eq!(q.get(1).unwrap().msg_number, before + 100_000.0);
        assert!(q.is_sorted());
    }

    #[test]
    fn test_resort_passes_equal_entries() {
        let (_tmp, mut q) = open();
        q.insert(entry("a", b'0', 0, 0)).unwrap();
        q.insert(entry("b", b'0', 0, 10_000)).unwrap();
        q.get_mut(0).unwrap().retries = 1;
        assert_eq!(q.resort_on_failure(0, 1, 1_000_000), 1);
        assert_eq!(names(&q), ["b", "a"]);
    }

    #[test]
    fn test_recover_after_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("msg_queue");
        {
            let mut q = Queue::open(&path).unwrap();
            let mut running = entry("run", b'5', 1000, 0);
            running.pid = 4242;
            running.connect_pos = 3;
            q.insert(running).unwrap();
            let mut fetch = entry("2a", b'5', 1001, 0);
            fetch.special_flag = FETCH_JOB;
            q.insert(fetch).unwrap();
            q.insert(entry("wait", b'5', 1002, 0)).unwrap();
            q.flush().unwrap();
        }
        let mut q = Queue::open(&path).unwrap();
        let rec = q.recover_after_restart();
        assert_eq!(rec, Recovery { reset: 1, dropped_fetch: 1 });
        assert_eq!(names(&q), ["run", "wait"]);
        assert!(q.entries().iter().all(|e| e.pid == PENDING && e.connect_pos == -1));
    }

    #[test]
    fn test_grows_in_powers_of_two() {
        let (_tmp, mut q) = open();
        for i in 0..200 {
            q.insert(entry(&format!("{i}"), b'5', 1000 + i, 0)).unwrap();
        }
        assert_eq!(q.len(), 200);
        assert_eq!(q.capacity(), 256);
        assert!(q.is_sorted());
    }

    #[test]
    fn test_position_by_pid_skips_awaiting_ack() {
        let (_tmp, mut q) = open();
        let mut old = entry("old", b'5', 1000, 0);
        old.pid = 77;
        old.special_flag = AWAIT_BURST_ACK;
        q.insert(old).unwrap();
        let mut new = entry("new", b'5', 1001, 0);
        new.pid = 77;
        q.insert(new).unwrap();
        assert_eq!(q.position_by_pid(77), Some(1));
        assert_eq!(q.position_by_pid(PENDING), None);
    }
}
