//! Error queue
//!
//! Jobs whose next attempt lies in the future. The dispatcher asks
//! [`ErrorQueue::blocks`] before starting a job that failed before; the
//! reaper adds or refreshes entries after a fault. Keyed by job id for send
//! jobs and dir id for fetch jobs.

use std::path::Path;

use afd_ipc::ErrorQueueEntry;

use crate::error::Result;
use crate::region::MappedTable;

pub struct ErrorQueue {
    table: MappedTable<ErrorQueueEntry>,
}

impl ErrorQueue {
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

    pub fn entries(&self) -> &[ErrorQueueEntry] {
        self.table.as_slice()
    }

    fn position(&self, job_id: u32) -> Option<usize> {
        self.entries().iter().position(|e| e.job_id == job_id)
    }

    pub fn contains(&self, job_id: u32) -> bool {
        self.position(job_id).is_some()
    }

    /// True while `job_id` has a retry time that has not been reached.
    pub fn blocks(&self, job_id: u32, now: i64) -> bool {
        self.position(job_id)
            .and_then(|pos| self.table.get(pos))
            .is_some_and(|e| e.next_retry_time > now)
    }

    /// Record a failure of `job_id`; refreshes the retry time if present.
    pub fn add(&mut self, job_id: u32, host_id: u32, next_retry_time: i64) -> Result<()> {
        if let Some(pos) = self.position(job_id) {
            if let Some(e) = self.table.get_mut(pos) {
                e.next_retry_time = next_retry_time;
                e.host_id = host_id;
            }
            return Ok(());
        }
        self.table.push(ErrorQueueEntry {
            next_retry_time,
            job_id,
            host_id,
        })?;
        Ok(())
    }

    /// Move every entry of `host_id` to `next_retry_time`.
    pub fn update_time(&mut self, host_id: u32, next_retry_time: i64) -> usize {
        let mut n = 0;
        for e in self.table.as_mut_slice() {
            if e.host_id == host_id {
                e.next_retry_time = next_retry_time;
                n += 1;
            }
        }
        n
    }

    pub fn remove(&mut self, job_id: u32) -> bool {
        match self.position(job_id) {
            Some(pos) => {
                self.table.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Drop every entry of a host, e.g. after a successful transfer.
    pub fn remove_host(&mut self, host_id: u32) -> usize {
        self.table.retain(|e| e.host_id != host_id)
    }

    pub fn host_has_entries(&self, host_id: u32) -> bool {
        self.entries().iter().any(|e| e.host_id == host_id)
    }

    pub fn flush(&self) -> Result<()> {
        self.table.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, ErrorQueue) {
        let tmp = tempfile::tempdir().unwrap();
        let eq = ErrorQueue::open(&tmp.path().join("error_queue")).unwrap();
        (tmp, eq)
    }

    #[test]
    fn test_blocks_until_retry_time() {
        let (_tmp, mut eq) = open();
        eq.add(7, 1, 130).unwrap();
        assert!(eq.blocks(7, 100));
        assert!(eq.blocks(7, 129));
        assert!(!eq.blocks(7, 130));
        assert!(!eq.blocks(8, 100));
    }

    #[test]
    fn test_add_refreshes_existing() {
        let (_tmp, mut eq) = open();
        eq.add(7, 1, 130).unwrap();
        eq.add(7, 1, 200).unwrap();
        assert_eq!(eq.len(), 1);
        assert_eq!(eq.entries()[0].next_retry_time, 200);
    }

    #[test]
    fn test_remove_and_remove_host() {
        let (_tmp, mut eq) = open();
        eq.add(1, 10, 0).unwrap();
        eq.add(2, 10, 0).unwrap();
        eq.add(3, 11, 0).unwrap();
        assert!(eq.remove(1));
        assert!(!eq.remove(1));
        assert_eq!(eq.update_time(11, 500), 1);
        assert_eq!(eq.remove_host(10), 1);
        assert!(!eq.host_has_entries(10));
        assert!(eq.host_has_entries(11));
        assert!(eq.blocks(3, 499));
    }
}
