//! Burst ack queue
//!
//! With `FD_BURST_ACK` on, a job replaced by a burst hand-over is not
//! removed right away. Its msg-name is parked here until the worker confirms
//! it on `sf_burst_ack`, or [`ACK_QUE_TIMEOUT`] passes and the job goes back
//! to pending.

use std::path::Path;

use afd_ipc::AckEntry;

use crate::error::Result;
use crate::region::MappedTable;

pub const ACK_QUE_TIMEOUT: i64 = 120;

pub struct AckQueue {
    table: MappedTable<AckEntry>,
}

impl AckQueue {
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

    pub fn add(&mut self, msg_name: &str, now: i64) -> Result<()> {
        self.table.push(AckEntry::new(msg_name, now))?;
        Ok(())
    }

    pub fn remove(&mut self, msg_name: &str) -> bool {
        match self
            .table
            .as_slice()
            .iter()
            .position(|e| e.msg_name() == msg_name)
        {
            Some(pos) => {
                self.table.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Remove and return every msg-name older than `timeout` seconds.
    pub fn expired(&mut self, now: i64, timeout: i64) -> Vec<String> {
        let names: Vec<String> = self
            .table
            .as_slice()
            .iter()
            .filter(|e| now - e.insert_time > timeout)
            .map(|e| e.msg_name().to_string())
            .collect();
        if !names.is_empty() {
            self.table.retain(|e| now - e.insert_time <= timeout);
        }
        names
    }

    pub fn flush(&self) -> Result<()> {
        self.table.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_and_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let mut aq = AckQueue::open(&tmp.path().join("ack_queue")).unwrap();
        aq.add("1/0/a_1_0", 100).unwrap();
        aq.add("1/0/b_1_0", 150).unwrap();
        aq.add("1/0/c_1_0", 200).unwrap();
        assert!(aq.remove("1/0/b_1_0"));
        assert!(!aq.remove("1/0/b_1_0"));

        assert!(aq.expired(220, ACK_QUE_TIMEOUT).is_empty());
        assert_eq!(aq.expired(221, ACK_QUE_TIMEOUT), ["1/0/a_1_0"]);
        assert_eq!(aq.len(), 1);
    }
}
