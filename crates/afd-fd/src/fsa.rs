//! Filetransfer status area (FSA)
//!
//! One [`HostRecord`] per destination host, shared with every worker. The
//! current table is `fifodir/fsa.stat.<id>` where `<id>` is read from
//! `fifodir/fsa.id`; a sibling process rebuilds the table under a new id
//! when the host configuration changes.
//!
//! Writers that touch the same host fields as the workers take a one-byte
//! `fcntl` write lock on that field first. When more than one is needed the
//! order is always error counter, host status, connections.

use std::mem::{offset_of, size_of};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use afd_config::log_fd_warn;
use afd_config::path::{WorkPaths, FSA_ID_FILE, FSA_STAT_FILE};
use afd_ipc::{HostRecord, WordHeader, AFD_WORD_OFFSET};
use nix::fcntl::{fcntl, FcntlArg};

use crate::error::{FdError, Result};
use crate::region::{MappedTable, Record};

/// Per-host lockable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRegion {
    /// `error_counter`, `error_history`, `first_error_time`
    ErrorCounter,
    /// `host_status`
    HostStatus,
    /// `connections`, `active_transfers`
    Connections,
}

impl LockRegion {
    fn field_offset(self) -> usize {
        match self {
            LockRegion::ErrorCounter => offset_of!(HostRecord, error_counter),
            LockRegion::HostStatus => offset_of!(HostRecord, host_status),
            LockRegion::Connections => offset_of!(HostRecord, connections),
        }
    }
}

/// Held byte-range write lock; released on drop.
#[must_use = "the lock is released when dropped"]
pub struct RegionLock {
    fd: RawFd,
    offset: i64,
}

impl RegionLock {
    fn acquire(fd: RawFd, offset: i64) -> Result<Self> {
        set_lock(fd, offset, libc::F_WRLCK, true)?;
        Ok(Self { fd, offset })
    }
}

impl Drop for RegionLock {
    fn drop(&mut self) {
        if let Err(e) = set_lock(self.fd, self.offset, libc::F_UNLCK, false) {
            log_fd_warn!(
                "Failed to release region lock",
                offset = self.offset,
                error = e.to_string()
            );
        }
    }
}

fn set_lock(fd: RawFd, offset: i64, kind: libc::c_int, wait: bool) -> Result<()> {
    // SAFETY: flock is a plain C struct, zero is a valid initial value.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind as _;
    fl.l_whence = libc::SEEK_SET as _;
    fl.l_start = offset as libc::off_t;
    fl.l_len = 1;
    let arg = if wait {
        FcntlArg::F_SETLKW(&fl)
    } else {
        FcntlArg::F_SETLK(&fl)
    };
    fcntl(fd, arg)?;
    Ok(())
}

/// Read the decimal table id from an `*.id` file.
pub(crate) fn read_id(path: &Path) -> Result<i32> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| FdError::Fatal(format!("cannot read {}: {e}", path.display())))?;
    text.trim()
        .parse()
        .map_err(|_| FdError::Fatal(format!("{} holds no table id", path.display())))
}

/// Create `<base>.<id>` holding `records` and point `<id_file>` at it.
pub(crate) fn create_table<T: Record>(
    paths: &WorkPaths,
    id_file: &str,
    base: &str,
    id: i32,
    records: &[T],
) -> Result<MappedTable<T>> {
    let mut table = MappedTable::create_or_open(&paths.stat_file(base, id), records.len())?;
    for rec in records {
        table.push(*rec)?;
    }
    table.flush()?;
    std::fs::write(paths.fifo(id_file), format!("{id}\n"))?;
    Ok(table)
}

pub struct Fsa {
    table: MappedTable<HostRecord>,
    id: i32,
    paths: WorkPaths,
}

impl Fsa {
    /// Attach to the current FSA. Failing to attach is fatal.
    pub fn attach(paths: &WorkPaths) -> Result<Self> {
        let id = read_id(&paths.fifo(FSA_ID_FILE))?;
        let table = MappedTable::open(&paths.stat_file(FSA_STAT_FILE, id))?;
        Ok(Self {
            table,
            id,
            paths: paths.clone(),
        })
    }

    /// Write a fresh FSA with id `id`. What the host-configuration sibling
    /// does; the supervisor only uses it in tests and tooling.
    pub fn create(paths: &WorkPaths, id: i32, hosts: &[HostRecord]) -> Result<Self> {
        let table = create_table(paths, FSA_ID_FILE, FSA_STAT_FILE, id, hosts)?;
        Ok(Self {
            table,
            id,
            paths: paths.clone(),
        })
    }

    /// Follow `fsa.id` if it moved. Returns true when a new table was mapped.
    pub fn reattach(&mut self) -> Result<bool> {
        let id = read_id(&self.paths.fifo(FSA_ID_FILE))?;
        if id == self.id {
            self.table.remap()?;
            return Ok(false);
        }
        self.table = MappedTable::open(&self.paths.stat_file(FSA_STAT_FILE, id))?;
        self.id = id;
        Ok(true)
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn header(&self) -> &WordHeader {
        self.table.header()
    }

    pub fn hosts(&self) -> &[HostRecord] {
        self.table.as_slice()
    }

    pub fn hosts_mut(&mut self) -> &mut [HostRecord] {
        self.table.as_mut_slice()
    }

    pub fn host(&self, pos: usize) -> Option<&HostRecord> {
        self.table.get(pos)
    }

    pub fn host_mut(&mut self, pos: usize) -> Option<&mut HostRecord> {
        self.table.get_mut(pos)
    }

    pub fn position_of(&self, alias: &str) -> Option<usize> {
        self.hosts().iter().position(|h| h.alias() == alias)
    }

    pub fn position_by_host_id(&self, host_id: u32) -> Option<usize> {
        self.hosts().iter().position(|h| h.host_id == host_id)
    }

    /// Lock one field of host `pos`.
    pub fn lock(&self, pos: usize, region: LockRegion) -> Result<RegionLock> {
        let offset = AFD_WORD_OFFSET + pos * size_of::<HostRecord>() + region.field_offset();
        RegionLock::acquire(self.table.file().as_raw_fd(), offset as i64)
    }

    /// Lock for bulk integrity scans (header byte 6).
    pub fn lock_check_entries(&self) -> Result<RegionLock> {
        RegionLock::acquire(
            self.table.file().as_raw_fd(),
            offset_of!(WordHeader, lock_byte) as i64,
        )
    }

    pub fn flush(&self) -> Result<()> {
        self.table.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afd_config::testing::TestEnvironment;

    #[test]
    fn test_create_and_attach() {
        let env = TestEnvironment::new().unwrap();
        Fsa::create(&env.paths, 3, &[HostRecord::new("alpha", 1), HostRecord::new("beta", 2)])
            .unwrap();
        let fsa = Fsa::attach(&env.paths).unwrap();
        assert_eq!(fsa.id(), 3);
        assert_eq!(fsa.len(), 2);
        assert_eq!(fsa.position_of("beta"), Some(1));
        assert_eq!(fsa.position_by_host_id(1), Some(0));
        assert_eq!(fsa.position_of("gamma"), None);
    }

    #[test]
    fn test_attach_without_id_is_fatal() {
        let env = TestEnvironment::new().unwrap();
        assert!(matches!(Fsa::attach(&env.paths), Err(FdError::Fatal(_))));
    }

    #[test]
    fn test_reattach_follows_id() {
        let env = TestEnvironment::new().unwrap();
        let mut fsa = Fsa::create(&env.paths, 1, &[HostRecord::new("alpha", 1)]).unwrap();
        assert!(!fsa.reattach().unwrap());
        Fsa::create(&env.paths, 2, &[HostRecord::new("alpha", 1), HostRecord::new("beta", 2)])
            .unwrap();
        assert!(fsa.reattach().unwrap());
        assert_eq!(fsa.id(), 2);
        assert_eq!(fsa.len(), 2);
    }

    #[test]
    fn test_locks_nest_in_order() {
        let env = TestEnvironment::new().unwrap();
        let mut fsa = Fsa::create(&env.paths, 1, &[HostRecord::new("alpha", 1)]).unwrap();
        {
            let _ec = fsa.lock(0, LockRegion::ErrorCounter).unwrap();
            let _hs = fsa.lock(0, LockRegion::HostStatus).unwrap();
            let _con = fsa.lock(0, LockRegion::Connections).unwrap();
            let _all = fsa.lock_check_entries().unwrap();
        }
        fsa.host_mut(0).unwrap().error_counter = 1;
        assert_eq!(fsa.host(0).unwrap().error_counter, 1);
    }
}
