//! Word-offset mapped tables
//!
//! Every shared table is a file that starts with an 8-byte [`WordHeader`]
//! (element count, feature byte, change counter, lock byte, version)
//! followed by a flat array of `#[repr(C)]` records. The file is mapped
//! read-write and shared with every other process that attaches to it.

use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::mem::size_of;
use std::path::{Path, PathBuf};

use afd_config::{log_fd_debug, log_fd_info};
use afd_ipc::{
    AckEntry, ErrorQueueEntry, HostRecord, MsgCacheRecord, QueueEntry, RetrieveRecord,
    WordHeader, AFD_WORD_OFFSET, REGION_VERSION,
};
use memmap2::MmapMut;

use crate::error::{FdError, Result};

/// A record that may live in a mapped table.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no pointers and be valid for
/// every bit pattern, alignment at most 8.
pub unsafe trait Record: Copy + 'static {}

unsafe impl Record for HostRecord {}
unsafe impl Record for RetrieveRecord {}
unsafe impl Record for MsgCacheRecord {}
unsafe impl Record for QueueEntry {}
unsafe impl Record for ErrorQueueEntry {}
unsafe impl Record for AckEntry {}

/// Smallest table the supervisor creates.
pub const MIN_TABLE_CAPACITY: usize = 64;

pub struct MappedTable<T: Record> {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: Record> MappedTable<T> {
    /// Open a table, creating it (or growing it) to hold at least
    /// `min_capacity` records. Capacities are powers of two.
    pub fn create_or_open(path: &Path, min_capacity: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len() as usize;
        let fresh = len == 0;
        let capacity = Self::capacity_for_len(len).max(Self::round_capacity(min_capacity));
        let wanted = Self::len_for_capacity(capacity);
        if len < wanted {
            file.set_len(wanted as u64)?;
            log_fd_info!(
                "Sized mapped table",
                path = path.display().to_string(),
                capacity = capacity
            );
        }

        // SAFETY: the file stays open for the lifetime of the map.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let mut table = Self {
            file,
            mmap,
            path: path.to_path_buf(),
            capacity,
            _marker: PhantomData,
        };

        if fresh {
            *table.header_mut() = WordHeader {
                version: REGION_VERSION,
                ..WordHeader::default()
            };
            table.mmap.flush()?;
            log_fd_debug!("Initialized table header", path = path.display().to_string());
        } else {
            table.validate()?;
        }
        Ok(table)
    }

    /// Attach to a table some other process created. The file must exist.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| FdError::region(path, format!("cannot open: {e}")))?;
        let len = file.metadata()?.len() as usize;
        if len < AFD_WORD_OFFSET {
            return Err(FdError::region(path, "shorter than the word-offset header"));
        }
        // SAFETY: the file stays open for the lifetime of the map.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let table = Self {
            file,
            mmap,
            path: path.to_path_buf(),
            capacity: Self::capacity_for_len(len),
            _marker: PhantomData,
        };
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<()> {
        let header = self.header();
        if header.version != REGION_VERSION {
            return Err(FdError::region(
                &self.path,
                format!(
                    "layout version {} does not match {}",
                    header.version, REGION_VERSION
                ),
            ));
        }
        if header.no_of_entries < 0 || header.no_of_entries as usize > self.capacity {
            return Err(FdError::region(
                &self.path,
                format!(
                    "{} entries do not fit {} records of {} bytes",
                    header.no_of_entries,
                    self.capacity,
                    size_of::<T>()
                ),
            ));
        }
        Ok(())
    }

    fn round_capacity(n: usize) -> usize {
        n.max(MIN_TABLE_CAPACITY).next_power_of_two()
    }

    fn capacity_for_len(len: usize) -> usize {
        len.saturating_sub(AFD_WORD_OFFSET) / size_of::<T>()
    }

    fn len_for_capacity(capacity: usize) -> usize {
        AFD_WORD_OFFSET + capacity * size_of::<T>()
    }

    pub fn header(&self) -> &WordHeader {
        // SAFETY: the map is at least AFD_WORD_OFFSET bytes and page aligned.
        unsafe { &*(self.mmap.as_ptr() as *const WordHeader) }
    }

    pub fn header_mut(&mut self) -> &mut WordHeader {
        // SAFETY: as above.
        unsafe { &mut *(self.mmap.as_mut_ptr() as *mut WordHeader) }
    }

    pub fn len(&self) -> usize {
        (self.header().no_of_entries.max(0) as usize).min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn set_len(&mut self, n: usize) {
        self.header_mut().no_of_entries = n as i32;
    }

    /// All records, used or not.
    fn slots(&self) -> &[T] {
        // SAFETY: the map holds `capacity` records after the header and T is
        // a plain record type.
        unsafe {
            std::slice::from_raw_parts(
                self.mmap.as_ptr().add(AFD_WORD_OFFSET) as *const T,
                self.capacity,
            )
        }
    }

    fn slots_mut(&mut self) -> &mut [T] {
        // SAFETY: as above.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.mmap.as_mut_ptr().add(AFD_WORD_OFFSET) as *mut T,
                self.capacity,
            )
        }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.slots()[..self.len()]
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let n = self.len();
        &mut self.slots_mut()[..n]
    }

    pub fn get(&self, i: usize) -> Option<&T> {
        self.as_slice().get(i)
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut T> {
        self.as_mut_slice().get_mut(i)
    }

    /// Grow the backing file to at least `min_capacity` and remap it.
    pub fn grow(&mut self, min_capacity: usize) -> Result<()> {
        let capacity = Self::round_capacity(min_capacity);
        if capacity <= self.capacity {
            return Ok(());
        }
        self.mmap.flush()?;
        self.file
            .set_len(Self::len_for_capacity(capacity) as u64)
            .map_err(|e| FdError::region(&self.path, format!("resize failed: {e}")))?;
        // SAFETY: the file stays open for the lifetime of the map.
        self.mmap = unsafe { MmapMut::map_mut(&self.file) }
            .map_err(|e| FdError::region(&self.path, format!("remap failed: {e}")))?;
        log_fd_info!(
            "Grew mapped table",
            path = self.path.display().to_string(),
            from = self.capacity,
            to = capacity
        );
        self.capacity = capacity;
        Ok(())
    }

    /// Insert `rec` at `pos`, shifting the suffix up by one.
    pub fn insert(&mut self, pos: usize, rec: T) -> Result<()> {
        let n = self.len();
        if n == self.capacity {
            self.grow(self.capacity * 2)?;
        }
        let slots = self.slots_mut();
        slots.copy_within(pos..n, pos + 1);
        slots[pos] = rec;
        self.set_len(n + 1);
        Ok(())
    }

    pub fn push(&mut self, rec: T) -> Result<usize> {
        let n = self.len();
        self.insert(n, rec)?;
        Ok(n)
    }

    /// Remove the record at `pos`, shifting the suffix down by one.
    pub fn remove(&mut self, pos: usize) -> T {
        let n = self.len();
        let slots = self.slots_mut();
        let rec = slots[pos];
        slots.copy_within(pos + 1..n, pos);
        self.set_len(n - 1);
        rec
    }

    /// Keep only the records for which `keep` is true, preserving order.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let n = self.len();
        let slots = self.slots_mut();
        let mut w = 0;
        for r in 0..n {
            if keep(&slots[r]) {
                slots[w] = slots[r];
                w += 1;
            }
        }
        self.set_len(w);
        n - w
    }

    /// Pick up a size change made by another process.
    pub fn remap(&mut self) -> Result<()> {
        let len = self.file.metadata()?.len() as usize;
        // SAFETY: the file stays open for the lifetime of the map.
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        self.capacity = Self::capacity_for_len(len);
        self.validate()
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
