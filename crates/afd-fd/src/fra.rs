//! Fileretrieve status area (FRA)
//!
//! One [`RetrieveRecord`] per remote directory the distributor polls.
//! Attached the same way as the FSA, through `fifodir/fra.id`.

use afd_config::path::{WorkPaths, FRA_ID_FILE, FRA_STAT_FILE};
use afd_ipc::{RetrieveRecord, FILES_IN_QUEUE};

use crate::error::Result;
use crate::fsa::{create_table, read_id};
use crate::region::MappedTable;

pub struct Fra {
    table: MappedTable<RetrieveRecord>,
    id: i32,
    paths: WorkPaths,
}

impl Fra {
    pub fn attach(paths: &WorkPaths) -> Result<Self> {
        let id = read_id(&paths.fifo(FRA_ID_FILE))?;
        let table = MappedTable::open(&paths.stat_file(FRA_STAT_FILE, id))?;
        Ok(Self {
            table,
            id,
            paths: paths.clone(),
        })
    }

    pub fn create(paths: &WorkPaths, id: i32, dirs: &[RetrieveRecord]) -> Result<Self> {
        let table = create_table(paths, FRA_ID_FILE, FRA_STAT_FILE, id, dirs)?;
        Ok(Self {
            table,
            id,
            paths: paths.clone(),
        })
    }

    pub fn reattach(&mut self) -> Result<bool> {
        let id = read_id(&self.paths.fifo(FRA_ID_FILE))?;
        if id == self.id {
            self.table.remap()?;
            return Ok(false);
        }
        self.table = MappedTable::open(&self.paths.stat_file(FRA_STAT_FILE, id))?;
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

    pub fn dirs(&self) -> &[RetrieveRecord] {
        self.table.as_slice()
    }

    pub fn dir(&self, pos: usize) -> Option<&RetrieveRecord> {
        self.table.get(pos)
    }

    pub fn dir_mut(&mut self, pos: usize) -> Option<&mut RetrieveRecord> {
        self.table.get_mut(pos)
    }

    pub fn position_by_dir_id(&self, dir_id: u32) -> Option<usize> {
        self.dirs().iter().position(|d| d.dir_id == dir_id)
    }

    pub fn position_of(&self, alias: &str) -> Option<usize> {
        self.dirs().iter().position(|d| d.alias() == alias)
    }

    /// One more fetch job queued for `pos`.
    pub fn inc_queued(&mut self, pos: usize) {
        if let Some(dir) = self.table.get_mut(pos) {
            dir.queued += 1;
            dir.dir_flag |= FILES_IN_QUEUE;
        }
    }

    /// One fetch job for `pos` left the queue. Never goes below zero.
    pub fn dec_queued(&mut self, pos: usize) {
        if let Some(dir) = self.table.get_mut(pos) {
            dir.queued = (dir.queued - 1).max(0);
            if dir.queued == 0 {
                dir.dir_flag &= !FILES_IN_QUEUE;
            }
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.table.flush()
    }
}
