//! Connection table: one slot per live worker
//!
//! Slots are in-process only. A slot is free when its hostname is empty and
//! its pid is 0; the host's job-status row it points at is free when
//! `proc_id == -1`. Both are released together by the reaper.

use afd_ipc::{HostRecord, Protocol, QueueEntry};

/// Failures of this kind within [`MAX_LOOP_INTERVAL_BEFORE_RESTART`] seconds
/// end the supervisor with a restart request.
pub const MAX_LOOPS_BEFORE_RESTART: u32 = 10;
pub const MAX_LOOP_INTERVAL_BEFORE_RESTART: i64 = 60;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Connection {
    pub hostname: String,
    pub host_id: u32,
    pub pid: i32,
    pub job_no: usize,
    pub fsa_pos: usize,
    /// Set for fetch workers.
    pub fra_pos: Option<usize>,
    pub protocol: Option<Protocol>,
    /// Port of the send job being worked on, -1 if none.
    pub port: i32,
    pub msg_name: String,
    pub dir_alias: String,
    pub resend: bool,
    pub temp_toggle: bool,
}

impl Connection {
    pub fn is_free(&self) -> bool {
        self.hostname.is_empty() && self.pid == 0
    }

    pub fn is_fetch(&self) -> bool {
        self.fra_pos.is_some()
    }
}

/// Counts failures and trips when too many land inside one interval.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopGuard {
    count: u32,
    first: i64,
}

impl LoopGuard {
    /// Record one failure at `now`; true when the limit is reached.
    pub fn record_failure(&mut self, now: i64) -> bool {
        if self.count == 0 || now - self.first > MAX_LOOP_INTERVAL_BEFORE_RESTART {
            self.first = now;
            self.count = 1;
        } else {
            self.count += 1;
        }
        self.count >= MAX_LOOPS_BEFORE_RESTART
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

pub struct ConnectionTable {
    slots: Vec<Connection>,
    /// Set once the "max connections reached" note was logged.
    pub(crate) full_noted: bool,
    pub(crate) slot_guard: LoopGuard,
    pub(crate) multi_start_guard: LoopGuard,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            slots: vec![Connection::default(); max_connections],
            full_noted: false,
            slot_guard: LoopGuard::default(),
            multi_start_guard: LoopGuard::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Whether the "max connections reached" note is out since the last
    /// slot was released.
    pub fn full_noted(&self) -> bool {
        self.full_noted
    }

    pub fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Connection::is_free)
    }

    pub fn assign(&mut self, slot: usize, conn: Connection) {
        self.slots[slot] = conn;
    }

    /// Free `slot` and return what it held.
    pub fn release(&mut self, slot: usize) -> Connection {
        self.full_noted = false;
        std::mem::take(&mut self.slots[slot])
    }

    pub fn position_by_pid(&self, pid: i32) -> Option<usize> {
        if pid <= 0 {
            return None;
        }
        self.slots.iter().position(|c| c.pid == pid)
    }

    pub fn get(&self, slot: usize) -> Option<&Connection> {
        self.slots.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Connection> {
        self.slots.get_mut(slot)
    }

    /// Occupied slots with their index.
    pub fn live(&self) -> impl Iterator<Item = (usize, &Connection)> {
        self.slots.iter().enumerate().filter(|(_, c)| !c.is_free())
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|c| !c.is_free()).count()
    }

    /// Live slots working for host `fsa_pos`.
    pub fn count_for_host(&self, fsa_pos: usize) -> usize {
        self.live().filter(|(_, c)| c.fsa_pos == fsa_pos).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotResolution {
    Free(usize),
    /// A non-helper fetch of the same directory is already running.
    Duplicate,
    NoSlot,
}

/// Pick the job-status row for `entry` on `host`. `job_id` is the dir id
/// for fetch jobs.
pub fn resolve_job_slot(host: &HostRecord, entry: &QueueEntry, job_id: u32) -> SlotResolution {
    let rows = &host.job_status[..host.job_slots()];
    if entry.is_fetch() && !entry.is_helper() {
        let running = rows
            .iter()
            .any(|js| js.proc_id > 0 && js.job_id == job_id);
        if running {
            return SlotResolution::Duplicate;
        }
    }
    match rows.iter().position(|js| js.is_free()) {
        Some(job_no) => SlotResolution::Free(job_no),
        None => SlotResolution::NoSlot,
    }
}

/// Reset job-status rows whose pid `is_orphan` reports as gone. Returns
/// the number of rows reset; `active_transfers` is recomputed.
pub fn probe_host_slots(host: &mut HostRecord, is_orphan: impl Fn(i32) -> bool) -> usize {
    let slots = host.job_slots();
    let mut reset = 0;
    for js in &mut host.job_status[..slots] {
        if js.proc_id > 0 && is_orphan(js.proc_id) {
            js.reset();
            reset += 1;
        }
    }
    if reset > 0 {
        host.active_transfers = host.live_job_count();
    }
    reset
}
