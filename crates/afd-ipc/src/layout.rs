//! Mapped region records shared by the supervisor and every worker
//!
//! All records are `#[repr(C)]` and are accessed in place inside file-backed
//! memory maps that start with an [`AFD_WORD_OFFSET`](crate::AFD_WORD_OFFSET)
//! byte header.

use crate::{
    cstr, set_cstr, ERROR_HISTORY_LENGTH, MAX_DIR_ALIAS_LENGTH, MAX_FILENAME_LENGTH,
    MAX_FRA_TIME_ENTRIES, MAX_HOSTNAME_LENGTH, MAX_MSG_NAME_LENGTH, MAX_NO_PARALLEL_JOBS,
    MAX_REAL_HOSTNAME_LENGTH, MAX_TIMEZONE_LENGTH, NONE, NO_ID, PENDING,
};

// ---------------------------------------------------------------------------
// Header feature flags (byte 4)
// ---------------------------------------------------------------------------

pub const DISABLE_ARCHIVE: u8 = 0x01;
pub const DISABLE_RETRIEVE: u8 = 0x02;

// ---------------------------------------------------------------------------
// Host status bits (HostRecord::host_status)
// ---------------------------------------------------------------------------

pub const PAUSE_QUEUE: u32 = 0x0001;
pub const STOP_TRANSFER: u32 = 0x0002;
pub const HOST_OFFLINE: u32 = 0x0004;
pub const HOST_OFFLINE_TEMP: u32 = 0x0008;
pub const SIMULATE_SEND: u32 = 0x0010;
pub const ERROR_QUEUE_SET: u32 = 0x0020;
pub const HOST_ACTION_SUCCESS: u32 = 0x0040;
pub const AUTO_PAUSE_QUEUE: u32 = 0x0080;
pub const DO_NOT_ARCHIVE: u32 = 0x0100;
pub const HOST_ERROR_ACTION: u32 = 0x0200;
pub const EVENT_STATUS_ERROR: u32 = 0x0400;
pub const EVENT_STATUS_WARN: u32 = 0x0800;
/// Transient event bits cleared when an auto-paused queue is released.
pub const EVENT_STATUS_FLAGS: u32 = EVENT_STATUS_ERROR | EVENT_STATUS_WARN;

// ---------------------------------------------------------------------------
// Host special flags (HostRecord::special_flag)
// ---------------------------------------------------------------------------

pub const HOST_DISABLED: u32 = 0x0001;
pub const DISABLE_BURST: u32 = 0x0002;
pub const KEEP_CON_NO_SEND: u32 = 0x0004;
pub const KEEP_CON_NO_FETCH: u32 = 0x0008;
pub const DO_NOT_DELETE_DATA: u32 = 0x0010;

// ---------------------------------------------------------------------------
// Job-status values
// ---------------------------------------------------------------------------

pub const CONNECT_STATUS_DISCONNECT: u8 = 0;
pub const CONNECT_STATUS_CONNECTING: u8 = 1;
pub const CONNECT_STATUS_NOT_WORKING: u8 = 2;

/// Job-status special flag: worker should yield at its next safe point.
pub const INTERRUPT_JOB: u8 = 0x01;
/// Job-status special flag: the slot runs a helper fetch.
pub const JOB_HELPER: u8 = 0x02;

pub const DEBUG_OFF: u8 = 0;
pub const DEBUG_MODE: u8 = 1;
pub const TRACE_MODE: u8 = 2;
pub const FULL_TRACE_MODE: u8 = 3;

// ---------------------------------------------------------------------------
// Queue-entry special flags (QueueEntry::special_flag)
// ---------------------------------------------------------------------------

pub const FETCH_JOB: u8 = 0x01;
pub const HELPER_JOB: u8 = 0x02;
pub const RESEND_JOB: u8 = 0x04;
/// Entry was handed to a live worker through a burst.
pub const QUEUED_FOR_BURST: u8 = 0x08;
/// Entry was replaced by a burst and waits for the worker's ack.
pub const AWAIT_BURST_ACK: u8 = 0x10;

// ---------------------------------------------------------------------------
// Retrieve dir flags (RetrieveRecord::dir_flag)
// ---------------------------------------------------------------------------

pub const DIR_DISABLED: u32 = 0x0001;
pub const FILES_IN_QUEUE: u32 = 0x0002;

// ---------------------------------------------------------------------------
// Protocols
// ---------------------------------------------------------------------------

/// Transport spoken by a worker. The numeric value is what the regions store.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ftp = 1,
    Loc = 2,
    Smtp = 3,
    Sftp = 4,
    Http = 5,
    Scp = 6,
    Wmo = 7,
    Exec = 8,
}

impl Protocol {
    pub fn from_raw(v: u32) -> Option<Self> {
        Some(match v {
            1 => Protocol::Ftp,
            2 => Protocol::Loc,
            3 => Protocol::Smtp,
            4 => Protocol::Sftp,
            5 => Protocol::Http,
            6 => Protocol::Scp,
            7 => Protocol::Wmo,
            8 => Protocol::Exec,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Ftp => "ftp",
            Protocol::Loc => "loc",
            Protocol::Smtp => "smtp",
            Protocol::Sftp => "sftp",
            Protocol::Http => "http",
            Protocol::Scp => "scp",
            Protocol::Wmo => "wmo",
            Protocol::Exec => "exec",
        }
    }

    /// Whether a `gf_` (fetch) worker exists for this transport.
    pub fn can_fetch(self) -> bool {
        matches!(
            self,
            Protocol::Ftp | Protocol::Sftp | Protocol::Http | Protocol::Exec
        )
    }

    /// Bit used in `HostRecord::protocol`.
    pub fn flag(self) -> u32 {
        1 << (self as u32)
    }

    /// URL scheme used in message definitions.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        Some(match scheme {
            "ftp" => Protocol::Ftp,
            "file" => Protocol::Loc,
            "mailto" => Protocol::Smtp,
            "sftp" => Protocol::Sftp,
            "http" => Protocol::Http,
            "scp" => Protocol::Scp,
            "wmo" => Protocol::Wmo,
            "exec" => Protocol::Exec,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Region header
// ---------------------------------------------------------------------------

/// The 8-byte word-offset header in front of every mapped table.
///
/// ```text
/// offset  field           size
///  0      no_of_entries   4
///  4      feature_flag    1   (DISABLE_ARCHIVE | DISABLE_RETRIEVE)
///  5      change_counter  1   (bumped by the host config owner)
///  6      lock_byte       1   (LOCK_CHECK_FSA_ENTRIES)
///  7      version         1
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct WordHeader {
    pub no_of_entries: i32,
    pub feature_flag: u8,
    pub change_counter: u8,
    pub lock_byte: u8,
    pub version: u8,
}

const _: () = assert!(std::mem::size_of::<WordHeader>() == crate::AFD_WORD_OFFSET);

// ---------------------------------------------------------------------------
// Job status (one per parallel transfer of a host)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct JobStatus {
    pub file_size: i64,
    pub file_size_done: u64,
    pub file_size_in_use: i64,
    pub file_size_in_use_done: u64,
    pub bytes_send: u64,
    pub proc_id: i32,
    pub no_of_files: i32,
    pub no_of_files_done: i32,
    /// Job id of a send job, dir id of a fetch job.
    pub job_id: u32,
    pub connect_status: u8,
    pub special_flag: u8,
    pub _pad: [u8; 6],
    /// Last byte is the burst flag (see [`crate::control`]).
    pub file_name_in_use: [u8; MAX_FILENAME_LENGTH],
    /// Msg-name of the running job; byte 2 doubles as the control word.
    pub unique_name: [u8; MAX_MSG_NAME_LENGTH],
}

impl JobStatus {
    pub const fn empty() -> Self {
        Self {
            file_size: 0,
            file_size_done: 0,
            file_size_in_use: 0,
            file_size_in_use_done: 0,
            bytes_send: 0,
            proc_id: -1,
            no_of_files: 0,
            no_of_files_done: 0,
            job_id: NO_ID,
            connect_status: CONNECT_STATUS_DISCONNECT,
            special_flag: 0,
            _pad: [0; 6],
            file_name_in_use: [0; MAX_FILENAME_LENGTH],
            unique_name: [0; MAX_MSG_NAME_LENGTH],
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.proc_id == -1
    }

    /// Return the row to its free state.
    pub fn reset(&mut self) {
        *self = Self::empty();
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::empty()
    }
}

// ---------------------------------------------------------------------------
// Host record (FSA entry)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostRecord {
    pub host_alias: [u8; MAX_HOSTNAME_LENGTH],
    pub real_hostname: [[u8; MAX_REAL_HOSTNAME_LENGTH]; 2],
    pub first_error_time: i64,
    pub last_retry_time: i64,
    pub last_connection: i64,
    pub total_file_size: i64,
    pub bytes_send: u64,
    pub transfer_rate_limit: i64,
    pub trl_per_process: i64,
    pub transfer_timeout: i64,
    pub host_id: u32,
    /// Bitmask of [`Protocol::flag`].
    pub protocol: u32,
    pub protocol_options: u32,
    pub host_status: u32,
    pub special_flag: u32,
    pub allowed_transfers: i32,
    pub active_transfers: i32,
    pub error_counter: i32,
    pub max_errors: i32,
    pub retry_interval: i32,
    pub max_successful_retries: i32,
    pub successful_retries: i32,
    pub total_file_counter: i32,
    pub jobs_queued: u32,
    pub keep_connected: u32,
    pub connections: u32,
    pub burst2_counter: u32,
    pub file_counter_done: u32,
    pub host_toggle: u8,
    pub original_toggle_pos: u8,
    pub auto_toggle: u8,
    pub debug: u8,
    pub error_history: [u8; ERROR_HISTORY_LENGTH],
    pub _pad: [u8; 3],
    pub job_status: [JobStatus; MAX_NO_PARALLEL_JOBS],
}

impl HostRecord {
    pub fn new(alias: &str, host_id: u32) -> Self {
        let mut host = Self {
            host_alias: [0; MAX_HOSTNAME_LENGTH],
            real_hostname: [[0; MAX_REAL_HOSTNAME_LENGTH]; 2],
            first_error_time: 0,
            last_retry_time: 0,
            last_connection: 0,
            total_file_size: 0,
            bytes_send: 0,
            transfer_rate_limit: 0,
            trl_per_process: 0,
            transfer_timeout: 120,
            host_id,
            protocol: 0,
            protocol_options: 0,
            host_status: 0,
            special_flag: 0,
            allowed_transfers: 2,
            active_transfers: 0,
            error_counter: 0,
            max_errors: 10,
            retry_interval: 120,
            max_successful_retries: 0,
            successful_retries: 0,
            total_file_counter: 0,
            jobs_queued: 0,
            keep_connected: 0,
            connections: 0,
            burst2_counter: 0,
            file_counter_done: 0,
            host_toggle: crate::HOST_ONE,
            original_toggle_pos: NONE,
            auto_toggle: 0,
            debug: DEBUG_OFF,
            error_history: [0; ERROR_HISTORY_LENGTH],
            _pad: [0; 3],
            job_status: [JobStatus::empty(); MAX_NO_PARALLEL_JOBS],
        };
        set_cstr(&mut host.host_alias, alias);
        host
    }

    pub fn alias(&self) -> &str {
        cstr(&self.host_alias)
    }

    /// Hostname of the currently active toggle position.
    pub fn active_hostname(&self) -> &str {
        let idx = if self.host_toggle == crate::HOST_TWO { 1 } else { 0 };
        cstr(&self.real_hostname[idx])
    }

    /// Usable width of the job-status array.
    pub fn job_slots(&self) -> usize {
        (self.allowed_transfers.max(0) as usize).min(MAX_NO_PARALLEL_JOBS)
    }

    /// Shift the error history by one and record `code` at position 0.
    pub fn push_error_history(&mut self, code: u8) {
        self.error_history.copy_within(0..ERROR_HISTORY_LENGTH - 1, 1);
        self.error_history[0] = code;
    }

    /// Number of job-status rows that hold a live pid.
    pub fn live_job_count(&self) -> i32 {
        self.job_status.iter().filter(|js| js.proc_id > 0).count() as i32
    }
}

// ---------------------------------------------------------------------------
// Retrieve record (FRA entry)
// ---------------------------------------------------------------------------

/// One crontab-like schedule line.
///
/// Bit layout: `minute` bits 0..=59, `hour` bits 0..=23, `day_of_month`
/// bits 1..=31, `month` bits 0..=11 (January = 0), `day_of_week` bits 1..=7
/// (Monday = 1, Sunday = 7).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeEntry {
    pub minute: u64,
    pub hour: u32,
    pub day_of_month: u32,
    pub month: u16,
    pub day_of_week: u8,
    pub _pad: [u8; 5],
}

impl TimeEntry {
    pub const ALL_MINUTES: u64 = (1 << 60) - 1;
    pub const ALL_HOURS: u32 = (1 << 24) - 1;
    pub const ALL_DAYS_OF_MONTH: u32 = 0xffff_fffe;
    pub const ALL_MONTHS: u16 = (1 << 12) - 1;
    pub const ALL_DAYS_OF_WEEK: u8 = 0xfe;

    /// Entry matching every minute.
    pub fn every_minute() -> Self {
        Self {
            minute: Self::ALL_MINUTES,
            hour: Self::ALL_HOURS,
            day_of_month: Self::ALL_DAYS_OF_MONTH,
            month: Self::ALL_MONTHS,
            day_of_week: Self::ALL_DAYS_OF_WEEK,
            _pad: [0; 5],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RetrieveRecord {
    pub dir_alias: [u8; MAX_DIR_ALIAS_LENGTH],
    pub host_alias: [u8; MAX_HOSTNAME_LENGTH],
    pub timezone: [u8; MAX_TIMEZONE_LENGTH],
    pub next_check_time: i64,
    pub dir_id: u32,
    pub fsa_pos: i32,
    pub dir_flag: u32,
    pub protocol: u32,
    pub queued: i32,
    pub no_of_time_entries: i32,
    /// Mode for directories the worker creates; 0 = worker default.
    pub dir_mode: u32,
    pub priority: u8,
    pub _pad: [u8; 3],
    pub te: [TimeEntry; MAX_FRA_TIME_ENTRIES],
}

impl RetrieveRecord {
    pub fn new(dir_alias: &str, host_alias: &str, dir_id: u32, fsa_pos: i32) -> Self {
        let mut rec = Self {
            dir_alias: [0; MAX_DIR_ALIAS_LENGTH],
            host_alias: [0; MAX_HOSTNAME_LENGTH],
            timezone: [0; MAX_TIMEZONE_LENGTH],
            next_check_time: 0,
            dir_id,
            fsa_pos,
            dir_flag: 0,
            protocol: Protocol::Ftp as u32,
            queued: 0,
            no_of_time_entries: 0,
            dir_mode: 0,
            priority: b'9',
            _pad: [0; 3],
            te: [TimeEntry::default(); MAX_FRA_TIME_ENTRIES],
        };
        set_cstr(&mut rec.dir_alias, dir_alias);
        set_cstr(&mut rec.host_alias, host_alias);
        rec
    }

    pub fn alias(&self) -> &str {
        cstr(&self.dir_alias)
    }

    pub fn timezone(&self) -> Option<&str> {
        let tz = cstr(&self.timezone);
        (!tz.is_empty()).then_some(tz)
    }

    pub fn time_entries(&self) -> &[TimeEntry] {
        let n = (self.no_of_time_entries.max(0) as usize).min(MAX_FRA_TIME_ENTRIES);
        &self.te[..n]
    }
}

// ---------------------------------------------------------------------------
// Message cache record (MDB)
// ---------------------------------------------------------------------------

pub const IN_CURRENT_FSA: u8 = 1;
pub const NOT_IN_CURRENT_FSA: u8 = 0;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MsgCacheRecord {
    pub host_name: [u8; MAX_HOSTNAME_LENGTH],
    pub last_transfer_time: i64,
    /// Mtime of the message file when this record was last read.
    pub msg_time: i64,
    pub job_id: u32,
    pub fsa_pos: i32,
    pub port: i32,
    pub age_limit: u32,
    pub protocol: u32,
    pub ageing: u8,
    pub in_current_fsa: u8,
    pub _pad: [u8; 6],
}

impl MsgCacheRecord {
    pub fn new(host_name: &str, job_id: u32, fsa_pos: i32, protocol: Protocol) -> Self {
        let mut rec = Self {
            host_name: [0; MAX_HOSTNAME_LENGTH],
            last_transfer_time: 0,
            msg_time: 0,
            job_id,
            fsa_pos,
            port: -1,
            age_limit: 0,
            protocol: protocol as u32,
            ageing: 5,
            in_current_fsa: IN_CURRENT_FSA,
            _pad: [0; 6],
        };
        set_cstr(&mut rec.host_name, host_name);
        rec
    }

    pub fn host_name(&self) -> &str {
        cstr(&self.host_name)
    }
}

// ---------------------------------------------------------------------------
// Queue entry (QB)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueEntry {
    pub msg_number: f64,
    pub creation_time: i64,
    pub file_size_to_send: u64,
    /// MDB index for send jobs, FRA index for fetch jobs.
    pub pos: i32,
    pub connect_pos: i32,
    pub pid: i32,
    pub retries: u32,
    pub files_to_send: u32,
    pub special_flag: u8,
    /// Last byte holds the priority character.
    pub msg_name: [u8; MAX_MSG_NAME_LENGTH],
}

impl QueueEntry {
    pub fn new(msg_name: &str, priority: u8, creation_time: i64, pos: i32) -> Self {
        let mut entry = Self {
            msg_number: 0.0,
            creation_time,
            file_size_to_send: 0,
            pos,
            connect_pos: -1,
            pid: PENDING,
            retries: 0,
            files_to_send: 0,
            special_flag: 0,
            msg_name: [0; MAX_MSG_NAME_LENGTH],
        };
        entry.set_msg_name(msg_name);
        entry.msg_name[MAX_MSG_NAME_LENGTH - 1] = priority;
        entry
    }

    pub fn msg_name(&self) -> &str {
        cstr(&self.msg_name[..MAX_MSG_NAME_LENGTH - 1])
    }

    /// Replace the name, keeping the priority byte.
    pub fn set_msg_name(&mut self, name: &str) {
        set_cstr(&mut self.msg_name[..MAX_MSG_NAME_LENGTH - 1], name);
    }

    pub fn priority(&self) -> u8 {
        self.msg_name[MAX_MSG_NAME_LENGTH - 1]
    }

    #[inline]
    pub fn is_fetch(&self) -> bool {
        self.special_flag & FETCH_JOB != 0
    }

    #[inline]
    pub fn is_helper(&self) -> bool {
        self.special_flag & HELPER_JOB != 0
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pid == PENDING
    }

    /// Assigned to a worker and not parked behind a burst ack.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.pid > 0 && self.special_flag & AWAIT_BURST_ACK == 0
    }
}

// ---------------------------------------------------------------------------
// Error queue / ack queue
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorQueueEntry {
    pub next_retry_time: i64,
    pub job_id: u32,
    pub host_id: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AckEntry {
    pub insert_time: i64,
    pub msg_name: [u8; MAX_MSG_NAME_LENGTH],
}

impl AckEntry {
    pub fn new(msg_name: &str, insert_time: i64) -> Self {
        let mut entry = Self {
            insert_time,
            msg_name: [0; MAX_MSG_NAME_LENGTH],
        };
        set_cstr(&mut entry.msg_name, msg_name);
        entry
    }

    pub fn msg_name(&self) -> &str {
        cstr(&self.msg_name)
    }
}
