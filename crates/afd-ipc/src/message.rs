//! Fifo wire records
//!
//! All binary records are fixed width and native endian: producers and the
//! supervisor always run on the same host. A record is never larger than
//! `PIPE_BUF`, so concurrent writers cannot interleave partial records.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("record too short: expected {expected} bytes, got {got}")]
    Short { expected: usize, got: usize },
    #[error("priority byte is zero")]
    NoPriority,
    #[error("unknown command opcode {0}")]
    UnknownCommand(u8),
    #[error("unknown delete selector {0}")]
    UnknownSelector(u8),
    #[error("malformed msg-name: {0}")]
    MsgName(String),
}

// ---------------------------------------------------------------------------
// New-message record (msg_fifo)
// ---------------------------------------------------------------------------

/// Width of one record on the new-message fifo.
pub const MAX_BIN_MSG_LENGTH: usize = 48;

/// A job announced by a producer.
///
/// Layout (48 bytes):
/// ```text
/// offset  field              size
///  0      creation_time      8
///  8      job_id             4
/// 12      split_job_counter  4
/// 16      files_to_send      4
/// 20      file_size_to_send  8
/// 28      dev                8
/// 36      dir_no             4
/// 40      unique_number      4
/// 44      priority           1
/// 45      originator         1
/// 46      _pad               2
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NewMessage {
    pub creation_time: i64,
    pub job_id: u32,
    pub split_job_counter: u32,
    pub files_to_send: u32,
    pub file_size_to_send: u64,
    pub dev: u64,
    pub dir_no: u32,
    pub unique_number: u32,
    pub priority: u8,
    pub originator: u8,
}

impl NewMessage {
    pub const SIZE: usize = MAX_BIN_MSG_LENGTH;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.creation_time.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.job_id.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.split_job_counter.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.files_to_send.to_ne_bytes());
        buf[20..28].copy_from_slice(&self.file_size_to_send.to_ne_bytes());
        buf[28..36].copy_from_slice(&self.dev.to_ne_bytes());
        buf[36..40].copy_from_slice(&self.dir_no.to_ne_bytes());
        buf[40..44].copy_from_slice(&self.unique_number.to_ne_bytes());
        buf[44] = self.priority;
        buf[45] = self.originator;
        buf
    }

    /// Decode and validate one record.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::SIZE {
            return Err(WireError::Short {
                expected: Self::SIZE,
                got: buf.len(),
            });
        }
        let msg = Self {
            creation_time: i64::from_ne_bytes(field(buf, 0)),
            job_id: u32::from_ne_bytes(field(buf, 8)),
            split_job_counter: u32::from_ne_bytes(field(buf, 12)),
            files_to_send: u32::from_ne_bytes(field(buf, 16)),
            file_size_to_send: u64::from_ne_bytes(field(buf, 20)),
            dev: u64::from_ne_bytes(field(buf, 28)),
            dir_no: u32::from_ne_bytes(field(buf, 36)),
            unique_number: u32::from_ne_bytes(field(buf, 40)),
            priority: buf[44],
            originator: buf[45],
        };
        if msg.priority == 0 {
            return Err(WireError::NoPriority);
        }
        Ok(msg)
    }

    pub fn msg_name(&self, with_dev: bool) -> String {
        format_msg_name(
            with_dev.then_some(self.dev),
            self.job_id,
            self.dir_no,
            self.creation_time,
            self.unique_number,
            self.split_job_counter,
        )
    }

    pub fn msg_number(&self) -> f64 {
        msg_number(
            self.priority,
            self.creation_time,
            self.unique_number,
            self.split_job_counter,
        )
    }
}

// ---------------------------------------------------------------------------
// Burst ack record (sf_burst_ack)
// ---------------------------------------------------------------------------

/// Sent by a worker once a job handed over through a burst is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BurstAck {
    pub dev: u64,
    pub job_id: u32,
    pub dir_no: u32,
    pub creation_time: i64,
    pub unique_number: u32,
    pub split_job_counter: u32,
}

impl BurstAck {
    pub const SIZE: usize = 32;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.dev.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.job_id.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.dir_no.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.creation_time.to_ne_bytes());
        buf[24..28].copy_from_slice(&self.unique_number.to_ne_bytes());
        buf[28..32].copy_from_slice(&self.split_job_counter.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::SIZE {
            return Err(WireError::Short {
                expected: Self::SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            dev: u64::from_ne_bytes(field(buf, 0)),
            job_id: u32::from_ne_bytes(field(buf, 8)),
            dir_no: u32::from_ne_bytes(field(buf, 12)),
            creation_time: i64::from_ne_bytes(field(buf, 16)),
            unique_number: u32::from_ne_bytes(field(buf, 24)),
            split_job_counter: u32::from_ne_bytes(field(buf, 28)),
        })
    }

    pub fn msg_name(&self, with_dev: bool) -> String {
        format_msg_name(
            with_dev.then_some(self.dev),
            self.job_id,
            self.dir_no,
            self.creation_time,
            self.unique_number,
            self.split_job_counter,
        )
    }
}

// ---------------------------------------------------------------------------
// Command fifo (fd_cmd)
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdCommand {
    RereadLocalInterfaces = 1,
    FsaAboutToChange = 2,
    ForceRemoteDirCheck = 3,
    FlushMsgFifoDumpQueue = 4,
    CheckFsaEntries = 5,
    SaveStop = 6,
    Stop = 7,
    QuickStop = 8,
}

impl TryFrom<u8> for FdCommand {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => FdCommand::RereadLocalInterfaces,
            2 => FdCommand::FsaAboutToChange,
            3 => FdCommand::ForceRemoteDirCheck,
            4 => FdCommand::FlushMsgFifoDumpQueue,
            5 => FdCommand::CheckFsaEntries,
            6 => FdCommand::SaveStop,
            7 => FdCommand::Stop,
            8 => FdCommand::QuickStop,
            other => return Err(WireError::UnknownCommand(other)),
        })
    }
}

/// Bytes on `queue_list_ready`.
pub const QUEUE_LIST_READY: u8 = 1;
pub const QUEUE_LIST_EMPTY: u8 = 2;

// ---------------------------------------------------------------------------
// Delete fifo (delete_jobs)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteRequest {
    /// Every queued job of a host alias.
    AllJobsFromHost(String),
    /// One queued job by msg-name.
    Message(String),
    /// Every queued fetch job of a dir alias.
    Retrieve(String),
}

impl DeleteRequest {
    pub const ALL_JOBS_FROM_HOST: u8 = 1;
    pub const MESSAGE: u8 = 2;
    pub const RETRIEVE: u8 = 3;

    pub fn to_bytes(&self) -> Vec<u8> {
        let (sel, arg) = match self {
            DeleteRequest::AllJobsFromHost(a) => (Self::ALL_JOBS_FROM_HOST, a),
            DeleteRequest::Message(a) => (Self::MESSAGE, a),
            DeleteRequest::Retrieve(a) => (Self::RETRIEVE, a),
        };
        let mut out = Vec::with_capacity(arg.len() + 2);
        out.push(sel);
        out.extend_from_slice(arg.as_bytes());
        out.push(0);
        out
    }

    /// Parse every complete request in `buf`; returns the requests and the
    /// number of bytes consumed. A trailing partial request is left in place.
    pub fn parse_stream(buf: &[u8]) -> (Vec<Result<Self, WireError>>, usize) {
        let mut out = Vec::new();
        let mut consumed = 0;
        while consumed < buf.len() {
            let rest = &buf[consumed..];
            let Some(nul) = rest.iter().position(|&b| b == 0) else {
                break;
            };
            if nul == 0 {
                // Stray NUL, skip it.
                consumed += 1;
                continue;
            }
            let arg = String::from_utf8_lossy(&rest[1..nul]).into_owned();
            out.push(match rest[0] {
                Self::ALL_JOBS_FROM_HOST => Ok(DeleteRequest::AllJobsFromHost(arg)),
                Self::MESSAGE => Ok(DeleteRequest::Message(arg)),
                Self::RETRIEVE => Ok(DeleteRequest::Retrieve(arg)),
                other => Err(WireError::UnknownSelector(other)),
            });
            consumed += nul + 1;
        }
        (out, consumed)
    }
}

// ---------------------------------------------------------------------------
// Msg-name and sort key
// ---------------------------------------------------------------------------

/// `[<dev>/]<job_id>/<dir_no>/<creation_time>_<unique>_<split>`, lower-case hex.
pub fn format_msg_name(
    dev: Option<u64>,
    job_id: u32,
    dir_no: u32,
    creation_time: i64,
    unique_number: u32,
    split_job_counter: u32,
) -> String {
    match dev {
        Some(dev) => format!(
            "{:x}/{:x}/{:x}/{:x}_{:x}_{:x}",
            dev, job_id, dir_no, creation_time, unique_number, split_job_counter
        ),
        None => format!(
            "{:x}/{:x}/{:x}_{:x}_{:x}",
            job_id, dir_no, creation_time, unique_number, split_job_counter
        ),
    }
}

/// Components of a parsed msg-name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgNameParts {
    pub dev: Option<u64>,
    pub job_id: u32,
    pub dir_no: u32,
    pub creation_time: i64,
    pub unique_number: u32,
    pub split_job_counter: u32,
}

pub fn parse_msg_name(name: &str) -> Result<MsgNameParts, WireError> {
    let bad = || WireError::MsgName(name.to_string());
    let parts: Vec<&str> = name.split('/').collect();
    let (dev, rest) = match parts.len() {
        3 => (None, &parts[..]),
        4 => (
            Some(u64::from_str_radix(parts[0], 16).map_err(|_| bad())?),
            &parts[1..],
        ),
        _ => return Err(bad()),
    };
    let job_id = u32::from_str_radix(rest[0], 16).map_err(|_| bad())?;
    let dir_no = u32::from_str_radix(rest[1], 16).map_err(|_| bad())?;
    let mut tail = rest[2].split('_');
    let mut next = || tail.next().ok_or_else(bad);
    let creation_time = i64::from_str_radix(next()?, 16).map_err(|_| bad())?;
    let unique_number = u32::from_str_radix(next()?, 16).map_err(|_| bad())?;
    let split_job_counter = u32::from_str_radix(next()?, 16).map_err(|_| bad())?;
    Ok(MsgNameParts {
        dev,
        job_id,
        dir_no,
        creation_time,
        unique_number,
        split_job_counter,
    })
}

/// Sort key of a queue entry; `'0'` yields factor 1, `'9'` factor 10.
pub fn msg_number(priority: u8, creation_time: i64, unique_number: u32, split: u32) -> f64 {
    (priority as f64 - 47.0)
        * ((creation_time as f64 * 10000.0) + unique_number as f64 + split as f64)
}

/// Fixed-width field at `at`; callers have checked the record length.
fn field<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}
