//! # afd-ipc
//!
//! Shared layouts for the file distributor and the processes it co-operates
//! with (protocol workers, message producers, the retrieve watcher).
//!
//! - [`layout`]: `#[repr(C)]` records of the mapped regions (FSA, FRA,
//!   message cache, queue buffer, error queue, ack queue)
//! - [`message`]: fixed-size fifo records, command opcodes, msg-name format
//! - [`exit`]: worker exit codes and their classification
//! - [`control`]: the burst handshake embedded in a job-status record
//!
//! Any field change in [`layout`] is an ABI change for every attached
//! process and must bump [`REGION_VERSION`].

pub mod control;
pub mod exit;
pub mod layout;
pub mod message;

pub use control::ControlWord;
pub use exit::{ExitKind, WorkerExit};
pub use layout::*;
pub use message::*;

/// Size of the word-offset header in front of every mapped table.
pub const AFD_WORD_OFFSET: usize = 8;

/// Layout version stored in byte 7 of every region header.
pub const REGION_VERSION: u8 = 3;

/// Host alias buffer (including NUL).
pub const MAX_HOSTNAME_LENGTH: usize = 16;
/// Real hostname buffer (including NUL).
pub const MAX_REAL_HOSTNAME_LENGTH: usize = 64;
/// Msg-name buffer. The last byte carries the priority character.
pub const MAX_MSG_NAME_LENGTH: usize = 64;
/// File-name-in-use buffer. The last byte is the burst flag.
pub const MAX_FILENAME_LENGTH: usize = 256;
pub const MAX_DIR_ALIAS_LENGTH: usize = 32;
pub const MAX_TIMEZONE_LENGTH: usize = 32;

/// Width of the per-host job-status array.
pub const MAX_NO_PARALLEL_JOBS: usize = 5;
pub const ERROR_HISTORY_LENGTH: usize = 5;
pub const MAX_FRA_TIME_ENTRIES: usize = 12;

/// Queue-entry pid states that are not real pids.
pub const PENDING: i32 = -1;
pub const REMOVED: i32 = -2;

/// `original_toggle_pos` when no toggle is in effect.
pub const NONE: u8 = 0;
pub const HOST_ONE: u8 = 1;
pub const HOST_TWO: u8 = 2;

/// Used in job-status `job_id` when the slot carries no job.
pub const NO_ID: u32 = 0;

/// Copy `s` into a fixed NUL-terminated buffer, truncating if needed.
pub fn set_cstr(buf: &mut [u8], s: &str) {
    let n = s.len().min(buf.len().saturating_sub(1));
    buf[..n].copy_from_slice(&s.as_bytes()[..n]);
    for b in &mut buf[n..] {
        *b = 0;
    }
}

/// Read a NUL-terminated string out of a fixed buffer.
pub fn cstr(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cstr_roundtrip_and_truncation() {
        let mut buf = [0xffu8; 8];
        set_cstr(&mut buf, "abc");
        assert_eq!(cstr(&buf), "abc");
        assert_eq!(&buf[3..], &[0; 5]);

        set_cstr(&mut buf, "0123456789");
        assert_eq!(cstr(&buf), "0123456");
        assert_eq!(buf[7], 0);
    }

    #[test]
    fn test_cstr_invalid_utf8_is_empty() {
        let buf = [0xff, 0xfe, 0];
        assert_eq!(cstr(&buf), "");
    }
}
