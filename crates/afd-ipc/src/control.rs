//! Burst handshake between the supervisor and a live worker.
//!
//! Two bytes of a [`JobStatus`] row form the control word:
//!
//! ```text
//! unique_name[2]                   file_name_in_use[MAX_FILENAME_LENGTH - 1]
//! 4  helper fetch requested        -
//! 5  idle, ready for the next job  1
//! 6  asked to terminate            -
//! *  busy
//! ```
//!
//! Both bytes live in memory shared with other processes, so they are only
//! touched through atomic byte loads and stores.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::layout::JobStatus;
use crate::{MAX_FILENAME_LENGTH, MAX_MSG_NAME_LENGTH};

const CONTROL_IDX: usize = 2;
const FLAG_IDX: usize = MAX_FILENAME_LENGTH - 1;

const HELPER_REQUEST: u8 = 4;
const READY_FOR_BURST: u8 = 5;
const TERMINATING: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlWord {
    Busy,
    HelperRequest,
    ReadyForBurst,
    Terminating,
}

#[inline]
fn atomic(byte: &u8) -> &AtomicU8 {
    // SAFETY: AtomicU8 has the same size and alignment as u8.
    unsafe { &*(byte as *const u8 as *const AtomicU8) }
}

#[inline]
fn atomic_mut(byte: &mut u8) -> &AtomicU8 {
    // SAFETY: as above; exclusive access makes the store sound in-process.
    unsafe { &*(byte as *mut u8 as *const AtomicU8) }
}

impl ControlWord {
    /// Read the control word of a job-status row.
    pub fn load(js: &JobStatus) -> Self {
        let control = atomic(&js.unique_name[CONTROL_IDX]).load(Ordering::Acquire);
        let flag = atomic(&js.file_name_in_use[FLAG_IDX]).load(Ordering::Acquire);
        match control {
            READY_FOR_BURST if flag == 1 => ControlWord::ReadyForBurst,
            HELPER_REQUEST => ControlWord::HelperRequest,
            TERMINATING => ControlWord::Terminating,
            _ => ControlWord::Busy,
        }
    }

    /// Ask the worker in this row to exit after its current job.
    pub fn request_termination(js: &mut JobStatus) {
        atomic_mut(&mut js.unique_name[CONTROL_IDX]).store(TERMINATING, Ordering::Release);
    }

    /// What a worker does when it goes idle and waits for more work.
    pub fn announce_ready(js: &mut JobStatus) {
        atomic_mut(&mut js.file_name_in_use[FLAG_IDX]).store(1, Ordering::Release);
        atomic_mut(&mut js.unique_name[CONTROL_IDX]).store(READY_FOR_BURST, Ordering::Release);
    }

    /// What a fetch worker does to ask for a helper.
    pub fn announce_helper_request(js: &mut JobStatus) {
        atomic_mut(&mut js.unique_name[CONTROL_IDX]).store(HELPER_REQUEST, Ordering::Release);
    }

    /// Hand a new msg-name to an idle worker. Overwriting `unique_name`
    /// clears the control byte, the burst flag is dropped afterwards.
    pub fn hand_over(js: &mut JobStatus, msg_name: &str) {
        let bytes = msg_name.as_bytes();
        let n = bytes.len().min(MAX_MSG_NAME_LENGTH - 1);
        for i in 0..MAX_MSG_NAME_LENGTH {
            let b = if i < n { bytes[i] } else { 0 };
            atomic_mut(&mut js.unique_name[i]).store(b, Ordering::Release);
        }
        atomic_mut(&mut js.file_name_in_use[FLAG_IDX]).store(0, Ordering::Release);
    }

    /// Tell an idle worker there is nothing more to do.
    pub fn reply_no_more(js: &mut JobStatus) {
        atomic_mut(&mut js.unique_name[0]).store(0, Ordering::Release);
        atomic_mut(&mut js.unique_name[CONTROL_IDX]).store(0, Ordering::Release);
        atomic_mut(&mut js.file_name_in_use[FLAG_IDX]).store(0, Ordering::Release);
    }

    /// Clear a served helper request.
    pub fn clear(js: &mut JobStatus) {
        atomic_mut(&mut js.unique_name[CONTROL_IDX]).store(0, Ordering::Release);
    }
}
