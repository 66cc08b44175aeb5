//! Operator-facing log records
//!
//! Event, delete and transfer records are pipe-separated lines written to
//! fifos read by the log writers. Writes never block: a fifo without reader
//! or with a full buffer drops the record.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use afd_config::path::{
    WorkPaths, DELETE_LOG_FIFO, EVENT_LOG_FIFO, QUEUE_LIST_READY_FIFO, TRANSFER_LOG_FIFO,
};
use afd_config::{log_fifo_debug, log_fifo_warn};
use walkdir::WalkDir;

/// Host actions reported on the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    ErrorActionStart,
    ErrorActionStop,
    SuccessActionStart,
    AutoPauseQueueStop,
}

impl HostEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            HostEvent::ErrorActionStart => "ERROR_ACTION start",
            HostEvent::ErrorActionStop => "ERROR_ACTION stop",
            HostEvent::SuccessActionStart => "SUCCESS_ACTION start",
            HostEvent::AutoPauseQueueStop => "AUTO_PAUSE_QUEUE stop",
        }
    }
}

/// Why job files were deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    AgeOutput,
    UserDel,
    JidMissing,
    NoHost,
    StaleError,
}

impl DeleteReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeleteReason::AgeOutput => "AGE_OUTPUT",
            DeleteReason::UserDel => "USER_DEL",
            DeleteReason::JidMissing => "JID_LOOKUP_FAILED",
            DeleteReason::NoHost => "HOST_NOT_IN_FSA",
            DeleteReason::StaleError => "STALE_ERROR_JOB",
        }
    }
}

enum Target {
    Fifo { path: PathBuf, file: Option<File> },
    Memory(Vec<Vec<u8>>),
}

/// One output fifo.
pub struct LogSink {
    target: Target,
}

impl LogSink {
    pub fn fifo(path: PathBuf) -> Self {
        Self {
            target: Target::Fifo { path, file: None },
        }
    }

    /// Keeps every record; used by tests.
    pub fn memory() -> Self {
        Self {
            target: Target::Memory(Vec::new()),
        }
    }

    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
    }

    /// Write one raw record.
    pub fn write_raw(&mut self, record: &[u8]) {
        match &mut self.target {
            Target::Memory(records) => records.push(record.to_vec()),
            Target::Fifo { path, file } => {
                if file.is_none() {
                    match Self::open(path) {
                        Ok(f) => *file = Some(f),
                        Err(e) => {
                            log_fifo_debug!(
                                "Log fifo not writable, record dropped",
                                path = path.display().to_string(),
                                error = e.to_string()
                            );
                            return;
                        }
                    }
                }
                if let Some(f) = file {
                    if let Err(e) = f.write_all(record) {
                        log_fifo_debug!(
                            "Log record dropped",
                            path = path.display().to_string(),
                            error = e.to_string()
                        );
                        if e.kind() != io::ErrorKind::WouldBlock {
                            *file = None;
                        }
                    }
                }
            }
        }
    }

    pub fn write_line(&mut self, line: &str) {
        let mut rec = Vec::with_capacity(line.len() + 1);
        rec.extend_from_slice(line.as_bytes());
        rec.push(b'\n');
        self.write_raw(&rec);
    }

    /// Records written so far; empty for fifo sinks.
    pub fn lines(&self) -> Vec<String> {
        match &self.target {
            Target::Memory(records) => records
                .iter()
                .map(|r| String::from_utf8_lossy(r).trim_end_matches('\n').to_string())
                .collect(),
            Target::Fifo { .. } => Vec::new(),
        }
    }

    pub fn raw(&self) -> &[Vec<u8>] {
        match &self.target {
            Target::Memory(records) => records,
            Target::Fifo { .. } => &[],
        }
    }
}

pub struct Sinks {
    pub event: LogSink,
    pub delete: LogSink,
    pub transfer: LogSink,
    pub queue_list_ready: LogSink,
}

impl Sinks {
    pub fn new(paths: &WorkPaths) -> Self {
        Self {
            event: LogSink::fifo(paths.fifo(EVENT_LOG_FIFO)),
            delete: LogSink::fifo(paths.fifo(DELETE_LOG_FIFO)),
            transfer: LogSink::fifo(paths.fifo(TRANSFER_LOG_FIFO)),
            queue_list_ready: LogSink::fifo(paths.fifo(QUEUE_LIST_READY_FIFO)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            event: LogSink::memory(),
            delete: LogSink::memory(),
            transfer: LogSink::memory(),
            queue_list_ready: LogSink::memory(),
        }
    }

    pub fn host_event(&mut self, now: i64, host: &str, event: HostEvent) {
        self.event
            .write_line(&format!("{now}|{host}|{}", event.as_str()));
    }

    pub fn transfer(&mut self, now: i64, host: &str, text: &str) {
        self.transfer.write_line(&format!("{now}|{host}|{text}"));
    }

    pub fn deleted(&mut self, now: i64, host: &str, reason: DeleteReason, msg_name: &str, file: &str) {
        self.delete
            .write_line(&format!("{now}|{host}|{}|{msg_name}|{file}", reason.as_str()));
    }
}

/// Remove the spool directory of `msg_name` and log every file in it.
/// Returns the number of files deleted.
pub fn purge_job_dir(
    sinks: &mut Sinks,
    paths: &WorkPaths,
    msg_name: &str,
    host: &str,
    reason: DeleteReason,
    now: i64,
) -> usize {
    let dir = paths.job_dir(msg_name);
    if !dir.is_dir() {
        sinks.deleted(now, host, reason, msg_name, "-");
        return 0;
    }
    let mut files = 0;
    for entry in WalkDir::new(&dir).min_depth(1).into_iter().flatten() {
        if entry.file_type().is_file() {
            let name = entry.file_name().to_string_lossy();
            sinks.deleted(now, host, reason, msg_name, &name);
            files += 1;
        }
    }
    if let Err(e) = std::fs::remove_dir_all(&dir) {
        log_fifo_warn!(
            "Failed to remove job directory",
            dir = dir.display().to_string(),
            error = e.to_string()
        );
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use afd_config::testing::TestEnvironment;

    #[test]
    fn test_memory_sink_lines() {
        let mut sinks = Sinks::in_memory();
        sinks.host_event(100, "alpha", HostEvent::ErrorActionStart);
        sinks.transfer(101, "alpha", "toggle back");
        assert_eq!(sinks.event.lines(), ["100|alpha|ERROR_ACTION start"]);
        assert_eq!(sinks.transfer.lines(), ["101|alpha|toggle back"]);
    }

    #[test]
    fn test_fifo_without_reader_drops() {
        let env = TestEnvironment::new().unwrap();
        let path = env.paths.fifo("event_log");
        nix::unistd::mkfifo(&path, nix::sys::stat::Mode::S_IRWXU).unwrap();
        let mut sink = LogSink::fifo(path);
        sink.write_line("dropped");
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_purge_job_dir_logs_each_file() {
        let env = TestEnvironment::new().unwrap();
        env.create_job_dir("1/0/64_1_0", 3).unwrap();
        let mut sinks = Sinks::in_memory();
        let n = purge_job_dir(&mut sinks, &env.paths, "1/0/64_1_0", "alpha", DeleteReason::AgeOutput, 200);
        assert_eq!(n, 3);
        assert!(!env.paths.job_dir("1/0/64_1_0").exists());
        let lines = sinks.delete.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| l.starts_with("200|alpha|AGE_OUTPUT|1/0/64_1_0|file_")));
    }
}
