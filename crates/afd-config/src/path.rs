//! Work directory layout.
//!
//! Every process of one AFD instance shares a work directory. The supervisor
//! finds its fifos, shared tables, spool and configuration below it.

use std::path::{Path, PathBuf};

pub const FIFO_DIR: &str = "fifodir";
pub const ETC_DIR: &str = "etc";
pub const MSG_DIR: &str = "messages";
pub const OUTGOING_DIR: &str = "files/outgoing";

pub const FD_CMD_FIFO: &str = "fd_cmd";
pub const MSG_FIFO: &str = "msg_fifo";
pub const SF_FIN_FIFO: &str = "sf_fin";
pub const RETRY_FD_FIFO: &str = "retry_fd";
pub const FD_DELETE_FIFO: &str = "delete_jobs";
pub const TRL_CALC_FIFO: &str = "trl_calc";
pub const FD_WAKE_UP_FIFO: &str = "fd_wake_up";
pub const SF_BURST_ACK_FIFO: &str = "sf_burst_ack";
pub const QUEUE_LIST_READY_FIFO: &str = "queue_list_ready";
pub const QUEUE_LIST_DONE_FIFO: &str = "queue_list_done";
pub const EVENT_LOG_FIFO: &str = "event_log";
pub const DELETE_LOG_FIFO: &str = "delete_log";
pub const TRANSFER_LOG_FIFO: &str = "transfer_log";

pub const FSA_ID_FILE: &str = "fsa.id";
pub const FSA_STAT_FILE: &str = "fsa.stat";
pub const FRA_ID_FILE: &str = "fra.id";
pub const FRA_STAT_FILE: &str = "fra.stat";
pub const MSG_CACHE_FILE: &str = "msg_cache";
pub const MSG_QUEUE_FILE: &str = "msg_queue";
pub const ERROR_QUEUE_FILE: &str = "error_queue";
pub const ACK_QUEUE_FILE: &str = "ack_queue";
pub const FD_LOCK_FILE: &str = "fd.lock";

pub const AFD_CONFIG_FILE: &str = "AFD_CONFIG";
pub const LOCAL_INTERFACE_FILE: &str = "local_interface.list";
pub const TRL_FILE: &str = "trl.toml";

/// Resolved paths below one work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPaths {
    root: PathBuf,
}

impl WorkPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$AFD_WORK_DIR`, else `~/.afd`.
    pub fn default_root() -> PathBuf {
        if let Some(dir) = std::env::var_os("AFD_WORK_DIR") {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .map(|h| h.join(".afd"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/afd"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fifo_dir(&self) -> PathBuf {
        self.root.join(FIFO_DIR)
    }

    pub fn fifo(&self, name: &str) -> PathBuf {
        self.fifo_dir().join(name)
    }

    pub fn etc(&self, name: &str) -> PathBuf {
        self.root.join(ETC_DIR).join(name)
    }

    pub fn afd_config(&self) -> PathBuf {
        self.etc(AFD_CONFIG_FILE)
    }

    pub fn outgoing_dir(&self) -> PathBuf {
        self.root.join(OUTGOING_DIR)
    }

    /// Spool directory of one send job.
    pub fn job_dir(&self, msg_name: &str) -> PathBuf {
        self.outgoing_dir().join(msg_name)
    }

    /// Compiled job definition, named after the hex job id.
    pub fn message_file(&self, job_id: u32) -> PathBuf {
        self.root.join(MSG_DIR).join(format!("{job_id:x}"))
    }

    /// `fsa.stat.<id>` / `fra.stat.<id>`.
    pub fn stat_file(&self, base: &str, id: i32) -> PathBuf {
        self.fifo(&format!("{base}.{id}"))
    }

    /// Create the directories the supervisor writes into.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.fifo_dir(),
            self.root.join(ETC_DIR),
            self.root.join(MSG_DIR),
            self.outgoing_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
