//! Supervisor errors and their exit codes.

use std::path::PathBuf;
use thiserror::Error;

/// Generic failure exit code.
pub const INCORRECT: i32 = 1;
/// Asks the process supervisor to relaunch the distributor.
pub const PROCESS_NEEDS_RESTART: i32 = 5;

#[derive(Error, Debug)]
pub enum FdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),

    #[error("configuration error: {0}")]
    Config(#[from] afd_config::ConfigError),

    #[error("bad fifo record: {0}")]
    Wire(#[from] afd_ipc::WireError),

    #[error("TRL file error: {0}")]
    Trl(#[from] toml::de::Error),

    #[error("mapped region {}: {reason}", path.display())]
    Region { path: PathBuf, reason: String },

    #[error("another distributor already holds {}", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("restart needed: {0}")]
    NeedsRestart(&'static str),
}

pub type Result<T> = std::result::Result<T, FdError>;

impl FdError {
    pub fn region(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        FdError::Region {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            FdError::NeedsRestart(_) => PROCESS_NEEDS_RESTART,
            _ => INCORRECT,
        }
    }
}
