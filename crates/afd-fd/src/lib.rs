//! # afd-fd
//!
//! The file distributor: a single-threaded supervisor that keeps the
//! priority queue of outgoing and retrieve jobs, starts one protocol worker
//! per job, hands follow-up jobs to idle connected workers (burst) and
//! accounts for every worker exit.
//!
//! ## Architecture
//!
//! - Shared tables ([`fsa`], [`fra`], [`msg_cache`], [`queue`],
//!   [`error_queue`], [`ack_queue`]) are `memmap2` views of files under
//!   `fifodir/`, laid out in `afd-ipc`.
//! - Input arrives on named pipes ([`fifo`]) and is decoded into
//!   [`Event`]s for [`Supervisor::handle_event`].
//! - Workers are started and reaped through [`WorkerControl`];
//!   [`testing::FakeWorkers`] replaces real processes in tests.

pub mod ack_queue;
pub mod ageing;
mod commands;
pub mod connection;
mod dispatch;
pub mod error;
pub mod error_queue;
pub mod fifo;
pub mod fra;
pub mod fsa;
mod maintenance;
pub mod msg_cache;
pub mod queue;
mod reaper;
pub mod region;
pub mod schedule;
pub mod sinks;
pub mod supervisor;
pub mod testing;
pub mod trl;
pub mod workers;

use afd_config::{log_fd_info, log_fd_warn, FdConfig, WorkPaths};
use nix::unistd::{geteuid, getuid, seteuid};

pub use dispatch::StartOutcome;
pub use error::{FdError, Result};
pub use fifo::{FifoKind, FifoSet};
pub use supervisor::{unix_now, Event, Flow, PriorityRights, StopMode, Supervisor};
pub use workers::{ProcessWorkers, ReapStatus, WorkerCommand, WorkerControl};

/// Run the distributor on `paths` until it is told to stop.
pub async fn run_daemon(paths: WorkPaths, config: FdConfig) -> Result<()> {
    log_fd_info!(
        "Starting file distributor",
        work_dir = paths.root().display().to_string(),
        max_connections = config.max_connections
    );
    paths.create_dirs()?;
    let _lock = supervisor::lock_proc(&paths)?;

    // Root is only needed to raise worker priorities; keep it in the saved
    // uid and run as the real user otherwise.
    let elevate = config.add_afd_priority && geteuid().is_root() && !getuid().is_root();
    if geteuid() != getuid() {
        seteuid(getuid())?;
    }
    if let Some(prio) = config.fd_priority {
        // SAFETY: plain syscall on the calling process.
        if unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, prio) } == -1 {
            let e = std::io::Error::last_os_error();
            log_fd_warn!("Failed to set own priority", priority = prio, error = e.to_string());
        }
    }

    let rights = if elevate {
        PriorityRights::Elevate
    } else {
        PriorityRights::current()
    };
    let fifos = FifoSet::create(&paths, config.burst_ack)?;
    let mut sup = Supervisor::open(paths, config, ProcessWorkers, unix_now())?;
    sup.set_priority_rights(rights);
    sup.run(fifos).await?;
    log_fd_info!("File distributor stopped");
    Ok(())
}
