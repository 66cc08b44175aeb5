//! The supervisor value and its event loop
//!
//! One [`Supervisor`] owns every table, the connection table and the worker
//! handle. Fifo records and signals are turned into [`Event`]s; after each
//! batch [`Supervisor::tick`] runs due maintenance and dispatches pending
//! jobs. Everything runs on one thread.

use std::fs::{File, OpenOptions};
use std::time::Duration;

use afd_config::path::{
    WorkPaths, ACK_QUEUE_FILE, ERROR_QUEUE_FILE, FD_LOCK_FILE, LOCAL_INTERFACE_FILE,
    MSG_CACHE_FILE, MSG_QUEUE_FILE, TRL_FILE,
};
use afd_config::{log_fd_debug, log_fd_info, log_fd_warn, FdConfig};
use afd_ipc::{
    BurstAck, DeleteRequest, FdCommand, NewMessage, Protocol, QueueEntry, AWAIT_BURST_ACK,
    ERROR_QUEUE_SET, PENDING, QUEUED_FOR_BURST,
};
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};

use crate::ack_queue::AckQueue;
use crate::connection::ConnectionTable;
use crate::error::{FdError, Result};
use crate::error_queue::ErrorQueue;
use crate::fifo::FifoSet;
use crate::fra::Fra;
use crate::fsa::{Fsa, LockRegion};
use crate::maintenance::Deadlines;
use crate::msg_cache::{self, JobDefinition, MsgCache};
use crate::queue::Queue;
use crate::sinks::{self, DeleteReason, Sinks};
use crate::trl::TrlConfig;
use crate::workers::{self, ProcessWorkers, WorkerControl};

/// Upper bound for a save stop.
pub const FD_TIMEOUT: i64 = 600;
pub const FD_STOP_TIMEOUT: i64 = 15;
pub const FD_QUICK_TIMEOUT: i64 = 5;
/// How long the queue-dump handshake waits for `queue_list_done`.
pub const QUEUE_LIST_DONE_TIMEOUT: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopMode {
    /// No new workers; wait for running ones to finish.
    Save,
    /// SIGINT workers, SIGKILL after [`FD_STOP_TIMEOUT`].
    Stop,
    /// SIGINT workers, SIGKILL after [`FD_QUICK_TIMEOUT`].
    Quick,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Stop {
    pub mode: StopMode,
    pub deadline: i64,
    pub killed: bool,
}

/// Input to the supervisor, decoded from fifos or signals.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Command(FdCommand),
    NewMessage(NewMessage),
    /// Pid from `sf_fin`; negative asks for more work.
    WorkerFinished(i32),
    Retry(i32),
    Delete(DeleteRequest),
    TrlCalc(i32),
    BurstAck(BurstAck),
    WakeUp,
    QueueListDone,
    Signal(StopMode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// What the supervisor may do about worker nice values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityRights {
    /// Negative nice values would fail; workers keep the default.
    None,
    /// Running as root.
    Root,
    /// Root is kept in the saved uid and regained in the child.
    Elevate,
}

impl PriorityRights {
    /// Rights of the calling process as it runs now.
    pub fn current() -> Self {
        if nix::unistd::geteuid().is_root() {
            PriorityRights::Root
        } else {
            PriorityRights::None
        }
    }
}

/// Where a queue entry goes and how.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JobTarget {
    pub fsa_pos: usize,
    pub protocol: Protocol,
    pub port: i32,
    pub age_limit: u32,
    pub ageing: u8,
    /// Job id of a send job, dir id of a fetch job.
    pub job_id: u32,
    pub fra_pos: Option<usize>,
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Hold `fd.lock` so only one distributor runs per work directory.
pub fn lock_proc(paths: &WorkPaths) -> Result<Flock<File>> {
    let path = paths.fifo(FD_LOCK_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| match errno {
        nix::errno::Errno::EWOULDBLOCK => FdError::AlreadyRunning(path),
        e => FdError::Nix(e),
    })
}

pub(crate) fn read_local_interfaces(paths: &WorkPaths) -> Vec<String> {
    std::fs::read_to_string(paths.etc(LOCAL_INTERFACE_FILE))
        .map(|text| {
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub struct Supervisor<W: WorkerControl = ProcessWorkers> {
    pub(crate) paths: WorkPaths,
    pub(crate) config: FdConfig,
    pub(crate) fsa: Fsa,
    pub(crate) fra: Fra,
    pub(crate) mdb: MsgCache,
    pub(crate) queue: Queue,
    pub(crate) error_queue: ErrorQueue,
    pub(crate) ack_queue: Option<AckQueue>,
    pub(crate) connections: ConnectionTable,
    pub(crate) workers: W,
    pub(crate) sinks: Sinks,
    pub(crate) trl: TrlConfig,
    /// Connection slots whose worker announced its exit but is not reaped.
    pub(crate) zombies: Vec<usize>,
    pub(crate) stop: Option<Stop>,
    pub(crate) deadlines: Deadlines,
    pub(crate) local_interfaces: Vec<String>,
    pub(crate) fsa_change_counter: u8,
    pub(crate) hw_crc32: bool,
    pub(crate) priority_rights: PriorityRights,
    pub(crate) child_utime: Duration,
    pub(crate) child_stime: Duration,
    /// Deadline of a running queue-dump handshake.
    pub(crate) queue_dump: Option<i64>,
}

impl<W: WorkerControl> Supervisor<W> {
    pub fn open(paths: WorkPaths, config: FdConfig, workers: W, now: i64) -> Result<Self> {
        let sinks = Sinks::new(&paths);
        Self::with_sinks(paths, config, workers, sinks, now)
    }

    /// Attach to the shared tables and recover what a previous run left.
    pub fn with_sinks(
        paths: WorkPaths,
        config: FdConfig,
        workers: W,
        sinks: Sinks,
        now: i64,
    ) -> Result<Self> {
        let fsa = Fsa::attach(&paths)?;
        let fra = Fra::attach(&paths)?;
        let mdb = MsgCache::open(&paths.fifo(MSG_CACHE_FILE))?;
        let queue = Queue::open(&paths.fifo(MSG_QUEUE_FILE))?;
        let error_queue = ErrorQueue::open(&paths.fifo(ERROR_QUEUE_FILE))?;
        let ack_queue = if config.burst_ack {
            Some(AckQueue::open(&paths.fifo(ACK_QUEUE_FILE))?)
        } else {
            None
        };
        let trl = TrlConfig::load(&paths.etc(TRL_FILE))?;
        let local_interfaces = read_local_interfaces(&paths);
        let deadlines = Deadlines::new(now, config.remote_file_check_interval);
        let fsa_change_counter = fsa.header().change_counter;

        let mut sup = Self {
            connections: ConnectionTable::new(config.max_connections),
            paths,
            config,
            fsa,
            fra,
            mdb,
            queue,
            error_queue,
            ack_queue,
            workers,
            sinks,
            trl,
            zombies: Vec::new(),
            stop: None,
            deadlines,
            local_interfaces,
            fsa_change_counter,
            hw_crc32: workers::detect_hw_crc32(),
            priority_rights: PriorityRights::current(),
            child_utime: Duration::ZERO,
            child_stime: Duration::ZERO,
            queue_dump: None,
        };
        sup.recover();
        log_fd_info!(
            "Supervisor ready",
            hosts = sup.fsa.len(),
            dirs = sup.fra.len(),
            queued = sup.queue.len(),
            max_connections = sup.config.max_connections
        );
        Ok(sup)
    }

    /// Reset state no live worker backs after a restart.
    fn recover(&mut self) {
        self.queue.recover_after_restart();
        for host in self.fsa.hosts_mut() {
            for js in &mut host.job_status {
                js.reset();
            }
            host.active_transfers = 0;
        }
        for d in 0..self.fra.len() {
            if let Some(dir) = self.fra.dir_mut(d) {
                dir.queued = 0;
                dir.dir_flag &= !afd_ipc::FILES_IN_QUEUE;
            }
        }
        self.reconcile_jobs_queued(true);
        self.trl.recalc_all(self.fsa.hosts_mut());
    }

    /// Whether workers get nice values, and how the child applies them.
    pub fn set_priority_rights(&mut self, rights: PriorityRights) {
        self.priority_rights = rights;
    }

    pub fn config(&self) -> &FdConfig {
        &self.config
    }

    pub fn fsa(&self) -> &Fsa {
        &self.fsa
    }

    pub fn fsa_mut(&mut self) -> &mut Fsa {
        &mut self.fsa
    }

    pub fn fra(&self) -> &Fra {
        &self.fra
    }

    pub fn fra_mut(&mut self) -> &mut Fra {
        &mut self.fra
    }

    pub fn mdb(&self) -> &MsgCache {
        &self.mdb
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut Queue {
        &mut self.queue
    }

    pub fn error_queue(&self) -> &ErrorQueue {
        &self.error_queue
    }

    pub fn ack_queue(&self) -> Option<&AckQueue> {
        self.ack_queue.as_ref()
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn workers(&self) -> &W {
        &self.workers
    }

    pub fn workers_mut(&mut self) -> &mut W {
        &mut self.workers
    }

    pub fn sinks(&self) -> &Sinks {
        &self.sinks
    }

    pub fn local_interfaces(&self) -> &[String] {
        &self.local_interfaces
    }

    pub fn child_cpu_times(&self) -> (Duration, Duration) {
        (self.child_utime, self.child_stime)
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_some()
    }

    /// Host and job data behind a queue entry, `None` if it points nowhere.
    pub(crate) fn target_of(&self, entry: &QueueEntry) -> Option<JobTarget> {
        let pos = usize::try_from(entry.pos).ok()?;
        let target = if entry.is_fetch() {
            let dir = self.fra.dir(pos)?;
            JobTarget {
                fsa_pos: usize::try_from(dir.fsa_pos).ok()?,
                protocol: Protocol::from_raw(dir.protocol)?,
                port: -1,
                age_limit: 0,
                ageing: self.config.default_ageing,
                job_id: dir.dir_id,
                fra_pos: Some(pos),
            }
        } else {
            let rec = self.mdb.get(pos)?;
            JobTarget {
                fsa_pos: usize::try_from(rec.fsa_pos).ok()?,
                protocol: Protocol::from_raw(rec.protocol)?,
                port: rec.port,
                age_limit: rec.age_limit,
                ageing: rec.ageing,
                job_id: rec.job_id,
                fra_pos: None,
            }
        };
        (target.fsa_pos < self.fsa.len()).then_some(target)
    }

    /// Host position of a queue entry.
    pub(crate) fn host_of(&self, entry: &QueueEntry) -> Option<usize> {
        self.target_of(entry).map(|t| t.fsa_pos)
    }

    /// Remove the entry at `pos` keeping the counters that mirror the queue.
    pub(crate) fn remove_msg(&mut self, pos: usize) -> Option<QueueEntry> {
        let entry = *self.queue.get(pos)?;
        let host = self.host_of(&entry);
        let entry = self.queue.remove(pos);
        if entry.is_pending() {
            if let Some(h) = host.and_then(|h| self.fsa.host_mut(h)) {
                h.jobs_queued = h.jobs_queued.saturating_sub(1);
            }
        }
        if entry.is_fetch() {
            if let Ok(d) = usize::try_from(entry.pos) {
                self.fra.dec_queued(d);
            }
        }
        Some(entry)
    }

    /// Put an assigned entry back to pending.
    pub(crate) fn set_pending(&mut self, pos: usize) {
        let Some(entry) = self.queue.get_mut(pos) else {
            return;
        };
        if entry.pid == PENDING {
            return;
        }
        entry.pid = PENDING;
        entry.connect_pos = -1;
        entry.special_flag &= !(AWAIT_BURST_ACK | QUEUED_FOR_BURST);
        let entry = *entry;
        if let Some(h) = self.host_of(&entry).and_then(|h| self.fsa.host_mut(h)) {
            h.jobs_queued += 1;
        }
    }

    /// Delete the spool files of a send job and log them.
    pub(crate) fn purge_job_files(&mut self, msg_name: &str, host: &str, reason: DeleteReason, now: i64) {
        let n = sinks::purge_job_dir(&mut self.sinks, &self.paths, msg_name, host, reason, now);
        log_fd_debug!(
            "Deleted job files",
            msg_name = msg_name,
            files = n,
            reason = reason.as_str()
        );
    }

    /// Drop a job from the error queue and clear the host flag once the
    /// host has no entries left.
    pub(crate) fn error_queue_remove(&mut self, job_id: u32, fsa_pos: usize) -> Result<()> {
        if !self.error_queue.remove(job_id) {
            return Ok(());
        }
        let Some(host_id) = self.fsa.host(fsa_pos).map(|h| h.host_id) else {
            return Ok(());
        };
        if !self.error_queue.host_has_entries(host_id) {
            let _hs = self.fsa.lock(fsa_pos, LockRegion::HostStatus)?;
            if let Some(h) = self.fsa.host_mut(fsa_pos) {
                h.host_status &= !ERROR_QUEUE_SET;
            }
        }
        Ok(())
    }

    /// MDB position of `job_id`, reading its message file on a miss.
    pub(crate) fn mdb_lookup_or_load(&mut self, job_id: u32) -> Result<Option<usize>> {
        if let Some(pos) = self.mdb.lookup(job_id) {
            return Ok(Some(pos));
        }
        let path = self.paths.message_file(job_id);
        let def = match JobDefinition::read(&path) {
            Ok(Some(def)) => def,
            Ok(None) => {
                log_fd_warn!("Unparsable message file", job_id = job_id);
                return Ok(None);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mtime = msg_cache::mtime_secs(&path).unwrap_or(0);
        let fsa_pos = self.fsa.position_of(&def.host_alias);
        let rec = msg_cache::record_from_definition(
            job_id,
            &def,
            fsa_pos,
            self.config.default_age_limit,
            self.config.default_ageing,
            mtime,
        );
        Ok(Some(self.mdb.insert(rec)?))
    }

    pub fn handle_event(&mut self, event: Event, now: i64) -> Result<Flow> {
        match event {
            Event::Command(cmd) => self.command(cmd, now)?,
            Event::NewMessage(msg) => self.new_message(&msg, now)?,
            Event::WorkerFinished(pid) => self.handle_finished(pid, now)?,
            Event::Retry(fsa_pos) => self.retry_host(fsa_pos, now)?,
            Event::Delete(req) => self.delete(&req, now)?,
            Event::TrlCalc(fsa_pos) => {
                if let Ok(pos) = usize::try_from(fsa_pos) {
                    self.trl.calc(self.fsa.hosts_mut(), pos);
                }
            }
            Event::BurstAck(ack) => self.burst_ack(&ack),
            Event::WakeUp => {}
            Event::QueueListDone => {
                log_fd_debug!("Queue list consumed");
                self.queue_dump = None;
            }
            Event::Signal(mode) => self.begin_stop(mode, now),
        }
        Ok(self.check_stop(now))
    }

    /// Start stopping. A stronger mode replaces a weaker one.
    pub(crate) fn begin_stop(&mut self, mode: StopMode, now: i64) {
        if self.stop.is_some_and(|s| s.mode >= mode) {
            return;
        }
        let timeout = match mode {
            StopMode::Save => FD_TIMEOUT,
            StopMode::Stop => FD_STOP_TIMEOUT,
            StopMode::Quick => FD_QUICK_TIMEOUT,
        };
        log_fd_info!(
            "Stopping",
            mode = format!("{mode:?}"),
            workers = self.connections.active_count()
        );
        if mode != StopMode::Save {
            self.signal_all(Signal::SIGINT);
        }
        self.stop = Some(Stop {
            mode,
            deadline: now + timeout,
            killed: false,
        });
    }

    fn signal_all(&mut self, signal: Signal) {
        let pids: Vec<i32> = self.connections.live().map(|(_, c)| c.pid).collect();
        for pid in pids {
            if pid > 0 {
                if let Err(e) = self.workers.signal(pid, signal) {
                    log_fd_debug!("Failed to signal worker", pid = pid, error = e.to_string());
                }
            }
        }
    }

    /// Whether a running stop is complete.
    pub(crate) fn check_stop(&mut self, now: i64) -> Flow {
        let Some(mut stop) = self.stop else {
            return Flow::Continue;
        };
        if self.connections.active_count() == 0 {
            self.flush_tables();
            log_fd_info!("All workers gone, exiting");
            return Flow::Exit;
        }
        if now >= stop.deadline {
            if stop.killed {
                log_fd_warn!(
                    "Workers survived SIGKILL, exiting anyway",
                    workers = self.connections.active_count()
                );
                self.flush_tables();
                return Flow::Exit;
            }
            log_fd_warn!(
                "Stop timeout, killing workers",
                workers = self.connections.active_count()
            );
            self.signal_all(Signal::SIGKILL);
            stop.killed = true;
            stop.deadline = now + 1;
            self.stop = Some(stop);
        }
        Flow::Continue
    }

    pub(crate) fn flush_tables(&self) {
        let results = [
            self.queue.flush(),
            self.mdb.flush(),
            self.error_queue.flush(),
            self.fsa.flush(),
            self.fra.flush(),
        ];
        for r in results {
            if let Err(e) = r {
                log_fd_warn!("Failed to flush table", error = e.to_string());
            }
        }
        if let Some(aq) = &self.ack_queue {
            if let Err(e) = aq.flush() {
                log_fd_warn!("Failed to flush ack queue", error = e.to_string());
            }
        }
    }

    /// Seconds until something needs attention.
    pub fn poll_timeout(&self, now: i64) -> Duration {
        if !self.zombies.is_empty() || self.queue_dump.is_some() || self.stop.is_some() {
            return Duration::from_secs(1);
        }
        let wait = (self.deadlines.earliest() - now).clamp(1, 60);
        Duration::from_secs(wait as u64)
    }

    /// Drive the supervisor until it stops.
    pub async fn run(mut self, mut fifos: FifoSet) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        loop {
            let timeout = self.poll_timeout(unix_now());
            let ready = tokio::select! {
                r = fifos.readable() => {
                    r?;
                    true
                }
                _ = sigint.recv() => {
                    self.handle_event(Event::Signal(StopMode::Quick), unix_now())?;
                    false
                }
                _ = sigterm.recv() => {
                    self.handle_event(Event::Signal(StopMode::Stop), unix_now())?;
                    false
                }
                _ = sighup.recv() => {
                    self.handle_event(Event::Signal(StopMode::Stop), unix_now())?;
                    false
                }
                _ = tokio::time::sleep(timeout) => false,
            };
            let events = if ready { fifos.read_ready()? } else { Vec::new() };
            let now = unix_now();
            for event in events {
                if self.handle_event(event, now)? == Flow::Exit {
                    return Ok(());
                }
            }
            if self.tick(now)? == Flow::Exit {
                return Ok(());
            }
        }
    }
}
