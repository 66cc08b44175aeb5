//! Scripted workers and a ready-made supervisor for tests.
//!
//! ```ignore
//! use afd_fd::testing::TestBed;
//!
//! let (env, mut sup) = TestBed::new().host(HostRecord::new("alpha", 1)).start(1000).unwrap();
//! let pid = sup.workers().spawned[0].0;
//! sup.workers_mut().exit(pid, 0);
//! ```

use std::collections::{HashMap, HashSet};
use std::io;
use std::time::Duration;

use afd_config::testing::TestEnvironment;
use afd_config::FdConfig;
use afd_ipc::{HostRecord, NewMessage, RetrieveRecord, WorkerExit};
use nix::sys::signal::Signal;

use crate::error::Result;
use crate::fra::Fra;
use crate::fsa::Fsa;
use crate::sinks::Sinks;
use crate::supervisor::Supervisor;
use crate::workers::{ReapStatus, WorkerCommand, WorkerControl};

/// Workers that only exist as bookkeeping.
#[derive(Debug)]
pub struct FakeWorkers {
    next_pid: i32,
    pub spawned: Vec<(i32, WorkerCommand)>,
    pub signals: Vec<(i32, Signal)>,
    alive: HashSet<i32>,
    exited: HashMap<i32, ReapStatus>,
    /// Make every `spawn` fail.
    pub fail_spawn: bool,
}

impl Default for FakeWorkers {
    fn default() -> Self {
        Self {
            next_pid: 1000,
            spawned: Vec::new(),
            signals: Vec::new(),
            alive: HashSet::new(),
            exited: HashMap::new(),
            fail_spawn: false,
        }
    }
}

impl FakeWorkers {
    /// Let `pid` terminate with exit code `code`.
    pub fn exit(&mut self, pid: i32, code: i32) {
        if self.alive.remove(&pid) {
            self.exited.insert(pid, ReapStatus::Exited(code));
        }
    }

    pub fn last_pid(&self) -> Option<i32> {
        self.spawned.last().map(|(pid, _)| *pid)
    }

    pub fn running(&self) -> usize {
        self.alive.len()
    }
}

impl WorkerControl for FakeWorkers {
    fn spawn(&mut self, cmd: &WorkerCommand) -> io::Result<i32> {
        if self.fail_spawn {
            return Err(io::Error::new(io::ErrorKind::Other, "spawn disabled"));
        }
        let pid = self.next_pid;
        self.next_pid += 1;
        self.alive.insert(pid);
        self.spawned.push((pid, cmd.clone()));
        Ok(pid)
    }

    fn signal(&mut self, pid: i32, signal: Signal) -> nix::Result<()> {
        self.signals.push((pid, signal));
        match signal {
            Signal::SIGINT => self.exit(pid, i32::from(WorkerExit::GotKilled.code())),
            Signal::SIGKILL => {
                if self.alive.remove(&pid) {
                    self.exited.insert(pid, ReapStatus::Signaled(Signal::SIGKILL as i32));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn is_alive(&self, pid: i32) -> bool {
        self.alive.contains(&pid) || self.exited.contains_key(&pid)
    }

    fn try_reap(&mut self, pid: i32) -> Option<ReapStatus> {
        if self.alive.contains(&pid) {
            return None;
        }
        Some(self.exited.remove(&pid).unwrap_or(ReapStatus::Gone))
    }

    fn reap_any(&mut self) -> Option<(i32, ReapStatus)> {
        let pid = *self.exited.keys().next()?;
        self.exited.remove(&pid).map(|s| (pid, s))
    }

    fn child_cpu_times(&self) -> (Duration, Duration) {
        (Duration::ZERO, Duration::ZERO)
    }
}

/// Builds a work directory with an FSA and FRA, then a supervisor on it.
#[derive(Default)]
pub struct TestBed {
    hosts: Vec<HostRecord>,
    dirs: Vec<RetrieveRecord>,
    config: FdConfig,
}

impl TestBed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: HostRecord) -> Self {
        self.hosts.push(host);
        self
    }

    pub fn dir(mut self, dir: RetrieveRecord) -> Self {
        self.dirs.push(dir);
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut FdConfig)) -> Self {
        f(&mut self.config);
        self
    }

    /// Create the tables and open a supervisor with in-memory log sinks.
    pub fn start(self, now: i64) -> Result<(TestEnvironment, Supervisor<FakeWorkers>)> {
        let env = TestEnvironment::new()?;
        Fsa::create(&env.paths, 1, &self.hosts)?;
        Fra::create(&env.paths, 1, &self.dirs)?;
        let sup = Supervisor::with_sinks(
            env.paths.clone(),
            self.config,
            FakeWorkers::default(),
            Sinks::in_memory(),
            now,
        )?;
        Ok((env, sup))
    }
}

/// A new-message record for `job_id`.
pub fn message(job_id: u32, creation_time: i64, unique_number: u32, priority: u8) -> NewMessage {
    NewMessage {
        creation_time,
        job_id,
        unique_number,
        priority,
        files_to_send: 1,
        file_size_to_send: 1,
        ..Default::default()
    }
}
