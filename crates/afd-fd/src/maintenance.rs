//! Periodic maintenance
//!
//! Each task runs on its own deadline, aligned to a multiple of its
//! interval so the tasks drift apart instead of firing together.

use afd_config::{log_maint_debug, log_maint_info, log_maint_warn};
use afd_ipc::{
    msg_number, QueueEntry, AWAIT_BURST_ACK, DIR_DISABLED, DISABLE_RETRIEVE, FETCH_JOB,
    FILES_IN_QUEUE, INTERRUPT_JOB, NOT_IN_CURRENT_FSA,
};

use crate::ack_queue::ACK_QUE_TIMEOUT;
use crate::error::Result;
use crate::msg_cache::{self, JobDefinition};
use crate::schedule;
use crate::supervisor::{Flow, Supervisor};
use crate::workers::WorkerControl;

pub const SWEEP_INTERVAL: i64 = 45;
pub const FRA_CHECK_INTERVAL: i64 = 900;
pub const FSA_CHECK_INTERVAL: i64 = 600;
/// Above this many queued entries `jobs_queued` is trusted as is.
pub const JOBS_QUEUED_RECONCILE_LIMIT: usize = 500;
/// Priority distance that makes a running job yield.
pub const INTERRUPT_PRIORITY_GAP: u8 = 3;

/// Next multiple of `interval` after `now`.
fn align(now: i64, interval: i64) -> i64 {
    let interval = interval.max(1);
    now - now.rem_euclid(interval) + interval
}

#[derive(Debug, Clone)]
pub(crate) struct Deadlines {
    pub sweep: i64,
    pub fra_check: i64,
    pub remote_check: i64,
    pub ack_check: i64,
    pub fsa_check: i64,
    remote_interval: i64,
}

impl Deadlines {
    pub fn new(now: i64, remote_interval: i64) -> Self {
        Self {
            sweep: align(now, SWEEP_INTERVAL),
            fra_check: align(now, FRA_CHECK_INTERVAL),
            remote_check: align(now, remote_interval),
            ack_check: align(now, ACK_QUE_TIMEOUT),
            fsa_check: align(now, FSA_CHECK_INTERVAL),
            remote_interval: remote_interval.max(1),
        }
    }

    pub fn earliest(&self) -> i64 {
        [
            self.sweep,
            self.fra_check,
            self.remote_check,
            self.ack_check,
            self.fsa_check,
        ]
        .into_iter()
        .min()
        .unwrap_or(self.sweep)
    }
}

impl<W: WorkerControl> Supervisor<W> {
    /// Run what is due at `now`, then dispatch.
    pub fn tick(&mut self, now: i64) -> Result<Flow> {
        self.check_zombies(now)?;

        if now >= self.deadlines.sweep {
            self.sweep_children(now)?;
            self.check_message_times();
            self.reconcile_jobs_queued(false);
            if self.trl.check_file()? {
                self.trl.recalc_all(self.fsa.hosts_mut());
            }
            if self.config.interrupt_jobs {
                self.check_interrupt_jobs();
            }
            self.recover_burst_misses();
            self.deadlines.sweep = align(now, SWEEP_INTERVAL);
        }
        if now >= self.deadlines.fra_check {
            let fixed = self.recount_fra_queued();
            if fixed > 0 {
                log_maint_warn!("Corrected queued counters of retrieve directories", dirs = fixed);
            }
            self.deadlines.fra_check = align(now, FRA_CHECK_INTERVAL);
        }
        if now >= self.deadlines.remote_check {
            if self.stop.is_none() {
                self.check_remote_dirs(now)?;
            }
            self.deadlines.remote_check = align(now, self.deadlines.remote_interval);
        }
        if now >= self.deadlines.ack_check {
            self.check_ack_timeouts(now);
            self.deadlines.ack_check = align(now, ACK_QUE_TIMEOUT);
        }
        if now >= self.deadlines.fsa_check {
            self.check_fsa_entries()?;
            self.deadlines.fsa_check = align(now, FSA_CHECK_INTERVAL);
        }

        let counter = self.fsa.header().change_counter;
        if counter != self.fsa_change_counter {
            log_maint_info!("Host configuration changed", change_counter = counter);
            self.fsa_change_counter = counter;
            self.trl.recalc_all(self.fsa.hosts_mut());
        }
        if self.queue_dump.is_some_and(|d| now >= d) {
            log_maint_warn!("No reply to queue list, giving up");
            self.queue_dump = None;
        }

        self.start_pending(now)?;
        Ok(self.check_stop(now))
    }

    /// Make `jobs_queued` match the pending entries. Large queues are only
    /// recounted when `force` is set.
    pub(crate) fn reconcile_jobs_queued(&mut self, force: bool) {
        if self.queue.is_empty() {
            for h in self.fsa.hosts_mut() {
                h.jobs_queued = 0;
            }
            return;
        }
        if !force && self.queue.len() >= JOBS_QUEUED_RECONCILE_LIMIT {
            return;
        }
        let mut counts = vec![0u32; self.fsa.len()];
        for e in self.queue.entries().iter().filter(|e| e.is_pending()) {
            if let Some(p) = self.host_of(e) {
                counts[p] += 1;
            }
        }
        for (h, n) in self.fsa.hosts_mut().iter_mut().zip(counts) {
            if h.jobs_queued != n {
                log_maint_debug!(
                    "Corrected jobs_queued",
                    host = h.alias().to_string(),
                    was = h.jobs_queued,
                    now = n
                );
                h.jobs_queued = n;
            }
        }
    }

    /// Set every directory's `queued` to the number of its fetch entries.
    /// Returns how many directories were off.
    pub(crate) fn recount_fra_queued(&mut self) -> usize {
        let mut counts = vec![0i32; self.fra.len()];
        for e in self.queue.entries().iter().filter(|e| e.is_fetch()) {
            if let Some(c) = usize::try_from(e.pos).ok().and_then(|d| counts.get_mut(d)) {
                *c += 1;
            }
        }
        let mut fixed = 0;
        for (d, n) in counts.into_iter().enumerate() {
            let Some(dir) = self.fra.dir_mut(d) else {
                continue;
            };
            if dir.queued != n {
                dir.queued = n;
                fixed += 1;
            }
            if n > 0 {
                dir.dir_flag |= FILES_IN_QUEUE;
            } else {
                dir.dir_flag &= !FILES_IN_QUEUE;
            }
        }
        fixed
    }

    /// Re-read job definitions whose message file changed.
    fn check_message_times(&mut self) {
        for i in 0..self.mdb.len() {
            let Some(rec) = self.mdb.get(i).copied() else {
                continue;
            };
            let path = self.paths.message_file(rec.job_id);
            let mtime = match msg_cache::mtime_secs(&path) {
                Ok(t) => t,
                Err(_) => {
                    if rec.in_current_fsa != NOT_IN_CURRENT_FSA {
                        log_maint_debug!("Message file gone", job_id = rec.job_id);
                        if let Some(r) = self.mdb.get_mut(i) {
                            r.in_current_fsa = NOT_IN_CURRENT_FSA;
                        }
                    }
                    continue;
                }
            };
            if mtime <= rec.msg_time {
                continue;
            }
            match JobDefinition::read(&path) {
                Ok(Some(def)) => {
                    let fsa_pos = self.fsa.position_of(&def.host_alias);
                    let (age_limit, ageing) =
                        (self.config.default_age_limit, self.config.default_ageing);
                    if let Some(r) = self.mdb.get_mut(i) {
                        msg_cache::update_from_definition(r, &def, fsa_pos, age_limit, ageing, mtime);
                    }
                    log_maint_debug!("Message file changed, record updated", job_id = rec.job_id);
                }
                Ok(None) => {
                    log_maint_warn!("Changed message file does not parse", job_id = rec.job_id);
                }
                Err(e) => {
                    log_maint_warn!(
                        "Failed to read message file",
                        job_id = rec.job_id,
                        error = e.to_string()
                    );
                }
            }
        }
    }

    /// Ask workers on busy hosts to yield when far more urgent work waits.
    fn check_interrupt_jobs(&mut self) {
        for fsa_pos in 0..self.fsa.len() {
            let Some(host) = self.fsa.host(fsa_pos) else {
                continue;
            };
            let slots = host.job_slots();
            if slots == 0 || (host.active_transfers.max(0) as usize) < slots {
                continue;
            }
            // Lower priority byte is more urgent.
            let Some(urgent) = self
                .queue
                .entries()
                .iter()
                .filter(|e| e.is_pending() && self.host_of(e) == Some(fsa_pos))
                .map(QueueEntry::priority)
                .min()
            else {
                continue;
            };
            let victim = self
                .connections
                .live()
                .filter(|(_, c)| c.fsa_pos == fsa_pos)
                .filter_map(|(slot, c)| {
                    let qpos = self.queue.position_by_pid(c.pid)?;
                    Some((self.queue.entries()[qpos].priority(), slot, c.job_no))
                })
                .max();
            let Some((prio, slot, job_no)) = victim else {
                continue;
            };
            if prio < urgent.saturating_add(INTERRUPT_PRIORITY_GAP) {
                continue;
            }
            if let Some(h) = self.fsa.host_mut(fsa_pos) {
                let js = &mut h.job_status[job_no];
                if js.special_flag & INTERRUPT_JOB == 0 {
                    js.special_flag |= INTERRUPT_JOB;
                    log_maint_info!(
                        "Interrupting job for more urgent work",
                        host = h.alias().to_string(),
                        slot = slot,
                        running = char::from(prio).to_string(),
                        waiting = char::from(urgent).to_string()
                    );
                }
            }
        }
    }

    /// Entries that still carry the pid of a worker no slot owns any more.
    fn recover_burst_misses(&mut self) {
        let mut pos = 0;
        while pos < self.queue.len() {
            let entry = self.queue.entries()[pos];
            if entry.pid <= 0 || self.connections.position_by_pid(entry.pid).is_some() {
                pos += 1;
                continue;
            }
            if entry.is_fetch() || self.paths.job_dir(entry.msg_name()).is_dir() {
                log_maint_info!("Recovered job of vanished worker", msg_name = entry.msg_name().to_string());
                self.set_pending(pos);
                pos += 1;
            } else {
                log_maint_debug!(
                    "Dropping job of vanished worker, spool directory is gone",
                    msg_name = entry.msg_name().to_string()
                );
                self.remove_msg(pos);
            }
        }
    }

    /// Burst hand-offs the worker never confirmed go back to pending.
    fn check_ack_timeouts(&mut self, now: i64) {
        let Some(acks) = self.ack_queue.as_mut() else {
            return;
        };
        for name in acks.expired(now, ACK_QUE_TIMEOUT) {
            let Some(pos) = self.queue.position_by_msg_name(&name) else {
                continue;
            };
            if self.queue.entries()[pos].special_flag & AWAIT_BURST_ACK != 0 {
                log_maint_warn!("Burst ack timed out", msg_name = name);
                self.set_pending(pos);
            }
        }
    }

    /// Host rows that disagree with the connection table are corrected.
    pub(crate) fn check_fsa_entries(&mut self) -> Result<()> {
        let _check = self.fsa.lock_check_entries()?;
        let connections = &self.connections;
        let mut fixed = 0;
        for (pos, h) in self.fsa.hosts_mut().iter_mut().enumerate() {
            let slots = h.job_slots();
            for (job_no, js) in h.job_status.iter_mut().enumerate() {
                let owned = connections
                    .live()
                    .any(|(_, c)| c.fsa_pos == pos && c.job_no == job_no && c.pid == js.proc_id);
                if js.proc_id > 0 && (!owned || job_no >= slots) {
                    js.reset();
                    fixed += 1;
                }
            }
            let live = connections.count_for_host(pos) as i32;
            if h.active_transfers != live {
                log_maint_warn!(
                    "Corrected active transfers",
                    host = h.alias().to_string(),
                    was = h.active_transfers,
                    now = live
                );
                h.active_transfers = live;
                fixed += 1;
            }
        }
        if fixed > 0 {
            log_maint_info!("FSA check corrected entries", fixed = fixed);
        }
        Ok(())
    }

    /// Queue a fetch job for every retrieve directory that is due.
    pub fn check_remote_dirs(&mut self, now: i64) -> Result<()> {
        if self.fsa.header().feature_flag & DISABLE_RETRIEVE != 0 {
            return Ok(());
        }
        for d in 0..self.fra.len() {
            let Some(dir) = self.fra.dir(d).copied() else {
                continue;
            };
            if dir.dir_flag & DIR_DISABLED != 0 || dir.queued > 0 || dir.next_check_time > now {
                continue;
            }
            let Some(fsa_pos) = usize::try_from(dir.fsa_pos)
                .ok()
                .filter(|&p| p < self.fsa.len())
            else {
                continue;
            };

            let mut entry = QueueEntry::new(&format!("{:x}", dir.dir_id), dir.priority, now, d as i32);
            entry.msg_number = msg_number(dir.priority, now, 0, 0);
            entry.special_flag = FETCH_JOB;
            let pos = self.queue.insert(entry)?;
            self.fra.inc_queued(d);
            if let Some(h) = self.fsa.host_mut(fsa_pos) {
                h.jobs_queued += 1;
            }
            let next = schedule::next_check_time(dir.time_entries(), dir.timezone(), now)
                .unwrap_or(now + self.config.remote_file_check_interval);
            if let Some(dir) = self.fra.dir_mut(d) {
                dir.next_check_time = next;
            }
            log_maint_debug!(
                "Queued fetch job",
                dir_alias = dir.alias().to_string(),
                next_check_time = next
            );
            if self.stop.is_none() {
                self.start_entry(pos, false, now)?;
            }
        }
        Ok(())
    }
}
