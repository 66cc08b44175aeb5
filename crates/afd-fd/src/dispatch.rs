//! Dispatcher: pending queue entries become running workers
//!
//! An entry either goes to an idle worker of the same host (burst) or gets
//! a new worker process. Gates are checked in a fixed order; an entry that
//! fails a gate stays pending or leaves the queue.

use afd_config::{log_dispatch_debug, log_dispatch_error, log_dispatch_info, log_dispatch_warn};
use afd_ipc::{
    set_cstr, ControlWord, AWAIT_BURST_ACK, CONNECT_STATUS_CONNECTING, DISABLE_BURST, DISABLE_RETRIEVE,
    DO_NOT_DELETE_DATA, HOST_DISABLED, JOB_HELPER, KEEP_CON_NO_FETCH, KEEP_CON_NO_SEND, NONE,
    QUEUED_FOR_BURST, RESEND_JOB, STOP_TRANSFER,
};
use nix::sys::signal::Signal;

use crate::connection::{probe_host_slots, resolve_job_slot, Connection, SlotResolution};
use crate::error::{FdError, Result};
use crate::fsa::LockRegion;
use crate::sinks::DeleteReason;
use crate::supervisor::{JobTarget, PriorityRights, Supervisor};
use crate::workers::{SpawnParams, WorkerCommand, WorkerControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    Pending,
    Removed,
    /// Handed to a live worker. `removed_pos` is where the worker's previous
    /// entry was taken out of the queue, if it was.
    Burst { removed_pos: Option<usize> },
}

impl<W: WorkerControl> Supervisor<W> {
    /// One pass over the queue trying to start every pending entry.
    pub fn start_pending(&mut self, now: i64) -> Result<()> {
        if self.stop.is_some() {
            return Ok(());
        }
        let mut pos = 0;
        while pos < self.queue.len() {
            if !self.queue.entries()[pos].is_pending() {
                pos += 1;
                continue;
            }
            match self.start_entry(pos, false, now)? {
                StartOutcome::Removed => {}
                StartOutcome::Burst {
                    removed_pos: Some(r),
                } if r < pos => {}
                _ => pos += 1,
            }
        }
        Ok(())
    }

    /// Try to start the pending entry at `pos`. `retry` bypasses the retry
    /// cooldown and the error queue.
    pub fn start_entry(&mut self, pos: usize, retry: bool, now: i64) -> Result<StartOutcome> {
        let Some(entry) = self.queue.get(pos).copied() else {
            return Ok(StartOutcome::Pending);
        };
        if !entry.is_pending() {
            return Ok(StartOutcome::Pending);
        }
        let msg_name = entry.msg_name().to_string();

        let Some(target) = self.target_of(&entry) else {
            log_dispatch_warn!(
                "Queue entry without valid host, removing",
                msg_name = msg_name.clone(),
                pos = entry.pos
            );
            if !entry.is_fetch() {
                let host = usize::try_from(entry.pos)
                    .ok()
                    .and_then(|p| self.mdb.get(p))
                    .map(|r| r.host_name().to_string())
                    .unwrap_or_default();
                self.purge_job_files(&msg_name, &host, DeleteReason::NoHost, now);
            }
            self.remove_msg(pos);
            return Ok(StartOutcome::Removed);
        };
        let fsa_pos = target.fsa_pos;
        let Some(host) = self.fsa.host(fsa_pos) else {
            return Ok(StartOutcome::Pending);
        };
        let alias = host.alias().to_string();
        let special_flag = host.special_flag;
        let host_status = host.host_status;
        let error_counter = host.error_counter;
        let retry_due = host.last_retry_time + i64::from(host.retry_interval);

        if !entry.is_fetch()
            && target.age_limit > 0
            && now - entry.creation_time > i64::from(target.age_limit)
            && special_flag & DO_NOT_DELETE_DATA == 0
        {
            log_dispatch_info!(
                "Job exceeded its age limit, deleting",
                msg_name = msg_name.clone(),
                host = alias.clone(),
                age_limit = target.age_limit
            );
            self.purge_job_files(&msg_name, &alias, DeleteReason::AgeOutput, now);
            self.error_queue_remove(target.job_id, fsa_pos)?;
            self.remove_msg(pos);
            return Ok(StartOutcome::Removed);
        }
        if entry.is_fetch() && self.fsa.header().feature_flag & DISABLE_RETRIEVE != 0 {
            log_dispatch_debug!("Retrieving disabled, dropping fetch job", dir_id = msg_name.clone());
            self.remove_msg(pos);
            return Ok(StartOutcome::Removed);
        }
        if host_status & STOP_TRANSFER != 0 || special_flag & HOST_DISABLED != 0 {
            return Ok(StartOutcome::Pending);
        }
        let cooled = error_counter == 0 || retry || now - retry_due >= 0;
        if !cooled || (!retry && self.error_queue.blocks(target.job_id, now)) {
            return Ok(StartOutcome::Pending);
        }
        if self.stop.is_some() {
            return Ok(StartOutcome::Pending);
        }

        if let Some(outcome) = self.try_burst(pos, &msg_name, &target, now)? {
            return Ok(outcome);
        }
        self.spawn_entry(pos, &msg_name, &target, now)
    }

    /// Hand the entry at `pos` to an idle worker of its host. `None` means
    /// no burst applies and the entry may get its own worker.
    fn try_burst(
        &mut self,
        pos: usize,
        msg_name: &str,
        target: &JobTarget,
        now: i64,
    ) -> Result<Option<StartOutcome>> {
        let entry = self.queue.entries()[pos];
        let fsa_pos = target.fsa_pos;
        let Some(host) = self.fsa.host(fsa_pos) else {
            return Ok(None);
        };
        let kind_allowed = if entry.is_fetch() {
            host.special_flag & KEEP_CON_NO_FETCH == 0
        } else {
            host.special_flag & KEEP_CON_NO_SEND == 0
        };
        if host.keep_connected == 0
            || host.special_flag & DISABLE_BURST != 0
            || host.active_transfers <= 0
            || host.jobs_queued == 0
            || entry.is_helper()
            || !kind_allowed
        {
            return Ok(None);
        }

        let mut chosen = None;
        let mut idle_other = None;
        for (job_no, js) in host.job_status[..host.job_slots()].iter().enumerate() {
            if js.proc_id <= 0 || ControlWord::load(js) != ControlWord::ReadyForBurst {
                continue;
            }
            let Some(slot) = self.connections.position_by_pid(js.proc_id) else {
                continue;
            };
            let Some(conn) = self.connections.get(slot) else {
                continue;
            };
            let compatible = !conn.temp_toggle
                && conn.is_fetch() == entry.is_fetch()
                && conn.protocol == Some(target.protocol)
                && (entry.is_fetch() || conn.port == target.port);
            if compatible {
                chosen = Some((job_no, slot, js.proc_id));
                break;
            }
            idle_other.get_or_insert(job_no);
        }

        let Some((job_no, slot, pid)) = chosen else {
            // An idle worker that cannot take this job only holds the slot.
            let full = host.active_transfers.max(0) as usize >= host.job_slots();
            if let (Some(job_no), true) = (idle_other, full) {
                if let Some(h) = self.fsa.host_mut(fsa_pos) {
                    ControlWord::request_termination(&mut h.job_status[job_no]);
                }
                log_dispatch_debug!(
                    "Asked idle worker to terminate for incompatible job",
                    host = self.fsa.host(fsa_pos).map(|h| h.alias().to_string()).unwrap_or_default(),
                    job_no = job_no
                );
                return Ok(Some(StartOutcome::Pending));
            }
            return Ok(None);
        };

        // The worker's previous entry, looked up before the new one takes its pid.
        let old_pos = self.queue.position_by_pid(pid);

        if let Some(h) = self.fsa.host_mut(fsa_pos) {
            let js = &mut h.job_status[job_no];
            ControlWord::hand_over(js, msg_name);
            js.job_id = target.job_id;
            h.burst2_counter += 1;
            h.jobs_queued = h.jobs_queued.saturating_sub(1);
        }
        if let Some(e) = self.queue.get_mut(pos) {
            e.pid = pid;
            e.connect_pos = slot as i32;
            e.special_flag |= QUEUED_FOR_BURST;
        }
        let dir_alias = target
            .fra_pos
            .and_then(|d| self.fra.dir(d))
            .map(|d| d.alias().to_string());
        if let Some(conn) = self.connections.get_mut(slot) {
            conn.msg_name = msg_name.to_string();
            conn.resend = entry.special_flag & RESEND_JOB != 0;
            if let Some(alias) = dir_alias {
                conn.fra_pos = target.fra_pos;
                conn.dir_alias = alias;
            }
        }

        let removed_pos = match old_pos {
            Some(op) => {
                let old = self.queue.entries()[op];
                match self.ack_queue.as_mut() {
                    Some(acks) if !old.is_fetch() => {
                        acks.add(old.msg_name(), now)?;
                        if let Some(e) = self.queue.get_mut(op) {
                            e.special_flag |= AWAIT_BURST_ACK;
                        }
                        None
                    }
                    _ => {
                        self.remove_msg(op);
                        Some(op)
                    }
                }
            }
            None => None,
        };

        if let Err(e) = self.workers.signal(pid, Signal::SIGUSR1) {
            log_dispatch_warn!("Failed to wake burst worker", pid = pid, error = e.to_string());
        }
        self.trl.calc(self.fsa.hosts_mut(), fsa_pos);
        log_dispatch_debug!("Burst", msg_name = msg_name, pid = pid, slot = slot);
        Ok(Some(StartOutcome::Burst { removed_pos }))
    }

    fn spawn_entry(
        &mut self,
        pos: usize,
        msg_name: &str,
        target: &JobTarget,
        now: i64,
    ) -> Result<StartOutcome> {
        let entry = self.queue.entries()[pos];
        let fsa_pos = target.fsa_pos;
        let Some(host) = self.fsa.host(fsa_pos) else {
            return Ok(StartOutcome::Pending);
        };
        if host.active_transfers.max(0) as usize >= host.job_slots() {
            return Ok(StartOutcome::Pending);
        }
        let Some(slot) = self.connections.find_free_slot() else {
            if !self.connections.full_noted {
                log_dispatch_info!(
                    "Maximum number of connections reached",
                    max_connections = self.connections.capacity()
                );
                self.connections.full_noted = true;
            }
            return Ok(StartOutcome::Pending);
        };

        let job_no = match resolve_job_slot(host, &entry, target.job_id) {
            SlotResolution::Free(n) => n,
            SlotResolution::Duplicate => {
                if self.connections.multi_start_guard.record_failure(now) {
                    return Err(FdError::NeedsRestart("repeated multiple start of a fetch job"));
                }
                log_dispatch_warn!(
                    "Fetch job already running for directory, dropping",
                    dir_id = msg_name,
                    host = host.alias().to_string()
                );
                self.remove_msg(pos);
                return Ok(StartOutcome::Removed);
            }
            SlotResolution::NoSlot => {
                let connections = &self.connections;
                let workers = &self.workers;
                let mut reset = 0;
                if let Some(h) = self.fsa.host_mut(fsa_pos) {
                    reset = probe_host_slots(h, |pid| {
                        connections.position_by_pid(pid).is_none() && !workers.is_alive(pid)
                    });
                }
                if reset > 0 {
                    log_dispatch_warn!("Reset orphaned job slots", fsa_pos = fsa_pos, reset = reset);
                }
                let resolved = self
                    .fsa
                    .host(fsa_pos)
                    .map(|h| resolve_job_slot(h, &entry, target.job_id));
                match resolved {
                    Some(SlotResolution::Free(n)) => n,
                    _ => {
                        if self.connections.slot_guard.record_failure(now) {
                            return Err(FdError::NeedsRestart("no free job slot"));
                        }
                        log_dispatch_warn!("No free job slot on host", fsa_pos = fsa_pos);
                        return Ok(StartOutcome::Pending);
                    }
                }
            }
        };

        let Some(host) = self.fsa.host(fsa_pos) else {
            return Ok(StartOutcome::Pending);
        };
        let temp_toggle = host.auto_toggle != 0
            && host.error_counter == 0
            && host.original_toggle_pos != NONE
            && host.max_successful_retries > 0
            && host.successful_retries + 1 >= host.max_successful_retries;
        let dir = target.fra_pos.and_then(|d| self.fra.dir(d));
        let dir_mode = dir.map_or(0, |d| d.dir_mode);
        let dir_alias = dir.map(|d| d.alias().to_string()).unwrap_or_default();
        let resend = entry.special_flag & RESEND_JOB != 0;

        let mut cmd = WorkerCommand::build(&SpawnParams {
            work_dir: self.paths.root(),
            job_no,
            fsa_id: self.fsa.id(),
            fsa_pos,
            msg_name,
            protocol: target.protocol,
            fetch: entry.is_fetch(),
            host,
            feature_flag: self.fsa.header().feature_flag,
            config: &self.config,
            age_limit: target.age_limit,
            retries: entry.retries,
            dir_mode,
            resend,
            temp_toggle,
            helper: entry.is_helper(),
            hw_crc32: self.hw_crc32,
        });
        if self.config.add_afd_priority && self.priority_rights != PriorityRights::None {
            cmd.nice = Some(self.config.nice_for_priority(entry.priority()));
            cmd.elevate = self.priority_rights == PriorityRights::Elevate;
        }
        let hostname = host.alias().to_string();
        let host_id = host.host_id;

        // The worker reads its job from the row.
        if let Some(h) = self.fsa.host_mut(fsa_pos) {
            let js = &mut h.job_status[job_no];
            set_cstr(&mut js.unique_name, msg_name);
            js.job_id = target.job_id;
        }
        let pid = match self.workers.spawn(&cmd) {
            Ok(pid) => pid,
            Err(e) => {
                log_dispatch_error!(
                    "Failed to start worker",
                    program = cmd.program.clone(),
                    error = e.to_string()
                );
                if let Some(h) = self.fsa.host_mut(fsa_pos) {
                    h.job_status[job_no].reset();
                }
                return Ok(StartOutcome::Pending);
            }
        };

        if let Some(h) = self.fsa.host_mut(fsa_pos) {
            let js = &mut h.job_status[job_no];
            js.proc_id = pid;
            js.connect_status = CONNECT_STATUS_CONNECTING;
            if entry.is_helper() {
                js.special_flag |= JOB_HELPER;
            }
            if h.auto_toggle != 0
                && h.error_counter == 0
                && h.original_toggle_pos != NONE
                && h.max_successful_retries > 0
            {
                h.successful_retries = if temp_toggle {
                    0
                } else {
                    h.successful_retries + 1
                };
            }
            h.last_connection = now;
            h.jobs_queued = h.jobs_queued.saturating_sub(1);
        }
        {
            let _con = self.fsa.lock(fsa_pos, LockRegion::Connections)?;
            if let Some(h) = self.fsa.host_mut(fsa_pos) {
                h.active_transfers += 1;
                h.connections += 1;
            }
        }
        self.connections.assign(
            slot,
            Connection {
                hostname,
                host_id,
                pid,
                job_no,
                fsa_pos,
                fra_pos: target.fra_pos,
                protocol: Some(target.protocol),
                port: target.port,
                msg_name: msg_name.to_string(),
                dir_alias,
                resend,
                temp_toggle,
            },
        );
        if let Some(e) = self.queue.get_mut(pos) {
            e.pid = pid;
            e.connect_pos = slot as i32;
        }
        self.trl.calc(self.fsa.hosts_mut(), fsa_pos);
        log_dispatch_debug!(
            "Worker started",
            program = cmd.program,
            pid = pid,
            slot = slot,
            job_no = job_no,
            msg_name = msg_name
        );
        Ok(StartOutcome::Started)
    }
}
