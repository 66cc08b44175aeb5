//! Reaper: account for finished workers
//!
//! Workers announce their exit on `sf_fin`; the periodic sweep catches the
//! ones that died without doing so. All `waitpid` calls are non-blocking, a
//! worker that announced its exit but is not collectable yet waits on the
//! zombie list.

use afd_config::{log_reaper_debug, log_reaper_info, log_reaper_warn};
use afd_ipc::{
    msg_number, ControlWord, ExitKind, QueueEntry, WorkerExit, AUTO_PAUSE_QUEUE, ERROR_QUEUE_SET,
    EVENT_STATUS_FLAGS, FETCH_JOB, HELPER_JOB, HOST_ACTION_SUCCESS, HOST_OFFLINE,
    HOST_OFFLINE_TEMP, HOST_ONE, HOST_TWO, NONE, NOT_IN_CURRENT_FSA,
};
use nix::sys::signal::Signal;

use crate::connection::Connection;
use crate::dispatch::StartOutcome;
use crate::error::Result;
use crate::fsa::LockRegion;
use crate::sinks::{DeleteReason, HostEvent};
use crate::supervisor::Supervisor;
use crate::workers::{ReapStatus, WorkerControl};

/// What a reap does with the queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    MoreFiles,
    Failed(ExitKind),
    /// Back to pending without counting against the host.
    Requeue,
    NothingToSend,
}

impl<W: WorkerControl> Supervisor<W> {
    /// A pid read from `sf_fin`.
    pub(crate) fn handle_finished(&mut self, pid: i32, now: i64) -> Result<()> {
        if pid < 0 {
            return self.burst_request(-pid, now);
        }
        let Some(slot) = self.connections.position_by_pid(pid) else {
            log_reaper_debug!("Finish notice for unknown pid", pid = pid);
            if pid > 0 {
                let _ = self.workers.try_reap(pid);
            }
            return Ok(());
        };
        match self.workers.try_reap(pid) {
            Some(status) => self.reap_slot(slot, status, now),
            None => {
                if !self.zombies.contains(&slot) {
                    self.zombies.push(slot);
                }
                Ok(())
            }
        }
    }

    /// A live worker asks for more work or for a helper.
    fn burst_request(&mut self, pid: i32, now: i64) -> Result<()> {
        let Some(slot) = self.connections.position_by_pid(pid) else {
            log_reaper_debug!("Burst request from unknown pid", pid = pid);
            return Ok(());
        };
        let Some(conn) = self.connections.get(slot).cloned() else {
            return Ok(());
        };
        let Some(host) = self.fsa.host(conn.fsa_pos) else {
            return Ok(());
        };
        match ControlWord::load(&host.job_status[conn.job_no]) {
            ControlWord::HelperRequest => {
                if let Some(h) = self.fsa.host_mut(conn.fsa_pos) {
                    ControlWord::clear(&mut h.job_status[conn.job_no]);
                }
                self.start_helper(&conn, now)
            }
            ControlWord::ReadyForBurst => {
                let burst = self.burst_host_queue(conn.fsa_pos, conn.job_no, now)?;
                if let Some(h) = self.fsa.host_mut(conn.fsa_pos) {
                    let js = &mut h.job_status[conn.job_no];
                    if !burst && ControlWord::load(js) == ControlWord::ReadyForBurst {
                        ControlWord::reply_no_more(js);
                    }
                }
                if !burst {
                    if let Err(e) = self.workers.signal(pid, Signal::SIGUSR1) {
                        log_reaper_debug!("Failed to wake worker", pid = pid, error = e.to_string());
                    }
                }
                Ok(())
            }
            ControlWord::Terminating | ControlWord::Busy => {
                log_reaper_debug!("Worker is already terminating", pid = pid);
                Ok(())
            }
        }
    }

    /// Offer the pending entries of host `fsa_pos` to the idle worker in
    /// row `job_no`. True once it took one.
    fn burst_host_queue(&mut self, fsa_pos: usize, job_no: usize, now: i64) -> Result<bool> {
        let still_idle = |sup: &Self| {
            sup.fsa
                .host(fsa_pos)
                .is_some_and(|h| ControlWord::load(&h.job_status[job_no]) == ControlWord::ReadyForBurst)
        };
        let mut pos = 0;
        while pos < self.queue.len() {
            let entry = self.queue.entries()[pos];
            if !entry.is_pending() || self.host_of(&entry) != Some(fsa_pos) {
                pos += 1;
                continue;
            }
            match self.start_entry(pos, false, now)? {
                StartOutcome::Burst { removed_pos } => {
                    if !still_idle(self) {
                        return Ok(true);
                    }
                    if !matches!(removed_pos, Some(r) if r < pos) {
                        pos += 1;
                    }
                }
                StartOutcome::Removed => {}
                _ => pos += 1,
            }
        }
        Ok(false)
    }

    /// Queue a helper fetch job for the directory of `conn` and start it.
    fn start_helper(&mut self, conn: &Connection, now: i64) -> Result<()> {
        let Some(fra_pos) = conn.fra_pos else {
            log_reaper_warn!("Helper request from a send worker", pid = conn.pid);
            return Ok(());
        };
        let Some(dir) = self.fra.dir(fra_pos) else {
            return Ok(());
        };
        let mut entry = QueueEntry::new(&format!("{:x}", dir.dir_id), dir.priority, now, fra_pos as i32);
        entry.msg_number = msg_number(dir.priority, now, 0, 0);
        entry.special_flag = FETCH_JOB | HELPER_JOB;
        let pos = self.queue.insert(entry)?;
        self.fra.inc_queued(fra_pos);
        if let Some(h) = self.fsa.host_mut(conn.fsa_pos) {
            h.jobs_queued += 1;
        }
        log_reaper_debug!("Helper fetch job queued", dir_alias = conn.dir_alias.clone());
        self.start_entry(pos, false, now)?;
        Ok(())
    }

    /// Revisit workers that announced their exit but were not collectable.
    pub(crate) fn check_zombies(&mut self, now: i64) -> Result<()> {
        for slot in std::mem::take(&mut self.zombies) {
            let Some(pid) = self.connections.get(slot).filter(|c| !c.is_free()).map(|c| c.pid) else {
                continue;
            };
            match self.workers.try_reap(pid) {
                Some(status) => self.reap_slot(slot, status, now)?,
                None => self.zombies.push(slot),
            }
        }
        Ok(())
    }

    /// Collect every terminated worker, announced or not, and stray children.
    pub(crate) fn sweep_children(&mut self, now: i64) -> Result<()> {
        let live: Vec<(usize, i32)> = self.connections.live().map(|(s, c)| (s, c.pid)).collect();
        for (slot, pid) in live {
            if let Some(status) = self.workers.try_reap(pid) {
                log_reaper_info!("Collected worker that exited without notice", pid = pid);
                self.reap_slot(slot, status, now)?;
            }
        }
        while let Some((pid, status)) = self.workers.reap_any() {
            match self.connections.position_by_pid(pid) {
                Some(slot) => self.reap_slot(slot, status, now)?,
                None => log_reaper_debug!("Collected stray child", pid = pid),
            }
        }
        Ok(())
    }

    /// Account for the terminated worker in `slot` and free the slot.
    pub(crate) fn reap_slot(&mut self, slot: usize, status: ReapStatus, now: i64) -> Result<()> {
        let Some(conn) = self.connections.get(slot).cloned() else {
            return Ok(());
        };
        if conn.is_free() {
            return Ok(());
        }
        let (exit_code, kind) = match status {
            ReapStatus::Exited(code) => match WorkerExit::from_code(code) {
                Some(exit) => (exit.code(), exit.kind()),
                None => {
                    log_reaper_warn!(
                        "Unknown worker exit code, treating as retriable",
                        pid = conn.pid,
                        code = code
                    );
                    (code as u8, ExitKind::Ageing)
                }
            },
            ReapStatus::Signaled(_) | ReapStatus::Gone => {
                (WorkerExit::GotKilled.code(), ExitKind::Killed)
            }
        };
        let outcome = match kind {
            ExitKind::Success => Outcome::Done,
            ExitKind::StillFiles => Outcome::MoreFiles,
            ExitKind::NoFilesToSend => Outcome::NothingToSend,
            ExitKind::Killed => Outcome::Requeue,
            // The toggled-to host is only being probed.
            _ if conn.temp_toggle => Outcome::Requeue,
            failed => Outcome::Failed(failed),
        };
        log_reaper_debug!(
            "Worker finished",
            pid = conn.pid,
            host = conn.hostname.clone(),
            code = exit_code,
            outcome = format!("{outcome:?}")
        );

        let qpos = self.queue.position_by_pid(conn.pid);
        let fsa_pos = conn.fsa_pos;
        let host_valid = fsa_pos < self.fsa.len();
        let job_id = self
            .fsa
            .host(fsa_pos)
            .map_or(0, |h| h.job_status[conn.job_no].job_id);

        if host_valid {
            match outcome {
                Outcome::Done | Outcome::MoreFiles => self.account_success(&conn, job_id, now)?,
                // A broken job definition says nothing about the host.
                Outcome::Failed(ExitKind::Permanent) => {}
                Outcome::Failed(_) => self.account_failure(fsa_pos, now)?,
                _ => {}
            }
            let offline = self
                .fsa
                .host(fsa_pos)
                .is_some_and(|h| h.host_status & (HOST_OFFLINE | HOST_OFFLINE_TEMP) != 0);
            let history = match outcome {
                Outcome::Requeue => 0,
                _ if offline => 0,
                _ => exit_code,
            };
            let _ec = self.fsa.lock(fsa_pos, LockRegion::ErrorCounter)?;
            if let Some(h) = self.fsa.host_mut(fsa_pos) {
                h.push_error_history(history);
            }
        }

        if let Some(qpos) = qpos {
            self.settle_entry(qpos, outcome, &conn, job_id, now)?;
        }

        if host_valid {
            if let Some(h) = self.fsa.host_mut(fsa_pos) {
                h.job_status[conn.job_no].reset();
            }
            let _con = self.fsa.lock(fsa_pos, LockRegion::Connections)?;
            if let Some(h) = self.fsa.host_mut(fsa_pos) {
                h.active_transfers = (h.active_transfers - 1).max(0);
                h.connections = h.connections.saturating_sub(1);
            }
        }
        self.connections.release(slot);
        self.zombies.retain(|&s| s != slot);
        let (utime, stime) = self.workers.child_cpu_times();
        self.child_utime = utime;
        self.child_stime = stime;
        if host_valid {
            self.trl.calc(self.fsa.hosts_mut(), fsa_pos);
        }
        Ok(())
    }

    fn account_success(&mut self, conn: &Connection, job_id: u32, now: i64) -> Result<()> {
        let fsa_pos = conn.fsa_pos;
        let Some(host) = self.fsa.host(fsa_pos) else {
            return Ok(());
        };
        let alias = host.alias().to_string();
        let had_errors = host.error_counter > 0;
        let success_action = host.host_status & HOST_ACTION_SUCCESS != 0;
        {
            let _ec = self.fsa.lock(fsa_pos, LockRegion::ErrorCounter)?;
            if let Some(h) = self.fsa.host_mut(fsa_pos) {
                h.error_counter = 0;
                h.first_error_time = 0;
            }
        }
        if had_errors {
            self.sinks.host_event(now, &alias, HostEvent::ErrorActionStop);
            if success_action {
                self.sinks.host_event(now, &alias, HostEvent::SuccessActionStart);
            }
            log_reaper_info!("Host recovered", host = alias.clone());
        }
        self.error_queue_remove(job_id, fsa_pos)?;

        if conn.temp_toggle {
            if let Some(h) = self.fsa.host_mut(fsa_pos) {
                if h.original_toggle_pos != NONE {
                    h.host_toggle = h.original_toggle_pos;
                    h.original_toggle_pos = NONE;
                    h.successful_retries = 0;
                    let to = h.active_hostname().to_string();
                    self.sinks
                        .transfer(now, &alias, &format!("Switching back to original host {to}"));
                }
            }
        }
        Ok(())
    }

    fn account_failure(&mut self, fsa_pos: usize, now: i64) -> Result<()> {
        let Some(host) = self.fsa.host(fsa_pos) else {
            return Ok(());
        };
        let alias = host.alias().to_string();
        let reached = {
            let _ec = self.fsa.lock(fsa_pos, LockRegion::ErrorCounter)?;
            let Some(h) = self.fsa.host_mut(fsa_pos) else {
                return Ok(());
            };
            h.error_counter += 1;
            if h.first_error_time == 0 {
                h.first_error_time = now;
            }
            h.last_retry_time = now;
            h.error_counter == h.max_errors
        };
        if !reached {
            return Ok(());
        }
        self.sinks.host_event(now, &alias, HostEvent::ErrorActionStart);
        log_reaper_warn!("Host reached its error limit", host = alias.clone());
        if let Some(h) = self.fsa.host_mut(fsa_pos) {
            if h.auto_toggle != 0 {
                if h.original_toggle_pos == NONE {
                    h.original_toggle_pos = h.host_toggle;
                }
                h.host_toggle = if h.host_toggle == HOST_TWO { HOST_ONE } else { HOST_TWO };
                let to = h.active_hostname().to_string();
                self.sinks
                    .transfer(now, &alias, &format!("Automatic toggle to {to}"));
            }
        }
        Ok(())
    }

    /// Apply a reap outcome to the worker's queue entry at `qpos`.
    fn settle_entry(
        &mut self,
        qpos: usize,
        outcome: Outcome,
        conn: &Connection,
        job_id: u32,
        now: i64,
    ) -> Result<()> {
        let entry = self.queue.entries()[qpos];
        let target = self.target_of(&entry);
        match outcome {
            Outcome::Done => {
                if !entry.is_fetch() {
                    if let Some(rec) = usize::try_from(entry.pos).ok().and_then(|p| self.mdb.get_mut(p)) {
                        rec.last_transfer_time = now;
                    }
                }
                self.remove_msg(qpos);
            }
            Outcome::MoreFiles | Outcome::Requeue => self.set_pending(qpos),
            Outcome::NothingToSend => {
                self.remove_msg(qpos);
                self.clear_auto_pause(conn.fsa_pos, now)?;
            }
            Outcome::Failed(ExitKind::Local) => {
                self.bump_retries(qpos);
                self.set_pending(qpos);
            }
            Outcome::Failed(ExitKind::Permanent) => {
                let stale = !entry.is_fetch()
                    && self.config.delete_stale_error_jobs
                    && usize::try_from(entry.pos)
                        .ok()
                        .and_then(|p| self.mdb.get(p))
                        .is_some_and(|r| r.in_current_fsa == NOT_IN_CURRENT_FSA);
                if stale {
                    let msg_name = entry.msg_name().to_string();
                    self.purge_job_files(&msg_name, &conn.hostname, DeleteReason::StaleError, now);
                    self.error_queue_remove(job_id, conn.fsa_pos)?;
                    self.remove_msg(qpos);
                } else {
                    self.set_pending(qpos);
                }
            }
            Outcome::Failed(_) => {
                self.bump_retries(qpos);
                self.set_pending(qpos);
                let ageing = target.map_or(self.config.default_ageing, |t| t.ageing);
                self.queue.resort_on_failure(qpos, ageing, now);
                self.queue_error(conn.fsa_pos, job_id, now)?;
            }
        }
        Ok(())
    }

    fn bump_retries(&mut self, qpos: usize) {
        if let Some(e) = self.queue.get_mut(qpos) {
            e.retries += 1;
        }
    }

    /// Hold `job_id` back for the host's retry interval.
    fn queue_error(&mut self, fsa_pos: usize, job_id: u32, now: i64) -> Result<()> {
        let Some(host) = self.fsa.host(fsa_pos) else {
            return Ok(());
        };
        let next = now + i64::from(host.retry_interval);
        self.error_queue.add(job_id, host.host_id, next)?;
        let _hs = self.fsa.lock(fsa_pos, LockRegion::HostStatus)?;
        if let Some(h) = self.fsa.host_mut(fsa_pos) {
            h.host_status |= ERROR_QUEUE_SET;
        }
        Ok(())
    }

    fn clear_auto_pause(&mut self, fsa_pos: usize, now: i64) -> Result<()> {
        let Some(host) = self.fsa.host(fsa_pos) else {
            return Ok(());
        };
        if host.total_file_counter != 0 || host.host_status & AUTO_PAUSE_QUEUE == 0 {
            return Ok(());
        }
        let alias = host.alias().to_string();
        {
            let _hs = self.fsa.lock(fsa_pos, LockRegion::HostStatus)?;
            if let Some(h) = self.fsa.host_mut(fsa_pos) {
                h.host_status &= !(AUTO_PAUSE_QUEUE | EVENT_STATUS_FLAGS);
            }
        }
        self.sinks.host_event(now, &alias, HostEvent::AutoPauseQueueStop);
        Ok(())
    }
}
