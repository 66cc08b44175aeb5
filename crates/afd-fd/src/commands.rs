//! Handlers for fifo input other than worker notices

use afd_config::{log_fd_debug, log_fd_info, log_fd_warn};
use afd_ipc::{
    BurstAck, DeleteRequest, FdCommand, NewMessage, QueueEntry, AWAIT_BURST_ACK, IN_CURRENT_FSA,
    NOT_IN_CURRENT_FSA, QUEUE_LIST_EMPTY, QUEUE_LIST_READY,
};
use nix::sys::signal::Signal;

use crate::error::Result;
use crate::sinks::DeleteReason;
use crate::supervisor::{read_local_interfaces, StopMode, Supervisor, QUEUE_LIST_DONE_TIMEOUT};
use crate::workers::WorkerControl;

impl<W: WorkerControl> Supervisor<W> {
    pub(crate) fn command(&mut self, cmd: FdCommand, now: i64) -> Result<()> {
        log_fd_debug!("Command", command = format!("{cmd:?}"));
        match cmd {
            FdCommand::RereadLocalInterfaces => {
                self.local_interfaces = read_local_interfaces(&self.paths);
                log_fd_info!("Local interfaces reread", interfaces = self.local_interfaces.len());
            }
            FdCommand::FsaAboutToChange => self.check_fsa(now)?,
            FdCommand::ForceRemoteDirCheck => {
                for d in 0..self.fra.len() {
                    if let Some(dir) = self.fra.dir_mut(d) {
                        dir.next_check_time = 0;
                    }
                }
                self.check_remote_dirs(now)?;
            }
            FdCommand::FlushMsgFifoDumpQueue => self.dump_queue(now)?,
            FdCommand::CheckFsaEntries => self.check_fsa_entries()?,
            FdCommand::SaveStop => self.begin_stop(StopMode::Save, now),
            FdCommand::Stop => self.begin_stop(StopMode::Stop, now),
            FdCommand::QuickStop => self.begin_stop(StopMode::Quick, now),
        }
        Ok(())
    }

    /// Flush the queue for a reader and tell it whether there is anything.
    fn dump_queue(&mut self, now: i64) -> Result<()> {
        self.queue.flush()?;
        self.mdb.flush()?;
        let state = if self.queue.is_empty() {
            QUEUE_LIST_EMPTY
        } else {
            QUEUE_LIST_READY
        };
        self.sinks.queue_list_ready.write_raw(&[state]);
        self.queue_dump = Some(now + QUEUE_LIST_DONE_TIMEOUT);
        Ok(())
    }

    /// Queue a job announced on `msg_fifo`.
    pub(crate) fn new_message(&mut self, msg: &NewMessage, now: i64) -> Result<()> {
        let name = msg.msg_name(self.config.multi_fs);
        let Some(mpos) = self.mdb_lookup_or_load(msg.job_id)? else {
            log_fd_warn!(
                "No job definition for message, deleting its files",
                job_id = msg.job_id,
                msg_name = name.clone()
            );
            self.purge_job_files(&name, "-", DeleteReason::JidMissing, now);
            return Ok(());
        };
        let Some(rec) = self.mdb.get(mpos).copied() else {
            return Ok(());
        };
        let fsa_pos = usize::try_from(rec.fsa_pos)
            .ok()
            .filter(|&p| p < self.fsa.len() && rec.in_current_fsa == IN_CURRENT_FSA);
        let Some(fsa_pos) = fsa_pos else {
            log_fd_warn!(
                "Host of message is not in the FSA, deleting its files",
                host = rec.host_name().to_string(),
                msg_name = name.clone()
            );
            self.purge_job_files(&name, rec.host_name(), DeleteReason::NoHost, now);
            return Ok(());
        };

        let mut entry = QueueEntry::new(&name, msg.priority, msg.creation_time, mpos as i32);
        entry.msg_number = msg.msg_number();
        entry.files_to_send = msg.files_to_send;
        entry.file_size_to_send = msg.file_size_to_send;
        let pos = self.queue.insert(entry)?;
        if let Some(h) = self.fsa.host_mut(fsa_pos) {
            h.jobs_queued += 1;
        }
        log_fd_debug!("Queued", msg_name = name, pos = pos, queued = self.queue.len());
        Ok(())
    }

    /// Run the dispatcher for the first pending entry of host `fsa_pos`,
    /// ignoring its retry cooldown.
    pub(crate) fn retry_host(&mut self, fsa_pos: i32, now: i64) -> Result<()> {
        let Some(fsa_pos) = usize::try_from(fsa_pos).ok().filter(|&p| p < self.fsa.len()) else {
            log_fd_warn!("Retry for invalid host position", fsa_pos = fsa_pos);
            return Ok(());
        };
        let pos = self
            .queue
            .entries()
            .iter()
            .position(|e| e.is_pending() && self.host_of(e) == Some(fsa_pos));
        if let Some(pos) = pos {
            self.start_entry(pos, true, now)?;
        }
        Ok(())
    }

    /// Remove queued jobs an operator asked to delete.
    pub(crate) fn delete(&mut self, req: &DeleteRequest, now: i64) -> Result<()> {
        let matches: Vec<usize> = self
            .queue
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, e)| match req {
                DeleteRequest::AllJobsFromHost(alias) => self
                    .host_of(e)
                    .and_then(|p| self.fsa.host(p))
                    .is_some_and(|h| h.alias() == alias),
                DeleteRequest::Message(name) => e.msg_name() == name,
                DeleteRequest::Retrieve(dir_alias) => {
                    e.is_fetch()
                        && usize::try_from(e.pos)
                            .ok()
                            .and_then(|d| self.fra.dir(d))
                            .is_some_and(|d| d.alias() == dir_alias)
                }
            })
            .map(|(i, _)| i)
            .collect();

        for &pos in matches.iter().rev() {
            let entry = self.queue.entries()[pos];
            if entry.is_running() {
                if let Err(e) = self.workers.signal(entry.pid, Signal::SIGKILL) {
                    log_fd_debug!("Failed to kill worker", pid = entry.pid, error = e.to_string());
                }
            }
            if entry.special_flag & AWAIT_BURST_ACK != 0 {
                if let Some(acks) = self.ack_queue.as_mut() {
                    acks.remove(entry.msg_name());
                }
            }
            if !entry.is_fetch() {
                let host = self
                    .host_of(&entry)
                    .and_then(|p| self.fsa.host(p))
                    .map(|h| h.alias().to_string())
                    .unwrap_or_default();
                let msg_name = entry.msg_name().to_string();
                self.purge_job_files(&msg_name, &host, DeleteReason::UserDel, now);
            }
            self.remove_msg(pos);
        }
        log_fd_info!("Deleted queued jobs", request = format!("{req:?}"), count = matches.len());
        Ok(())
    }

    /// A worker finished a job handed to it by a burst.
    pub(crate) fn burst_ack(&mut self, ack: &BurstAck) {
        let name = ack.msg_name(self.config.multi_fs);
        if let Some(acks) = self.ack_queue.as_mut() {
            if !acks.remove(&name) {
                log_fd_debug!("Burst ack without ack queue entry", msg_name = name.clone());
            }
        }
        match self.queue.position_by_msg_name(&name) {
            Some(pos) if self.queue.entries()[pos].special_flag & AWAIT_BURST_ACK != 0 => {
                self.remove_msg(pos);
            }
            _ => log_fd_debug!("Burst ack for unknown entry", msg_name = name),
        }
    }

    /// Follow a rebuilt FSA or FRA and re-resolve every position into them.
    pub(crate) fn check_fsa(&mut self, now: i64) -> Result<()> {
        let fsa_changed = self.fsa.reattach()?;
        let fra_changed = self.fra.reattach()?;
        if !fsa_changed && !fra_changed {
            log_fd_debug!("FSA and FRA unchanged");
            return Ok(());
        }

        if fsa_changed {
            let positions: Vec<Option<usize>> = self
                .mdb
                .records()
                .iter()
                .map(|r| self.fsa.position_of(r.host_name()))
                .collect();
            for (rec, pos) in self.mdb.records_mut().iter_mut().zip(positions) {
                rec.fsa_pos = pos.map_or(-1, |p| p as i32);
                rec.in_current_fsa = if pos.is_some() {
                    IN_CURRENT_FSA
                } else {
                    NOT_IN_CURRENT_FSA
                };
            }
            for slot in 0..self.connections.capacity() {
                let Some(host_id) = self
                    .connections
                    .get(slot)
                    .filter(|c| !c.is_free())
                    .map(|c| c.host_id)
                else {
                    continue;
                };
                let pos = self.fsa.position_by_host_id(host_id);
                if let Some(conn) = self.connections.get_mut(slot) {
                    // A host that left the FSA is only reaped, never accounted.
                    conn.fsa_pos = pos.unwrap_or(usize::MAX);
                }
            }
            for pos in 0..self.fsa.len() {
                let live = self.connections.count_for_host(pos) as i32;
                if let Some(h) = self.fsa.host_mut(pos) {
                    h.active_transfers = live;
                }
            }
        }

        if fra_changed {
            let mut pos = 0;
            while pos < self.queue.len() {
                let entry = self.queue.entries()[pos];
                if !entry.is_fetch() {
                    pos += 1;
                    continue;
                }
                let dir_pos = u32::from_str_radix(entry.msg_name(), 16)
                    .ok()
                    .and_then(|id| self.fra.position_by_dir_id(id));
                match dir_pos {
                    Some(d) => {
                        if let Some(e) = self.queue.get_mut(pos) {
                            e.pos = d as i32;
                        }
                        pos += 1;
                    }
                    None if entry.is_running() => pos += 1,
                    None => {
                        self.queue.remove(pos);
                    }
                }
            }
            for slot in 0..self.connections.capacity() {
                let Some(alias) = self
                    .connections
                    .get(slot)
                    .filter(|c| c.is_fetch())
                    .map(|c| c.dir_alias.clone())
                else {
                    continue;
                };
                let d = self.fra.position_of(&alias);
                if let Some(conn) = self.connections.get_mut(slot) {
                    conn.fra_pos = Some(d.unwrap_or(usize::MAX));
                }
            }
            self.recount_fra_queued();
        }

        self.reconcile_jobs_queued(true);
        self.trl.recalc_all(self.fsa.hosts_mut());
        self.fsa_change_counter = self.fsa.header().change_counter;
        log_fd_info!(
            "Attached to new tables",
            fsa_id = self.fsa.id(),
            fra_id = self.fra.id(),
            hosts = self.fsa.len(),
            dirs = self.fra.len()
        );
        self.start_pending(now)
    }
}
