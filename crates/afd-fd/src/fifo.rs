//! Input fifos
//!
//! Every fifo is opened read-write so the supervisor never sees EOF when the
//! last writer goes away. Reads are non-blocking and records are
//! reassembled across reads; a hunk is the largest multiple of the record
//! size that fits `PIPE_BUF`. Each wake reads at most one hunk per fifo.

use std::io;
use std::path::Path;

use afd_config::path::{
    WorkPaths, DELETE_LOG_FIFO, EVENT_LOG_FIFO, FD_CMD_FIFO, FD_DELETE_FIFO, FD_WAKE_UP_FIFO,
    MSG_FIFO, QUEUE_LIST_DONE_FIFO, QUEUE_LIST_READY_FIFO, RETRY_FD_FIFO, SF_BURST_ACK_FIFO,
    SF_FIN_FIFO, TRANSFER_LOG_FIFO, TRL_CALC_FIFO,
};
use afd_config::{log_fifo_debug, log_fifo_warn};
use afd_ipc::{BurstAck, DeleteRequest, FdCommand, NewMessage};
use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::net::unix::pipe;

use crate::error::Result;
use crate::supervisor::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoKind {
    Command,
    Message,
    WorkerFinished,
    Retry,
    Delete,
    TrlCalc,
    WakeUp,
    QueueListDone,
    BurstAck,
}

impl FifoKind {
    pub fn file_name(self) -> &'static str {
        match self {
            FifoKind::Command => FD_CMD_FIFO,
            FifoKind::Message => MSG_FIFO,
            FifoKind::WorkerFinished => SF_FIN_FIFO,
            FifoKind::Retry => RETRY_FD_FIFO,
            FifoKind::Delete => FD_DELETE_FIFO,
            FifoKind::TrlCalc => TRL_CALC_FIFO,
            FifoKind::WakeUp => FD_WAKE_UP_FIFO,
            FifoKind::QueueListDone => QUEUE_LIST_DONE_FIFO,
            FifoKind::BurstAck => SF_BURST_ACK_FIFO,
        }
    }

    /// Fixed record size; 1 for byte streams.
    pub fn record_size(self) -> usize {
        match self {
            FifoKind::Message => NewMessage::SIZE,
            FifoKind::WorkerFinished | FifoKind::Retry | FifoKind::TrlCalc => 4,
            FifoKind::BurstAck => BurstAck::SIZE,
            FifoKind::Command | FifoKind::Delete | FifoKind::WakeUp | FifoKind::QueueListDone => 1,
        }
    }

    fn hunk_size(self) -> usize {
        let size = self.record_size();
        (libc::PIPE_BUF / size).max(1) * size
    }
}

/// Create the fifo at `path` unless it exists.
pub fn make_fifo(path: &Path) -> Result<()> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Turn the bytes read from a fifo of `kind` into events. Complete records
/// are drained from `buf`, a trailing partial record stays.
pub fn decode(kind: FifoKind, buf: &mut Vec<u8>) -> Vec<Event> {
    let mut events = Vec::new();
    let consumed = match kind {
        FifoKind::Command => {
            for &b in buf.iter() {
                match FdCommand::try_from(b) {
                    Ok(cmd) => events.push(Event::Command(cmd)),
                    Err(e) => log_fifo_warn!("Unknown command", error = e.to_string()),
                }
            }
            buf.len()
        }
        FifoKind::WakeUp | FifoKind::QueueListDone => {
            if !buf.is_empty() {
                events.push(if kind == FifoKind::WakeUp {
                    Event::WakeUp
                } else {
                    Event::QueueListDone
                });
            }
            buf.len()
        }
        FifoKind::Delete => {
            let (requests, consumed) = DeleteRequest::parse_stream(buf);
            for req in requests {
                match req {
                    Ok(req) => events.push(Event::Delete(req)),
                    Err(e) => log_fifo_warn!("Invalid delete request", error = e.to_string()),
                }
            }
            consumed
        }
        FifoKind::Message | FifoKind::BurstAck => {
            let size = kind.record_size();
            let whole = buf.len() / size * size;
            for rec in buf[..whole].chunks_exact(size) {
                let event = if kind == FifoKind::Message {
                    NewMessage::from_bytes(rec).map(Event::NewMessage)
                } else {
                    BurstAck::from_bytes(rec).map(Event::BurstAck)
                };
                match event {
                    Ok(ev) => events.push(ev),
                    Err(e) => log_fifo_warn!("Dropping invalid record", fifo = kind.file_name(), error = e.to_string()),
                }
            }
            whole
        }
        FifoKind::WorkerFinished | FifoKind::Retry | FifoKind::TrlCalc => {
            let whole = buf.len() / 4 * 4;
            for rec in buf[..whole].chunks_exact(4) {
                let v = i32::from_ne_bytes([rec[0], rec[1], rec[2], rec[3]]);
                events.push(match kind {
                    FifoKind::WorkerFinished => Event::WorkerFinished(v),
                    FifoKind::Retry => Event::Retry(v),
                    _ => Event::TrlCalc(v),
                });
            }
            whole
        }
    };
    buf.drain(..consumed);
    events
}

struct FifoReader {
    kind: FifoKind,
    rx: pipe::Receiver,
    pending: Vec<u8>,
}

impl FifoReader {
    fn open(paths: &WorkPaths, kind: FifoKind) -> Result<Self> {
        let path = paths.fifo(kind.file_name());
        make_fifo(&path)?;
        let rx = pipe::OpenOptions::new().read_write(true).open_receiver(&path)?;
        Ok(Self {
            kind,
            rx,
            pending: Vec::new(),
        })
    }

    /// One read of at most a hunk. Returns the byte count, 0 when nothing
    /// was waiting.
    fn read_hunk(&mut self) -> io::Result<usize> {
        let mut hunk = vec![0u8; self.kind.hunk_size()];
        loop {
            match self.rx.try_read(&mut hunk) {
                Ok(n) => {
                    self.pending.extend_from_slice(&hunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Read until the fifo is empty.
    fn drain(&mut self) -> io::Result<()> {
        while self.read_hunk()? > 0 {}
        Ok(())
    }

    fn take_events(&mut self) -> Vec<Event> {
        let events = decode(self.kind, &mut self.pending);
        if !self.pending.is_empty() {
            log_fifo_debug!(
                "Partial record kept",
                fifo = self.kind.file_name(),
                bytes = self.pending.len()
            );
        }
        events
    }
}

fn is_queue_dump(event: &Event) -> bool {
    matches!(event, Event::Command(FdCommand::FlushMsgFifoDumpQueue))
}

/// Move every message after the first queue dump request in front of it, so
/// the dump sees them queued.
pub fn messages_before_dump(mut events: Vec<Event>) -> Vec<Event> {
    let Some(at) = events.iter().position(is_queue_dump) else {
        return events;
    };
    let tail = events.split_off(at);
    let (messages, rest): (Vec<Event>, Vec<Event>) = tail
        .into_iter()
        .partition(|e| matches!(e, Event::NewMessage(_)));
    events.extend(messages);
    events.extend(rest);
    events
}

pub struct FifoSet {
    cmd: FifoReader,
    msg: FifoReader,
    fin: FifoReader,
    retry: FifoReader,
    delete: FifoReader,
    trl: FifoReader,
    wake_up: FifoReader,
    queue_list_done: FifoReader,
    burst_ack: Option<FifoReader>,
}

async fn readable(reader: Option<&FifoReader>) -> io::Result<()> {
    match reader {
        Some(r) => r.rx.readable().await,
        None => std::future::pending().await,
    }
}

impl FifoSet {
    /// Create and open every input fifo, and create the output fifos.
    /// Must run inside a tokio runtime.
    pub fn create(paths: &WorkPaths, burst_ack: bool) -> Result<Self> {
        for name in [
            EVENT_LOG_FIFO,
            DELETE_LOG_FIFO,
            TRANSFER_LOG_FIFO,
            QUEUE_LIST_READY_FIFO,
        ] {
            make_fifo(&paths.fifo(name))?;
        }
        let set = Self {
            cmd: FifoReader::open(paths, FifoKind::Command)?,
            msg: FifoReader::open(paths, FifoKind::Message)?,
            fin: FifoReader::open(paths, FifoKind::WorkerFinished)?,
            retry: FifoReader::open(paths, FifoKind::Retry)?,
            delete: FifoReader::open(paths, FifoKind::Delete)?,
            trl: FifoReader::open(paths, FifoKind::TrlCalc)?,
            wake_up: FifoReader::open(paths, FifoKind::WakeUp)?,
            queue_list_done: FifoReader::open(paths, FifoKind::QueueListDone)?,
            burst_ack: if burst_ack {
                Some(FifoReader::open(paths, FifoKind::BurstAck)?)
            } else {
                None
            },
        };
        log_fifo_debug!("Fifos open", dir = paths.fifo_dir().display().to_string());
        Ok(set)
    }

    /// Wait until one of the fifos has data.
    pub async fn readable(&self) -> io::Result<FifoKind> {
        tokio::select! {
            biased;
            r = self.cmd.rx.readable() => r.map(|_| FifoKind::Command),
            r = self.fin.rx.readable() => r.map(|_| FifoKind::WorkerFinished),
            r = self.msg.rx.readable() => r.map(|_| FifoKind::Message),
            r = self.retry.rx.readable() => r.map(|_| FifoKind::Retry),
            r = self.delete.rx.readable() => r.map(|_| FifoKind::Delete),
            r = self.trl.rx.readable() => r.map(|_| FifoKind::TrlCalc),
            r = readable(self.burst_ack.as_ref()) => r.map(|_| FifoKind::BurstAck),
            r = self.queue_list_done.rx.readable() => r.map(|_| FifoKind::QueueListDone),
            r = self.wake_up.rx.readable() => r.map(|_| FifoKind::WakeUp),
        }
    }

    /// Read at most one hunk from every fifo and decode it. A queue dump
    /// request first drains the message fifo so no announced job is missing
    /// from the dump.
    pub fn read_ready(&mut self) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        let readers = [
            Some(&mut self.cmd),
            Some(&mut self.fin),
            Some(&mut self.msg),
            Some(&mut self.retry),
            Some(&mut self.delete),
            Some(&mut self.trl),
            self.burst_ack.as_mut(),
            Some(&mut self.queue_list_done),
            Some(&mut self.wake_up),
        ];
        for reader in readers.into_iter().flatten() {
            reader.read_hunk()?;
            events.extend(reader.take_events());
        }
        if events.iter().any(is_queue_dump) {
            self.msg.drain()?;
            events.extend(self.msg.take_events());
        }
        Ok(messages_before_dump(events))
    }
}
