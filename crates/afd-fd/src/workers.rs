//! Starting, signalling and reaping protocol workers
//!
//! The dispatcher and reaper only talk to workers through [`WorkerControl`].
//! [`ProcessWorkers`] is the real implementation on top of
//! `std::process::Command` and `waitpid(WNOHANG)`; tests script a fake.

use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use afd_config::{log_reaper_debug, FdConfig};
use afd_ipc::{
    HostRecord, Protocol, DISABLE_ARCHIVE, DO_NOT_ARCHIVE, SIMULATE_SEND, TRACE_MODE,
};
use nix::errno::Errno;
use nix::sys::resource::{getrusage, UsageWho};
use nix::sys::signal::{kill, Signal};
use nix::sys::time::TimeValLike;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// How a worker ended, as far as `waitpid` can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapStatus {
    Exited(i32),
    Signaled(i32),
    /// Not our child (any more); nothing left to collect.
    Gone,
}

pub trait WorkerControl {
    /// Start a worker and return its pid.
    fn spawn(&mut self, cmd: &WorkerCommand) -> io::Result<i32>;

    fn signal(&mut self, pid: i32, signal: Signal) -> nix::Result<()>;

    /// `kill(pid, 0)` probe.
    fn is_alive(&self, pid: i32) -> bool;

    /// Collect `pid` if it has terminated. `None` while it still runs.
    fn try_reap(&mut self, pid: i32) -> Option<ReapStatus>;

    /// Collect any terminated child.
    fn reap_any(&mut self) -> Option<(i32, ReapStatus)>;

    /// User and system CPU time of all reaped children.
    fn child_cpu_times(&self) -> (Duration, Duration);
}

/// Program and argv of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Nice value applied in the child before exec.
    pub nice: Option<i32>,
    /// Regain root for `setpriority` in the child. A failing
    /// `setpriority` leaves the child at the default priority.
    pub elevate: bool,
}

/// Everything argv assembly looks at.
pub struct SpawnParams<'a> {
    pub work_dir: &'a Path,
    pub job_no: usize,
    pub fsa_id: i32,
    pub fsa_pos: usize,
    /// Msg-name for send jobs, hex dir id for fetch jobs.
    pub msg_name: &'a str,
    pub protocol: Protocol,
    pub fetch: bool,
    pub host: &'a HostRecord,
    /// FSA header feature byte.
    pub feature_flag: u8,
    pub config: &'a FdConfig,
    pub age_limit: u32,
    pub retries: u32,
    /// FRA create mode of the directory, 0 if unset.
    pub dir_mode: u32,
    pub resend: bool,
    pub temp_toggle: bool,
    pub helper: bool,
    pub hw_crc32: bool,
}

impl WorkerCommand {
    /// `<sf|gf>_<proto>[_trace] <work dir> <job no> <fsa id> <fsa pos> <msg name> [options]`
    pub fn build(p: &SpawnParams<'_>) -> Self {
        let role = if p.fetch { "gf" } else { "sf" };
        let trace = if p.host.debug >= TRACE_MODE { "_trace" } else { "" };
        let program = format!("{role}_{}{trace}", p.protocol.name());

        let mut args = vec![
            p.work_dir.display().to_string(),
            p.job_no.to_string(),
            p.fsa_id.to_string(),
            p.fsa_pos.to_string(),
            p.msg_name.to_string(),
        ];
        let mut opt = |flag: &str, value: Option<String>| {
            args.push(flag.to_string());
            if let Some(v) = value {
                args.push(v);
            }
        };

        let cfg = p.config;
        if !p.fetch
            && (p.feature_flag & DISABLE_ARCHIVE != 0 || p.host.host_status & DO_NOT_ARCHIVE != 0)
        {
            opt("-A", None);
        }
        if p.resend {
            opt("-r", None);
        }
        if !p.fetch && p.age_limit > 0 {
            opt("-a", Some(p.age_limit.to_string()));
        }
        let force_disconnect = if p.fetch {
            cfg.gf_force_disconnect
        } else {
            cfg.sf_force_disconnect
        };
        if force_disconnect > 0 && p.host.keep_connected > 0 {
            opt("-e", Some(force_disconnect.to_string()));
        }
        if p.host.host_status & SIMULATE_SEND != 0 || cfg.simulate_send_mode {
            opt("-S", None);
        }
        let mode = if p.fetch {
            (p.dir_mode != 0).then_some(p.dir_mode).or(cfg.source_dir_mode())
        } else {
            cfg.target_dir_mode()
        };
        if let Some(mode) = mode {
            opt("-m", Some(format!("{mode:o}")));
        }
        if p.temp_toggle {
            opt("-t", None);
        }
        if p.helper {
            opt("-d", None);
        }
        if p.fetch && p.host.keep_connected > 0 {
            opt("-i", Some(cfg.remote_file_check_interval.to_string()));
        }
        if !p.fetch && p.protocol == Protocol::Smtp {
            for (flag, value) in [
                ("-f", &cfg.default_smtp_from),
                ("-R", &cfg.default_smtp_reply_to),
                ("-C", &cfg.default_charset),
                ("-s", &cfg.default_smtp_server),
                ("-g", &cfg.default_group_mail_domain),
            ] {
                if let Some(v) = value {
                    opt(flag, Some(v.clone()));
                }
            }
        }
        if p.protocol == Protocol::Http {
            if let Some(proxy) = &cfg.default_http_proxy {
                opt("-h", Some(proxy.clone()));
            }
        }
        if p.retries > 0 {
            opt("-o", Some(p.retries.to_string()));
        }
        if p.hw_crc32 {
            opt("-c", None);
        }

        Self {
            program,
            args,
            nice: None,
            elevate: false,
        }
    }
}

/// Whether the CPU has a CRC32 instruction workers can use.
pub fn detect_hw_crc32() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::arch::is_x86_feature_detected!("sse4.2")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

/// Real workers: fork/exec through `std::process::Command`.
#[derive(Debug, Default)]
pub struct ProcessWorkers;

fn wait_status(status: WaitStatus) -> Option<(i32, ReapStatus)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid.as_raw(), ReapStatus::Exited(code))),
        WaitStatus::Signaled(pid, sig, _) => Some((pid.as_raw(), ReapStatus::Signaled(sig as i32))),
        _ => None,
    }
}

impl WorkerControl for ProcessWorkers {
    fn spawn(&mut self, cmd: &WorkerCommand) -> io::Result<i32> {
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args).stdin(Stdio::null());
        if let Some(nice) = cmd.nice {
            let elevate = cmd.elevate;
            // SAFETY: only async-signal-safe libc calls between fork and exec.
            unsafe {
                command.pre_exec(move || {
                    if elevate {
                        libc::seteuid(0);
                    }
                    // On failure the worker runs at the default priority.
                    libc::setpriority(libc::PRIO_PROCESS as _, 0, nice);
                    if elevate {
                        libc::seteuid(libc::getuid());
                    }
                    Ok(())
                });
            }
        }
        // The handle is dropped; the child is collected with waitpid.
        let child = command.spawn()?;
        Ok(child.id() as i32)
    }

    fn signal(&mut self, pid: i32, signal: Signal) -> nix::Result<()> {
        kill(Pid::from_raw(pid), signal)
    }

    fn is_alive(&self, pid: i32) -> bool {
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(e) => e == Errno::EPERM,
        }
    }

    fn try_reap(&mut self, pid: i32) -> Option<ReapStatus> {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => wait_status(status).map(|(_, s)| s),
            Err(Errno::ECHILD) => Some(ReapStatus::Gone),
            Err(e) => {
                log_reaper_debug!("waitpid failed", pid = pid, error = e.to_string());
                None
            }
        }
    }

    fn reap_any(&mut self) -> Option<(i32, ReapStatus)> {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => wait_status(status),
            Err(_) => None,
        }
    }

    fn child_cpu_times(&self) -> (Duration, Duration) {
        match getrusage(UsageWho::RUSAGE_CHILDREN) {
            Ok(usage) => (
                Duration::from_micros(usage.user_time().num_microseconds().max(0) as u64),
                Duration::from_micros(usage.system_time().num_microseconds().max(0) as u64),
            ),
            Err(_) => (Duration::ZERO, Duration::ZERO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afd_config::DirCreation;

    fn params<'a>(host: &'a HostRecord, cfg: &'a FdConfig, msg_name: &'a str) -> SpawnParams<'a> {
        SpawnParams {
            work_dir: Path::new("/afd"),
            job_no: 1,
            fsa_id: 3,
            fsa_pos: 0,
            msg_name,
            protocol: Protocol::Ftp,
            fetch: false,
            host,
            feature_flag: 0,
            config: cfg,
            age_limit: 0,
            retries: 0,
            dir_mode: 0,
            resend: false,
            temp_toggle: false,
            helper: false,
            hw_crc32: false,
        }
    }

    #[test]
    fn test_minimal_send_argv() {
        let host = HostRecord::new("alpha", 1);
        let cfg = FdConfig::default();
        let cmd = WorkerCommand::build(&params(&host, &cfg, "1a/0/3e8_1_0"));
        assert_eq!(cmd.program, "sf_ftp");
        assert_eq!(cmd.args, ["/afd", "1", "3", "0", "1a/0/3e8_1_0"]);
    }

    #[test]
    fn test_send_options_in_order() {
        let mut host = HostRecord::new("alpha", 1);
        host.keep_connected = 30;
        host.host_status = DO_NOT_ARCHIVE | SIMULATE_SEND;
        host.debug = TRACE_MODE;
        let cfg = FdConfig {
            sf_force_disconnect: 600,
            create_target_dir: DirCreation::Mode(0o755),
            ..Default::default()
        };
        let mut p = params(&host, &cfg, "m");
        p.resend = true;
        p.age_limit = 60;
        p.temp_toggle = true;
        p.retries = 2;
        p.hw_crc32 = true;
        let cmd = WorkerCommand::build(&p);
        assert_eq!(cmd.program, "sf_ftp_trace");
        assert_eq!(
            &cmd.args[5..],
            ["-A", "-r", "-a", "60", "-e", "600", "-S", "-m", "755", "-t", "-o", "2", "-c"]
        );
    }

    #[test]
    fn test_fetch_options() {
        let mut host = HostRecord::new("alpha", 1);
        host.keep_connected = 30;
        let cfg = FdConfig::default();
        let mut p = params(&host, &cfg, "2a");
        p.fetch = true;
        p.protocol = Protocol::Sftp;
        p.helper = true;
        p.dir_mode = 0o750;
        p.age_limit = 60;
        let cmd = WorkerCommand::build(&p);
        assert_eq!(cmd.program, "gf_sftp");
        assert_eq!(&cmd.args[5..], ["-m", "750", "-d", "-i", "120"]);
    }

    #[test]
    fn test_smtp_and_http_options() {
        let host = HostRecord::new("mail", 1);
        let cfg = FdConfig {
            default_smtp_from: Some("afd@example.org".into()),
            default_smtp_server: Some("mx.example.org".into()),
            default_http_proxy: Some("proxy:3128".into()),
            ..Default::default()
        };
        let mut p = params(&host, &cfg, "m");
        p.protocol = Protocol::Smtp;
        let cmd = WorkerCommand::build(&p);
        assert_eq!(cmd.program, "sf_smtp");
        assert_eq!(&cmd.args[5..], ["-f", "afd@example.org", "-s", "mx.example.org"]);

        p.protocol = Protocol::Http;
        let cmd = WorkerCommand::build(&p);
        assert_eq!(&cmd.args[5..], ["-h", "proxy:3128"]);
    }

    #[test]
    fn test_process_workers_reap_real_child() {
        let mut workers = ProcessWorkers;
        let pid = workers
            .spawn(&WorkerCommand {
                program: "true".into(),
                args: vec![],
                nice: None,
                elevate: false,
            })
            .unwrap();
        let status = loop {
            if let Some(s) = workers.try_reap(pid) {
                break s;
            }
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(status, ReapStatus::Exited(0));
        assert_eq!(workers.try_reap(pid), Some(ReapStatus::Gone));
    }

    #[test]
    fn test_refused_nice_value_still_runs_worker() {
        let mut workers = ProcessWorkers;
        let pid = workers
            .spawn(&WorkerCommand {
                program: "true".into(),
                args: vec![],
                nice: Some(-5),
                elevate: false,
            })
            .unwrap();
        let status = loop {
            if let Some(s) = workers.try_reap(pid) {
                break s;
            }
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(status, ReapStatus::Exited(0));
    }
}
