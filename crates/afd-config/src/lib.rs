//! # afd-config
//!
//! Configuration for the file distributor.
//!
//! Reads the handful of `AFD_CONFIG` keys the supervisor consults. The file
//! is plain `KEY value` lines; `#` starts a comment. Unknown keys are ignored
//! and invalid values fall back to their default with a warning.

pub mod logging;
pub mod path;
pub mod testing;

use serde::Serialize;
use std::path::Path;
use tracing::{debug, warn};

pub use path::WorkPaths;

/// Upper bound for `MAX_CONNECTIONS`.
pub const MAX_CONFIGURABLE_CONNECTIONS: usize = 1024;
pub const MAX_DEFAULT_CONNECTIONS: usize = 30;
pub const DEFAULT_REMOTE_FILE_CHECK_INTERVAL: i64 = 120;
pub const DEFAULT_AGEING: u8 = 5;
pub const DEFAULT_MAX_OUTPUT_LOG_FILES: u32 = 7;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML serialize error: {0}")]
    Toml(#[from] toml::ser::Error),
}

/// `yes` / `no` / octal mode switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DirCreation {
    #[default]
    No,
    Yes,
    Mode(u32),
}

/// Effective supervisor configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FdConfig {
    pub max_connections: usize,
    pub remote_file_check_interval: i64,
    pub default_age_limit: u32,
    pub default_ageing: u8,
    pub create_target_dir_mode: Option<u32>,
    pub create_source_dir_mode: Option<u32>,
    pub simulate_send_mode: bool,
    pub default_http_proxy: Option<String>,
    pub default_smtp_server: Option<String>,
    pub default_smtp_from: Option<String>,
    pub default_smtp_reply_to: Option<String>,
    pub default_charset: Option<String>,
    pub default_group_mail_domain: Option<String>,
    pub sf_force_disconnect: u32,
    pub gf_force_disconnect: u32,
    pub delete_stale_error_jobs: bool,
    pub fd_priority: Option<i32>,
    /// Only honoured when the supervisor runs with root privileges.
    pub add_afd_priority: bool,
    pub max_nice_value: i32,
    pub min_nice_value: i32,
    pub max_output_log_files: u32,
    /// Defer removal of burst-replaced jobs until the worker acks them.
    pub burst_ack: bool,
    /// Let urgent jobs interrupt low priority transfers on full hosts.
    pub interrupt_jobs: bool,
    /// Prefix msg-names with the source filesystem device.
    pub multi_fs: bool,
    pub create_remote_source_dir: DirCreation,
    pub create_target_dir: DirCreation,
}

impl Default for FdConfig {
    fn default() -> Self {
        Self {
            max_connections: MAX_DEFAULT_CONNECTIONS,
            remote_file_check_interval: DEFAULT_REMOTE_FILE_CHECK_INTERVAL,
            default_age_limit: 0,
            default_ageing: DEFAULT_AGEING,
            create_target_dir_mode: None,
            create_source_dir_mode: None,
            simulate_send_mode: false,
            default_http_proxy: None,
            default_smtp_server: None,
            default_smtp_from: None,
            default_smtp_reply_to: None,
            default_charset: None,
            default_group_mail_domain: None,
            sf_force_disconnect: 0,
            gf_force_disconnect: 0,
            delete_stale_error_jobs: false,
            fd_priority: None,
            add_afd_priority: false,
            max_nice_value: 0,
            min_nice_value: 0,
            max_output_log_files: DEFAULT_MAX_OUTPUT_LOG_FILES,
            burst_ack: false,
            interrupt_jobs: false,
            multi_fs: false,
            create_remote_source_dir: DirCreation::No,
            create_target_dir: DirCreation::No,
        }
    }
}

impl FdConfig {
    /// Load `AFD_CONFIG`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "No AFD_CONFIG, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "Loading AFD_CONFIG");
        Ok(Self::parse(&contents))
    }

    /// Parse `KEY value` lines.
    pub fn parse(contents: &str) -> Self {
        let mut cfg = Self::default();
        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k, v.trim()),
                None => (line, ""),
            };
            cfg.apply(key, value);
        }
        if cfg.min_nice_value > cfg.max_nice_value {
            warn!(
                min = cfg.min_nice_value,
                max = cfg.max_nice_value,
                "MIN_NICE_VALUE above MAX_NICE_VALUE, swapping"
            );
            std::mem::swap(&mut cfg.min_nice_value, &mut cfg.max_nice_value);
        }
        cfg
    }

    fn apply(&mut self, key: &str, value: &str) {
        let d = Self::default();
        match key {
            "MAX_CONNECTIONS" => {
                self.max_connections = parse_num(key, value)
                    .filter(|n| (1..=MAX_CONFIGURABLE_CONNECTIONS).contains(n))
                    .unwrap_or_else(|| invalid(key, value, d.max_connections));
            }
            "REMOTE_FILE_CHECK_INTERVAL" => {
                self.remote_file_check_interval =
                    parse_num(key, value)
                        .filter(|n| *n > 0)
                        .unwrap_or_else(|| invalid(key, value, d.remote_file_check_interval));
            }
            "DEFAULT_AGE_LIMIT" => {
                self.default_age_limit = parse_num(key, value)
                    .unwrap_or_else(|| invalid(key, value, d.default_age_limit));
            }
            "DEFAULT_AGEING" => {
                self.default_ageing = parse_num(key, value)
                    .filter(|n| *n <= 9)
                    .unwrap_or_else(|| invalid(key, value, d.default_ageing));
            }
            "CREATE_TARGET_DIR_MODE" => self.create_target_dir_mode = parse_mode(key, value),
            "CREATE_SOURCE_DIR_MODE" => self.create_source_dir_mode = parse_mode(key, value),
            "CREATE_REMOTE_SOURCE_DIR" => {
                self.create_remote_source_dir = parse_dir_creation(key, value)
            }
            "CREATE_TARGET_DIR" => self.create_target_dir = parse_dir_creation(key, value),
            "SIMULATE_SEND_MODE" => {
                self.simulate_send_mode = parse_bool(key, value, d.simulate_send_mode)
            }
            "DEFAULT_HTTP_PROXY" => self.default_http_proxy = non_empty(value),
            "DEFAULT_SMTP_SERVER" => self.default_smtp_server = non_empty(value),
            "DEFAULT_SMTP_FROM" => self.default_smtp_from = non_empty(value),
            "DEFAULT_SMTP_REPLY_TO" => self.default_smtp_reply_to = non_empty(value),
            "DEFAULT_CHARSET" => self.default_charset = non_empty(value),
            "DEFAULT_GROUP_MAIL_DOMAIN" => self.default_group_mail_domain = non_empty(value),
            "SF_FORCE_DISCONNECT" => {
                self.sf_force_disconnect = parse_num(key, value)
                    .unwrap_or_else(|| invalid(key, value, d.sf_force_disconnect));
            }
            "GF_FORCE_DISCONNECT" => {
                self.gf_force_disconnect = parse_num(key, value)
                    .unwrap_or_else(|| invalid(key, value, d.gf_force_disconnect));
            }
            "DELETE_STALE_ERROR_JOBS" => {
                self.delete_stale_error_jobs = parse_bool(key, value, d.delete_stale_error_jobs)
            }
            "FD_PRIORITY" => {
                self.fd_priority = parse_num::<i32>(key, value).filter(|n| (-20..=19).contains(n));
                if self.fd_priority.is_none() {
                    warn!(key, value, "Invalid value, ignoring");
                }
            }
            "ADD_AFD_PRIORITY" => {
                self.add_afd_priority = parse_bool(key, value, d.add_afd_priority)
            }
            "MAX_NICE_VALUE" => {
                self.max_nice_value = parse_num(key, value)
                    .filter(|n| (-20..=19).contains(n))
                    .unwrap_or_else(|| invalid(key, value, d.max_nice_value));
            }
            "MIN_NICE_VALUE" => {
                self.min_nice_value = parse_num(key, value)
                    .filter(|n| (-20..=19).contains(n))
                    .unwrap_or_else(|| invalid(key, value, d.min_nice_value));
            }
            "MAX_OUTPUT_LOG_FILES" => {
                self.max_output_log_files = parse_num(key, value)
                    .filter(|n| *n > 0)
                    .unwrap_or_else(|| invalid(key, value, d.max_output_log_files));
            }
            "FD_BURST_ACK" => self.burst_ack = parse_bool(key, value, d.burst_ack),
            "FD_INTERRUPT_JOBS" => self.interrupt_jobs = parse_bool(key, value, d.interrupt_jobs),
            "MULTI_FS_SUPPORT" => self.multi_fs = parse_bool(key, value, d.multi_fs),
            _ => {}
        }
    }

    /// Mode passed with `-m` to send workers.
    pub fn target_dir_mode(&self) -> Option<u32> {
        match self.create_target_dir {
            DirCreation::Mode(m) => Some(m),
            DirCreation::Yes => self.create_target_dir_mode,
            DirCreation::No => None,
        }
    }

    /// Mode passed with `-m` to fetch workers.
    pub fn source_dir_mode(&self) -> Option<u32> {
        match self.create_remote_source_dir {
            DirCreation::Mode(m) => Some(m),
            DirCreation::Yes => self.create_source_dir_mode,
            DirCreation::No => None,
        }
    }

    /// Nice value for a worker running a job of `priority` ('0'..='9').
    pub fn nice_for_priority(&self, priority: u8) -> i32 {
        let p = priority.saturating_sub(b'0').min(9) as i32;
        let span = self.max_nice_value - self.min_nice_value;
        self.min_nice_value + (span * p) / 9
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            debug!(key, value, "Not a number");
            None
        }
    }
}

fn invalid<T: std::fmt::Display + Copy>(key: &str, value: &str, default: T) -> T {
    warn!(key, value, default = %default, "Invalid value, using default");
    default
}

fn parse_bool(key: &str, value: &str, default: bool) -> bool {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "on" | "true" | "1" => true,
        "no" | "off" | "false" | "0" => false,
        _ => invalid(key, value, default),
    }
}

fn parse_octal(value: &str) -> Option<u32> {
    u32::from_str_radix(value, 8)
        .ok()
        .filter(|m| (0o700..=0o7777).contains(m))
}

fn parse_mode(key: &str, value: &str) -> Option<u32> {
    let mode = parse_octal(value);
    if mode.is_none() {
        warn!(key, value, "Invalid directory mode, ignoring");
    }
    mode
}

fn parse_dir_creation(key: &str, value: &str) -> DirCreation {
    match value.to_ascii_lowercase().as_str() {
        "yes" => DirCreation::Yes,
        "no" => DirCreation::No,
        other => match parse_octal(other) {
            Some(m) => DirCreation::Mode(m),
            None => {
                warn!(key, value, "Expected yes, no or an octal mode, using no");
                DirCreation::No
            }
        },
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
