//! Structured logging for the file distributor.
//!
//! Every record carries a `component` field so one subsystem can be
//! filtered out of a busy supervisor log.
//!
//! # Usage
//!
//! ```ignore
//! use afd_config::log_queue_debug;
//!
//! log_queue_debug!("Inserted", pos = 3, msg_name = name);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const FD: &'static str = "FD";
    pub const QUEUE: &'static str = "QUEUE";
    pub const DISPATCH: &'static str = "DISPATCH";
    pub const REAPER: &'static str = "REAPER";
    pub const FIFO: &'static str = "FIFO";
    pub const MAINT: &'static str = "MAINT";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === FD (supervisor) ===

#[macro_export]
macro_rules! log_fd_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "FD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_fd_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "FD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_fd_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "FD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_fd_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "FD", $($key = $value,)* $msg)
    };
}

// === QUEUE ===

#[macro_export]
macro_rules! log_queue_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "QUEUE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_queue_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "QUEUE", $($key = $value,)* $msg)
    };
}

// === DISPATCH ===

#[macro_export]
macro_rules! log_dispatch_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "DISPATCH", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_dispatch_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "DISPATCH", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_dispatch_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "DISPATCH", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_dispatch_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "DISPATCH", $($key = $value,)* $msg)
    };
}

// === REAPER ===

#[macro_export]
macro_rules! log_reaper_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "REAPER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_reaper_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "REAPER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_reaper_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "REAPER", $($key = $value,)* $msg)
    };
}

// === FIFO ===

#[macro_export]
macro_rules! log_fifo_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "FIFO", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_fifo_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "FIFO", $($key = $value,)* $msg)
    };
}

// === MAINT ===

#[macro_export]
macro_rules! log_maint_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "MAINT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_maint_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "MAINT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_maint_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "MAINT", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// `RUST_LOG` wins when set. Call once at startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    // A second init (tests) is not an error.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
