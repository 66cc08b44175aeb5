//! fdd - AFD file distributor
//!
//! Usage:
//!   fdd [-w <work dir>] [--log-level debug]

use std::path::PathBuf;
use std::process::ExitCode;

use afd_config::logging::{init_logging, LogLevel};
use afd_config::{log_fd_error, FdConfig, WorkPaths};
use afd_fd::{run_daemon, FdError};
use anyhow::Context;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "fdd", version, about = "AFD file distributor")]
struct Args {
    /// AFD work directory
    #[arg(short = 'w', long, env = "AFD_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// error, warn, info, debug or trace; RUST_LOG overrides it
    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    /// Print the effective configuration and exit
    #[arg(long)]
    dump_config: bool,
}

fn load(args: &Args) -> anyhow::Result<(WorkPaths, FdConfig)> {
    let root = args.work_dir.clone().unwrap_or_else(WorkPaths::default_root);
    let paths = WorkPaths::new(root);
    let config = FdConfig::load(&paths.afd_config())
        .with_context(|| format!("Failed to read {}", paths.afd_config().display()))?;
    Ok((paths, config))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_level);

    let (paths, config) = match load(&args) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("fdd: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    if args.dump_config {
        return match config.to_toml() {
            Ok(text) => {
                print!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("fdd: {e}");
                ExitCode::FAILURE
            }
        };
    }

    match run_daemon(paths, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log_fd_error!("File distributor failed", error = e.to_string());
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(e: &FdError) -> u8 {
    u8::try_from(e.exit_code()).unwrap_or(1)
}
