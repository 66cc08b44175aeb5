//! Isolated work directories for tests.
//!
//! ```ignore
//! use afd_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new().unwrap();
//! env.write_config("MAX_CONNECTIONS 4\n").unwrap();
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::path::{self, WorkPaths};
use crate::FdConfig;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A throw-away work directory with the standard layout created.
pub struct TestEnvironment {
    _temp_dir: TempDir,
    pub paths: WorkPaths,
    pub test_id: u32,
}

impl TestEnvironment {
    pub fn new() -> std::io::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let paths = WorkPaths::new(temp_dir.path());
        paths.create_dirs()?;
        Ok(Self {
            _temp_dir: temp_dir,
            paths,
            test_id,
        })
    }

    pub fn root(&self) -> PathBuf {
        self.paths.root().to_path_buf()
    }

    /// Write `etc/AFD_CONFIG`.
    pub fn write_config(&self, contents: &str) -> std::io::Result<()> {
        std::fs::write(self.paths.afd_config(), contents)
    }

    /// Write `etc/trl.toml`.
    pub fn write_trl(&self, contents: &str) -> std::io::Result<()> {
        std::fs::write(self.paths.etc(path::TRL_FILE), contents)
    }

    /// Create a spool directory with `files` one-byte files in it.
    pub fn create_job_dir(&self, msg_name: &str, files: usize) -> std::io::Result<PathBuf> {
        let dir = self.paths.job_dir(msg_name);
        std::fs::create_dir_all(&dir)?;
        for i in 0..files {
            std::fs::write(dir.join(format!("file_{i}")), b"x")?;
        }
        Ok(dir)
    }

    /// Write a message file for `job_id` with the given option lines.
    pub fn write_message(&self, job_id: u32, url: &str, options: &[&str]) -> std::io::Result<PathBuf> {
        let path = self.paths.message_file(job_id);
        let mut body = format!("[destination]\n{url}\n\n[options]\n");
        for opt in options {
            body.push_str(opt);
            body.push('\n');
        }
        std::fs::write(&path, body)?;
        Ok(path)
    }

    pub fn config(&self) -> FdConfig {
        FdConfig::load(&self.paths.afd_config()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_layout() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.paths.fifo_dir().is_dir());
        assert!(env.paths.outgoing_dir().is_dir());
    }

    #[test]
    fn test_environments_are_isolated() {
        let a = TestEnvironment::new().unwrap();
        let b = TestEnvironment::new().unwrap();
        assert_ne!(a.root(), b.root());
        assert_ne!(a.test_id, b.test_id);
    }

    #[test]
    fn test_config_roundtrip() {
        let env = TestEnvironment::new().unwrap();
        env.write_config("MAX_CONNECTIONS 4\n").unwrap();
        assert_eq!(env.config().max_connections, 4);
    }

    #[test]
    fn test_create_job_dir() {
        let env = TestEnvironment::new().unwrap();
        let dir = env.create_job_dir("1/0/a_1_0", 3).unwrap();
        assert_eq!(std::fs::read_dir(dir).unwrap().count(), 3);
    }
}
