//! Transfer rate limits
//!
//! A host's `transfer_rate_limit` and the limits of the TRL groups it is a
//! member of are shared by its running transfers. Groups come from
//! `etc/trl.toml`:
//!
//! ```toml
//! [group.backbone]
//! limit = 10485760
//! members = ["alpha", "beta"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use afd_config::{log_maint_info, log_maint_warn};
use afd_ipc::HostRecord;
use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrlGroup {
    /// Bytes per second shared by all members.
    pub limit: i64,
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TrlFile {
    #[serde(default)]
    group: BTreeMap<String, TrlGroup>,
}

#[derive(Debug, Default)]
pub struct TrlConfig {
    path: PathBuf,
    mtime: Option<SystemTime>,
    groups: BTreeMap<String, TrlGroup>,
}

impl TrlConfig {
    /// Load groups from `path`; a missing file means no groups.
    pub fn load(path: &Path) -> Result<Self> {
        let mut trl = Self {
            path: path.to_path_buf(),
            ..Default::default()
        };
        trl.check_file()?;
        Ok(trl)
    }

    pub fn parse(text: &str) -> std::result::Result<BTreeMap<String, TrlGroup>, toml::de::Error> {
        Ok(toml::from_str::<TrlFile>(text)?.group)
    }

    pub fn groups(&self) -> &BTreeMap<String, TrlGroup> {
        &self.groups
    }

    /// Re-read the file when its mtime changed. Returns true on reload.
    pub fn check_file(&mut self) -> Result<bool> {
        let mtime = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        if mtime == self.mtime {
            return Ok(false);
        }
        self.mtime = mtime;
        self.groups = match mtime {
            None => BTreeMap::new(),
            Some(_) => {
                let text = std::fs::read_to_string(&self.path)?;
                match Self::parse(&text) {
                    Ok(groups) => groups,
                    Err(e) => {
                        log_maint_warn!(
                            "Ignoring invalid TRL file",
                            path = self.path.display().to_string(),
                            error = e.to_string()
                        );
                        BTreeMap::new()
                    }
                }
            }
        };
        log_maint_info!("TRL groups loaded", groups = self.groups.len());
        Ok(true)
    }

    fn groups_of<'a>(&'a self, alias: &'a str) -> impl Iterator<Item = &'a TrlGroup> + 'a {
        self.groups
            .values()
            .filter(move |g| g.limit > 0 && g.members.iter().any(|m| m == alias))
    }

    fn per_process(&self, hosts: &[HostRecord], pos: usize) -> i64 {
        let host = &hosts[pos];
        let mut limit: Option<i64> = None;
        if host.transfer_rate_limit > 0 {
            limit = Some(host.transfer_rate_limit / i64::from(host.active_transfers.max(1)));
        }
        for group in self.groups_of(host.alias()) {
            let active: i64 = hosts
                .iter()
                .filter(|h| group.members.iter().any(|m| m == h.alias()))
                .map(|h| i64::from(h.active_transfers.max(0)))
                .sum();
            let value = group.limit / active.max(1);
            limit = Some(limit.map_or(value, |l| l.min(value)));
        }
        limit.unwrap_or(0)
    }

    /// Recompute `trl_per_process` of host `pos` and of every host sharing
    /// a group with it.
    pub fn calc(&self, hosts: &mut [HostRecord], pos: usize) {
        if pos >= hosts.len() {
            return;
        }
        let alias = hosts[pos].alias().to_string();
        let mut affected = vec![pos];
        for group in self.groups_of(&alias) {
            for (i, h) in hosts.iter().enumerate() {
                if i != pos && group.members.iter().any(|m| m == h.alias()) {
                    affected.push(i);
                }
            }
        }
        for i in affected {
            hosts[i].trl_per_process = self.per_process(hosts, i);
        }
    }

    pub fn recalc_all(&self, hosts: &mut [HostRecord]) {
        for i in 0..hosts.len() {
            hosts[i].trl_per_process = self.per_process(hosts, i);
        }
    }
}
