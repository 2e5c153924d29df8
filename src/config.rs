// src/config.rs

//! Centralized path derivation and engine constants.
//!
//! The repository directory holds durable state (startup datastores, YANG
//! sources, replay logs, event pipes); volatile shared state lives under the
//! SHM directory, namespaced by a prefix taken from `YANGSTORE_SHM_PREFIX`.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Expected content version of the main and ext SHM segments. Bumped on any
/// layout change; a mismatch fails connection startup.
pub const SHM_VER: u32 = 5;

/// Alignment of every ext SHM allocation.
pub const SHM_ALIGN: usize = 8;

/// Ext SHM is defragmented on WRITE unlock once `wasted` exceeds this
/// fraction of the used size (1/N).
pub const SHM_WASTED_DIVISOR: u32 = 3;

/// Default timeout for module lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT_MS: u32 = 5_000;

/// Default timeout for provider callbacks.
pub const DEFAULT_OPER_TIMEOUT_MS: u32 = 3_000;

/// Name of the internal monitoring module whose state is generated from SHM.
pub const MONITORING_MODULE: &str = "yangstore-monitoring";

/// Name of the standard module listing installed modules.
pub const YANG_LIBRARY_MODULE: &str = "ietf-yang-library";

/// Module whose notification subscribers receive config-change notifications.
pub const NETCONF_NOTIF_MODULE: &str = "ietf-netconf-notifications";

fn shm_prefix() -> Result<String> {
    match env::var("YANGSTORE_SHM_PREFIX") {
        Ok(prefix) => {
            if prefix.contains('/') {
                return Err(Error::inval_arg("SHM prefix must not contain '/'"));
            }
            Ok(prefix)
        }
        Err(_) => Ok("ys".to_string()),
    }
}

/// Resolved filesystem layout for one repository.
#[derive(Debug, Clone)]
pub struct Layout {
    repo: PathBuf,
    shm_dir: PathBuf,
    prefix: String,
}

impl Layout {
    pub fn new(repo: impl Into<PathBuf>) -> Result<Self> {
        Self::with_shm_dir(repo, "/dev/shm")
    }

    /// Use a non-default SHM directory; tests point this at a TempDir.
    pub fn with_shm_dir(repo: impl Into<PathBuf>, shm_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            repo: repo.into(),
            shm_dir: shm_dir.into(),
            prefix: shm_prefix()?,
        })
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Durable datastore directory.
    pub fn data_dir(&self) -> PathBuf {
        self.repo.join("data")
    }

    /// Module YANG source directory.
    pub fn yang_dir(&self) -> PathBuf {
        self.repo.join("yang")
    }

    /// Notification replay log directory.
    pub fn notif_dir(&self) -> PathBuf {
        self.data_dir().join("notif")
    }

    /// Startup datastore file of a module.
    pub fn startup_file(&self, module: &str) -> PathBuf {
        self.data_dir().join(format!("{module}.startup"))
    }

    /// Volatile datastore file of a module (running/candidate/operational).
    pub fn volatile_file(&self, module: &str, suffix: &str) -> PathBuf {
        self.shm_dir.join(format!("{}_{module}.{suffix}", self.prefix))
    }

    /// YANG source file; `@<rev>` is appended when the revision is set.
    pub fn yang_file(&self, module: &str, revision: Option<&str>) -> PathBuf {
        match revision {
            Some(rev) => self.yang_dir().join(format!("{module}@{rev}.yang")),
            None => self.yang_dir().join(format!("{module}.yang")),
        }
    }

    /// Replay log of a module's notifications.
    pub fn notif_file(&self, module: &str) -> PathBuf {
        self.notif_dir().join(format!("{module}.notif"))
    }

    pub fn main_shm_file(&self) -> PathBuf {
        self.shm_dir.join(format!("{}_main", self.prefix))
    }

    pub fn ext_shm_file(&self) -> PathBuf {
        self.shm_dir.join(format!("{}_ext", self.prefix))
    }

    /// Advisory lock file serializing one-time SHM creation.
    pub fn create_lock_file(&self) -> PathBuf {
        self.shm_dir.join(format!("{}_create.lock", self.prefix))
    }

    /// Directory of per-connection liveness lock files.
    pub fn conn_lock_dir(&self) -> PathBuf {
        self.shm_dir.join(format!("{}sr_conn_locks", self.prefix))
    }

    pub fn conn_lock_file(&self, cid: u32) -> PathBuf {
        self.conn_lock_dir().join(format!("conn_{cid}.lock"))
    }

    /// Event pipe FIFO of a subscription.
    pub fn evpipe_file(&self, evpipe_num: u32) -> PathBuf {
        self.repo.join(format!("sr_evpipe{evpipe_num}"))
    }

    /// Rendezvous SHM file of a single subscription slot.
    pub fn sub_shm_file(&self, module: &str, suffix: &str, evpipe_num: u32) -> PathBuf {
        self.shm_dir
            .join(format!("{}_sub_{module}.{suffix}.{evpipe_num}", self.prefix))
    }

    /// Create every directory the engine expects to exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.data_dir(),
            self.yang_dir(),
            self.notif_dir(),
            self.conn_lock_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_file() {
        let layout = Layout::with_shm_dir("/var/lib/yangstore", "/dev/shm").unwrap();
        assert_eq!(
            layout.startup_file("iface"),
            PathBuf::from("/var/lib/yangstore/data/iface.startup")
        );
    }

    #[test]
    fn test_yang_file_revision() {
        let layout = Layout::with_shm_dir("/r", "/s").unwrap();
        assert_eq!(
            layout.yang_file("m1", Some("2020-01-01")),
            PathBuf::from("/r/yang/m1@2020-01-01.yang")
        );
        assert_eq!(layout.yang_file("m1", None), PathBuf::from("/r/yang/m1.yang"));
    }

    #[test]
    fn test_volatile_files_use_prefix() {
        let layout = Layout::with_shm_dir("/r", "/s").unwrap();
        let running = layout.volatile_file("m1", "running");
        assert!(running.to_string_lossy().contains("_m1.running"));
        assert!(running.starts_with("/s"));
    }

    #[test]
    fn test_evpipe_under_repo() {
        let layout = Layout::with_shm_dir("/r", "/s").unwrap();
        assert_eq!(layout.evpipe_file(7), PathBuf::from("/r/sr_evpipe7"));
    }
}
