// src/datastore.rs

//! Per-module datastore files.
//!
//! Startup is the durable file under the repository; running, candidate and
//! operational live under the SHM directory and are recreated as needed.
//! The operational file stores a diff overlay, not data. Every write goes
//! through a temp file and rename so readers only ever open committed
//! images.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::Layout;
use crate::error::{Error, ErrorCode, Result};
use crate::shm::layout::Datastore;
use crate::tree::Forest;

/// File backing a module's datastore.
pub fn file_path(layout: &Layout, module: &str, ds: Datastore) -> PathBuf {
    match ds {
        Datastore::Startup => layout.startup_file(module),
        Datastore::Running => layout.volatile_file(module, "running"),
        Datastore::Candidate => layout.volatile_file(module, "candidate"),
        Datastore::Operational => layout.volatile_file(module, "operational"),
    }
}

fn read_forest(path: &Path) -> Result<Forest> {
    let bytes = fs::read(path).map_err(|e| {
        Error::from(e).wrap(ErrorCode::Sys, format!("cannot read datastore file {}", path.display()))
    })?;
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(&bytes)?)
}

/// Atomically replace `path` with the serialized forest.
fn write_forest(path: &Path, forest: &[crate::tree::DataNode]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::internal(format!("datastore path {} has no parent", path.display())))?;
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(&serde_json::to_vec(forest)?)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| Error::sys(format!("cannot replace {}: {}", path.display(), e.error)))?;
    Ok(())
}

/// Load a module's data from a conventional datastore.
///
/// Running falls back to startup content when its file does not exist yet
/// (recreated on first access); candidate mirrors running until first
/// modified.
pub fn load(layout: &Layout, module: &str, ds: Datastore) -> Result<Forest> {
    let path = file_path(layout, module, ds);
    if path.exists() {
        return read_forest(&path);
    }
    match ds {
        Datastore::Startup => Err(Error::not_found(format!(
            "startup datastore of module '{module}' does not exist"
        ))),
        Datastore::Running => {
            let data = load(layout, module, Datastore::Startup)?;
            write_forest(&path, &data)?;
            Ok(data)
        }
        Datastore::Candidate => load(layout, module, Datastore::Running),
        Datastore::Operational => Ok(Vec::new()),
    }
}

/// Store a module's data into a conventional datastore.
pub fn store(layout: &Layout, module: &str, ds: Datastore, forest: &[crate::tree::DataNode]) -> Result<()> {
    debug_assert!(ds.is_conventional());
    write_forest(&file_path(layout, module, ds), forest)
}

/// Load the stored operational diff overlay; empty when none was stored.
pub fn load_oper_diff(layout: &Layout, module: &str) -> Result<Forest> {
    let path = file_path(layout, module, Datastore::Operational);
    if !path.exists() {
        return Ok(Vec::new());
    }
    read_forest(&path)
}

/// Store the operational diff overlay.
pub fn store_oper_diff(layout: &Layout, module: &str, diff: &[crate::tree::DataNode]) -> Result<()> {
    write_forest(&file_path(layout, module, Datastore::Operational), diff)
}

/// Discard the candidate datastore; it mirrors running again afterwards.
/// Only files under the current prefix are touched; a stale file of a
/// foreign prefix is left alone.
pub fn candidate_reset(layout: &Layout, module: &str) -> Result<()> {
    let path = file_path(layout, module, Datastore::Candidate);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(module, "candidate reset with no candidate file");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Apply owner/group/permissions to a datastore file. Both `EACCES` and
/// `EPERM` classify as `Unauthorized`.
pub fn apply_owner(
    path: &Path,
    owner: Option<&str>,
    group: Option<&str>,
    perm: Option<u32>,
) -> Result<()> {
    use nix::unistd::{chown, Group, User};

    let uid = match owner {
        Some(name) => Some(
            User::from_name(name)
                .map_err(Error::from)?
                .ok_or_else(|| Error::not_found(format!("user '{name}' does not exist")))?
                .uid,
        ),
        None => None,
    };
    let gid = match group {
        Some(name) => Some(
            Group::from_name(name)
                .map_err(Error::from)?
                .ok_or_else(|| Error::not_found(format!("group '{name}' does not exist")))?
                .gid,
        ),
        None => None,
    };

    if uid.is_some() || gid.is_some() {
        chown(path, uid, gid).map_err(Error::from)?;
    }
    if let Some(mode) = perm {
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                Error::unauthorized(format!("cannot change mode of {}", path.display()))
            } else {
                e.into()
            }
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::DataNode;
    use tempfile::TempDir;

    fn layout(dir: &TempDir) -> Layout {
        Layout::with_shm_dir(dir.path().join("repo"), dir.path().join("shm")).unwrap()
    }

    fn sample() -> Forest {
        vec![DataNode::container("m1", "root").with_child(DataNode::leaf("m1", "a", "1"))]
    }

    #[test]
    fn test_store_and_load_running() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        store(&layout, "m1", Datastore::Running, &sample()).unwrap();
        let loaded = load(&layout, "m1", Datastore::Running).unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn test_running_recreated_from_startup() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        store(&layout, "m1", Datastore::Startup, &sample()).unwrap();
        let loaded = load(&layout, "m1", Datastore::Running).unwrap();
        assert_eq!(loaded, sample());
        assert!(file_path(&layout, "m1", Datastore::Running).exists());
    }

    #[test]
    fn test_missing_startup_fails() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        let err = load(&layout, "m1", Datastore::Startup).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[test]
    fn test_candidate_falls_back_and_resets() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        store(&layout, "m1", Datastore::Startup, &sample()).unwrap();
        store(&layout, "m1", Datastore::Running, &sample()).unwrap();

        // Mirrors running while absent.
        assert_eq!(load(&layout, "m1", Datastore::Candidate).unwrap(), sample());

        let mut changed = sample();
        changed[0].children[0].value = Some("9".into());
        store(&layout, "m1", Datastore::Candidate, &changed).unwrap();
        assert_eq!(load(&layout, "m1", Datastore::Candidate).unwrap(), changed);

        candidate_reset(&layout, "m1").unwrap();
        assert_eq!(load(&layout, "m1", Datastore::Candidate).unwrap(), sample());
        // Resetting twice is fine.
        candidate_reset(&layout, "m1").unwrap();
    }

    #[test]
    fn test_oper_diff_empty_when_missing() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        assert!(load_oper_diff(&layout, "m1").unwrap().is_empty());
    }

    #[test]
    fn test_apply_owner_sets_mode() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        store(&layout, "m1", Datastore::Startup, &sample()).unwrap();
        let path = file_path(&layout, "m1", Datastore::Startup);

        apply_owner(&path, None, None, Some(0o600)).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
