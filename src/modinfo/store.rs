// src/modinfo/store.rs

//! Persisting the working set.
//!
//! Conventional modules write their file atomically, bump the descriptor
//! version (write first, then bump), refresh the running cache, and repair
//! the stored operational overlay that may have become partly unapplicable.
//! Operational modules merge the in-memory diff into the persisted overlay
//! with the origin-aware policy.

use tracing::{error, info};

use crate::error::{ErrorCode, Result};
use crate::registry;
use crate::shm::layout::Datastore;
use crate::tree::{self, diff::MergeCtx, diff::MergePolicy};

use super::{state, ModInfo};

impl ModInfo<'_> {
    /// Write every changed module back to its datastore. Failures are
    /// per-module best-effort: the first failure aborts the loop and the
    /// remaining diff stays attached to the surfaced error.
    pub fn data_store(&mut self) -> Result<()> {
        self.materialize_owned();

        for pos in 0..self.entries.len() {
            if !self.entries[pos].has(state::CHANGED) {
                continue;
            }
            let info = self.entries[pos].info.clone();

            let result = if self.ds == Datastore::Operational {
                self.store_operational(&info.name)
            } else {
                self.store_conventional(pos)
            };

            if let Err(err) = result {
                error!(module = %info.name, error = %err, "datastore write failed");
                let diff_dump = serde_json::to_string(&self.diff).unwrap_or_default();
                return Err(err.wrap(
                    ErrorCode::Sys,
                    format!("commit of module '{}' failed; unapplied diff: {diff_dump}", info.name),
                ));
            }
            self.entries[pos].state &= !state::CHANGED;
            self.entries[pos].state |= state::CHANGED_STORED;
        }
        Ok(())
    }

    fn store_operational(&mut self, module: &str) -> Result<()> {
        let layout = self.conn.layout();
        let mut stored = crate::datastore::load_oper_diff(layout, module)?;
        let module_diff: Vec<_> = self
            .diff
            .iter()
            .filter(|n| n.module == module)
            .cloned()
            .collect();
        tree::diff::diff_merge(
            &mut stored,
            module_diff,
            &MergePolicy::OriginAware(MergeCtx {
                cid: Some(self.conn.cid()),
            }),
        );
        crate::datastore::store_oper_diff(layout, module, &stored)
    }

    fn store_conventional(&mut self, pos: usize) -> Result<()> {
        let layout = self.conn.layout().clone();
        let info = self.entries[pos].info.clone();

        // Detach, persist, reattach: the net data still holds the module.
        let module_data = tree::take_module(&mut self.data, &info.name);
        let result = crate::datastore::store(&layout, &info.name, self.ds, &module_data);
        if let Err(err) = result {
            self.data.extend(module_data);
            return Err(err);
        }

        if self.ds == Datastore::Running {
            // Write first, then move the version: a reader observing the new
            // version always finds the new file.
            let new_ver = self
                .conn
                .with_shm(|shm| registry::bump_ver(&shm.main, info.idx));
            self.entries[pos].info.ver = new_ver;

            if let Some(cache) = self.conn.cache() {
                cache.ensure(&info.name, new_ver, Some(module_data.clone()), || {
                    unreachable!("update data provided")
                })?;
            }

            // Parts of the stored operational overlay may no longer apply.
            let mut oper_diff = crate::datastore::load_oper_diff(&layout, &info.name)?;
            if !oper_diff.is_empty() {
                tree::diff::diff_mod_update(&mut oper_diff, &module_data);
                crate::datastore::store_oper_diff(&layout, &info.name, &oper_diff)?;
            }
        }

        self.data.extend(module_data);
        info!(module = %info.name, datastore = self.ds.name(), "datastore written");
        Ok(())
    }

    /// Deliver the per-module diff to the change subscribers of the written
    /// datastore (post-commit, fire-and-forget).
    pub fn change_notify(&self, sid: u32) -> Result<()> {
        debug_assert!(self.ds.is_conventional());
        let layout = self.conn.layout().clone();

        for entry in &self.entries {
            if !entry.has(state::CHANGED_STORED) {
                continue;
            }
            let module_diff: Vec<_> = self
                .diff
                .iter()
                .filter(|n| n.module == entry.info.name)
                .cloned()
                .collect();
            if module_diff.is_empty() {
                continue;
            }
            let subs = self.conn.with_shm(|shm| {
                registry::subs::change_subs(&shm.main, &shm.ext, entry.info.idx, self.ds)
            });
            for sub in subs {
                if let Err(err) = crate::oper::rendezvous::change_notify(
                    &layout,
                    &entry.info.name,
                    self.ds,
                    &module_diff,
                    sid,
                    sub.evpipe_num,
                ) {
                    // Subscribers may be gone; the commit already persisted.
                    tracing::debug!(module = %entry.info.name, error = %err, "change delivery skipped");
                }
            }
        }
        Ok(())
    }
}
