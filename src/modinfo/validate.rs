// src/modinfo/validate.rs

//! Validation, implicit defaults, and operation validation of the working
//! set.

use crate::error::{Error, Result};
use crate::shm::layout::Datastore;
use crate::tree::{self, Forest};

use super::{state, ModInfo};

impl ModInfo<'_> {
    /// Validate every module whose state matches `mask`. With `finish_diff`,
    /// changes induced by validation (recreated non-presence containers,
    /// materialized defaults) are merged into the accumulated diff and the
    /// module is marked changed.
    pub fn validate(&mut self, mask: u8, finish_diff: bool) -> Result<()> {
        self.materialize_owned();
        let schema = self.conn.schema().clone();

        for pos in 0..self.entries.len() {
            if self.entries[pos].state & mask == 0 {
                continue;
            }
            let module = self.entries[pos].info.name.clone();
            if schema.module(&module).is_none() {
                // Generated internal modules have no registered schema.
                continue;
            }

            if finish_diff {
                let before: Forest = tree::module_roots(&self.data, &module)
                    .into_iter()
                    .cloned()
                    .collect();
                schema.add_np_containers(&module, &mut self.data)?;
                schema.add_defaults(&module, &mut self.data)?;
                let after: Forest = tree::module_roots(&self.data, &module)
                    .into_iter()
                    .cloned()
                    .collect();
                let diff = tree::diff::diff_compute(&before, &after);
                if tree::diff::diff_has_changes(&diff) {
                    tree::diff::diff_merge(
                        &mut self.diff,
                        diff,
                        &tree::diff::MergePolicy::Plain,
                    );
                    self.entries[pos].state |= state::CHANGED;
                }
            }

            schema.validate_module(&module, &self.data)?;
        }
        Ok(())
    }

    /// Materialize implicit defaults of every requested module (conventional
    /// datastores only).
    pub fn add_defaults(&mut self, finish_diff: bool) -> Result<()> {
        debug_assert!(self.ds.is_conventional());
        self.materialize_owned();
        let schema = self.conn.schema().clone();

        for pos in 0..self.entries.len() {
            if !self.entries[pos].has(state::REQ) {
                continue;
            }
            let module = self.entries[pos].info.name.clone();
            if schema.module(&module).is_none() {
                continue;
            }
            let before: Forest = tree::module_roots(&self.data, &module)
                .into_iter()
                .cloned()
                .collect();
            schema.add_defaults(&module, &mut self.data)?;
            if finish_diff {
                let after: Forest = tree::module_roots(&self.data, &module)
                    .into_iter()
                    .cloned()
                    .collect();
                let diff = tree::diff::diff_compute(&before, &after);
                if tree::diff::diff_has_changes(&diff) {
                    tree::diff::diff_merge(
                        &mut self.diff,
                        diff,
                        &tree::diff::MergePolicy::Plain,
                    );
                    self.entries[pos].state |= state::CHANGED;
                }
            }
        }
        Ok(())
    }

    /// Validate an RPC/action/notification tree against operational data:
    /// the data parent of a nested operation must exist.
    pub fn op_validate(&self, op_path: &str, op: &[tree::DataNode], is_output: bool) -> Result<()> {
        debug_assert_eq!(self.ds, Datastore::Operational);
        let (parent_path, _kind) = self.conn.schema().op_schema(op_path)?;

        if !parent_path.is_empty() {
            let roots = self.data_roots();
            let parents = tree::xpath::eval_roots(roots.into_iter(), &parent_path)?;
            if parents.is_empty() {
                return Err(Error::validation(
                    "data parent of the nested operation does not exist",
                    parent_path,
                ));
            }
        }

        if op.is_empty() {
            return Err(Error::inval_arg(format!(
                "empty {} tree for '{op_path}'",
                if is_output { "output" } else { "input" }
            )));
        }
        Ok(())
    }
}
