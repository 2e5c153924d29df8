// src/modinfo/mod.rs

//! The module-info set: the per-operation working set of modules.
//!
//! Assembled by closing a seed set under data dependencies and/or inverse
//! dependencies, annotated with the strongest state each module earned, and
//! stable-sorted by descriptor SHM offset. That order is the canonical lock
//! order: two concurrent operations always acquire overlapping module locks
//! in the same sequence, so they cannot deadlock each other.

pub mod load;
pub mod lock;
pub mod notif;
pub mod store;
pub mod validate;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use crate::config::{MONITORING_MODULE, YANG_LIBRARY_MODULE};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::lock::LockMode;
use crate::registry::{self, ModuleInfo};
use crate::schema::DepKind;
use crate::shm::layout::Datastore;
use crate::tree::{DataNode, Forest};

/// Module state bits within a modinfo set.
pub mod state {
    /// Directly requested.
    pub const REQ: u8 = 0x01;
    /// Pulled in as a data dependency.
    pub const DEP: u8 = 0x02;
    /// Must be revalidated because it references a changed module.
    pub const INV_DEP: u8 = 0x04;
    /// Data loaded.
    pub const DATA: u8 = 0x08;
    /// Per-module diff is non-empty.
    pub const CHANGED: u8 = 0x10;
    /// Changes were persisted; subscribers still need notifying.
    pub const CHANGED_STORED: u8 = 0x20;
}

/// Which dependency closures to follow while adding modules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepMode {
    pub deps: bool,
    pub inv_deps: bool,
}

impl DepMode {
    pub const NONE: DepMode = DepMode { deps: false, inv_deps: false };
    pub const DEPS: DepMode = DepMode { deps: true, inv_deps: false };
    pub const ALL: DepMode = DepMode { deps: true, inv_deps: true };
}

fn kind_strength(kind: u8) -> u8 {
    if kind & state::REQ != 0 {
        3
    } else if kind & state::INV_DEP != 0 {
        2
    } else if kind & state::DEP != 0 {
        1
    } else {
        0
    }
}

/// One module of the working set.
#[derive(Debug)]
pub struct ModEntry {
    pub info: ModuleInfo,
    pub state: u8,
    /// Lock currently held on the primary datastore.
    pub(crate) lock_held: Option<LockMode>,
    /// READ lock held on the secondary datastore.
    pub(crate) secondary_locked: bool,
}

impl ModEntry {
    pub fn has(&self, bit: u8) -> bool {
        self.state & bit != 0
    }
}

/// The per-operation working set.
pub struct ModInfo<'c> {
    pub(crate) conn: &'c Connection,
    pub ds: Datastore,
    /// Secondary datastore; operational composes on top of running.
    pub ds2: Option<Datastore>,
    pub entries: Vec<ModEntry>,
    /// Owned working data, one subtree per module.
    pub data: Forest,
    /// Cache aliases backing the pure-read fast path.
    pub(crate) shared: Vec<Arc<Forest>>,
    pub diff: Forest,
    /// True only when the primary datastore is running, the cache covered
    /// every requested module, and no edit has been applied.
    pub data_cached: bool,
}

impl<'c> ModInfo<'c> {
    pub fn new(conn: &'c Connection, ds: Datastore) -> Self {
        Self {
            conn,
            ds,
            ds2: (ds == Datastore::Operational).then_some(Datastore::Running),
            entries: Vec::new(),
            data: Vec::new(),
            shared: Vec::new(),
            diff: Vec::new(),
            data_cached: false,
        }
    }

    pub fn find(&self, module: &str) -> Option<&ModEntry> {
        self.entries.iter().find(|e| e.info.name == module)
    }

    fn find_pos(&self, module: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.info.name == module)
    }

    /// Add `module` with `kind`, following dependency closures per `want`.
    ///
    /// A module already present with an equal or stronger kind is left alone;
    /// a weaker one is upgraded and its dependencies re-followed at the new
    /// strength. Dependencies of the operational datastore are not followed:
    /// its data is composed, not validated across modules.
    pub fn add_module(&mut self, module: &str, kind: u8, want: DepMode) -> Result<()> {
        let mut worklist: Vec<(String, u8)> = vec![(module.to_string(), kind)];

        while let Some((name, kind)) = worklist.pop() {
            let effective = match self.find_pos(&name) {
                Some(pos) => {
                    let entry = &mut self.entries[pos];
                    if kind_strength(entry.state) >= kind_strength(kind) {
                        continue;
                    }
                    // Upgrade: REQ replaces the weaker classification.
                    entry.state = (entry.state & !(state::REQ | state::DEP | state::INV_DEP)) | kind;
                    kind
                }
                None => {
                    let info = self.conn.with_shm(|shm| {
                        registry::find_module(&shm.main, &shm.ext, &name)
                            .map(|idx| registry::module_info(&shm.main, &shm.ext, idx))
                    });
                    let info = info
                        .ok_or_else(|| Error::not_found(format!("module '{name}' is not installed")))?;
                    self.entries.push(ModEntry {
                        info,
                        state: kind,
                        lock_held: None,
                        secondary_locked: false,
                    });
                    kind
                }
            };

            // Follow data deps for REQ and INV_DEP modules.
            if want.deps && kind_strength(effective) >= 2 {
                let idx = self.find(&name).map(|e| e.info.idx).expect("entry just added");
                let deps = self
                    .conn
                    .with_shm(|shm| registry::data_deps(&shm.main, &shm.ext, idx));
                for dep in deps {
                    // INSTID targets resolve only against loaded data.
                    if dep.kind == DepKind::InstId {
                        continue;
                    }
                    if let Some(target) = dep.module {
                        worklist.push((target, state::DEP));
                    }
                }
            }

            // Follow inverse deps for REQ modules.
            if want.inv_deps && effective & state::REQ != 0 {
                let idx = self.find(&name).map(|e| e.info.idx).expect("entry just added");
                let invs = self
                    .conn
                    .with_shm(|shm| registry::inv_data_deps(&shm.main, &shm.ext, idx));
                for target in invs {
                    worklist.push((target, state::INV_DEP));
                }
            }
        }
        Ok(())
    }

    /// Stable-sort by descriptor SHM offset: the canonical lock order.
    pub fn sort(&mut self) {
        self.entries.sort_by_key(|e| e.info.off);
    }

    /// Seed from the distinct modules owning top-level nodes of an edit.
    pub fn add_edit_modules(&mut self, edit: &[DataNode], want: DepMode) -> Result<()> {
        for (module, _first) in EditModuleIter::new(edit) {
            self.add_module(module, state::REQ, want)?;
        }
        self.sort();
        Ok(())
    }

    /// Seed from an XPath: its first-step module, or every installed module
    /// for a wildcard/module-less path.
    pub fn add_xpath_modules(&mut self, xpath: &str, want: DepMode) -> Result<()> {
        let steps = crate::tree::xpath::steps(xpath)?;
        match steps[0].module {
            Some(module) => {
                let module = module.to_string();
                self.add_module(&module, state::REQ, want)?;
            }
            None => {
                let names: Vec<String> =
                    self.conn.modules().into_iter().map(|m| m.name).collect();
                for name in names {
                    self.add_module(&name, state::REQ, want)?;
                }
            }
        }
        self.sort();
        Ok(())
    }

    /// Permission gate: `eaccess` on each requested module's startup file.
    /// Strict mode fails the whole operation; non-strict drops unreadable
    /// modules, which is only valid before any data is loaded.
    pub fn perm_check(&mut self, write: bool, strict: bool) -> Result<()> {
        use nix::unistd::AccessFlags;

        debug_assert!(strict || self.data.is_empty());
        let layout = self.conn.layout().clone();
        let mut dropped: Vec<usize> = Vec::new();

        for (pos, entry) in self.entries.iter().enumerate() {
            if !entry.has(state::REQ) && !entry.has(state::CHANGED) {
                continue;
            }
            // Internal modules have generated data, not startup-file ACLs.
            if entry.info.name == MONITORING_MODULE || entry.info.name == YANG_LIBRARY_MODULE {
                continue;
            }
            let path = layout.startup_file(&entry.info.name);
            let flags = if write { AccessFlags::W_OK } else { AccessFlags::R_OK };
            match nix::unistd::eaccess(&path, flags) {
                Ok(()) => {}
                Err(_) if strict => {
                    return Err(Error::unauthorized(format!(
                        "{} access to module '{}' denied",
                        if write { "write" } else { "read" },
                        entry.info.name
                    )));
                }
                Err(_) => {
                    info!(module = %entry.info.name, "dropping module without read access");
                    dropped.push(pos);
                }
            }
        }
        for pos in dropped.into_iter().rev() {
            self.entries.remove(pos);
        }
        Ok(())
    }

    /// Apply a caller edit to the owned data, accumulating per-module diffs.
    /// The internal modules' trees are generated from SHM state; an edit
    /// touching them is rejected before anything is applied.
    pub fn edit_apply(&mut self, edit: &[DataNode], make_diff: bool) -> Result<()> {
        if let Some(node) = edit
            .iter()
            .find(|n| n.module == MONITORING_MODULE || n.module == YANG_LIBRARY_MODULE)
        {
            return Err(Error::unauthorized(format!(
                "data of internal module '{}' cannot be modified",
                node.module
            )));
        }
        self.materialize_owned();

        let mut iter = EditModuleIter::new(edit);
        let mut changed: Vec<String> = Vec::new();
        for (module, _first) in &mut iter {
            let Some(pos) = self.find_pos(module) else {
                continue;
            };
            if let Some(diff) =
                crate::tree::edit::apply_edit(&mut self.data, edit, module, make_diff)?
            {
                crate::tree::diff::diff_merge(
                    &mut self.diff,
                    diff,
                    &crate::tree::diff::MergePolicy::Plain,
                );
                changed.push(self.entries[pos].info.name.clone());
            }
        }
        for module in changed {
            if let Some(pos) = self.find_pos(&module) {
                self.entries[pos].state |= state::CHANGED;
            }
        }
        Ok(())
    }

    /// Merge an externally produced diff (e.g. an operational overlay edit)
    /// into the accumulated one, marking affected REQ modules changed.
    pub fn diff_merge(&mut self, new_diff: Forest) -> Result<()> {
        let policy = if self.ds == Datastore::Operational {
            crate::tree::diff::MergePolicy::OriginAware(crate::tree::diff::MergeCtx {
                cid: Some(self.conn.cid()),
            })
        } else {
            crate::tree::diff::MergePolicy::Plain
        };
        let touched: HashSet<String> = new_diff.iter().map(|n| n.module.clone()).collect();
        crate::tree::diff::diff_merge(&mut self.diff, new_diff, &policy);
        for entry in &mut self.entries {
            if entry.has(state::REQ) && touched.contains(&entry.info.name) {
                entry.state |= state::CHANGED;
            }
        }
        Ok(())
    }

    /// Replace each requested module's subtree with the one in `src_data`,
    /// keeping whichever side is needed so the net data holds each module
    /// exactly once.
    pub fn replace(&mut self, src_data: Forest) -> Result<()> {
        self.materialize_owned();
        let mut src = src_data;

        for pos in 0..self.entries.len() {
            if !self.entries[pos].has(state::REQ) {
                continue;
            }
            let module = self.entries[pos].info.name.clone();
            let old = crate::tree::take_module(&mut self.data, &module);
            let new = crate::tree::take_module(&mut src, &module);

            let diff = crate::tree::diff::diff_compute(&old, &new);
            if crate::tree::diff::diff_has_changes(&diff) {
                self.data.extend(new);
                crate::tree::diff::diff_merge(
                    &mut self.diff,
                    diff,
                    &crate::tree::diff::MergePolicy::Plain,
                );
                self.entries[pos].state |= state::CHANGED;
            } else {
                self.data.extend(old);
            }
        }
        Ok(())
    }

    /// Turn cache aliases into owned data (clone on first mutation).
    pub(crate) fn materialize_owned(&mut self) {
        if !self.data_cached {
            return;
        }
        for shared in self.shared.drain(..) {
            self.data.extend(shared.iter().cloned());
        }
        self.data_cached = false;
    }

    /// All root nodes, shared or owned.
    pub(crate) fn data_roots(&self) -> Vec<&DataNode> {
        if self.data_cached {
            self.shared
                .iter()
                .flat_map(|f| f.iter())
                .chain(self.data.iter())
                .collect()
        } else {
            self.data.iter().collect()
        }
    }

    /// Evaluate a request XPath over the loaded data, duplicating matches
    /// together with their parent chains.
    pub fn get_filter(&self, xpath: &str) -> Result<Forest> {
        crate::tree::xpath::filter_roots(self.data_roots().into_iter(), xpath)
    }

    /// Reset the candidate datastore of every requested module.
    pub fn candidate_reset(&self) -> Result<()> {
        for entry in self.entries.iter().filter(|e| e.has(state::REQ)) {
            crate::datastore::candidate_reset(self.conn.layout(), &entry.info.name)?;
        }
        Ok(())
    }
}

/// Iterator over the distinct modules owning top-level nodes of an edit,
/// yielding each module with the index of its first node. The visited set
/// keeps the walk linear in the edit size.
pub struct EditModuleIter<'a> {
    edit: &'a [DataNode],
    pos: usize,
    visited: HashSet<&'a str>,
}

impl<'a> EditModuleIter<'a> {
    pub fn new(edit: &'a [DataNode]) -> Self {
        Self {
            edit,
            pos: 0,
            visited: HashSet::new(),
        }
    }
}

impl<'a> Iterator for EditModuleIter<'a> {
    /// (module name, index of its first top-level node)
    type Item = (&'a str, usize);

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.edit.len() {
            let idx = self.pos;
            self.pos += 1;
            let module = self.edit[idx].module.as_str();
            if self.visited.insert(module) {
                return Some((module, idx));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_module_iter_dedups() {
        let edit = vec![
            DataNode::container("a", "one"),
            DataNode::container("b", "two"),
            DataNode::container("a", "three"),
        ];
        let pairs: Vec<_> = EditModuleIter::new(&edit).collect();
        assert_eq!(pairs, vec![("a", 0), ("b", 1)]);
    }

    #[test]
    fn test_kind_strength_order() {
        assert!(kind_strength(state::REQ) > kind_strength(state::INV_DEP));
        assert!(kind_strength(state::INV_DEP) > kind_strength(state::DEP));
        assert!(kind_strength(state::DEP) > kind_strength(0));
    }
}
