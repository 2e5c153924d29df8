// src/modinfo/load.rs

//! Materializing module data into the working set.
//!
//! Conventional data comes from the running cache when enabled and fresh,
//! otherwise from the persisted datastore file. Operational data is composed:
//! enabled running subtrees, the stored diff overlay, generated state of the
//! internal modules, and provider callouts, trimmed per the request options.

use std::sync::Arc;

use tracing::trace;

use crate::config::{MONITORING_MODULE, YANG_LIBRARY_MODULE};
use crate::error::Result;
use crate::oper::{self, OperOptions};
use crate::registry;
use crate::shm::layout::Datastore;
use crate::tree;

use super::{state, ModInfo};

impl ModInfo<'_> {
    /// Load the data of every module in the set.
    ///
    /// `allow_cache_alias` is passed by pure-read flows: when the primary
    /// datastore is running and the cache covers every requested module, the
    /// cached trees are shared instead of copied and `data_cached` is set.
    pub fn data_load(
        &mut self,
        allow_cache_alias: bool,
        request_xpath: Option<&str>,
        timeout_ms: u32,
        opts: OperOptions,
    ) -> Result<()> {
        let layout = self.conn.layout().clone();
        let cache_enabled =
            self.conn.cache().is_some() && (self.ds == Datastore::Running || self.ds2 == Some(Datastore::Running));

        // Freshen the cache for every module first; the version check is
        // against the descriptor the lock protocol already pinned.
        if cache_enabled {
            let cache = self.conn.cache().expect("cache checked enabled");
            for entry in &self.entries {
                if entry.info.name == MONITORING_MODULE || entry.info.name == YANG_LIBRARY_MODULE {
                    continue;
                }
                let module = entry.info.name.clone();
                let loader_layout = layout.clone();
                let loader_module = module.clone();
                cache.ensure(&module, entry.info.ver, None, move || {
                    crate::datastore::load(&loader_layout, &loader_module, Datastore::Running)
                })?;
            }
        }

        match self.ds {
            ds if ds.is_conventional() => self.load_conventional(allow_cache_alias, cache_enabled)?,
            _ => self.load_operational(request_xpath, timeout_ms, opts)?,
        }

        for entry in &mut self.entries {
            entry.state |= state::DATA;
        }
        Ok(())
    }

    fn load_conventional(&mut self, allow_cache_alias: bool, cache_enabled: bool) -> Result<()> {
        let layout = self.conn.layout().clone();

        // The aliasing fast path requires a cache hit for every module.
        if allow_cache_alias && cache_enabled && self.ds == Datastore::Running {
            let cache = self.conn.cache().expect("cache checked enabled");
            let mut aliases: Vec<Arc<tree::Forest>> = Vec::new();
            let all_hit = self.entries.iter().all(|e| {
                if e.has(state::DATA) {
                    return true;
                }
                match cache.read(&e.info.name) {
                    Some((data, ver)) if ver >= e.info.ver => {
                        aliases.push(data);
                        true
                    }
                    _ => false,
                }
            });
            if all_hit {
                trace!("running data served from cache aliases");
                self.shared = aliases;
                self.data_cached = true;
                return Ok(());
            }
        }

        for i in 0..self.entries.len() {
            if self.entries[i].has(state::DATA) {
                continue;
            }
            let module = self.entries[i].info.name.clone();
            let loaded = if cache_enabled && self.ds == Datastore::Running {
                match self.conn.cache().expect("cache checked enabled").read(&module) {
                    Some((data, _ver)) => data.iter().cloned().collect(),
                    None => crate::datastore::load(&layout, &module, self.ds)?,
                }
            } else {
                crate::datastore::load(&layout, &module, self.ds)?
            };
            self.data.extend(loaded);
        }
        Ok(())
    }

    fn load_operational(
        &mut self,
        request_xpath: Option<&str>,
        timeout_ms: u32,
        opts: OperOptions,
    ) -> Result<()> {
        let layout = self.conn.layout().clone();
        let cache_enabled = self.conn.cache().is_some();
        let sid = 0; // the originator session is carried by the request where needed

        for i in 0..self.entries.len() {
            if self.entries[i].has(state::DATA) {
                continue;
            }
            let info = self.entries[i].info.clone();

            // Internal modules generate their state from the registry.
            if info.name == YANG_LIBRARY_MODULE {
                let mut generated = oper::yang_library_tree(&self.conn.modules());
                self.data.append(&mut generated);
                continue;
            }
            if info.name == MONITORING_MODULE {
                let mut generated = oper::monitoring_tree(self.conn);
                self.data.append(&mut generated);
                continue;
            }

            // Base: enabled subtrees of running data.
            let running: tree::Forest = if cache_enabled {
                match self.conn.cache().expect("cache checked enabled").read(&info.name) {
                    Some((data, _)) => data.iter().cloned().collect(),
                    None => crate::datastore::load(&layout, &info.name, Datastore::Running)?,
                }
            } else {
                crate::datastore::load(&layout, &info.name, Datastore::Running)?
            };
            let change_subs = self.conn.with_shm(|shm| {
                registry::subs::change_subs(&shm.main, &shm.ext, info.idx, Datastore::Running)
            });
            let mut module_data = oper::dup_enabled(
                &running,
                &info.name,
                &change_subs,
                self.conn.schema().as_ref(),
                opts,
            )?;

            // Stored overlay.
            if !opts.no_stored {
                oper::apply_stored(&layout, &info.name, &mut module_data, opts)?;
            }

            // Live data from providers.
            if !opts.no_subs {
                let subs = self
                    .conn
                    .with_shm(|shm| registry::subs::oper_subs(&shm.main, &shm.ext, info.idx));
                oper::provider_callouts(
                    &layout,
                    &info.name,
                    &subs,
                    &mut module_data,
                    request_xpath,
                    sid,
                    timeout_ms,
                    opts,
                )?;
            }

            self.data.append(&mut module_data);
        }

        // Trim and origin handling run once over the composed whole.
        if opts.no_state || opts.no_config {
            tree::trim_forest(&mut self.data, !opts.no_state, !opts.no_config);
        }
        if !opts.with_origin {
            for root in &mut self.data {
                root.strip_origin();
            }
        }
        Ok(())
    }
}
