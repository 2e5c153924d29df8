// src/cache/mod.rs

//! Process-local cache of running data.
//!
//! Maps module name to its running tree and the version it was loaded at.
//! A hit is usable while the cached version is at least the descriptor's;
//! a strictly smaller cached version forces a refresh. Trees are shared out
//! as `Arc`s so pure-read paths clone cheaply; mutation paths deep-copy.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::trace;

use crate::error::Result;
use crate::tree::Forest;

struct CacheEntry {
    data: Arc<Forest>,
    ver: u32,
}

#[derive(Default)]
pub struct RunningCache {
    inner: RwLock<HashMap<String, CacheEntry>>,
}

impl RunningCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the cached entry current for `ver`.
    ///
    /// A fresh entry is left untouched. A stale or missing one is replaced
    /// with `upd_data` when the caller just produced the new tree, otherwise
    /// with the result of `load`. The cache never stores a version ahead of
    /// the descriptor's.
    pub fn ensure<F>(&self, module: &str, ver: u32, upd_data: Option<Forest>, load: F) -> Result<()>
    where
        F: FnOnce() -> Result<Forest>,
    {
        {
            let read = self.inner.read().expect("running cache poisoned");
            if let Some(entry) = read.get(module) {
                if entry.ver >= ver && upd_data.is_none() {
                    return Ok(());
                }
            }
        }

        let data = match upd_data {
            Some(data) => data,
            None => load()?,
        };
        trace!(module, ver, "running cache refresh");
        let mut write = self.inner.write().expect("running cache poisoned");
        write.insert(
            module.to_string(),
            CacheEntry {
                data: Arc::new(data),
                ver,
            },
        );
        Ok(())
    }

    /// Cached tree and its version; `None` on miss.
    pub fn read(&self, module: &str) -> Option<(Arc<Forest>, u32)> {
        let read = self.inner.read().expect("running cache poisoned");
        read.get(module).map(|e| (Arc::clone(&e.data), e.ver))
    }

    /// Whether a hit at `ver` exists.
    pub fn fresh(&self, module: &str, ver: u32) -> bool {
        self.read(module).is_some_and(|(_, cached)| cached >= ver)
    }

    pub fn invalidate(&self, module: &str) {
        let mut write = self.inner.write().expect("running cache poisoned");
        write.remove(module);
    }
}
