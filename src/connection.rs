// src/connection.rs

//! Connection bootstrap and the SHM locking entry points.
//!
//! A connection maps both SHM segments, holds its liveness lock file, and
//! provides the lock helpers every flow goes through. Acquiring the SHM lock
//! in WRITE or READ-UPGRADEABLE mode also performs connection recovery:
//! any registered connection whose lock file is no longer flocked has its
//! module locks released, its subscriptions stopped, and its stored
//! operational overlays dropped. The global acquisition order is
//! SHM RW -> remap RW -> module locks in canonical order -> cache RW.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::cache::RunningCache;
use crate::config::Layout;
use crate::error::{Error, Result};
use crate::lock::{deadline_from_ms, ConnLock, CreateLock, LockAttempt, LockMode, ShmMutex, ShmRwLock};
use crate::registry;
use crate::schema::{ModuleSchema, SchemaProvider};
use crate::shm::layout::Datastore;
use crate::shm::{ExtShm, MainShm};

/// Connection options.
#[derive(Debug, Clone, Default)]
pub struct ConnOptions {
    /// Keep running data in the process-local cache.
    pub cache_running: bool,
}

/// Both SHM segments, guarded by the process-local remap RW lock.
pub struct ShmHandles {
    pub main: MainShm,
    pub ext: ExtShm,
}

pub struct Connection {
    layout: Layout,
    schema: Arc<dyn SchemaProvider>,
    cid: u32,
    shm: RwLock<ShmHandles>,
    cache: Option<RunningCache>,
    _conn_lock: ConnLock,
}

impl Connection {
    /// Connect to (creating if needed) the repository's shared state.
    pub fn connect(
        layout: Layout,
        schema: Arc<dyn SchemaProvider>,
        options: ConnOptions,
    ) -> Result<Arc<Self>> {
        layout.ensure_dirs()?;

        // One-time SHM creation runs under the create file lock.
        let main;
        let mut ext;
        {
            let _create = CreateLock::acquire(&layout.create_lock_file())?;
            main = MainShm::open(&layout.main_shm_file(), true)?;
            ext = ExtShm::open(&layout.ext_shm_file(), true)?;
            if ext.used() == 0 {
                ext.init()?;
            }
        }

        let cid = main.next_cid();
        let conn_lock = ConnLock::acquire(&layout.conn_lock_file(cid))?;

        let conn = Arc::new(Self {
            layout,
            schema,
            cid,
            shm: RwLock::new(ShmHandles { main, ext }),
            cache: options.cache_running.then(RunningCache::new),
            _conn_lock: conn_lock,
        });

        conn.shm_lock(LockMode::Write, crate::config::DEFAULT_LOCK_TIMEOUT_MS)?;
        let result = conn.with_shm_mut(|shm| {
            registry::conn_add(&shm.main, &mut shm.ext, cid, std::process::id())
        });
        conn.shm_unlock(LockMode::Write);
        result?;

        info!(cid, "connection established");
        Ok(conn)
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn schema(&self) -> &Arc<dyn SchemaProvider> {
        &self.schema
    }

    pub fn cache(&self) -> Option<&RunningCache> {
        self.cache.as_ref()
    }

    /// Read access to the mappings (remap READ).
    pub(crate) fn shm_read(&self) -> RwLockReadGuard<'_, ShmHandles> {
        self.shm.read().expect("shm handles poisoned")
    }

    /// Exclusive access for growth/remap (remap WRITE).
    pub(crate) fn shm_write(&self) -> RwLockWriteGuard<'_, ShmHandles> {
        self.shm.write().expect("shm handles poisoned")
    }

    pub(crate) fn with_shm<R>(&self, f: impl FnOnce(&ShmHandles) -> R) -> R {
        let mut guard = self.shm_write();
        // Follow any growth another connection performed.
        let _ = guard.main.remap_current();
        let _ = guard.ext.remap_current();
        drop(guard);
        let guard = self.shm_read();
        f(&guard)
    }

    pub(crate) fn with_shm_mut<R>(&self, f: impl FnOnce(&mut ShmHandles) -> R) -> R {
        let mut guard = self.shm_write();
        let _ = guard.main.remap_current();
        let _ = guard.ext.remap_current();
        f(&mut guard)
    }

    /// Acquire an SHM lock record found by `locate`, never sleeping while the
    /// remap guard is held.
    pub(crate) fn lock_rec(
        &self,
        mode: LockMode,
        deadline: Instant,
        locate: impl Fn(&ShmHandles) -> *mut crate::shm::layout::ShmRwLockRec,
    ) -> Result<()> {
        let mut attempt = LockAttempt::new(mode, self.cid);
        loop {
            let acquired = {
                let guard = self.shm_read();
                let lock = unsafe { ShmRwLock::new(locate(&guard)) };
                attempt.step(&lock)
            };
            if acquired {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let guard = self.shm_read();
                let lock = unsafe { ShmRwLock::new(locate(&guard)) };
                attempt.cancel(&lock);
                return Err(Error::timeout("waiting for an SHM lock"));
            }
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
    }

    pub(crate) fn unlock_rec(
        &self,
        mode: LockMode,
        locate: impl Fn(&ShmHandles) -> *mut crate::shm::layout::ShmRwLockRec,
    ) {
        let guard = self.shm_read();
        let lock = unsafe { ShmRwLock::new(locate(&guard)) };
        lock.unlock(mode, self.cid);
    }

    /// Upgrade a held READ-UPGRADEABLE record to WRITE.
    pub(crate) fn upgrade_rec(
        &self,
        deadline: Instant,
        locate: impl Fn(&ShmHandles) -> *mut crate::shm::layout::ShmRwLockRec,
    ) -> Result<()> {
        let mut attempt = crate::lock::UpgradeAttempt::new(self.cid);
        loop {
            let acquired = {
                let guard = self.shm_read();
                let lock = unsafe { ShmRwLock::new(locate(&guard)) };
                attempt.step(&lock)
            };
            if acquired {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let guard = self.shm_read();
                let lock = unsafe { ShmRwLock::new(locate(&guard)) };
                attempt.cancel(&lock);
                return Err(Error::timeout("upgrading an SHM lock"));
            }
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
    }

    /// Downgrade a held WRITE record back to READ-UPGRADEABLE.
    pub(crate) fn downgrade_rec(
        &self,
        locate: impl Fn(&ShmHandles) -> *mut crate::shm::layout::ShmRwLockRec,
    ) {
        let guard = self.shm_read();
        let lock = unsafe { ShmRwLock::new(locate(&guard)) };
        lock.downgrade(self.cid);
    }

    fn main_lock_ptr(shm: &ShmHandles) -> *mut crate::shm::layout::ShmRwLockRec {
        unsafe { std::ptr::addr_of_mut!((*shm.main.header_ptr()).lock) }
    }

    /// Lock the main SHM. WRITE and READ-UPGRADEABLE acquires also reclaim
    /// the state of dead connections.
    pub(crate) fn shm_lock(&self, mode: LockMode, timeout_ms: u32) -> Result<()> {
        // Catch up on any remap another connection performed first.
        {
            let mut guard = self.shm_write();
            let _ = guard.main.remap_current();
            let _ = guard.ext.remap_current();
        }
        self.lock_rec(mode, deadline_from_ms(timeout_ms), Self::main_lock_ptr)?;
        if mode != LockMode::Read {
            if let Err(err) = self.recover_connections() {
                warn!(error = %err, "connection recovery failed");
            }
        }
        Ok(())
    }

    /// Unlock the main SHM; a WRITE unlock defragments the ext heap once its
    /// waste crosses the threshold.
    pub(crate) fn shm_unlock(&self, mode: LockMode) {
        if mode == LockMode::Write {
            let mut guard = self.shm_write();
            if guard.ext.defrag_needed() {
                let ShmHandles { main, ext } = &mut *guard;
                if let Err(err) = registry::defragment(main, ext) {
                    warn!(error = %err, "ext SHM defragmentation failed");
                }
            }
        }
        self.unlock_rec(mode, Self::main_lock_ptr);
    }

    /// Reclaim the state of connections whose lock file is no longer flocked.
    /// Runs with the main SHM lock held in WRITE or READ-UPGRADEABLE mode.
    fn recover_connections(&self) -> Result<()> {
        let dead: Vec<u32> = self.with_shm(|shm| {
            registry::conn_list(&shm.main, &shm.ext)
                .into_iter()
                .filter(|c| c.cid != self.cid && !ConnLock::is_alive(&self.layout.conn_lock_file(c.cid)))
                .map(|c| c.cid)
                .collect()
        });

        for cid in dead {
            info!(cid, "recovering dead connection");

            self.with_shm_mut(|shm| -> Result<()> {
                // Release every lock the connection may hold.
                for idx in 0..shm.main.mod_count() {
                    for ds_idx in 0..crate::shm::layout::DS_COUNT {
                        let ds = Datastore::from_idx(ds_idx).expect("datastore index in range");
                        let rec = registry::data_lock_ptr(&shm.main, idx, ds);
                        let lock = unsafe { ShmRwLock::new(std::ptr::addr_of_mut!((*rec).lock)) };
                        lock.recover(cid);
                        // Its NETCONF datastore locks die with it.
                        let rec = unsafe { &mut *rec };
                        if rec.ds_locked != 0 && rec.sid != 0 {
                            // Session ids are scoped to their connection; the
                            // owning connection is gone either way.
                            rec.ds_locked = 0;
                            rec.sid = 0;
                            rec.ds_ts = 0;
                        }
                    }
                    let m = shm.main.module_ptr(idx);
                    let replay = unsafe { ShmRwLock::new(std::ptr::addr_of_mut!((*m).replay_lock)) };
                    replay.recover(cid);
                }
                let hdr = shm.main.header_ptr();
                let main_lock = unsafe { ShmRwLock::new(std::ptr::addr_of_mut!((*hdr).lock)) };
                main_lock.recover(cid);

                registry::subs::stop_conn_subs(&shm.main, &mut shm.ext, cid)?;
                registry::subs::drop_conn_oper_data(&self.layout, &shm.main, &shm.ext, cid)?;
                registry::conn_del(&shm.main, &mut shm.ext, cid)?;
                Ok(())
            })?;

            let _ = std::fs::remove_file(self.layout.conn_lock_file(cid));
        }
        Ok(())
    }

    /// Install a module under the schema mutex. The startup file is created
    /// empty (with defaults) when missing.
    pub fn install_module(&self, schema: &ModuleSchema) -> Result<()> {
        let deadline = deadline_from_ms(crate::config::DEFAULT_LOCK_TIMEOUT_MS);
        {
            let guard = self.shm_read();
            let mutex = unsafe {
                ShmMutex::new(std::ptr::addr_of_mut!((*guard.main.header_ptr()).schema_lock))
            };
            mutex.lock(deadline)?;
        }
        let result = self.install_module_locked(schema);
        {
            let guard = self.shm_read();
            let mutex = unsafe {
                ShmMutex::new(std::ptr::addr_of_mut!((*guard.main.header_ptr()).schema_lock))
            };
            mutex.unlock();
        }
        result
    }

    fn install_module_locked(&self, schema: &ModuleSchema) -> Result<()> {
        self.shm_lock(LockMode::Write, crate::config::DEFAULT_LOCK_TIMEOUT_MS)?;
        let result = self.with_shm_mut(|shm| {
            registry::install_module(&mut shm.main, &mut shm.ext, schema, self.schema.as_ref())
        });
        self.shm_unlock(LockMode::Write);
        let _idx = result?;

        // Startup must always exist; seed it with implicit defaults.
        let startup = self.layout.startup_file(&schema.name);
        if !startup.exists() {
            let mut data = Vec::new();
            self.schema.add_defaults(&schema.name, &mut data)?;
            crate::datastore::store(&self.layout, &schema.name, Datastore::Startup, &data)?;
        }
        Ok(())
    }

    pub fn uninstall_module(&self, name: &str) -> Result<()> {
        self.shm_lock(LockMode::Write, crate::config::DEFAULT_LOCK_TIMEOUT_MS)?;
        let result =
            self.with_shm_mut(|shm| registry::uninstall_module(&mut shm.main, &mut shm.ext, name));
        self.shm_unlock(LockMode::Write);
        result?;

        for ds in [Datastore::Running, Datastore::Candidate, Datastore::Operational] {
            let _ = std::fs::remove_file(crate::datastore::file_path(&self.layout, name, ds));
        }
        if let Some(cache) = &self.cache {
            cache.invalidate(name);
        }
        Ok(())
    }

    /// Installed module snapshots, in descriptor order.
    pub fn modules(&self) -> Vec<registry::ModuleInfo> {
        self.with_shm(|shm| registry::all_modules(&shm.main, &shm.ext))
    }

    /// Allocate a new session id.
    pub(crate) fn next_sid(&self) -> u32 {
        self.with_shm(|shm| shm.main.next_sid())
    }

    pub(crate) fn next_sub_id(&self) -> u32 {
        self.with_shm(|shm| shm.main.next_sub_id())
    }

    pub(crate) fn next_evpipe_num(&self) -> u32 {
        self.with_shm(|shm| shm.main.next_evpipe_num())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Best-effort cleanup mirroring recovery: stop our subscriptions,
        // drop our stored operational data, leave the connection list.
        let cid = self.cid;
        if self.shm_lock(LockMode::Write, 1_000).is_ok() {
            let layout = self.layout.clone();
            let result = self.with_shm_mut(|shm| -> Result<()> {
                registry::subs::stop_conn_subs(&shm.main, &mut shm.ext, cid)?;
                registry::subs::drop_conn_oper_data(&layout, &shm.main, &shm.ext, cid)?;
                registry::conn_del(&shm.main, &mut shm.ext, cid)?;
                Ok(())
            });
            if let Err(err) = result {
                debug!(cid, error = %err, "disconnect cleanup incomplete");
            }
            self.shm_unlock(LockMode::Write);
        }
        info!(cid, "connection closed");
    }
}
