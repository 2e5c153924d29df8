// src/modinfo/lock.rs

//! Locking protocol of the module-info set.
//!
//! The set is locked as a whole, iterating entries in canonical order; the
//! i-th failure rolls back the prior i-1 entries in reverse. Operational
//! requests additionally READ-lock each module's secondary datastore
//! (running). Write flows check the NETCONF-style datastore lock of another
//! session before taking the module WRITE lock.

use std::time::Instant;

use crate::connection::ShmHandles;
use crate::error::Result;
use crate::lock::{deadline_from_ms, LockMode};
use crate::registry;
use crate::shm::layout::{Datastore, ShmRwLockRec};

use super::ModInfo;

fn lock_locator(
    idx: usize,
    ds: Datastore,
) -> impl Fn(&ShmHandles) -> *mut ShmRwLockRec {
    move |shm| unsafe {
        std::ptr::addr_of_mut!((*registry::data_lock_ptr(&shm.main, idx, ds)).lock)
    }
}

impl ModInfo<'_> {
    /// READ-lock every module; with `upgradeable`, the primary-datastore lock
    /// of each entry is taken READ-UPGRADEABLE so the flow can later upgrade
    /// to WRITE.
    pub fn rdlock(&mut self, upgradeable: bool, timeout_ms: u32) -> Result<()> {
        let mode = if upgradeable { LockMode::ReadUpgr } else { LockMode::Read };
        self.lock_all(mode, timeout_ms)
    }

    /// WRITE-lock every module on the primary datastore; secondary stays READ.
    pub fn wrlock(&mut self, sid: u32, timeout_ms: u32) -> Result<()> {
        self.ds_lock_check(sid)?;
        self.lock_all(LockMode::Write, timeout_ms)
    }

    /// Fail when another session holds the NETCONF-style datastore lock of
    /// any module in the set. Write flows check this before taking (or
    /// upgrading to) the module WRITE lock.
    pub fn ds_lock_check(&self, sid: u32) -> Result<()> {
        self.conn.with_shm(|shm| -> Result<()> {
            for entry in &self.entries {
                registry::ds_lock_check(&shm.main, entry.info.idx, self.ds, sid)?;
            }
            Ok(())
        })
    }

    fn lock_all(&mut self, mode: LockMode, timeout_ms: u32) -> Result<()> {
        let deadline = deadline_from_ms(timeout_ms);
        for i in 0..self.entries.len() {
            if let Err(err) = self.lock_one(i, mode, deadline) {
                self.unlock_prior(i);
                return Err(err);
            }
        }
        Ok(())
    }

    fn lock_one(&mut self, i: usize, mode: LockMode, deadline: Instant) -> Result<()> {
        let idx = self.entries[i].info.idx;
        self.conn.lock_rec(mode, deadline, lock_locator(idx, self.ds))?;
        self.entries[i].lock_held = Some(mode);

        if let Some(ds2) = self.ds2 {
            if let Err(err) = self.conn.lock_rec(LockMode::Read, deadline, lock_locator(idx, ds2)) {
                self.conn.unlock_rec(mode, lock_locator(idx, self.ds));
                self.entries[i].lock_held = None;
                return Err(err);
            }
            self.entries[i].secondary_locked = true;
        }
        Ok(())
    }

    fn unlock_prior(&mut self, upto: usize) {
        for i in (0..upto).rev() {
            self.unlock_one(i);
        }
    }

    fn unlock_one(&mut self, i: usize) {
        let idx = self.entries[i].info.idx;
        if self.entries[i].secondary_locked {
            if let Some(ds2) = self.ds2 {
                self.conn.unlock_rec(LockMode::Read, lock_locator(idx, ds2));
            }
            self.entries[i].secondary_locked = false;
        }
        if let Some(mode) = self.entries[i].lock_held.take() {
            self.conn.unlock_rec(mode, lock_locator(idx, self.ds));
        }
    }

    /// Upgrade every READ-UPGRADEABLE hold to WRITE, canonical order.
    pub fn rdlock_upgrade(&mut self, timeout_ms: u32) -> Result<()> {
        let deadline = deadline_from_ms(timeout_ms);
        for i in 0..self.entries.len() {
            if self.entries[i].lock_held != Some(LockMode::ReadUpgr) {
                continue;
            }
            let idx = self.entries[i].info.idx;
            self.conn.upgrade_rec(deadline, lock_locator(idx, self.ds))?;
            self.entries[i].lock_held = Some(LockMode::Write);
        }
        Ok(())
    }

    /// Downgrade upgraded WRITE holds back to READ-UPGRADEABLE.
    pub fn wrlock_downgrade(&mut self) {
        for i in 0..self.entries.len() {
            if self.entries[i].lock_held != Some(LockMode::Write) {
                continue;
            }
            let idx = self.entries[i].info.idx;
            self.conn.downgrade_rec(lock_locator(idx, self.ds));
            self.entries[i].lock_held = Some(LockMode::ReadUpgr);
        }
    }

    /// Unlock everything still held, reverse canonical order.
    pub fn unlock(&mut self) {
        for i in (0..self.entries.len()).rev() {
            self.unlock_one(i);
        }
    }
}

impl Drop for ModInfo<'_> {
    fn drop(&mut self) {
        self.unlock();
    }
}
