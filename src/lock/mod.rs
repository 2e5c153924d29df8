// src/lock/mod.rs

//! Lock primitives.
//!
//! The process-shared RW lock is a fixed record of atomics inside SHM
//! (`ShmRwLockRec`). WRITE announces intent first (blocking new readers),
//! then waits for readers to drain; READ-UPGRADEABLE is a READ that is the
//! unique candidate for a later upgrade. Timed waits are try-acquire plus
//! bounded sleep against an absolute deadline.
//!
//! Two file locks complement it: an advisory lock serializing one-time SHM
//! creation, and a per-connection lock file held open for the connection's
//! lifetime, probed by other connections for liveness.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::warn;

use crate::error::{Error, ErrorCode, Result};
use crate::shm::layout::{ShmRwLockRec, RWLOCK_READER_SLOTS, RWLOCK_WRITER_BIT};

/// Lock modes of the SHM RW lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    ReadUpgr,
    Write,
}

/// Absolute deadline from a caller-supplied timeout.
pub fn deadline_from_ms(timeout_ms: u32) -> Instant {
    Instant::now() + Duration::from_millis(timeout_ms as u64)
}

const WAIT_STEP: Duration = Duration::from_micros(200);

/// Transient typed view of one in-SHM lock record.
pub struct ShmRwLock {
    rec: *mut ShmRwLockRec,
}

impl ShmRwLock {
    /// The record must stay mapped for the view's lifetime; callers hold the
    /// remap READ lock around every use.
    pub unsafe fn new(rec: *mut ShmRwLockRec) -> Self {
        Self { rec }
    }

    fn word(&self) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(std::ptr::addr_of_mut!((*self.rec).word)) }
    }

    fn writer_cid(&self) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(std::ptr::addr_of_mut!((*self.rec).writer_cid)) }
    }

    fn upgr_cid(&self) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(std::ptr::addr_of_mut!((*self.rec).upgr_cid)) }
    }

    fn slot(&self, idx: usize) -> &AtomicU32 {
        unsafe {
            let arr = std::ptr::addr_of_mut!((*self.rec).read_cids) as *mut u32;
            AtomicU32::from_ptr(arr.add(idx))
        }
    }

    fn record_reader(&self, cid: u32) {
        for i in 0..RWLOCK_READER_SLOTS {
            if self.slot(i).compare_exchange(0, cid, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                return;
            }
        }
        // Slot table full: the read is held but anonymous, so recovery
        // cannot reclaim it if this connection dies.
        warn!(cid, "reader slot table full, read lock untracked");
    }

    fn drop_reader_slot(&self, cid: u32) {
        for i in 0..RWLOCK_READER_SLOTS {
            if self.slot(i).compare_exchange(cid, 0, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                return;
            }
        }
    }

    fn wait<F: Fn() -> bool>(&self, cond: F, deadline: Instant, what: &str) -> Result<()> {
        while !cond() {
            if Instant::now() >= deadline {
                return Err(Error::timeout(format!("waiting for {what}")));
            }
            std::thread::sleep(WAIT_STEP);
        }
        Ok(())
    }

    /// Acquire in `mode` by the given deadline; no side effects on timeout.
    ///
    /// Convenience form of a `LockAttempt` loop for callers that do not need
    /// to interleave the wait with other work (e.g. releasing a process-local
    /// guard between attempts).
    pub fn lock(&self, mode: LockMode, deadline: Instant, cid: u32) -> Result<()> {
        let mut attempt = LockAttempt::new(mode, cid);
        let what = match mode {
            LockMode::Read => "read access",
            LockMode::ReadUpgr => "upgradeable read access",
            LockMode::Write => "write access",
        };
        loop {
            if attempt.step(self) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                attempt.cancel(self);
                return Err(Error::timeout(format!("waiting for {what}")));
            }
            std::thread::sleep(WAIT_STEP);
        }
    }

    pub fn unlock(&self, mode: LockMode, cid: u32) {
        match mode {
            LockMode::Read => {
                self.drop_reader_slot(cid);
                self.word().fetch_sub(1, Ordering::AcqRel);
            }
            LockMode::ReadUpgr => {
                self.drop_reader_slot(cid);
                self.word().fetch_sub(1, Ordering::AcqRel);
                self.upgr_cid().store(0, Ordering::Release);
            }
            LockMode::Write => {
                self.word().store(0, Ordering::Release);
                self.writer_cid().store(0, Ordering::Release);
            }
        }
    }

    /// Upgrade a READ-UPGRADEABLE hold to WRITE. Only the upgrade candidate
    /// may call this; at most one such thread exists.
    pub fn upgrade(&self, deadline: Instant, cid: u32) -> Result<()> {
        if self.upgr_cid().load(Ordering::Acquire) != cid {
            return Err(Error::internal("upgrade without the upgradeable lock"));
        }
        self.wait(
            || {
                self.writer_cid()
                    .compare_exchange(0, cid, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            },
            deadline,
            "write intent",
        )?;
        // Our own read is the last one to drain.
        if let Err(err) = self.wait(
            || {
                self.word()
                    .compare_exchange(1, RWLOCK_WRITER_BIT, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            },
            deadline,
            "other readers to drain",
        ) {
            self.writer_cid().store(0, Ordering::Release);
            return Err(err);
        }
        self.drop_reader_slot(cid);
        Ok(())
    }

    fn try_read(&self, cid: u32) -> bool {
        loop {
            if self.writer_cid().load(Ordering::Acquire) != 0 {
                return false;
            }
            let w = self.word().load(Ordering::Acquire);
            if w & RWLOCK_WRITER_BIT != 0 {
                return false;
            }
            if self
                .word()
                .compare_exchange(w, w + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.record_reader(cid);
                return true;
            }
        }
    }

    /// Downgrade WRITE back to the upgradeable read it came from.
    pub fn downgrade(&self, cid: u32) {
        self.record_reader(cid);
        self.word().store(1, Ordering::Release);
        self.writer_cid().store(0, Ordering::Release);
    }

    /// Release anything a dead connection held on this record.
    pub fn recover(&self, dead_cid: u32) {
        if self.writer_cid().load(Ordering::Acquire) == dead_cid {
            self.word()
                .fetch_and(!RWLOCK_WRITER_BIT, Ordering::AcqRel);
            self.writer_cid().store(0, Ordering::Release);
        }
        if self.upgr_cid().load(Ordering::Acquire) == dead_cid {
            self.upgr_cid().store(0, Ordering::Release);
        }
        for i in 0..RWLOCK_READER_SLOTS {
            if self
                .slot(i)
                .compare_exchange(dead_cid, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.word().fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Current holders, for the monitoring module.
    pub fn holders(&self) -> LockHolders {
        let mut readers = Vec::new();
        for i in 0..RWLOCK_READER_SLOTS {
            let cid = self.slot(i).load(Ordering::Relaxed);
            if cid != 0 {
                readers.push(cid);
            }
        }
        LockHolders {
            writer_cid: {
                let w = self.writer_cid().load(Ordering::Relaxed);
                (w != 0 && self.word().load(Ordering::Relaxed) & RWLOCK_WRITER_BIT != 0).then_some(w)
            },
            upgr_cid: {
                let u = self.upgr_cid().load(Ordering::Relaxed);
                (u != 0).then_some(u)
            },
            readers,
        }
    }
}

/// Snapshot of one lock's holders.
#[derive(Debug, Clone, Default)]
pub struct LockHolders {
    pub writer_cid: Option<u32>,
    pub upgr_cid: Option<u32>,
    pub readers: Vec<u32>,
}

/// Incremental acquisition of an SHM RW lock.
///
/// One `step` performs a single non-blocking attempt, claiming the write
/// intent or the upgradeable slot on the way; callers sleep between steps
/// without holding any process-local guard over the mapping. An attempt that
/// gives up must `cancel` to release claimed-but-unacquired state. Progress
/// is tracked per attempt, not per connection id, so concurrent threads of
/// one connection stay distinct.
pub struct LockAttempt {
    mode: LockMode,
    cid: u32,
    intent_claimed: bool,
    upgr_claimed: bool,
    acquired: bool,
}

impl LockAttempt {
    pub fn new(mode: LockMode, cid: u32) -> Self {
        Self {
            mode,
            cid,
            intent_claimed: false,
            upgr_claimed: false,
            acquired: false,
        }
    }

    /// One attempt; true once the lock is held.
    pub fn step(&mut self, lock: &ShmRwLock) -> bool {
        if self.acquired {
            return true;
        }
        match self.mode {
            LockMode::Read => {
                self.acquired = lock.try_read(self.cid);
            }
            LockMode::ReadUpgr => {
                if !self.upgr_claimed {
                    if lock
                        .upgr_cid()
                        .compare_exchange(0, self.cid, Ordering::AcqRel, Ordering::Relaxed)
                        .is_err()
                    {
                        return false;
                    }
                    self.upgr_claimed = true;
                }
                self.acquired = lock.try_read(self.cid);
            }
            LockMode::Write => {
                if !self.intent_claimed {
                    if lock
                        .writer_cid()
                        .compare_exchange(0, self.cid, Ordering::AcqRel, Ordering::Relaxed)
                        .is_err()
                    {
                        return false;
                    }
                    self.intent_claimed = true;
                }
                self.acquired = lock
                    .word()
                    .compare_exchange(0, RWLOCK_WRITER_BIT, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok();
            }
        }
        self.acquired
    }

    /// Roll back claimed-but-unacquired state after a deadline expiry.
    pub fn cancel(&mut self, lock: &ShmRwLock) {
        if self.acquired {
            return;
        }
        if self.intent_claimed {
            lock.writer_cid().store(0, Ordering::Release);
            self.intent_claimed = false;
        }
        if self.upgr_claimed {
            lock.upgr_cid().store(0, Ordering::Release);
            self.upgr_claimed = false;
        }
    }
}

/// Incremental upgrade of a held READ-UPGRADEABLE lock to WRITE.
pub struct UpgradeAttempt {
    cid: u32,
    intent_claimed: bool,
    acquired: bool,
}

impl UpgradeAttempt {
    pub fn new(cid: u32) -> Self {
        Self {
            cid,
            intent_claimed: false,
            acquired: false,
        }
    }

    pub fn step(&mut self, lock: &ShmRwLock) -> bool {
        if self.acquired {
            return true;
        }
        if !self.intent_claimed {
            if lock
                .writer_cid()
                .compare_exchange(0, self.cid, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                return false;
            }
            self.intent_claimed = true;
        }
        // Our own read is the last one to drain.
        if lock
            .word()
            .compare_exchange(1, RWLOCK_WRITER_BIT, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            lock.drop_reader_slot(self.cid);
            self.acquired = true;
        }
        self.acquired
    }

    pub fn cancel(&mut self, lock: &ShmRwLock) {
        if !self.acquired && self.intent_claimed {
            lock.writer_cid().store(0, Ordering::Release);
            self.intent_claimed = false;
        }
    }
}

/// Simple process-shared mutex word (schema-level changes).
pub struct ShmMutex {
    word: *mut u32,
}

impl ShmMutex {
    pub unsafe fn new(word: *mut u32) -> Self {
        Self { word }
    }

    fn atom(&self) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.word) }
    }

    pub fn lock(&self, deadline: Instant) -> Result<()> {
        loop {
            if self
                .atom()
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout("waiting for the schema mutex"));
            }
            std::thread::sleep(WAIT_STEP);
        }
    }

    pub fn unlock(&self) {
        self.atom().store(0, Ordering::Release);
    }
}

/// Advisory file lock used only to serialize one-time SHM creation.
pub struct CreateLock {
    _file: File,
}

impl CreateLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        file.lock_exclusive()
            .map_err(|e| Error::from(e).wrap(ErrorCode::Sys, "cannot take the SHM create lock"))?;
        Ok(Self { _file: file })
    }
}

/// Per-connection liveness lock, flock'd for the connection's lifetime.
pub struct ConnLock {
    file: File,
    path: std::path::PathBuf,
}

impl ConnLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self {
                file,
                path: path.to_path_buf(),
            }),
            Err(_) => Err(Error::internal(format!(
                "connection lock {} already held",
                path.display()
            ))),
        }
    }

    /// Whether the connection owning `path` is still alive: its lock file is
    /// flocked while it lives.
    pub fn is_alive(path: &Path) -> bool {
        if !path.exists() {
            return false;
        }
        let Ok(file) = File::open(path) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }
}

impl Drop for ConnLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_rec() -> Box<ShmRwLockRec> {
        Box::new(unsafe { std::mem::zeroed() })
    }

    #[test]
    fn test_read_then_write_blocks() {
        let mut rec = lock_rec();
        let lock = unsafe { ShmRwLock::new(&mut *rec) };

        lock.lock(LockMode::Read, deadline_from_ms(100), 1).unwrap();
        let err = lock.lock(LockMode::Write, deadline_from_ms(50), 2).unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);

        lock.unlock(LockMode::Read, 1);
        lock.lock(LockMode::Write, deadline_from_ms(100), 2).unwrap();
        lock.unlock(LockMode::Write, 2);
    }

    #[test]
    fn test_write_intent_blocks_new_readers() {
        let mut rec = lock_rec();
        let lock = unsafe { ShmRwLock::new(&mut *rec) };
        lock.lock(LockMode::Read, deadline_from_ms(100), 1).unwrap();

        // Writer times out, but must leave no intent behind.
        let _ = lock.lock(LockMode::Write, deadline_from_ms(30), 2).unwrap_err();
        lock.lock(LockMode::Read, deadline_from_ms(100), 3).unwrap();
        lock.unlock(LockMode::Read, 3);
        lock.unlock(LockMode::Read, 1);
    }

    #[test]
    fn test_single_upgradeable() {
        let mut rec = lock_rec();
        let lock = unsafe { ShmRwLock::new(&mut *rec) };
        lock.lock(LockMode::ReadUpgr, deadline_from_ms(100), 1).unwrap();
        let err = lock.lock(LockMode::ReadUpgr, deadline_from_ms(30), 2).unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
        lock.unlock(LockMode::ReadUpgr, 1);
        lock.lock(LockMode::ReadUpgr, deadline_from_ms(100), 2).unwrap();
        lock.unlock(LockMode::ReadUpgr, 2);
    }

    #[test]
    fn test_upgrade_waits_for_plain_readers() {
        let mut rec = lock_rec();
        let lock = unsafe { ShmRwLock::new(&mut *rec) };
        lock.lock(LockMode::ReadUpgr, deadline_from_ms(100), 1).unwrap();
        lock.lock(LockMode::Read, deadline_from_ms(100), 2).unwrap();

        let err = lock.upgrade(deadline_from_ms(30), 1).unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);

        lock.unlock(LockMode::Read, 2);
        lock.upgrade(deadline_from_ms(100), 1).unwrap();
        lock.downgrade(1);
        lock.unlock(LockMode::ReadUpgr, 1);
    }

    #[test]
    fn test_recover_dead_writer() {
        let mut rec = lock_rec();
        let lock = unsafe { ShmRwLock::new(&mut *rec) };
        lock.lock(LockMode::Write, deadline_from_ms(100), 9).unwrap();
        // Connection 9 "dies" without unlocking.
        lock.recover(9);
        lock.lock(LockMode::Write, deadline_from_ms(100), 2).unwrap();
        lock.unlock(LockMode::Write, 2);
    }

    #[test]
    fn test_recover_dead_reader() {
        let mut rec = lock_rec();
        let lock = unsafe { ShmRwLock::new(&mut *rec) };
        lock.lock(LockMode::Read, deadline_from_ms(100), 9).unwrap();
        lock.recover(9);
        lock.lock(LockMode::Write, deadline_from_ms(100), 2).unwrap();
        lock.unlock(LockMode::Write, 2);
    }

    #[test]
    fn test_conn_lock_liveness() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conn_1.lock");
        assert!(!ConnLock::is_alive(&path));

        let held = ConnLock::acquire(&path).unwrap();
        assert!(ConnLock::is_alive(&path));

        drop(held);
        assert!(!ConnLock::is_alive(&path));
    }
}
