// src/shm/main.rs

//! Main SHM segment: fixed header plus the module descriptor array.
//!
//! The first four bytes carry the layout version tag; an incompatible tag
//! fails connection startup. Descriptors are addressed by their byte offset
//! within the segment, which is also the canonical lock-ordering key.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::SHM_VER;
use crate::error::{Error, Result};
use crate::shm::file::ShmFile;
use crate::shm::layout::{MainShmHeader, ModuleShm};

pub struct MainShm {
    file: ShmFile,
}

impl MainShm {
    /// Open the segment; with `create`, an empty file is initialized to a
    /// fresh header. An existing segment must carry the expected version tag.
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        let file = ShmFile::open(path, create)?;
        let mut shm = Self { file };

        if shm.file.is_empty() {
            if !create {
                return Err(Error::sys("main SHM does not exist"));
            }
            shm.file.resize(std::mem::size_of::<MainShmHeader>())?;
            // Fresh pages are zeroed; only the tag and counters need values.
            unsafe {
                let hdr = shm.header_ptr();
                (*hdr).shm_ver = SHM_VER;
                (*hdr).new_conn_id = 1;
                (*hdr).new_sess_id = 1;
                (*hdr).new_sub_id = 1;
                (*hdr).new_evpipe_num = 1;
            }
        } else {
            let ver = unsafe { (*shm.header_ptr()).shm_ver };
            if ver != SHM_VER {
                return Err(Error::sys(format!(
                    "unsupported SHM version {ver} (expected {SHM_VER})"
                )));
            }
        }
        Ok(shm)
    }

    pub fn remap_current(&mut self) -> Result<()> {
        self.file.remap_current()
    }

    pub fn header_ptr(&self) -> *mut MainShmHeader {
        unsafe { self.file.at::<MainShmHeader>(0) }
    }

    fn counter(&self, field: *mut u32) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(field) }
    }

    /// Allocate the next connection id (never 0).
    pub fn next_cid(&self) -> u32 {
        let hdr = self.header_ptr();
        self.counter(unsafe { std::ptr::addr_of_mut!((*hdr).new_conn_id) })
            .fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_sid(&self) -> u32 {
        let hdr = self.header_ptr();
        self.counter(unsafe { std::ptr::addr_of_mut!((*hdr).new_sess_id) })
            .fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_sub_id(&self) -> u32 {
        let hdr = self.header_ptr();
        self.counter(unsafe { std::ptr::addr_of_mut!((*hdr).new_sub_id) })
            .fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_evpipe_num(&self) -> u32 {
        let hdr = self.header_ptr();
        self.counter(unsafe { std::ptr::addr_of_mut!((*hdr).new_evpipe_num) })
            .fetch_add(1, Ordering::Relaxed)
    }

    pub fn mod_count(&self) -> usize {
        unsafe { (*self.header_ptr()).mod_count as usize }
    }

    /// Byte offset of the idx-th module descriptor: the canonical ordering
    /// key of the dependency resolver.
    pub fn module_off(&self, idx: usize) -> u64 {
        (std::mem::size_of::<MainShmHeader>() + idx * std::mem::size_of::<ModuleShm>()) as u64
    }

    pub fn module_ptr(&self, idx: usize) -> *mut ModuleShm {
        debug_assert!(idx < self.mod_count());
        unsafe { self.file.at::<ModuleShm>(self.module_off(idx)) }
    }

    /// Descriptor index back from its offset.
    pub fn module_idx(&self, off: u64) -> usize {
        (off as usize - std::mem::size_of::<MainShmHeader>()) / std::mem::size_of::<ModuleShm>()
    }

    /// Append one zeroed descriptor slot, returning its index. The caller
    /// holds the schema mutex.
    pub fn append_module(&mut self) -> Result<usize> {
        let idx = self.mod_count();
        let new_size =
            std::mem::size_of::<MainShmHeader>() + (idx + 1) * std::mem::size_of::<ModuleShm>();
        self.file.resize(new_size)?;
        unsafe {
            (*self.header_ptr()).mod_count = (idx + 1) as u32;
        }
        Ok(idx)
    }

    /// Remove the descriptor at `idx`, compacting the array.
    pub fn remove_module(&mut self, idx: usize) -> Result<()> {
        let count = self.mod_count();
        if idx >= count {
            return Err(Error::internal("module index out of bounds"));
        }
        unsafe {
            let base = self.module_ptr(0);
            std::ptr::copy(base.add(idx + 1), base.add(idx), count - idx - 1);
            (*self.header_ptr()).mod_count = (count - 1) as u32;
        }
        // The trailing slot stays allocated; the next install reuses it.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_version_check() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main");
        let shm = MainShm::open(&path, true).unwrap();
        assert_eq!(shm.mod_count(), 0);
        drop(shm);

        // Reopen succeeds with the matching tag.
        let shm = MainShm::open(&path, false).unwrap();
        assert_eq!(shm.mod_count(), 0);
        drop(shm);

        // Corrupt the tag: startup must fail.
        use std::io::{Seek, SeekFrom, Write};
        let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(&999u32.to_ne_bytes()).unwrap();
        drop(f);
        assert!(MainShm::open(&path, false).is_err());
    }

    #[test]
    fn test_counters_monotonic() {
        let dir = TempDir::new().unwrap();
        let shm = MainShm::open(&dir.path().join("main"), true).unwrap();
        let a = shm.next_cid();
        let b = shm.next_cid();
        assert_eq!(b, a + 1);
        assert!(a >= 1);
    }

    #[test]
    fn test_append_module_offsets_ascend() {
        let dir = TempDir::new().unwrap();
        let mut shm = MainShm::open(&dir.path().join("main"), true).unwrap();
        let i0 = shm.append_module().unwrap();
        let i1 = shm.append_module().unwrap();
        assert!(shm.module_off(i0) < shm.module_off(i1));
        assert_eq!(shm.module_idx(shm.module_off(i1)), i1);
        assert_eq!(shm.mod_count(), 2);
    }
}
