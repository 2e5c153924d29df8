// src/shm/file.rs

//! A memory-mapped shared file that can grow and remap.
//!
//! Both SHM segments live in files under the SHM directory and are mapped
//! shared into every connection. Growth is `File::set_len` followed by a
//! fresh mapping; the remap RW lock in `crate::lock` keeps readers' pointers
//! stable while another thread of this process remaps.

use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::error::{Error, ErrorCode, Result};

pub struct ShmFile {
    file: File,
    path: PathBuf,
    ptr: Option<NonNull<CVoid>>,
    size: usize,
}

type CVoid = std::ffi::c_void;

// Mappings are plain shared memory; concurrent access is governed by the
// in-SHM locks, not by Rust aliasing.
unsafe impl Send for ShmFile {}
unsafe impl Sync for ShmFile {}

impl ShmFile {
    /// Open (and create, if allowed) the SHM file and map its current size.
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .map_err(|e| {
                Error::from(e).wrap(ErrorCode::Sys, format!("cannot open SHM file {}", path.display()))
            })?;
        let size = file.metadata()?.len() as usize;

        let mut shm = Self {
            file,
            path: path.to_path_buf(),
            ptr: None,
            size: 0,
        };
        if size > 0 {
            shm.map(size)?;
        }
        Ok(shm)
    }

    fn map(&mut self, size: usize) -> Result<()> {
        self.unmap();
        let len = NonZeroUsize::new(size)
            .ok_or_else(|| Error::internal("mapping of zero length requested"))?;
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.file.as_fd(),
                0,
            )
        }
        .map_err(|e| {
            Error::from(e).wrap(
                ErrorCode::Sys,
                format!("cannot map SHM file {}", self.path.display()),
            )
        })?;
        self.ptr = Some(ptr.cast());
        self.size = size;
        Ok(())
    }

    fn unmap(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            // Best effort; the mapping dies with the process anyway.
            let _ = unsafe { munmap(ptr.cast(), self.size) };
        }
        self.size = 0;
    }

    /// Grow the file to `new_size` and remap. Shrinking is only done by
    /// defragmentation, which truncates through the same path.
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        self.file.set_len(new_size as u64).map_err(|e| {
            Error::from(e).wrap(
                ErrorCode::Sys,
                format!("cannot grow SHM file {}", self.path.display()),
            )
        })?;
        self.map(new_size)
    }

    /// Remap after another connection grew the file.
    pub fn remap_current(&mut self) -> Result<()> {
        let size = self.file.metadata()?.len() as usize;
        if size != self.size && size > 0 {
            self.map(size)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn base(&self) -> *mut u8 {
        self.ptr
            .map(|p| p.as_ptr() as *mut u8)
            .unwrap_or(std::ptr::null_mut())
    }

    /// Typed pointer at a byte offset. Caller holds the appropriate locks and
    /// vouches the offset was produced by the arena for a `T`.
    pub unsafe fn at<T>(&self, off: u64) -> *mut T {
        debug_assert!(off as usize + std::mem::size_of::<T>() <= self.size);
        self.base().add(off as usize) as *mut T
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ShmFile {
    fn drop(&mut self) {
        self.unmap();
    }
}
