// src/shm/arena.rs

//! Ext SHM: an offset-addressed heap of aligned blocks.
//!
//! The segment starts with a `u32` count of wasted bytes, then blocks reached
//! only through offsets stored in Main SHM or in other ext blocks. Allocation
//! appends at the tail and grows the file; freeing only accounts the span as
//! wasted. Defragmentation (driven by the registry, which knows the offset
//! graph roots) rebuilds the heap once waste crosses its threshold.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::{SHM_ALIGN, SHM_WASTED_DIVISOR};
use crate::error::{Error, Result};
use crate::shm::file::ShmFile;
use crate::shm::layout::{OffArray, OFF_NULL};

/// Bytes reserved for the ext header (`wasted` + padding to alignment).
pub const EXT_HEADER: usize = SHM_ALIGN;

fn align_up(n: usize) -> usize {
    (n + SHM_ALIGN - 1) & !(SHM_ALIGN - 1)
}

pub struct ExtShm {
    file: ShmFile,
}

impl ExtShm {
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        let file = ShmFile::open(path, create)?;
        Ok(Self { file })
    }

    /// First-time initialization: header only, zero waste.
    pub fn init(&mut self) -> Result<()> {
        self.file.resize(EXT_HEADER)?;
        self.wasted_ref().store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn remap_current(&mut self) -> Result<()> {
        self.file.remap_current()
    }

    pub fn used(&self) -> usize {
        self.file.len()
    }

    fn wasted_ref(&self) -> &AtomicU32 {
        // The counter sits at offset 0 for the whole segment lifetime.
        unsafe { AtomicU32::from_ptr(self.file.at::<u32>(0)) }
    }

    pub fn wasted(&self) -> u32 {
        if self.file.is_empty() {
            return 0;
        }
        self.wasted_ref().load(Ordering::Relaxed)
    }

    fn add_wasted(&self, bytes: u32) {
        self.wasted_ref().fetch_add(bytes, Ordering::Relaxed);
    }

    /// Whether waste crossed the defragmentation threshold.
    pub fn defrag_needed(&self) -> bool {
        let used = self.used() as u32;
        used > 0 && self.wasted() > used / SHM_WASTED_DIVISOR
    }

    /// Append a zeroed block at the tail, returning its offset.
    pub fn alloc(&mut self, size: usize) -> Result<u64> {
        if size == 0 {
            return Ok(OFF_NULL);
        }
        let off = align_up(self.used().max(EXT_HEADER));
        self.file.resize(off + align_up(size))?;
        // A fresh file region reads back zeroed.
        Ok(off as u64)
    }

    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> Result<u64> {
        let off = self.alloc(bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.file.at::<u8>(off), bytes.len());
        }
        Ok(off)
    }

    /// Store a NUL-terminated string, returning its offset.
    pub fn alloc_str(&mut self, s: &str) -> Result<u64> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.alloc_bytes(&bytes)
    }

    /// Copy the NUL-terminated string at `off` out of the segment.
    pub fn string_at(&self, off: u64) -> String {
        if off == OFF_NULL {
            return String::new();
        }
        let mut out = Vec::new();
        let mut idx = off as usize;
        while idx < self.used() {
            let byte = unsafe { *self.file.at::<u8>(idx as u64) };
            if byte == 0 {
                break;
            }
            out.push(byte);
            idx += 1;
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Free a string block.
    pub fn free_str(&self, off: u64) {
        if off != OFF_NULL {
            let len = self.string_at(off).len() + 1;
            self.add_wasted(align_up(len) as u32);
        }
    }

    /// Typed pointer into the segment. Valid until the next growth/remap.
    pub unsafe fn at<T>(&self, off: u64) -> *mut T {
        self.file.at::<T>(off)
    }

    /// Copy the items of an offset array out of the segment.
    pub fn array_items<T: Copy>(&self, arr: &OffArray) -> Vec<T> {
        let mut out = Vec::with_capacity(arr.count as usize);
        if arr.off == OFF_NULL {
            return out;
        }
        for i in 0..arr.count as usize {
            let item = unsafe {
                *self
                    .file
                    .at::<T>(arr.off + (i * std::mem::size_of::<T>()) as u64)
            };
            out.push(item);
        }
        out
    }

    /// Read one item.
    pub fn array_item<T: Copy>(&self, arr: &OffArray, idx: usize) -> Result<T> {
        if idx >= arr.count as usize {
            return Err(Error::internal("SHM array index out of bounds"));
        }
        Ok(unsafe {
            *self
                .file
                .at::<T>(arr.off + (idx * std::mem::size_of::<T>()) as u64)
        })
    }

    /// Overwrite one item in place.
    pub fn array_set<T: Copy>(&self, arr: &OffArray, idx: usize, item: T) -> Result<()> {
        if idx >= arr.count as usize {
            return Err(Error::internal("SHM array index out of bounds"));
        }
        unsafe {
            *self
                .file
                .at::<T>(arr.off + (idx * std::mem::size_of::<T>()) as u64) = item;
        }
        Ok(())
    }

    /// Insert an item at `idx` (or append). Grows in place when alignment
    /// slack suffices, otherwise relocates the block to the tail and wastes
    /// the old span. The array descriptor lives in Main SHM and is updated
    /// through `arr`.
    pub fn array_add<T: Copy>(
        &mut self,
        arr: &mut OffArray,
        item: T,
        idx: Option<usize>,
    ) -> Result<()> {
        let size = std::mem::size_of::<T>();
        let count = arr.count as usize;
        let idx = idx.unwrap_or(count).min(count);

        let old_span = align_up(count * size);
        let need = (count + 1) * size;

        if arr.off == OFF_NULL || need > old_span {
            let new_off = self.alloc(need)?;
            if arr.off != OFF_NULL {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.file.at::<u8>(arr.off),
                        self.file.at::<u8>(new_off),
                        count * size,
                    );
                }
                self.add_wasted(old_span as u32);
            }
            arr.off = new_off;
        }

        unsafe {
            let base = self.file.at::<T>(arr.off);
            // Shift the suffix right to open the slot.
            if idx < count {
                std::ptr::copy(base.add(idx), base.add(idx + 1), count - idx);
            }
            *base.add(idx) = item;
        }
        arr.count += 1;
        Ok(())
    }

    /// Remove the item at `idx`, compacting the suffix and accounting waste.
    pub fn array_del<T: Copy>(&mut self, arr: &mut OffArray, idx: usize) -> Result<()> {
        let size = std::mem::size_of::<T>();
        let count = arr.count as usize;
        if idx >= count {
            return Err(Error::internal("SHM array index out of bounds"));
        }
        unsafe {
            let base = self.file.at::<T>(arr.off);
            std::ptr::copy(base.add(idx + 1), base.add(idx), count - idx - 1);
        }
        arr.count -= 1;
        if arr.count == 0 {
            self.add_wasted(align_up(count * size) as u32);
            arr.off = OFF_NULL;
        } else {
            self.add_wasted(size as u32);
        }
        Ok(())
    }

    /// Replace the whole heap content with `image` (defragmentation commit).
    pub fn replace_content(&mut self, image: &[u8]) -> Result<()> {
        self.file.resize(EXT_HEADER.max(align_up(image.len())))?;
        unsafe {
            std::ptr::copy_nonoverlapping(image.as_ptr(), self.file.at::<u8>(0), image.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh() -> (TempDir, ExtShm) {
        let dir = TempDir::new().unwrap();
        let mut ext = ExtShm::open(&dir.path().join("ext"), true).unwrap();
        ext.init().unwrap();
        (dir, ext)
    }

    #[test]
    fn test_alloc_str_roundtrip() {
        let (_dir, mut ext) = fresh();
        let off = ext.alloc_str("ietf-interfaces").unwrap();
        assert_ne!(off, OFF_NULL);
        assert_eq!(ext.string_at(off), "ietf-interfaces");
    }

    #[test]
    fn test_array_add_and_del() {
        let (_dir, mut ext) = fresh();
        let mut arr = OffArray::EMPTY;
        for v in [10u64, 20, 30] {
            ext.array_add(&mut arr, v, None).unwrap();
        }
        assert_eq!(ext.array_items::<u64>(&arr), vec![10, 20, 30]);

        ext.array_add(&mut arr, 15u64, Some(1)).unwrap();
        assert_eq!(ext.array_items::<u64>(&arr), vec![10, 15, 20, 30]);

        ext.array_del::<u64>(&mut arr, 0).unwrap();
        assert_eq!(ext.array_items::<u64>(&arr), vec![15, 20, 30]);
        assert!(ext.wasted() > 0);
    }

    #[test]
    fn test_array_del_last_frees_block() {
        let (_dir, mut ext) = fresh();
        let mut arr = OffArray::EMPTY;
        ext.array_add(&mut arr, 1u64, None).unwrap();
        ext.array_del::<u64>(&mut arr, 0).unwrap();
        assert_eq!(arr.off, OFF_NULL);
        assert_eq!(arr.count, 0);
    }

    #[test]
    fn test_relocation_keeps_items() {
        let (_dir, mut ext) = fresh();
        let mut arr = OffArray::EMPTY;
        // u32 items: two fit an aligned span, the third forces relocation or
        // in-place growth depending on slack; items must survive either way.
        for v in 0u32..20 {
            ext.array_add(&mut arr, v, None).unwrap();
        }
        assert_eq!(ext.array_items::<u32>(&arr), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_defrag_threshold() {
        let (_dir, mut ext) = fresh();
        assert!(!ext.defrag_needed());
        let mut arr = OffArray::EMPTY;
        for v in 0u64..64 {
            ext.array_add(&mut arr, v, None).unwrap();
        }
        for _ in 0..63 {
            ext.array_del::<u64>(&mut arr, 0).unwrap();
        }
        // Nearly everything allocated is waste now.
        assert!(ext.defrag_needed());
    }
}
