//! Simulated SDRAM and the firmware's GPU heap.
//!
//! [`SimMemory`] is a zeroed, page-aligned host buffer standing in for the
//! VideoCore's physical memory, with physical address 0 at its first byte.
//! [`GpuHeap`] hands out blocks of it with a bump pointer, the way the
//! firmware's relocatable heap does for locked allocations.

use lqpu_common::firmware::{MEM_FLAG_COHERENT, MEM_FLAG_DIRECT};
use lqpu_common::mmio::{BUS_ALIAS_MASK, PAGE_SIZE};
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::collections::BTreeMap;
use std::ptr::NonNull;

/// Default amount of simulated SDRAM.
pub const DEFAULT_MEMORY_BYTES: usize = 8 << 20;

/// Zeroed backing store addressed by physical offset.
pub struct SimMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl SimMemory {
    /// Allocates `len` bytes, rounded up to whole pages.
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero or too large for a page-aligned layout.
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "simulated memory must not be empty");
        let layout = Layout::from_size_align(len, PAGE_SIZE as usize)
            .expect("simulated memory layout")
            .pad_to_align();
        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };
        Self { ptr, layout }
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Host pointer to physical address `phys`, if `len` bytes fit there.
    pub fn host_ptr(&self, phys: u32, len: usize) -> Option<NonNull<u8>> {
        let start = phys as usize;
        if start.checked_add(len)? > self.len() {
            return None;
        }
        // SAFETY: `start` is inside the allocation.
        Some(unsafe { self.ptr.add(start) })
    }

    /// Physical offset of a host pointer into this memory.
    pub fn phys_of(&self, ptr: NonNull<u8>) -> Option<u32> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.ptr.as_ptr() as usize)?;
        (offset < self.len()).then_some(offset as u32)
    }

    /// Reads a little-endian word at physical address `phys`.
    pub fn read_u32(&self, phys: u32) -> Option<u32> {
        let ptr = self.host_ptr(phys, 4)?;
        let mut word = [0u8; 4];
        // SAFETY: four bytes at `ptr` are inside the allocation.
        unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), word.as_mut_ptr(), 4) };
        Some(u32::from_le_bytes(word))
    }

    /// Writes a little-endian word at physical address `phys`.
    pub fn write_u32(&self, phys: u32, value: u32) -> bool {
        let Some(ptr) = self.host_ptr(phys, 4) else {
            return false;
        };
        // SAFETY: four bytes at `ptr` are inside the allocation.
        unsafe { std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), ptr.as_ptr(), 4) };
        true
    }
}

impl Drop for SimMemory {
    fn drop(&mut self) {
        // SAFETY: `ptr` was allocated with exactly `layout`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Alias bits the firmware reports for an allocation made with `flags`.
pub fn bus_alias(flags: u32) -> u32 {
    match flags & (MEM_FLAG_DIRECT | MEM_FLAG_COHERENT) {
        f if f == MEM_FLAG_DIRECT | MEM_FLAG_COHERENT => 0x4000_0000,
        MEM_FLAG_DIRECT => 0xC000_0000,
        MEM_FLAG_COHERENT => 0x8000_0000,
        _ => 0,
    }
}

/// Strips the alias bits from a bus address.
pub fn bus_to_phys(bus: u32) -> u32 {
    bus & !BUS_ALIAS_MASK
}

/// One firmware allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuBlock {
    pub phys: u32,
    pub size: u32,
    pub flags: u32,
    pub locked: bool,
}

impl GpuBlock {
    pub fn bus(&self) -> u32 {
        self.phys | bus_alias(self.flags)
    }
}

/// Bump allocator over the simulated SDRAM.
///
/// Blocks are carved from a single advancing offset and never reused
/// individually; the offset rewinds once every block has been freed.
#[derive(Debug)]
pub struct GpuHeap {
    len: usize,
    offset: usize,
    next_handle: u32,
    blocks: BTreeMap<u32, GpuBlock>,
}

impl GpuHeap {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            offset: 0,
            next_handle: 1,
            blocks: BTreeMap::new(),
        }
    }

    /// Reserves `size` bytes at an `align`-byte boundary.
    pub fn alloc(&mut self, size: u32, align: u32, flags: u32) -> Option<u32> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }
        let align = align as usize;
        let start = (self.offset + align - 1) & !(align - 1);
        let end = start.checked_add(size as usize)?;
        if end > self.len {
            return None;
        }
        self.offset = end;

        let handle = self.next_handle;
        self.next_handle += 1;
        self.blocks.insert(
            handle,
            GpuBlock {
                phys: start as u32,
                size,
                flags,
                locked: false,
            },
        );
        Some(handle)
    }

    pub fn lock(&mut self, handle: u32) -> Option<u32> {
        let block = self.blocks.get_mut(&handle)?;
        block.locked = true;
        Some(block.bus())
    }

    pub fn unlock(&mut self, handle: u32) -> bool {
        match self.blocks.get_mut(&handle) {
            Some(block) if block.locked => {
                block.locked = false;
                true
            }
            _ => false,
        }
    }

    /// Frees an unlocked block.
    pub fn free(&mut self, handle: u32) -> bool {
        match self.blocks.get(&handle) {
            Some(block) if !block.locked => {
                self.blocks.remove(&handle);
                if self.blocks.is_empty() {
                    self.offset = 0;
                }
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, handle: u32) -> Option<&GpuBlock> {
        self.blocks.get(&handle)
    }

    /// Number of blocks not yet freed.
    pub fn live(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_aligns_and_rewinds() {
        let mut heap = GpuHeap::new(64 * 1024);
        let a = heap.alloc(100, 4096, 0xC).unwrap();
        let b = heap.alloc(100, 4096, 0xC).unwrap();
        assert_eq!(heap.get(a).unwrap().phys, 0);
        assert_eq!(heap.get(b).unwrap().phys, 4096);

        assert_eq!(heap.lock(a), Some(0x4000_0000));
        assert!(!heap.free(a), "locked blocks cannot be freed");
        assert!(heap.unlock(a));
        assert!(heap.free(a));
        assert!(heap.free(b));
        assert_eq!(heap.live(), 0);
        let c = heap.alloc(8, 4096, 0x4).unwrap();
        assert_eq!(heap.get(c).unwrap().phys, 0);
    }

    #[test]
    fn heap_refuses_oversized_requests() {
        let mut heap = GpuHeap::new(8192);
        assert!(heap.alloc(8193, 4096, 0xC).is_none());
        assert!(heap.alloc(0, 4096, 0xC).is_none());
    }

    #[test]
    fn memory_words_are_little_endian() {
        let mem = SimMemory::new(4096);
        assert!(mem.write_u32(8, 0x1122_3344));
        let ptr = mem.host_ptr(8, 4).unwrap();
        // SAFETY: in bounds of `mem`.
        assert_eq!(unsafe { *ptr.as_ptr() }, 0x44);
        assert_eq!(mem.read_u32(8), Some(0x1122_3344));
        assert_eq!(mem.read_u32(4094), None);
        assert_eq!(mem.phys_of(ptr), Some(8));
    }

    #[test]
    fn alias_follows_cache_flags() {
        assert_eq!(bus_alias(0xC), 0x4000_0000);
        assert_eq!(bus_alias(0x4), 0xC000_0000);
        assert_eq!(bus_to_phys(0xC000_1000), 0x1000);
    }
}
