//! Paired host/accelerator addressing.
//!
//! Every block carved out of the shared region is known by two addresses:
//! the bus address the QPUs use and the host pointer the ARM uses. Both move
//! together; nothing in the layer computes one from the other except through
//! the region's base pair.

use crate::error::{LqpuError, Result};
use core::marker::PhantomData;
use core::ptr::NonNull;

/// The same physical bytes as seen by the accelerator and by the host.
///
/// The host pointer is only valid while the owning region is mapped. The bus
/// address still carries its cache-routing alias bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualAddress {
    /// Address used by the VideoCore memory subsystem.
    pub bus: u32,
    /// Address of the same bytes in the host's virtual address space.
    pub host: NonNull<u8>,
}

impl DualAddress {
    /// Pairs a bus address with the host pointer mapping the same byte.
    pub fn new(bus: u32, host: NonNull<u8>) -> Self {
        Self { bus, host }
    }

    /// Returns the pair `bytes` further into the same mapping.
    ///
    /// The caller guarantees the result stays inside the mapping, which is
    /// what [`RegionCursor`] checks before handing out addresses.
    pub(crate) fn offset(self, bytes: usize) -> Self {
        Self {
            bus: self.bus.wrapping_add(bytes as u32),
            // SAFETY: callers only offset within the mapped region, so the
            // result stays inside the same allocation and cannot be null.
            host: unsafe { self.host.add(bytes) },
        }
    }
}

/// A bump cursor over the payload area of a shared region.
///
/// Advancing the cursor carves out a block and returns the block's starting
/// pair, so the bus address recorded for the accelerator always matches the
/// host pointer the layout writes through. The lifetime ties the cursor to
/// the region it was taken from.
#[derive(Debug)]
pub struct RegionCursor<'r> {
    base: DualAddress,
    next: usize,
    len: usize,
    _region: PhantomData<&'r ()>,
}

impl<'r> RegionCursor<'r> {
    /// Creates a cursor at `start` bytes into a mapping of `len` bytes.
    pub(crate) fn new(base: DualAddress, start: usize, len: usize) -> Self {
        Self {
            base,
            next: start.min(len),
            len,
            _region: PhantomData,
        }
    }

    /// Carves out `bytes` bytes and returns where they start.
    pub fn advance(&mut self, bytes: usize) -> Result<DualAddress> {
        let remaining = self.remaining();
        if bytes > remaining {
            return Err(LqpuError::RegionExhausted {
                requested: bytes,
                remaining,
            });
        }
        let block = self.base.offset(self.next);
        self.next += bytes;
        Ok(block)
    }

    /// Offset of the next free byte from the start of the region.
    pub fn offset(&self) -> usize {
        self.next
    }

    /// Bytes still available to carve out.
    pub fn remaining(&self) -> usize {
        self.len - self.next
    }

    /// The region's base pair.
    pub fn base(&self) -> DualAddress {
        self.base
    }
}
