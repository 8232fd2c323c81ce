//! The shared region and the session that owns it.
//!
//! A [`SharedRegion`] is one physically contiguous GPU allocation, locked
//! and mapped into the host, together with the mapped V3D register window
//! and ownership of the accelerator. Acquiring it powers the QPUs on;
//! dropping it powers them off again, after every mapping is gone.

use crate::address::{DualAddress, RegionCursor};
use crate::error::{LqpuError, Result};
use crate::exec::{ExecTarget, Executor};
use crate::firmware::{Firmware, MemHandle, RegisterIo};
use crate::platform::{Discovery, HostInfo};
use core::cell::Cell;
use core::ptr::NonNull;
use core::slice;
use lqpu_common::mmio::PAGE_SIZE;
use lqpu_common::records::{DispatchMessage, RegionHeader, checked_align_up};
use log::{debug, error, info};

pub use crate::exec::Strategy;

/// Everything a session is configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How the board's memory map is found.
    pub discovery: Discovery,
    /// How batches are submitted and awaited.
    pub strategy: Strategy,
    /// Allocate through the VideoCore L2 where the board allows it.
    pub use_l2_cache: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            discovery: Discovery::default(),
            strategy: Strategy::default(),
            use_l2_cache: true,
        }
    }
}

/// One session's shared memory, register window and accelerator claim.
///
/// The region is exclusively owned and neither `Clone` nor `Send`; host
/// pointers into it die with it. Its payload is laid out exactly once,
/// through the single cursor [`SharedRegion::payload_cursor`] hands out.
pub struct SharedRegion<F: Firmware> {
    firmware: F,
    info: HostInfo,
    executor: Box<dyn Executor>,
    registers: F::Registers,
    handle: MemHandle,
    size: u32,
    base: DualAddress,
    laid_out: Cell<bool>,
}

impl<F: Firmware> SharedRegion<F> {
    /// Acquires a region with at least `size` payload bytes.
    ///
    /// Steps run in order, each only if the previous one succeeded:
    /// discovery, claim, enable, allocate, map registers, lock, map memory.
    /// A failure undoes every completed step before the error is returned.
    /// Undo steps the firmware refuses are logged; the original error is
    /// still the one returned.
    ///
    /// # Arguments
    ///
    /// * `firmware` - Channel the session talks through; owned by the region
    /// * `config` - Discovery, strategy and cache policy
    /// * `size` - Payload bytes wanted past the header
    ///
    /// # Errors
    ///
    /// [`LqpuError::EmptyRequest`] for a zero size and
    /// [`LqpuError::OutOfMemory`] for one whose page-rounded total does not
    /// fit the firmware's 32-bit size, both before any firmware call.
    /// Otherwise the error of the first step that failed.
    pub fn allocate(firmware: F, config: &SessionConfig, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(LqpuError::EmptyRequest);
        }
        let total = size
            .checked_add(RegionHeader::SPAN)
            .and_then(|n| checked_align_up(n, PAGE_SIZE as usize))
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(LqpuError::OutOfMemory)?;

        let info = HostInfo::discover(&config.discovery, config.use_l2_cache)?;

        if !firmware.claim() {
            error!("accelerator already claimed on channel {}", firmware.channel_id());
            return Err(LqpuError::AlreadyClaimed);
        }
        debug!("claimed channel {}", firmware.channel_id());

        if !firmware.set_qpu_enabled(true) {
            error!("qpu_enable refused");
            firmware.unclaim();
            return Err(LqpuError::EnableFailed);
        }
        debug!("QPUs enabled");

        let Some(handle) = firmware.mem_alloc(total, PAGE_SIZE, info.mem_flags) else {
            error!("mem_alloc of {total} bytes with flags {:#x} failed", info.mem_flags);
            disable(&firmware);
            firmware.unclaim();
            return Err(LqpuError::OutOfMemory);
        };
        debug!("allocated {total} bytes as handle {}", handle.get());

        let Some(mut registers) = firmware.map_registers(info.peri_addr, info.peri_size) else {
            error!(
                "mapping peripherals at {:#010x}+{:#x} failed",
                info.peri_addr, info.peri_size
            );
            free(&firmware, handle);
            disable(&firmware);
            firmware.unclaim();
            return Err(LqpuError::PeripheralMapFailed);
        };
        debug!("mapped peripherals at {:#010x}", info.peri_addr);

        let Some(bus) = firmware.mem_lock(handle) else {
            error!("mem_lock of handle {} failed", handle.get());
            firmware.unmap_registers(&mut registers);
            free(&firmware, handle);
            disable(&firmware);
            firmware.unclaim();
            return Err(LqpuError::LockFailed(handle.get()));
        };
        debug!("locked handle {} at bus {bus:#010x}", handle.get());

        let phys = info.bus_to_phys(bus);
        let Some(host) = firmware.map_memory(phys, total) else {
            error!("mapping shared memory at {phys:#010x} failed");
            unlock(&firmware, handle);
            firmware.unmap_registers(&mut registers);
            free(&firmware, handle);
            disable(&firmware);
            firmware.unclaim();
            return Err(LqpuError::RegionMapFailed(phys));
        };

        let region = Self {
            executor: config.strategy.executor(),
            firmware,
            info,
            registers,
            handle,
            size: total,
            base: DualAddress::new(bus, host),
            laid_out: Cell::new(false),
        };
        region.write_header();

        info!(
            "shared region: {total} bytes at bus {bus:#010x} (phys {phys:#010x}), strategy {:?}",
            config.strategy
        );
        Ok(region)
    }

    fn write_header(&self) {
        let header = RegionHeader {
            peri_ptr: self.registers.host_address() as u64,
            peri_size: self.info.peri_size,
            channel: self.firmware.channel_id(),
            handle: self.handle.get(),
            size: self.size,
            bus_base: self.base.bus,
        };
        // SAFETY: the mapping is at least one page, larger than the header,
        // and nothing else references its first bytes yet.
        let out =
            unsafe { slice::from_raw_parts_mut(self.base.host.as_ptr(), RegionHeader::SIZE) };
        out.copy_from_slice(&header.to_bytes());
    }

    /// Reads back the header at the start of the region.
    pub fn header(&self) -> RegionHeader {
        let mut raw = [0u8; RegionHeader::SIZE];
        raw.copy_from_slice(&self.bytes()[..RegionHeader::SIZE]);
        RegionHeader::from_bytes(&raw)
    }

    /// The cursor over the payload, starting past the header.
    ///
    /// Handed out once per region, so no two layouts can carve the same
    /// bytes.
    ///
    /// # Errors
    ///
    /// [`LqpuError::AlreadyLaidOut`] on every call after the first.
    pub fn payload_cursor(&self) -> Result<RegionCursor<'_>> {
        if self.laid_out.replace(true) {
            return Err(LqpuError::AlreadyLaidOut);
        }
        Ok(RegionCursor::new(self.base, RegionHeader::SPAN, self.size as usize))
    }

    /// Runs one batch from the message array at `messages_bus`.
    ///
    /// Output written by the programs is visible to the host only once this
    /// returns `Ok`.
    pub fn execute(&self, messages_bus: u32, units: u32) -> Result<()> {
        self.executor.execute(self, messages_bus, units)
    }

    /// Base of the region in both address spaces.
    pub fn base(&self) -> DualAddress {
        self.base
    }

    /// Total mapped bytes, header included.
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Payload bytes available past the header.
    pub fn payload_size(&self) -> usize {
        self.size as usize - RegionHeader::SPAN
    }

    /// Firmware handle of the allocation, locked for the region's lifetime.
    pub fn handle(&self) -> MemHandle {
        self.handle
    }

    /// The memory map discovery settled on.
    pub fn host_info(&self) -> &HostInfo {
        &self.info
    }

    /// The mapped V3D register window, e.g. for performance counters.
    pub fn registers(&self) -> &F::Registers {
        &self.registers
    }

    /// The firmware channel the session owns.
    pub fn firmware(&self) -> &F {
        &self.firmware
    }

    /// Host view of the bytes at bus address `bus`.
    pub fn host_ptr(&self, bus: u32) -> Result<NonNull<u8>> {
        let offset = self.offset_of(bus, 1)?;
        // SAFETY: `offset_of` checked that the byte lies inside the mapping.
        Ok(unsafe { self.base.host.add(offset) })
    }

    fn offset_of(&self, bus: u32, len: usize) -> Result<usize> {
        let offset = bus.wrapping_sub(self.base.bus) as usize;
        let end = offset.checked_add(len);
        if bus < self.base.bus || end.is_none_or(|end| end > self.size as usize) {
            return Err(LqpuError::OutsideRegion(bus));
        }
        Ok(offset)
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: `base.host` maps `size` bytes for as long as `self` lives.
        unsafe { slice::from_raw_parts(self.base.host.as_ptr(), self.size as usize) }
    }

    /// Tears the session down. Equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }
}

impl<F: Firmware> ExecTarget for SharedRegion<F> {
    fn registers(&self) -> &dyn RegisterIo {
        &self.registers
    }

    fn execute_qpu(&self, num: u32, control: u32, noflush: bool, timeout_ms: u32) -> u32 {
        self.firmware.execute_qpu(num, control, noflush, timeout_ms)
    }

    fn dispatch_messages(&self, bus: u32, count: u32) -> Result<Vec<DispatchMessage>> {
        let len = (count as usize)
            .checked_mul(DispatchMessage::SIZE)
            .ok_or(LqpuError::OutsideRegion(bus))?;
        let start = self.offset_of(bus, len)?;
        Ok(self.bytes()[start..start + len]
            .chunks_exact(DispatchMessage::SIZE)
            .map(|raw| {
                let mut msg = [0u8; DispatchMessage::SIZE];
                msg.copy_from_slice(raw);
                DispatchMessage::from_bytes(&msg)
            })
            .collect())
    }
}

impl<F: Firmware> Drop for SharedRegion<F> {
    fn drop(&mut self) {
        self.firmware.unmap_registers(&mut self.registers);
        // SAFETY: `base.host` and `size` are exactly what `map_memory`
        // returned, and no borrow of the region can outlive `self`.
        unsafe { self.firmware.unmap_memory(self.base.host, self.size) };
        unlock(&self.firmware, self.handle);
        free(&self.firmware, self.handle);
        disable(&self.firmware);
        self.firmware.unclaim();
        info!("released shared region at bus {:#010x}", self.base.bus);
    }
}

fn unlock<F: Firmware>(firmware: &F, handle: MemHandle) {
    if !firmware.mem_unlock(handle) {
        error!("mem_unlock of handle {} failed", handle.get());
    }
}

fn free<F: Firmware>(firmware: &F, handle: MemHandle) {
    if !firmware.mem_free(handle) {
        error!("mem_free of handle {} failed", handle.get());
    }
}

fn disable<F: Firmware>(firmware: &F) {
    if !firmware.set_qpu_enabled(false) {
        error!("qpu_disable refused; the V3D block stays powered");
    }
}

impl<F: Firmware> core::fmt::Debug for SharedRegion<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("info", &self.info)
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}
