//! The firmware RPC channel.
//!
//! Everything the dispatch layer asks of the VideoCore firmware, and the
//! host mappings it needs, goes through [`Firmware`]. The Linux property
//! mailbox implements it in [`crate::mailbox`]; a software double lives in
//! the `lqpu_sim` crate.

use core::num::NonZeroU32;
use core::ptr::NonNull;

/// A firmware GPU-memory allocation handle. Zero is never a valid handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle(NonZeroU32);

impl MemHandle {
    /// Wraps a raw handle, returning `None` for the firmware's failure value.
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// The raw value passed back to the firmware's lock, unlock and free.
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// 32-bit access to a mapped peripheral register window.
///
/// Offsets are byte offsets from the window base. Implementations perform
/// volatile accesses; reads may have side effects on real hardware.
pub trait RegisterIo {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);

    /// Host virtual address of the window base, for the region header.
    fn host_address(&self) -> usize {
        0
    }
}

/// Operations of the firmware property channel plus the host mappings.
///
/// All methods report failure the way the firmware does, as a sentinel
/// (`None`, `false` or a non-zero status); [`crate::region::SharedRegion`]
/// turns those into [`crate::LqpuError`] values and performs rollback.
pub trait Firmware {
    /// Handle to a mapped register window.
    type Registers: RegisterIo;

    /// Identifier of the channel, recorded in the region header.
    fn channel_id(&self) -> u32;

    /// Takes exclusive ownership of the accelerator.
    ///
    /// Returns `false` if another session already holds it.
    fn claim(&self) -> bool;

    /// Gives up ownership taken by [`Firmware::claim`].
    fn unclaim(&self);

    /// Powers the V3D block on or off. Returns `false` on refusal.
    fn set_qpu_enabled(&self, enable: bool) -> bool;

    /// Allocates `size` bytes of contiguous GPU memory.
    fn mem_alloc(&self, size: u32, align: u32, flags: u32) -> Option<MemHandle>;

    /// Locks an allocation in place and returns its bus address.
    fn mem_lock(&self, handle: MemHandle) -> Option<u32>;

    fn mem_unlock(&self, handle: MemHandle) -> bool;

    fn mem_free(&self, handle: MemHandle) -> bool;

    /// Runs `num` QPU programs described by the dispatch-message array at
    /// bus address `control` and returns the raw firmware status.
    fn execute_qpu(&self, num: u32, control: u32, noflush: bool, timeout_ms: u32) -> u32;

    /// Maps the register window at physical address `phys`.
    fn map_registers(&self, phys: u32, size: u32) -> Option<Self::Registers>;

    /// Unmaps a register window. The handle must not be used afterwards.
    fn unmap_registers(&self, registers: &mut Self::Registers);

    /// Maps `size` bytes of physical memory at `phys` into the host.
    fn map_memory(&self, phys: u32, size: u32) -> Option<NonNull<u8>>;

    /// Removes a mapping created by [`Firmware::map_memory`].
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must come from a single successful `map_memory`
    /// call on this channel, and no reference into the mapping may outlive
    /// the call.
    unsafe fn unmap_memory(&self, ptr: NonNull<u8>, size: u32);
}
