//! Software double of the VideoCore firmware and V3D block.
//!
//! [`SimFirmware`] implements [`lqpu_core::Firmware`] over simulated SDRAM,
//! a bump-allocated GPU heap and a reactive register window, so whole
//! sessions can run on any host. It records every firmware call, can be
//! told to fail any acquisition step, and runs a pluggable [`Kernel`] in
//! place of QPU machine code.

/// Pluggable per-unit programs and their view of memory.
pub mod kernel;

/// Simulated SDRAM and the GPU heap.
pub mod memory;

/// The simulated V3D register window.
pub mod registers;

pub use kernel::{Completion, Kernel, UnitContext};
pub use memory::{DEFAULT_MEMORY_BYTES, GpuBlock};
pub use registers::SimRegisters;

use kernel::halt;
use lqpu_common::firmware::MEM_FLAG_L1_NONALLOCATING;
use lqpu_common::mmio::{DEFAULT_PERI_ADDR, DEFAULT_PERI_SIZE};
use lqpu_common::records::DispatchMessage;
use lqpu_common::status;
use lqpu_core::{Discovery, Firmware, HostInfo, MemHandle, SessionConfig, Strategy};
use log::debug;
use memory::{GpuHeap, SimMemory, bus_to_phys};
use registers::V3dState;
use std::cell::RefCell;
use std::collections::HashSet;
use std::ptr::NonNull;
use std::rc::Rc;
use std::time::Duration;

/// Channel identifier reported by the simulator.
pub const SIM_CHANNEL: u32 = 0x51;

/// A firmware or mapping call as observed by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareCall {
    Claim,
    Unclaim,
    Enable(bool),
    MemAlloc { size: u32, align: u32, flags: u32 },
    MemLock(u32),
    MemUnlock(u32),
    MemFree(u32),
    ExecuteQpu { num: u32, control: u32, noflush: bool, timeout_ms: u32 },
    MapRegisters { phys: u32, size: u32 },
    UnmapRegisters,
    MapMemory { phys: u32, size: u32 },
    UnmapMemory { phys: u32, size: u32 },
}

/// Steps that can be made to fail.
///
/// The first six are acquisition steps. The last three make the matching
/// release call report failure while leaving the resource held, as a
/// misbehaving firmware would.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Claim,
    Enable,
    MemAlloc,
    MapRegisters,
    MemLock,
    MapMemory,
    MemUnlock,
    MemFree,
    Disable,
}

impl FaultPoint {
    /// Every acquisition fault point, in acquisition order.
    pub const ALL: [FaultPoint; 6] = [
        FaultPoint::Claim,
        FaultPoint::Enable,
        FaultPoint::MemAlloc,
        FaultPoint::MapRegisters,
        FaultPoint::MemLock,
        FaultPoint::MapMemory,
    ];
}

pub(crate) struct SimState {
    pub(crate) memory: SimMemory,
    pub(crate) kernel: Kernel,
    pub(crate) v3d: V3dState,
    heap: GpuHeap,
    calls: Vec<FirmwareCall>,
    faults: HashSet<FaultPoint>,
    claimed: bool,
    enabled: bool,
    info: HostInfo,
}

/// The simulated firmware channel.
///
/// Clones share one simulated machine, so a test can keep a clone for
/// inspection while a session owns another.
#[derive(Clone)]
pub struct SimFirmware {
    state: Rc<RefCell<SimState>>,
}

impl Default for SimFirmware {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_BYTES)
    }
}

impl SimFirmware {
    /// A machine with `memory_bytes` of SDRAM and first-generation memory
    /// map parameters.
    pub fn new(memory_bytes: usize) -> Self {
        let memory = SimMemory::new(memory_bytes);
        let heap = GpuHeap::new(memory.len());
        Self {
            state: Rc::new(RefCell::new(SimState {
                memory,
                kernel: halt(),
                v3d: V3dState::default(),
                heap,
                calls: Vec::new(),
                faults: HashSet::new(),
                claimed: false,
                enabled: false,
                info: HostInfo {
                    mem_flags: MEM_FLAG_L1_NONALLOCATING,
                    mem_map: 0,
                    peri_addr: DEFAULT_PERI_ADDR,
                    peri_size: DEFAULT_PERI_SIZE,
                },
            })),
        }
    }

    /// The memory map this machine accepts.
    pub fn host_info(&self) -> HostInfo {
        self.state.borrow().info
    }

    /// Session configuration that skips library probing and uses
    /// [`SimFirmware::host_info`].
    pub fn session_config(&self, strategy: Strategy) -> SessionConfig {
        SessionConfig {
            discovery: Discovery::Fixed(self.host_info()),
            strategy,
            use_l2_cache: true,
        }
    }

    /// Replaces the program run by every started unit.
    pub fn set_kernel(&self, kernel: impl FnMut(&mut UnitContext<'_>) -> Completion + 'static) {
        self.state.borrow_mut().kernel = Box::new(kernel);
    }

    /// Makes `point` fail from now on.
    pub fn fail(&self, point: FaultPoint) {
        self.state.borrow_mut().faults.insert(point);
    }

    pub fn clear_faults(&self) {
        self.state.borrow_mut().faults.clear();
    }

    /// Every call seen so far, in order.
    pub fn calls(&self) -> Vec<FirmwareCall> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn is_claimed(&self) -> bool {
        self.state.borrow().claimed
    }

    pub fn is_enabled(&self) -> bool {
        self.state.borrow().enabled
    }

    /// Allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.state.borrow().heap.live()
    }

    /// The block behind `handle`, if it is still allocated.
    pub fn block(&self, handle: MemHandle) -> Option<GpuBlock> {
        self.state.borrow().heap.get(handle.get()).copied()
    }

    /// Reads a word of simulated memory by bus address.
    pub fn read_bus(&self, bus: u32) -> Option<u32> {
        self.state.borrow().memory.read_u32(bus_to_phys(bus))
    }

    fn record(&self, call: FirmwareCall) {
        self.state.borrow_mut().calls.push(call);
    }

    fn faulted(&self, point: FaultPoint) -> bool {
        let failed = self.state.borrow().faults.contains(&point);
        if failed {
            debug!("simulated fault at {point:?}");
        }
        failed
    }

    fn read_messages(&self, control: u32, num: u32) -> Option<Vec<DispatchMessage>> {
        let state = self.state.borrow();
        (0..num)
            .map(|i| {
                let at = bus_to_phys(control) + i * DispatchMessage::SIZE as u32;
                Some(DispatchMessage {
                    uniforms_bus: state.memory.read_u32(at)?,
                    code_bus: state.memory.read_u32(at + 4)?,
                })
            })
            .collect()
    }
}

impl Firmware for SimFirmware {
    type Registers = SimRegisters;

    fn channel_id(&self) -> u32 {
        SIM_CHANNEL
    }

    fn claim(&self) -> bool {
        self.record(FirmwareCall::Claim);
        if self.faulted(FaultPoint::Claim) {
            return false;
        }
        let mut state = self.state.borrow_mut();
        if state.claimed {
            return false;
        }
        state.claimed = true;
        true
    }

    fn unclaim(&self) {
        self.record(FirmwareCall::Unclaim);
        self.state.borrow_mut().claimed = false;
    }

    fn set_qpu_enabled(&self, enable: bool) -> bool {
        self.record(FirmwareCall::Enable(enable));
        let point = if enable {
            FaultPoint::Enable
        } else {
            FaultPoint::Disable
        };
        if self.faulted(point) {
            return false;
        }
        self.state.borrow_mut().enabled = enable;
        true
    }

    fn mem_alloc(&self, size: u32, align: u32, flags: u32) -> Option<MemHandle> {
        self.record(FirmwareCall::MemAlloc { size, align, flags });
        if self.faulted(FaultPoint::MemAlloc) {
            return None;
        }
        let handle = self.state.borrow_mut().heap.alloc(size, align, flags)?;
        MemHandle::new(handle)
    }

    fn mem_lock(&self, handle: MemHandle) -> Option<u32> {
        self.record(FirmwareCall::MemLock(handle.get()));
        if self.faulted(FaultPoint::MemLock) {
            return None;
        }
        self.state.borrow_mut().heap.lock(handle.get())
    }

    fn mem_unlock(&self, handle: MemHandle) -> bool {
        self.record(FirmwareCall::MemUnlock(handle.get()));
        if self.faulted(FaultPoint::MemUnlock) {
            return false;
        }
        self.state.borrow_mut().heap.unlock(handle.get())
    }

    fn mem_free(&self, handle: MemHandle) -> bool {
        self.record(FirmwareCall::MemFree(handle.get()));
        if self.faulted(FaultPoint::MemFree) {
            return false;
        }
        self.state.borrow_mut().heap.free(handle.get())
    }

    fn execute_qpu(&self, num: u32, control: u32, noflush: bool, timeout_ms: u32) -> u32 {
        self.record(FirmwareCall::ExecuteQpu {
            num,
            control,
            noflush,
            timeout_ms,
        });
        if !self.is_enabled() {
            return status::TIMEOUT;
        }
        let Some(messages) = self.read_messages(control, num) else {
            return status::TIMEOUT;
        };

        let mut hung = false;
        {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            for (unit, msg) in messages.iter().enumerate() {
                let mut ctx =
                    UnitContext::new(unit as u32, msg.uniforms_bus, msg.code_bus, &state.memory);
                if (state.kernel)(&mut ctx) == Completion::Never {
                    hung = true;
                }
            }
        }

        if hung {
            std::thread::sleep(Duration::from_millis(timeout_ms as u64));
            return status::TIMEOUT;
        }
        status::SUCCESS
    }

    fn map_registers(&self, phys: u32, size: u32) -> Option<SimRegisters> {
        self.record(FirmwareCall::MapRegisters { phys, size });
        let info = self.host_info();
        if self.faulted(FaultPoint::MapRegisters) || phys != info.peri_addr || size == 0 {
            return None;
        }
        Some(SimRegisters::new(Rc::clone(&self.state)))
    }

    fn unmap_registers(&self, registers: &mut SimRegisters) {
        self.record(FirmwareCall::UnmapRegisters);
        registers.unmap();
    }

    fn map_memory(&self, phys: u32, size: u32) -> Option<NonNull<u8>> {
        self.record(FirmwareCall::MapMemory { phys, size });
        if self.faulted(FaultPoint::MapMemory) {
            return None;
        }
        self.state.borrow().memory.host_ptr(phys, size as usize)
    }

    unsafe fn unmap_memory(&self, ptr: NonNull<u8>, size: u32) {
        let phys = self.state.borrow().memory.phys_of(ptr).unwrap_or(u32::MAX);
        self.record(FirmwareCall::UnmapMemory { phys, size });
    }
}
