//! Common definitions shared by the QPU dispatch layer, its simulator and
//! the host tools.
//!
//! This crate carries the VideoCore IV memory map defaults, the V3D register
//! offsets used for direct submission and performance counters, the
//! firmware mailbox property tags, the packed binary records that the QPU
//! microcode reads from shared memory, and the fixed status codes reported
//! by the dispatch layer.

#![cfg_attr(not(test), no_std)]

/// Packed binary record layouts read directly by the accelerator.
///
/// Dispatch messages and the shared-region header are encoded byte by byte
/// at fixed offsets so the layout never depends on compiler padding rules.
pub mod records;

/// Fixed status codes and their human-readable descriptions.
pub mod status;

/// Memory map of the ARM host as seen through `/dev/mem` and the firmware.
///
/// These constants describe the first hardware generation (BCM2835). Later
/// generations report different values through the vendor host library and
/// override them during platform discovery.
pub mod mmio {
    /// Default physical base of the peripheral register window.
    ///
    /// Used when the vendor host library is unavailable or does not export
    /// `bcm_host_get_peripheral_address`.
    pub const DEFAULT_PERI_ADDR: u32 = 0x2000_0000;

    /// Default byte size of the peripheral register window (16 MiB).
    pub const DEFAULT_PERI_SIZE: u32 = 0x0100_0000;

    /// SDRAM bus address reported by first-generation hardware.
    ///
    /// Any other value means the host cannot see the VideoCore L2 cache and
    /// shared memory must be allocated uncached.
    pub const GEN1_SDRAM_ADDR: u32 = 0x4000_0000;

    /// Physical offset applied on first-generation hardware when the L2
    /// cache is bypassed.
    pub const GEN1_UNCACHED_MAP: u32 = 0x2000_0000;

    /// Cache-routing alias bits carried in the top of every bus address.
    ///
    /// Cleared before a bus address is interpreted as a physical address.
    pub const BUS_ALIAS_MASK: u32 = 0xC000_0000;

    /// Host page size used for `/dev/mem` mappings and GPU allocations.
    pub const PAGE_SIZE: u32 = 0x1000;

    /// Maximum number of QPUs that can be queued at once.
    ///
    /// The completion counter in SRQCS is eight bits wide, but the V3D block
    /// only ever instantiates sixteen QPUs.
    pub const MAX_QPUS: u32 = 16;
}

/// V3D register byte offsets relative to the peripheral window base.
pub mod v3d {
    /// L2 cache control.
    pub const L2CACTL: usize = 0xC0_0020;
    /// Slices cache control.
    pub const SLCACTL: usize = 0xC0_0024;
    /// QPU user program request program address.
    pub const SRQPC: usize = 0xC0_0430;
    /// QPU user program request uniforms address.
    pub const SRQUA: usize = 0xC0_0434;
    /// QPU user program request control and status.
    pub const SRQCS: usize = 0xC0_043C;
    /// Performance counter clear.
    pub const PCTRC: usize = 0xC0_0670;
    /// Performance counter enables.
    pub const PCTRE: usize = 0xC0_0674;
    /// Debug configuration.
    pub const DBCFG: usize = 0xC0_0E00;
    /// QPU interrupt enables.
    pub const DBQITE: usize = 0xC0_0E2C;
    /// QPU interrupt control.
    pub const DBQITC: usize = 0xC0_0E30;

    /// Number of performance counter slots.
    pub const PERF_COUNTERS: usize = 16;

    /// Count register of performance counter slot `n`.
    pub const fn pctr(n: usize) -> usize {
        0xC0_0680 + 8 * n
    }

    /// Source-select register of performance counter slot `n`.
    pub const fn pctrs(n: usize) -> usize {
        0xC0_0684 + 8 * n
    }

    /// L2CACTL bit that clears the L2 cache.
    pub const L2CACTL_CLEAR: u32 = 1 << 2;

    /// SRQCS write value clearing the error flag, the request count and the
    /// completion count.
    pub const SRQCS_RESET: u32 = (1 << 7) | (1 << 8) | (1 << 16);

    /// Extracts the completed-request count from an SRQCS value.
    pub const fn completed(srqcs: u32) -> u32 {
        (srqcs >> 16) & 0xff
    }
}

/// Firmware mailbox property interface definitions.
///
/// Tags and allocation flags understood by the VideoCore firmware through
/// the `/dev/vcio` property channel.
pub mod firmware {
    /// Request code placed in the second word of every property message.
    pub const REQUEST: u32 = 0x0000_0000;

    /// Response code written by the firmware when a request succeeded.
    pub const RESPONSE_OK: u32 = 0x8000_0000;

    /// Tag terminating a property message.
    pub const TAG_END: u32 = 0x0000_0000;

    /// Allocate contiguous GPU memory: `(size, align, flags) -> handle`.
    pub const TAG_MEM_ALLOC: u32 = 0x0003_000C;
    /// Lock GPU memory: `(handle) -> bus address`.
    pub const TAG_MEM_LOCK: u32 = 0x0003_000D;
    /// Unlock GPU memory: `(handle) -> status`.
    pub const TAG_MEM_UNLOCK: u32 = 0x0003_000E;
    /// Release GPU memory: `(handle) -> status`.
    pub const TAG_MEM_FREE: u32 = 0x0003_000F;
    /// Run QPU programs: `(count, control, noflush, timeout) -> status`.
    pub const TAG_EXECUTE_QPU: u32 = 0x0003_0011;
    /// Power the V3D block: `(enable) -> status`.
    pub const TAG_ENABLE_QPU: u32 = 0x0003_0012;

    /// Allocation is accessed through the uncached alias.
    pub const MEM_FLAG_DIRECT: u32 = 1 << 2;
    /// Allocation is accessed through the L2-coherent alias.
    pub const MEM_FLAG_COHERENT: u32 = 2 << 2;
    /// Uncached on the host, allocating in the VideoCore L2.
    pub const MEM_FLAG_L1_NONALLOCATING: u32 = MEM_FLAG_DIRECT | MEM_FLAG_COHERENT;

    /// Default `execute_qpu` timeout in milliseconds.
    pub const EXECUTE_TIMEOUT_MS: u32 = 2000;
}
