//! Status codes returned across the dispatch layer.
//!
//! The numeric values are stable: they are what the firmware and the
//! allocator have always reported, and scripts driving the host binary
//! match on the printed sentences.

/// The operation completed.
pub const SUCCESS: u32 = 0;

/// The firmware refused to power the V3D block.
pub const ENABLE_FAILED: u32 = 1;

/// The vendor host library could not be opened.
pub const LIBRARY_MISSING: u32 = 2;

/// The firmware could not provide the requested GPU memory.
pub const OUT_OF_MEMORY: u32 = 3;

/// A physical range could not be mapped into the host address space.
pub const PERIPHERAL_MAP_FAILED: u32 = 4;

/// The firmware gave up waiting for the QPUs to finish.
pub const TIMEOUT: u32 = 0x8000_0000;

/// Every code with a dedicated description.
pub const KNOWN: [u32; 6] = [
    SUCCESS,
    ENABLE_FAILED,
    LIBRARY_MISSING,
    OUT_OF_MEMORY,
    PERIPHERAL_MAP_FAILED,
    TIMEOUT,
];

/// Returns the human-readable description of a status code.
///
/// Unrecognised codes map to a generic message rather than failing, since
/// the firmware may return values this crate does not know about.
pub const fn status_name(status: u32) -> &'static str {
    match status {
        SUCCESS => "Operation successful.",
        ENABLE_FAILED => "Unable to enable V3D. Please check your firmware is up to date.",
        LIBRARY_MISSING => "Can't open libbcm_host.",
        OUT_OF_MEMORY => "Out of memory. Try a smaller batch or increase GPU memory.",
        PERIPHERAL_MAP_FAILED => "Unable to map Videocore peripherals into ARM memory space.",
        TIMEOUT => "Execution timed out.",
        _ => "Unknown status.",
    }
}
