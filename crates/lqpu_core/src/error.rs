//! Errors reported by the dispatch layer.
//!
//! The variants that correspond to a fixed status code display the exact
//! sentence from [`lqpu_common::status::status_name`], so the host prints
//! the same text whether it formats the error or looks the code up.

use lqpu_common::status;

/// Result alias used throughout the dispatch layer.
pub type Result<T> = core::result::Result<T, LqpuError>;

/// Failure modes of allocation, layout and execution.
///
/// None of these are recovered inside the layer. A failed allocation has
/// already rolled back every partial step when the error is returned, and a
/// failed execution leaves the session usable only for teardown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LqpuError {
    /// The firmware refused to power the V3D block.
    #[error("{}", status::status_name(status::ENABLE_FAILED))]
    EnableFailed,

    /// Another session already owns the accelerator behind this channel.
    #[error("the accelerator is already owned by another session")]
    AlreadyClaimed,

    /// Strict discovery was requested and the vendor library is absent.
    #[error("{}", status::status_name(status::LIBRARY_MISSING))]
    LibraryMissing,

    /// The firmware could not provide the requested contiguous block.
    #[error("{}", status::status_name(status::OUT_OF_MEMORY))]
    OutOfMemory,

    /// The firmware refused to lock an allocation.
    #[error("unable to lock GPU memory handle {0:#x}")]
    LockFailed(u32),

    /// The peripheral register window could not be mapped.
    #[error("{}", status::status_name(status::PERIPHERAL_MAP_FAILED))]
    PeripheralMapFailed,

    /// The locked allocation could not be mapped into host memory.
    #[error("unable to map shared memory at physical address {0:#010x}")]
    RegionMapFailed(u32),

    /// The firmware did not see every QPU finish in time.
    #[error("{}", status::status_name(status::TIMEOUT))]
    Timeout,

    /// The firmware returned a status this layer has no meaning for.
    #[error("firmware returned unexpected status {0:#x}")]
    Firmware(u32),

    /// A region of zero bytes was requested.
    #[error("the requested payload size must be non-zero")]
    EmptyRequest,

    /// A layout carve-out does not fit in what is left of the region.
    #[error("shared region exhausted: {requested} bytes requested, {remaining} remaining")]
    RegionExhausted { requested: usize, remaining: usize },

    /// A bus address does not fall inside the session's region.
    #[error("bus address {0:#010x} lies outside the shared region")]
    OutsideRegion(u32),

    /// The unit count is zero or larger than the hardware queue supports.
    #[error("unit count {0} is out of range")]
    UnitCount(u32),

    /// A unit index at or past the layout's unit count.
    #[error("unit {unit} does not exist in a layout of {units} units")]
    NoSuchUnit { unit: u32, units: u32 },

    /// A caller buffer does not match the size of what is copied into it.
    #[error("buffer holds {found} words, {expected} are needed")]
    BufferLength { expected: usize, found: usize },

    /// The payload cursor was already handed out for this region.
    #[error("the shared region payload is already laid out")]
    AlreadyLaidOut,
}

impl LqpuError {
    /// Returns the fixed status code of this error, if it has one.
    ///
    /// Host-side precondition failures never reach the firmware and carry no
    /// code. Lock and region-mapping failures reuse the codes of the
    /// allocation and mapping steps they belong to.
    pub fn status(&self) -> Option<u32> {
        match self {
            Self::EnableFailed => Some(status::ENABLE_FAILED),
            Self::LibraryMissing => Some(status::LIBRARY_MISSING),
            Self::OutOfMemory | Self::LockFailed(_) => Some(status::OUT_OF_MEMORY),
            Self::PeripheralMapFailed | Self::RegionMapFailed(_) => {
                Some(status::PERIPHERAL_MAP_FAILED)
            }
            Self::Timeout => Some(status::TIMEOUT),
            Self::Firmware(code) => Some(*code),
            Self::AlreadyClaimed
            | Self::EmptyRequest
            | Self::RegionExhausted { .. }
            | Self::OutsideRegion(_)
            | Self::UnitCount(_)
            | Self::NoSuchUnit { .. }
            | Self::BufferLength { .. }
            | Self::AlreadyLaidOut => None,
        }
    }

    /// Maps a raw `execute_qpu` status to a result.
    pub fn from_execute_status(code: u32) -> Result<()> {
        match code {
            status::SUCCESS => Ok(()),
            status::TIMEOUT => Err(Self::Timeout),
            other => Err(Self::Firmware(other)),
        }
    }
}
