//! Compute dispatch onto the VideoCore IV QPUs.
//!
//! This crate acquires a physically contiguous memory region shared between
//! the ARM host and the QPUs, lays the accelerator program and its per-unit
//! parameter blocks out inside it, submits batches of parallel invocations
//! and waits for them, and tears everything down again in reverse order.
//! It talks to the firmware through the [`firmware::Firmware`] trait, so the
//! same session code drives real hardware and the software double.

/// Paired bus/host addresses and the layout cursor.
///
/// Every block in the shared region is addressed twice, once for the QPUs
/// and once for the host. Both addresses are advanced together so they
/// never disagree.
pub mod address;

/// Program image, parameter blocks and dispatch messages.
///
/// Carves the one-time layout out of a region: the program, one parameter
/// block and one dispatch message per unit, the output tiles and the
/// optional debug words.
pub mod dispatch;

/// Error type shared by every fallible operation in the crate.
pub mod error;

/// Batch submission strategies.
///
/// Direct register submission with busy polling, or a single firmware call
/// with a timeout. Exactly one is chosen per session.
pub mod exec;

/// The firmware RPC channel and register access traits.
pub mod firmware;

/// Linux implementation of the firmware channel over `/dev/vcio` and
/// `/dev/mem`.
pub mod mailbox;

/// Board memory-map discovery through the vendor host library.
pub mod platform;

/// Bounded and unbounded busy-waiting.
pub mod poll;

/// The shared region and session lifecycle.
///
/// Allocation is all-or-nothing with rollback; teardown runs once, in
/// reverse order, when the region is dropped.
pub mod region;

/// V3D performance counters.
pub mod stats;

pub use address::{DualAddress, RegionCursor};
pub use dispatch::{DispatchLayout, LayoutPlan, ParameterBlock, ProgramImage, UnitBinding};
pub use error::{LqpuError, Result};
pub use exec::{DirectExecutor, Executor, MailboxExecutor, Strategy};
pub use firmware::{Firmware, MemHandle, RegisterIo};
pub use platform::{Discovery, HostInfo};
pub use poll::PollLimit;
pub use region::{SessionConfig, SharedRegion};
