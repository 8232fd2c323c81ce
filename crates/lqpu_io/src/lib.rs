//! Result files for rendered fields.
//!
//! Output is stored as a NumPy `.npy` file holding a two-dimensional array
//! of little-endian `u32` values, shape `(height, width)`, in row-major
//! order. The writer appends one band of rows at a time so a render never
//! has to hold the whole field in memory.

/// Reading `.npy` files back, for verification and tooling.
///
/// Parses the preamble and the header dictionary with `nom`, checks that
/// the array is a C-ordered 2-D `u32` array and returns its contents.
pub mod loader;

/// Streaming `.npy` writer.
///
/// Writes the header up front from the final shape, then accepts bands of
/// complete rows until the array is full.
pub mod writer;

pub use loader::{NpyArray, load_npy};
pub use writer::NpyWriter;

/// Bytes every `.npy` file starts with.
pub const MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Element type descriptor for little-endian `u32`.
pub const DESCR: &str = "<u4";

/// Preamble plus header length is padded to a multiple of this.
pub const HEADER_ALIGN: usize = 64;
