use crate::{DESCR, HEADER_ALIGN, MAGIC};
use anyhow::{Context, Result, bail, ensure};
use log::debug;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Builds the version 1.0 preamble and header for a `(rows, cols)` array.
///
/// The header dictionary is padded with spaces and terminated by a newline
/// so that the data starts on a [`HEADER_ALIGN`]-byte boundary.
pub fn encode_header(rows: usize, cols: usize) -> Vec<u8> {
    let dict =
        format!("{{'descr': '{DESCR}', 'fortran_order': False, 'shape': ({rows}, {cols}), }}");
    let preamble = MAGIC.len() + 2 + 2;
    let unpadded = preamble + dict.len() + 1;
    let padded = unpadded.div_ceil(HEADER_ALIGN) * HEADER_ALIGN;
    let header_len = padded - preamble;

    let mut out = Vec::with_capacity(padded);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header_len as u16).to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    out.resize(padded - 1, b' ');
    out.push(b'\n');
    out
}

/// Writes a `(rows, cols)` `u32` array band by band.
///
/// # Example
///
/// ```no_run
/// # fn main() -> anyhow::Result<()> {
/// let mut out = lqpu_io::NpyWriter::create("field.npy", 24, 16)?;
/// out.write_rows(&[0u32; 12 * 16])?;
/// out.write_rows(&[1u32; 12 * 16])?;
/// out.finish()?;
/// # Ok(())
/// # }
/// ```
pub struct NpyWriter {
    out: BufWriter<File>,
    path: PathBuf,
    rows: usize,
    cols: usize,
    written: usize,
}

impl NpyWriter {
    /// Creates `path` and writes the header for the final shape.
    pub fn create<P: AsRef<Path>>(path: P, rows: usize, cols: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        ensure!(cols > 0, "array must have at least one column");
        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        out.write_all(&encode_header(rows, cols))
            .with_context(|| format!("Failed to write header to {}", path.display()))?;
        debug!("{}: writing ({rows}, {cols}) u32 array", path.display());

        Ok(Self {
            out,
            path,
            rows,
            cols,
            written: 0,
        })
    }

    /// Appends whole rows. `values.len()` must be a multiple of the width.
    pub fn write_rows(&mut self, values: &[u32]) -> Result<()> {
        ensure!(
            values.len() % self.cols == 0,
            "band of {} values is not a whole number of {}-wide rows",
            values.len(),
            self.cols
        );
        let rows = values.len() / self.cols;
        if self.written + rows > self.rows {
            bail!(
                "{}: {} rows would exceed the declared {}",
                self.path.display(),
                self.written + rows,
                self.rows
            );
        }
        for v in values {
            self.out.write_all(&v.to_le_bytes())?;
        }
        self.written += rows;
        Ok(())
    }

    /// Rows written so far.
    pub fn rows_written(&self) -> usize {
        self.written
    }

    /// Flushes the file, failing if fewer rows than declared were written.
    pub fn finish(mut self) -> Result<()> {
        ensure!(
            self.written == self.rows,
            "{}: only {} of {} rows written",
            self.path.display(),
            self.written,
            self.rows
        );
        self.out
            .flush()
            .with_context(|| format!("Failed to flush {}", self.path.display()))
    }
}
