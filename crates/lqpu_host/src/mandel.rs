//! Mandelbrot rendering on the QPUs.
//!
//! Every unit renders one row per batch. With `K` units a batch covers a
//! band of `K` rows, so a `width x height` field takes `height / K`
//! batches. Between batches only the per-row origin in each unit's
//! parameter block changes; the program, the dispatch messages and the
//! output tiles stay where the layout put them.

use crate::stats::BatchStats;
use anyhow::{Context, Result, ensure};
use lqpu_common::records::{get_f32, get_u32, put_f32, put_u32};
use lqpu_core::stats::PerfCounters;
use lqpu_core::{
    DispatchLayout, Firmware, LayoutPlan, ParameterBlock, ProgramImage, SessionConfig, SharedRegion,
};
use log::{debug, info};
use std::fmt;
use std::time::{Duration, Instant};

/// Units used by the command-line renderer.
pub const NUM_QPUS: u32 = 12;

/// Pixels each unit processes per vector operation.
pub const COLUMN_BLOCK: usize = 16;

/// Written over the output tiles before each batch. No escape count can
/// take this value, so a leftover marks a pixel the program never wrote.
pub const SENTINEL: u32 = u32::MAX;

/// Problem parameters of one rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MandelArgs {
    pub re_min: f32,
    pub re_max: f32,
    pub im_min: f32,
    pub width: usize,
    pub height: usize,
    pub max_iter: u32,
    pub max_value: f32,
}

impl MandelArgs {
    /// Checks the field shape against `units` before anything is acquired.
    pub fn validate(&self, units: u32) -> Result<()> {
        ensure!(
            self.width > 0 && self.width % COLUMN_BLOCK == 0,
            "Invalid width! {} is not a positive multiple of {COLUMN_BLOCK}",
            self.width
        );
        ensure!(
            units > 0 && self.height > 0 && self.height % units as usize == 0,
            "Invalid height! {} is not a positive multiple of {units}",
            self.height
        );
        ensure!(
            self.width
                .checked_mul(self.height)
                .and_then(|pixels| pixels.checked_mul(4))
                .is_some(),
            "Invalid size! {}x{} pixels do not fit in memory",
            self.width,
            self.height
        );
        ensure!(
            i32::try_from(self.max_iter).is_ok(),
            "max_iter {} does not fit the program's signed counter",
            self.max_iter
        );
        Ok(())
    }

    /// Distance between neighbouring pixels, on both axes.
    pub fn step(&self) -> f32 {
        (self.re_max - self.re_min) / self.width as f32
    }

    /// Imaginary coordinate of row `row`.
    pub fn row_im(&self, row: usize) -> f32 {
        self.im_min + self.step() * row as f32
    }

    /// Real coordinate of column `col`.
    pub fn col_re(&self, col: usize) -> f32 {
        self.re_min + self.step() * col as f32
    }
}

/// The per-unit uniforms read by the Mandelbrot program, in stream order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Uniforms {
    pub qpu_id: u32,
    pub debug_addr: u32,
    pub output_addr: u32,
    pub step_size: f32,
    pub re: f32,
    pub im: f32,
    pub max_iters: i32,
    pub max_value: f32,
    pub column_blocks: i32,
}

impl Uniforms {
    /// Number of 32-bit uniforms.
    pub const WORDS: usize = 9;

    /// Decodes the block from its uniform words, as the program sees them.
    pub fn decode(words: &[u32]) -> Self {
        let mut bytes = [0u8; Self::SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Self {
            qpu_id: get_u32(&bytes, 0),
            debug_addr: get_u32(&bytes, 4),
            output_addr: get_u32(&bytes, 8),
            step_size: get_f32(&bytes, 12),
            re: get_f32(&bytes, 16),
            im: get_f32(&bytes, 20),
            max_iters: get_u32(&bytes, 24) as i32,
            max_value: get_f32(&bytes, 28),
            column_blocks: get_u32(&bytes, 32) as i32,
        }
    }
}

impl ParameterBlock for Uniforms {
    const SIZE: usize = Self::WORDS * 4;

    fn encode(&self, out: &mut [u8]) {
        put_u32(out, 0, self.qpu_id);
        put_u32(out, 4, self.debug_addr);
        put_u32(out, 8, self.output_addr);
        put_f32(out, 12, self.step_size);
        put_f32(out, 16, self.re);
        put_f32(out, 20, self.im);
        put_u32(out, 24, self.max_iters as u32);
        put_f32(out, 28, self.max_value);
        put_u32(out, 32, self.column_blocks as u32);
    }
}

/// Rendering switches that do not change the result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Reserve, clear and dump the per-unit debug words.
    pub debug: bool,
    /// Enable the V3D performance counters for the run.
    pub perf_counters: bool,
}

/// What a finished rendering reports.
#[derive(Debug, Clone)]
pub struct RenderSummary {
    /// Wall-clock time of the batch loop.
    pub elapsed: Duration,
    pub batches: BatchStats,
    pub counters: Option<PerfCounters>,
}

/// Context of an error that aborted the batch loop.
///
/// Carries the loop's wall-clock time up to the failure, so callers can
/// report it like a finished rendering. Reach it with
/// [`anyhow::Error::downcast_ref`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchFailed {
    /// Zero-based index of the band whose batch failed.
    pub band: usize,
    pub bands: usize,
    pub elapsed: Duration,
}

impl fmt::Display for BatchFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch {} of {} failed", self.band, self.bands)
    }
}

/// Renders `args` on `units` QPUs.
///
/// `sink` receives each band of `units` rows, `units * width` escape
/// counts in row-major order, as soon as its batch completes. Any error
/// aborts the remaining bands; the session is released either way.
///
/// # Errors
///
/// Failures inside the batch loop carry a [`BatchFailed`] context.
pub fn render<F: Firmware>(
    firmware: F,
    config: &SessionConfig,
    args: &MandelArgs,
    units: u32,
    program: &ProgramImage<'_>,
    options: RenderOptions,
    mut sink: impl FnMut(&[u32]) -> Result<()>,
) -> Result<RenderSummary> {
    args.validate(units)?;

    let tile_bytes = args
        .width
        .checked_mul(4)
        .context("output row does not fit in memory")?;
    let plan = LayoutPlan::new::<Uniforms>(program, units, tile_bytes, options.debug);
    let region = SharedRegion::allocate(firmware, config, plan.required_size()?)?;

    let step = args.step();
    let column_blocks = (args.width / COLUMN_BLOCK) as i32;
    let mut cursor = region.payload_cursor()?;
    let mut layout = DispatchLayout::build(&mut cursor, program, &plan, |binding| Uniforms {
        qpu_id: binding.unit,
        debug_addr: binding.debug_bus.unwrap_or(0),
        output_addr: binding.output_bus,
        step_size: step,
        re: args.re_min,
        im: 0.0,
        max_iters: args.max_iter as i32,
        max_value: args.max_value,
        column_blocks,
    })?;

    if options.perf_counters {
        PerfCounters::enable(region.registers());
    }

    let bands = args.height / units as usize;
    let mut band_buf = vec![0u32; layout.output_words()];
    let mut batches = BatchStats::new();
    info!(
        "rendering {}x{} in {bands} batches of {units} rows",
        args.width, args.height
    );

    let mut run_band = |band: usize| -> Result<()> {
        for i in 0..units {
            let row = i as usize + units as usize * band;
            let mut block = Uniforms::decode(&param_words(layout.parameters(i)?));
            block.re = args.re_min;
            block.im = args.im_min + step * row as f32;
            layout.write_parameters(i, &block)?;
        }
        layout.fill_output(SENTINEL);
        if options.debug {
            layout.clear_debug();
        }

        region.execute(layout.message_bus(), units)?;

        if options.debug {
            dump_debug(&layout, band)?;
        }
        layout.read_output(&mut band_buf)?;
        sink(&band_buf).with_context(|| format!("failed to store band {band}"))
    };

    let start = Instant::now();
    for band in 0..bands {
        let batch_start = Instant::now();
        run_band(band).map_err(|e| {
            e.context(BatchFailed {
                band,
                bands,
                elapsed: start.elapsed(),
            })
        })?;
        batches.update(batch_start.elapsed().as_nanos() as u64);
    }
    let elapsed = start.elapsed();
    debug!("batch loop finished in {elapsed:?}");

    let counters = options
        .perf_counters
        .then(|| PerfCounters::read(region.registers()));
    drop(layout);
    region.release();

    Ok(RenderSummary {
        elapsed,
        batches,
        counters,
    })
}

fn param_words(bytes: &[u8]) -> Vec<u32> {
    (0..bytes.len() / 4).map(|i| get_u32(bytes, i * 4)).collect()
}

fn dump_debug<P: ParameterBlock>(layout: &DispatchLayout<'_, P>, band: usize) -> Result<()> {
    for unit in 0..layout.units() {
        let Some(words) = layout.read_debug(unit)? else {
            continue;
        };
        let line: Vec<String> = words.iter().map(|w| format!("{w:08x}")).collect();
        println!("QPU {band:03} {unit:2}: {}", line.join(" "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(width: usize, height: usize) -> MandelArgs {
        MandelArgs {
            re_min: -2.0,
            re_max: 1.0,
            im_min: -1.5,
            width,
            height,
            max_iter: 64,
            max_value: 4.0,
        }
    }

    #[test]
    fn validate_rejects_ragged_shapes() {
        assert!(args(64, 24).validate(12).is_ok());
        let err = args(60, 24).validate(12).unwrap_err().to_string();
        assert!(err.starts_with("Invalid width!"), "{err}");
        let err = args(64, 20).validate(12).unwrap_err().to_string();
        assert!(err.starts_with("Invalid height!"), "{err}");
        assert!(args(0, 24).validate(12).is_err());
        assert!(args(64, 24).validate(0).is_err());
    }

    #[test]
    fn validate_rejects_fields_too_large_to_address() {
        let err = args(usize::MAX - 15, 12).validate(12).unwrap_err().to_string();
        assert!(err.starts_with("Invalid size!"), "{err}");
        let err = args(1 << 12, usize::MAX / 2048).validate(1).unwrap_err().to_string();
        assert!(err.starts_with("Invalid size!"), "{err}");
    }

    #[test]
    fn uniforms_use_program_stream_order() {
        let block = Uniforms {
            qpu_id: 3,
            debug_addr: 0,
            output_addr: 0xC000_1000,
            step_size: 0.25,
            re: -2.0,
            im: 1.0,
            max_iters: -1,
            max_value: 4.0,
            column_blocks: 4,
        };
        let mut bytes = [0u8; Uniforms::SIZE];
        block.encode(&mut bytes);
        let words = param_words(&bytes);
        assert_eq!(words.len(), Uniforms::WORDS);
        assert_eq!(words[2], 0xC000_1000);
        assert_eq!(words[3], 0.25f32.to_bits());
        assert_eq!(words[6], u32::MAX);
        assert_eq!(Uniforms::decode(&words), block);
    }

    #[test]
    fn step_spans_real_axis() {
        let a = args(16, 12);
        assert_eq!(a.step(), 3.0 / 16.0);
        assert_eq!(a.col_re(0), -2.0);
        assert_eq!(a.row_im(4), -1.5 + 0.75);
    }
}
