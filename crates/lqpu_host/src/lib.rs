//! Mandelbrot renderer driving the QPUs through `lqpu_core`.

/// CPU reference renderer and the matching simulator kernel.
pub mod fractal;

/// Argument validation, layout and the batch loop.
pub mod mandel;

/// The embedded QPU program image.
pub mod program;

/// Per-batch latency statistics.
pub mod stats;

pub use mandel::{MandelArgs, NUM_QPUS, RenderOptions, RenderSummary, Uniforms, render};
