//! CPU reference renderer.
//!
//! Computes the same escape counts the QPU program does, in `f32` and in the
//! same order of operations, so simulated and reference fields agree bit
//! for bit.

use crate::mandel::{COLUMN_BLOCK, MandelArgs, Uniforms};
use lqpu_sim::{Completion, UnitContext};
use rayon::prelude::*;

/// Iterations until `z -> z^2 + c` leaves the disc `|z|^2 <= max_value`,
/// starting from `z = 0`, capped at `max_iter`.
pub fn escape_count(re: f32, im: f32, max_iter: u32, max_value: f32) -> u32 {
    let (mut zr, mut zi) = (0.0f32, 0.0f32);
    for n in 0..max_iter {
        let zr2 = zr * zr;
        let zi2 = zi * zi;
        if zr2 + zi2 > max_value {
            return n;
        }
        zi = 2.0 * zr * zi + im;
        zr = zr2 - zi2 + re;
    }
    max_iter
}

/// The whole field in row-major order, rows rendered in parallel.
pub fn render_reference(args: &MandelArgs) -> Vec<u32> {
    let mut field = vec![0u32; args.width * args.height];
    if args.width == 0 {
        return field;
    }
    field
        .par_chunks_mut(args.width)
        .enumerate()
        .for_each(|(row, out)| {
            let im = args.row_im(row);
            for (col, px) in out.iter_mut().enumerate() {
                *px = escape_count(args.col_re(col), im, args.max_iter, args.max_value);
            }
        });
    field
}

/// Number of pixels where `field` and `reference` disagree. Missing pixels
/// on either side count as mismatches.
pub fn mismatches(field: &[u32], reference: &[u32]) -> usize {
    let differing = field.iter().zip(reference).filter(|(a, b)| a != b).count();
    differing + field.len().abs_diff(reference.len())
}

/// A simulator kernel behaving like the QPU Mandelbrot program.
///
/// Reads the unit's [`Uniforms`], renders one row into its output tile and,
/// when a debug address is set, leaves the unit id and row coordinate in
/// the first two debug words.
pub fn simulated_kernel() -> impl FnMut(&mut UnitContext<'_>) -> Completion {
    |ctx: &mut UnitContext<'_>| {
        let u = Uniforms::decode(&ctx.uniforms(Uniforms::WORDS));
        let width = COLUMN_BLOCK as u32 * u.column_blocks.max(0) as u32;
        let max_iter = u.max_iters.max(0) as u32;
        for x in 0..width {
            let re = u.re + u.step_size * x as f32;
            ctx.write(u.output_addr + 4 * x, escape_count(re, u.im, max_iter, u.max_value));
        }
        if u.debug_addr != 0 {
            ctx.write(u.debug_addr, u.qpu_id);
            ctx.write(u.debug_addr + 4, u.im.to_bits());
        }
        Completion::Done
    }
}
