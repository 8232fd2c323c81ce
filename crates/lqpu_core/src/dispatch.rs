//! Layout of the program, parameter blocks and dispatch messages.
//!
//! A [`DispatchLayout`] is built once per session out of the region's
//! payload area. It copies the program image in, writes one parameter block
//! and one dispatch message per unit, and reserves the output tiles and the
//! optional debug buffer. Only the parameter blocks change afterwards.

use crate::address::{DualAddress, RegionCursor};
use crate::error::{LqpuError, Result};
use core::marker::PhantomData;
use core::slice;
use lqpu_common::mmio::MAX_QPUS;
use lqpu_common::records::{DispatchMessage, align_up, checked_align_up, get_u32, put_u32};
use log::debug;

/// Alignment required for QPU program entry points.
pub const CODE_ALIGN: usize = 16;

/// Words of debug scratch reserved per unit.
pub const DEBUG_WORDS: usize = 16;

const DEBUG_BYTES: usize = DEBUG_WORDS * 4;

/// A fixed-layout per-unit record read by the QPU program as uniforms.
pub trait ParameterBlock {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Encodes the block into `out`, which is exactly [`Self::SIZE`] bytes.
    fn encode(&self, out: &mut [u8]);
}

/// Where a unit's block ended up; passed to the parameter initializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitBinding {
    /// Zero-based unit index.
    pub unit: u32,
    /// Bus address of the unit's output tile.
    pub output_bus: u32,
    /// Bus address of the unit's debug words, when debugging is enabled.
    pub debug_bus: Option<u32>,
}

/// An opaque QPU program blob.
#[derive(Debug, Clone, Copy)]
pub struct ProgramImage<'a> {
    bytes: &'a [u8],
}

impl<'a> ProgramImage<'a> {
    /// Wraps `bytes`, copied into the region verbatim by the layout.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// The program as given.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Length before alignment.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes the image occupies in the region.
    pub fn aligned_len(&self) -> usize {
        align_up(self.bytes.len(), CODE_ALIGN)
    }
}

/// Sizes of everything a layout carves out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutPlan {
    /// Units dispatched per batch, one parameter block and tile each.
    pub units: u32,
    /// Output bytes per unit.
    pub tile_bytes: usize,
    /// Encoded size of one parameter block.
    pub param_size: usize,
    /// Program length before alignment.
    pub program_len: usize,
    /// Reserve debug words per unit.
    pub debug: bool,
}

impl LayoutPlan {
    /// Plan for `units` blocks of type `P` and `tile_bytes` of output each.
    pub fn new<P: ParameterBlock>(
        program: &ProgramImage<'_>,
        units: u32,
        tile_bytes: usize,
        debug: bool,
    ) -> Self {
        Self {
            units,
            tile_bytes,
            param_size: P::SIZE,
            program_len: program.len(),
            debug,
        }
    }

    /// Payload bytes needed in the shared region.
    ///
    /// # Errors
    ///
    /// [`LqpuError::OutOfMemory`] if the total does not fit in a `usize`,
    /// which no region could hold anyway.
    pub fn required_size(&self) -> Result<usize> {
        let units = self.units as usize;
        let per_unit = self
            .param_size
            .checked_add(DispatchMessage::SIZE)
            .and_then(|n| n.checked_add(self.tile_bytes))
            .and_then(|n| n.checked_add(if self.debug { DEBUG_BYTES } else { 0 }));
        checked_align_up(self.program_len, CODE_ALIGN)
            .zip(per_unit.and_then(|n| n.checked_mul(units)))
            .and_then(|(code, blocks)| code.checked_add(blocks))
            .ok_or(LqpuError::OutOfMemory)
    }
}

/// Bytes of `count` consecutive records of `each` bytes.
fn span(count: usize, each: usize) -> Result<usize> {
    count.checked_mul(each).ok_or(LqpuError::OutOfMemory)
}

/// Byte-level access to a carved-out block.
///
/// Every block stays inside the mapping the cursor handed it out of, and
/// the layout holds the shared borrow of the region for as long as it
/// exists, so the mapping outlives every access.
#[derive(Debug, Clone, Copy)]
struct Block {
    addr: DualAddress,
    len: usize,
}

impl Block {
    fn carve(cursor: &mut RegionCursor<'_>, len: usize) -> Result<Self> {
        Ok(Self {
            addr: cursor.advance(len)?,
            len,
        })
    }

    fn bus(&self, offset: usize) -> u32 {
        self.addr.bus.wrapping_add(offset as u32)
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: the block lies inside the live mapping and `len` bytes
        // were reserved for it by the cursor.
        unsafe { slice::from_raw_parts(self.addr.host.as_ptr(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for `bytes`; blocks never overlap, and the `&mut self`
        // receiver on every layout writer keeps host writes exclusive.
        unsafe { slice::from_raw_parts_mut(self.addr.host.as_ptr(), self.len) }
    }
}

/// The session's dispatch layout over a shared region.
#[derive(Debug)]
pub struct DispatchLayout<'r, P> {
    units: u32,
    tile_bytes: usize,
    program: Block,
    params: Block,
    messages: Block,
    output: Block,
    debug: Option<Block>,
    _region: PhantomData<&'r ()>,
    _params: PhantomData<P>,
}

impl<'r, P: ParameterBlock> DispatchLayout<'r, P> {
    /// Carves the layout out of `cursor` and initializes it.
    ///
    /// `init` is called once per unit, in unit order, with the unit's
    /// output and debug addresses, and returns its first parameter block.
    /// Each dispatch message is written here and never again.
    pub fn build(
        cursor: &mut RegionCursor<'r>,
        program: &ProgramImage<'_>,
        plan: &LayoutPlan,
        mut init: impl FnMut(UnitBinding) -> P,
    ) -> Result<Self> {
        if plan.units == 0 || plan.units > MAX_QPUS {
            return Err(LqpuError::UnitCount(plan.units));
        }
        let units = plan.units as usize;

        let mut code = Block::carve(cursor, program.aligned_len())?;
        let params = Block::carve(cursor, span(units, P::SIZE)?)?;
        let messages = Block::carve(cursor, span(units, DispatchMessage::SIZE)?)?;
        let output = Block::carve(cursor, span(units, plan.tile_bytes)?)?;
        let debug = if plan.debug {
            Some(Block::carve(cursor, span(units, DEBUG_BYTES)?)?)
        } else {
            None
        };

        let code_bytes = code.bytes_mut();
        code_bytes[..program.len()].copy_from_slice(program.bytes());
        code_bytes[program.len()..].fill(0);

        debug!(
            "layout: code {:#010x} ({} bytes), params {:#010x}, messages {:#010x}, output {:#010x}",
            code.bus(0),
            code.len,
            params.bus(0),
            messages.bus(0),
            output.bus(0)
        );

        let mut layout = Self {
            units: plan.units,
            tile_bytes: plan.tile_bytes,
            program: code,
            params,
            messages,
            output,
            debug,
            _region: PhantomData,
            _params: PhantomData,
        };

        for unit in 0..plan.units {
            let binding = UnitBinding {
                unit,
                output_bus: layout.output_bus(unit),
                debug_bus: layout.debug_bus(unit),
            };
            let block = init(binding);
            layout.write_parameters(unit, &block)?;

            let msg = DispatchMessage {
                uniforms_bus: layout.parameter_bus(unit),
                code_bus: layout.code_bus(),
            };
            let at = unit as usize * DispatchMessage::SIZE;
            layout.messages.bytes_mut()[at..at + DispatchMessage::SIZE]
                .copy_from_slice(&msg.to_bytes());
        }

        Ok(layout)
    }

    /// Number of units the layout was built for.
    pub fn units(&self) -> u32 {
        self.units
    }

    /// Bus address of the program entry point.
    pub fn code_bus(&self) -> u32 {
        self.program.bus(0)
    }

    /// Bus address of the dispatch-message array, as passed to `execute`.
    pub fn message_bus(&self) -> u32 {
        self.messages.bus(0)
    }

    /// Bus address of the parameter block of `unit`.
    ///
    /// Blocks are packed back to back in unit order, [`ParameterBlock::SIZE`]
    /// bytes apart. The address is computed, not checked; pass a unit below
    /// [`DispatchLayout::units`].
    pub fn parameter_bus(&self, unit: u32) -> u32 {
        self.params.bus(unit as usize * P::SIZE)
    }

    /// Bus address of the output tile of `unit`. Computed like
    /// [`DispatchLayout::parameter_bus`].
    pub fn output_bus(&self, unit: u32) -> u32 {
        self.output.bus(unit as usize * self.tile_bytes)
    }

    /// Bus address of the debug words of `unit`, when debugging is enabled.
    pub fn debug_bus(&self, unit: u32) -> Option<u32> {
        self.debug
            .as_ref()
            .map(|d| d.bus(unit as usize * DEBUG_BYTES))
    }

    fn check_unit(&self, unit: u32) -> Result<usize> {
        if unit >= self.units {
            return Err(LqpuError::NoSuchUnit {
                unit,
                units: self.units,
            });
        }
        Ok(unit as usize)
    }

    /// Reads back the dispatch message of `unit`.
    pub fn dispatch_message(&self, unit: u32) -> Result<DispatchMessage> {
        let at = self.check_unit(unit)? * DispatchMessage::SIZE;
        let mut raw = [0u8; DispatchMessage::SIZE];
        raw.copy_from_slice(&self.messages.bytes()[at..at + DispatchMessage::SIZE]);
        Ok(DispatchMessage::from_bytes(&raw))
    }

    /// Overwrites the parameter block of `unit`. Only call between batches.
    ///
    /// # Errors
    ///
    /// [`LqpuError::NoSuchUnit`] if `unit` is not below [`DispatchLayout::units`].
    pub fn write_parameters(&mut self, unit: u32, block: &P) -> Result<()> {
        let at = self.check_unit(unit)? * P::SIZE;
        block.encode(&mut self.params.bytes_mut()[at..at + P::SIZE]);
        Ok(())
    }

    /// Raw encoded parameter block of `unit`.
    pub fn parameters(&self, unit: u32) -> Result<&[u8]> {
        let at = self.check_unit(unit)? * P::SIZE;
        Ok(&self.params.bytes()[at..at + P::SIZE])
    }

    /// Number of `u32` words in the whole output buffer.
    pub fn output_words(&self) -> usize {
        self.output.len / 4
    }

    /// Sets every output word to `value`.
    pub fn fill_output(&mut self, value: u32) {
        for word in self.output.bytes_mut().chunks_exact_mut(4) {
            word.copy_from_slice(&value.to_le_bytes());
        }
    }

    /// Copies the output buffer into `out`, unit tiles back to back.
    ///
    /// `out` must hold exactly [`DispatchLayout::output_words`] words.
    pub fn read_output(&self, out: &mut [u32]) -> Result<()> {
        read_words(self.output.bytes(), out)
    }

    /// Copies the output tile of `unit` into `out`, which must be exactly
    /// one tile long.
    pub fn read_tile(&self, unit: u32, out: &mut [u32]) -> Result<()> {
        let at = self.check_unit(unit)? * self.tile_bytes;
        read_words(&self.output.bytes()[at..at + self.tile_bytes], out)
    }

    /// Reads the debug words of `unit`. `None` when debugging is disabled.
    pub fn read_debug(&self, unit: u32) -> Result<Option<[u32; DEBUG_WORDS]>> {
        let at = self.check_unit(unit)? * DEBUG_BYTES;
        let Some(block) = self.debug.as_ref() else {
            return Ok(None);
        };
        let mut words = [0u32; DEBUG_WORDS];
        read_words(&block.bytes()[at..at + DEBUG_BYTES], &mut words)?;
        Ok(Some(words))
    }

    /// Zeroes the debug buffer.
    pub fn clear_debug(&mut self) {
        if let Some(block) = self.debug.as_mut() {
            block.bytes_mut().fill(0);
        }
    }
}

fn read_words(bytes: &[u8], out: &mut [u32]) -> Result<()> {
    let expected = bytes.len() / 4;
    if out.len() != expected {
        return Err(LqpuError::BufferLength {
            expected,
            found: out.len(),
        });
    }
    for (i, word) in out.iter_mut().enumerate() {
        *word = get_u32(bytes, i * 4);
    }
    Ok(())
}

/// Writes `words` little-endian into `out`; used by parameter encoders.
pub fn encode_words(out: &mut [u8], words: &[u32]) {
    for (i, &w) in words.iter().enumerate() {
        put_u32(out, i * 4, w);
    }
}
