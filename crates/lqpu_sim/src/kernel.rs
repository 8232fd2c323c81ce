//! Software stand-ins for QPU programs.
//!
//! The simulator never interprets QPU machine code. Instead a [`Kernel`]
//! closure runs once per started unit with a [`UnitContext`] giving it the
//! unit's uniforms and word access to simulated memory by bus address.

use crate::memory::{SimMemory, bus_to_phys};

/// How a simulated unit run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The program reached its end and signalled the host.
    Done,
    /// The program never finishes. Models a hung or looping kernel.
    Never,
}

/// A simulated QPU program.
pub type Kernel = Box<dyn FnMut(&mut UnitContext<'_>) -> Completion>;

/// Kernel that finishes immediately without touching memory.
pub fn halt() -> Kernel {
    Box::new(|_| Completion::Done)
}

/// What one unit sees while its program runs.
pub struct UnitContext<'a> {
    unit: u32,
    uniforms_bus: u32,
    code_bus: u32,
    uniforms_read: usize,
    memory: &'a SimMemory,
}

impl<'a> UnitContext<'a> {
    pub(crate) fn new(unit: u32, uniforms_bus: u32, code_bus: u32, memory: &'a SimMemory) -> Self {
        Self {
            unit,
            uniforms_bus,
            code_bus,
            uniforms_read: 0,
            memory,
        }
    }

    /// Index of the unit in submission order.
    pub fn unit(&self) -> u32 {
        self.unit
    }

    pub fn uniforms_bus(&self) -> u32 {
        self.uniforms_bus
    }

    pub fn code_bus(&self) -> u32 {
        self.code_bus
    }

    /// Reads the next uniform, as the QPU's uniform stream does.
    pub fn next_uniform(&mut self) -> u32 {
        let bus = self.uniforms_bus + 4 * self.uniforms_read as u32;
        self.uniforms_read += 1;
        self.read(bus)
    }

    /// Reads `count` consecutive uniforms from the start of the block.
    pub fn uniforms(&self, count: usize) -> Vec<u32> {
        (0..count)
            .map(|i| self.read(self.uniforms_bus + 4 * i as u32))
            .collect()
    }

    /// Reads the word at bus address `bus`. Out-of-range reads return 0.
    pub fn read(&self, bus: u32) -> u32 {
        self.memory.read_u32(bus_to_phys(bus)).unwrap_or(0)
    }

    /// Writes the word at bus address `bus`. Out-of-range writes are lost.
    pub fn write(&mut self, bus: u32, value: u32) {
        self.memory.write_u32(bus_to_phys(bus), value);
    }

    pub fn read_f32(&self, bus: u32) -> f32 {
        f32::from_bits(self.read(bus))
    }
}
