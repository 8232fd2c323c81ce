//! V3D performance counters.
//!
//! The V3D block has sixteen counter slots, each of which counts one
//! selectable event source. [`PerfCounters::enable`] binds a fixed set of
//! QPU-relevant sources to the low slots and clears them;
//! [`PerfCounters::read`] reports what accumulated since.

use crate::firmware::RegisterIo;
use core::fmt;
use lqpu_common::v3d;
use log::debug;

/// An event source selectable through PCTRS(n).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSource {
    pub id: u32,
    pub name: &'static str,
}

/// Sources enabled by [`PerfCounters::enable`], in slot order.
pub const SOURCES: [CounterSource; 10] = [
    CounterSource { id: 13, name: "QPU idle cycles" },
    CounterSource { id: 17, name: "QPU valid instructions" },
    CounterSource { id: 18, name: "QPU TMU stall cycles" },
    CounterSource { id: 19, name: "QPU scoreboard stall cycles" },
    CounterSource { id: 21, name: "QPU instruction cache hits" },
    CounterSource { id: 22, name: "QPU instruction cache misses" },
    CounterSource { id: 23, name: "QPU uniforms cache hits" },
    CounterSource { id: 24, name: "QPU uniforms cache misses" },
    CounterSource { id: 29, name: "L2 cache hits" },
    CounterSource { id: 30, name: "L2 cache misses" },
];

/// A snapshot of the enabled counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfCounters {
    pub values: Vec<(CounterSource, u32)>,
}

impl PerfCounters {
    /// Enable mask covering the slots [`SOURCES`] occupies.
    pub const ENABLE_MASK: u32 = (1 << SOURCES.len()) - 1;

    /// Binds [`SOURCES`] to the low slots, clears them and starts counting.
    pub fn enable(regs: &dyn RegisterIo) {
        for (slot, source) in SOURCES.iter().enumerate() {
            regs.write(v3d::pctrs(slot), source.id);
        }
        regs.write(v3d::PCTRC, Self::ENABLE_MASK);
        regs.write(v3d::PCTRE, Self::ENABLE_MASK | 1 << 31);
        debug!("performance counters enabled, mask {:#x}", Self::ENABLE_MASK);
    }

    /// Reads every enabled slot.
    pub fn read(regs: &dyn RegisterIo) -> Self {
        Self {
            values: SOURCES
                .iter()
                .enumerate()
                .map(|(slot, source)| (*source, regs.read(v3d::pctr(slot))))
                .collect(),
        }
    }

    /// Value counted for source `id`, if it is one of [`SOURCES`].
    pub fn get(&self, id: u32) -> Option<u32> {
        self.values
            .iter()
            .find(|(source, _)| source.id == id)
            .map(|(_, value)| *value)
    }
}

impl fmt::Display for PerfCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (source, value) in &self.values {
            writeln!(f, "{:>32}: {value}", source.name)?;
        }
        Ok(())
    }
}
