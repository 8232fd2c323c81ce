//! The simulated V3D register window.
//!
//! Only the user-program request path reacts to writes: SRQUA latches a
//! uniforms address, SRQPC starts the kernel on the next unit, and SRQCS
//! reports and resets the request and completion counters. Every other
//! register simply stores what was written.

use crate::SimState;
use crate::kernel::{Completion, UnitContext};
use lqpu_common::v3d;
use lqpu_core::RegisterIo;
use log::trace;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Register file contents and request counters.
#[derive(Debug, Default)]
pub(crate) struct V3dState {
    values: HashMap<usize, u32>,
    latched_uniforms: u32,
    requested: u32,
    completed: u32,
}

impl V3dState {
    fn srqcs(&self) -> u32 {
        ((self.completed & 0xff) << 16) | ((self.requested & 0xff) << 8)
    }
}

/// Host handle to the simulated register window.
pub struct SimRegisters {
    state: Rc<RefCell<SimState>>,
    mapped: Cell<bool>,
}

impl SimRegisters {
    pub(crate) fn new(state: Rc<RefCell<SimState>>) -> Self {
        Self {
            state,
            mapped: Cell::new(true),
        }
    }

    pub(crate) fn unmap(&self) {
        self.mapped.set(false);
    }

    /// Number of units that have completed since the last SRQCS reset.
    pub fn completed(&self) -> u32 {
        self.state.borrow().v3d.completed
    }
}

impl RegisterIo for SimRegisters {
    fn read(&self, offset: usize) -> u32 {
        assert!(self.mapped.get(), "register read after unmap");
        let state = self.state.borrow();
        match offset {
            v3d::SRQCS => state.v3d.srqcs(),
            _ => state.v3d.values.get(&offset).copied().unwrap_or(0),
        }
    }

    fn write(&self, offset: usize, value: u32) {
        assert!(self.mapped.get(), "register write after unmap");
        trace!("v3d[{offset:#08x}] <- {value:#010x}");
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        match offset {
            v3d::SRQUA => state.v3d.latched_uniforms = value,
            v3d::SRQPC => {
                let unit = state.v3d.requested;
                state.v3d.requested += 1;
                let uniforms = state.v3d.latched_uniforms;
                let mut ctx = UnitContext::new(unit, uniforms, value, &state.memory);
                if (state.kernel)(&mut ctx) == Completion::Done {
                    state.v3d.completed += 1;
                }
            }
            v3d::SRQCS => {
                if value & (1 << 8) != 0 {
                    state.v3d.requested = 0;
                }
                if value & (1 << 16) != 0 {
                    state.v3d.completed = 0;
                }
            }
            v3d::PCTRC => {
                for slot in 0..v3d::PERF_COUNTERS {
                    if value & (1 << slot) != 0 {
                        state.v3d.values.insert(v3d::pctr(slot), 0);
                    }
                }
            }
            _ => {}
        }
        state.v3d.values.insert(offset, value);
    }
}
