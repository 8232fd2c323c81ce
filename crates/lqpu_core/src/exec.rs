//! Submission and completion of a batch of QPU programs.
//!
//! Two strategies exist and exactly one is used per session:
//!
//! - [`DirectExecutor`] writes the V3D user-program request registers
//!   itself and spins on the completion counter.
//! - [`MailboxExecutor`] hands the dispatch-message array to the firmware
//!   and lets it wait, with a timeout.
//!
//! Host writes are published with a release fence before submission and
//! accelerator writes are observed through an acquire fence after
//! completion, on both paths.

use crate::error::{LqpuError, Result};
use crate::firmware::RegisterIo;
use crate::poll::{PollLimit, poll_until};
use core::sync::atomic::{Ordering, fence};
use lqpu_common::firmware::EXECUTE_TIMEOUT_MS;
use lqpu_common::mmio::MAX_QPUS;
use lqpu_common::records::DispatchMessage;
use lqpu_common::v3d;
use log::{error, trace};
use std::time::Duration;

/// Synchronization strategy of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Program SRQUA/SRQPC directly and poll SRQCS.
    Direct { limit: PollLimit },
    /// One firmware `execute_qpu` call. `flush` asks the firmware to flush
    /// the caches before starting the programs.
    Mailbox { timeout: Duration, flush: bool },
}

impl Default for Strategy {
    fn default() -> Self {
        Self::Mailbox {
            timeout: Duration::from_millis(EXECUTE_TIMEOUT_MS as u64),
            flush: false,
        }
    }
}

impl Strategy {
    /// Builds the executor implementing this strategy.
    pub fn executor(&self) -> Box<dyn Executor> {
        match *self {
            Self::Direct { limit } => Box::new(DirectExecutor { limit }),
            Self::Mailbox { timeout, flush } => Box::new(MailboxExecutor {
                timeout_ms: u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX),
                noflush: !flush,
            }),
        }
    }
}

/// What an executor needs from a session.
pub trait ExecTarget {
    /// The mapped V3D register window.
    fn registers(&self) -> &dyn RegisterIo;

    /// Forwards to the firmware channel's `execute_qpu`.
    fn execute_qpu(&self, num: u32, control: u32, noflush: bool, timeout_ms: u32) -> u32;

    /// Reads `count` dispatch messages starting at bus address `bus`.
    fn dispatch_messages(&self, bus: u32, count: u32) -> Result<Vec<DispatchMessage>>;
}

/// Runs one batch to completion.
pub trait Executor {
    /// Starts `units` programs from the message array at `messages_bus`
    /// and blocks until all of them have finished.
    fn execute(&self, target: &dyn ExecTarget, messages_bus: u32, units: u32) -> Result<()>;
}

fn check_units(units: u32) -> Result<()> {
    if units == 0 || units > MAX_QPUS {
        return Err(LqpuError::UnitCount(units));
    }
    Ok(())
}

/// Direct register submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectExecutor {
    pub limit: PollLimit,
}

impl Executor for DirectExecutor {
    fn execute(&self, target: &dyn ExecTarget, messages_bus: u32, units: u32) -> Result<()> {
        check_units(units)?;
        let messages = target.dispatch_messages(messages_bus, units)?;
        let regs = target.registers();

        fence(Ordering::Release);

        regs.write(v3d::DBCFG, 0);
        regs.write(v3d::DBQITE, 0);
        regs.write(v3d::DBQITC, !0);
        regs.write(v3d::L2CACTL, v3d::L2CACTL_CLEAR);
        regs.write(v3d::SLCACTL, !0);
        regs.write(v3d::SRQCS, v3d::SRQCS_RESET);

        for (unit, msg) in messages.iter().enumerate() {
            trace!(
                "unit {unit}: uniforms {:#010x}, code {:#010x}",
                msg.uniforms_bus, msg.code_bus
            );
            regs.write(v3d::SRQUA, msg.uniforms_bus);
            regs.write(v3d::SRQPC, msg.code_bus);
        }

        let finished = poll_until(self.limit, || {
            v3d::completed(regs.read(v3d::SRQCS)) == units
        });
        if !finished {
            error!(
                "direct submission: {} of {units} units completed before the poll limit",
                v3d::completed(regs.read(v3d::SRQCS))
            );
            return Err(LqpuError::Timeout);
        }

        fence(Ordering::Acquire);
        Ok(())
    }
}

/// Firmware-mediated submission.
#[derive(Debug, Clone, Copy)]
pub struct MailboxExecutor {
    pub timeout_ms: u32,
    pub noflush: bool,
}

impl Default for MailboxExecutor {
    fn default() -> Self {
        Self {
            timeout_ms: EXECUTE_TIMEOUT_MS,
            noflush: true,
        }
    }
}

impl Executor for MailboxExecutor {
    fn execute(&self, target: &dyn ExecTarget, messages_bus: u32, units: u32) -> Result<()> {
        check_units(units)?;
        trace!(
            "execute_qpu: {units} units, control {messages_bus:#010x}, timeout {} ms",
            self.timeout_ms
        );

        fence(Ordering::Release);
        let status = target.execute_qpu(units, messages_bus, self.noflush, self.timeout_ms);
        fence(Ordering::Acquire);

        LqpuError::from_execute_status(status).inspect_err(|e| error!("execute_qpu: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct Recorder {
        writes: RefCell<Vec<(usize, u32)>>,
        started: Cell<u32>,
        stall: bool,
    }

    impl RegisterIo for Recorder {
        fn read(&self, offset: usize) -> u32 {
            if offset == v3d::SRQCS && !self.stall {
                self.started.get() << 16
            } else {
                0
            }
        }

        fn write(&self, offset: usize, value: u32) {
            if offset == v3d::SRQPC {
                self.started.set(self.started.get() + 1);
            }
            self.writes.borrow_mut().push((offset, value));
        }
    }

    struct Target {
        regs: Recorder,
        messages: Vec<DispatchMessage>,
        status: u32,
        calls: RefCell<Vec<(u32, u32, bool, u32)>>,
    }

    impl Target {
        fn new(units: u32) -> Self {
            Self {
                regs: Recorder::default(),
                messages: (0..units)
                    .map(|i| DispatchMessage {
                        uniforms_bus: 0xC000_1000 + 36 * i,
                        code_bus: 0xC000_0020,
                    })
                    .collect(),
                status: 0,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ExecTarget for Target {
        fn registers(&self) -> &dyn RegisterIo {
            &self.regs
        }

        fn execute_qpu(&self, num: u32, control: u32, noflush: bool, timeout_ms: u32) -> u32 {
            self.calls
                .borrow_mut()
                .push((num, control, noflush, timeout_ms));
            self.status
        }

        fn dispatch_messages(&self, _bus: u32, count: u32) -> Result<Vec<DispatchMessage>> {
            Ok(self.messages[..count as usize].to_vec())
        }
    }

    #[test]
    fn direct_writes_setup_then_one_request_per_unit() {
        let target = Target::new(3);
        DirectExecutor::default()
            .execute(&target, 0xC000_2000, 3)
            .unwrap();

        let writes = target.regs.writes.borrow();
        assert_eq!(
            &writes[..6],
            &[
                (v3d::DBCFG, 0),
                (v3d::DBQITE, 0),
                (v3d::DBQITC, !0),
                (v3d::L2CACTL, 1 << 2),
                (v3d::SLCACTL, !0),
                (v3d::SRQCS, (1 << 7) | (1 << 8) | (1 << 16)),
            ]
        );
        let requests: Vec<_> = writes[6..].to_vec();
        assert_eq!(requests.len(), 6);
        for (i, pair) in requests.chunks(2).enumerate() {
            assert_eq!(pair[0], (v3d::SRQUA, target.messages[i].uniforms_bus));
            assert_eq!(pair[1], (v3d::SRQPC, target.messages[i].code_bus));
        }
    }

    #[test]
    fn direct_poll_limit_reports_timeout() {
        let mut target = Target::new(2);
        target.regs.stall = true;
        let exec = DirectExecutor {
            limit: PollLimit::Spins(1000),
        };
        assert_eq!(
            exec.execute(&target, 0xC000_2000, 2),
            Err(LqpuError::Timeout)
        );
    }

    #[test]
    fn mailbox_passes_control_block_through() {
        let target = Target::new(12);
        let exec = MailboxExecutor::default();
        exec.execute(&target, 0xC000_3000, 12).unwrap();
        assert_eq!(
            *target.calls.borrow(),
            vec![(12, 0xC000_3000, true, 2000)]
        );
        assert!(target.regs.writes.borrow().is_empty());
    }

    #[test]
    fn mailbox_status_mapping() {
        let mut target = Target::new(1);
        target.status = 0x8000_0000;
        assert_eq!(
            MailboxExecutor::default().execute(&target, 0, 1),
            Err(LqpuError::Timeout)
        );
        target.status = 5;
        assert_eq!(
            MailboxExecutor::default().execute(&target, 0, 1),
            Err(LqpuError::Firmware(5))
        );
    }

    #[test]
    fn unit_count_is_validated_before_submission() {
        let target = Target::new(1);
        for units in [0, 17] {
            assert_eq!(
                MailboxExecutor::default().execute(&target, 0, units),
                Err(LqpuError::UnitCount(units))
            );
            assert_eq!(
                DirectExecutor::default().execute(&target, 0, units),
                Err(LqpuError::UnitCount(units))
            );
        }
        assert!(target.calls.borrow().is_empty());
        assert!(target.regs.writes.borrow().is_empty());
    }

    #[test]
    fn strategy_builds_matching_executor() {
        let target = Target::new(1);
        let strategy = Strategy::Mailbox {
            timeout: Duration::from_millis(100),
            flush: true,
        };
        strategy.executor().execute(&target, 0x40, 1).unwrap();
        assert_eq!(*target.calls.borrow(), vec![(1, 0x40, false, 100)]);
    }
}
