//! Busy-wait helpers for the direct submission path.

use core::hint::spin_loop;
use std::time::{Duration, Instant};

/// Bound on how long a busy-wait may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollLimit {
    /// Spin until the condition holds, however long that takes.
    #[default]
    Unbounded,
    /// Give up after this many unsuccessful checks.
    Spins(u64),
    /// Give up once this much wall-clock time has passed.
    Deadline(Duration),
}

/// Spins until `done` returns `true` or `limit` runs out.
///
/// Returns `true` if the condition was observed. The condition is always
/// checked at least once, so a zero limit still reports an already
/// satisfied condition.
pub fn poll_until(limit: PollLimit, mut done: impl FnMut() -> bool) -> bool {
    match limit {
        PollLimit::Unbounded => {
            while !done() {
                spin_loop();
            }
            true
        }
        PollLimit::Spins(max) => {
            let mut spins = 0u64;
            loop {
                if done() {
                    return true;
                }
                if spins >= max {
                    return false;
                }
                spins += 1;
                spin_loop();
            }
        }
        PollLimit::Deadline(budget) => {
            let start = Instant::now();
            loop {
                if done() {
                    return true;
                }
                if start.elapsed() >= budget {
                    return false;
                }
                spin_loop();
            }
        }
    }
}
