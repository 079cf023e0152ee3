//! One-shot completion signal.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::time::{Clock, Deadline};

/// Signalled once by a completer, observed by a single waiter.
///
/// `signal_count` records every `complete()` so callers can assert the
/// waiter was released exactly once.
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicBool,
    signals: AtomicU32,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            signals: AtomicU32::new(0),
        }
    }

    /// Re-arm for the next round.
    pub fn reinit(&self) {
        self.done.store(false, Ordering::Release);
    }

    pub fn complete(&self) {
        self.signals.fetch_add(1, Ordering::AcqRel);
        self.done.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn signal_count(&self) -> u32 {
        self.signals.load(Ordering::Acquire)
    }

    /// Wait until completed or `deadline` passes.
    ///
    /// `pump` runs between checks and stands in for the interrupt that would
    /// complete us; it is also where callers poll hardware.
    ///
    /// # Returns
    /// `true` if completed, `false` on timeout.
    pub fn wait_until(
        &self,
        clock: &dyn Clock,
        deadline: Deadline,
        poll_us: u64,
        mut pump: impl FnMut(),
    ) -> bool {
        loop {
            pump();
            if self.is_done() {
                return true;
            }
            if deadline.expired(clock.now_us()) {
                return self.is_done();
            }
            clock.relax(poll_us.max(1));
        }
    }
}
