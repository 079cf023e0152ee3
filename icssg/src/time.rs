//! Time sources, deadlines and interrupt pacing.
//!
//! Everything in the driver measures time in microseconds through the
//! [`Clock`] trait so bounded waits can be driven by the real counter on
//! hardware and by a manual clock in tests.

/// Minimum non-zero interrupt coalescing interval.
pub const ICSSG_MIN_COALESCE_USECS: u32 = 20;

/// Monotonic microsecond time source.
pub trait Clock: Send + Sync {
    /// Current time in microseconds.
    fn now_us(&self) -> u64;

    /// Spin for roughly `us` microseconds.
    fn relax(&self, us: u64) {
        let end = self.now_us().saturating_add(us);
        while self.now_us() < end {
            core::hint::spin_loop();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// COUNTER CLOCK
// ═══════════════════════════════════════════════════════════════════════════

/// Clock backed by the CPU's free-running counter.
///
/// The frequency must be calibrated by the caller (PIT/HPET on x86,
/// `CNTFRQ_EL0` on arm64).
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[derive(Debug, Clone, Copy)]
pub struct TscClock {
    ticks_per_us: u64,
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
impl TscClock {
    /// Create from a calibrated counter frequency in Hz.
    pub fn new(tsc_freq: u64) -> Self {
        Self {
            ticks_per_us: (tsc_freq / 1_000_000).max(1),
        }
    }

    #[inline]
    fn read_counter() -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            // SAFETY: RDTSC has no side effects.
            unsafe { core::arch::x86_64::_rdtsc() }
        }
        #[cfg(target_arch = "aarch64")]
        {
            let cnt: u64;
            // SAFETY: CNTVCT_EL0 is readable at EL0/EL1.
            unsafe { core::arch::asm!("mrs {}, cntvct_el0", out(reg) cnt) };
            cnt
        }
    }
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
impl Clock for TscClock {
    #[inline]
    fn now_us(&self) -> u64 {
        Self::read_counter() / self.ticks_per_us
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DEADLINE
// ═══════════════════════════════════════════════════════════════════════════

/// Absolute point in time after which a wait gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at_us: u64,
}

impl Deadline {
    pub fn after(clock: &dyn Clock, timeout_us: u64) -> Self {
        Self {
            at_us: clock.now_us().saturating_add(timeout_us),
        }
    }

    pub fn at(at_us: u64) -> Self {
        Self { at_us }
    }

    #[inline]
    pub fn expired(&self, now_us: u64) -> bool {
        now_us >= self.at_us
    }

    pub fn remaining(&self, now_us: u64) -> u64 {
        self.at_us.saturating_sub(now_us)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PACING TIMER
// ═══════════════════════════════════════════════════════════════════════════

/// Clamp a requested coalescing interval.
///
/// 0 disables coalescing; anything below the minimum is raised to it.
pub fn coalesce_usecs(requested: u32) -> u32 {
    if requested > 0 && requested < ICSSG_MIN_COALESCE_USECS {
        log::info!(
            "coalesce usecs {} raised to minimum {}",
            requested,
            ICSSG_MIN_COALESCE_USECS
        );
        ICSSG_MIN_COALESCE_USECS
    } else {
        requested
    }
}

/// One-shot timer that delays interrupt re-enable after a poll.
#[derive(Debug, Clone, Copy)]
pub struct PaceTimer {
    interval_us: u32,
    expires_at: Option<u64>,
}

impl PaceTimer {
    pub fn new(interval_us: u32) -> Self {
        Self {
            interval_us: coalesce_usecs(interval_us),
            expires_at: None,
        }
    }

    /// Coalescing is active.
    #[inline]
    pub fn enabled(&self) -> bool {
        self.interval_us != 0
    }

    pub fn interval_us(&self) -> u32 {
        self.interval_us
    }

    /// Change the interval.
    ///
    /// # Returns
    /// True if disabling coalescing dropped an armed timer. The caller must
    /// re-enable the interrupt itself, since the timer will not fire.
    pub fn set_interval(&mut self, interval_us: u32) -> bool {
        self.interval_us = coalesce_usecs(interval_us);
        self.interval_us == 0 && self.expires_at.take().is_some()
    }

    pub fn arm(&mut self, now_us: u64) {
        self.expires_at = Some(now_us + self.interval_us as u64);
    }

    pub fn cancel(&mut self) {
        self.expires_at = None;
    }

    pub fn armed(&self) -> bool {
        self.expires_at.is_some()
    }

    /// Fire the timer if due. Returns true exactly once per arm.
    pub fn expire(&mut self, now_us: u64) -> bool {
        match self.expires_at {
            Some(at) if now_us >= at => {
                self.expires_at = None;
                true
            }
            _ => false,
        }
    }
}
