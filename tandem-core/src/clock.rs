//! Wall-clock access for playback scheduling
//!
//! Start timestamps travel between devices as epoch milliseconds, so every
//! scheduling decision reads the clock through this trait. Tests swap in a
//! manual clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of epoch-millisecond time
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// The device's system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        current_time_ms()
    }
}

/// Get current time in milliseconds since UNIX epoch
pub fn current_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) use manual::ManualClock;

#[cfg(test)]
mod manual {
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::Clock;

    /// Clock that only moves when told to
    #[derive(Debug, Default)]
    pub struct ManualClock {
        now: AtomicI64,
    }

    impl ManualClock {
        pub fn at(now_ms: i64) -> Self {
            Self {
                now: AtomicI64::new(now_ms),
            }
        }

        pub fn advance(&self, ms: i64) {
            self.now.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> i64 {
            self.now.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_epoch_based() {
        // 2020-01-01 in epoch millis
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at(1_000);
        clock.advance(250);
        assert_eq!(clock.now_ms(), 1_250);
    }
}
