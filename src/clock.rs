//! Cached wallclock/monotonic time, refreshed once per dispatch wakeup.
//!
//! Comm points and timers that need "now" during a dispatch batch read it
//! from here instead of calling `clock_gettime` per packet. The base
//! refreshes the cache once per wakeup, before invoking any callback, and
//! once more before the first `select` of the loop.

use std::time::{Duration, Instant};

/// A cached `(seconds, Instant)` pair, refreshed on demand by `Base`.
///
/// `Instant` backs deadline comparisons for the timer heap (monotonic,
/// immune to wall-clock jumps); `now_secs` is the coarser unix-epoch-like
/// counter exposed to callbacks that only care about second-granularity TTL
/// bookkeeping.
#[derive(Debug)]
pub struct Clock {
    monotonic: Instant,
    now_secs: u64,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            monotonic: Instant::now(),
            now_secs: unix_seconds(),
        }
    }

    /// Re-reads the system clock. Called by `Base` at the top of every
    /// dispatch wakeup and before the first `select`.
    pub fn refresh(&mut self) {
        self.monotonic = Instant::now();
        self.now_secs = unix_seconds();
    }

    /// Monotonic instant as of the last `refresh`, for timer deadline math.
    pub fn now(&self) -> Instant {
        self.monotonic
    }

    /// Coarse unix-epoch-like seconds as of the last `refresh`.
    pub fn now_secs(&self) -> u64 {
        self.now_secs
    }

    /// Convenience for timer arming: `now() + duration`.
    pub fn deadline_after(&self, duration: Duration) -> Instant {
        self.monotonic + duration
    }
}

impl Default for Clock {
    fn default() -> Clock {
        Clock::new()
    }
}

fn unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::Clock;
    use std::time::Duration;

    #[test]
    fn refresh_advances_monotonic() {
        let mut clock = Clock::new();
        let first = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        clock.refresh();
        assert!(clock.now() >= first);
    }

    #[test]
    fn deadline_after_is_in_the_future() {
        let clock = Clock::new();
        let deadline = clock.deadline_after(Duration::from_secs(1));
        assert!(deadline > clock.now());
    }
}
