//! Sliding-window limiter shared by every fetch against the exchange.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Calls the exchange tolerates per [`NSE_TIME_WINDOW`].
pub const NSE_MAX_CALLS: usize = 5;
pub const NSE_TIME_WINDOW: Duration = Duration::from_secs(60);

/// Bounds outbound calls to `max_calls` within any trailing `time_window`.
///
/// `acquire` reserves a slot under the lock and sleeps outside it, so a
/// waiting caller never blocks `can_proceed` or other callers from
/// reserving the slots after it. The history holds at most `max_calls`
/// slot times, some of which may lie in the future while their owners
/// sleep.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    time_window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, time_window: Duration) -> Self {
        let max_calls = max_calls.max(1);
        Self {
            max_calls,
            time_window,
            calls: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    /// The exchange quota: 5 calls per 60 seconds.
    pub fn nse() -> Self {
        Self::new(NSE_MAX_CALLS, NSE_TIME_WINDOW)
    }

    /// Blocks until one more call fits in the window, then records it.
    pub fn acquire(&self) {
        let slot = self.reserve();
        let now = Instant::now();
        if slot > now {
            tracing::debug!(wait_ms = (slot - now).as_millis() as u64, "rate limit reached, waiting");
            thread::sleep(slot - now);
        }
    }

    /// Whether a call could be issued right now. Leaves the history untouched.
    pub fn can_proceed(&self) -> bool {
        let calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let in_window = calls
            .iter()
            .filter(|&&slot| slot + self.time_window > now)
            .count();
        in_window < self.max_calls
    }

    fn reserve(&self) -> Instant {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        while calls
            .front()
            .is_some_and(|&oldest| oldest + self.time_window <= now)
        {
            calls.pop_front();
        }

        let slot = match calls.front() {
            Some(&oldest) if calls.len() >= self.max_calls => (oldest + self.time_window).max(now),
            _ => now,
        };

        calls.push_back(slot);
        while calls.len() > self.max_calls {
            calls.pop_front();
        }
        slot
    }
}
