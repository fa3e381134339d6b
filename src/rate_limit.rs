use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Fixed-window request counter for the outbound send path.
///
/// `try_acquire` is one atomic check-and-increment and is safe for
/// concurrent callers, even though the watcher issues sends sequentially.
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    state: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            state: Mutex::new(Window {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Counts a request against the current window. Returns false, without
    /// counting, once the window has reached its maximum.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, now: Instant) -> bool {
        let mut window = self.state.lock().unwrap();
        // the window resets lazily, on the first check past its end
        if now.duration_since(window.window_start) >= self.window {
            window.window_start = now;
            window.count = 0;
        }
        if window.count >= self.max_requests {
            return false;
        }
        window.count += 1;
        true
    }
}
