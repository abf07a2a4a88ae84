use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A shutdown signal shared with background loops. Loops sleep with
/// `wait_for`, which returns early the moment `stop` is called, so
/// teardown never waits out a long timer.
pub struct Stopper {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl Stopper {
    pub fn new() -> Self {
        Stopper { stopped: Mutex::new(false), cv: Condvar::new() }
    }

    /// Signals every waiting loop to exit.
    pub fn stop(&self) {
        if let Ok(mut stopped) = self.stopped.lock() {
            *stopped = true;
            self.cv.notify_all();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.lock().map(|s| *s).unwrap_or(true)
    }

    /// Sleeps for `timeout` or until stopped, whichever comes first.
    /// Returns true when the loop should exit.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let Ok(mut stopped) = self.stopped.lock() else { return true };
        let deadline = std::time::Instant::now() + timeout;
        while !*stopped {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            match self.cv.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => stopped = guard,
                Err(_) => return true,
            }
        }
        true
    }
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}
