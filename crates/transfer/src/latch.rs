//! One-shot latches the state machines block on.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A set-once value with a bounded wait.
///
/// Callbacks on the router thread `set`; the state-machine thread `wait`s.
/// The first `set` wins, later ones are ignored.
pub(crate) struct Latch<T> {
    slot: Mutex<Option<T>>,
    cv: Condvar,
}

impl<T> Latch<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    pub fn set(&self, value: T) {
        let mut slot = self.slot.lock().expect("latch lock");
        if slot.is_none() {
            *slot = Some(value);
            self.cv.notify_all();
        }
    }

    /// Whether the latch has tripped, without consuming the value.
    pub fn is_set(&self) -> bool {
        self.slot.lock().expect("latch lock").is_some()
    }

    /// Takes the value if it arrives before `timeout`.
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().expect("latch lock");
        loop {
            if let Some(value) = slot.take() {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(slot, deadline - now)
                .expect("latch lock");
            slot = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_before_wait_returns_immediately() {
        let latch = Latch::new();
        latch.set(7u32);
        assert_eq!(latch.wait(Duration::from_millis(1)), Some(7));
    }

    #[test]
    fn wait_times_out_without_a_set() {
        let latch: Latch<u32> = Latch::new();
        let start = Instant::now();
        assert_eq!(latch.wait(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn first_set_wins() {
        let latch = Latch::new();
        latch.set(1u32);
        latch.set(2u32);
        assert!(latch.is_set());
        assert_eq!(latch.wait(Duration::from_millis(1)), Some(1));
    }

    #[test]
    fn cross_thread_wakeup() {
        let latch = Arc::new(Latch::new());
        let setter = Arc::clone(&latch);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            setter.set("done");
        });
        assert_eq!(latch.wait(Duration::from_secs(5)), Some("done"));
        handle.join().unwrap();
    }
}
