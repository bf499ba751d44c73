//! Countdown latch that lets the coordinator wake early once every worker exits.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct CompletionLatch {
    remaining: Mutex<usize>,
    zero: Condvar,
}

impl CompletionLatch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    /// Decrement; wakes all waiters when the count reaches zero.
    pub fn count_down(&self) {
        let mut guard = self.remaining.lock().expect("latch mutex poisoned");
        if *guard == 0 {
            return;
        }
        *guard -= 1;
        if *guard == 0 {
            self.zero.notify_all();
        }
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.lock().expect("latch mutex poisoned")
    }

    /// Block until the count reaches zero or `timeout` elapses.
    ///
    /// Returns `true` if the count reached zero. A timeout too large to express
    /// as an `Instant` waits without a time limit.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut guard = self.remaining.lock().expect("latch mutex poisoned");
        loop {
            if *guard == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // Spurious wakeups loop back and re-check the remaining budget.
            let (next, _) = self
                .zero
                .wait_timeout(guard, deadline - now)
                .expect("latch condvar wait failed");
            guard = next;
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut guard = self.remaining.lock().expect("latch mutex poisoned");
        while *guard > 0 {
            guard = self.zero.wait(guard).expect("latch condvar wait failed");
        }
    }
}

/// Counts the latch down when dropped, so a panicking worker still releases it.
pub(crate) struct CountDownOnDrop<'a>(pub(crate) &'a CompletionLatch);

impl Drop for CountDownOnDrop<'_> {
    fn drop(&mut self) {
        self.0.count_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_early_when_all_counted_down() {
        let latch = Arc::new(CompletionLatch::new(3));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let latch = Arc::clone(&latch);
            handles.push(thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                latch.count_down();
            }));
        }
        let start = Instant::now();
        assert!(latch.wait_timeout(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(5));
        for handle in handles {
            handle.join().expect("latch thread panicked");
        }
        assert_eq!(latch.remaining(), 0);
    }

    #[test]
    fn wait_times_out_while_workers_remain() {
        let latch = CompletionLatch::new(1);
        let start = Instant::now();
        assert!(!latch.wait_timeout(Duration::from_millis(40)));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn unbounded_timeout_waits_for_count_down() {
        let latch = Arc::new(CompletionLatch::new(2));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let latch = Arc::clone(&latch);
            handles.push(thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                latch.count_down();
            }));
        }
        assert!(latch.wait_timeout(Duration::MAX));
        for handle in handles {
            handle.join().expect("latch thread panicked");
        }
        assert_eq!(latch.remaining(), 0);
    }

    #[test]
    fn guard_counts_down_on_panic() {
        let latch = Arc::new(CompletionLatch::new(1));
        let worker = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                let _guard = CountDownOnDrop(&latch);
                panic!("worker failed");
            })
        };
        assert!(worker.join().is_err());
        assert_eq!(latch.remaining(), 0);
    }
}
