//! The parking primitive behind contended lock acquisition.
//!
//! A counting semaphore: `post` grants one permit, `wait` blocks until a
//! permit is available. Contended [`VmLock`](crate::raw_lock::VmLock)
//! acquisition pairs every lowered contention count with exactly one post,
//! so waiters never leak permits.
//!
//! Timed waits use a monotonic [`Instant`] deadline. The historical
//! wall-clock `gettimeofday` + relative `sem_timedwait` combination has a
//! known clock-skew bug class and is deliberately not reproduced.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new() -> Semaphore {
        Semaphore {
            permits: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    /// Grant `n` permits, waking up to `n` waiters.
    pub fn post(&self, n: usize) {
        let mut permits = self.permits.lock().unwrap();
        *permits += n;
        if n == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }

    /// Block until a permit is available, then consume it.
    pub fn wait(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.available.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    /// Block until a permit is available or `timeout` elapses. Returns true
    /// if a permit was consumed, false on timeout.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .available
                .wait_timeout(permits, deadline - now)
                .unwrap();
            permits = guard;
        }
        *permits -= 1;
        true
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn post_then_wait() {
        let sem = Semaphore::new();
        sem.post(2);
        sem.wait();
        assert!(sem.timed_wait(Duration::from_millis(1)));
        assert!(!sem.timed_wait(Duration::from_millis(1)));
    }

    #[test]
    fn wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new());
        let sem2 = sem.clone();
        let t = thread::spawn(move || {
            sem2.wait();
        });
        thread::sleep(Duration::from_millis(10));
        sem.post(1);
        t.join().unwrap();
    }

    #[test]
    fn timed_wait_times_out() {
        let sem = Semaphore::new();
        let start = Instant::now();
        assert!(!sem.timed_wait(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
