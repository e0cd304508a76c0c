//! Cooperative stop-the-world synchronization.
//!
//! A safepoint is reached by seizing every registered thread's GC token.
//! Running threads surrender their token at explicit poll sites
//! ([`SyncRuntime::poll_at_safepoint`](crate::runtime::SyncRuntime::poll_at_safepoint))
//! and whenever they block; the requester seizes the tokens of blocked
//! threads directly. Once every token is held the world is stopped and
//! safepoint-only operations (monitor deflation, oop updates) may run with
//! plain loads and stores.
//!
//! The same token CAS is what a bias revoker uses to prove a lock owner is
//! parked, so revocation and safepoints contend for tokens through one
//! mechanism and cannot deadlock against each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crossbeam::utils::Backoff;
use log::debug;

use crate::thread::{ThreadRegistry, VmThread};

pub struct SafepointSynchronize {
    /// Set while some thread is bringing the world to (or holding it at) a
    /// safepoint. Doubles as the claim flag serializing requesters.
    requested: AtomicBool,
    /// Set once every token is held; cleared before tokens are returned.
    at_safepoint: AtomicBool,
    sync: Mutex<()>,
    resumed: Condvar,
}

impl SafepointSynchronize {
    pub fn new() -> SafepointSynchronize {
        SafepointSynchronize {
            requested: AtomicBool::new(false),
            at_safepoint: AtomicBool::new(false),
            sync: Mutex::new(()),
            resumed: Condvar::new(),
        }
    }

    /// Is the world currently stopped? Operations that require exclusion
    /// from all mutators assert this.
    pub fn is_at_safepoint(&self) -> bool {
        self.at_safepoint.load(Ordering::Acquire)
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Block until no safepoint is requested. Called by threads whose token
    /// has been seized, and by threads that observed the request flag.
    pub(crate) fn wait_for_resume(&self) {
        let mut guard = self.sync.lock().unwrap();
        while self.requested.load(Ordering::Acquire) {
            guard = self.resumed.wait(guard).unwrap();
        }
    }

    /// Wake threads blocked in [`wait_for_resume`](Self::wait_for_resume).
    /// Also used by a bias revoker returning a single seized token.
    pub(crate) fn notify_resumed(&self) {
        let _guard = self.sync.lock().unwrap();
        self.resumed.notify_all();
    }

    /// Stop the world. `this` is the requesting thread (whose own token is
    /// not seized); pass `None` when requesting from an unregistered thread.
    /// Returns once every other live thread's token is held.
    ///
    /// Requesters are serialized: a second caller blocks until the first
    /// safepoint ends, then stops the world itself.
    pub fn begin(&self, registry: &ThreadRegistry, this: Option<&VmThread>) {
        loop {
            if self
                .requested
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            self.wait_for_resume();
        }
        debug!("safepoint requested");
        for thread in registry.threads() {
            if let Some(me) = this {
                if std::ptr::eq(thread, me) {
                    continue;
                }
            }
            let backoff = Backoff::new();
            loop {
                if thread.token_vm_attempt() || thread.is_dead() {
                    break;
                }
                backoff.snooze();
            }
        }
        self.at_safepoint.store(true, Ordering::Release);
        debug!("safepoint reached");
    }

    /// Resume the world: return every seized token and wake the waiters.
    pub fn end(&self, registry: &ThreadRegistry, this: Option<&VmThread>) {
        debug_assert!(self.is_at_safepoint());
        self.at_safepoint.store(false, Ordering::Release);
        for thread in registry.threads() {
            if let Some(me) = this {
                if std::ptr::eq(thread, me) {
                    continue;
                }
            }
            thread.return_vm_token();
        }
        self.requested.store(false, Ordering::Release);
        self.notify_resumed();
        debug!("safepoint ended");
    }

    /// Poll site body: surrender the token for the duration of a pending
    /// safepoint. No-op unless a safepoint is requested.
    pub(crate) fn block_if_requested(&self, thread: &VmThread) {
        if !self.is_requested() {
            return;
        }
        thread.release_token();
        self.wait_for_resume();
        thread.acquire_token(self);
    }
}

impl Default for SafepointSynchronize {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn begin_seizes_blocked_thread_tokens() {
        let registry = Arc::new(ThreadRegistry::new());
        let me = registry.register("safepoint-requester");

        let other_parked = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let r2 = registry.clone();
        let parked2 = other_parked.clone();
        let stop2 = stop.clone();
        let t = std::thread::spawn(move || {
            let thread = r2.register("safepoint-victim");
            // Simulate blocking: surrender the token until told to stop.
            thread.release_token();
            parked2.store(true, Ordering::Release);
            while !stop2.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
            thread.acquire_token(r2.safepoint());
            r2.detach(thread);
        });

        while !other_parked.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        let sp = registry.safepoint();
        sp.begin(&registry, Some(me));
        assert!(sp.is_at_safepoint());
        sp.end(&registry, Some(me));
        assert!(!sp.is_at_safepoint());

        stop.store(true, Ordering::Release);
        t.join().unwrap();
        registry.detach(me);
    }

    #[test]
    fn poll_blocks_until_resumed() {
        let registry = Arc::new(ThreadRegistry::new());
        let me = registry.register("poll-requester");

        let polls = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let r2 = registry.clone();
        let polls2 = polls.clone();
        let stop2 = stop.clone();
        let t = std::thread::spawn(move || {
            let thread = r2.register("poll-mutator");
            while !stop2.load(Ordering::Acquire) {
                r2.safepoint().block_if_requested(thread);
                polls2.fetch_add(1, Ordering::Relaxed);
            }
            r2.detach(thread);
        });

        while polls.load(Ordering::Relaxed) == 0 {
            std::thread::yield_now();
        }
        let sp = registry.safepoint();
        sp.begin(&registry, Some(me));
        // World is stopped; the mutator must not be making progress.
        let before = polls.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        let during = polls.load(Ordering::Relaxed);
        assert!(during - before <= 1);
        sp.end(&registry, Some(me));

        stop.store(true, Ordering::Release);
        t.join().unwrap();
        registry.detach(me);
    }
}
