//! The low-level VM locks: a contention-counting mutex ([`VmLock`]) and its
//! wait/notify extension ([`WaitLock`]).
//!
//! A `VmLock`'s state is one 64-bit word: the owner's reversible thread id
//! in the low half and a count of contended waiters in the high half. The
//! owner id makes ownership remotely inspectable, which the bias-revocation
//! protocol depends on, and the contention count makes "is anybody stuck
//! behind this lock" a single load, which monitor deflation depends on.
//!
//! Contention accounting pairs with a counting [`Semaphore`]: an unlocker
//! that lowers the count posts exactly one permit, so permits never leak
//! and a woken waiter retries the acquire CAS rather than assuming
//! ownership was handed to it.
//!
//! Rule stolen from hard experience: never raise the contention count on an
//! unlocked lock. A CAS that loses to an *unlock* must retry the acquire,
//! otherwise the raised count has no unlocker left to post for it.
//!
//! [`WaitLock`] adds a packed waiters/notifies/epoch word implementing
//! monitor wait-set semantics: `notify` transfers at most one notification
//! per waiter registered at notify time, and the epoch stamp stops waiters
//! that registered after a notification from stealing it.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use log::trace;

use crate::safepoint::SafepointSynchronize;
use crate::semaphore::Semaphore;
use crate::thread::VmThread;

/// Low half of the lock word: the owner's reversible tid (0 = unlocked).
const TID_BITS: u32 = 32;
const TID_MASK: u64 = (1 << TID_BITS) - 1;
/// One contended waiter, in lock-word units.
const CONTENTION_UNIT: u64 = 1 << TID_BITS;

pub struct VmLock {
    word: AtomicU64,
    /// Lazily created on first contention; most locks never block anyone.
    sem: AtomicPtr<Semaphore>,
    name: &'static str,
    acquisitions: AtomicUsize,
    contended_acquisitions: AtomicUsize,
}

impl VmLock {
    pub fn new(name: &'static str) -> VmLock {
        VmLock {
            word: AtomicU64::new(0),
            sem: AtomicPtr::new(ptr::null_mut()),
            name,
            acquisitions: AtomicUsize::new(0),
            contended_acquisitions: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The reversible tid of the current owner, or 0.
    pub fn owner_tid(&self) -> u64 {
        self.word.load(Ordering::Acquire) & TID_MASK
    }

    pub fn is_locked(&self) -> bool {
        self.owner_tid() != 0
    }

    pub fn is_self_locked(&self, thread: &VmThread) -> bool {
        self.owner_tid() == thread.reversible_tid()
    }

    /// Number of threads counted as blocked behind this lock.
    pub fn contention_count(&self) -> u64 {
        self.word.load(Ordering::Acquire) >> TID_BITS
    }

    /// (total acquisitions, contended acquisitions)
    pub fn stats(&self) -> (usize, usize) {
        (
            self.acquisitions.load(Ordering::Relaxed),
            self.contended_acquisitions.load(Ordering::Relaxed),
        )
    }

    /// One CAS attempt at the uncontended acquire. No side effects on
    /// failure; in particular the contention count is untouched.
    pub fn try_lock(&self, thread: &VmThread) -> bool {
        self.try_lock_as(thread.reversible_tid())
    }

    /// `try_lock` on behalf of an arbitrary tid. Used when seeding a monitor
    /// for an object whose bias owner is some other thread.
    pub(crate) fn try_lock_as(&self, tid: u64) -> bool {
        debug_assert!(tid != 0 && tid & !TID_MASK == 0);
        let backoff = Backoff::new();
        loop {
            let old = self.word.load(Ordering::Acquire);
            if old & TID_MASK != 0 {
                return false;
            }
            if self
                .word
                .compare_exchange_weak(old, old | tid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.acquisitions.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            backoff.spin();
        }
    }

    /// Blocking acquire. Surrenders the GC token while parked, so a
    /// safepoint (or a bias revoker) never waits on a thread that is itself
    /// waiting for a lock.
    pub fn lock(&self, sp: &SafepointSynchronize, thread: &VmThread) {
        self.lock_internal(sp, thread, true);
    }

    /// Blocking acquire that holds onto the GC token. Only for critical
    /// sections that cannot tolerate a safepoint between the call and the
    /// acquire; keep these short.
    pub fn lock_without_safepoint(&self, sp: &SafepointSynchronize, thread: &VmThread) {
        self.lock_internal(sp, thread, false);
    }

    fn lock_internal(&self, sp: &SafepointSynchronize, thread: &VmThread, allow_gc: bool) {
        debug_assert!(
            !self.is_self_locked(thread),
            "thread {:?} self-deadlocks on lock {}",
            thread,
            self.name
        );
        if self.try_lock(thread) {
            return;
        }
        self.lock_contended(sp, thread, allow_gc);
    }

    #[cold]
    fn lock_contended(&self, sp: &SafepointSynchronize, thread: &VmThread, allow_gc: bool) {
        trace!("{:?} contends for lock {}", thread, self.name);
        self.contended_acquisitions.fetch_add(1, Ordering::Relaxed);
        let tid = thread.reversible_tid();
        let sem = self.sem();
        loop {
            let old = self.word.load(Ordering::Acquire);
            if old & TID_MASK == 0 {
                if self
                    .word
                    .compare_exchange(old, old | tid, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.acquisitions.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                // Lost to another acquire or an unlock. Never raise
                // contention on an unlocked lock.
                continue;
            }
            if self
                .word
                .compare_exchange(old, old + CONTENTION_UNIT, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            // We are counted. Exactly one future post is ours.
            if allow_gc {
                thread.release_token();
                sem.wait();
                thread.acquire_token(sp);
            } else {
                sem.wait();
            }
        }
    }

    /// Release the lock word. Returns true if a waiter's contention count
    /// was consumed, in which case the caller owes the semaphore one post.
    /// Split from [`unlock`](Self::unlock) because bias revocation needs to
    /// release a dead owner's lock word without being that owner.
    pub(crate) fn try_unlock(&self) -> bool {
        loop {
            let old = self.word.load(Ordering::Acquire);
            debug_assert!(old & TID_MASK != 0, "unlock of unlocked {}", self.name);
            if old >> TID_BITS == 0 {
                if self
                    .word
                    .compare_exchange(old, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return false;
                }
            } else {
                let new = (old - CONTENTION_UNIT) & !TID_MASK;
                if self
                    .word
                    .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
            }
        }
    }

    pub fn unlock(&self, thread: &VmThread) {
        debug_assert!(self.is_self_locked(thread));
        if self.try_unlock() {
            self.sem().post(1);
        }
    }

    /// Raise the contention count, but only while the lock is held. Returns
    /// false if the lock was observed unlocked. A successful raise entitles
    /// the caller to exactly one semaphore permit.
    pub(crate) fn try_raise_contention(&self) -> bool {
        loop {
            let old = self.word.load(Ordering::Acquire);
            if old & TID_MASK == 0 {
                return false;
            }
            if self
                .word
                .compare_exchange(old, old + CONTENTION_UNIT, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub(crate) fn sem_timed_wait(&self, timeout: Duration) -> bool {
        self.sem().timed_wait(timeout)
    }

    pub(crate) fn sem_post(&self) {
        self.sem().post(1);
    }

    /// Reset to the unlocked, uncontended state. Only legal at a safepoint,
    /// on a lock nobody can be blocked on.
    pub(crate) fn force_clear(&self) {
        debug_assert!(self.contention_count() == 0);
        self.word.store(0, Ordering::Release);
    }

    fn sem(&self) -> &Semaphore {
        let p = self.sem.load(Ordering::Acquire);
        if !p.is_null() {
            return unsafe { &*p };
        }
        let fresh = Box::into_raw(Box::new(Semaphore::new()));
        match self.sem.compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => unsafe { &*fresh },
            Err(winner) => {
                unsafe { drop(Box::from_raw(fresh)) };
                unsafe { &*winner }
            }
        }
    }
}

impl Drop for VmLock {
    fn drop(&mut self) {
        let p = *self.sem.get_mut();
        if !p.is_null() {
            unsafe { drop(Box::from_raw(p)) };
        }
    }
}

impl std::fmt::Debug for VmLock {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let word = self.word.load(Ordering::Relaxed);
        write!(
            f,
            "VmLock[{} owner={:#x} contention={}]",
            self.name,
            word & TID_MASK,
            word >> TID_BITS
        )
    }
}

// WaitLock wne word: waiters[15:0], pending notifies[31:16], epoch[47:32].
const W_SHIFT: u32 = 0;
const N_SHIFT: u32 = 16;
const E_SHIFT: u32 = 32;
const FIELD_MASK: u64 = 0xffff;

fn waiters(wne: u64) -> u64 {
    (wne >> W_SHIFT) & FIELD_MASK
}
fn notifies(wne: u64) -> u64 {
    (wne >> N_SHIFT) & FIELD_MASK
}
fn epoch(wne: u64) -> u64 {
    (wne >> E_SHIFT) & FIELD_MASK
}
fn pack_wne(w: u64, n: u64, e: u64) -> u64 {
    debug_assert!(w <= FIELD_MASK && n <= FIELD_MASK);
    (w << W_SHIFT) | (n << N_SHIFT) | ((e & FIELD_MASK) << E_SHIFT)
}

/// A [`VmLock`] with a wait set. Backs every object monitor.
pub struct WaitLock {
    lock: VmLock,
    wne: AtomicU64,
    wsync: Mutex<()>,
    wcond: Condvar,
}

impl WaitLock {
    pub fn new(name: &'static str) -> WaitLock {
        WaitLock {
            lock: VmLock::new(name),
            wne: AtomicU64::new(0),
            wsync: Mutex::new(()),
            wcond: Condvar::new(),
        }
    }

    pub fn waiter_count(&self) -> u64 {
        waiters(self.wne.load(Ordering::Acquire))
    }

    /// Release the lock and join the wait set until notified, interrupted
    /// (if `interruptible`) or `timeout` elapses, then reacquire the lock.
    /// Returns true if the wait ended by timeout or interrupt; a
    /// notification that raced either of those wins and returns false.
    pub fn wait(
        &self,
        sp: &SafepointSynchronize,
        thread: &VmThread,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> bool {
        debug_assert!(self.lock.is_self_locked(thread));
        thread.set_current_waiting(self);

        // Register in the wait set and capture the epoch. Notifications
        // posted at this epoch predate us and are not ours to consume.
        let captured_epoch = loop {
            let old = self.wne.load(Ordering::Acquire);
            debug_assert!(waiters(old) < FIELD_MASK);
            if self
                .wne
                .compare_exchange_weak(
                    old,
                    old + (1 << W_SHIFT),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break epoch(old);
            }
        };

        self.lock.unlock(thread);
        let deadline = timeout.map(|t| Instant::now() + t);
        thread.release_token();

        let mut expired = false;
        loop {
            let old = self.wne.load(Ordering::Acquire);
            if epoch(old) != captured_epoch && notifies(old) > 0 {
                let new = old - (1 << W_SHIFT) - (1 << N_SHIFT);
                if self
                    .wne
                    .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
                continue;
            }
            if (interruptible && thread.is_interrupted())
                || deadline.is_some_and(|d| Instant::now() >= d)
            {
                // Deregister without consuming a notification, capping the
                // pending notify count so a notification raced by our exit
                // stays claimable by the remaining waiters only.
                let w = waiters(old) - 1;
                let new = pack_wne(w, notifies(old).min(w), epoch(old));
                if self
                    .wne
                    .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    expired = true;
                    break;
                }
                continue;
            }
            let guard = self.wsync.lock().unwrap();
            if self.wne.load(Ordering::Acquire) == old
                && !(interruptible && thread.is_interrupted())
            {
                match deadline {
                    Some(d) => {
                        let now = Instant::now();
                        if now < d {
                            drop(self.wcond.wait_timeout(guard, d - now).unwrap());
                        }
                    }
                    None => {
                        drop(self.wcond.wait(guard).unwrap());
                    }
                }
            }
        }

        thread.set_current_waiting(ptr::null());
        thread.acquire_token(sp);
        self.lock.lock(sp, thread);
        expired
    }

    /// Transfer one notification to the wait set. Caller must own the lock.
    /// A no-op when there is no waiter without a pending notification.
    pub fn notify(&self, thread: &VmThread) {
        debug_assert!(self.lock.is_self_locked(thread));
        loop {
            let old = self.wne.load(Ordering::Acquire);
            let (w, n) = (waiters(old), notifies(old));
            if n >= w {
                return;
            }
            let new = pack_wne(w, n + 1, epoch(old) + 1);
            if self
                .wne
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.wake_all();
                return;
            }
        }
    }

    /// Give every current waiter a notification. Caller must own the lock.
    pub fn notify_all(&self, thread: &VmThread) {
        debug_assert!(self.lock.is_self_locked(thread));
        loop {
            let old = self.wne.load(Ordering::Acquire);
            let (w, n) = (waiters(old), notifies(old));
            if n >= w {
                return;
            }
            let new = pack_wne(w, w, epoch(old) + 1);
            if self
                .wne
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.wake_all();
                return;
            }
        }
    }

    /// Kick all waiters without touching the wait-set accounting. Each woken
    /// waiter rechecks its interrupt flag and goes back to sleep if it was
    /// not the target.
    pub(crate) fn interrupt_wake(&self) {
        self.wake_all();
    }

    fn wake_all(&self) {
        // The empty critical section orders the wne update before the
        // notify against a waiter that is between its wne recheck and the
        // condvar wait.
        let _guard = self.wsync.lock().unwrap();
        self.wcond.notify_all();
    }
}

impl std::ops::Deref for WaitLock {
    type Target = VmLock;

    fn deref(&self) -> &VmLock {
        &self.lock
    }
}

impl std::fmt::Debug for WaitLock {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let wne = self.wne.load(Ordering::Relaxed);
        write!(
            f,
            "WaitLock[{:?} waiters={} notifies={}]",
            self.lock,
            waiters(wne),
            notifies(wne)
        )
    }
}
