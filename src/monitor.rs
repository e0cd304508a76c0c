//! The heavyweight object monitor.
//!
//! A monitor takes over for the mark word once an object's locking is too
//! interesting for a bias: contention, wait/notify, or lock-plus-hash. Its
//! state is:
//!
//! -   the [`WaitLock`]: owner tid, contention count and wait set;
//! -   the recursion word, which distinguishes *speculative* ownership from
//!     *counted* ownership. A speculative (biased) owner holds the lock
//!     word indefinitely, even across logical unlocks, and its true depth
//!     lives only in its own lock-record stack. `-1` flags a revocation in
//!     progress; `0` is speculative; `> 0` is an explicit depth count;
//! -   the identity hash evicted from the mark word at inflation;
//! -   a JNI entry count and an in-use pin, both of which veto deflation.
//!
//! Revocation of a live owner's bias is cooperative. The contender flips
//! recursion `0 -> -1`, drops a request in the owner's inbox (under the
//! threads lock, which pins the owner's liveness for the duration of the
//! push) and waits. The owner services the request at its next safepoint
//! poll; or, if the owner is blocked, the contender seizes the owner's GC
//! token and crawls the owner's lock records itself. A dead owner's lock
//! word is simply stripped, since its lock records died with it.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use log::trace;

use crate::error::GuestError;
use crate::object::ObjectRef;
use crate::pool::MonitorId;
use crate::raw_lock::WaitLock;
use crate::runtime::SyncRuntime;
use crate::thread::VmThread;

/// How long a revocation contender parks before re-examining the owner.
/// Bounded so a contender never misses the owner becoming blocked.
const REVOKE_POLL: Duration = Duration::from_millis(1);

pub struct ObjectMonitor {
    lock: WaitLock,
    id: MonitorId,
    /// Raw bits of the bound [`ObjectRef`], 0 when free-listed.
    object: AtomicUsize,
    /// -1 revoking, 0 speculative, > 0 counted depth.
    recursion: AtomicI32,
    /// Identity hash of the bound object, 0 if none assigned yet.
    hash_code: AtomicI32,
    /// Outstanding JNI MonitorEnter balance.
    jni_count: AtomicU32,
    /// Pin count; nonzero vetoes deflation.
    in_use: AtomicUsize,
    /// Pool list link (free list or in-circulation list), id + 1, 0 = nil.
    link: AtomicU32,
}

impl ObjectMonitor {
    pub(crate) fn new(id: MonitorId) -> ObjectMonitor {
        ObjectMonitor {
            lock: WaitLock::new("objectmonitor"),
            id,
            object: AtomicUsize::new(0),
            recursion: AtomicI32::new(0),
            hash_code: AtomicI32::new(0),
            jni_count: AtomicU32::new(0),
            in_use: AtomicUsize::new(0),
            link: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> MonitorId {
        self.id
    }

    /// The object this monitor is bound to, if any. Stale the moment it is
    /// read unless the reader pins the monitor or holds its lock.
    pub fn object(&self) -> Option<ObjectRef> {
        let raw = self.object.load(Ordering::Acquire);
        if raw == 0 {
            None
        } else {
            Some(unsafe { ObjectRef::from_raw(raw) })
        }
    }

    pub(crate) fn object_raw(&self) -> usize {
        self.object.load(Ordering::Acquire)
    }

    pub fn owner_tid(&self) -> u64 {
        self.lock.owner_tid()
    }

    pub fn is_owned_by(&self, thread: &VmThread) -> bool {
        self.lock.is_self_locked(thread)
    }

    pub fn recursion(&self) -> i32 {
        self.recursion.load(Ordering::Acquire)
    }

    pub fn waiter_count(&self) -> u64 {
        self.lock.waiter_count()
    }

    pub fn contention_count(&self) -> u64 {
        self.lock.contention_count()
    }

    pub(crate) fn jni_count(&self) -> u32 {
        self.jni_count.load(Ordering::Acquire)
    }

    /// The object's identity hash, installing `candidate` if none is set.
    /// Returns the winning value.
    pub(crate) fn install_hash(&self, candidate: i32) -> i32 {
        match self
            .hash_code
            .compare_exchange(0, candidate, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => candidate,
            Err(existing) => existing,
        }
    }

    pub fn hash_code(&self) -> i32 {
        self.hash_code.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Pool plumbing

    pub(crate) fn link(&self) -> u32 {
        self.link.load(Ordering::Acquire)
    }

    pub(crate) fn set_link(&self, link: u32) {
        self.link.store(link, Ordering::Release);
    }

    pub(crate) fn is_neutral(&self) -> bool {
        self.object.load(Ordering::Acquire) == 0
            && self.recursion.load(Ordering::Acquire) == 0
            && self.hash_code.load(Ordering::Acquire) == 0
            && self.jni_count.load(Ordering::Acquire) == 0
            && self.in_use.load(Ordering::Acquire) == 0
            && !self.lock.is_locked()
            && self.lock.waiter_count() == 0
    }

    /// Bind to `obj`, taking over the state encoded in `mark`. Called on an
    /// unpublished monitor, before the inflation CAS.
    pub(crate) fn bind(&self, obj: ObjectRef, mark: crate::mark_word::MarkWord) {
        debug_assert!(self.is_neutral());
        self.hash_code.store(mark.hash(), Ordering::Release);
        if mark.is_biased() {
            // Carry the bias over: the monitor starts speculatively owned
            // by the bias holder, depth still in its lock records.
            let locked = self.lock.try_lock_as(mark.biased_tid());
            debug_assert!(locked);
        }
        self.object.store(obj.raw(), Ordering::Release);
    }

    /// Return to the neutral state. Only for monitors nobody else can
    /// reach: a lost inflation race, or deflation at a safepoint.
    pub(crate) fn neutralize(&self) {
        debug_assert!(self.lock.contention_count() == 0);
        debug_assert!(self.lock.waiter_count() == 0);
        debug_assert!(self.in_use.load(Ordering::Acquire) == 0);
        self.object.store(0, Ordering::Release);
        self.recursion.store(0, Ordering::Release);
        self.hash_code.store(0, Ordering::Release);
        self.jni_count.store(0, Ordering::Release);
        self.lock.force_clear();
    }

    /// Pin against deflation. Must be called while holding the GC token
    /// (so no safepoint, hence no deflation, is in progress).
    pub(crate) fn pin(&self) {
        debug_assert!(VmThread::current().token_is_self());
        self.in_use.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        let old = self.in_use.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0);
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.in_use.load(Ordering::Acquire) > 0
    }

    // ------------------------------------------------------------------
    // Enter / exit

    /// Acquire this monitor, revoking a speculative owner's bias if
    /// necessary. On return the calling thread owns the lock; the caller
    /// records the acquire in its lock-record stack.
    pub fn enter(&'static self, rt: &SyncRuntime, thread: &'static VmThread) {
        let sp = rt.threads().safepoint();

        if self.lock.is_self_locked(thread) {
            // Re-entry is a lock attempt too: service pending revocations
            // (including one targeting this very monitor) before counting.
            drain_unbias_requests(rt, thread);
            let r = self.recursion.load(Ordering::Acquire);
            if r > 0 {
                self.recursion.store(r + 1, Ordering::Release);
            }
            // Speculative (or mid-revoke) re-entry: depth is tracked by the
            // lock-record push alone.
            return;
        }

        self.pin();
        // Set once we are counted in the lock word's contention field;
        // from then on the lock may only be taken through the semaphore.
        let mut counted = false;
        loop {
            if !counted && self.lock.try_lock(thread) {
                // Fresh acquisitions of an inflated monitor are always
                // counted; only the original bias rides in speculatively.
                // The store also clears a -1 left by a revocation that
                // raced the old owner's release.
                self.recursion.store(1, Ordering::Release);
                break;
            }
            let owner_tid = self.lock.owner_tid();
            if owner_tid == 0 {
                if !counted {
                    continue;
                }
                // The word went free through an unlock, which consumed one
                // contention unit and banked a permit. Fall through to the
                // semaphore wait to collect it, then race for the word.
            } else {
                // A speculative owner will never release the lock word on
                // its own; make sure a revocation is pending.
                if self.recursion.load(Ordering::Acquire) == 0
                    && self
                        .recursion
                        .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    trace!("{:?} requests bias revocation of monitor #{}", thread, self.id);
                    let posted = rt.threads().with_threads_lock(|| {
                        match rt.threads().live_thread(owner_tid) {
                            Some(owner) => {
                                owner.post_unbias_request(self.id);
                                true
                            }
                            None => false,
                        }
                    });
                    rt.note_revocation_request();
                    if !posted {
                        // Dead owner: its lock records are gone, so its
                        // depth is zero. Strip the lock word on its behalf.
                        // We won the -1 CAS, so we are the only stripper.
                        self.recursion.store(0, Ordering::Release);
                        if self.lock.owner_tid() == owner_tid && self.lock.try_unlock() {
                            self.lock.sem_post();
                        }
                        continue;
                    }
                }

                // If the owner is blocked it cannot service its inbox;
                // seize its token and crawl its records for it.
                if self.recursion.load(Ordering::Acquire) == -1 {
                    if let Some(owner) = rt.threads().reverse_tid(owner_tid) {
                        if owner.token_vm_attempt() {
                            if self.lock.owner_tid() == owner_tid
                                && self.recursion.load(Ordering::Acquire) == -1
                            {
                                owner.remove_unbias_request(self.id);
                                unbias_one(owner, self);
                            }
                            owner.token_vm_release(sp);
                            continue;
                        }
                    }
                }
            }

            // Park behind the contention count. Bounded, because the state
            // we are waiting on (owner blocking, owner dying, revocation
            // completing) is re-examined at the loop head.
            if !counted {
                if !self.lock.try_raise_contention() {
                    continue;
                }
                counted = true;
            }
            thread.release_token();
            let got_permit = self.lock.sem_timed_wait(REVOKE_POLL);
            thread.acquire_token(sp);
            if got_permit {
                // The unlocker consumed our contention count along with
                // this permit; we may race for the lock word again.
                counted = false;
            }
        }
        self.unpin();
    }

    /// Release one level of this monitor. The caller pops its lock record.
    pub fn exit(&self, thread: &VmThread) {
        debug_assert!(self.lock.is_self_locked(thread));
        let r = self.recursion.load(Ordering::Acquire);
        if r > 1 {
            self.recursion.store(r - 1, Ordering::Release);
        } else if r == 1 {
            self.recursion.store(0, Ordering::Release);
            self.lock.unlock(thread);
        }
        // r <= 0: speculative ownership. The lock word stays held; the
        // lock-record pop is the release.
    }

    /// Convert speculative ownership into a counted one. Needed when the
    /// release may come from a context that cannot pop a matching lock
    /// record, e.g. a JNI MonitorExit in a different frame.
    pub(crate) fn make_counted(&self, thread: &VmThread, obj: ObjectRef) {
        debug_assert!(self.lock.is_self_locked(thread));
        let r = self.recursion.load(Ordering::Acquire);
        if r > 0 {
            return;
        }
        let depth = thread.count_locks(obj) as i32;
        debug_assert!(depth > 0);
        self.recursion.store(depth, Ordering::Release);
    }

    /// Give back a fresh acquisition that turned out to be of a recycled
    /// monitor.
    pub(crate) fn abandon(&self, thread: &VmThread) {
        debug_assert!(self.lock.is_self_locked(thread));
        debug_assert!(self.recursion.load(Ordering::Acquire) == 1);
        self.recursion.store(0, Ordering::Release);
        self.lock.unlock(thread);
    }

    /// Force a full release on behalf of an exiting owner, waking anything
    /// parked behind it.
    pub(crate) fn release_exiting(&self, thread: &VmThread) {
        debug_assert!(self.lock.is_self_locked(thread));
        self.recursion.store(0, Ordering::Release);
        self.jni_count.store(0, Ordering::Release);
        self.lock.unlock(thread);
    }

    /// Redirect the bound object after a moving collection. Safepoint only.
    pub(crate) fn set_object(&self, obj: ObjectRef) {
        self.object.store(obj.raw(), Ordering::Release);
    }

    pub(crate) fn jni_entered(&self) {
        self.jni_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn jni_exited(&self) {
        let old = self.jni_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0);
    }

    // ------------------------------------------------------------------
    // Wait / notify

    /// `Object.wait`: release the monitor in full, join the wait set, then
    /// restore the exact ownership shape on wakeup. `millis == 0` waits
    /// forever. A notification that races a timeout or interrupt wins.
    pub fn wait_java(
        &self,
        rt: &SyncRuntime,
        thread: &'static VmThread,
        millis: i64,
        interruptible: bool,
    ) -> Result<(), GuestError> {
        debug_assert!(self.lock.is_self_locked(thread));
        if millis < 0 {
            return Err(GuestError::IllegalArgument("negative timeout"));
        }
        if interruptible && thread.is_interrupted_and_clear() {
            return Err(GuestError::Interrupted);
        }
        let timeout = if millis == 0 {
            None
        } else {
            Some(Duration::from_millis(millis as u64))
        };

        // Flatten to a full release: zero the recursion so the next owner
        // starts clean, remembering our counted depth. Speculative depth
        // needs no saving; it lives in our lock records, which we keep.
        let saved = self.recursion.load(Ordering::Acquire).max(0);
        self.recursion.store(0, Ordering::Release);

        self.pin();
        let expired = self
            .lock
            .wait(rt.threads().safepoint(), thread, timeout, interruptible);
        self.unpin();

        // We own the lock word again; whatever intermediate owners did to
        // the recursion word, our shape comes back now.
        self.recursion.store(saved, Ordering::Release);

        if expired && interruptible && thread.is_interrupted_and_clear() {
            return Err(GuestError::Interrupted);
        }
        Ok(())
    }

    pub fn notify(&self, thread: &VmThread) {
        debug_assert!(self.lock.is_self_locked(thread));
        self.lock.notify(thread);
    }

    pub fn notify_all(&self, thread: &VmThread) {
        debug_assert!(self.lock.is_self_locked(thread));
        self.lock.notify_all(thread);
    }
}

impl std::fmt::Debug for ObjectMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "ObjectMonitor[#{} obj={:#x} recursion={} {:?}]",
            self.id,
            self.object.load(Ordering::Relaxed),
            self.recursion.load(Ordering::Relaxed),
            self.lock
        )
    }
}

/// Resolve one revocation: with the owner's GC token held (by the owner
/// itself at a poll, or by a contender that seized it), replace speculative
/// ownership with the depth counted from the owner's lock records. A depth
/// of zero means the owner was not logically holding the lock at all, and
/// the lock word is released outright.
pub(crate) fn unbias_one(owner: &VmThread, mon: &ObjectMonitor) {
    if mon.recursion.load(Ordering::Acquire) != -1 {
        return; // stale request
    }
    if mon.lock.owner_tid() != owner.reversible_tid() {
        return; // monitor was recycled or ownership already moved on
    }
    let obj = match mon.object() {
        Some(obj) => obj,
        None => return,
    };
    let depth = owner.count_locks(obj) as i32;
    trace!(
        "revoking bias of monitor #{} owned by {:?}, depth {}",
        mon.id,
        owner,
        depth
    );
    if depth == 0 {
        mon.recursion.store(0, Ordering::Release);
        if mon.lock.try_unlock() {
            mon.lock.sem_post();
        }
    } else {
        mon.recursion.store(depth, Ordering::Release);
    }
}

/// Service every pending revocation request addressed to `thread`. Called
/// from safepoint polls and lock attempts; the thread holds its own token.
pub(crate) fn drain_unbias_requests(rt: &SyncRuntime, thread: &VmThread) {
    if !thread.has_unbias_requests() {
        return;
    }
    for id in thread.take_unbias_requests() {
        unbias_one(thread, rt.pool().monitor(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectHeader, ObjectRef};
    use crate::options::Options;
    use crate::synchronizer;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Instant;

    // A contender that raised the contention count must collect the permit
    // banked by an unlock it slept through, not spin past the free word.
    #[test]
    fn counted_contender_takes_lock_freed_while_it_was_stopped() {
        let options = Options {
            biased_locking: false,
            ..Options::default()
        };
        let rt: &'static SyncRuntime = Box::leak(Box::new(SyncRuntime::new(options)));
        let obj = ObjectRef::from_header(Box::leak(Box::new(ObjectHeader::new())));

        rt.register_thread("handover-owner");
        synchronizer::lock(rt, obj);
        let mon = rt.pool().monitor(obj.header().mark().monitor_id());
        assert_eq!(mon.recursion(), 1);

        let acquired = Arc::new(AtomicBool::new(false));
        let acquired2 = acquired.clone();
        let contender = std::thread::spawn(move || {
            rt.register_thread("handover-contender");
            synchronizer::lock(rt, obj);
            acquired2.store(true, Ordering::Release);
            synchronizer::unlock(rt, obj);
            rt.detach_current_thread();
        });

        while mon.contention_count() == 0 {
            std::thread::yield_now();
        }
        // Stop the world so the contender is parked between its timed
        // semaphore waits, then free the lock. The permit is banked with
        // nobody waiting on the semaphore at the moment it is posted.
        rt.begin_safepoint();
        std::thread::sleep(Duration::from_millis(10));
        synchronizer::unlock(rt, obj);
        rt.end_safepoint();

        let deadline = Instant::now() + Duration::from_secs(3);
        while !acquired.load(Ordering::Acquire) {
            assert!(
                Instant::now() < deadline,
                "contender never acquired the free monitor"
            );
            std::thread::yield_now();
        }
        contender.join().unwrap();
        rt.detach_current_thread();
    }
}
