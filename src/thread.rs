//! VM thread identity and the thread registry.
//!
//! Every thread that touches an object lock is registered here and gets a
//! *reversible thread id*: a compact non-zero integer, low two bits zero,
//! that packs into mark words and lock words and converts back to the
//! thread's control block in O(1). Thread control blocks are type-stable
//! (leaked, never freed), so reversing the id of a dead thread yields a
//! control block whose `is_dead` flag is the liveness answer, never a
//! dangling pointer.
//!
//! Each thread also carries:
//! -   its *GC token*: held (`Self_`) while the thread runs VM code,
//!     surrendered while it blocks, or seized (`Vm`) by a thread performing
//!     a stop-the-world operation or a remote bias revocation;
//! -   a *lock-record stack*: one entry per object lock acquire that did not
//!     bump a monitor recursion count, crawled to recover the true recursion
//!     depth when a bias is revoked;
//! -   a *revoke inbox*: monitor ids pushed by threads that want this
//!     thread's bias revoked, drained at safepoint polls;
//! -   the per-thread xorshift state feeding identity hash generation.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crossbeam::utils::Backoff;
use log::trace;

use crate::mark_word::{HASH_VALUE_MASK, LOCK_BITS};
use crate::object::ObjectRef;
use crate::pool::MonitorId;
use crate::raw_lock::WaitLock;
use crate::safepoint::SafepointSynchronize;

/// Capacity of the registry. Slots are never recycled, so this bounds the
/// total number of threads registered over the life of the VM.
pub const MAX_THREADS: usize = 1 << 14;

/// GC token states. See module docs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GcToken {
    /// The thread is blocked or detached; anyone may seize the token.
    Free = 0,
    /// The thread itself holds the token and may mutate VM state.
    Self_ = 1,
    /// A remote thread (safepoint or bias revoker) holds the token; the
    /// thread must not re-enter VM code until it is released.
    Vm = 2,
}

thread_local! {
    static CURRENT: Cell<Option<&'static VmThread>> = const { Cell::new(None) };
}

/// Per-thread control block. Type-stable: allocated once, never freed.
pub struct VmThread {
    tid: u64,
    name: String,
    token: AtomicU8,
    dead: AtomicBool,
    interrupted: AtomicBool,
    /// Set (with the registry lock held) when something is pushed onto
    /// `unbias`; cheap cooperative check for safepoint polls.
    unbias_requested: AtomicBool,
    /// Monitor ids whose bias this thread has been asked to revoke.
    /// Insertion requires the registry's threads lock, so the inserter can
    /// pin this thread's liveness; the owner drains without it.
    unbias: Mutex<Vec<MonitorId>>,
    /// One entry per un-counted object lock acquire by this thread.
    lock_records: Mutex<Vec<ObjectRef>>,
    /// Marsaglia xorshift state for identity hash generation.
    hash_state: [AtomicU32; 4],
    /// The WaitLock this thread is blocked in `wait()` on, if any. Used by
    /// `interrupt` to kick the waiter. WaitLocks under monitors are
    /// type-stable, so a stale pointer here is always safe to poke.
    current_waiting: AtomicPtr<WaitLock>,
    parker: Parker,
}

impl VmThread {
    fn new(tid: u64, name: String) -> VmThread {
        let seed = (tid as u32).wrapping_mul(0x9e37_79b9) | 1;
        VmThread {
            tid,
            name,
            // Acquired by the registering thread once the control block is
            // published, so registration synchronizes with safepoints.
            token: AtomicU8::new(GcToken::Free as u8),
            dead: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            unbias_requested: AtomicBool::new(false),
            unbias: Mutex::new(Vec::new()),
            lock_records: Mutex::new(Vec::new()),
            hash_state: [
                AtomicU32::new(seed),
                AtomicU32::new(seed.rotate_left(7) | 1),
                AtomicU32::new(seed.rotate_left(17) | 1),
                AtomicU32::new(seed.rotate_left(25) | 1),
            ],
            current_waiting: AtomicPtr::new(std::ptr::null_mut()),
            parker: Parker::new(),
        }
    }

    /// The control block of the calling thread. The thread must have been
    /// registered with [`ThreadRegistry::register`].
    pub fn current() -> &'static VmThread {
        VmThread::try_current().expect("calling thread is not registered with the VM")
    }

    pub fn try_current() -> Option<&'static VmThread> {
        CURRENT.with(|c| c.get())
    }

    /// The packed reversible id: `(slot + 1) << 2`, never zero, low two bits
    /// zero so a biased mark word can be tested with a single compare.
    pub fn reversible_tid(&self) -> u64 {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // GC token

    pub fn token_is_self(&self) -> bool {
        self.token.load(Ordering::Acquire) == GcToken::Self_ as u8
    }

    /// Acquire our own token, blocking while a safepoint or revoker holds
    /// it. Refuses to take the token while a safepoint is pending, even if
    /// it is still free: the requester may have snapshotted the registry
    /// before we appeared in it.
    pub fn acquire_token(&self, sp: &SafepointSynchronize) {
        let backoff = Backoff::new();
        loop {
            if sp.is_requested() {
                sp.wait_for_resume();
            }
            match self.token.compare_exchange(
                GcToken::Free as u8,
                GcToken::Self_ as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(state) if state == GcToken::Vm as u8 => sp.wait_for_resume(),
                Err(_) => backoff.snooze(),
            }
        }
    }

    /// Surrender our own token before blocking.
    pub fn release_token(&self) {
        let old = self.token.swap(GcToken::Free as u8, Ordering::AcqRel);
        debug_assert_eq!(old, GcToken::Self_ as u8);
    }

    /// Try to seize this (other) thread's token. Succeeds only while the
    /// thread is blocked or detached, which is exactly the proof a revoker
    /// needs that the owner cannot be mid-protocol.
    pub fn token_vm_attempt(&self) -> bool {
        self.token
            .compare_exchange(
                GcToken::Free as u8,
                GcToken::Vm as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Release a seized token and wake the thread if it is waiting for it.
    pub fn token_vm_release(&self, sp: &SafepointSynchronize) {
        self.return_vm_token();
        sp.notify_resumed();
    }

    /// Release a seized token without waking anyone. Safepoint resume
    /// returns all tokens first and notifies once. Tolerates tokens that
    /// were never seized (dead threads, threads that registered while the
    /// world was stopped).
    pub(crate) fn return_vm_token(&self) {
        let _ = self.token.compare_exchange(
            GcToken::Vm as u8,
            GcToken::Free as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    // ------------------------------------------------------------------
    // Lock records

    pub(crate) fn push_lock_record(&self, obj: ObjectRef) {
        self.lock_records.lock().unwrap().push(obj);
    }

    pub(crate) fn pop_lock_record(&self, obj: ObjectRef) {
        let mut records = self.lock_records.lock().unwrap();
        let idx = records
            .iter()
            .rposition(|r| *r == obj)
            .expect("unlock of an object this thread never locked");
        records.remove(idx);
    }

    /// Drop all lock records. Only for thread exit, after the records'
    /// monitors have been force-released.
    pub(crate) fn clear_lock_records(&self) {
        self.lock_records.lock().unwrap().clear();
    }

    /// Rewrite every lock record through `visit`. Safepoint only; this is
    /// the thread-side half of redirecting references after a moving
    /// collection.
    pub(crate) fn redirect_lock_records(&self, visit: &mut dyn FnMut(ObjectRef) -> ObjectRef) {
        for record in self.lock_records.lock().unwrap().iter_mut() {
            *record = visit(*record);
        }
    }

    /// Count this thread's lock records for `obj`: the recursion depth of an
    /// un-counted (biased) lock. Readable remotely only while the reader
    /// holds this thread's token.
    pub fn count_locks(&self, obj: ObjectRef) -> usize {
        self.lock_records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| **r == obj)
            .count()
    }

    // ------------------------------------------------------------------
    // Revoke inbox

    pub(crate) fn has_unbias_requests(&self) -> bool {
        self.unbias_requested.load(Ordering::Acquire)
    }

    /// Push a revoke request. Caller must hold the registry's threads lock.
    pub(crate) fn post_unbias_request(&self, id: MonitorId) {
        self.unbias.lock().unwrap().push(id);
        self.unbias_requested.store(true, Ordering::Release);
    }

    /// Take the pending revoke requests for draining.
    pub(crate) fn take_unbias_requests(&self) -> Vec<MonitorId> {
        self.unbias_requested.store(false, Ordering::Release);
        std::mem::take(&mut *self.unbias.lock().unwrap())
    }

    /// Remove one pending request, if present. Caller must hold this
    /// thread's token (it is about to do the revoke itself).
    pub(crate) fn remove_unbias_request(&self, id: MonitorId) {
        let mut inbox = self.unbias.lock().unwrap();
        if let Some(idx) = inbox.iter().position(|m| *m == id) {
            inbox.remove(idx);
        }
    }

    // ------------------------------------------------------------------
    // Interrupts

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub fn is_interrupted_and_clear(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Interrupt this thread: sets the flag, kicks any monitor `wait()` in
    /// progress and delivers a park permit.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        let waiting = self.current_waiting.load(Ordering::Acquire);
        if !waiting.is_null() {
            unsafe { &*waiting }.interrupt_wake();
        }
        self.parker.unpark();
    }

    pub(crate) fn set_current_waiting(&self, lock: *const WaitLock) {
        self.current_waiting
            .store(lock as *mut WaitLock, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Identity hash generation

    /// Marsaglia's xor-shift scheme with thread-specific state. The value 0
    /// is reserved to mean "unset", so it maps to an arbitrary non-zero
    /// constant.
    pub fn next_hash(&self) -> i32 {
        let mut t = self.hash_state[0].load(Ordering::Relaxed);
        t ^= t << 11;
        self.hash_state[0].store(self.hash_state[1].load(Ordering::Relaxed), Ordering::Relaxed);
        self.hash_state[1].store(self.hash_state[2].load(Ordering::Relaxed), Ordering::Relaxed);
        self.hash_state[2].store(self.hash_state[3].load(Ordering::Relaxed), Ordering::Relaxed);
        let mut v = self.hash_state[3].load(Ordering::Relaxed);
        v = (v ^ (v >> 19)) ^ (t ^ (t >> 8));
        self.hash_state[3].store(v, Ordering::Relaxed);

        let value = (v as i32) & HASH_VALUE_MASK;
        if value == 0 {
            0xBAD
        } else {
            value
        }
    }

    // ------------------------------------------------------------------
    // Park / unpark

    /// Park the calling thread until unparked, interrupted, or `timeout`
    /// elapses. Spurious returns are allowed; the permit (if any) is
    /// consumed. Surrenders the GC token for the duration.
    pub fn park(&self, sp: &SafepointSynchronize, timeout: Option<Duration>) {
        debug_assert!(std::ptr::eq(VmThread::current(), self));
        if self.is_interrupted() {
            return;
        }
        self.release_token();
        self.parker.park(timeout);
        self.acquire_token(sp);
    }

    pub fn unpark(&self) {
        self.parker.unpark();
    }
}

impl std::fmt::Debug for VmThread {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "VmThread[{} tid={:#x}]", self.name, self.tid)
    }
}

/// One-permit latch used for `java.util.concurrent` style park/unpark.
/// Unlike a monitor wait there is no notify bookkeeping: spurious returns
/// are fine, and multiple unparks collapse into one permit.
struct Parker {
    counter: AtomicU32,
    sync: Mutex<()>,
    cond: Condvar,
}

impl Parker {
    fn new() -> Parker {
        Parker {
            counter: AtomicU32::new(0),
            sync: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    fn park(&self, timeout: Option<Duration>) {
        // Fast path: consume an existing permit without blocking.
        if self.counter.swap(0, Ordering::AcqRel) > 0 {
            return;
        }
        let guard = self.sync.lock().unwrap();
        if self.counter.load(Ordering::Acquire) == 0 {
            match timeout {
                Some(t) => {
                    drop(self.cond.wait_timeout(guard, t).unwrap());
                }
                None => {
                    drop(self.cond.wait(guard).unwrap());
                }
            }
        }
        self.counter.store(0, Ordering::Release);
    }

    fn unpark(&self) {
        if self
            .counter
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _guard = self.sync.lock().unwrap();
            self.cond.notify_one();
        }
    }
}

/// The registry of all VM threads, owner of the global threads lock that
/// serializes cross-thread operations (liveness checks plus revoke-inbox
/// insertion) which cannot be done lock-free.
pub struct ThreadRegistry {
    /// Guards revoke-inbox insertion and the liveness decisions taken while
    /// inserting. Deliberately a plain mutex: everything done under it is
    /// short and never blocks on a VM lock.
    threads_lock: Mutex<()>,
    slots: Box<[AtomicPtr<VmThread>]>,
    next_slot: AtomicUsize,
    safepoint: SafepointSynchronize,
}

impl ThreadRegistry {
    pub fn new() -> ThreadRegistry {
        let slots = (0..MAX_THREADS)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ThreadRegistry {
            threads_lock: Mutex::new(()),
            slots,
            next_slot: AtomicUsize::new(0),
            safepoint: SafepointSynchronize::new(),
        }
    }

    pub fn safepoint(&self) -> &SafepointSynchronize {
        &self.safepoint
    }

    /// Register the calling OS thread, giving it a reversible id and its GC
    /// token. Fatal if the registry is full.
    pub fn register(&self, name: &str) -> &'static VmThread {
        assert!(
            VmThread::try_current().is_none(),
            "thread is already registered"
        );
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        assert!(slot < MAX_THREADS, "out of VM thread slots");
        let tid = ((slot as u64) + 1) << LOCK_BITS;
        let thread: &'static VmThread = Box::leak(Box::new(VmThread::new(tid, name.to_string())));
        self.slots[slot].store(
            thread as *const VmThread as *mut VmThread,
            Ordering::Release,
        );
        CURRENT.with(|c| c.set(Some(thread)));
        // Publish first, then take the token: a safepoint racing this
        // registration either sees us and seizes the free token, or does
        // not see us and the acquire blocks until the world resumes.
        thread.acquire_token(&self.safepoint);
        trace!("registered thread {:?}", thread);
        thread
    }

    /// Reverse a packed tid back to its control block. Returns the block
    /// whether or not the thread is still alive; `None` only for ids that
    /// were never issued.
    pub fn reverse_tid(&self, tid: u64) -> Option<&'static VmThread> {
        debug_assert!(tid & ((1 << LOCK_BITS) - 1) == 0);
        if tid == 0 {
            return None;
        }
        let slot = ((tid >> LOCK_BITS) - 1) as usize;
        if slot >= MAX_THREADS {
            return None;
        }
        let ptr = self.slots[slot].load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    /// Reverse a tid, filtering out dead threads.
    pub fn live_thread(&self, tid: u64) -> Option<&'static VmThread> {
        self.reverse_tid(tid).filter(|t| !t.is_dead())
    }

    /// Run `f` with the threads lock held.
    pub(crate) fn with_threads_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.threads_lock.lock().unwrap();
        f()
    }

    /// Iterate over every thread ever registered, dead or alive.
    pub fn threads(&self) -> impl Iterator<Item = &'static VmThread> + '_ {
        let n = self.next_slot.load(Ordering::Acquire).min(MAX_THREADS);
        (0..n).filter_map(move |i| {
            let ptr = self.slots[i].load(Ordering::Acquire);
            if ptr.is_null() {
                None
            } else {
                Some(unsafe { &*ptr as &'static VmThread })
            }
        })
    }

    /// Mark the calling thread dead and surrender its token. The caller is
    /// expected to have released its monitors first (see
    /// [`release_monitors_owned_by_thread`](crate::synchronizer::release_monitors_owned_by_thread)).
    pub fn detach(&self, thread: &'static VmThread) {
        debug_assert!(std::ptr::eq(VmThread::current(), thread));
        thread.dead.store(true, Ordering::Release);
        thread.release_token();
        CURRENT.with(|c| c.set(None));
        trace!("detached thread {:?}", thread);
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}
