//! The front door of the subsystem: mark-word fast paths with monitor
//! slow paths behind them.
//!
//! Every operation starts from one load of the object's mark word:
//!
//! -   `lock` takes a fresh object by CAS-ing its bias in, re-enters its own
//!     bias for free, strips a dead thread's bias, and otherwise inflates
//!     and enters the monitor;
//! -   `unlock` is a lock-record pop for a bias and a monitor exit
//!     otherwise. It never blocks and never fails: the bytecode-level
//!     balance of monitorenter/monitorexit is the caller's contract;
//! -   `hash_code` prefers the inline hash, falling back to (or forcing)
//!     the monitor's copy when locking and hashing collide;
//! -   `wait`/`notify` always operate on an inflated monitor, except that
//!     notifying a self-biased object is a no-op (a bias proves there is no
//!     wait set).
//!
//! Inflation is the one-way door between the two regimes; deflation, at a
//! safepoint, is the way back.

use log::{debug, trace};

use crate::error::GuestError;
use crate::monitor::ObjectMonitor;
use crate::object::ObjectRef;
use crate::runtime::SyncRuntime;
use crate::thread::VmThread;

/// Why a monitor is being inflated. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflateCause {
    Enter,
    Wait,
    HashCode,
    JniEnter,
}

/// Acquire the object lock. Blocks until owned.
pub fn lock(rt: &SyncRuntime, obj: ObjectRef) {
    let thread = VmThread::current();
    let tid = thread.reversible_tid();
    // A lock attempt is a revocation service point: a thread that never
    // reaches a safepoint poll must still not stall its revokers.
    crate::monitor::drain_unbias_requests(rt, thread);
    loop {
        let mark = obj.header().mark();

        if mark.is_biased() {
            if mark.biased_tid() == tid {
                break;
            }
            if rt.threads().live_thread(mark.biased_tid()).is_none() {
                // The bias owner died without contention; nobody will ever
                // unlock. Strip the bias and retry.
                obj.header().cas_set_mark(mark.as_fresh(), mark);
                continue;
            }
        } else if mark.is_fresh() && rt.options().biased_locking {
            if obj.header().cas_set_mark(mark.as_biaslocked(tid), mark) == mark {
                trace!("{:?} bias-locks {:?}", thread, obj);
                break;
            }
            continue;
        }

        // Biased to a live thread, hashed, or already heavy.
        let mon = if mark.has_monitor() {
            rt.pool().monitor(mark.monitor_id())
        } else {
            inflate(rt, obj, InflateCause::Enter)
        };
        let was_owner = mon.is_owned_by(thread);
        mon.enter(rt, thread);
        if !was_owner && mon.object_raw() != obj.raw() {
            // The monitor was rebound between the mark load and the
            // acquire. Give it back and start over.
            mon.abandon(thread);
            continue;
        }
        break;
    }
    thread.push_lock_record(obj);
}

/// Release the object lock. Never blocks; unbalanced release is a caller
/// bug and asserts.
pub fn unlock(rt: &SyncRuntime, obj: ObjectRef) {
    let thread = VmThread::current();
    thread.pop_lock_record(obj);
    let mark = obj.header().mark();
    if mark.is_biased() {
        debug_assert_eq!(mark.biased_tid(), thread.reversible_tid());
        // The pop was the release; the bias stays in place.
        return;
    }
    debug_assert!(mark.has_monitor());
    let mon = rt.pool().monitor(mark.monitor_id());
    mon.exit(thread);
}

/// Does the calling thread hold the object lock?
pub fn current_thread_holds_lock(rt: &SyncRuntime, obj: ObjectRef) -> bool {
    let thread = VmThread::current();
    let mark = obj.header().mark();
    if mark.is_biased() {
        return mark.biased_tid() == thread.reversible_tid() && thread.count_locks(obj) > 0;
    }
    if mark.has_monitor() {
        return owns_monitor(thread, rt.pool().monitor(mark.monitor_id()), obj);
    }
    false
}

/// The object's identity hash, generating and installing one on first use.
/// Stable across inflation and deflation.
pub fn hash_code(rt: &SyncRuntime, obj: ObjectRef) -> i32 {
    let thread = VmThread::current();
    loop {
        let mark = obj.header().mark();
        if mark.has_monitor() {
            let mon = rt.pool().monitor(mark.monitor_id());
            let hash = mon.hash_code();
            if hash != 0 {
                return hash;
            }
            return mon.install_hash(thread.next_hash());
        }
        let hash = mark.hash();
        if hash != 0 {
            return hash;
        }
        if mark.is_fresh() {
            let hashed = mark.copy_set_hash(thread.next_hash());
            if obj.header().cas_set_mark(hashed, mark) == mark {
                return hashed.hash();
            }
            continue;
        }
        // Biased: the word cannot hold both a bias and a hash, so the
        // object goes heavy and the monitor carries the hash.
        debug_assert!(mark.is_biased());
        let mon = inflate(rt, obj, InflateCause::HashCode);
        return mon.install_hash(thread.next_hash());
    }
}

/// `Object.wait(millis)`. `millis == 0` waits until notified.
pub fn wait(rt: &SyncRuntime, obj: ObjectRef, millis: i64) -> Result<(), GuestError> {
    wait_impl(rt, obj, millis, true)
}

/// `wait` for callers that must not observe interrupts (e.g. internal VM
/// waits). The interrupt status is left untouched.
pub fn wait_uninterruptibly(rt: &SyncRuntime, obj: ObjectRef, millis: i64) -> Result<(), GuestError> {
    wait_impl(rt, obj, millis, false)
}

fn wait_impl(
    rt: &SyncRuntime,
    obj: ObjectRef,
    millis: i64,
    interruptible: bool,
) -> Result<(), GuestError> {
    let thread = VmThread::current();
    // Waiting always needs a wait set, hence a monitor, even under a bias.
    let mon = inflate(rt, obj, InflateCause::Wait);
    if !owns_monitor(thread, mon, obj) {
        return Err(GuestError::IllegalMonitorState);
    }
    mon.wait_java(rt, thread, millis, interruptible)
}

/// `Object.notify`.
pub fn notify(rt: &SyncRuntime, obj: ObjectRef) -> Result<(), GuestError> {
    notify_impl(rt, obj, false)
}

/// `Object.notifyAll`.
pub fn notify_all(rt: &SyncRuntime, obj: ObjectRef) -> Result<(), GuestError> {
    notify_impl(rt, obj, true)
}

fn notify_impl(rt: &SyncRuntime, obj: ObjectRef, all: bool) -> Result<(), GuestError> {
    let thread = VmThread::current();
    let mark = obj.header().mark();
    if mark.is_biased() && mark.biased_tid() == thread.reversible_tid() {
        // Self-biased: no monitor has ever existed, so there are no
        // waiters; ownership is all that needs checking.
        return if thread.count_locks(obj) > 0 {
            Ok(())
        } else {
            Err(GuestError::IllegalMonitorState)
        };
    }
    if !mark.has_monitor() {
        return Err(GuestError::IllegalMonitorState);
    }
    let mon = rt.pool().monitor(mark.monitor_id());
    if !owns_monitor(thread, mon, obj) {
        return Err(GuestError::IllegalMonitorState);
    }
    if all {
        mon.notify_all(thread);
    } else {
        mon.notify(thread);
    }
    Ok(())
}

/// JNI `MonitorEnter`. Always inflates: the matching exit may come from a
/// frame (or even a lock-record-less context) that cannot participate in
/// biased bookkeeping, so ownership is converted to a counted one.
pub fn jni_enter(rt: &SyncRuntime, obj: ObjectRef) {
    let thread = VmThread::current();
    crate::monitor::drain_unbias_requests(rt, thread);
    loop {
        let mon = inflate(rt, obj, InflateCause::JniEnter);
        let was_owner = mon.is_owned_by(thread);
        mon.enter(rt, thread);
        if !was_owner && mon.object_raw() != obj.raw() {
            mon.abandon(thread);
            continue;
        }
        thread.push_lock_record(obj);
        mon.make_counted(thread, obj);
        mon.jni_entered();
        return;
    }
}

/// JNI `MonitorExit`. Unlike bytecode unlock this can be called
/// unbalanced, so it reports rather than asserts.
pub fn jni_exit(rt: &SyncRuntime, obj: ObjectRef) -> Result<(), GuestError> {
    let thread = VmThread::current();
    let mark = obj.header().mark();
    if !mark.has_monitor() {
        return Err(GuestError::IllegalMonitorState);
    }
    let mon = rt.pool().monitor(mark.monitor_id());
    if !mon.is_owned_by(thread) || mon.recursion() <= 0 || mon.jni_count() == 0 {
        return Err(GuestError::IllegalMonitorState);
    }
    mon.jni_exited();
    thread.pop_lock_record(obj);
    mon.exit(thread);
    Ok(())
}

/// Force-release every monitor a dying thread still owns. Wakes anything
/// blocked behind it. Biased marks without monitors are left for the
/// dead-owner strip in [`lock`].
pub fn release_monitors_owned_by_thread(rt: &SyncRuntime, thread: &'static VmThread) {
    rt.pool().for_each_live(|mon| {
        if mon.is_owned_by(thread) {
            debug!("releasing {:?} owned by exiting {:?}", mon, thread);
            mon.release_exiting(thread);
        }
    });
    thread.clear_lock_records();
}

/// Bind (or find) the monitor for `obj`. Idempotent; the loser of an
/// inflation race hands its monitor straight back to the pool.
pub(crate) fn inflate(
    rt: &SyncRuntime,
    obj: ObjectRef,
    cause: InflateCause,
) -> &'static ObjectMonitor {
    loop {
        let mark = obj.header().mark();
        if mark.has_monitor() {
            return rt.pool().monitor(mark.monitor_id());
        }
        let mon = rt.pool().allocate();
        mon.bind(obj, mark);
        if obj.header().cas_set_mark(mark.as_heavylocked(mon.id()), mark) == mark {
            rt.pool().push_live(mon);
            rt.note_inflation();
            trace!("inflated {:?} -> {:?} ({:?})", obj, mon, cause);
            return mon;
        }
        mon.neutralize();
        rt.pool().free(mon);
    }
}

/// Deflate every idle monitor, restoring the mark words of their objects.
/// Must run at a safepoint. Returns the number of monitors recycled.
pub fn deflate_idle_monitors(rt: &SyncRuntime) -> usize {
    debug_assert!(rt.threads().safepoint().is_at_safepoint());
    let mut deflated = 0;
    rt.pool().retain_live(|mon| {
        if !can_deflate(rt, mon) {
            return true;
        }
        let obj = match mon.object() {
            Some(obj) => obj,
            None => return true,
        };
        let mark = obj.header().mark();
        debug_assert!(mark.has_monitor() && mark.monitor_id() == mon.id());
        let mut restored = mark.as_fresh();
        let hash = mon.hash_code();
        if hash != 0 {
            restored = restored.copy_set_hash(hash);
        }
        obj.header().set_mark(restored);
        mon.neutralize();
        deflated += 1;
        false
    });
    rt.note_deflation_sweep(deflated);
    debug!("deflation sweep recycled {} monitors", deflated);
    deflated
}

/// A monitor is idle when nothing observable hangs off it: no waiters, no
/// contention, no JNI balance, no pin, no revocation in flight, and any
/// owner is either dead or holds it speculatively at depth zero.
fn can_deflate(rt: &SyncRuntime, mon: &ObjectMonitor) -> bool {
    if mon.is_pinned()
        || mon.jni_count() > 0
        || mon.waiter_count() > 0
        || mon.contention_count() > 0
    {
        return false;
    }
    let recursion = mon.recursion();
    if recursion == -1 {
        return false;
    }
    let owner_tid = mon.owner_tid();
    if owner_tid == 0 {
        debug_assert_eq!(recursion, 0);
        return true;
    }
    match rt.threads().live_thread(owner_tid) {
        // A dead owner's lock records died with it.
        None => true,
        Some(owner) => {
            if recursion > 0 {
                return false;
            }
            // A speculative live owner: deflatable only if it holds no
            // logical depth. The owner is stopped at the safepoint, so its
            // lock records are stable.
            match mon.object() {
                Some(obj) => owner.count_locks(obj) == 0,
                None => false,
            }
        }
    }
}

/// Visit every object reference this subsystem holds (monitor
/// back-references and thread lock records), storing back whatever the
/// closure returns. Safepoint only; this is how a moving collector
/// redirects the subsystem after copying objects.
pub fn oops_do(rt: &SyncRuntime, mut visit: impl FnMut(ObjectRef) -> ObjectRef) {
    debug_assert!(rt.threads().safepoint().is_at_safepoint());
    rt.pool().for_each_live(|mon| {
        if let Some(obj) = mon.object() {
            mon.set_object(visit(obj));
        }
    });
    for thread in rt.threads().threads() {
        thread.redirect_lock_records(&mut visit);
    }
}

fn owns_monitor(thread: &VmThread, mon: &ObjectMonitor, obj: ObjectRef) -> bool {
    mon.is_owned_by(thread) && (mon.recursion() > 0 || thread.count_locks(obj) > 0)
}
