//! End-to-end tests of the object lock protocol: bias fast paths,
//! inflation, revocation, wait/notify, identity hashing and deflation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use objsync::{synchronizer, GuestError, ObjectHeader, ObjectRef, SyncRuntime};

fn leak_object() -> ObjectRef {
    ObjectRef::from_header(Box::leak(Box::new(ObjectHeader::new())))
}

#[test]
fn bias_lock_stays_thin() {
    let rt = SyncRuntime::default();
    rt.register_thread("bias-thin");
    let obj = leak_object();

    synchronizer::lock(&rt, obj);
    synchronizer::lock(&rt, obj);
    assert!(synchronizer::current_thread_holds_lock(&rt, obj));
    synchronizer::unlock(&rt, obj);
    assert!(synchronizer::current_thread_holds_lock(&rt, obj));
    synchronizer::unlock(&rt, obj);
    assert!(!synchronizer::current_thread_holds_lock(&rt, obj));

    // Uncontended locking never inflates.
    assert_eq!(rt.stats().inflations, 0);
    // The bias outlives the unlock: relocking is free.
    assert!(obj.header().mark().is_biased());
    synchronizer::lock(&rt, obj);
    synchronizer::unlock(&rt, obj);
    rt.detach_current_thread();
}

#[test]
fn contended_lock_is_mutually_exclusive() {
    let rt = Arc::new(SyncRuntime::default());
    let obj = leak_object();
    let threads = num_cpus::get().clamp(2, 8);
    let rounds = 500;

    // Unsynchronized increments; only the object lock makes them safe.
    let counter = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let rt = rt.clone();
            let counter = counter.clone();
            std::thread::spawn(move || {
                rt.register_thread(&format!("mutex-{}", i));
                for _ in 0..rounds {
                    synchronizer::lock(&rt, obj);
                    let v = counter.load(Ordering::Relaxed);
                    std::hint::black_box(v);
                    counter.store(v + 1, Ordering::Relaxed);
                    synchronizer::unlock(&rt, obj);
                }
                rt.detach_current_thread();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), threads * rounds);
}

#[test]
fn revocation_preserves_recursion_depth() {
    let rt = Arc::new(SyncRuntime::default());
    let obj = leak_object();

    let depth_taken = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let contender_done = Arc::new(AtomicBool::new(false));

    let owner = {
        let rt = rt.clone();
        let depth_taken = depth_taken.clone();
        let release = release.clone();
        std::thread::spawn(move || {
            rt.register_thread("revoke-owner");
            synchronizer::lock(&rt, obj);
            synchronizer::lock(&rt, obj);
            synchronizer::lock(&rt, obj);
            assert!(obj.header().mark().is_biased());
            depth_taken.store(true, Ordering::Release);
            // Service revocation requests until told to release.
            while !release.load(Ordering::Acquire) {
                rt.poll_at_safepoint();
                std::thread::yield_now();
            }
            synchronizer::unlock(&rt, obj);
            synchronizer::unlock(&rt, obj);
            // Still ours until the last unlock.
            assert!(synchronizer::current_thread_holds_lock(&rt, obj));
            synchronizer::unlock(&rt, obj);
            rt.detach_current_thread();
        })
    };

    while !depth_taken.load(Ordering::Acquire) {
        std::thread::yield_now();
    }

    let contender = {
        let rt = rt.clone();
        let contender_done = contender_done.clone();
        std::thread::spawn(move || {
            rt.register_thread("revoke-contender");
            synchronizer::lock(&rt, obj);
            contender_done.store(true, Ordering::Release);
            synchronizer::unlock(&rt, obj);
            rt.detach_current_thread();
        })
    };

    // The contender forces inflation and a revocation request; the owner
    // keeps the lock at its full depth until all three unlocks.
    while !obj.header().mark().has_monitor() {
        assert!(!contender_done.load(Ordering::Acquire));
        std::thread::yield_now();
    }
    std::thread::sleep(Duration::from_millis(20));
    assert!(!contender_done.load(Ordering::Acquire));

    release.store(true, Ordering::Release);
    owner.join().unwrap();
    contender.join().unwrap();
    assert!(contender_done.load(Ordering::Acquire));
    assert!(rt.stats().revocations >= 1);
}

#[test]
fn lock_attempts_service_revocation_requests() {
    let rt = Arc::new(SyncRuntime::default());
    let biased = leak_object();
    let other = leak_object();

    let ready = Arc::new(AtomicBool::new(false));
    let acquired = Arc::new(AtomicBool::new(false));

    // The owner computes away on other locks and never reaches a safepoint
    // poll; its lock attempts alone must service the revocation.
    let owner = {
        let rt = rt.clone();
        let ready = ready.clone();
        let acquired = acquired.clone();
        std::thread::spawn(move || {
            rt.register_thread("busy-owner");
            synchronizer::lock(&rt, biased);
            synchronizer::unlock(&rt, biased);
            assert!(biased.header().mark().is_biased());
            ready.store(true, Ordering::Release);
            let deadline = std::time::Instant::now() + Duration::from_secs(10);
            while !acquired.load(Ordering::Acquire) && std::time::Instant::now() < deadline {
                synchronizer::lock(&rt, other);
                synchronizer::unlock(&rt, other);
            }
            rt.detach_current_thread();
        })
    };
    while !ready.load(Ordering::Acquire) {
        std::thread::yield_now();
    }

    let contender = {
        let rt = rt.clone();
        let acquired = acquired.clone();
        std::thread::spawn(move || {
            rt.register_thread("busy-contender");
            synchronizer::lock(&rt, biased);
            acquired.store(true, Ordering::Release);
            synchronizer::unlock(&rt, biased);
            rt.detach_current_thread();
        })
    };

    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while !acquired.load(Ordering::Acquire) {
        assert!(
            std::time::Instant::now() < deadline,
            "owner's lock attempts never serviced the revocation"
        );
        std::thread::yield_now();
    }
    owner.join().unwrap();
    contender.join().unwrap();
    assert!(rt.stats().revocations >= 1);
}

#[test]
fn revoking_a_parked_owner_counts_its_depth() {
    let rt = Arc::new(SyncRuntime::default());
    let obj = leak_object();
    let (tx, rx) = std::sync::mpsc::channel();
    let resume = Arc::new(AtomicBool::new(false));
    let acquired = Arc::new(AtomicBool::new(false));

    let owner = {
        let rt = rt.clone();
        let resume = resume.clone();
        std::thread::spawn(move || {
            let thread = rt.register_thread("parked-owner");
            synchronizer::lock(&rt, obj);
            synchronizer::lock(&rt, obj);
            synchronizer::lock(&rt, obj);
            assert!(obj.header().mark().is_biased());
            tx.send(thread as *const _ as usize).unwrap();
            while !resume.load(Ordering::Acquire) {
                thread.park(rt.threads().safepoint(), None);
            }
            synchronizer::unlock(&rt, obj);
            synchronizer::unlock(&rt, obj);
            synchronizer::unlock(&rt, obj);
            rt.detach_current_thread();
        })
    };
    let owner_thread = unsafe { &*(rx.recv().unwrap() as *const objsync::VmThread) };
    // The owner surrenders its token once parked.
    while owner_thread.token_is_self() {
        std::thread::yield_now();
    }

    let contender = {
        let rt = rt.clone();
        let acquired = acquired.clone();
        std::thread::spawn(move || {
            rt.register_thread("park-contender");
            synchronizer::lock(&rt, obj);
            acquired.store(true, Ordering::Release);
            synchronizer::unlock(&rt, obj);
            rt.detach_current_thread();
        })
    };

    // With the owner parked, the contender seizes its token and crawls its
    // lock records: the bias resolves to a counted depth of three.
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    loop {
        let mark = obj.header().mark();
        if mark.has_monitor() && rt.pool().monitor(mark.monitor_id()).recursion() == 3 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "remote crawl never resolved the parked owner's depth"
        );
        std::thread::yield_now();
    }
    // The depth protects the parked owner; the contender stays out.
    assert!(!acquired.load(Ordering::Acquire));

    resume.store(true, Ordering::Release);
    owner_thread.unpark();
    owner.join().unwrap();
    contender.join().unwrap();
    assert!(acquired.load(Ordering::Acquire));
}

#[test]
fn dead_owner_bias_is_stripped() {
    let rt = Arc::new(SyncRuntime::default());
    let obj = leak_object();

    let rt2 = rt.clone();
    std::thread::spawn(move || {
        rt2.register_thread("doomed");
        synchronizer::lock(&rt2, obj);
        // Exit without unlocking.
        synchronizer::unlock(&rt2, obj);
        synchronizer::lock(&rt2, obj);
        rt2.detach_current_thread();
    })
    .join()
    .unwrap();
    assert!(obj.header().mark().is_biased());

    rt.register_thread("survivor");
    synchronizer::lock(&rt, obj);
    assert!(synchronizer::current_thread_holds_lock(&rt, obj));
    synchronizer::unlock(&rt, obj);
    rt.detach_current_thread();
}

#[test]
fn hash_is_stable_across_inflation_and_deflation() {
    let rt = SyncRuntime::default();
    rt.register_thread("hash-stable");
    let obj = leak_object();

    let hash = synchronizer::hash_code(&rt, obj);
    assert!(hash != 0);
    assert_eq!(obj.header().mark().hash(), hash);

    // Locking a hashed object must go heavy; the monitor keeps the hash.
    synchronizer::lock(&rt, obj);
    assert!(obj.header().mark().has_monitor());
    assert_eq!(synchronizer::hash_code(&rt, obj), hash);
    synchronizer::unlock(&rt, obj);

    rt.begin_safepoint();
    let deflated = synchronizer::deflate_idle_monitors(&rt);
    rt.end_safepoint();
    assert!(deflated >= 1);
    assert!(!obj.header().mark().has_monitor());
    assert_eq!(obj.header().mark().hash(), hash);
    assert_eq!(synchronizer::hash_code(&rt, obj), hash);
    rt.detach_current_thread();
}

#[test]
fn hashing_a_biased_object_inflates() {
    let rt = SyncRuntime::default();
    rt.register_thread("hash-biased");
    let obj = leak_object();

    synchronizer::lock(&rt, obj);
    assert!(obj.header().mark().is_biased());
    let hash = synchronizer::hash_code(&rt, obj);
    assert!(hash != 0);
    assert!(obj.header().mark().has_monitor());
    assert!(synchronizer::current_thread_holds_lock(&rt, obj));
    assert_eq!(synchronizer::hash_code(&rt, obj), hash);
    synchronizer::unlock(&rt, obj);
    rt.detach_current_thread();
}

#[test]
fn concurrent_hashing_converges() {
    let rt = Arc::new(SyncRuntime::default());
    let obj = leak_object();
    let threads = 8;

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let rt = rt.clone();
            std::thread::spawn(move || {
                rt.register_thread(&format!("hasher-{}", i));
                let h = synchronizer::hash_code(&rt, obj);
                rt.detach_current_thread();
                h
            })
        })
        .collect();
    let hashes: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(hashes[0] != 0);
    assert!(hashes.iter().all(|h| *h == hashes[0]));
}

#[test]
fn wait_notify_round_trip() {
    let rt = Arc::new(SyncRuntime::default());
    let obj = leak_object();
    let produced = Arc::new(AtomicUsize::new(0));

    let rt2 = rt.clone();
    let produced2 = produced.clone();
    let consumer = std::thread::spawn(move || {
        rt2.register_thread("consumer");
        synchronizer::lock(&rt2, obj);
        while produced2.load(Ordering::Acquire) == 0 {
            synchronizer::wait(&rt2, obj, 0).unwrap();
        }
        synchronizer::unlock(&rt2, obj);
        rt2.detach_current_thread();
    });

    rt.register_thread("producer");
    // Give the consumer time to park; an indefinite wait must not return
    // spuriously.
    std::thread::sleep(Duration::from_millis(50));
    assert!(!consumer.is_finished());

    synchronizer::lock(&rt, obj);
    produced.store(1, Ordering::Release);
    synchronizer::notify(&rt, obj).unwrap();
    synchronizer::unlock(&rt, obj);
    consumer.join().unwrap();
    rt.detach_current_thread();
}

#[test]
fn timed_wait_expires() {
    let rt = SyncRuntime::default();
    rt.register_thread("timed-wait");
    let obj = leak_object();

    synchronizer::lock(&rt, obj);
    let start = std::time::Instant::now();
    synchronizer::wait(&rt, obj, 25).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(25));
    // Ownership comes back at the original depth.
    assert!(synchronizer::current_thread_holds_lock(&rt, obj));
    synchronizer::unlock(&rt, obj);
    rt.detach_current_thread();
}

#[test]
fn wait_errors() {
    let rt = SyncRuntime::default();
    rt.register_thread("wait-errors");
    let obj = leak_object();

    assert_eq!(
        synchronizer::wait(&rt, obj, 10),
        Err(GuestError::IllegalMonitorState)
    );
    assert_eq!(
        synchronizer::notify(&rt, obj),
        Err(GuestError::IllegalMonitorState)
    );
    assert_eq!(
        synchronizer::notify_all(&rt, obj),
        Err(GuestError::IllegalMonitorState)
    );

    synchronizer::lock(&rt, obj);
    assert_eq!(
        synchronizer::wait(&rt, obj, -1),
        Err(GuestError::IllegalArgument("negative timeout"))
    );
    synchronizer::notify(&rt, obj).unwrap();
    synchronizer::unlock(&rt, obj);
    rt.detach_current_thread();
}

#[test]
fn notify_on_self_biased_object_is_trivial() {
    let rt = SyncRuntime::default();
    rt.register_thread("notify-biased");
    let obj = leak_object();

    synchronizer::lock(&rt, obj);
    // A bias proves there are no waiters; no inflation needed.
    synchronizer::notify(&rt, obj).unwrap();
    synchronizer::notify_all(&rt, obj).unwrap();
    assert!(obj.header().mark().is_biased());
    synchronizer::unlock(&rt, obj);
    rt.detach_current_thread();
}

#[test]
fn interrupt_breaks_wait() {
    let rt = Arc::new(SyncRuntime::default());
    let obj = leak_object();
    let (tx, rx) = std::sync::mpsc::channel();

    let rt2 = rt.clone();
    let waiter = std::thread::spawn(move || {
        let thread = rt2.register_thread("interruptee");
        tx.send(thread as *const _ as usize).unwrap();
        synchronizer::lock(&rt2, obj);
        let result = synchronizer::wait(&rt2, obj, 0);
        assert_eq!(result, Err(GuestError::Interrupted));
        // Reporting the interrupt cleared the status.
        assert!(!thread.is_interrupted());
        synchronizer::unlock(&rt2, obj);
        rt2.detach_current_thread();
    });

    let thread = unsafe { &*(rx.recv().unwrap() as *const objsync::VmThread) };
    std::thread::sleep(Duration::from_millis(30));
    thread.interrupt();
    waiter.join().unwrap();
}

#[test]
fn jni_enter_exit_balance() {
    let rt = SyncRuntime::default();
    rt.register_thread("jni");
    let obj = leak_object();

    assert_eq!(
        synchronizer::jni_exit(&rt, obj),
        Err(GuestError::IllegalMonitorState)
    );
    synchronizer::jni_enter(&rt, obj);
    assert!(obj.header().mark().has_monitor());
    assert!(synchronizer::current_thread_holds_lock(&rt, obj));
    synchronizer::jni_enter(&rt, obj);
    synchronizer::jni_exit(&rt, obj).unwrap();
    synchronizer::jni_exit(&rt, obj).unwrap();
    assert!(!synchronizer::current_thread_holds_lock(&rt, obj));
    assert_eq!(
        synchronizer::jni_exit(&rt, obj),
        Err(GuestError::IllegalMonitorState)
    );
    rt.detach_current_thread();
}

#[test]
fn deflation_skips_busy_monitors() {
    let rt = SyncRuntime::default();
    rt.register_thread("deflate-busy");
    let idle = leak_object();
    let busy = leak_object();

    // Idle: inflated by hashing under a bias, then fully unlocked.
    synchronizer::lock(&rt, idle);
    synchronizer::hash_code(&rt, idle);
    synchronizer::unlock(&rt, idle);
    assert!(idle.header().mark().has_monitor());

    // Busy: held with a JNI balance.
    synchronizer::jni_enter(&rt, busy);

    rt.begin_safepoint();
    synchronizer::deflate_idle_monitors(&rt);
    rt.end_safepoint();

    assert!(!idle.header().mark().has_monitor());
    assert!(busy.header().mark().has_monitor());
    assert!(synchronizer::current_thread_holds_lock(&rt, busy));
    synchronizer::jni_exit(&rt, busy).unwrap();
    rt.detach_current_thread();
}

#[test]
fn oops_do_redirects_monitor_objects() {
    let rt = SyncRuntime::default();
    rt.register_thread("oops-do");
    let old = leak_object();
    let new = leak_object();

    synchronizer::jni_enter(&rt, old);
    let hash = synchronizer::hash_code(&rt, old);

    // Simulate the collector copying the object: the new header gets the
    // old mark, and the monitor's back-reference is redirected.
    rt.begin_safepoint();
    new.header().set_mark(old.header().mark());
    synchronizer::oops_do(&rt, |obj| if obj == old { new } else { obj });
    rt.end_safepoint();

    assert!(synchronizer::current_thread_holds_lock(&rt, new));
    assert_eq!(synchronizer::hash_code(&rt, new), hash);
    synchronizer::jni_exit(&rt, new).unwrap();
    rt.detach_current_thread();
}

#[test]
fn biased_locking_can_be_disabled() {
    let mut options = objsync::Options::default();
    options.biased_locking = false;
    let rt = SyncRuntime::new(options);
    rt.register_thread("no-bias");
    let obj = leak_object();

    synchronizer::lock(&rt, obj);
    assert!(obj.header().mark().has_monitor());
    assert!(synchronizer::current_thread_holds_lock(&rt, obj));
    synchronizer::lock(&rt, obj);
    synchronizer::unlock(&rt, obj);
    synchronizer::unlock(&rt, obj);
    assert!(!synchronizer::current_thread_holds_lock(&rt, obj));
    assert_eq!(rt.stats().inflations, 1);
    rt.detach_current_thread();
}

#[test]
fn stats_track_monitor_traffic() {
    let rt = SyncRuntime::default();
    rt.register_thread("stats");
    let obj = leak_object();

    synchronizer::lock(&rt, obj);
    synchronizer::hash_code(&rt, obj);
    synchronizer::unlock(&rt, obj);
    let stats = rt.stats();
    assert_eq!(stats.inflations, 1);
    assert_eq!(stats.monitors_in_circulation, 1);

    rt.begin_safepoint();
    synchronizer::deflate_idle_monitors(&rt);
    rt.end_safepoint();
    let stats = rt.stats();
    assert_eq!(stats.deflations, 1);
    assert_eq!(stats.monitors_in_circulation, 0);
    rt.detach_current_thread();
}
