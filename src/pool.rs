//! The global monitor pool.
//!
//! Monitors are identified by a small dense index so a mark word can name
//! one in 30 bits regardless of address-space layout. The pool hands out
//! storage in slabs of [`MONITORS_PER_SLAB`]; slabs are leaked, so every
//! monitor is type-stable for the life of the VM and a stale id can always
//! be dereferenced safely (the monitor it names may have been recycled, and
//! every user revalidates against the object's mark word after acquiring).
//!
//! Free monitors sit on a lock-free LIFO threaded through each monitor's
//! link field. The list head carries a generation stamp to defeat ABA: a
//! monitor can be popped, rebound to a new object and freed again while a
//! slow thread still holds the old head value.
//!
//! Monitors bound to objects are additionally chained on the in-circulation
//! list, walked by deflation and by GC reference iteration. Pushes are
//! lock-free at the head; unlinking happens only at safepoints.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::Backoff;
use log::trace;

use crate::monitor::ObjectMonitor;

/// Index of a monitor in the pool. Packs into a mark word.
pub type MonitorId = u32;

/// Monitors carved out per slab allocation. Bulk allocation amortizes the
/// grow lock; one thread's miss stocks the free list for everybody.
pub const MONITORS_PER_SLAB: usize = 32;

/// Hard cap on monitors ever carved. Bounds the id width.
pub const MAX_MONITORS: usize = 1 << 20;

const MAX_SLABS: usize = MAX_MONITORS / MONITORS_PER_SLAB;

static_assertions::const_assert!(MAX_MONITORS % MONITORS_PER_SLAB == 0);

/// Link encoding used by both lists: id + 1, with 0 meaning nil.
const NIL: u32 = 0;

pub struct MonitorPool {
    slabs: Box<[AtomicPtr<ObjectMonitor>]>,
    slab_count: AtomicUsize,
    /// Serializes slab carving only; never held while blocking.
    grow_lock: spin::Mutex<()>,
    /// Free LIFO: generation in the high half, link encoding in the low.
    free_head: AtomicU64,
    free_count: AtomicUsize,
    /// In-circulation LIFO, link encoding.
    live_head: AtomicU32,
    live_count: AtomicUsize,
}

impl MonitorPool {
    pub fn new() -> MonitorPool {
        let slabs = (0..MAX_SLABS)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        MonitorPool {
            slabs,
            slab_count: AtomicUsize::new(0),
            grow_lock: spin::Mutex::new(()),
            free_head: AtomicU64::new(NIL as u64),
            free_count: AtomicUsize::new(0),
            live_head: AtomicU32::new(NIL),
            live_count: AtomicUsize::new(0),
        }
    }

    /// The monitor with index `id`. The id must have been issued by this
    /// pool; whether the monitor is still bound to the caller's object is
    /// the caller's problem.
    pub fn monitor(&self, id: MonitorId) -> &'static ObjectMonitor {
        let slab = id as usize / MONITORS_PER_SLAB;
        debug_assert!(slab < self.slab_count.load(Ordering::Acquire));
        let base = self.slabs[slab].load(Ordering::Acquire);
        debug_assert!(!base.is_null());
        unsafe { &*base.add(id as usize % MONITORS_PER_SLAB) }
    }

    /// Monitors on the free list.
    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    /// Monitors bound to objects.
    pub fn live_count(&self) -> usize {
        self.live_count.load(Ordering::Relaxed)
    }

    /// Take a monitor off the free list, carving a new slab on a miss.
    pub fn allocate(&self) -> &'static ObjectMonitor {
        loop {
            if let Some(id) = self.pop_free() {
                return self.monitor(id);
            }
            if let Some(mon) = self.carve_slab() {
                return mon;
            }
        }
    }

    /// Return a neutralized monitor to the free list.
    pub fn free(&self, mon: &'static ObjectMonitor) {
        debug_assert!(mon.is_neutral());
        let backoff = Backoff::new();
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            mon.set_link(head as u32);
            let generation = (head >> 32).wrapping_add(1);
            let new = (generation << 32) | (mon.id() + 1) as u64;
            if self
                .free_head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.free_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
            backoff.spin();
        }
    }

    /// Chain a freshly bound monitor onto the in-circulation list.
    pub fn push_live(&self, mon: &'static ObjectMonitor) {
        let backoff = Backoff::new();
        loop {
            let head = self.live_head.load(Ordering::Acquire);
            mon.set_link(head);
            if self
                .live_head
                .compare_exchange_weak(head, mon.id() + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.live_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
            backoff.spin();
        }
    }

    /// Walk the in-circulation list. Safe to call concurrently with pushes:
    /// nodes are type-stable and a racing push only prepends.
    pub fn for_each_live(&self, mut f: impl FnMut(&'static ObjectMonitor)) {
        let mut link = self.live_head.load(Ordering::Acquire);
        while link != NIL {
            let mon = self.monitor(link - 1);
            link = mon.link();
            f(mon);
        }
    }

    /// Drop every in-circulation monitor for which `keep` returns false,
    /// relinking the survivors. Safepoint only: the list is mutated with
    /// plain stores and dropped monitors go straight back to the free list.
    pub(crate) fn retain_live(&self, mut keep: impl FnMut(&'static ObjectMonitor) -> bool) {
        let mut survivors: Vec<&'static ObjectMonitor> = Vec::new();
        let mut dropped = 0usize;
        let mut link = self.live_head.load(Ordering::Acquire);
        while link != NIL {
            let mon = self.monitor(link - 1);
            link = mon.link();
            if keep(mon) {
                survivors.push(mon);
            } else {
                dropped += 1;
                self.free(mon);
            }
        }
        // Relink in original order.
        let mut head = NIL;
        for mon in survivors.iter().rev() {
            mon.set_link(head);
            head = mon.id() + 1;
        }
        self.live_head.store(head, Ordering::Release);
        self.live_count.fetch_sub(dropped, Ordering::Relaxed);
    }

    fn pop_free(&self) -> Option<MonitorId> {
        let backoff = Backoff::new();
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            if head as u32 == NIL {
                return None;
            }
            let id = (head as u32) - 1;
            // The link read may race a recycle of this monitor; the
            // generation stamp makes the CAS fail in that case.
            let next = self.monitor(id).link();
            let generation = (head >> 32).wrapping_add(1);
            let new = (generation << 32) | next as u64;
            if self
                .free_head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.free_count.fetch_sub(1, Ordering::Relaxed);
                return Some(id);
            }
            backoff.spin();
        }
    }

    /// Carve a fresh slab: keep one monitor for the caller, stock the free
    /// list with the rest. Returns `None` if another thread carved first
    /// (retry the free list instead).
    #[cold]
    fn carve_slab(&self) -> Option<&'static ObjectMonitor> {
        let _guard = self.grow_lock.lock();
        // Someone else may have restocked while we waited for the lock.
        if let Some(id) = self.pop_free() {
            return Some(self.monitor(id));
        }
        let slab = self.slab_count.load(Ordering::Acquire);
        assert!(slab < MAX_SLABS, "monitor pool exhausted");
        let base_id = (slab * MONITORS_PER_SLAB) as u32;
        let monitors: Vec<ObjectMonitor> = (0..MONITORS_PER_SLAB as u32)
            .map(|i| ObjectMonitor::new(base_id + i))
            .collect();
        let base: &'static mut [ObjectMonitor] = Box::leak(monitors.into_boxed_slice());
        let base_ptr = base.as_mut_ptr();
        self.slabs[slab].store(base_ptr, Ordering::Release);
        self.slab_count.store(slab + 1, Ordering::Release);
        trace!(
            "carved monitor slab {} (ids {}..{})",
            slab,
            base_id,
            base_id + MONITORS_PER_SLAB as u32
        );
        let (first, rest) = base.split_first().unwrap();
        for mon in rest.iter() {
            // Fields are already neutral; go straight to the free list.
            self.free(unsafe { &*(mon as *const ObjectMonitor) });
        }
        Some(unsafe { &*(first as *const ObjectMonitor) })
    }
}

impl Default for MonitorPool {
    fn default() -> Self {
        Self::new()
    }
}
