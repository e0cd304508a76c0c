//! The VM-wide synchronization context.
//!
//! One [`SyncRuntime`] instance owns everything the monitor subsystem
//! needs: the monitor pool, the thread registry (with its safepoint
//! machinery) and the tunables. The embedding VM creates exactly one and
//! threads it through every call; there are no globals, so two runtimes in
//! one process stay fully independent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::monitor;
use crate::options::Options;
use crate::pool::MonitorPool;
use crate::thread::{ThreadRegistry, VmThread};

pub struct SyncRuntime {
    pool: MonitorPool,
    threads: ThreadRegistry,
    options: Options,
    inflations: AtomicUsize,
    deflations: AtomicUsize,
    revocations: AtomicUsize,
    last_deflation: Mutex<Instant>,
}

/// A point-in-time snapshot of the subsystem's counters.
#[derive(Debug, Clone, Copy)]
pub struct SyncStats {
    pub inflations: usize,
    pub deflations: usize,
    pub revocations: usize,
    pub monitors_in_circulation: usize,
    pub monitors_free: usize,
}

impl SyncRuntime {
    pub fn new(options: Options) -> SyncRuntime {
        crate::logger::try_init();
        SyncRuntime {
            pool: MonitorPool::new(),
            threads: ThreadRegistry::new(),
            options,
            inflations: AtomicUsize::new(0),
            deflations: AtomicUsize::new(0),
            revocations: AtomicUsize::new(0),
            last_deflation: Mutex::new(Instant::now()),
        }
    }

    pub fn pool(&self) -> &MonitorPool {
        &self.pool
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Attach the calling OS thread to the runtime.
    pub fn register_thread(&self, name: &str) -> &'static VmThread {
        self.threads.register(name)
    }

    /// Detach the calling thread, force-releasing any monitors it still
    /// owns (counted or JNI-held). Biased mark words it leaves behind are
    /// stripped lazily by the next contender.
    pub fn detach_current_thread(&self) {
        let thread = VmThread::current();
        crate::synchronizer::release_monitors_owned_by_thread(self, thread);
        self.threads.detach(thread);
    }

    /// Safepoint poll site. Services pending bias-revocation requests and
    /// parks for the duration of any pending stop-the-world operation.
    /// The embedding VM calls this from its interpreter/JIT poll points.
    pub fn poll_at_safepoint(&self) {
        let thread = VmThread::current();
        monitor::drain_unbias_requests(self, thread);
        self.threads.safepoint().block_if_requested(thread);
    }

    /// Stop the world. Pairs with [`end_safepoint`](Self::end_safepoint).
    pub fn begin_safepoint(&self) {
        self.threads
            .safepoint()
            .begin(&self.threads, VmThread::try_current());
    }

    pub fn end_safepoint(&self) {
        self.threads
            .safepoint()
            .end(&self.threads, VmThread::try_current());
    }

    /// Should the VM schedule a deflation sweep at its next safepoint?
    /// True when the free reserve has fallen behind circulation and the
    /// configured interval has elapsed.
    pub fn deflation_needed(&self) -> bool {
        let live = self.pool.live_count();
        let free = self.pool.free_count();
        if free * self.options.deflation_free_ratio >= live {
            return false;
        }
        let last = self.last_deflation.lock().unwrap();
        last.elapsed() >= Duration::from_millis(self.options.deflation_interval_ms)
    }

    pub(crate) fn note_deflation_sweep(&self, deflated: usize) {
        self.deflations.fetch_add(deflated, Ordering::Relaxed);
        *self.last_deflation.lock().unwrap() = Instant::now();
    }

    pub(crate) fn note_inflation(&self) {
        self.inflations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_revocation_request(&self) {
        self.revocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            inflations: self.inflations.load(Ordering::Relaxed),
            deflations: self.deflations.load(Ordering::Relaxed),
            revocations: self.revocations.load(Ordering::Relaxed),
            monitors_in_circulation: self.pool.live_count(),
            monitors_free: self.pool.free_count(),
        }
    }
}

impl Default for SyncRuntime {
    fn default() -> Self {
        Self::new(Options::from_env())
    }
}
