//! Object synchronization for a managed runtime: biased locks encoded in a
//! mark word, with heavyweight monitors behind them.
//!
//! The embedding VM creates one [`SyncRuntime`], registers each of its
//! threads, and drives every lock operation through the free functions in
//! [`synchronizer`]. The fast paths are a single mark word CAS; the slow
//! paths inflate a pooled [`monitor::ObjectMonitor`] that carries
//! contention, wait/notify and the evicted identity hash, and deflation at
//! safepoints hands idle monitors back.
//!
//! ```no_run
//! use objsync::{ObjectHeader, ObjectRef, SyncRuntime, synchronizer};
//!
//! let rt = SyncRuntime::default();
//! rt.register_thread("main");
//! let header = ObjectHeader::new();
//! let obj = ObjectRef::from_header(&header);
//! synchronizer::lock(&rt, obj);
//! let hash = synchronizer::hash_code(&rt, obj);
//! synchronizer::unlock(&rt, obj);
//! assert_eq!(hash, synchronizer::hash_code(&rt, obj));
//! rt.detach_current_thread();
//! ```

pub mod error;
mod logger;
pub mod mark_word;
pub mod monitor;
pub mod object;
pub mod options;
pub mod pool;
mod raw_lock;
mod safepoint;
mod semaphore;
pub mod synchronizer;
pub mod thread;

mod runtime;

pub use crate::error::GuestError;
pub use crate::mark_word::MarkWord;
pub use crate::object::{ObjectHeader, ObjectRef};
pub use crate::options::Options;
pub use crate::raw_lock::{VmLock, WaitLock};
pub use crate::runtime::{SyncRuntime, SyncStats};
pub use crate::safepoint::SafepointSynchronize;
pub use crate::thread::{ThreadRegistry, VmThread};
