//! The mark word: one machine word in every object header that encodes the
//! object's lock and identity-hash state.
//!
//! There is no light-weight (stack-lock) representation; either:
//! -   the object is owned speculatively by some thread (biased), or else
//! -   there is an identity hash, or else
//! -   there is a heavyweight [`ObjectMonitor`](crate::monitor::ObjectMonitor).
//!
//! An object that is both locked and hashed must have a heavy monitor, which
//! keeps the hash as well as tracking the locking.
//!
//! Mark word layout (low 32 bits; the upper bits are owned by the embedding
//! VM's object model and are preserved by every transform here):
//!
//! ```text
//! |    payload (30 bits + 1)     | tag |
//! tag 00 -> fresh (payload 0) or biased (payload = reversible thread id)
//! tag 10 -> heavy (payload = monitor pool index)
//! tag x1 -> hashed (hash = bits[31:1])
//! ```
//!
//! A reversible thread id always has its low two bits zero, so a generated
//! fast path can test "biased to me" with a single load and compare.
//!
//! All transforms are pure: they return a new word and the caller publishes
//! it with a compare-and-swap on the containing header word. Nothing in this
//! module locks or retries.

use bytemuck::NoUninit;

use crate::pool::MonitorId;

/// Number of tag bits selecting the mark word state.
pub const LOCK_BITS: usize = 2;
/// Payload width shared by the thread id, monitor id and (with one extra
/// bit) the identity hash.
pub const HASH_BITS: usize = 30;

const LOCK_MASK: usize = (1 << LOCK_BITS) - 1;
const HASH_MASK_IN_PLACE: usize = ((1 << HASH_BITS) - 1) << LOCK_BITS;

/// Tag value for a mark word holding a monitor id.
const MONITOR_TAG: usize = 0b10;
/// The low bit set means the word carries an inline identity hash.
const HASH_TAG: usize = 0b01;

/// Mask applied to a raw identity hash before it is encoded anywhere.
pub const HASH_VALUE_MASK: i32 = (1 << HASH_BITS) - 1;

// The payload must be able to hold any monitor id and any reversible tid.
static_assertions::const_assert!(crate::pool::MAX_MONITORS <= 1 << HASH_BITS);
static_assertions::const_assert!(
    (crate::thread::MAX_THREADS + 1) << LOCK_BITS <= 1 << (HASH_BITS + LOCK_BITS)
);

/// One object header word. Copyable value type; the authoritative copy lives
/// in an [`atomic::Atomic<MarkWord>`] inside the object header.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, NoUninit)]
pub struct MarkWord(usize);

impl MarkWord {
    /// The mark of a freshly allocated object: unlocked, no hash.
    pub const fn prototype() -> MarkWord {
        MarkWord(0)
    }

    /// Reconstruct a mark word from its raw bits (e.g. read out of an object
    /// header owned by the embedding VM).
    pub const fn from_raw(bits: usize) -> MarkWord {
        MarkWord(bits)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    /// Low-order bits all zero; can be CAS'd to biased or hashed or what-not.
    pub fn is_fresh(self) -> bool {
        self.0 & (LOCK_MASK | HASH_MASK_IN_PLACE) == 0
    }

    /// Biased (speculatively owned) by the thread whose reversible id is in
    /// the payload. The ownership can change moment by moment.
    pub fn is_biased(self) -> bool {
        self.0 & LOCK_MASK == 0 && self.0 & HASH_MASK_IN_PLACE != 0
    }

    /// Does this word carry a monitor id?
    pub fn has_monitor(self) -> bool {
        self.0 & LOCK_MASK == MONITOR_TAG
    }

    /// The monitor id of a heavy mark word.
    pub fn monitor_id(self) -> MonitorId {
        debug_assert!(self.has_monitor());
        ((self.0 & HASH_MASK_IN_PLACE) >> LOCK_BITS) as MonitorId
    }

    /// The reversible thread id of a biased mark word. The id is kept in its
    /// packed form (low two bits zero), directly comparable with
    /// [`VmThread::reversible_tid`](crate::thread::VmThread::reversible_tid).
    pub fn biased_tid(self) -> u64 {
        debug_assert!(self.is_biased());
        (self.0 & HASH_MASK_IN_PLACE) as u64
    }

    /// The inline identity hash, or 0 if the word does not carry one. Racey:
    /// a zero may mean "not hashed yet" or "hash lives in the monitor".
    pub fn hash(self) -> i32 {
        if self.0 & HASH_TAG != 0 {
            ((self.0 >> 1) & 0x7fff_ffff) as i32
        } else {
            0
        }
    }

    pub fn has_no_hash(self) -> bool {
        self.hash() == 0
    }

    /// This word as it would be if bias-locked to `tid`. Handy for CAS'ing
    /// mark words during locking attempts.
    pub fn as_biaslocked(self, tid: u64) -> MarkWord {
        debug_assert!(tid & LOCK_MASK as u64 == 0 && tid != 0);
        debug_assert!(self.is_fresh());
        MarkWord(self.0 | tid as usize)
    }

    /// This word as it would be with `id` installed as a heavy monitor.
    pub fn as_heavylocked(self, id: MonitorId) -> MarkWord {
        debug_assert!((id as usize) < crate::pool::MAX_MONITORS);
        MarkWord((self.0 & !(LOCK_MASK | HASH_MASK_IN_PLACE)) | ((id as usize) << LOCK_BITS) | MONITOR_TAG)
    }

    /// This word as it would be if fresh: bias, hash and monitor stripped,
    /// VM-private upper bits preserved.
    pub fn as_fresh(self) -> MarkWord {
        MarkWord(self.0 & !(LOCK_MASK | HASH_MASK_IN_PLACE))
    }

    /// Install an inline identity hash. The word must be fresh: a biased mark
    /// never carries a hash, and a heavy mark keeps its hash in the monitor.
    pub fn copy_set_hash(self, hash: i32) -> MarkWord {
        debug_assert!(self.is_fresh());
        debug_assert!(hash != 0 && hash & !HASH_VALUE_MASK == 0);
        MarkWord(self.0 | ((hash as usize) << 1) | HASH_TAG)
    }
}

impl std::fmt::Debug for MarkWord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.has_monitor() {
            write!(f, "MarkWord[monitor #{}]", self.monitor_id())
        } else if self.is_biased() {
            write!(f, "MarkWord[biased tid {:#x}]", self.biased_tid())
        } else if self.hash() != 0 {
            write!(f, "MarkWord[hash {:#x}]", self.hash())
        } else {
            write!(f, "MarkWord[fresh {:#x}]", self.0)
        }
    }
}
