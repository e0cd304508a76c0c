//! The object header and the object reference handle.
//!
//! The monitor subsystem only ever sees an object through its header word;
//! everything else about object layout belongs to the embedding VM. The
//! header exposes exactly the three operations the locking protocol needs:
//! an atomic read, a CAS publish, and a plain store for use at safepoints.

use atomic::{Atomic, Ordering};
use bytemuck::NoUninit;

use crate::mark_word::MarkWord;

/// The per-object word the lock subsystem owns. The embedding VM places one
/// of these at a fixed offset in every object.
#[repr(transparent)]
pub struct ObjectHeader {
    mark: Atomic<MarkWord>,
}

impl ObjectHeader {
    pub fn new() -> ObjectHeader {
        ObjectHeader {
            mark: Atomic::new(MarkWord::prototype()),
        }
    }

    pub fn mark(&self) -> MarkWord {
        self.mark.load(Ordering::Acquire)
    }

    /// Publish `new` if the header still holds `old`. Returns the witness
    /// value: equal to `old` exactly when the CAS succeeded.
    pub fn cas_set_mark(&self, new: MarkWord, old: MarkWord) -> MarkWord {
        match self
            .mark
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::Acquire)
        {
            Ok(witness) => witness,
            Err(witness) => witness,
        }
    }

    /// Plain store of the mark. Only legal when no other thread can be
    /// racing on this header, i.e. at a safepoint.
    pub fn set_mark(&self, new: MarkWord) {
        self.mark.store(new, Ordering::Release);
    }
}

impl Default for ObjectHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// A reference to an object, represented as the address of its header.
///
/// The monitor subsystem never assumes liveness: an `ObjectRef` held by a
/// free-listed monitor is stale and must be revalidated against the mark
/// word before use. The embedding VM guarantees headers do not move while a
/// monitor points at them (a moving collector updates the back-references
/// through [`oops_do`](crate::synchronizer::oops_do) while the world is
/// stopped).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, NoUninit)]
pub struct ObjectRef(usize);

impl ObjectRef {
    pub fn from_header(header: &ObjectHeader) -> ObjectRef {
        ObjectRef(header as *const ObjectHeader as usize)
    }

    /// Reconstruct a reference from its raw bits.
    ///
    /// # Safety
    ///
    /// `raw` must be the address of a live, pinned [`ObjectHeader`].
    pub unsafe fn from_raw(raw: usize) -> ObjectRef {
        debug_assert!(raw != 0);
        ObjectRef(raw)
    }

    pub fn raw(self) -> usize {
        self.0
    }

    /// The header this reference points at. The caller is responsible for
    /// only dereferencing references that are still live (see type docs).
    pub fn header(self) -> &'static ObjectHeader {
        debug_assert!(self.0 != 0);
        unsafe { &*(self.0 as *const ObjectHeader) }
    }
}

impl std::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0)
    }
}
