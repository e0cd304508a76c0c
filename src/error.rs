//! Errors surfaced to the guest program.
//!
//! These map one-to-one onto the exceptions a managed runtime throws from
//! its monitor operations; the embedding VM converts them at the boundary.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestError {
    /// The calling thread does not own the monitor it tried to operate on.
    IllegalMonitorState,
    /// A malformed argument, e.g. a negative wait timeout.
    IllegalArgument(&'static str),
    /// The wait was ended by an interrupt. The interrupt status has been
    /// cleared.
    Interrupted,
}

impl fmt::Display for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GuestError::IllegalMonitorState => {
                write!(f, "current thread does not own the monitor")
            }
            GuestError::IllegalArgument(what) => write!(f, "illegal argument: {}", what),
            GuestError::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::error::Error for GuestError {}
