//! Error types for the request path.

use crate::gnttab::GrantError;
use crate::image::SubmitError;
use crate::wire::{RSP_EOPNOTSUPP, RSP_ERROR};
use thiserror::Error;

/// Errors that can terminate a block request (or, for the first two
/// variants, fail an attach).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The ring protocol tag is not one of the three known variants.
    #[error("unsupported ring protocol {0}")]
    UnsupportedProtocol(u8),

    /// The ring request operation is neither READ nor WRITE.
    #[error("unsupported block operation {0:#04x}")]
    UnsupportedOp(u8),

    /// The ring request carries zero segments or more than the wire maximum.
    #[error("invalid segment count {0}")]
    InvalidSegmentCount(u8),

    /// A segment's sector range is inverted or runs past the page.
    #[error("invalid sectors {first}-{last}")]
    InvalidSectorRange { first: u8, last: u8 },

    /// Bounce buffer or pool allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// Grant map or unmap failure while crossing the guest boundary.
    #[error(transparent)]
    Grant(#[from] GrantError),

    /// The image subsystem rejected the request synchronously.
    #[error(transparent)]
    Submit(#[from] SubmitError),

    /// The image subsystem reported an error asynchronously.
    #[error("image error {0}")]
    Image(i32),
}

impl Error {
    /// The wire status published for a request that ends with this error.
    #[inline]
    pub fn response_status(&self) -> i16 {
        match self {
            Error::UnsupportedOp(_) => RSP_EOPNOTSUPP,
            _ => RSP_ERROR,
        }
    }
}

// A failed event-channel notify is deliberately absent from this enum: it is
// logged and counted, never a per-request failure (the response is already on
// the ring by the time the notify runs).
