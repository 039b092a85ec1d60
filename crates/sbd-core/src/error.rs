//! Error kinds for the Secure Block Device block layer.
//!
//! Mirrors the error kinds of the on-disk design: `SUCCESS` is represented
//! structurally as `Ok`, the remaining kinds are variants here.

use thiserror::Error;

/// Errors produced by `sbd-core`.
///
/// Cloneable so a device's quarantine state (see [`crate::device`]) can
/// hand back the same logical failure on every subsequent call without
/// re-running the operation that produced it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SbdError {
    /// Caller bug: null/out-of-range index, block index >= `L_max`, or a
    /// malformed offset/length pair.
    #[error("illegal parameter: {0}")]
    IllegalParam(&'static str),

    /// A `Store` read or write failed or returned a short count where a
    /// full block was required.
    #[error("store I/O error: {0}")]
    IoError(&'static str),

    /// An authentication tag (data block, management block, or header
    /// root) failed to verify.
    #[error("integrity check failed at physical block {phy}")]
    IntegrityFail {
        /// Physical block index whose tag or digest mismatched.
        phy: u32,
    },

    /// The header names a crypto variant or version this build does not
    /// implement.
    #[error("unsupported crypto variant or header version: {0}")]
    Unsupported(&'static str),

    /// Allocation failure while growing cache or Merkle tree storage.
    #[error("out of memory")]
    OutOfMemory,

    /// Read targeted a logical block that has never been written.
    #[error("logical block {log} has never been written")]
    NotWritten {
        /// The logical block index that was never written.
        log: u32,
    },

    /// Eviction would have to violate the dirty data/management closure
    /// constraint and no relief (fault-in of the companion) is possible.
    #[error("cache full: cannot evict without violating dirty closure")]
    CacheFull,

    /// The root supplied to `open` does not match the root computed from
    /// the header nonce and the on-disk management blocks.
    #[error("provided root does not match computed root")]
    RootMismatch,

    /// An operation was attempted on a device that has already entered
    /// the quarantine state.
    #[error("device is quarantined: {0}")]
    Quarantined(Box<SbdError>),
}

/// Convenience alias used throughout the crate.
pub type SbdResult<T> = Result<T, SbdError>;

impl SbdError {
    /// `true` for the two error kinds that poison a device handle until
    /// `close`.
    pub fn poisons_device(&self) -> bool {
        matches!(
            self,
            SbdError::IntegrityFail { .. } | SbdError::IllegalParam(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_fail_and_illegal_param_poison() {
        assert!(SbdError::IntegrityFail { phy: 3 }.poisons_device());
        assert!(SbdError::IllegalParam("bad").poisons_device());
        assert!(!SbdError::NotWritten { log: 0 }.poisons_device());
        assert!(!SbdError::RootMismatch.poisons_device());
    }

    #[test]
    fn quarantine_replays_original_error() {
        let original = SbdError::IntegrityFail { phy: 7 };
        let wrapped = SbdError::Quarantined(Box::new(original.clone()));
        match wrapped {
            SbdError::Quarantined(inner) => assert_eq!(*inner, original),
            _ => panic!("expected Quarantined"),
        }
    }
}
