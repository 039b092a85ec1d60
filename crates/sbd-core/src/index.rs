//! Index calculus: the bijection between logical and physical block
//! indices.
//!
//! All functions here are pure and operate over a runtime [`Geometry`]
//! rather than compile-time constants, so the same code serves both the
//! `B=4096, E=256` production default and the smaller geometries used in
//! the test suite.

use crate::error::{SbdError, SbdResult};

/// The layout parameters that index calculus is defined over.
///
/// `entries_per_mngt` is `E`: the number of tag slots per management
/// block, i.e. `⌊B / T⌋`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Number of data-block tag slots held by one management block.
    pub entries_per_mngt: u32,
}

impl Geometry {
    /// Builds a geometry from a block size and tag size, computing
    /// `entries_per_mngt = block_size / tag_size`.
    pub fn from_sizes(block_size: u32, tag_size: u32) -> SbdResult<Self> {
        if tag_size == 0 || block_size == 0 || tag_size > block_size {
            return Err(SbdError::IllegalParam(
                "tag_size must be nonzero and not exceed block_size",
            ));
        }
        let entries_per_mngt = block_size / tag_size;
        if entries_per_mngt == 0 {
            return Err(SbdError::IllegalParam(
                "block_size / tag_size must be at least 1",
            ));
        }
        Ok(Geometry { entries_per_mngt })
    }

    /// The largest logical block index this geometry can address,
    /// exclusive, bounded by the 32-bit physical index space.
    pub fn l_max(&self) -> u32 {
        u32::MAX - 1
    }

    /// `mngt_nbr(log) = log / E`
    pub fn mngt_nbr(&self, log: u32) -> u32 {
        log / self.entries_per_mngt
    }

    /// `slot(log) = log mod E`
    pub fn slot(&self, log: u32) -> u32 {
        log % self.entries_per_mngt
    }

    /// `phy_of_mngt(log) = mngt_nbr(log) * (E + 1) + 1`
    pub fn phy_of_mngt(&self, log: u32) -> u32 {
        self.mngt_nbr(log) * (self.entries_per_mngt + 1) + 1
    }

    /// `phy_of_data(log) = log + mngt_nbr(log) + 2`
    pub fn phy_of_data(&self, log: u32) -> u32 {
        log + self.mngt_nbr(log) + 2
    }

    /// `mngt_phy(m) = m * (E + 1) + 1`, the physical index of management
    /// block number `m`.
    pub fn mngt_phy(&self, m: u32) -> u32 {
        m * (self.entries_per_mngt + 1) + 1
    }

    /// `is_mngt(phy) = phy >= 1 && (phy - 1) mod (E + 1) == 0`
    ///
    /// # Panics
    /// Debug-asserts `phy != 0`: `phy = 0` (the header block) is treated as
    /// a programming-error precondition here, since the header is never a
    /// candidate management block and callers are expected to special-case
    /// it before reaching index calculus.
    pub fn is_mngt(&self, phy: u32) -> bool {
        debug_assert!(phy != 0, "is_mngt called with phy = 0 (the header)");
        phy >= 1 && (phy - 1) % (self.entries_per_mngt + 1) == 0
    }

    /// Fallible counterpart of [`Self::is_mngt`] for callers that receive
    /// `phy` from outside the crate and must not panic on bad input.
    pub fn try_is_mngt(&self, phy: u32) -> SbdResult<bool> {
        if phy == 0 {
            return Err(SbdError::IllegalParam("phy = 0 is the header block"));
        }
        Ok(self.is_mngt(phy))
    }

    /// `mngt_nbr_of_mngt_phy(phy) = (phy - 1) / (E + 1)`
    ///
    /// # Panics
    /// Debug-asserts `phy` is actually a management-block index.
    pub fn mngt_nbr_of_mngt_phy(&self, phy: u32) -> u32 {
        debug_assert!(self.is_mngt(phy), "phy {phy} is not a management block");
        (phy - 1) / (self.entries_per_mngt + 1)
    }

    /// Inverse of [`Self::phy_of_data`]: `log = (phy - 2) - (phy - 2) / (E + 1)`.
    ///
    /// # Panics
    /// Debug-asserts `phy >= 2`: this is a programming-error precondition,
    /// not a recoverable case, in the unchecked fast path. Use
    /// [`Self::try_phy_to_log`] at API boundaries.
    pub fn phy_to_log(&self, phy: u32) -> u32 {
        debug_assert!(phy >= 2, "phy_to_log requires phy >= 2");
        let tmp = phy - 2;
        tmp - tmp / (self.entries_per_mngt + 1)
    }

    /// Fallible counterpart of [`Self::phy_to_log`], returning
    /// `IllegalParam` instead of panicking when `phy < 2` or `phy` names a
    /// management block.
    pub fn try_phy_to_log(&self, phy: u32) -> SbdResult<u32> {
        if phy < 2 {
            return Err(SbdError::IllegalParam(
                "phy < 2 has no corresponding logical data block",
            ));
        }
        if self.is_mngt(phy) {
            return Err(SbdError::IllegalParam(
                "phy names a management block, not a data block",
            ));
        }
        Ok(self.phy_to_log(phy))
    }
}

impl Default for Geometry {
    /// `B = 4096`, `T = 16` ⇒ `E = 256`, the default design parameters.
    fn default() -> Self {
        Geometry::from_sizes(4096, 16).expect("default sizes are valid")
    }
}
