//! Device construction parameters.
//!
//! `DeviceConfig` is a plain struct rather than a CLI-parsed surface — no
//! command-line or mount glue is in scope here (spec.md §1's Non-goals) —
//! but picking `B`/`T`/cache capacity is an ambient engineering concern a
//! caller still needs a clean way to express, so it gets one.

use crate::error::SbdResult;
use crate::index::Geometry;

/// Default block size `B` (spec.md §3).
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
/// Default tag size `T` (spec.md §3), giving `E = 256`.
pub const DEFAULT_TAG_SIZE: u32 = 16;
/// Default cache capacity `C` (spec.md §3).
pub const DEFAULT_CACHE_CAPACITY: usize = 16;

/// The design parameters of a device: block size, tag size (which together
/// derive `entries_per_mngt = E`), and cache capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub block_size: u32,
    pub tag_size: u32,
    pub cache_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            tag_size: DEFAULT_TAG_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl DeviceConfig {
    /// Builds a config, validating `block_size`/`tag_size` eagerly so a bad
    /// geometry is caught at construction rather than deep inside `open`.
    pub fn new(block_size: u32, tag_size: u32, cache_capacity: usize) -> SbdResult<Self> {
        Geometry::from_sizes(block_size, tag_size)?;
        Ok(DeviceConfig {
            block_size,
            tag_size,
            cache_capacity,
        })
    }

    /// Derives the runtime `Geometry` (`E = block_size / tag_size`) this
    /// config implies.
    pub fn geometry(&self) -> Geometry {
        Geometry::from_sizes(self.block_size, self.tag_size)
            .expect("DeviceConfig invariant: geometry validated at construction")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_constants() {
        let cfg = DeviceConfig::default();
        assert_eq!(cfg.geometry().entries_per_mngt, 256);
        assert_eq!(cfg.cache_capacity, 16);
    }

    #[test]
    fn scenario_geometry_e_128() {
        let cfg = DeviceConfig::new(4096, 32, 16).unwrap();
        assert_eq!(cfg.geometry().entries_per_mngt, 128);
    }

    #[test]
    fn rejects_bad_geometry_at_construction() {
        assert!(DeviceConfig::new(16, 32, 16).is_err());
    }
}
