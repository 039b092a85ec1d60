//! The plaintext header stored at physical block 0.
//!
//! Fields per spec.md §6.2: format magic, version, crypto variant, entries
//! per management block, a logical-block-count high-water mark, a
//! randomized nonce seed, and zero padding out to the configured block
//! size. The header itself carries no confidentiality or integrity of its
//! own beyond the nonce's role in seeding the Merkle root (spec.md §4.3
//! `seed`) — tampering with any other header field either produces a
//! `Geometry` the on-disk management blocks were never written under
//! (surfacing as `IntegrityFail` once a management block is touched) or is
//! rejected outright by [`Header::decode`].
//!
//! Encoded and parsed by hand with explicit `to_le_bytes`/`from_le_bytes`
//! calls rather than through a serialization crate, matching how this
//! workspace's other binary-layout boundary code hand-packs fixed formats.

use crate::crypto::CryptoVariant;
use crate::error::{SbdError, SbdResult};

/// 4-byte format magic identifying an SBD image.
pub const MAGIC: [u8; 4] = *b"SBDI";

/// Current on-disk version.
pub const VERSION: u16 = 1;

/// Size in bytes of the random nonce seeded into the Merkle root.
pub const NONCE_SIZE: usize = 32;

/// Byte length of the fixed (non-padding) portion of the header:
/// `4 (magic) + 2 (version) + 2 (variant) + 4 (E) + 4 (hwm) + NONCE_SIZE`.
pub const FIXED_LEN: usize = 4 + 2 + 2 + 4 + 4 + NONCE_SIZE;

/// The parsed contents of physical block 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub variant: CryptoVariant,
    pub entries_per_mngt: u32,
    /// One past the highest logical block index ever written; used to
    /// bound scans and report device size, not enforced as a hard ceiling
    /// on reads/writes beyond `L_max`.
    pub log_block_hwm: u32,
    pub nonce: [u8; NONCE_SIZE],
}

impl Header {
    /// Builds the header for a brand-new, empty device.
    pub fn new_empty(variant: CryptoVariant, entries_per_mngt: u32, nonce: [u8; NONCE_SIZE]) -> Self {
        Header {
            version: VERSION,
            variant,
            entries_per_mngt,
            log_block_hwm: 0,
            nonce,
        }
    }

    /// Encodes the header into exactly `block_size` bytes, zero-padding the
    /// reserved tail.
    pub fn encode(&self, block_size: usize) -> SbdResult<Vec<u8>> {
        if block_size < FIXED_LEN {
            return Err(SbdError::IllegalParam(
                "block size too small to hold the header",
            ));
        }
        let mut buf = vec![0u8; block_size];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.variant.code().to_le_bytes());
        buf[8..12].copy_from_slice(&self.entries_per_mngt.to_le_bytes());
        buf[12..16].copy_from_slice(&self.log_block_hwm.to_le_bytes());
        buf[16..16 + NONCE_SIZE].copy_from_slice(&self.nonce);
        Ok(buf)
    }

    /// Parses a `block_size`-byte header, rejecting a bad magic or unknown
    /// version/variant with `Unsupported`.
    pub fn decode(buf: &[u8]) -> SbdResult<Self> {
        if buf.len() < FIXED_LEN {
            return Err(SbdError::IoError("short header read"));
        }
        if buf[0..4] != MAGIC {
            return Err(SbdError::Unsupported("bad header magic"));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != VERSION {
            return Err(SbdError::Unsupported("unsupported header version"));
        }
        let variant_code = u16::from_le_bytes([buf[6], buf[7]]);
        let variant = CryptoVariant::from_code(variant_code)?;
        let entries_per_mngt = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let log_block_hwm = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&buf[16..16 + NONCE_SIZE]);
        Ok(Header {
            version,
            variant,
            entries_per_mngt,
            log_block_hwm,
            nonce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let h = Header::new_empty(CryptoVariant::Siv, 256, [0x5A; NONCE_SIZE]);
        let encoded = h.encode(4096).unwrap();
        assert_eq!(encoded.len(), 4096);
        assert!(encoded[FIXED_LEN..].iter().all(|&b| b == 0));
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn bad_magic_is_unsupported() {
        let mut buf = vec![0u8; 4096];
        buf[0..4].copy_from_slice(b"NOPE");
        assert!(matches!(Header::decode(&buf), Err(SbdError::Unsupported(_))));
    }

    #[test]
    fn bad_version_is_unsupported() {
        let h = Header::new_empty(CryptoVariant::None, 128, [0; NONCE_SIZE]);
        let mut encoded = h.encode(4096).unwrap();
        encoded[4..6].copy_from_slice(&99u16.to_le_bytes());
        assert!(matches!(
            Header::decode(&encoded),
            Err(SbdError::Unsupported(_))
        ));
    }

    #[test]
    fn too_small_block_size_rejected() {
        let h = Header::new_empty(CryptoVariant::None, 128, [0; NONCE_SIZE]);
        assert!(h.encode(8).is_err());
    }
}
