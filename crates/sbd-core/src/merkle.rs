//! Balanced binary Merkle tree over management-block digests.
//!
//! Leaves are indexed by management block number `m`. `update` grows the
//! leaf level to cover `m` (padding new slots with [`EMPTY_LEAF`]) and then
//! rebuilds every interior level bottom-up from that leaf array. A
//! leaf→root path recompute alone is not enough: growing the tree can add
//! levels above an ancestor a previously-written, now-distant leaf used to
//! rely on, and if that ancestor is never revisited again it stays stale —
//! stranding the leaf outside whatever path the new root actually covers
//! (see `sparse_non_adjacent_updates_all_contribute_to_root` below for the
//! concrete case). A full bottom-up rebuild is `O(leaf_count)` per
//! `update`, which is cheap here since the tree only ever grows to the
//! number of management blocks actually touched, not to `L_max`.

use crate::error::{SbdError, SbdResult};

/// A 32-byte BLAKE3 digest.
pub type MerkleDigest = [u8; 32];

/// The digest a leaf hashes to before its management block has ever been
/// written.
pub const EMPTY_LEAF: MerkleDigest = [0u8; 32];

const LEAF_CONTEXT: &[u8] = b"sbd.io secure-block-device 2015 merkle leaf";
const NODE_CONTEXT: &[u8] = b"sbd.io secure-block-device 2015 merkle node";
const SEED_CONTEXT: &[u8] = b"sbd.io secure-block-device 2015 merkle seed";

/// Hashes a management block's plaintext into its leaf digest.
///
/// `H(plaintext)` over the entire management block (all tag slots
/// concatenated, plus any presence bitmap the caller chooses to include),
/// domain-separated from internal node hashing and root seeding so a leaf
/// digest can never be replayed as a node digest or vice versa.
pub fn leaf_digest(mngt_plaintext: &[u8]) -> MerkleDigest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(LEAF_CONTEXT);
    hasher.update(mngt_plaintext);
    *hasher.finalize().as_bytes()
}

fn node_digest(left: &MerkleDigest, right: &MerkleDigest) -> MerkleDigest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(NODE_CONTEXT);
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

/// Binds a raw root to the header nonce so two devices with structurally
/// identical management data but different nonces never share a root, and
/// an attacker cannot splice management blocks from one image into
/// another sharing the same raw tree shape.
pub fn seed(nonce: &[u8], raw_root: &MerkleDigest) -> MerkleDigest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(SEED_CONTEXT);
    hasher.update(nonce);
    hasher.update(raw_root);
    *hasher.finalize().as_bytes()
}

/// A growable, sparsely-populated balanced binary Merkle tree over leaf
/// digests indexed by management block number.
///
/// Only the leaf level (`levels[0]`) is persistent state; every interior
/// level is derived and rebuilt in full on each `update`, so there is no
/// stale-ancestor state to go wrong when the tree grows taller.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// `levels[0]` is the leaf level, `levels.last()` is the single-node
    /// root level. Interior levels (`levels[1..]`) are rebuilt from scratch
    /// by every `update` call and never read across calls.
    levels: Vec<Vec<MerkleDigest>>,
}

impl Default for MerkleTree {
    fn default() -> Self {
        MerkleTree {
            levels: vec![vec![]],
        }
    }
}

impl MerkleTree {
    /// An empty tree with no leaves written yet; `root()` is the digest of
    /// an all-empty single leaf.
    pub fn new() -> Self {
        MerkleTree::default()
    }

    fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Grows the leaf level so leaf `m` exists, padding new slots with
    /// [`EMPTY_LEAF`].
    fn grow_leaves(&mut self, m: usize) {
        if m >= self.leaf_count() {
            self.levels[0].resize(m + 1, EMPTY_LEAF);
        }
    }

    fn sibling_or_empty(level: &[MerkleDigest], idx: usize) -> MerkleDigest {
        level.get(idx).copied().unwrap_or(EMPTY_LEAF)
    }

    /// Rebuilds every interior level bottom-up from the current leaf
    /// level. Discards whatever interior levels existed before, since
    /// growing the leaf level can change which leaves pair up at every
    /// level above it — an incremental path-only recompute would leave
    /// ancestors of leaves outside the just-updated path stale, silently
    /// dropping them from the root (see the module doc comment).
    fn recompute_interior(&mut self) {
        self.levels.truncate(1);
        let mut level = 0;
        while self.levels[level].len() > 1 {
            let cur_len = self.levels[level].len();
            let next_len = cur_len.div_ceil(2);
            let mut next = Vec::with_capacity(next_len);
            for i in 0..next_len {
                let left = Self::sibling_or_empty(&self.levels[level], i * 2);
                let right = Self::sibling_or_empty(&self.levels[level], i * 2 + 1);
                next.push(node_digest(&left, &right));
            }
            self.levels.push(next);
            level += 1;
        }
    }

    /// Sets leaf `m` to `digest` and rebuilds every ancestor level up to
    /// the root. Leaves beyond the previous high-water mark are implicitly
    /// [`EMPTY_LEAF`].
    pub fn update(&mut self, m: u32, digest: MerkleDigest) {
        let m = m as usize;
        self.grow_leaves(m);
        self.levels[0][m] = digest;
        self.recompute_interior();
    }

    /// Confirms leaf `m` equals `digest`, the check run when a management
    /// block is loaded for the first time after open.
    pub fn verify(&self, m: u32, digest: &MerkleDigest) -> SbdResult<()> {
        let stored = self
            .levels
            .first()
            .and_then(|leaves| leaves.get(m as usize))
            .copied()
            .unwrap_or(EMPTY_LEAF);
        if &stored == digest {
            Ok(())
        } else {
            Err(SbdError::IntegrityFail { phy: m })
        }
    }

    /// The raw (unseeded) root digest. A tree with no leaves at all has a
    /// root of [`EMPTY_LEAF`].
    pub fn root(&self) -> MerkleDigest {
        self.levels
            .last()
            .and_then(|top| top.first())
            .copied()
            .unwrap_or(EMPTY_LEAF)
    }
}
