//! The crypto envelope: authenticated encryption of one block under a
//! per-block tweak.
//!
//! Three pluggable constructions are implemented, selected once at `open`
//! and recorded in the on-disk header:
//!
//! - [`CryptoVariant::None`] — identity, for deterministic fixtures.
//! - [`CryptoVariant::Siv`] — AES-SIV, a deterministic misuse-resistant
//!   AEAD (`aes-siv`, same RustCrypto family used by comparable in-tree
//!   encrypted-disk code for its AEAD).
//! - [`CryptoVariant::Hmac`] — AES-128-CTR plus an encrypt-then-MAC
//!   HMAC-SHA256 tag, with a synthetic per-block IV derived from the tweak
//!   so that two `seal` calls with the same key/tweak/plaintext agree.
//!
//! `seal`/`open` cover data blocks, which always carry their own tag.
//! Management blocks do not — their integrity lives entirely in the
//! Merkle chain (spec.md §4.5 discards the management `seal`'s tag at
//! flush time) — so [`CryptoEnvelope::encrypt_mgmt`]/`decrypt_mgmt` give
//! them a separate, always-tagless confidentiality transform instead.

use aead::{AeadInPlace, KeyInit};
use ctr::cipher::{KeyIvInit, StreamCipher};
use aes_siv::Aes128SivAead;
use hmac::{Hmac, Mac as _};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{SbdError, SbdResult};

/// Fixed tag size produced by the `siv` variant (a 16-byte synthetic IV).
/// `none` and `hmac` accept any configured tag size, but default geometry
/// and `siv` both use 16 bytes (the `T = 16` default).
pub const SIV_TAG_SIZE: usize = 16;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Which of a block's two ciphertext-producing roles a tweak is bound to.
/// Management blocks and data blocks are encrypted under the same key but
/// must never be interchangeable, hence the domain separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDomain {
    /// A ciphertext data block.
    Data,
    /// A management (tag table) block.
    Mngt,
}

impl BlockDomain {
    fn tag_byte(self) -> u8 {
        match self {
            BlockDomain::Data => 0,
            BlockDomain::Mngt => 1,
        }
    }
}

/// The per-block domain-separated input bound into the AEAD so that
/// identical plaintexts at different logical positions produce
/// independent ciphertexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tweak {
    /// Logical block index (for `Data`) or management block number (for
    /// `Mngt`).
    pub index: u32,
    /// Which domain this tweak belongs to.
    pub domain: BlockDomain,
}

impl Tweak {
    /// Builds the tweak for a data block at logical index `log`.
    pub fn data(log: u32) -> Self {
        Tweak {
            index: log,
            domain: BlockDomain::Data,
        }
    }

    /// Builds the tweak for management block number `m`.
    pub fn mngt(m: u32) -> Self {
        Tweak {
            index: m,
            domain: BlockDomain::Mngt,
        }
    }

    /// 9-byte encoding: 8-byte little-endian index, then a 1-byte domain
    /// separator.
    fn encode(self) -> [u8; 9] {
        let mut buf = [0u8; 9];
        buf[..8].copy_from_slice(&(self.index as u64).to_le_bytes());
        buf[8] = self.domain.tag_byte();
        buf
    }
}

/// On-disk crypto variant selector (`u16 LE` header field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CryptoVariant {
    /// No confidentiality or integrity; deterministic identity transform.
    None = 0,
    /// AES-SIV deterministic AEAD.
    Siv = 1,
    /// AES-CTR + HMAC-SHA256 encrypt-then-MAC.
    Hmac = 2,
}

impl CryptoVariant {
    /// Parses the `u16 LE` header field, rejecting unknown codes with
    /// `Unsupported`.
    pub fn from_code(code: u16) -> SbdResult<Self> {
        match code {
            0 => Ok(CryptoVariant::None),
            1 => Ok(CryptoVariant::Siv),
            2 => Ok(CryptoVariant::Hmac),
            _ => Err(SbdError::Unsupported("unknown crypto variant code")),
        }
    }

    /// The code stored in the header.
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Seals and opens blocks under one fixed key and variant.
///
/// Constructed once per device at `open` from the caller-supplied key
/// material; key derivation (not key management, which stays out of
/// scope here) uses `blake3::derive_key` with a per-subkey context
/// string, the same "derive, don't reuse a single key across purposes"
/// idiom the corpus's integrity-hashing code follows.
pub struct CryptoEnvelope {
    variant: CryptoVariant,
    tag_size: usize,
    siv: Option<Aes128SivAead>,
    ctr_key: Option<[u8; 16]>,
    mac_key: Option<[u8; 32]>,
    /// Confidentiality-only subkey used for management blocks (see
    /// [`Self::encrypt_mgmt`]). Present for every variant, including `none`
    /// where it is unused, to keep field presence uniform.
    mgmt_key: [u8; 16],
}

const SIV_CONTEXT: &str = "sbd.io secure-block-device 2015 aes-siv key v1";
const CTR_CONTEXT: &str = "sbd.io secure-block-device 2015 aes-ctr key v1";
const MAC_CONTEXT: &str = "sbd.io secure-block-device 2015 hmac-sha256 key v1";
const MGMT_CONTEXT: &str = "sbd.io secure-block-device 2015 mgmt-ctr key v1";

impl CryptoEnvelope {
    /// Builds the envelope for `variant` from raw key material `key` and
    /// the device's configured tag size.
    pub fn new(variant: CryptoVariant, key: &[u8], tag_size: usize) -> SbdResult<Self> {
        if key.is_empty() {
            return Err(SbdError::IllegalParam("key must be non-empty"));
        }
        let mgmt_full = blake3::derive_key(MGMT_CONTEXT, key);
        let mut mgmt_key = [0u8; 16];
        mgmt_key.copy_from_slice(&mgmt_full[..16]);

        match variant {
            CryptoVariant::None => Ok(CryptoEnvelope {
                variant,
                tag_size,
                siv: None,
                ctr_key: None,
                mac_key: None,
                mgmt_key,
            }),
            CryptoVariant::Siv => {
                if tag_size < SIV_TAG_SIZE {
                    return Err(SbdError::IllegalParam(
                        "siv variant requires a tag slot of at least 16 bytes",
                    ));
                }
                let sub = blake3::derive_key(SIV_CONTEXT, key);
                let siv = Aes128SivAead::new_from_slice(&sub)
                    .map_err(|_| SbdError::IllegalParam("failed to derive AES-SIV key"))?;
                Ok(CryptoEnvelope {
                    variant,
                    tag_size,
                    siv: Some(siv),
                    ctr_key: None,
                    mac_key: None,
                    mgmt_key,
                })
            }
            CryptoVariant::Hmac => {
                let ctr_full = blake3::derive_key(CTR_CONTEXT, key);
                let mac_full = blake3::derive_key(MAC_CONTEXT, key);
                let mut ctr_key = [0u8; 16];
                ctr_key.copy_from_slice(&ctr_full[..16]);
                Ok(CryptoEnvelope {
                    variant,
                    tag_size,
                    siv: None,
                    ctr_key: Some(ctr_key),
                    mac_key: Some(mac_full),
                    mgmt_key,
                })
            }
        }
    }

    /// Which variant this envelope was constructed for.
    pub fn variant(&self) -> CryptoVariant {
        self.variant
    }

    /// The actual byte length `seal`/`open` produce and expect.
    ///
    /// For `none`/`hmac` this is the configured tag slot size (`T`); for
    /// `siv` it is always [`SIV_TAG_SIZE`] regardless of the configured
    /// slot capacity, since AES-SIV's synthetic IV has a fixed width — a
    /// management tag slot only needs to be *at least* that wide, and any
    /// extra slot bytes stay zero-filled.
    pub fn tag_len(&self) -> usize {
        match self.variant {
            CryptoVariant::Siv => SIV_TAG_SIZE,
            CryptoVariant::None | CryptoVariant::Hmac => self.tag_size,
        }
    }

    /// `seal(key, tweak, plaintext) -> (ciphertext, tag)`.
    /// `plaintext.len()` must equal the block size; the returned
    /// ciphertext has the same length and the tag has `tag_size` bytes.
    ///
    /// `none`'s tag is never all-zero (a fixed `0xFF`-filled marker, not a
    /// real authentication value): the device layer uses an all-zero tag
    /// slot as its "never written" sentinel (see
    /// `crate::device::Device::fault_in_data`), and `none` is otherwise the
    /// one variant whose tag would, without this, always be that same
    /// all-zero value — indistinguishable from an unwritten slot.
    pub fn seal(&self, tweak: Tweak, plaintext: &[u8]) -> SbdResult<(Vec<u8>, Vec<u8>)> {
        match self.variant {
            CryptoVariant::None => Ok((plaintext.to_vec(), vec![0xFFu8; self.tag_len()])),
            CryptoVariant::Siv => {
                let siv = self.siv.as_ref().expect("siv key present for Siv variant");
                let mut buf = plaintext.to_vec();
                let aad = tweak.encode();
                let nonce = aead::Nonce::<Aes128SivAead>::default();
                let tag = siv
                    .encrypt_in_place_detached(&nonce, &aad, &mut buf)
                    .map_err(|_| SbdError::IllegalParam("AES-SIV encryption failed"))?;
                Ok((buf, tag.to_vec()))
            }
            CryptoVariant::Hmac => {
                let ctr_key = self.ctr_key.expect("ctr key present for Hmac variant");
                let mac_key = self.mac_key.expect("mac key present for Hmac variant");
                let iv = synthetic_iv(&mac_key, tweak);
                let mut buf = plaintext.to_vec();
                let key = ctr::cipher::Key::<Aes128Ctr>::from_slice(&ctr_key);
                let nonce = ctr::cipher::Iv::<Aes128Ctr>::from_slice(&iv);
                let mut cipher = Aes128Ctr::new(key, nonce);
                cipher.apply_keystream(&mut buf);
                let tag = hmac_tag(&mac_key, &buf, tweak, self.tag_size);
                Ok((buf, tag))
            }
        }
    }

    /// `open(key, tweak, ciphertext, tag) -> plaintext | INTEGRITY_FAIL`.
    /// `ciphertext.len()` must equal the block size.
    pub fn open(&self, tweak: Tweak, ciphertext: &[u8], tag: &[u8]) -> SbdResult<Vec<u8>> {
        if tag.len() != self.tag_len() {
            return Err(SbdError::IllegalParam("tag length does not match the variant's tag length"));
        }
        match self.variant {
            CryptoVariant::None => Ok(ciphertext.to_vec()),
            CryptoVariant::Siv => {
                let siv = self.siv.as_ref().expect("siv key present for Siv variant");
                let mut buf = ciphertext.to_vec();
                let aad = tweak.encode();
                let nonce = aead::Nonce::<Aes128SivAead>::default();
                let tag_arr = aead::Tag::<Aes128SivAead>::from_slice(tag);
                siv.decrypt_in_place_detached(&nonce, &aad, &mut buf, tag_arr)
                    .map_err(|_| integrity_fail(tweak))?;
                Ok(buf)
            }
            CryptoVariant::Hmac => {
                let ctr_key = self.ctr_key.expect("ctr key present for Hmac variant");
                let mac_key = self.mac_key.expect("mac key present for Hmac variant");
                let expected = hmac_tag(&mac_key, ciphertext, tweak, self.tag_size);
                if expected.ct_eq(tag).unwrap_u8() == 0 {
                    return Err(integrity_fail(tweak));
                }
                let iv = synthetic_iv(&mac_key, tweak);
                let mut buf = ciphertext.to_vec();
                let key = ctr::cipher::Key::<Aes128Ctr>::from_slice(&ctr_key);
                let nonce = ctr::cipher::Iv::<Aes128Ctr>::from_slice(&iv);
                let mut cipher = Aes128Ctr::new(key, nonce);
                cipher.apply_keystream(&mut buf);
                Ok(buf)
            }
        }
    }

    /// Confidentiality-only transform for management block plaintext.
    ///
    /// Management blocks carry no independent authentication tag on disk —
    /// spec.md §4.5's flush algorithm seals them and then discards the tag,
    /// since a management block's integrity is established entirely by the
    /// Merkle tree leaf digest, not by the AEAD check. That means the
    /// on-disk ciphertext must be invertible without a tag, which AES-SIV's
    /// detached-tag construction is not. This uses a dedicated AES-128-CTR
    /// keystream, keyed independently of the chosen data-block variant and
    /// domain-separated by `tweak` the same way `seal`/`open` are, so a
    /// management block's ciphertext never aliases a data block's.
    pub fn encrypt_mgmt(&self, tweak: Tweak, plaintext: &[u8]) -> Vec<u8> {
        self.mgmt_keystream_xor(tweak, plaintext)
    }

    /// Inverse of [`Self::encrypt_mgmt`]; this is purely a confidentiality
    /// transform and cannot fail — tampering is caught upstream by
    /// `Merkle::verify` on the resulting plaintext's leaf digest.
    pub fn decrypt_mgmt(&self, tweak: Tweak, ciphertext: &[u8]) -> Vec<u8> {
        self.mgmt_keystream_xor(tweak, ciphertext)
    }

    fn mgmt_keystream_xor(&self, tweak: Tweak, input: &[u8]) -> Vec<u8> {
        if matches!(self.variant, CryptoVariant::None) {
            return input.to_vec();
        }
        let iv = synthetic_iv(&self.mgmt_key_as_mac_seed(), tweak);
        let mut buf = input.to_vec();
        let key = ctr::cipher::Key::<Aes128Ctr>::from_slice(&self.mgmt_key);
        let nonce = ctr::cipher::Iv::<Aes128Ctr>::from_slice(&iv);
        let mut cipher = Aes128Ctr::new(key, nonce);
        cipher.apply_keystream(&mut buf);
        buf
    }

    /// `synthetic_iv` wants a 32-byte HMAC seed; the management path has no
    /// separate MAC key (it has no MAC at all), so it derives one
    /// deterministically from `mgmt_key` for IV generation only.
    fn mgmt_key_as_mac_seed(&self) -> [u8; 32] {
        let mut seed = [0u8; 32];
        seed[..16].copy_from_slice(&self.mgmt_key);
        seed[16..].copy_from_slice(&self.mgmt_key);
        seed
    }
}

fn integrity_fail(tweak: Tweak) -> SbdError {
    SbdError::IntegrityFail { phy: tweak.index }
}

fn synthetic_iv(mac_key: &[u8; 32], tweak: Tweak) -> [u8; 16] {
    let mut mac = HmacSha256::new_from_slice(mac_key).expect("HMAC accepts any key length");
    mac.update(b"iv");
    mac.update(&tweak.encode());
    let digest = mac.finalize().into_bytes();
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&digest[..16]);
    iv
}

fn hmac_tag(mac_key: &[u8; 32], ciphertext: &[u8], tweak: Tweak, tag_size: usize) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(mac_key).expect("HMAC accepts any key length");
    mac.update(ciphertext);
    mac.update(&tweak.encode());
    let digest = mac.finalize().into_bytes();
    digest[..tag_size.min(digest.len())].to_vec()
}
