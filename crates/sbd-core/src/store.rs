//! The `Store` capability the block layer consumes: positioned,
//! byte-granular reads and writes over an untrusted backing medium, plus
//! one-shot strong randomness for the header nonce.
//!
//! Defined here rather than in `sbd-store` so `sbd-core::device` can be
//! generic over it without a dependency cycle; `sbd-store` supplies the
//! concrete implementations ([`MemStore`](../../sbd_store/struct.MemStore.html)
//! and [`FileStore`](../../sbd_store/struct.FileStore.html)) used by tests
//! and real devices.

use crate::error::{SbdError, SbdResult};

/// Positioned, byte-granular I/O plus seed generation. Implementations
/// report exactly how many bytes were transferred; a short read that
/// terminates before EOF is the caller's protocol violation to detect (see
/// [`Store::read_exact_at`]), not this trait's concern.
pub trait Store {
    /// Reads into `buf` starting at `offset`, returning the number of
    /// bytes actually read (`0` at EOF).
    fn pread(&self, buf: &mut [u8], offset: u64) -> SbdResult<usize>;

    /// Writes `buf` at `offset`, returning the number of bytes written.
    fn pwrite(&mut self, buf: &[u8], offset: u64) -> SbdResult<usize>;

    /// Fills `buf` with cryptographically strong random bytes. Used once
    /// at device creation for the header nonce.
    fn generate_seed(&mut self, buf: &mut [u8]) -> SbdResult<()>;

    /// Reads exactly `buf.len()` bytes at `offset`, or returns
    /// `SbdError::IoError` on an early EOF — a short read before EOF is a
    /// protocol violation the block layer must never mistake for success.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> SbdResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.pread(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                return Err(SbdError::IoError("short read before EOF"));
            }
            done += n;
        }
        Ok(())
    }

    /// Writes exactly `buf.len()` bytes at `offset`.
    fn write_exact_at(&mut self, buf: &[u8], offset: u64) -> SbdResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.pwrite(&buf[done..], offset + done as u64)?;
            if n == 0 {
                return Err(SbdError::IoError("store accepted zero bytes"));
            }
            done += n;
        }
        Ok(())
    }

    /// Reads a full block at `offset`, distinguishing "never written" (a
    /// clean EOF at or before `offset`, i.e. zero bytes read) from a
    /// partial write (a protocol violation, `IoError`). Returns `None` for
    /// the former, `Some(buf)`-filled for the latter.
    fn try_read_exact_at(&self, buf: &mut [u8], offset: u64) -> SbdResult<bool> {
        let n = self.pread(buf, offset)?;
        if n == 0 {
            return Ok(false);
        }
        if n < buf.len() {
            let mut done = n;
            while done < buf.len() {
                let more = self.pread(&mut buf[done..], offset + done as u64)?;
                if more == 0 {
                    return Err(SbdError::IoError("short read before EOF"));
                }
                done += more;
            }
        }
        Ok(true)
    }
}
