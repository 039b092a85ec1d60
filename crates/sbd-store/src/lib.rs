//! The `Store` capability the block layer consumes: positioned,
//! byte-granular reads and writes over an untrusted backing medium, plus
//! one-shot strong randomness for the header nonce.
//!
//! Two implementations are provided: [`MemStore`] (a growable in-memory
//! buffer, used by tests and fixtures) and [`FileStore`] (a real file,
//! using positioned I/O so the device never needs to seek).

use std::cell::RefCell;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::rc::Rc;

use sbd_core::error::{SbdError, SbdResult};
pub use sbd_core::store::Store;

/// An in-memory, growable backing store. Reads past the current length
/// report a short (possibly zero-length) read, exactly like a sparse file
/// that has never been extended that far — this is what lets
/// `read_exact_at` surface `NOT_WRITTEN`-adjacent conditions during
/// testing without a real filesystem.
///
/// Backed by `Rc<RefCell<Vec<u8>>>` and `Clone`, so a scenario test can
/// hold on to the same backing buffer across a `Device::close` (which
/// consumes the `Store` it was opened with) and a subsequent `Device::open`
/// over the same bytes, without going through a real file.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    data: Rc<RefCell<Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.borrow().is_empty()
    }
}

impl Store for MemStore {
    fn pread(&self, buf: &mut [u8], offset: u64) -> SbdResult<usize> {
        let data = self.data.borrow();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let available = data.len() - offset;
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> SbdResult<usize> {
        let mut data = self.data.borrow_mut();
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn generate_seed(&mut self, buf: &mut [u8]) -> SbdResult<()> {
        getrandom::getrandom(buf).map_err(|_| SbdError::IoError("seed generation failed"))
    }
}

/// A real file used as the backing store, through positioned
/// (`pread`/`pwrite`-style) I/O so concurrent logical operations never
/// need to share or restore a file cursor.
pub struct FileStore {
    file: File,
}

impl FileStore {
    pub fn new(file: File) -> Self {
        FileStore { file }
    }
}

fn map_io_err(e: io::Error) -> SbdError {
    let _ = e;
    SbdError::IoError("store I/O failed")
}

impl Store for FileStore {
    fn pread(&self, buf: &mut [u8], offset: u64) -> SbdResult<usize> {
        loop {
            match self.file.read_at(buf, offset) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_io_err(e)),
            }
        }
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> SbdResult<usize> {
        loop {
            match self.file.write_at(buf, offset) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_io_err(e)),
            }
        }
    }

    fn generate_seed(&mut self, buf: &mut [u8]) -> SbdResult<()> {
        getrandom::getrandom(buf).map_err(|_| SbdError::IoError("seed generation failed"))
    }
}
