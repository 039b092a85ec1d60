//! Shared scaffolding for the scenario tests in `tests/`.
//!
//! Kept as library code (rather than duplicated per test file) the way
//! `frankenlibc-harness` centralizes its fixture/runner helpers in `src/`
//! and leaves `tests/*.rs` to just drive them.

use std::fs::{File, OpenOptions};
use std::path::Path;

use sbd_core::config::DeviceConfig;
use sbd_store::FileStore;

/// The `B = 4096, T = 32` geometry (`E = 128`) spec.md §8's scenarios are
/// phrased against.
pub fn scenario_config() -> DeviceConfig {
    DeviceConfig::new(4096, 32, 16).expect("scenario geometry is valid")
}

/// Opens (creating if absent) a real file at `path` for use as a fresh
/// [`FileStore`] handle. A real on-disk device is reopened through a new
/// `File` each time, exactly like any other disk-backed store — the
/// `Device` that owned the previous handle was already consumed by
/// `close`.
pub fn file_store_at(path: &Path) -> FileStore {
    let file: File = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .expect("scenario backing file opens");
    FileStore::new(file)
}
