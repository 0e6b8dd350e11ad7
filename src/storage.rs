//! Per-torrent file-backed storage.
//!
//! Maps pieces and blocks onto file regions and performs the actual
//! positioned reads and writes. All functions here are blocking and meant
//! to run on the worker pool; the disk coordinator never calls them from
//! its own thread.
//!
//! # Security
//!
//! File paths are validated on construction: components that would escape
//! the torrent's root directory (`..`, absolute paths) are rejected.

mod error;
mod file;
mod torrent;

pub use error::StorageError;
pub use file::{AllocationMode, FileEntry, FileSpan, StorageInfo};
pub use torrent::TorrentStorage;
