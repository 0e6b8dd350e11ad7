//! rdisk - the disk I/O core of a BitTorrent engine.
//!
//! The crate stands between a non-blocking event loop and the disk: block
//! writes are buffered per piece and flushed in hashed batches, reads are
//! coalesced, expanded into read-ahead spans and cached behind a
//! Window-TinyLFU admission filter, and all blocking file I/O and SHA-1
//! hashing runs on a dynamically sized worker pool.
//!
//! # Modules
//!
//! - [`disk`] - The coordinator actor and its public handle
//! - [`storage`] - Per-torrent file-backed storage (blocking, pool-side)
//! - [`cache`] - W-TinyLFU read cache and the disk buffer pool
//! - [`pool`] - Worker pool for blocking jobs
//! - [`bitfield`] - Piece/block bit sets
//! - [`blockinfo`] - Block identity and data views
//! - [`constants`] - Tuning parameters
//!
//! # Example
//!
//! ```no_run
//! use rdisk::{disk, storage::{FileEntry, StorageInfo}};
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (handle, join) = disk::spawn(disk::DiskSettings::default());
//!
//!     let info = StorageInfo {
//!         piece_length: 0x8000,
//!         total_length: 0x10000,
//!         files: vec![FileEntry::new("data.bin".into(), 0x10000, 0)],
//!     };
//!     handle.allocate_torrent(
//!         0,
//!         "downloads".into(),
//!         "example".into(),
//!         info,
//!         Bytes::from(vec![0u8; 40]),
//!         |result| { result.expect("allocation"); },
//!     );
//!
//!     handle.shutdown();
//!     join.await.unwrap();
//! }
//! ```

pub mod bitfield;
pub mod blockinfo;
pub mod cache;
pub mod constants;
pub mod disk;
pub mod pool;
pub mod storage;

/// Identifies a torrent within the engine.
pub type TorrentId = u32;

pub use bitfield::Bitfield;
pub use blockinfo::{BlockInfo, BlockSource};
pub use cache::{DiskBuffer, DiskBufferPool, FrequencySketch, WTinyLfu};
pub use disk::{DiskError, DiskHandle, DiskSettings, DiskStats};
pub use pool::WorkerPool;
pub use storage::{
    AllocationMode, FileEntry, FileSpan, StorageError, StorageInfo, TorrentStorage,
};
