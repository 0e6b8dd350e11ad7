//! Tuning parameters and constants for the disk core.
//!
//! Defaults follow the conventions of mainstream clients (libtorrent,
//! qBittorrent): 16 KiB transfer blocks, small hashed write batches, and a
//! bounded flush buffer per piece.

use std::time::Duration;

// ============================================================================
// Blocks
// ============================================================================

/// Size of a transfer block (16 KiB). Every block except possibly the last
/// block of the last piece has exactly this size.
pub const BLOCK_SIZE: u32 = 0x4000;

/// Alignment of pooled disk buffers. Page-aligned buffers keep positioned
/// I/O on the fast path for direct and mmap-backed storage alike.
pub const BUFFER_ALIGNMENT: usize = 4096;

/// Number of 16 KiB buffers kept warm in the disk buffer pool.
pub const BUFFER_POOL_CAPACITY: usize = 1024;

// ============================================================================
// Write pipeline
// ============================================================================

/// Default number of contiguous hashable blocks that triggers a combined
/// hash-and-save batch.
pub const DEFAULT_WRITE_CACHE_LINE_SIZE: u32 = 4;

/// Default number of buffered blocks per piece that forces a flush even if
/// the blocks are not contiguous.
pub const DEFAULT_WRITE_BUFFER_CAPACITY: u32 = 16;

/// How long a piece's buffered blocks may linger before they are flushed
/// regardless of batch size.
pub const WRITE_BUFFER_EXPIRY: Duration = Duration::from_secs(10);

/// Upper bound on the delay between retries after a fatal disk error.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);

/// Initial retry delay after the first failed save attempt.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// Read pipeline
// ============================================================================

/// Default capacity of the read cache, in blocks (64 MiB worth).
pub const DEFAULT_READ_CACHE_CAPACITY: u32 = 4096;

/// Default read-ahead span, in blocks.
pub const DEFAULT_READ_CACHE_LINE_SIZE: u32 = 8;

// ============================================================================
// Worker pool
// ============================================================================

/// A worker that has had no job for this long tears itself down.
pub const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Resume data
// ============================================================================

/// File extension of per-torrent resume data files.
pub const RESUME_FILE_EXTENSION: &str = "resume";
