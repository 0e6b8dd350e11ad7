use std::path::PathBuf;

use crate::constants::{
    DEFAULT_READ_CACHE_CAPACITY, DEFAULT_READ_CACHE_LINE_SIZE, DEFAULT_WRITE_BUFFER_CAPACITY,
    DEFAULT_WRITE_CACHE_LINE_SIZE,
};

/// Tunables read by the disk core. All block-denominated values count
/// 16 KiB blocks.
#[derive(Debug, Clone)]
pub struct DiskSettings {
    /// Number of contiguous hashable blocks that triggers a combined
    /// hash-and-save batch.
    pub write_cache_line_size: u32,
    /// Number of buffered blocks per piece that forces a flush, hashable
    /// or not. Values above `write_cache_line_size` let hashable batches
    /// form before the forced flush kicks in.
    pub write_buffer_capacity: u32,
    /// Total read cache capacity.
    pub read_cache_capacity: u32,
    /// How many contiguous blocks a single-block read is expanded to.
    pub read_cache_line_size: u32,
    /// Worker pool size; `None` derives it from the CPU count.
    pub concurrency: Option<usize>,
    pub read_ahead_enabled: bool,
    /// Directory holding per-torrent resume data files.
    pub resume_data_path: PathBuf,
}

impl Default for DiskSettings {
    fn default() -> Self {
        Self {
            write_cache_line_size: DEFAULT_WRITE_CACHE_LINE_SIZE,
            write_buffer_capacity: DEFAULT_WRITE_BUFFER_CAPACITY,
            read_cache_capacity: DEFAULT_READ_CACHE_CAPACITY,
            read_cache_line_size: DEFAULT_READ_CACHE_LINE_SIZE,
            concurrency: None,
            read_ahead_enabled: true,
            resume_data_path: PathBuf::from("resume"),
        }
    }
}

impl DiskSettings {
    /// Clamps values into their valid ranges.
    pub(crate) fn sanitized(mut self) -> Self {
        self.write_cache_line_size = self.write_cache_line_size.max(1);
        self.write_buffer_capacity = self.write_buffer_capacity.max(1);
        self.read_cache_capacity = self.read_cache_capacity.max(1);
        self.read_cache_line_size = self.read_cache_line_size.max(1);
        self
    }
}
