//! Read caching and block buffer management.
//!
//! The read path is served by an admission-controlled Window-TinyLFU cache
//! backed by a count-min frequency sketch; block transfer buffers come
//! from a reusable page-aligned pool.

mod buffer_pool;
mod lru;
mod sketch;
mod tinylfu;

pub use buffer_pool::{DiskBuffer, DiskBufferPool};
pub use sketch::FrequencySketch;
pub use tinylfu::WTinyLfu;
