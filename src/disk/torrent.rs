//! Per-torrent bookkeeping inside the disk coordinator.

use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::blockinfo::{BlockInfo, BlockSource};
use crate::constants::BLOCK_SIZE;
use crate::disk::backoff::ExponentialBackoff;
use crate::disk::error::DiskError;
use crate::disk::piece::PartialPiece;
use crate::storage::TorrentStorage;
use crate::TorrentId;

/// Invoked on the disk actor with the fetched block, or with the error
/// every subscriber of the failed fetch receives.
pub type FetchHandler = Box<dyn FnOnce(Result<BlockSource, DiskError>) + Send + 'static>;

/// A request waiting on an already-dispatched read that covers its block.
pub(crate) struct FetchSubscriber {
    pub handler: FetchHandler,
    pub requested_offset: u32,
}

/// One in-flight read operation. Requests for any block inside the
/// dispatched span subscribe here instead of launching their own read;
/// the entry is removed once the read completes and everyone is served.
pub(crate) struct BlockFetch {
    /// The block that triggered the read.
    pub info: BlockInfo,
    /// How many contiguous blocks the dispatched read covers, starting at
    /// `info.offset`.
    pub num_blocks: u32,
    /// Ordered by requested offset.
    pub subscribers: Vec<FetchSubscriber>,
}

impl BlockFetch {
    /// Whether the dispatched span covers a request at `offset`.
    pub fn covers(&self, piece_index: u32, offset: u32) -> bool {
        self.info.piece_index == piece_index
            && offset >= self.info.offset
            && offset < self.info.offset + self.num_blocks * BLOCK_SIZE
    }

    pub fn subscribe(&mut self, subscriber: FetchSubscriber) {
        let position = self
            .subscribers
            .partition_point(|s| s.requested_offset <= subscriber.requested_offset);
        self.subscribers.insert(position, subscriber);
    }
}

/// Aggregates everything the coordinator tracks for one torrent.
pub(crate) struct TorrentEntry {
    pub id: TorrentId,
    pub storage: Arc<TorrentStorage>,
    /// Concatenated 20-byte SHA-1 digests, one per piece.
    pub piece_hashes: Bytes,
    /// In-progress pieces keyed by piece index.
    pub pieces: HashMap<u32, PartialPiece>,
    pub block_fetches: Vec<BlockFetch>,
    /// Jobs in flight for this torrent; the entry may only be torn down
    /// once this reaches zero.
    pub num_pending_ops: Arc<AtomicU32>,
    pub backoff: ExponentialBackoff,
    /// While set, write dispatch is suppressed until the deadline passes.
    pub retry_at: Option<Instant>,
}

impl TorrentEntry {
    pub fn new(id: TorrentId, storage: Arc<TorrentStorage>, piece_hashes: Bytes) -> Self {
        Self {
            id,
            storage,
            piece_hashes,
            pieces: HashMap::new(),
            block_fetches: Vec::new(),
            num_pending_ops: Arc::new(AtomicU32::new(0)),
            backoff: ExponentialBackoff::new(),
            retry_at: None,
        }
    }

    pub fn expected_piece_hash(&self, index: u32) -> Option<[u8; 20]> {
        let start = index as usize * 20;
        let digest = self.piece_hashes.get(start..start + 20)?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(digest);
        Some(hash)
    }

    /// Whether the save-retry gate is currently closed.
    pub fn retry_gated(&self, now: Instant) -> bool {
        self.retry_at.is_some_and(|at| at > now)
    }

    pub fn num_buffered_blocks(&self) -> usize {
        self.pieces.values().map(|p| p.buffer.len()).sum()
    }
}
