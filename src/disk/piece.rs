//! In-progress piece state for the write pipeline.
//!
//! A [`PartialPiece`] buffers inbound blocks so they can be hashed and
//! written in batches. The incremental hash state lives in a separate
//! [`PieceWork`] value: while the piece is busy, that value (together with
//! the drained blocks) is moved into the worker job and moved back through
//! the completion event, so exactly one thread can ever touch it and the
//! channel hop orders the accesses.
//!
//! Blocks in `buffer` are kept strictly ascending by offset. Blocks that
//! could not be saved because of a disk error are merged back in, which
//! may place already-hashed blocks (offsets below `unhashed_offset`) at
//! the front; those only need saving, not hashing.

use std::ops::Range;
use std::time::Instant;

use sha1::{Digest, Sha1};

use crate::bitfield::Bitfield;
use crate::cache::DiskBuffer;
use crate::constants::BLOCK_SIZE;
use crate::disk::error::DiskError;

/// Invoked on the disk actor once a block is durably written, or once its
/// save is wrapped up by an error.
pub type SaveHandler = Box<dyn FnOnce(Result<(), DiskError>) + Send + 'static>;

/// Invoked on the disk actor exactly once when the piece's hash has been
/// verified; `true` means the piece is valid.
pub type PieceCompletionHandler = Box<dyn FnOnce(bool) + Send + 'static>;

/// A buffered block awaiting hashing and saving.
pub(crate) struct Block {
    /// Offset of this block within its piece; a multiple of 16 KiB.
    pub offset: u32,
    pub data: DiskBuffer,
    /// Taken when the save outcome is delivered.
    pub save_handler: Option<SaveHandler>,
}

impl Block {
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    /// The first byte offset past this block.
    pub fn end(&self) -> u32 {
        self.offset + self.len()
    }
}

/// Incremental hash state, owned by at most one thread at a time.
pub(crate) struct PieceWork {
    /// Blocks may only be fed in ascending offset order.
    pub hasher: Sha1,
    /// First byte of the first not-yet-hashed block. Non-decreasing.
    pub unhashed_offset: u32,
}

impl PieceWork {
    fn new() -> Self {
        Self {
            hasher: Sha1::new(),
            unhashed_offset: 0,
        }
    }

    /// The digest of everything fed so far, without consuming the state.
    /// Keeping the state intact lets a failed final save retry without
    /// re-reading hashed data.
    pub fn digest(&self) -> [u8; 20] {
        self.hasher.clone().finalize().into()
    }
}

pub(crate) struct PartialPiece {
    pub index: u32,
    /// Length of this piece in bytes.
    pub length: u32,
    /// Blocks waiting to be processed, ascending by offset, disjoint from
    /// any blocks currently held by a worker.
    pub buffer: Vec<Block>,
    /// One bit per block: set once the block is durably written.
    pub save_progress: Bitfield,
    pub num_saved_blocks: u32,
    /// Set while a worker owns this piece's work state and drained blocks.
    pub is_busy: bool,
    /// Present exactly when the piece is not busy.
    pub work: Option<PieceWork>,
    /// Stored from the first `save_block` call for this piece; later
    /// callers' handlers are discarded.
    pub completion_handler: Option<PieceCompletionHandler>,
    /// Deadline after which buffered blocks are flushed regardless of
    /// batch size.
    pub expiry: Option<Instant>,
}

impl PartialPiece {
    pub fn new(index: u32, length: u32, completion_handler: PieceCompletionHandler) -> Self {
        let num_blocks = length.div_ceil(BLOCK_SIZE) as usize;
        Self {
            index,
            length,
            buffer: Vec::new(),
            save_progress: Bitfield::new(num_blocks),
            num_saved_blocks: 0,
            is_busy: false,
            work: Some(PieceWork::new()),
            completion_handler: Some(completion_handler),
            expiry: None,
        }
    }

    /// Total number of blocks in the piece, not just the buffered ones.
    pub fn num_blocks(&self) -> usize {
        self.length.div_ceil(BLOCK_SIZE) as usize
    }

    /// Whether every block has either been saved or sits in `buffer`.
    /// Buffered blocks are never saved ones, so the two sets are disjoint.
    pub fn is_complete(&self) -> bool {
        self.num_saved_blocks as usize + self.buffer.len() == self.num_blocks()
    }

    pub fn has_buffered(&self, offset: u32) -> bool {
        self.buffer
            .binary_search_by_key(&offset, |b| b.offset)
            .is_ok()
    }

    /// Inserts a block at the position preserving ascending offset order.
    pub fn insert_block(&mut self, block: Block) {
        match self.buffer.binary_search_by_key(&block.offset, |b| b.offset) {
            // Duplicates are rejected before insertion.
            Ok(_) => debug_assert!(false, "duplicate block buffered"),
            Err(position) => self.buffer.insert(position, block),
        }
    }

    /// The maximal run of buffered blocks that starts exactly at
    /// `unhashed_offset` and is contiguous in offsets, as a range of
    /// `buffer` indices. Empty if the next unhashed block is missing.
    pub fn hashable_range(&self, unhashed_offset: u32) -> Range<usize> {
        let Ok(start) = self
            .buffer
            .binary_search_by_key(&unhashed_offset, |b| b.offset)
        else {
            return 0..0;
        };
        let mut end = start;
        let mut expected = unhashed_offset;
        while end < self.buffer.len() && self.buffer[end].offset == expected {
            expected = self.buffer[end].end();
            end += 1;
        }
        start..end
    }

    /// Puts blocks a worker could not save back into `buffer`, restoring
    /// offset order. Slightly expensive, but save failures are expected to
    /// be rare and mean bigger problems than a merge.
    ///
    /// A block that arrived while its offset was in flight collides with
    /// the restored copy; the restored one wins because its bytes may
    /// already be part of the hash state. The displaced newcomers are
    /// returned so the caller can conclude their save handlers.
    pub fn restore_blocks(&mut self, blocks: Vec<Block>) -> Vec<Block> {
        let mut displaced = Vec::new();
        for block in blocks {
            match self.buffer.binary_search_by_key(&block.offset, |b| b.offset) {
                Ok(position) => {
                    displaced.push(std::mem::replace(&mut self.buffer[position], block));
                }
                Err(position) => self.buffer.insert(position, block),
            }
        }
        displaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DiskBufferPool;
    use std::sync::Arc;

    fn block(pool: &Arc<DiskBufferPool>, offset: u32, len: u32) -> Block {
        Block {
            offset,
            data: pool.get(len as usize),
            save_handler: Some(Box::new(|_| {})),
        }
    }

    fn piece() -> PartialPiece {
        PartialPiece::new(0, 4 * BLOCK_SIZE, Box::new(|_| {}))
    }

    #[test]
    fn test_insert_keeps_offsets_sorted() {
        let pool = DiskBufferPool::new();
        let mut piece = piece();
        for offset in [3, 0, 2, 1] {
            piece.insert_block(block(&pool, offset * BLOCK_SIZE, BLOCK_SIZE));
        }
        let offsets: Vec<u32> = piece.buffer.iter().map(|b| b.offset).collect();
        assert_eq!(
            offsets,
            vec![0, BLOCK_SIZE, 2 * BLOCK_SIZE, 3 * BLOCK_SIZE]
        );
        assert!(piece.is_complete());
    }

    #[test]
    fn test_hashable_range_requires_start_at_unhashed_offset() {
        let pool = DiskBufferPool::new();
        let mut piece = piece();
        piece.insert_block(block(&pool, BLOCK_SIZE, BLOCK_SIZE));
        piece.insert_block(block(&pool, 2 * BLOCK_SIZE, BLOCK_SIZE));
        // Nothing starts at offset 0.
        assert_eq!(piece.hashable_range(0), 0..0);

        piece.insert_block(block(&pool, 0, BLOCK_SIZE));
        assert_eq!(piece.hashable_range(0), 0..3);
    }

    #[test]
    fn test_hashable_range_stops_at_gap() {
        let pool = DiskBufferPool::new();
        let mut piece = piece();
        piece.insert_block(block(&pool, 0, BLOCK_SIZE));
        piece.insert_block(block(&pool, BLOCK_SIZE, BLOCK_SIZE));
        piece.insert_block(block(&pool, 3 * BLOCK_SIZE, BLOCK_SIZE));
        assert_eq!(piece.hashable_range(0), 0..2);
    }

    #[test]
    fn test_hashable_range_after_partial_hash() {
        let pool = DiskBufferPool::new();
        let mut piece = piece();
        // Blocks 0 and 1 were hashed and saved earlier.
        piece.insert_block(block(&pool, 2 * BLOCK_SIZE, BLOCK_SIZE));
        piece.insert_block(block(&pool, 3 * BLOCK_SIZE, BLOCK_SIZE));
        assert_eq!(piece.hashable_range(2 * BLOCK_SIZE), 0..2);
    }

    #[test]
    fn test_restore_blocks_merges_in_order() {
        let pool = DiskBufferPool::new();
        let mut piece = piece();
        piece.insert_block(block(&pool, 2 * BLOCK_SIZE, BLOCK_SIZE));
        let displaced = piece.restore_blocks(vec![
            block(&pool, 0, BLOCK_SIZE),
            block(&pool, 3 * BLOCK_SIZE, BLOCK_SIZE),
        ]);
        assert!(displaced.is_empty());
        let offsets: Vec<u32> = piece.buffer.iter().map(|b| b.offset).collect();
        assert_eq!(offsets, vec![0, 2 * BLOCK_SIZE, 3 * BLOCK_SIZE]);
    }

    #[test]
    fn test_restore_blocks_displaces_duplicate_arrival() {
        let pool = DiskBufferPool::new();
        let mut piece = piece();
        // A copy of block 1 arrived while the original was in flight.
        piece.insert_block(block(&pool, BLOCK_SIZE, BLOCK_SIZE));
        let displaced = piece.restore_blocks(vec![block(&pool, BLOCK_SIZE, BLOCK_SIZE)]);
        assert_eq!(displaced.len(), 1);
        assert_eq!(piece.buffer.len(), 1);
    }

    #[test]
    fn test_completion_with_saved_blocks() {
        let pool = DiskBufferPool::new();
        let mut piece = piece();
        piece.save_progress.set(0);
        piece.save_progress.set(2);
        piece.num_saved_blocks = 2;
        piece.insert_block(block(&pool, BLOCK_SIZE, BLOCK_SIZE));
        assert!(!piece.is_complete());
        piece.insert_block(block(&pool, 3 * BLOCK_SIZE, BLOCK_SIZE));
        assert!(piece.is_complete());
    }

    #[test]
    fn test_work_digest_is_repeatable() {
        let mut work = PieceWork::new();
        work.hasher.update(b"hello");
        let first = work.digest();
        let second = work.digest();
        assert_eq!(first, second);
        let expected: [u8; 20] = Sha1::digest(b"hello").into();
        assert_eq!(first, expected);
    }
}
