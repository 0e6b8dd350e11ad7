//! Block identity and block data views.

use bytes::Bytes;

use crate::constants::BLOCK_SIZE;

/// Identifies a block within a torrent: `(piece, offset in piece, length)`.
///
/// A valid block offset is 16 KiB-aligned and the length is at most 16 KiB;
/// only the last block of a piece may be shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }

    /// The block's ordinal within its piece.
    pub fn index_in_piece(&self) -> usize {
        (self.offset / BLOCK_SIZE) as usize
    }

    /// Validates the block against its piece's length.
    pub fn is_valid(&self, piece_length: u32) -> bool {
        self.offset % BLOCK_SIZE == 0
            && self.length > 0
            && self.length <= BLOCK_SIZE
            && self
                .offset
                .checked_add(self.length)
                .is_some_and(|end| end <= piece_length)
            // Only the last block of the piece may be short.
            && (self.length == BLOCK_SIZE || self.offset + self.length == piece_length)
    }
}

/// An immutable view of one block's bytes as produced by a storage read.
/// Cloning is cheap; the cache and any number of fetch subscribers may
/// hold the same source.
#[derive(Debug, Clone)]
pub struct BlockSource {
    pub info: BlockInfo,
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_full_block() {
        let info = BlockInfo::new(0, BLOCK_SIZE, BLOCK_SIZE);
        assert!(info.is_valid(4 * BLOCK_SIZE));
        assert_eq!(info.index_in_piece(), 1);
    }

    #[test]
    fn test_short_block_only_at_piece_end() {
        let piece_length = 2 * BLOCK_SIZE + 100;
        assert!(BlockInfo::new(0, 2 * BLOCK_SIZE, 100).is_valid(piece_length));
        assert!(!BlockInfo::new(0, 0, 100).is_valid(piece_length));
    }

    #[test]
    fn test_rejects_unaligned_and_oversized() {
        assert!(!BlockInfo::new(0, 1, BLOCK_SIZE).is_valid(4 * BLOCK_SIZE));
        assert!(!BlockInfo::new(0, 0, BLOCK_SIZE + 1).is_valid(4 * BLOCK_SIZE));
        assert!(!BlockInfo::new(0, 4 * BLOCK_SIZE, BLOCK_SIZE).is_valid(4 * BLOCK_SIZE));
        assert!(!BlockInfo::new(0, 0, 0).is_valid(4 * BLOCK_SIZE));
    }
}
