use anyhow::Context;

use crate::constants::{BLOCK_SIZE, PIECE_SIZE};

/// Ceiling division. Block-to-piece arithmetic uses this everywhere; the
/// file tail is where the off-by-ones live, so it is pinned by tests.
pub fn div_ceil(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

/// Length of the last element when `total` is split into units of `unit`.
pub fn tail_size(total: u64, unit: u64) -> u64 {
    let rem = total % unit;
    if rem == 0 {
        return unit;
    }
    rem
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceInfo {
    pub piece_index: ValidPieceIndex,
    pub len: u32,
}

/// One wire-request unit: a block within a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub piece_index: ValidPieceIndex,

    // Index of the block within the piece.
    pub block_index: u32,

    // Absolute block index if the first block of the first piece was 0.
    pub absolute_index: u32,
    pub size: u32,

    // Offset of the block in bytes within the piece.
    pub offset: u32,
}

/// A piece index that was validated against a [`Lengths`] instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidPieceIndex(u32);

impl std::fmt::Display for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl ValidPieceIndex {
    pub const fn get(&self) -> u32 {
        self.0
    }
}

/// Piece/block geometry of one file. The nominal piece size is the ed2k
/// constant; the block size is a parameter because the engine uses 180 KiB
/// blocks on the wire and 16 KiB blocks against disk.
#[derive(Debug, Clone, Copy)]
pub struct Lengths {
    total_length: u64,
    piece_size: u32,
    block_size: u32,
    last_piece_id: u32,
    last_piece_length: u32,
    blocks_per_piece: u32,
}

impl Lengths {
    pub fn new(total_length: u64) -> anyhow::Result<Self> {
        Self::with_geometry(total_length, PIECE_SIZE as u32, BLOCK_SIZE)
    }

    pub fn with_geometry(
        total_length: u64,
        piece_size: u32,
        block_size: u32,
    ) -> anyhow::Result<Self> {
        if total_length == 0 {
            anyhow::bail!("file with 0 length cannot be transferred");
        }
        if block_size == 0 || block_size > piece_size {
            anyhow::bail!("invalid block size {block_size} for piece size {piece_size}");
        }
        let total_pieces = div_ceil(total_length, piece_size as u64);
        let total_pieces =
            u32::try_from(total_pieces).context("file too large for piece arithmetic")?;
        Ok(Self {
            total_length,
            piece_size,
            block_size,
            last_piece_id: total_pieces - 1,
            last_piece_length: tail_size(total_length, piece_size as u64) as u32,
            blocks_per_piece: (piece_size as u64).div_ceil(block_size as u64) as u32,
        })
    }

    pub const fn total_length(&self) -> u64 {
        self.total_length
    }
    pub const fn default_piece_length(&self) -> u32 {
        self.piece_size
    }
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }
    pub const fn default_blocks_per_piece(&self) -> u32 {
        self.blocks_per_piece
    }
    pub const fn total_pieces(&self) -> u32 {
        self.last_piece_id + 1
    }
    pub const fn last_piece_id(&self) -> ValidPieceIndex {
        ValidPieceIndex(self.last_piece_id)
    }

    // How many bytes are required to store a bitfield with one bit per piece.
    pub const fn piece_bitfield_bytes(&self) -> usize {
        (self.total_pieces() as usize + 7) / 8
    }

    pub const fn validate_piece_index(&self, index: u32) -> Option<ValidPieceIndex> {
        if index > self.last_piece_id {
            return None;
        }
        Some(ValidPieceIndex(index))
    }

    pub fn try_validate_piece_index(&self, index: u32) -> anyhow::Result<ValidPieceIndex> {
        self.validate_piece_index(index)
            .with_context(|| format!("invalid piece index {index}"))
    }

    pub const fn piece_length(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return self.last_piece_length;
        }
        self.piece_size
    }

    pub const fn piece_offset(&self, index: ValidPieceIndex) -> u64 {
        index.0 as u64 * self.piece_size as u64
    }

    pub const fn blocks_per_piece(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return self.last_piece_length.div_ceil(self.block_size);
        }
        self.blocks_per_piece
    }

    pub const fn total_blocks(&self) -> u32 {
        self.last_piece_id * self.blocks_per_piece + self.blocks_per_piece(self.last_piece_id())
    }

    pub fn block_size_at(&self, piece_index: ValidPieceIndex, block_index: u32) -> Option<u32> {
        let piece_length = self.piece_length(piece_index);
        let last_block_id = piece_length.div_ceil(self.block_size) - 1;
        if block_index < last_block_id {
            return Some(self.block_size);
        }
        if block_index == last_block_id {
            return Some(tail_size(piece_length as u64, self.block_size as u64) as u32);
        }
        None
    }

    pub const fn block_offset_in_piece(
        &self,
        piece_index: ValidPieceIndex,
        block_index: u32,
    ) -> Option<u32> {
        if block_index >= self.blocks_per_piece(piece_index) {
            return None;
        }
        Some(block_index * self.block_size)
    }

    pub const fn block_absolute_offset(&self, block: &BlockInfo) -> u64 {
        self.piece_offset(block.piece_index) + block.offset as u64
    }

    /// Absolute byte range of one block, `[begin, end)`, as carried by the
    /// 64-bit request-parts message.
    pub fn block_range(&self, block: &BlockInfo) -> std::ops::Range<u64> {
        let begin = self.block_absolute_offset(block);
        begin..begin + block.size as u64
    }

    pub fn block_info(&self, piece_index: ValidPieceIndex, block_index: u32) -> Option<BlockInfo> {
        let size = self.block_size_at(piece_index, block_index)?;
        let offset = self.block_offset_in_piece(piece_index, block_index)?;
        Some(BlockInfo {
            piece_index,
            block_index,
            absolute_index: piece_index.get() * self.blocks_per_piece + block_index,
            size,
            offset,
        })
    }

    /// Validate an incoming part against the expected geometry. Returns None
    /// for a part that does not start on a block boundary or has the wrong
    /// length.
    pub fn block_info_from_received_data(
        &self,
        piece_index: ValidPieceIndex,
        begin: u32,
        len: u32,
    ) -> Option<BlockInfo> {
        let block_index = begin / self.block_size;
        let info = self.block_info(piece_index, block_index)?;
        if info.offset != begin || info.size != len {
            return None;
        }
        Some(info)
    }

    pub fn iter_piece_infos(&self) -> impl Iterator<Item = PieceInfo> + '_ {
        (0..self.total_pieces()).map(move |idx| PieceInfo {
            piece_index: ValidPieceIndex(idx),
            len: self.piece_length(ValidPieceIndex(idx)),
        })
    }

    pub fn iter_block_infos(
        &self,
        index: ValidPieceIndex,
    ) -> impl Iterator<Item = BlockInfo> + '_ {
        let blocks = self.blocks_per_piece(index);
        (0..blocks).map(move |b| self.block_info(index, b).unwrap())
    }

    /// True when the file length is an exact multiple of the piece size, in
    /// which case the hash set carries a trailing zero-length piece digest.
    pub const fn is_exact_piece_multiple(&self) -> bool {
        self.total_length % self.piece_size as u64 == 0
    }

    /// Number of piece digests in the file's hash set, including the
    /// terminal hash when one applies.
    pub const fn hashset_size(&self) -> usize {
        if self.is_exact_piece_multiple() {
            self.total_pieces() as usize + 1
        } else {
            self.total_pieces() as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_div_ceil() {
        assert_eq!(div_ceil(0, 7), 0);
        assert_eq!(div_ceil(10, 3), 4);
        assert_eq!(div_ceil(13, 2), 7);
        assert_eq!(div_ceil(PIECE_SIZE, PIECE_SIZE), 1);
        assert_eq!(div_ceil(PIECE_SIZE + 1, PIECE_SIZE), 2);
    }

    #[test]
    fn test_single_short_piece() {
        let l = Lengths::new(100).unwrap();
        assert_eq!(l.total_pieces(), 1);
        assert_eq!(l.piece_length(l.last_piece_id()), 100);
        assert_eq!(l.blocks_per_piece(l.last_piece_id()), 1);
        assert_eq!(l.block_size_at(l.last_piece_id(), 0), Some(100));
        assert_eq!(l.block_size_at(l.last_piece_id(), 1), None);
        assert_eq!(l.hashset_size(), 1);
    }

    #[test]
    fn test_exact_piece_boundary() {
        let l = Lengths::new(PIECE_SIZE).unwrap();
        assert_eq!(l.total_pieces(), 1);
        assert_eq!(l.piece_length(l.last_piece_id()), PIECE_SIZE as u32);
        assert!(l.is_exact_piece_multiple());
        assert_eq!(l.hashset_size(), 2);

        let l = Lengths::new(4 * PIECE_SIZE).unwrap();
        assert_eq!(l.total_pieces(), 4);
        assert_eq!(l.hashset_size(), 5);
    }

    #[test]
    fn test_one_byte_over_piece() {
        let l = Lengths::new(PIECE_SIZE + 1).unwrap();
        assert_eq!(l.total_pieces(), 2);
        assert_eq!(l.piece_length(l.validate_piece_index(0).unwrap()), PIECE_SIZE as u32);
        assert_eq!(l.piece_length(l.last_piece_id()), 1);
        assert!(!l.is_exact_piece_multiple());
        assert_eq!(l.hashset_size(), 2);
        assert_eq!(l.blocks_per_piece(l.last_piece_id()), 1);
        assert_eq!(l.block_size_at(l.last_piece_id(), 0), Some(1));
    }

    #[test]
    fn test_one_byte_under_piece() {
        let l = Lengths::new(PIECE_SIZE - 1).unwrap();
        assert_eq!(l.total_pieces(), 1);
        assert_eq!(l.piece_length(l.last_piece_id()), PIECE_SIZE as u32 - 1);
        assert_eq!(l.hashset_size(), 1);
    }

    #[test]
    fn test_full_piece_block_geometry() {
        let l = Lengths::new(2 * PIECE_SIZE).unwrap();
        let p0 = l.validate_piece_index(0).unwrap();
        assert_eq!(l.blocks_per_piece(p0), 53);
        assert_eq!(l.block_size_at(p0, 0), Some(BLOCK_SIZE));
        assert_eq!(l.block_size_at(p0, 51), Some(BLOCK_SIZE));
        // Piece tail block: 9,728,000 - 52 * 184,320.
        assert_eq!(l.block_size_at(p0, 52), Some(143_360));
        assert_eq!(l.block_size_at(p0, 53), None);
        assert_eq!(l.total_blocks(), 106);
    }

    #[test]
    fn test_file_tail_block_geometry() {
        let l = Lengths::new(PIECE_SIZE + BLOCK_SIZE as u64 + 1).unwrap();
        let last = l.last_piece_id();
        assert_eq!(l.piece_length(last), BLOCK_SIZE + 1);
        assert_eq!(l.blocks_per_piece(last), 2);
        assert_eq!(l.block_size_at(last, 0), Some(BLOCK_SIZE));
        assert_eq!(l.block_size_at(last, 1), Some(1));
        assert_eq!(l.block_size_at(last, 2), None);
    }

    #[test]
    fn test_block_info_validation() {
        let l = Lengths::new(PIECE_SIZE + 5000).unwrap();
        let p0 = l.validate_piece_index(0).unwrap();
        let ok = l
            .block_info_from_received_data(p0, BLOCK_SIZE, BLOCK_SIZE)
            .unwrap();
        assert_eq!(ok.block_index, 1);
        assert_eq!(ok.absolute_index, 1);
        // Not on a block boundary.
        assert!(l.block_info_from_received_data(p0, BLOCK_SIZE + 1, BLOCK_SIZE).is_none());
        // Wrong length.
        assert!(l.block_info_from_received_data(p0, 0, 100).is_none());
        // Tail piece block is short.
        let p1 = l.last_piece_id();
        let tail = l.block_info_from_received_data(p1, 0, 5000).unwrap();
        assert_eq!(tail.size, 5000);
    }

    #[test]
    fn test_block_range_is_absolute() {
        let l = Lengths::new(3 * PIECE_SIZE).unwrap();
        let p1 = l.validate_piece_index(1).unwrap();
        let b = l.block_info(p1, 2).unwrap();
        let r = l.block_range(&b);
        assert_eq!(r.start, PIECE_SIZE + 2 * BLOCK_SIZE as u64);
        assert_eq!(r.end - r.start, BLOCK_SIZE as u64);
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(Lengths::new(0).is_err());
    }

    #[test]
    fn test_disk_geometry() {
        use crate::constants::DISK_BLOCK_SIZE;
        let l = Lengths::with_geometry(PIECE_SIZE, PIECE_SIZE as u32, DISK_BLOCK_SIZE).unwrap();
        assert_eq!(l.default_blocks_per_piece(), 594);
        let p0 = l.validate_piece_index(0).unwrap();
        // 9,728,000 = 593 * 16,384 + 12,288.
        assert_eq!(l.block_size_at(p0, 592), Some(DISK_BLOCK_SIZE));
        assert_eq!(l.block_size_at(p0, 593), Some(12_288));
        assert_eq!(l.block_size_at(p0, 594), None);
    }
}
