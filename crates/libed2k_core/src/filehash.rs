use md4w::{IMd4, Md4};

use crate::constants::PIECE_SIZE;
use crate::hash_id::Md4Hash;

/// Result of hashing a full file: the per-piece digests and the file
/// identifier composed from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHashes {
    pub file_hash: Md4Hash,
    pub pieces: Vec<Md4Hash>,
}

/// MD4 of one piece worth of bytes.
pub fn piece_digest(data: &[u8]) -> Md4Hash {
    Md4Hash::new(md4w::md4_digest(data))
}

/// Compose a file identifier from its piece digests: a single digest IS the
/// identifier, more than one get concatenated and hashed again.
pub fn root_hash(pieces: &[Md4Hash]) -> Option<Md4Hash> {
    match pieces {
        [] => None,
        [single] => Some(*single),
        many => {
            let mut h = Md4::new();
            for p in many {
                h.update(&p.0);
            }
            Some(Md4Hash::new(h.finish()))
        }
    }
}

/// Streaming ed2k file hasher. Feed bytes in any increments; `finish`
/// partitions them into pieces, appending the terminal zero-length digest
/// when the length is an exact multiple of the piece size.
pub struct FileHasher {
    piece: Md4,
    piece_fill: u64,
    piece_size: u64,
    pieces: Vec<Md4Hash>,
    total: u64,
}

impl Default for FileHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl FileHasher {
    pub fn new() -> Self {
        Self::with_piece_size(PIECE_SIZE)
    }

    pub fn with_piece_size(piece_size: u64) -> Self {
        assert!(piece_size > 0);
        Self {
            piece: Md4::new(),
            piece_fill: 0,
            piece_size,
            pieces: Vec::new(),
            total: 0,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = (self.piece_size - self.piece_fill).min(data.len() as u64) as usize;
            self.piece.update(&data[..room]);
            self.piece_fill += room as u64;
            self.total += room as u64;
            data = &data[room..];
            if self.piece_fill == self.piece_size {
                let digest = std::mem::replace(&mut self.piece, Md4::new()).finish();
                self.pieces.push(Md4Hash::new(digest));
                self.piece_fill = 0;
            }
        }
    }

    pub fn finish(mut self) -> FileHashes {
        if self.piece_fill > 0 {
            self.pieces.push(Md4Hash::new(self.piece.finish()));
        } else {
            // Exact multiple of the piece size (or the empty file): the
            // hash set ends with the digest of the empty input.
            self.pieces.push(Md4Hash::TERMINAL);
        }
        let file_hash = root_hash(&self.pieces).expect("at least one piece digest");
        FileHashes {
            file_hash,
            pieces: self.pieces,
        }
    }
}

/// One-shot hash of an in-memory buffer.
pub fn hash_buffer(data: &[u8]) -> FileHashes {
    let mut h = FileHasher::new();
    h.update(data);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lengths::Lengths;

    #[test]
    fn test_empty_file() {
        let hashes = hash_buffer(b"");
        assert_eq!(hashes.file_hash, Md4Hash::TERMINAL);
        assert_eq!(hashes.pieces, vec![Md4Hash::TERMINAL]);
        assert_eq!(
            hashes.file_hash.as_string(),
            "31D6CFE0D16AE931B73C59D7E0C089C0"
        );
    }

    #[test]
    fn test_single_piece_file_is_plain_digest() {
        let data = vec![b'X'; 100];
        let hashes = hash_buffer(&data);
        assert_eq!(hashes.pieces.len(), 1);
        assert_eq!(hashes.file_hash, piece_digest(&data));
    }

    #[test]
    fn test_two_piece_file_composes() {
        let data = vec![b'X'; PIECE_SIZE as usize + 1];
        let hashes = hash_buffer(&data);
        assert_eq!(hashes.pieces.len(), 2);
        assert_eq!(hashes.pieces[0], piece_digest(&data[..PIECE_SIZE as usize]));
        assert_eq!(hashes.pieces[1], piece_digest(&data[PIECE_SIZE as usize..]));
        assert_eq!(hashes.file_hash, root_hash(&hashes.pieces).unwrap());
        assert_ne!(hashes.file_hash, hashes.pieces[0]);
    }

    #[test]
    fn test_exact_multiple_appends_terminal() {
        let data = vec![0u8; PIECE_SIZE as usize];
        let hashes = hash_buffer(&data);
        assert_eq!(hashes.pieces.len(), 2);
        assert_eq!(hashes.pieces[1], Md4Hash::TERMINAL);
        assert_eq!(hashes.file_hash, root_hash(&hashes.pieces).unwrap());

        let data = vec![0u8; 2 * PIECE_SIZE as usize];
        let hashes = hash_buffer(&data);
        assert_eq!(hashes.pieces.len(), 3);
        assert_eq!(hashes.pieces[0], hashes.pieces[1]);
        assert_eq!(hashes.pieces[2], Md4Hash::TERMINAL);
    }

    #[test]
    fn test_digest_count_matches_geometry() {
        use crate::constants::BLOCK_SIZE;
        for size in [
            1u64,
            BLOCK_SIZE as u64 - 1,
            BLOCK_SIZE as u64,
            BLOCK_SIZE as u64 + 1,
            PIECE_SIZE - 1,
            PIECE_SIZE,
            PIECE_SIZE + 1,
            2 * PIECE_SIZE,
        ] {
            let hashes = hash_buffer(&vec![b'X'; size as usize]);
            let lengths = Lengths::new(size).unwrap();
            assert_eq!(hashes.pieces.len(), lengths.hashset_size(), "size {size}");
        }
    }

    #[test]
    fn test_streaming_equals_oneshot() {
        // Small piece size keeps the test cheap while still crossing many
        // piece boundaries mid-chunk.
        let data: Vec<u8> = (0..10_007u32).map(|i| (i % 251) as u8).collect();
        let mut streamed = FileHasher::with_piece_size(1000);
        for chunk in data.chunks(97) {
            streamed.update(chunk);
        }
        let mut oneshot = FileHasher::with_piece_size(1000);
        oneshot.update(&data);
        assert_eq!(streamed.finish(), oneshot.finish());
    }

    #[test]
    fn test_small_geometry_terminal_rule() {
        let mut h = FileHasher::with_piece_size(10);
        h.update(&[7u8; 20]);
        let hashes = h.finish();
        assert_eq!(hashes.pieces.len(), 3);
        assert_eq!(hashes.pieces[2], Md4Hash::TERMINAL);

        let mut h = FileHasher::with_piece_size(10);
        h.update(&[7u8; 25]);
        let hashes = h.finish();
        assert_eq!(hashes.pieces.len(), 3);
        assert_ne!(hashes.pieces[2], hashes.pieces[0]);
    }
}
