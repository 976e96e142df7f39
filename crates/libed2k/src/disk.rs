// Single-file storage for a transfer. Blocking positional reads and writes,
// called from the disk paths via spawn_blocking; the file handle is
// serialised behind a mutex.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use libed2k_core::constants::DISK_BLOCK_SIZE;
use libed2k_core::hash_id::Md4Hash;
use libed2k_core::lengths::{Lengths, ValidPieceIndex};
use md4w::{IMd4, Md4};
use parking_lot::Mutex;
use tracing::debug;

use crate::{Error, Result};

pub struct TransferStorage {
    path: PathBuf,
    file: Mutex<Option<File>>,
    file_size: u64,
}

fn closed_err() -> Error {
    Error::FileUnavailable(io::Error::new(io::ErrorKind::NotFound, "storage closed"))
}

impl TransferStorage {
    /// Open (or create) the backing file. Existing shorter content is kept
    /// for checking; a longer file at the same path is someone else's.
    pub fn open(path: impl Into<PathBuf>, file_size: u64) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(Error::FileUnavailable)?;
        let current_len = file.metadata().map_err(Error::FileUnavailable)?.len();
        if current_len > file_size {
            return Err(Error::FileCollision(path));
        }
        if current_len < file_size {
            file.set_len(file_size).map_err(Error::FileUnavailable)?;
        }
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
            file_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn write_block(&self, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > self.file_size {
            return Err(Error::FileTooShort);
        }
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or_else(closed_err)?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data))
            .map_err(Error::FileUnavailable)
    }

    pub fn read_block(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.file_size {
            return Err(Error::FileTooShort);
        }
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or_else(closed_err)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(Error::FileUnavailable)?;
        file.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::FileTooShort
            } else {
                Error::FileUnavailable(e)
            }
        })
    }

    /// MD4 of the piece's on-disk bytes, read in disk-block sized chunks.
    pub fn piece_digest(&self, lengths: &Lengths, piece: ValidPieceIndex) -> Result<Md4Hash> {
        let mut remaining = lengths.piece_length(piece) as u64;
        let mut offset = lengths.piece_offset(piece);
        let mut hasher = Md4::new();
        let mut buf = vec![0u8; DISK_BLOCK_SIZE as usize];
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            self.read_block(offset, &mut buf[..n])?;
            hasher.update(&buf[..n]);
            offset += n as u64;
            remaining -= n as u64;
        }
        Ok(Md4Hash::new(hasher.finish()))
    }

    pub fn sync(&self) -> Result<()> {
        let guard = self.file.lock();
        match guard.as_ref() {
            Some(file) => file.sync_data().map_err(Error::FileUnavailable),
            None => Ok(()),
        }
    }

    pub fn close(&self) {
        *self.file.lock() = None;
    }

    pub fn delete(&self) -> Result<()> {
        self.close();
        debug!(path = %self.path.display(), "deleting transfer file");
        std::fs::remove_file(&self.path).map_err(Error::FileUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libed2k_core::filehash::piece_digest;

    fn temp_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = TransferStorage::open(temp_path(&dir, "a.bin"), 64).unwrap();
        storage.write_block(10, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        storage.read_block(10, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_bounds_checked() {
        let dir = tempfile::tempdir().unwrap();
        let storage = TransferStorage::open(temp_path(&dir, "a.bin"), 16).unwrap();
        assert!(matches!(
            storage.write_block(10, &[0u8; 10]),
            Err(Error::FileTooShort)
        ));
        let mut buf = [0u8; 20];
        assert!(matches!(
            storage.read_block(0, &mut buf),
            Err(Error::FileTooShort)
        ));
    }

    #[test]
    fn test_piece_digest_matches_buffer_hash() {
        let dir = tempfile::tempdir().unwrap();
        // Two pieces of 1000 bytes (second one short).
        let data: Vec<u8> = (0..1500u32).map(|i| (i % 256) as u8).collect();
        let lengths = Lengths::with_geometry(1500, 1000, 100).unwrap();
        let storage = TransferStorage::open(temp_path(&dir, "a.bin"), 1500).unwrap();
        storage.write_block(0, &data).unwrap();

        let p0 = lengths.validate_piece_index(0).unwrap();
        let p1 = lengths.validate_piece_index(1).unwrap();
        assert_eq!(
            storage.piece_digest(&lengths, p0).unwrap(),
            piece_digest(&data[..1000])
        );
        assert_eq!(
            storage.piece_digest(&lengths, p1).unwrap(),
            piece_digest(&data[1000..])
        );
    }

    #[test]
    fn test_longer_existing_file_is_a_collision() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "a.bin");
        std::fs::write(&path, vec![0u8; 100]).unwrap();
        assert!(matches!(
            TransferStorage::open(&path, 50),
            Err(Error::FileCollision(_))
        ));
    }

    #[test]
    fn test_shorter_existing_file_is_kept_and_extended() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "a.bin");
        std::fs::write(&path, [7u8; 10]).unwrap();
        let storage = TransferStorage::open(&path, 100).unwrap();
        let mut buf = [0u8; 10];
        storage.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 10]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);
    }

    #[test]
    fn test_closed_storage_errors() {
        let dir = tempfile::tempdir().unwrap();
        let storage = TransferStorage::open(temp_path(&dir, "a.bin"), 16).unwrap();
        storage.close();
        assert!(matches!(
            storage.write_block(0, &[1]),
            Err(Error::FileUnavailable(_))
        ));
    }
}
