// A transfer drives one file to completion: it owns the piece picker, the
// peer policy and the hash set, and moves through
// checking -> downloading -> finished -> seeding, with paused and aborted
// reachable from anywhere.

pub mod live;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use libed2k_core::ed2k_link::Ed2kLink;
use libed2k_core::filehash::root_hash;
use libed2k_core::hash_id::Md4Hash;
use libed2k_core::lengths::Lengths;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, warn};

use crate::alerts::Alert;
use crate::disk::TransferStorage;
use crate::session::Session;
use crate::spawn_utils::spawn_with_cancel;
use crate::type_aliases::BF;
use crate::{Error, Result};

use live::TransferLive;

/// Everything needed to add a transfer to a session.
#[derive(Debug, Clone)]
pub struct AddTransferParams {
    pub file_hash: Md4Hash,
    pub file_path: PathBuf,
    pub file_size: u64,
    /// Known piece hashes, e.g. from a previous session or a .met source.
    pub piece_hashes: Option<Vec<Md4Hash>>,
    pub resume: Option<ResumeData>,
    /// The local file is a complete copy to be shared, not downloaded.
    pub seed_mode: bool,
    /// Request pieces in order instead of rarest-first.
    pub sequential: bool,
}

impl AddTransferParams {
    pub fn new(file_hash: Md4Hash, file_path: impl Into<PathBuf>, file_size: u64) -> Self {
        Self {
            file_hash,
            file_path: file_path.into(),
            file_size,
            piece_hashes: None,
            resume: None,
            seed_mode: false,
            sequential: false,
        }
    }

    pub fn from_link(link: &Ed2kLink, save_dir: impl AsRef<Path>) -> Self {
        Self::new(link.hash, save_dir.as_ref().join(&link.name), link.size)
    }
}

/// The fields of on-disk resume data the engine consumes. How they are
/// encoded on disk is the embedder's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeData {
    pub file_hash: Md4Hash,
    pub file_size: u64,
    /// Have-bitfield, one bit per piece, most significant bit first.
    pub pieces: Vec<u8>,
    pub piece_hashes: Vec<Md4Hash>,
    /// Piece indices to re-verify against disk on load.
    pub verified: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Checking,
    Downloading,
    Finished,
    Seeding,
    Paused,
    Aborted,
}

#[derive(Default)]
pub struct TransferStats {
    pub downloaded_bytes: AtomicU64,
    pub uploaded_bytes: AtomicU64,
    pub failed_hash_bytes: AtomicU64,
}

/// State shared by every stage of a transfer's life.
pub(crate) struct TransferShared {
    pub file_hash: Md4Hash,
    pub file_size: u64,
    pub file_name: RwLock<String>,
    pub lengths: Lengths,
    pub storage: Arc<TransferStorage>,
    pub session: Weak<Session>,
    pub cancel: CancellationToken,
    pub span: tracing::Span,
    pub sequential: bool,
    pub stats: TransferStats,
    /// Piece digests, including the terminal one for exact-multiple files.
    hash_set: RwLock<Option<Vec<Md4Hash>>>,
}

impl TransferShared {
    pub fn session(&self) -> Result<Arc<Session>> {
        self.session.upgrade().ok_or(Error::SessionClosing)
    }

    pub fn hash_set(&self) -> Option<Vec<Md4Hash>> {
        self.hash_set.read().clone()
    }

    /// Strictly shorter than one piece: the hash set IS the file hash. A
    /// file of exactly one piece still carries the terminal digest.
    fn is_single_digest(&self) -> bool {
        self.lengths.total_pieces() == 1 && !self.lengths.is_exact_piece_multiple()
    }

    pub fn has_hash_set(&self) -> bool {
        self.is_single_digest() || self.hash_set.read().is_some()
    }

    /// Accept a hash set only if it has the right cardinality and composes
    /// back to the file identifier.
    pub fn set_hash_set(&self, pieces: Vec<Md4Hash>) -> Result<()> {
        if pieces.len() != self.lengths.hashset_size() {
            return Err(Error::MismatchingHash);
        }
        if root_hash(&pieces) != Some(self.file_hash) {
            return Err(Error::MismatchingHash);
        }
        *self.hash_set.write() = Some(pieces);
        Ok(())
    }

    /// Expected digest for one piece.
    pub fn piece_hash(&self, piece: u32) -> Option<Md4Hash> {
        if self.is_single_digest() {
            return Some(self.file_hash);
        }
        self.hash_set
            .read()
            .as_ref()
            .and_then(|h| h.get(piece as usize).copied())
    }
}

pub(crate) enum TransferStateMachine {
    Checking,
    Live(Arc<TransferLive>),
    Aborted,
}

pub(crate) struct ManagedTransferLocked {
    pub state: TransferStateMachine,
    pub paused: bool,
}

pub struct ManagedTransfer {
    pub(crate) shared: Arc<TransferShared>,
    pub(crate) locked: RwLock<ManagedTransferLocked>,
}

impl ManagedTransfer {
    pub(crate) fn new(params: AddTransferParams, session: &Arc<Session>) -> Result<Arc<Self>> {
        let lengths = Lengths::new(params.file_size).map_err(Error::Anyhow)?;
        if let Some(resume) = &params.resume {
            if resume.file_hash != params.file_hash || resume.file_size != params.file_size {
                return Err(Error::InvalidResumeData);
            }
        }
        let had_existing_data = params.file_path.exists();
        let storage = Arc::new(TransferStorage::open(&params.file_path, params.file_size)?);
        let span = debug_span!("transfer", hash = %params.file_hash);
        let file_name = params
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let shared = Arc::new(TransferShared {
            file_hash: params.file_hash,
            file_size: params.file_size,
            file_name: RwLock::new(file_name),
            lengths,
            storage,
            session: Arc::downgrade(session),
            cancel: session.cancel_token().child_token(),
            span,
            sequential: params.sequential,
            stats: TransferStats::default(),
            hash_set: RwLock::new(None),
        });

        if let Some(pieces) = params
            .piece_hashes
            .clone()
            .or_else(|| params.resume.as_ref().map(|r| r.piece_hashes.clone()))
        {
            if !pieces.is_empty() {
                shared.set_hash_set(pieces)?;
            }
        }

        let transfer = Arc::new(Self {
            shared,
            locked: RwLock::new(ManagedTransferLocked {
                state: TransferStateMachine::Checking,
                paused: false,
            }),
        });
        transfer.clone().start(params, had_existing_data);
        Ok(transfer)
    }

    pub fn file_hash(&self) -> Md4Hash {
        self.shared.file_hash
    }

    /// Move through checking into the live state on a background task.
    fn start(self: Arc<Self>, params: AddTransferParams, had_existing_data: bool) {
        let span = self.shared.span.clone();
        let cancel = self.shared.cancel.clone();
        let _ = spawn_with_cancel(span, cancel, async move {
            let have = match self.clone().run_checking(&params, had_existing_data).await {
                Ok(have) => have,
                Err(e) => {
                    // Storage errors pause the transfer, never silently.
                    warn!("error checking transfer: {e:#}");
                    if let Ok(session) = self.shared.session() {
                        session.alerts.post(Alert::TransferError {
                            hash: self.shared.file_hash,
                            error: format!("{e:#}"),
                        });
                    }
                    self.locked.write().paused = true;
                    BF::repeat(false, self.shared.lengths.total_pieces() as usize)
                }
            };
            self.to_live(have)
        });
    }

    /// Build the initial have-bitfield: verify resume samples, a
    /// pre-existing file in full, or hash a seeded file from scratch.
    async fn run_checking(
        self: Arc<Self>,
        params: &AddTransferParams,
        had_existing_data: bool,
    ) -> Result<BF> {
        let lengths = self.shared.lengths;
        let total = lengths.total_pieces() as usize;
        let mut have = BF::repeat(false, total);

        if let Some(resume) = &params.resume {
            if resume.pieces.len() < lengths.piece_bitfield_bytes() {
                return Err(Error::MissingPieces);
            }
            have = BF::from_vec(resume.pieces.clone());
            have.truncate(total);
            for piece in &resume.verified {
                let index = match lengths.validate_piece_index(*piece) {
                    Some(i) => i,
                    None => return Err(Error::InvalidResumeData),
                };
                if !have[*piece as usize] {
                    continue;
                }
                if !self.verify_piece_on_disk(*piece).await? {
                    debug!(piece, "resume sample failed verification");
                    have.set(*piece as usize, false);
                }
            }
            return Ok(have);
        }

        if !had_existing_data && !params.seed_mode {
            return Ok(have);
        }

        // Full check: every piece whose digest matches is ours. Seed mode
        // with no known hash set also derives the hash set here (initial
        // hashing).
        if !self.shared.has_hash_set() && params.seed_mode {
            let mut pieces = Vec::with_capacity(lengths.hashset_size());
            for info in lengths.iter_piece_infos() {
                let digest = self.disk_piece_digest(info.piece_index.get()).await?;
                pieces.push(digest);
            }
            if lengths.is_exact_piece_multiple() {
                pieces.push(Md4Hash::TERMINAL);
            }
            if pieces.len() > 1 {
                self.shared.set_hash_set(pieces)?;
            }
        }

        if !self.shared.has_hash_set() {
            // Nothing to verify against; the hash set comes from peers.
            return Ok(have);
        }

        for piece in 0..total as u32 {
            if self.verify_piece_on_disk(piece).await? {
                have.set(piece as usize, true);
            } else if params.seed_mode {
                return Err(Error::MismatchingHash);
            }
        }
        Ok(have)
    }

    async fn disk_piece_digest(&self, piece: u32) -> Result<Md4Hash> {
        let storage = self.shared.storage.clone();
        let lengths = self.shared.lengths;
        let index = lengths
            .validate_piece_index(piece)
            .ok_or(Error::InvalidResumeData)?;
        tokio::task::spawn_blocking(move || storage.piece_digest(&lengths, index))
            .await
            .map_err(|e| Error::Anyhow(e.into()))?
    }

    async fn verify_piece_on_disk(&self, piece: u32) -> Result<bool> {
        let expected = match self.shared.piece_hash(piece) {
            Some(h) => h,
            None => return Ok(false),
        };
        Ok(self.disk_piece_digest(piece).await? == expected)
    }

    fn to_live(self: &Arc<Self>, have: BF) -> Result<()> {
        let mut locked = self.locked.write();
        match locked.state {
            TransferStateMachine::Checking => {}
            // Aborted while checking; stay down.
            _ => return Ok(()),
        }
        let live = TransferLive::new(self.shared.clone(), have, locked.paused)?;
        locked.state = TransferStateMachine::Live(live);
        Ok(())
    }

    pub(crate) fn live(&self) -> Option<Arc<TransferLive>> {
        match &self.locked.read().state {
            TransferStateMachine::Live(live) => Some(live.clone()),
            _ => None,
        }
    }

    pub fn status(&self) -> TransferStatus {
        let locked = self.locked.read();
        match &locked.state {
            TransferStateMachine::Aborted => TransferStatus::Aborted,
            _ if locked.paused => TransferStatus::Paused,
            TransferStateMachine::Checking => TransferStatus::Checking,
            TransferStateMachine::Live(live) => live.status(),
        }
    }

    /// Suspend outgoing requests; sockets stay up for incoming traffic.
    pub fn pause(&self) -> Result<()> {
        let mut locked = self.locked.write();
        if matches!(locked.state, TransferStateMachine::Aborted) {
            return Err(Error::TransferAborted);
        }
        if locked.paused {
            return Err(Error::TransferPaused);
        }
        locked.paused = true;
        if let TransferStateMachine::Live(live) = &locked.state {
            live.set_paused(true);
        }
        if let Ok(session) = self.shared.session() {
            session.alerts.post(Alert::TransferPaused {
                hash: self.shared.file_hash,
            });
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut locked = self.locked.write();
        if matches!(locked.state, TransferStateMachine::Aborted) {
            return Err(Error::TransferAborted);
        }
        locked.paused = false;
        if let TransferStateMachine::Live(live) = &locked.state {
            live.set_paused(false);
        }
        Ok(())
    }

    /// Terminal: close all peers, stop tasks, close the file.
    pub fn abort(&self) {
        self.abort_inner(false);
    }

    /// Abort because the transfer is being removed from the session; peers
    /// are disconnected with the removal reason.
    pub(crate) fn abort_removed(&self) {
        self.abort_inner(true);
    }

    fn abort_inner(&self, removed: bool) {
        let mut locked = self.locked.write();
        if matches!(locked.state, TransferStateMachine::Aborted) {
            return;
        }
        if let TransferStateMachine::Live(live) = &locked.state {
            live.shutdown(removed);
        }
        locked.state = TransferStateMachine::Aborted;
        drop(locked);
        self.shared.cancel.cancel();
        if let Err(e) = self.shared.storage.sync() {
            debug!("error syncing storage on abort: {e:#}");
        }
        self.shared.storage.close();
    }

    /// Resume data reflecting current progress.
    pub fn resume_data(&self) -> ResumeData {
        let (pieces, verified) = match self.live() {
            Some(live) => live.resume_bitfield(),
            None => (
                vec![0u8; self.shared.lengths.piece_bitfield_bytes()],
                Vec::new(),
            ),
        };
        ResumeData {
            file_hash: self.shared.file_hash,
            file_size: self.shared.file_size,
            pieces,
            verified,
            piece_hashes: self.shared.hash_set().unwrap_or_default(),
        }
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.shared.stats.downloaded_bytes.load(Ordering::Relaxed),
            self.shared.stats.uploaded_bytes.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libed2k_core::constants::PIECE_SIZE;
    use libed2k_core::filehash::piece_digest;

    fn make_shared(dir: &tempfile::TempDir, file_hash: Md4Hash, size: u64) -> TransferShared {
        TransferShared {
            file_hash,
            file_size: size,
            file_name: RwLock::new("x.bin".to_owned()),
            lengths: Lengths::new(size).unwrap(),
            storage: Arc::new(TransferStorage::open(dir.path().join("x.bin"), size).unwrap()),
            session: Weak::new(),
            cancel: CancellationToken::new(),
            span: debug_span!("test"),
            sequential: false,
            stats: TransferStats::default(),
            hash_set: RwLock::new(None),
        }
    }

    #[test]
    fn test_short_file_needs_no_hash_set() {
        let dir = tempfile::tempdir().unwrap();
        let file_hash = piece_digest(b"whatever");
        let shared = make_shared(&dir, file_hash, 100);
        assert!(shared.has_hash_set());
        assert_eq!(shared.piece_hash(0), Some(file_hash));
    }

    #[test]
    fn test_exact_piece_file_requires_terminal_digest() {
        let dir = tempfile::tempdir().unwrap();
        let h0 = piece_digest(b"piece zero stand-in");
        let with_terminal = vec![h0, Md4Hash::TERMINAL];
        let file_hash = root_hash(&with_terminal).unwrap();
        let shared = make_shared(&dir, file_hash, PIECE_SIZE);

        // One piece on the wire, but the hash set still has two entries.
        assert!(!shared.has_hash_set());
        assert!(shared.set_hash_set(vec![h0]).is_err());
        shared.set_hash_set(with_terminal).unwrap();
        assert_eq!(shared.piece_hash(0), Some(h0));
    }

    #[test]
    fn test_hash_set_must_compose_to_file_hash() {
        let dir = tempfile::tempdir().unwrap();
        let h0 = piece_digest(b"a");
        let h1 = piece_digest(b"b");
        let file_hash = root_hash(&[h0, h1]).unwrap();
        let shared = make_shared(&dir, file_hash, PIECE_SIZE + 1);
        assert!(matches!(
            shared.set_hash_set(vec![h1, h0]),
            Err(Error::MismatchingHash)
        ));
        shared.set_hash_set(vec![h0, h1]).unwrap();
        assert_eq!(shared.piece_hash(1), Some(h1));
    }
}

