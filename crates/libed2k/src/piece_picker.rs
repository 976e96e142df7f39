// Block-level piece picking. The picker owns the have-bitfield, per-piece
// block states and piece availability, and decides which block each peer
// requests next. Outside endgame a block has at most one requester.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use libed2k_core::lengths::{BlockInfo, Lengths, ValidPieceIndex};
use tracing::{debug, trace};

use crate::type_aliases::{PeerHandle, BF};

#[derive(Debug, Clone, Copy)]
pub struct PickerOptions {
    /// Request pieces in index order instead of rarest-first.
    pub sequential: bool,
    /// Enter endgame once fewer than this many blocks remain unfinished.
    pub endgame_block_threshold: u32,
    /// Rarest-first only pays off past this many pieces; small transfers
    /// are picked in index order.
    pub rarest_first_cutoff: u32,
}

impl Default for PickerOptions {
    fn default() -> Self {
        Self {
            sequential: false,
            endgame_block_threshold: 8,
            rarest_first_cutoff: 4,
        }
    }
}

#[derive(Debug, Clone, Default)]
enum BlockState {
    #[default]
    Open,
    Requested {
        peers: Vec<PeerHandle>,
        since: Instant,
    },
    Writing,
    Finished,
}

#[derive(Debug)]
struct DownloadingPiece {
    blocks: Vec<BlockState>,
    /// Peers whose data went into any block, blamed on hash failure.
    contributors: Vec<PeerHandle>,
}

impl DownloadingPiece {
    fn new(num_blocks: u32) -> Self {
        Self {
            blocks: vec![BlockState::Open; num_blocks as usize],
            contributors: Vec::new(),
        }
    }

    fn all_finished(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| matches!(b, BlockState::Finished))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FinishResult {
    /// The block was already finished; the write is a no-op.
    AlreadyFinished,
    /// More blocks of the piece are outstanding.
    PieceIncomplete,
    /// Every block of the piece is finished; time to verify it.
    PieceComplete,
}

pub struct PiecePicker {
    lengths: Lengths,
    have: BF,
    availability: Vec<u32>,
    downloading: BTreeMap<u32, DownloadingPiece>,
    priority_pieces: Vec<u32>,
    opts: PickerOptions,
}

impl PiecePicker {
    pub fn new(lengths: Lengths, have: BF, opts: PickerOptions) -> Self {
        assert_eq!(have.len(), lengths.total_pieces() as usize);
        Self {
            availability: vec![0; lengths.total_pieces() as usize],
            downloading: BTreeMap::new(),
            priority_pieces: Vec::new(),
            lengths,
            have,
            opts,
        }
    }

    pub fn new_empty(lengths: Lengths, opts: PickerOptions) -> Self {
        let have = BF::repeat(false, lengths.total_pieces() as usize);
        Self::new(lengths, have, opts)
    }

    pub fn lengths(&self) -> &Lengths {
        &self.lengths
    }

    pub fn have_bitfield(&self) -> &BF {
        &self.have
    }

    pub fn has_piece(&self, piece: ValidPieceIndex) -> bool {
        self.have[piece.get() as usize]
    }

    pub fn num_have(&self) -> u32 {
        self.have.count_ones() as u32
    }

    pub fn is_finished(&self) -> bool {
        self.num_have() == self.lengths.total_pieces()
    }

    /// Boosted pieces are tried before anything else, in the given order.
    pub fn set_priority_pieces(&mut self, pieces: Vec<u32>) {
        self.priority_pieces = pieces;
    }

    pub fn inc_availability(&mut self, bits: &BF) {
        for idx in bits.iter_ones() {
            if let Some(a) = self.availability.get_mut(idx) {
                *a += 1;
            }
        }
    }

    pub fn dec_availability(&mut self, bits: &BF) {
        for idx in bits.iter_ones() {
            if let Some(a) = self.availability.get_mut(idx) {
                *a = a.saturating_sub(1);
            }
        }
    }

    fn peer_has(bits: &BF, piece: u32) -> bool {
        bits.get(piece as usize).map(|b| *b).unwrap_or(false)
    }

    /// Unfinished, not-yet-written blocks across all started pieces.
    fn remaining_requestable_blocks(&self) -> u32 {
        self.downloading
            .values()
            .flat_map(|dp| dp.blocks.iter())
            .filter(|b| matches!(b, BlockState::Open | BlockState::Requested { .. }))
            .count() as u32
    }

    fn unstarted_pieces_exist(&self) -> bool {
        (0..self.lengths.total_pieces())
            .any(|i| !self.have[i as usize] && !self.downloading.contains_key(&i))
    }

    /// Endgame: every missing piece is already being downloaded and only a
    /// handful of blocks remain in flight anywhere.
    pub fn in_endgame(&self) -> bool {
        !self.is_finished()
            && !self.unstarted_pieces_exist()
            && self.remaining_requestable_blocks() < self.opts.endgame_block_threshold
    }

    /// Pick up to `n` blocks for `peer` to request. Continues pieces that
    /// are already partially downloaded before starting new ones; in
    /// endgame, duplicates outstanding requests.
    pub fn pick(
        &mut self,
        peer: PeerHandle,
        peer_bits: &BF,
        n: usize,
        now: Instant,
    ) -> Vec<BlockInfo> {
        let mut out = Vec::new();
        if n == 0 || self.is_finished() {
            return out;
        }

        // Started pieces first, so pieces finish instead of accumulating.
        let started: Vec<u32> = self.downloading.keys().copied().collect();
        for piece in started {
            if out.len() >= n {
                break;
            }
            if Self::peer_has(peer_bits, piece) {
                self.pick_open_blocks(piece, peer, peer_bits, n, now, &mut out);
            }
        }

        if out.len() < n {
            for piece in self.order_unstarted(peer_bits) {
                if out.len() >= n {
                    break;
                }
                let index = self
                    .lengths
                    .validate_piece_index(piece)
                    .expect("picker indices are in range");
                let blocks = self.lengths.blocks_per_piece(index);
                self.downloading
                    .entry(piece)
                    .or_insert_with(|| DownloadingPiece::new(blocks));
                self.pick_open_blocks(piece, peer, peer_bits, n, now, &mut out);
            }
        }

        if out.len() < n && self.in_endgame() {
            self.pick_endgame_duplicates(peer, peer_bits, n, &mut out);
        }

        trace!(?peer, picked = out.len(), "picked blocks");
        out
    }

    fn pick_open_blocks(
        &mut self,
        piece: u32,
        peer: PeerHandle,
        peer_bits: &BF,
        n: usize,
        now: Instant,
        out: &mut Vec<BlockInfo>,
    ) {
        if !Self::peer_has(peer_bits, piece) {
            return;
        }
        let index = match self.lengths.validate_piece_index(piece) {
            Some(i) => i,
            None => return,
        };
        let dp = match self.downloading.get_mut(&piece) {
            Some(dp) => dp,
            None => return,
        };
        for (block_index, state) in dp.blocks.iter_mut().enumerate() {
            if out.len() >= n {
                return;
            }
            if matches!(state, BlockState::Open) {
                *state = BlockState::Requested {
                    peers: vec![peer],
                    since: now,
                };
                out.push(
                    self.lengths
                        .block_info(index, block_index as u32)
                        .expect("block index within piece"),
                );
            }
        }
    }

    fn pick_endgame_duplicates(
        &mut self,
        peer: PeerHandle,
        peer_bits: &BF,
        n: usize,
        out: &mut Vec<BlockInfo>,
    ) {
        let pieces: Vec<u32> = self.downloading.keys().copied().collect();
        for piece in pieces {
            if out.len() >= n {
                return;
            }
            if !Self::peer_has(peer_bits, piece) {
                continue;
            }
            let index = self
                .lengths
                .validate_piece_index(piece)
                .expect("picker indices are in range");
            let dp = self.downloading.get_mut(&piece).expect("iterating keys");
            for (block_index, state) in dp.blocks.iter_mut().enumerate() {
                if out.len() >= n {
                    return;
                }
                if let BlockState::Requested { peers, .. } = state {
                    if !peers.contains(&peer) {
                        peers.push(peer);
                        out.push(
                            self.lengths
                                .block_info(index, block_index as u32)
                                .expect("block index within piece"),
                        );
                    }
                }
            }
        }
    }

    /// Order not-yet-started, missing pieces for a new pick: priorities
    /// first, then index order (sequential/small transfers) or rarest-first.
    fn order_unstarted(&self, peer_bits: &BF) -> Vec<u32> {
        let wanted = |piece: u32| {
            !self.have[piece as usize]
                && !self.downloading.contains_key(&piece)
                && Self::peer_has(peer_bits, piece)
        };
        let mut out: Vec<u32> = self
            .priority_pieces
            .iter()
            .copied()
            .filter(|p| *p < self.lengths.total_pieces() && wanted(*p))
            .collect();
        let mut rest: Vec<u32> = (0..self.lengths.total_pieces())
            .filter(|p| wanted(*p) && !out.contains(p))
            .collect();
        let use_rarest =
            !self.opts.sequential && self.lengths.total_pieces() > self.opts.rarest_first_cutoff;
        if use_rarest {
            rest.sort_by_key(|p| (self.availability[*p as usize], *p));
        }
        out.extend(rest);
        out
    }

    /// The block's bytes arrived and are queued for disk. `None` means the
    /// block is already being written or done and the data should be
    /// dropped; otherwise the other peers holding duplicate (endgame)
    /// requests are returned so cancels can be sent.
    pub fn mark_writing(&mut self, block: &BlockInfo, from: PeerHandle) -> Option<Vec<PeerHandle>> {
        let dp = self.downloading.get_mut(&block.piece_index.get())?;
        let state = &mut dp.blocks[block.block_index as usize];
        match state {
            BlockState::Requested { peers, .. } => {
                let others: Vec<PeerHandle> =
                    peers.iter().copied().filter(|p| *p != from).collect();
                *state = BlockState::Writing;
                Some(others)
            }
            BlockState::Open => {
                // An expired request can arrive late; accept the data.
                *state = BlockState::Writing;
                Some(Vec::new())
            }
            BlockState::Writing | BlockState::Finished => None,
        }
    }

    /// The block's bytes are persisted.
    pub fn mark_finished(&mut self, block: &BlockInfo, from: PeerHandle) -> FinishResult {
        let dp = match self.downloading.get_mut(&block.piece_index.get()) {
            Some(dp) => dp,
            None => return FinishResult::AlreadyFinished,
        };
        let state = &mut dp.blocks[block.block_index as usize];
        if matches!(state, BlockState::Finished) {
            return FinishResult::AlreadyFinished;
        }
        *state = BlockState::Finished;
        if !dp.contributors.contains(&from) {
            dp.contributors.push(from);
        }
        if dp.all_finished() {
            FinishResult::PieceComplete
        } else {
            FinishResult::PieceIncomplete
        }
    }

    /// Withdraw one peer's request for a block, reopening it when no
    /// requester remains.
    pub fn abort_request(&mut self, block: &BlockInfo, peer: PeerHandle) {
        if let Some(dp) = self.downloading.get_mut(&block.piece_index.get()) {
            let state = &mut dp.blocks[block.block_index as usize];
            if let BlockState::Requested { peers, .. } = state {
                peers.retain(|p| *p != peer);
                if peers.is_empty() {
                    *state = BlockState::Open;
                }
            }
        }
    }

    /// Drop every request held by a disconnecting peer. Returns how many
    /// blocks were affected.
    pub fn peer_disconnected(&mut self, peer: PeerHandle) -> usize {
        let mut dropped = 0;
        for dp in self.downloading.values_mut() {
            for state in dp.blocks.iter_mut() {
                if let BlockState::Requested { peers, .. } = state {
                    let before = peers.len();
                    peers.retain(|p| *p != peer);
                    if peers.len() != before {
                        dropped += 1;
                        if peers.is_empty() {
                            *state = BlockState::Open;
                        }
                    }
                }
            }
        }
        dropped
    }

    /// The piece verified; clear its pending state for good.
    pub fn have_piece(&mut self, piece: ValidPieceIndex) {
        self.have.set(piece.get() as usize, true);
        self.downloading.remove(&piece.get());
    }

    /// The piece failed verification; every block re-enters the pick pool
    /// and the peers that contributed are returned for blaming.
    pub fn piece_failed(&mut self, piece: ValidPieceIndex) -> Vec<PeerHandle> {
        debug!(piece = piece.get(), "re-queueing failed piece");
        match self.downloading.get_mut(&piece.get()) {
            Some(dp) => {
                for state in dp.blocks.iter_mut() {
                    *state = BlockState::Open;
                }
                std::mem::take(&mut dp.contributors)
            }
            None => Vec::new(),
        }
    }

    /// Re-queue requests older than `timeout`. Returns the expired blocks
    /// with the peers that held them.
    pub fn expire_requests(
        &mut self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(BlockInfo, Vec<PeerHandle>)> {
        let mut expired = Vec::new();
        let lengths = self.lengths;
        for (piece, dp) in self.downloading.iter_mut() {
            let index = match lengths.validate_piece_index(*piece) {
                Some(i) => i,
                None => continue,
            };
            for (block_index, state) in dp.blocks.iter_mut().enumerate() {
                if let BlockState::Requested { peers, since } = state {
                    if now.duration_since(*since) >= timeout {
                        let info = lengths
                            .block_info(index, block_index as u32)
                            .expect("block index within piece");
                        expired.push((info, std::mem::take(peers)));
                        *state = BlockState::Open;
                    }
                }
            }
        }
        expired
    }

    #[cfg(test)]
    fn assert_single_requester_outside_endgame(&self) {
        if self.in_endgame() {
            return;
        }
        for dp in self.downloading.values() {
            for state in dp.blocks.iter() {
                if let BlockState::Requested { peers, .. } = state {
                    assert!(peers.len() <= 1, "duplicate request outside endgame");
                }
            }
        }
    }
}
