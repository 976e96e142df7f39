// The live state of a transfer: connected peers, the picker and policy,
// block request pipelining, part reception, piece verification and the
// upload scheduler. Peers run as tasks; all shared state sits behind
// short-held locks and is only touched from handler callbacks.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use libed2k_core::hash_id::Md4Hash;
use libed2k_core::lengths::ValidPieceIndex;
use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, debug_span, trace, warn};
use wire_protocol::peer::{Hello, PartRange, PeerMessage, WireBitfield};

use crate::alerts::Alert;
use crate::bandwidth::BandwidthManager;
use crate::peer_connection::{
    PeerConnection, PeerConnectionHandler, PeerConnectionOptions, PeerTx, WriterRequest,
};
use crate::piece_picker::{FinishResult, PickerOptions, PiecePicker};
use crate::policy::{
    ConnectError, ConnectionDesc, NewConnectionOutcome, PeerSource, Policy, PolicyOptions,
};
use crate::settings::SessionSettings;
use crate::spawn_utils::spawn_with_cancel;
use crate::transfer::{TransferShared, TransferStatus};
use crate::type_aliases::{PeerHandle, BF};
use crate::{Error, Result};

const MAX_UPLOAD_SLOTS: usize = 4;
const MAX_PIECE_FAILURES: u32 = 3;

/// A peer with an active (or being-established) connection.
pub(crate) struct LivePeer {
    pub tx: PeerTx,
    pub bits: Option<BF>,
    pub client_id: u32,
    /// The remote accepted our upload-slot request; we may request parts.
    pub upload_granted: bool,
    /// We granted this peer one of our upload slots.
    pub holds_upload_slot: bool,
    pub queue_rank: Option<u32>,
    /// Blocks requested from this peer and not yet received.
    pub inflight: HashSet<(u32, u32)>,
}

impl LivePeer {
    fn new(tx: PeerTx) -> Self {
        Self {
            tx,
            bits: None,
            client_id: 0,
            upload_granted: false,
            holds_upload_slot: false,
            queue_rank: None,
            inflight: HashSet::new(),
        }
    }
}

pub(crate) struct TransferLive {
    pub(crate) shared: Arc<TransferShared>,
    settings: Arc<SessionSettings>,
    picker: Mutex<PiecePicker>,
    policy: Mutex<Policy>,
    peers: DashMap<PeerHandle, LivePeer>,
    have_tx: broadcast::Sender<u32>,
    upload_tx: UnboundedSender<(PeerTx, u64, u32)>,
    /// Per-transfer channels; the session-global ones are traversed too.
    bandwidth: BandwidthManager,
    paused: AtomicBool,
    seeding: AtomicBool,
    upload_slots: AtomicUsize,
    piece_fail_counts: Mutex<HashMap<u32, u32>>,
    pick_notify: Notify,
    pub(crate) finished_notify: Notify,
}

impl TransferLive {
    pub(crate) fn new(
        shared: Arc<TransferShared>,
        have: BF,
        start_paused: bool,
    ) -> Result<Arc<Self>> {
        let session = shared.session()?;
        let settings = session.settings.clone();
        let picker = PiecePicker::new(
            shared.lengths,
            have,
            PickerOptions {
                sequential: shared.sequential,
                endgame_block_threshold: settings.endgame_block_threshold,
                ..Default::default()
            },
        );
        let policy = Policy::new(PolicyOptions {
            max_peerlist_size: settings.max_peerlist_size,
            allow_multiple_connections_per_ip: settings.allow_multiple_connections_per_ip,
            max_failcount: settings.max_failcount,
            min_reconnect_time: settings.min_reconnect_time,
        });
        let finished = picker.is_finished();
        let (have_tx, _) = broadcast::channel(128);
        let (upload_tx, upload_rx) = unbounded_channel();

        let live = Arc::new(Self {
            settings,
            picker: Mutex::new(picker),
            policy: Mutex::new(policy),
            peers: DashMap::new(),
            have_tx,
            upload_tx,
            bandwidth: BandwidthManager::new(None, None),
            paused: AtomicBool::new(start_paused),
            seeding: AtomicBool::new(finished),
            upload_slots: AtomicUsize::new(0),
            piece_fail_counts: Mutex::new(HashMap::new()),
            pick_notify: Notify::new(),
            finished_notify: Notify::new(),
            shared,
        });
        if finished {
            live.policy.lock().set_finished(true);
        }

        live.spawn("tick", live.clone().task_tick());
        live.spawn("upload_scheduler", live.clone().task_upload_scheduler(upload_rx));
        Ok(live)
    }

    fn spawn(
        &self,
        name: &'static str,
        fut: impl std::future::Future<Output = Result<()>> + Send + 'static,
    ) {
        let span = debug_span!(parent: self.shared.span.clone(), "task", name);
        let _ = spawn_with_cancel(span, self.shared.cancel.clone(), fut);
    }

    pub(crate) fn status(&self) -> TransferStatus {
        if self.picker.lock().is_finished() {
            if self.seeding.load(Ordering::Relaxed) {
                TransferStatus::Seeding
            } else {
                TransferStatus::Finished
            }
        } else {
            TransferStatus::Downloading
        }
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
        if !paused {
            self.pick_notify.notify_waiters();
        }
    }

    /// Close every peer. Removal gets its own disconnect reason so the
    /// alerts distinguish it from a plain stop.
    pub(crate) fn shutdown(&self, removed: bool) {
        for peer in self.peers.iter() {
            let reason = if removed {
                Err(Error::TransferRemoved)
            } else {
                Ok(())
            };
            let _ = peer.tx.send(WriterRequest::Disconnect(reason));
        }
    }

    pub(crate) fn num_peers(&self) -> usize {
        self.peers.len()
    }

    /// Feed a peer learned out-of-band (server sources, callbacks, the
    /// embedder) into the policy.
    pub(crate) fn add_known_peer(&self, addr: SocketAddr, source: PeerSource) {
        self.policy.lock().add_peer(addr, source, true);
    }

    pub(crate) fn resume_bitfield(&self) -> (Vec<u8>, Vec<u32>) {
        let picker = self.picker.lock();
        let have = picker.have_bitfield();
        let bytes = have.as_raw_slice().to_vec();
        let verified: Vec<u32> = have.iter_ones().take(4).map(|i| i as u32).collect();
        (bytes, verified)
    }

    fn wire_bitfield(&self) -> WireBitfield {
        let picker = self.picker.lock();
        let have = picker.have_bitfield();
        WireBitfield {
            bits: have.len() as u16,
            data: have.as_raw_slice().to_vec(),
        }
    }

    fn bf_from_wire(&self, wire: &WireBitfield) -> BF {
        let total = self.shared.lengths.total_pieces() as usize;
        let mut bf = BF::from_vec(wire.data.clone());
        bf.truncate(wire.bits as usize);
        bf.resize(total, false);
        bf
    }

    fn with_peer_mut<R>(&self, addr: PeerHandle, f: impl FnOnce(&mut LivePeer) -> R) -> Option<R> {
        self.peers.get_mut(&addr).map(|mut p| f(p.value_mut()))
    }

    // ---- connecting ----------------------------------------------------

    fn peer_connection_options(&self) -> PeerConnectionOptions {
        PeerConnectionOptions {
            connect_timeout: self.settings.peer_connect_timeout,
            peer_timeout: self.settings.peer_timeout,
            keep_alive_interval: self.settings.peer_timeout / 2,
        }
    }

    pub(crate) fn spawn_outgoing_peer(self: &Arc<Self>, addr: SocketAddr, source: PeerSource) {
        let (tx, rx) = unbounded_channel();
        self.peers.insert(addr, LivePeer::new(tx.clone()));
        let live = self.clone();
        let span = debug_span!(parent: self.shared.span.clone(), "peer", %addr, kind = "out");
        let _ = spawn_with_cancel(span, self.shared.cancel.clone(), async move {
            let handler = PeerHandler {
                live: live.clone(),
                addr,
                tx,
                incoming: false,
                source,
            };
            let conn = PeerConnection::new(
                addr,
                &handler,
                live.peer_connection_options(),
                live.session_spawner(),
            );
            let have_rx = live.have_tx.subscribe();
            let res = tokio::select! {
                r = conn.manage_outgoing(rx, have_rx) => r,
                r = handler.task_requester() => r,
            };
            handler.on_peer_died(&res);
            res
        });
    }

    /// Take over a routed incoming (or callback) connection. The session
    /// already consumed the hello and possibly a few more frames.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_incoming_peer(
        self: &Arc<Self>,
        read: OwnedReadHalf,
        write: OwnedWriteHalf,
        local: SocketAddr,
        remote: SocketAddr,
        hello: Hello,
        pending: Vec<PeerMessage>,
        source: PeerSource,
    ) -> Result<()> {
        if self.peers.len() >= self.settings.max_connections_per_transfer {
            return Err(Error::TooManyConnections);
        }
        let (tx, rx) = unbounded_channel();
        self.peers.insert(remote, LivePeer::new(tx.clone()));
        let live = self.clone();
        let span = debug_span!(parent: self.shared.span.clone(), "peer", addr = %remote, kind = "in");
        let _ = spawn_with_cancel(span, self.shared.cancel.clone(), async move {
            let handler = PeerHandler {
                live: live.clone(),
                addr: remote,
                tx,
                incoming: true,
                source,
            };
            let conn = PeerConnection::new(
                remote,
                &handler,
                live.peer_connection_options(),
                live.session_spawner(),
            );
            let have_rx = live.have_tx.subscribe();
            let res = tokio::select! {
                r = conn.manage_incoming(read, write, local, hello, pending, rx, have_rx) => r,
                r = handler.task_requester() => r,
            };
            handler.on_peer_died(&res);
            res
        });
        Ok(())
    }

    fn session_spawner(&self) -> crate::spawn_utils::BlockingSpawner {
        self.shared
            .session()
            .map(|s| s.spawner)
            .unwrap_or_else(|_| crate::spawn_utils::BlockingSpawner::new(false))
    }

    // ---- periodic work -------------------------------------------------

    async fn task_tick(self: Arc<Self>) -> Result<()> {
        const REANNOUNCE_EVERY: Duration = Duration::from_secs(300);
        let mut interval = tokio::time::interval(self.settings.transfer_tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_announce = Instant::now();
        loop {
            interval.tick().await;
            let now = Instant::now();

            // Re-ask the server for sources while the download is short on
            // candidates.
            if now.duration_since(last_announce) >= REANNOUNCE_EVERY {
                last_announce = now;
                if !self.picker.lock().is_finished() {
                    if let Ok(session) = self.shared.session() {
                        let _ = session.post_sources_request(&self.shared.file_hash);
                    }
                }
            }

            // Outstanding requests past their deadline re-enter the picker
            // and count against the peer.
            let expired = self
                .picker
                .lock()
                .expire_requests(now, self.settings.block_request_timeout);
            if !expired.is_empty() {
                let mut policy = self.policy.lock();
                for (block, peers) in &expired {
                    for peer in peers {
                        policy.inc_failcount(*peer);
                        self.with_peer_mut(*peer, |p| {
                            p.inflight
                                .remove(&(block.piece_index.get(), block.block_index));
                        });
                    }
                }
                drop(policy);
                debug!(count = expired.len(), "re-queued expired block requests");
                self.pick_notify.notify_waiters();
            }

            if self.paused.load(Ordering::Relaxed) {
                continue;
            }
            if self.peers.len() >= self.settings.max_connections_per_transfer {
                continue;
            }
            for _ in 0..self.settings.connect_speed {
                let addr = self.policy.lock().connect_one_peer(now);
                match addr {
                    Some(addr) => self.spawn_outgoing_peer(addr, PeerSource::Server),
                    None => break,
                }
            }
        }
    }

    /// Grants upload bandwidth in request order: the transfer's bucket
    /// first, then the session-wide one.
    async fn task_upload_scheduler(
        self: Arc<Self>,
        mut rx: UnboundedReceiver<(PeerTx, u64, u32)>,
    ) -> Result<()> {
        while let Some((tx, offset, len)) = rx.recv().await {
            let nz = match NonZeroU32::new(len) {
                Some(nz) => nz,
                None => continue,
            };
            tokio::select! {
                _ = tx.closed() => continue,
                r = self.bandwidth.prepare_for_upload(nz) => r?,
            }
            if let Ok(session) = self.shared.session() {
                tokio::select! {
                    _ = tx.closed() => continue,
                    r = session.bandwidth.prepare_for_upload(nz) => r?,
                }
            }
            let _ = tx.send(WriterRequest::ReadPart { offset, len });
        }
        Ok(())
    }

    // ---- download path -------------------------------------------------

    async fn on_part_received(
        self: &Arc<Self>,
        from: PeerHandle,
        begin: u64,
        data: Bytes,
    ) -> Result<()> {
        let lengths = self.shared.lengths;
        let len = data.len() as u32;
        if len > lengths.block_size() {
            return Err(Error::UnexpectedMessage("oversize part"));
        }
        let piece = (begin / lengths.default_piece_length() as u64) as u32;
        let index = lengths
            .validate_piece_index(piece)
            .ok_or(Error::UnexpectedMessage("part beyond last piece"))?;
        let offset_in_piece = (begin % lengths.default_piece_length() as u64) as u32;
        let block = lengths
            .block_info_from_received_data(index, offset_in_piece, len)
            .ok_or(Error::UnexpectedMessage("misaligned part"))?;

        // Download rate limiting happens on receipt: the transfer's bucket,
        // then the session's.
        self.bandwidth.prepare_for_download(
            NonZeroU32::new(len).ok_or(Error::UnexpectedMessage("empty part"))?,
        )
        .await?;
        if let Ok(session) = self.shared.session() {
            session
                .bandwidth
                .prepare_for_download(NonZeroU32::new(len).expect("checked above"))
                .await?;
        }

        self.with_peer_mut(from, |p| {
            p.inflight.remove(&(piece, block.block_index));
        });

        let cancels = match self.picker.lock().mark_writing(&block, from) {
            Some(cancels) => cancels,
            // Duplicate endgame arrival; the write already happened.
            None => return Ok(()),
        };
        for other in cancels {
            self.cancel_duplicate(other, piece, block.block_index);
        }

        let buffer = self.allocate_buffer(&data).await?;
        let storage = self.shared.storage.clone();
        let abs_offset = lengths.block_absolute_offset(&block);
        tokio::task::spawn_blocking(move || {
            let res = storage.write_block(abs_offset, &buffer);
            drop(buffer);
            res
        })
        .await
        .map_err(|e| Error::Anyhow(e.into()))??;

        self.shared
            .stats
            .downloaded_bytes
            .fetch_add(len as u64, Ordering::Relaxed);

        let finish = self.picker.lock().mark_finished(&block, from);
        match finish {
            FinishResult::AlreadyFinished => Ok(()),
            FinishResult::PieceIncomplete => {
                self.pick_notify.notify_waiters();
                Ok(())
            }
            FinishResult::PieceComplete => self.on_piece_complete(index).await,
        }
    }

    /// Copy received bytes into a pooled buffer, waiting briefly when the
    /// pool is drained.
    async fn allocate_buffer(&self, data: &[u8]) -> Result<crate::buffer_pool::DiskBuffer> {
        let session = self.shared.session()?;
        for _ in 0..100 {
            match session.buffer_pool.allocate() {
                Ok(mut buf) => {
                    buf.fill_from(data);
                    return Ok(buf);
                }
                Err(Error::NoMemory) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::NoMemory)
    }

    fn release_upload_slot(&self, addr: PeerHandle) {
        let held = self
            .with_peer_mut(addr, |p| std::mem::take(&mut p.holds_upload_slot))
            .unwrap_or(false);
        if held {
            self.upload_slots.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn cancel_duplicate(&self, peer: PeerHandle, piece: u32, block_index: u32) {
        let emptied = self
            .with_peer_mut(peer, |p| {
                p.inflight.remove(&(piece, block_index));
                p.inflight.is_empty()
            })
            .unwrap_or(false);
        // There is no per-block cancel on this wire; releasing the slot is
        // only worth it when nothing else is outstanding from that peer.
        if emptied {
            if let Some(p) = self.peers.get(&peer) {
                let _ = p.tx.send(WriterRequest::Message(PeerMessage::CancelTransfer));
            }
        }
    }

    async fn on_piece_complete(self: &Arc<Self>, index: ValidPieceIndex) -> Result<()> {
        let expected = self
            .shared
            .piece_hash(index.get())
            .ok_or(Error::MissingPieces)?;
        let storage = self.shared.storage.clone();
        let lengths = self.shared.lengths;
        let digest = tokio::task::spawn_blocking(move || storage.piece_digest(&lengths, index))
            .await
            .map_err(|e| Error::Anyhow(e.into()))??;

        if digest == expected {
            debug!(piece = index.get(), "piece verified");
            self.picker.lock().have_piece(index);
            let _ = self.have_tx.send(index.get());
            self.pick_notify.notify_waiters();
            if self.picker.lock().is_finished() {
                self.on_transfer_complete();
            }
            return Ok(());
        }

        // Hash mismatch is self-healing: blocks re-enter the picker, the
        // contributors get blamed, and only a piece that keeps failing
        // stops the transfer.
        warn!(piece = index.get(), "piece failed hash check");
        self.shared
            .stats
            .failed_hash_bytes
            .fetch_add(lengths.piece_length(index) as u64, Ordering::Relaxed);
        let blamed = self.picker.lock().piece_failed(index);
        {
            let mut policy = self.policy.lock();
            for peer in &blamed {
                policy.inc_failcount(*peer);
            }
        }
        let failures = {
            let mut counts = self.piece_fail_counts.lock();
            let entry = counts.entry(index.get()).or_insert(0);
            *entry += 1;
            *entry
        };
        if failures >= MAX_PIECE_FAILURES {
            warn!(piece = index.get(), failures, "piece keeps failing, pausing transfer");
            if let Ok(session) = self.shared.session() {
                session.alerts.post(Alert::TransferError {
                    hash: self.shared.file_hash,
                    error: Error::FailedPieceVerification(index.get()).to_string(),
                });
            }
            self.set_paused(true);
        }
        self.pick_notify.notify_waiters();
        Ok(())
    }

    fn on_transfer_complete(self: &Arc<Self>) {
        if self.seeding.swap(true, Ordering::Relaxed) {
            return;
        }
        debug!("transfer complete");
        self.policy.lock().set_finished(true);
        let storage = self.shared.storage.clone();
        let _ = tokio::task::spawn_blocking(move || storage.sync());
        if let Ok(session) = self.shared.session() {
            session.alerts.post(Alert::TransferFinished {
                hash: self.shared.file_hash,
            });
            session.on_transfer_complete(self.shared.file_hash);
        }
        self.finished_notify.notify_waiters();
    }

    // ---- upload path ---------------------------------------------------

    fn on_parts_requested(&self, from: PeerHandle, ranges: &[PartRange]) -> Result<()> {
        let lengths = self.shared.lengths;
        let piece_size = lengths.default_piece_length() as u64;
        for range in ranges {
            if range.end > self.shared.file_size {
                return Err(Error::UnexpectedMessage("part request beyond file end"));
            }
            let len = range.end - range.begin;
            if len > lengths.block_size() as u64 {
                return Err(Error::UnexpectedMessage("oversize part request"));
            }
            let piece = (range.begin / piece_size) as u32;
            if (range.end - 1) / piece_size != piece as u64 {
                return Err(Error::UnexpectedMessage("part request spans pieces"));
            }
            let index = match lengths.validate_piece_index(piece) {
                Some(i) => i,
                None => return Err(Error::UnexpectedMessage("part request beyond last piece")),
            };
            if !self.picker.lock().has_piece(index) {
                trace!(piece, "requested piece we don't have, skipping range");
                continue;
            }
            if let Some(p) = self.peers.get(&from) {
                let _ = self
                    .upload_tx
                    .send((p.tx.clone(), range.begin, len as u32));
            }
        }
        Ok(())
    }
}

/// The transfer's face of one peer connection.
pub(crate) struct PeerHandler {
    live: Arc<TransferLive>,
    addr: PeerHandle,
    tx: PeerTx,
    incoming: bool,
    source: PeerSource,
}

impl PeerHandler {
    fn expect_hash(&self, hash: Md4Hash) -> Result<()> {
        if hash != self.live.shared.file_hash {
            return Err(Error::NoSuchFile);
        }
        Ok(())
    }

    /// Continuously keeps the request pipeline full. Runs next to the
    /// connection future and dies with it.
    async fn task_requester(&self) -> Result<()> {
        let live = &self.live;
        let queue_size = live.settings.request_queue_size;
        let mut requested_any = false;
        let mut sent_end_of_download = false;
        loop {
            if live.picker.lock().is_finished() {
                if requested_any && !sent_end_of_download {
                    sent_end_of_download = true;
                    let _ = self.tx.send(WriterRequest::Message(PeerMessage::EndOfDownload {
                        hash: live.shared.file_hash,
                    }));
                }
                // Stay up to serve uploads.
                live.finished_notify.notified().await;
                continue;
            }

            let ready = !live.paused.load(Ordering::Relaxed)
                && live.shared.has_hash_set()
                && live
                    .peers
                    .get(&self.addr)
                    .map(|p| p.upload_granted && p.bits.is_some())
                    .unwrap_or(false);

            if ready {
                requested_any |= self.request_more(queue_size)?;
            }

            tokio::select! {
                _ = live.pick_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    /// Returns whether any request went out.
    fn request_more(&self, queue_size: usize) -> Result<bool> {
        let live = &self.live;
        let (bits, outstanding) = match live.peers.get(&self.addr) {
            Some(p) => match &p.bits {
                Some(bits) => (bits.clone(), p.inflight.len()),
                None => return Ok(false),
            },
            None => return Ok(false),
        };
        if outstanding >= queue_size {
            return Ok(false);
        }
        let picked = live.picker.lock().pick(
            self.addr,
            &bits,
            queue_size - outstanding,
            Instant::now(),
        );
        if picked.is_empty() {
            return Ok(false);
        }
        live.with_peer_mut(self.addr, |p| {
            for block in &picked {
                p.inflight
                    .insert((block.piece_index.get(), block.block_index));
            }
        });
        for group in picked.chunks(3) {
            let ranges: Vec<PartRange> = group
                .iter()
                .map(|b| {
                    let r = live.shared.lengths.block_range(b);
                    PartRange {
                        begin: r.start,
                        end: r.end,
                    }
                })
                .collect();
            trace!(count = ranges.len(), "requesting parts");
            self.tx
                .send(WriterRequest::Message(PeerMessage::RequestParts {
                    hash: live.shared.file_hash,
                    ranges,
                }))
                .map_err(|_| Error::PeerDisconnected)?;
        }
        Ok(true)
    }

    fn on_peer_died(&self, res: &Result<()>) {
        let live = &self.live;
        let failed = res.is_err();
        // A reconnect may already occupy this address; only take our entry.
        if let Some((_, peer)) = live
            .peers
            .remove_if(&self.addr, |_, p| p.tx.same_channel(&self.tx))
        {
            if let Some(bits) = &peer.bits {
                live.picker.lock().dec_availability(bits);
            }
            if peer.holds_upload_slot {
                live.upload_slots.fetch_sub(1, Ordering::Relaxed);
            }
        }
        let reopened = live.picker.lock().peer_disconnected(self.addr);
        if reopened > 0 {
            live.pick_notify.notify_waiters();
        }
        live.policy
            .lock()
            .connection_closed(self.addr, failed, Instant::now());
        let reason = match res {
            Ok(()) => "closed".to_owned(),
            Err(e) => format!("{e:#}"),
        };
        debug!(addr = %self.addr, reason, "peer disconnected");
        if let Ok(session) = live.shared.session() {
            session.alerts.post(Alert::PeerDisconnected {
                hash: live.shared.file_hash,
                addr: self.addr,
                reason,
            });
        }
    }

    fn on_file_status(&self, pieces: &WireBitfield) -> Result<()> {
        let live = &self.live;
        let bits = live.bf_from_wire(pieces);
        let is_seed = bits.all();
        let old = live
            .with_peer_mut(self.addr, |p| p.bits.replace(bits.clone()))
            .flatten();
        {
            let mut picker = live.picker.lock();
            if let Some(old) = &old {
                picker.dec_availability(old);
            }
            picker.inc_availability(&bits);
        }
        if is_seed {
            live.policy.lock().set_seed(self.addr, true);
        }
        live.pick_notify.notify_waiters();
        Ok(())
    }
}

impl PeerConnectionHandler for &PeerHandler {
    fn file_hash(&self) -> Md4Hash {
        self.live.shared.file_hash
    }

    fn my_hello(&self) -> Hello {
        let live = &self.live;
        let settings = &live.settings;
        match live.shared.session() {
            Ok(session) => session.build_hello(),
            // Session going away; the connection will die momentarily.
            Err(_) => Hello {
                client_hash: settings.client_hash,
                client_id: 0,
                port: settings.listen_port,
                tags: Vec::new(),
                server: wire_protocol::server::NetEndpoint { ip: 0, port: 0 },
            },
        }
    }

    fn on_identified(&self, hello: &Hello, local: SocketAddr) -> Result<()> {
        let live = &self.live;
        if hello.client_hash == live.settings.client_hash {
            // Dialed our own listener.
            return Err(Error::SelfConnection);
        }
        let desc = ConnectionDesc {
            local,
            remote: self.addr,
            outgoing: !self.incoming,
            connecting: false,
        };
        match live.policy.lock().new_connection(desc, self.source) {
            Ok(NewConnectionOutcome::Accepted) => {}
            Ok(NewConnectionOutcome::ReplacedExisting(existing)) => {
                if let Some(p) = live.peers.get(&existing.remote) {
                    let _ = p
                        .tx
                        .send(WriterRequest::Disconnect(Err(Error::DuplicatePeer)));
                }
            }
            Err(ConnectError::SelfConnection { existing }) => {
                if let Some(p) = live.peers.get(&existing.remote) {
                    let _ = p
                        .tx
                        .send(WriterRequest::Disconnect(Err(Error::SelfConnection)));
                }
                return Err(Error::SelfConnection);
            }
            Err(e) => return Err(e.into()),
        }
        live.with_peer_mut(self.addr, |p| p.client_id = hello.client_id);
        trace!(addr = %self.addr, client_id = hello.client_id, "peer identified");
        if let Ok(session) = live.shared.session() {
            session.alerts.post(Alert::PeerConnected {
                hash: live.shared.file_hash,
                addr: self.addr,
            });
        }
        Ok(())
    }

    fn initial_messages(&self) -> Vec<PeerMessage> {
        let live = &self.live;
        let hash = live.shared.file_hash;
        let mut msgs = vec![
            PeerMessage::FileRequest { hash },
            PeerMessage::SetRequestFileId { hash },
        ];
        if !live.shared.has_hash_set() {
            msgs.push(PeerMessage::HashSetRequest { hash });
        }
        if !live.picker.lock().is_finished() {
            msgs.push(PeerMessage::StartUploadRequest { hash });
        }
        msgs
    }

    async fn on_received_message(&self, msg: PeerMessage) -> Result<()> {
        let live = &self.live;
        match msg {
            PeerMessage::Hello(_) | PeerMessage::HelloAnswer(_) => {
                return Err(Error::UnexpectedMessage("hello after handshake"))
            }
            PeerMessage::FileRequest { hash } => {
                self.expect_hash(hash)?;
                let name = live.shared.file_name.read().clone();
                let _ = self
                    .tx
                    .send(WriterRequest::Message(PeerMessage::FileAnswer {
                        hash,
                        name,
                    }));
            }
            PeerMessage::FileAnswer { hash, name } => {
                self.expect_hash(hash)?;
                let mut current = live.shared.file_name.write();
                if current.is_empty() {
                    *current = name;
                }
            }
            PeerMessage::NoFile { .. } => return Err(Error::NoSuchFile),
            PeerMessage::SetRequestFileId { hash } => {
                self.expect_hash(hash)?;
                let _ = self
                    .tx
                    .send(WriterRequest::Message(PeerMessage::FileStatus {
                        hash,
                        pieces: live.wire_bitfield(),
                    }));
            }
            PeerMessage::FileStatus { hash, pieces } => {
                self.expect_hash(hash)?;
                self.on_file_status(&pieces)?;
            }
            PeerMessage::HashSetRequest { hash } => {
                self.expect_hash(hash)?;
                match live.shared.hash_set() {
                    Some(pieces) => {
                        let _ = self
                            .tx
                            .send(WriterRequest::Message(PeerMessage::HashSetAnswer {
                                hash,
                                pieces,
                            }));
                    }
                    None => {
                        trace!("hash set requested before we have one");
                    }
                }
            }
            PeerMessage::HashSetAnswer { hash, pieces } => {
                self.expect_hash(hash)?;
                live.shared.set_hash_set(pieces)?;
                live.pick_notify.notify_waiters();
            }
            PeerMessage::StartUploadRequest { hash } => {
                self.expect_hash(hash)?;
                let already = live
                    .with_peer_mut(self.addr, |p| p.holds_upload_slot)
                    .unwrap_or(false);
                let slots = live.upload_slots.load(Ordering::Relaxed);
                let reply = if already {
                    PeerMessage::AcceptUpload
                } else if slots < MAX_UPLOAD_SLOTS {
                    live.upload_slots.fetch_add(1, Ordering::Relaxed);
                    live.with_peer_mut(self.addr, |p| p.holds_upload_slot = true);
                    PeerMessage::AcceptUpload
                } else {
                    PeerMessage::QueueRanking {
                        rank: (slots - MAX_UPLOAD_SLOTS) as u32 + 1,
                    }
                };
                let _ = self.tx.send(WriterRequest::Message(reply));
            }
            PeerMessage::AcceptUpload => {
                live.with_peer_mut(self.addr, |p| p.upload_granted = true);
                live.pick_notify.notify_waiters();
            }
            PeerMessage::QueueRanking { rank } => {
                trace!(rank, "queued for an upload slot");
                live.with_peer_mut(self.addr, |p| p.queue_rank = Some(rank));
            }
            PeerMessage::OutOfPartRequests => {
                live.with_peer_mut(self.addr, |p| p.upload_granted = false);
            }
            PeerMessage::CancelTransfer => {
                live.release_upload_slot(self.addr);
            }
            PeerMessage::RequestParts { hash, ranges } => {
                self.expect_hash(hash)?;
                live.on_parts_requested(self.addr, &ranges)?;
            }
            PeerMessage::SendingPart { hash, begin, data } => {
                self.expect_hash(hash)?;
                live.on_part_received(self.addr, begin, data).await?;
            }
            PeerMessage::EndOfDownload { .. } => {
                trace!("peer finished downloading from us");
                live.release_upload_slot(self.addr);
            }
            PeerMessage::Chat { text } => {
                trace!(text, "peer chat message ignored");
            }
        }
        Ok(())
    }

    fn read_part(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.live.shared.storage.read_block(offset, buf)
    }

    fn on_uploaded_bytes(&self, bytes: u32) {
        self.live
            .shared
            .stats
            .uploaded_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn build_status_update(&self) -> Option<PeerMessage> {
        Some(PeerMessage::FileStatus {
            hash: self.live.shared.file_hash,
            pieces: self.live.wire_bitfield(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libed2k_core::lengths::Lengths;

    fn wire_of(bf: &BF) -> WireBitfield {
        WireBitfield {
            bits: bf.len() as u16,
            data: bf.as_raw_slice().to_vec(),
        }
    }

    #[test]
    fn test_wire_bitfield_conversion() {
        // 10 pieces, bits round-trip through the wire shape.
        let mut have = BF::repeat(false, 10);
        have.set(0, true);
        have.set(3, true);
        have.set(9, true);
        let wire = wire_of(&have);
        assert_eq!(wire.bits, 10);
        assert_eq!(wire.data.len(), 2);

        let mut bf = BF::from_vec(wire.data.clone());
        bf.truncate(wire.bits as usize);
        assert_eq!(bf, have);
    }

    #[test]
    fn test_block_to_part_range_and_back() {
        let lengths = Lengths::new(2 * libed2k_core::constants::PIECE_SIZE + 5000).unwrap();
        let p1 = lengths.validate_piece_index(1).unwrap();
        let block = lengths.block_info(p1, 5).unwrap();
        let range = lengths.block_range(&block);

        // What on_part_received recomputes from the wire offset.
        let piece = (range.start / lengths.default_piece_length() as u64) as u32;
        let offset_in_piece = (range.start % lengths.default_piece_length() as u64) as u32;
        let index = lengths.validate_piece_index(piece).unwrap();
        let back = lengths
            .block_info_from_received_data(index, offset_in_piece, (range.end - range.start) as u32)
            .unwrap();
        assert_eq!(back, block);
    }
}
