// The session owns everything: the transfer registry, the listener, the
// server connection, the global bandwidth channels, the disk buffer pool
// and the alert queue.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use libed2k_core::constants::{is_low_id, BLOCK_SIZE};
use libed2k_core::hash_id::Md4Hash;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn};
use wire_protocol::peer::{Hello, PeerMessage};
use wire_protocol::server::{NetEndpoint, SharedFileEntry};
use wire_protocol::tags::{Tag, CT_NAME, CT_PORT, CT_VERSION, FT_FILENAME, FT_FILESIZE};

use crate::alerts::{Alert, AlertManager};
use crate::bandwidth::BandwidthManager;
use crate::buffer_pool::DiskBufferPool;
use crate::peer_connection::{send_message, with_timeout, FrameReader};
use crate::policy::PeerSource;
use crate::server_connection::{task_server_connection, ServerCommand};
use crate::settings::SessionSettings;
use crate::spawn_utils::{spawn_with_cancel, BlockingSpawner};
use crate::transfer::{AddTransferParams, ManagedTransfer, ResumeData, TransferStatus};
use crate::{Error, Result};

/// How many frames past the hello may arrive before one of them names the
/// file an incoming connection is for.
const MAX_ROUTING_FRAMES: usize = 8;
const CLIENT_VERSION: u32 = 0x3C;

// LowID callbacks routinely never complete (source offline, server drops
// the relay, NAT blocks the dial), so the pending table is bounded both
// ways: entries expire, and past the cap the oldest gives way.
const MAX_PENDING_CALLBACKS: usize = 256;
const PENDING_CALLBACK_TTL: Duration = Duration::from_secs(600);

/// Read frames until one names a file hash; those frames are replayed to
/// the transfer that ends up owning the connection.
async fn read_routing_frames<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    rwtimeout: Duration,
) -> Result<(Md4Hash, Vec<PeerMessage>)> {
    let mut pending = Vec::new();
    for _ in 0..MAX_ROUTING_FRAMES {
        let msg = reader.read_message(rwtimeout).await?;
        let hash = match &msg {
            PeerMessage::FileRequest { hash }
            | PeerMessage::SetRequestFileId { hash }
            | PeerMessage::StartUploadRequest { hash }
            | PeerMessage::HashSetRequest { hash } => Some(*hash),
            _ => None,
        };
        pending.push(msg);
        if let Some(hash) = hash {
            return Ok((hash, pending));
        }
    }
    Err(Error::UnexpectedMessage("no file named by peer"))
}

pub struct Session {
    pub(crate) settings: Arc<SessionSettings>,
    pub(crate) alerts: AlertManager,
    pub(crate) bandwidth: BandwidthManager,
    pub(crate) buffer_pool: Arc<DiskBufferPool>,
    pub(crate) spawner: BlockingSpawner,
    pub(crate) client_id: AtomicU32,
    pub(crate) server_addr: RwLock<Option<NetEndpoint>>,
    /// LowID peers we asked the server to call back, keyed by their short
    /// id, so the resulting inbound connection credits the right transfer.
    /// Values carry the registration time; see `register_pending_callback`.
    pub(crate) pending_callbacks: dashmap::DashMap<u32, (Md4Hash, Instant)>,
    transfers: RwLock<HashMap<Md4Hash, Arc<ManagedTransfer>>>,
    server_tx: RwLock<Option<UnboundedSender<ServerCommand>>>,
    listen_addr: RwLock<Option<SocketAddr>>,
    cancel: CancellationToken,
}

impl Session {
    pub async fn new(settings: SessionSettings) -> anyhow::Result<Arc<Self>> {
        let settings = Arc::new(settings);
        let session = Arc::new(Session {
            alerts: AlertManager::default(),
            bandwidth: BandwidthManager::new(
                settings.download_rate_limit,
                settings.upload_rate_limit,
            ),
            buffer_pool: DiskBufferPool::new(BLOCK_SIZE as usize, settings.max_disk_buffers),
            spawner: BlockingSpawner::default(),
            client_id: AtomicU32::new(0),
            server_addr: RwLock::new(None),
            pending_callbacks: dashmap::DashMap::new(),
            transfers: RwLock::new(HashMap::new()),
            server_tx: RwLock::new(None),
            listen_addr: RwLock::new(None),
            cancel: CancellationToken::new(),
            settings,
        });

        session.spawn("listener", {
            let this = session.clone();
            async move { this.task_listener().await }
        });

        if !session.settings.server_hostname.is_empty() {
            let (tx, rx) = unbounded_channel();
            *session.server_tx.write() = Some(tx);
            let weak = Arc::downgrade(&session);
            session.spawn("server_connection", task_server_connection(weak, rx));
        }

        Ok(session)
    }

    fn spawn(
        &self,
        name: &'static str,
        fut: impl std::future::Future<Output = Result<()>> + Send + 'static,
    ) {
        let span = debug_span!("session", task = name);
        let _ = spawn_with_cancel(span, self.cancel.clone(), fut);
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn client_id(&self) -> u32 {
        self.client_id.load(Ordering::Relaxed)
    }

    pub fn is_low_id(&self) -> bool {
        let id = self.client_id();
        id != 0 && is_low_id(id)
    }

    pub(crate) fn server_endpoint(&self) -> Option<NetEndpoint> {
        *self.server_addr.read()
    }

    pub(crate) fn build_hello(&self) -> Hello {
        Hello {
            client_hash: self.settings.client_hash,
            client_id: self.client_id(),
            port: self.settings.listen_port,
            tags: vec![
                Tag::string(CT_NAME, self.settings.client_name.clone()),
                Tag::u32(CT_VERSION, CLIENT_VERSION),
                Tag::u32(CT_PORT, self.settings.listen_port as u32),
            ],
            server: self.server_endpoint().unwrap_or(NetEndpoint { ip: 0, port: 0 }),
        }
    }

    // ---- transfer registry ---------------------------------------------

    pub fn add_transfer(self: &Arc<Self>, params: AddTransferParams) -> Result<TransferHandle> {
        if self.cancel.is_cancelled() {
            return Err(Error::SessionClosing);
        }
        let hash = params.file_hash;
        {
            let transfers = self.transfers.read();
            if transfers.contains_key(&hash) {
                return Err(Error::DuplicateTransfer);
            }
        }
        let transfer = ManagedTransfer::new(params, self)?;
        self.transfers.write().insert(hash, transfer);
        self.alerts.post(Alert::TransferAdded { hash });
        self.post_sources_request(&hash).ok();
        Ok(TransferHandle {
            hash,
            session: Arc::downgrade(self),
        })
    }

    pub fn remove_transfer(&self, hash: &Md4Hash, delete_files: bool) -> Result<()> {
        let transfer = self
            .transfers
            .write()
            .remove(hash)
            .ok_or(Error::InvalidTransferHandle)?;
        transfer.abort_removed();
        if delete_files {
            transfer.shared.storage.delete()?;
        }
        Ok(())
    }

    pub(crate) fn get_transfer(&self, hash: &Md4Hash) -> Option<Arc<ManagedTransfer>> {
        self.transfers.read().get(hash).cloned()
    }

    pub fn handle(self: &Arc<Self>, hash: Md4Hash) -> TransferHandle {
        TransferHandle {
            hash,
            session: Arc::downgrade(self),
        }
    }

    pub(crate) fn transfer_hashes(&self) -> Vec<Md4Hash> {
        self.transfers.read().keys().copied().collect()
    }

    /// Entries for offer-files: complete transfers we can serve.
    pub(crate) fn shared_file_entries(&self) -> Vec<SharedFileEntry> {
        let client_id = self.client_id();
        self.transfers
            .read()
            .values()
            .filter(|t| matches!(t.status(), TransferStatus::Seeding | TransferStatus::Finished))
            .map(|t| {
                let mut tags = vec![Tag::u64(FT_FILESIZE, t.shared.file_size)];
                let name = t.shared.file_name.read().clone();
                if !name.is_empty() {
                    tags.insert(0, Tag::string(FT_FILENAME, name));
                }
                SharedFileEntry {
                    hash: t.shared.file_hash,
                    client_id,
                    port: self.settings.listen_port,
                    tags,
                }
            })
            .collect()
    }

    pub(crate) fn on_transfer_complete(&self, _hash: Md4Hash) {
        let offers = self.shared_file_entries();
        if !offers.is_empty() {
            self.send_server_command(ServerCommand::OfferFiles(offers)).ok();
        }
    }

    // ---- alerts --------------------------------------------------------

    pub fn pop_alert(&self) -> Option<Alert> {
        self.alerts.pop_alert()
    }

    pub async fn wait_for_alert(&self, timeout: Duration) -> Option<Alert> {
        self.alerts.wait_for_alert(timeout).await
    }

    pub fn set_alert_mask(&self, mask: u32) {
        self.alerts.set_mask(mask);
    }

    // ---- server plumbing -----------------------------------------------

    pub(crate) fn send_server_command(&self, cmd: ServerCommand) -> Result<()> {
        match self.server_tx.read().as_ref() {
            Some(tx) => tx.send(cmd).map_err(|_| Error::SessionClosing),
            None => Err(Error::SessionClosing),
        }
    }

    pub fn post_search(&self, query: impl Into<String>) -> Result<()> {
        self.send_server_command(ServerCommand::Search(query.into()))
    }

    pub fn post_sources_request(&self, hash: &Md4Hash) -> Result<()> {
        self.send_server_command(ServerCommand::GetSources(*hash))
    }

    /// Sources the server returned for a transfer. LowID sources get a
    /// callback request instead of a direct dial.
    pub(crate) fn on_found_sources(&self, hash: Md4Hash, sources: &[NetEndpoint]) {
        let transfer = match self.get_transfer(&hash) {
            Some(t) => t,
            None => return,
        };
        let live = match transfer.live() {
            Some(live) => live,
            None => return,
        };
        for source in sources {
            if is_low_id(source.ip) {
                // Re-announces return the same LowID sources; one pending
                // callback per short id is enough.
                if self.pending_callbacks.contains_key(&source.ip) {
                    continue;
                }
                trace!(id = source.ip, "LowID source, requesting callback");
                self.register_pending_callback(source.ip, hash);
                self.send_server_command(ServerCommand::RequestCallback(source.ip))
                    .ok();
            } else {
                live.add_known_peer(source.to_socket_addr(), PeerSource::Server);
            }
        }
    }

    /// Remember a requested callback, expiring stale entries and capping
    /// the table so abandoned callbacks cannot pile up for the session's
    /// lifetime.
    pub(crate) fn register_pending_callback(&self, client_id: u32, hash: Md4Hash) {
        let now = Instant::now();
        if self.pending_callbacks.len() >= MAX_PENDING_CALLBACKS {
            self.pending_callbacks
                .retain(|_, (_, at)| now.duration_since(*at) < PENDING_CALLBACK_TTL);
        }
        if self.pending_callbacks.len() >= MAX_PENDING_CALLBACKS {
            // Nothing expired: the oldest request gives way.
            let oldest = self
                .pending_callbacks
                .iter()
                .min_by_key(|e| e.value().1)
                .map(|e| *e.key());
            if let Some(oldest) = oldest {
                self.pending_callbacks.remove(&oldest);
            }
        }
        self.pending_callbacks.insert(client_id, (hash, now));
    }

    fn take_pending_callback(&self, client_id: u32) -> Option<Md4Hash> {
        self.pending_callbacks
            .remove(&client_id)
            .map(|(_, (hash, _))| hash)
    }

    // ---- incoming connections ------------------------------------------

    /// Bound listen address, once the listener is up. Differs from the
    /// configured port when `listen_port` is 0 (ephemeral).
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.read()
    }

    async fn task_listener(self: Arc<Self>) -> Result<()> {
        let listener = match TcpListener::bind(("0.0.0.0", self.settings.listen_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(port = self.settings.listen_port, "cannot listen: {e:#}");
                self.alerts.post(Alert::ListenFailed {
                    port: self.settings.listen_port,
                    error: format!("{e:#}"),
                });
                return Ok(());
            }
        };
        if let Ok(addr) = listener.local_addr() {
            debug!(%addr, "listening for peers");
            *self.listen_addr.write() = Some(addr);
        }
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {e:#}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let this = self.clone();
            self.spawn("incoming_peer", async move {
                if let Err(e) = this.route_incoming(stream, remote).await {
                    debug!(%remote, "incoming connection failed: {e:#}");
                }
                Ok(())
            });
        }
    }

    /// Answer the hello, then read until a message names the file, and hand
    /// the socket to that transfer.
    async fn route_incoming(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let local = stream.local_addr().map_err(Error::Read)?;
        let rwtimeout = self.settings.peer_timeout;
        let (read, mut write) = stream.into_split();
        let mut reader = FrameReader::new(read);
        let mut buf = Vec::new();

        let hello = match reader.read_message(rwtimeout).await? {
            PeerMessage::Hello(h) => h,
            _ => return Err(Error::UnexpectedMessage("hello")),
        };
        send_message(
            &mut write,
            &mut buf,
            &PeerMessage::HelloAnswer(self.build_hello()),
            rwtimeout,
        )
        .await?;
        if hello.client_hash == self.settings.client_hash {
            // Our own outbound dial looped back to the listener.
            return Err(Error::SelfConnection);
        }

        let (hash, pending) = read_routing_frames(&mut reader, rwtimeout).await?;

        let live = self
            .get_transfer(&hash)
            .and_then(|t| t.live());
        let live = match live {
            Some(live) => live,
            None => {
                send_message(
                    &mut write,
                    &mut buf,
                    &PeerMessage::NoFile { hash },
                    rwtimeout,
                )
                .await?;
                return Ok(());
            }
        };
        let source = if self.take_pending_callback(hello.client_id).is_some() {
            PeerSource::Callback
        } else {
            PeerSource::Incoming
        };
        live.add_incoming_peer(
            reader.into_inner(),
            write,
            local,
            remote,
            hello,
            pending,
            source,
        )
    }

    /// We are LowID and the server relayed a connect-back request: dial the
    /// requester and serve the connection like an incoming one.
    pub(crate) fn spawn_callback_connect(self: Arc<Self>, endpoint: NetEndpoint) {
        let this = self.clone();
        self.spawn("callback_connect", async move {
            let remote = endpoint.to_socket_addr();
            let rwtimeout = this.settings.peer_timeout;
            let stream = with_timeout(
                "connecting for callback",
                this.settings.peer_connect_timeout,
                TcpStream::connect(remote),
                Error::Connect,
            )
            .await?;
            let _ = stream.set_nodelay(true);
            let local = stream.local_addr().map_err(Error::Connect)?;
            let (read, mut write) = stream.into_split();
            let mut reader = FrameReader::new(read);
            let mut buf = Vec::new();
            send_message(
                &mut write,
                &mut buf,
                &PeerMessage::Hello(this.build_hello()),
                rwtimeout,
            )
            .await?;
            let hello = match reader.read_message(rwtimeout).await? {
                PeerMessage::HelloAnswer(h) => h,
                _ => return Err(Error::UnexpectedMessage("hello-answer")),
            };

            // From here the requester drives, as if it had connected to us.
            let (hash, pending) = read_routing_frames(&mut reader, rwtimeout).await?;
            let live = this
                .get_transfer(&hash)
                .and_then(|t| t.live())
                .ok_or(Error::InvalidTransferHandle)?;
            live.add_incoming_peer(
                reader.into_inner(),
                write,
                local,
                remote,
                hello,
                pending,
                PeerSource::Callback,
            )
        });
    }

    // ---- shutdown ------------------------------------------------------

    /// Walk transfers, abort them, then let tasks die on the cancelled
    /// token. Bounded by `shutdown_grace`.
    pub async fn stop(&self) {
        debug!("session stopping");
        self.cancel.cancel();
        let transfers: Vec<Arc<ManagedTransfer>> =
            self.transfers.write().drain().map(|(_, t)| t).collect();
        let grace = self.settings.shutdown_grace;
        let _ = tokio::time::timeout(grace, async move {
            for transfer in transfers {
                let t = transfer.clone();
                let _ = tokio::task::spawn_blocking(move || t.abort()).await;
            }
        })
        .await;
    }
}

/// A weak, fallible reference to a transfer. Every accessor reports
/// `InvalidTransferHandle` once the transfer is removed.
#[derive(Clone)]
pub struct TransferHandle {
    pub hash: Md4Hash,
    session: Weak<Session>,
}

impl TransferHandle {
    fn transfer(&self) -> Result<Arc<ManagedTransfer>> {
        self.session
            .upgrade()
            .ok_or(Error::SessionClosing)?
            .get_transfer(&self.hash)
            .ok_or(Error::InvalidTransferHandle)
    }

    pub fn status(&self) -> Result<TransferStatus> {
        Ok(self.transfer()?.status())
    }

    pub fn pause(&self) -> Result<()> {
        self.transfer()?.pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.transfer()?.resume()
    }

    pub fn abort(&self) -> Result<()> {
        self.transfer()?.abort();
        Ok(())
    }

    /// (downloaded, uploaded) byte counters.
    pub fn stats(&self) -> Result<(u64, u64)> {
        Ok(self.transfer()?.stats())
    }

    pub fn resume_data(&self) -> Result<ResumeData> {
        Ok(self.transfer()?.resume_data())
    }

    /// Hand the transfer a peer learned out of band.
    pub fn add_peer(&self, addr: SocketAddr) -> Result<()> {
        let transfer = self.transfer()?;
        let live = transfer.live().ok_or(Error::TransferNotLive)?;
        live.add_known_peer(addr, PeerSource::Resume);
        Ok(())
    }

    pub fn num_peers(&self) -> Result<usize> {
        let transfer = self.transfer()?;
        Ok(transfer.live().map(|l| l.num_peers()).unwrap_or(0))
    }
}
