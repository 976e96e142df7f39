// The long-lived connection to the index server: login, share publication,
// search, source queries and LowID callbacks. Reconnects with a bounded
// backoff when the server goes away.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use libed2k_core::constants::is_low_id;
use libed2k_core::hash_id::Md4Hash;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, trace, warn};
use wire_protocol::server::{LoginRequest, NetEndpoint, ServerMessage, SharedFileEntry};
use wire_protocol::tags::{Tag, CT_NAME, CT_PORT, CT_VERSION};

use crate::alerts::Alert;
use crate::peer_connection::{with_timeout, FrameReader};
use crate::session::Session;
use crate::{Error, Result};

const SERVER_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(300);
/// Advertised protocol version tag value.
const CLIENT_VERSION: u32 = 0x3C;

#[derive(Debug)]
pub(crate) enum ServerCommand {
    Search(String),
    GetSources(Md4Hash),
    OfferFiles(Vec<SharedFileEntry>),
    RequestCallback(u32),
}

async fn send_server<W: AsyncWrite + Unpin>(
    write: &mut W,
    buf: &mut Vec<u8>,
    msg: &ServerMessage,
    rwtimeout: Duration,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    buf.clear();
    msg.serialize(buf);
    with_timeout("writing to server", rwtimeout, write.write_all(buf), Error::Write).await
}

/// Runs for the session's lifetime; each inner session is one login.
pub(crate) async fn task_server_connection(
    session: Weak<Session>,
    mut rx: UnboundedReceiver<ServerCommand>,
) -> Result<()> {
    let mut attempt: u32 = 0;
    loop {
        match run_server_session(&session, &mut rx).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                let s = match session.upgrade() {
                    Some(s) => s,
                    None => return Ok(()),
                };
                warn!("server connection lost: {e:#}");
                s.alerts.post(Alert::ServerConnectionFailed {
                    error: format!("{e:#}"),
                });
                attempt += 1;
                let delay = s
                    .settings
                    .server_reconnect_timeout
                    .saturating_mul(attempt)
                    .min(MAX_RECONNECT_DELAY);
                drop(s);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn login_message(session: &Session) -> ServerMessage {
    let settings = &session.settings;
    ServerMessage::LoginRequest(LoginRequest {
        client_hash: settings.client_hash,
        // 0 until the server assigns one.
        client_id: 0,
        port: settings.listen_port,
        tags: vec![
            Tag::string(CT_NAME, settings.client_name.clone()),
            Tag::u32(CT_VERSION, CLIENT_VERSION),
            Tag::u32(CT_PORT, settings.listen_port as u32),
        ],
    })
}

async fn run_server_session(
    session: &Weak<Session>,
    rx: &mut UnboundedReceiver<ServerCommand>,
) -> Result<()> {
    let s = session.upgrade().ok_or(Error::SessionClosing)?;
    let settings = s.settings.clone();
    if settings.server_hostname.is_empty() {
        return Ok(());
    }
    let rwtimeout = settings.server_timeout;

    let mut addrs = tokio::net::lookup_host((settings.server_hostname.as_str(), settings.server_port))
        .await
        .map_err(Error::Connect)?;
    let addr = addrs.next().ok_or_else(|| {
        Error::Connect(io::Error::new(
            io::ErrorKind::NotFound,
            "server hostname resolved to no addresses",
        ))
    })?;

    let stream = with_timeout(
        "connecting to server",
        SERVER_CONNECT_TIMEOUT,
        TcpStream::connect(addr),
        Error::Connect,
    )
    .await?;
    let _ = stream.set_nodelay(true);
    let (read, mut write) = stream.into_split();
    let mut reader = FrameReader::new(read);
    let mut buf = Vec::new();

    *s.server_addr.write() = NetEndpoint::from_socket_addr(addr);
    send_server(&mut write, &mut buf, &login_message(&s), rwtimeout).await?;
    debug!(server = %addr, "logging into server");
    let keepalive = s.settings.server_keep_alive_timeout;
    drop(s);

    // Reader and writer run as separate futures so a command or keep-alive
    // can never cancel a half-read frame.
    let reader_loop = async {
        let mut announced = false;
        let mut status: Option<(u32, u32)> = None;
        loop {
            let (protocol, opcode, payload) = reader.read_frame(rwtimeout).await?;
            let msg = ServerMessage::deserialize(protocol, opcode, &payload)?;
            let s = session.upgrade().ok_or(Error::SessionClosing)?;
            handle_message(&s, msg, &mut announced, &mut status)?;
        }
        // For type inference.
        #[allow(unreachable_code)]
        Ok::<_, Error>(())
    };

    let writer_loop = async {
        loop {
            let msg = tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(ServerCommand::Search(query)) => ServerMessage::SearchRequest(query),
                    Some(ServerCommand::GetSources(hash)) => ServerMessage::GetSources { hash },
                    Some(ServerCommand::OfferFiles(files)) => ServerMessage::OfferFiles(files),
                    Some(ServerCommand::RequestCallback(client_id)) => {
                        ServerMessage::CallbackRequest { client_id }
                    }
                    None => return Ok(()),
                },
                // An empty share publication doubles as the keep-alive.
                _ = tokio::time::sleep(keepalive) => ServerMessage::OfferFiles(Vec::new()),
            };
            send_server(&mut write, &mut buf, &msg, rwtimeout).await?;
        }
    };

    tokio::select! {
        r = reader_loop => r,
        r = writer_loop => r,
    }
}

fn handle_message(
    s: &Arc<Session>,
    msg: ServerMessage,
    announced: &mut bool,
    status: &mut Option<(u32, u32)>,
) -> Result<()> {
    match msg {
        ServerMessage::IdChange { client_id, .. } => {
            s.client_id.store(client_id, Ordering::Relaxed);
            if is_low_id(client_id) {
                warn!(client_id, "server assigned a LowID; we are not reachable directly");
            } else {
                debug!(client_id, "server assigned id");
            }
            // Logged in: publish our shares and ask for sources. These go
            // through the command queue so the writer owns the socket.
            let offers = s.shared_file_entries();
            if !offers.is_empty() {
                s.send_server_command(ServerCommand::OfferFiles(offers)).ok();
            }
            for hash in s.transfer_hashes() {
                s.send_server_command(ServerCommand::GetSources(hash)).ok();
            }
            maybe_announce(s, announced, status);
        }
        ServerMessage::ServerStatus { users, files } => {
            *status = Some((users, files));
            maybe_announce(s, announced, status);
        }
        ServerMessage::ServerText(text) => {
            s.alerts.post(Alert::ServerMessage { text });
        }
        ServerMessage::SearchResult(results) => {
            s.alerts.post(Alert::SearchResult { results });
        }
        ServerMessage::FoundSources { hash, sources } => {
            s.on_found_sources(hash, &sources);
        }
        ServerMessage::CallbackRequested(endpoint) => {
            // A LowID round: someone asked the server to have us connect out.
            s.clone().spawn_callback_connect(endpoint);
        }
        ServerMessage::CallbackFailed => {
            debug!("callback request failed, peer is gone");
        }
        ServerMessage::Reject => {
            debug!("server rejected our last message");
        }
        other => {
            trace!(?other, "ignoring server message");
        }
    }
    Ok(())
}

fn maybe_announce(s: &Arc<Session>, announced: &mut bool, status: &Option<(u32, u32)>) {
    let client_id = s.client_id.load(Ordering::Relaxed);
    if *announced || client_id == 0 {
        return;
    }
    if let Some((users, files)) = status {
        *announced = true;
        s.alerts.post(Alert::ServerConnectionInitialized {
            client_id,
            users: *users,
            files: *files,
        });
    }
}
