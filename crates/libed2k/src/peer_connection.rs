// The per-peer wire state machine: connect, exchange hellos, then a reader
// and a writer future racing under one task. The handler is the transfer's
// view of the peer; callbacks are quick and never block the loop, except
// disk reads which go through the blocking spawner.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::trace;

use libed2k_core::hash_id::Md4Hash;
use wire_protocol::peer::{Hello, PeerMessage};
use wire_protocol::FrameHeader;

use crate::spawn_utils::BlockingSpawner;
use crate::{Error, Result};

pub trait PeerConnectionHandler: Send + Sync {
    /// The file this connection is transferring.
    fn file_hash(&self) -> Md4Hash;
    /// Our side of the hello exchange.
    fn my_hello(&self) -> Hello;
    /// The remote's hello arrived. Registration with the policy happens
    /// here; an error (self-connection, duplicate) closes the socket.
    fn on_identified(&self, hello: &Hello, local: SocketAddr) -> Result<()>;
    /// Messages to send as soon as the connection is active.
    fn initial_messages(&self) -> Vec<PeerMessage>;
    fn on_received_message(
        &self,
        msg: PeerMessage,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
    /// Fill `buf` with file bytes at `offset` for an upload.
    fn read_part(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn on_uploaded_bytes(&self, bytes: u32);
    /// Sent on piece completion and as traffic when the wire idles.
    fn build_status_update(&self) -> Option<PeerMessage>;
}

#[derive(Debug)]
pub enum WriterRequest {
    Message(PeerMessage),
    /// Upload one granted part; the disk read happens on the writer.
    ReadPart { offset: u64, len: u32 },
    Disconnect(Result<()>),
}

pub type PeerRx = UnboundedReceiver<WriterRequest>;
pub type PeerTx = tokio::sync::mpsc::UnboundedSender<WriterRequest>;

#[derive(Debug, Clone, Copy)]
pub struct PeerConnectionOptions {
    pub connect_timeout: Duration,
    pub peer_timeout: Duration,
    pub keep_alive_interval: Duration,
}

impl Default for PeerConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(7),
            peer_timeout: Duration::from_secs(120),
            keep_alive_interval: Duration::from_secs(60),
        }
    }
}

pub(crate) async fn with_timeout<T>(
    name: &'static str,
    dur: Duration,
    fut: impl std::future::Future<Output = io::Result<T>>,
    map_err: fn(io::Error) -> Error,
) -> Result<T> {
    match timeout(dur, fut).await {
        Ok(r) => r.map_err(map_err),
        Err(_) => Err(Error::TimedOut(name)),
    }
}

/// Reads one framed message at a time off the wire.
pub(crate) struct FrameReader<R> {
    read: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(read: R) -> Self {
        Self { read }
    }

    pub fn into_inner(self) -> R {
        self.read
    }

    pub async fn read_frame(&mut self, rwtimeout: Duration) -> Result<(u8, u8, Vec<u8>)> {
        let mut header = [0u8; wire_protocol::FRAME_HEADER_LEN];
        with_timeout(
            "reading frame header",
            rwtimeout,
            self.read.read_exact(&mut header),
            Error::Read,
        )
        .await?;
        let (header, opcode) = FrameHeader::parse(&header)?;
        let mut payload = vec![0u8; header.payload_len()];
        with_timeout(
            "reading frame payload",
            rwtimeout,
            self.read.read_exact(&mut payload),
            Error::Read,
        )
        .await?;
        Ok((header.protocol, opcode, payload))
    }

    pub async fn read_message(&mut self, rwtimeout: Duration) -> Result<PeerMessage> {
        let (protocol, opcode, payload) = self.read_frame(rwtimeout).await?;
        Ok(PeerMessage::deserialize(protocol, opcode, &payload)?)
    }
}

pub(crate) async fn send_message<W: AsyncWrite + Unpin>(
    write: &mut W,
    buf: &mut Vec<u8>,
    msg: &PeerMessage,
    rwtimeout: Duration,
) -> Result<()> {
    buf.clear();
    msg.serialize(buf);
    trace!(len = buf.len(), "sending message");
    with_timeout("writing", rwtimeout, write.write_all(buf), Error::Write).await
}

pub(crate) struct PeerConnection<H> {
    handler: H,
    addr: SocketAddr,
    options: PeerConnectionOptions,
    spawner: BlockingSpawner,
}

struct ManageArgs<R, W> {
    reader: FrameReader<R>,
    write: W,
    rx: PeerRx,
    have_rx: broadcast::Receiver<u32>,
}

impl<H: PeerConnectionHandler> PeerConnection<H> {
    pub fn new(
        addr: SocketAddr,
        handler: H,
        options: PeerConnectionOptions,
        spawner: BlockingSpawner,
    ) -> Self {
        Self {
            handler,
            addr,
            options,
            spawner,
        }
    }

    /// Dial, exchange hellos, run until error or disconnect request.
    pub async fn manage_outgoing(
        &self,
        rx: PeerRx,
        have_rx: broadcast::Receiver<u32>,
    ) -> Result<()> {
        let rwtimeout = self.options.peer_timeout;
        let stream = with_timeout(
            "connecting",
            self.options.connect_timeout,
            TcpStream::connect(self.addr),
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
            &PeerMessage::Hello(self.handler.my_hello()),
            rwtimeout,
        )
        .await?;

        let hello = match reader.read_message(rwtimeout).await? {
            PeerMessage::HelloAnswer(h) => h,
            _ => return Err(Error::UnexpectedMessage("hello-answer")),
        };
        self.handler.on_identified(&hello, local)?;

        for msg in self.handler.initial_messages() {
            send_message(&mut write, &mut buf, &msg, rwtimeout).await?;
        }

        self.manage(ManageArgs {
            reader,
            write,
            rx,
            have_rx,
        })
        .await
    }

    /// Take over a socket the session accepted (or dialed for a callback).
    /// The session already answered the remote's hello and read frames up
    /// to the one that routed the connection here; messages it consumed
    /// beyond the hello are replayed through `pending`.
    pub async fn manage_incoming<R, W>(
        &self,
        read: R,
        mut write: W,
        local: SocketAddr,
        hello: Hello,
        pending: Vec<PeerMessage>,
        rx: PeerRx,
        have_rx: broadcast::Receiver<u32>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let rwtimeout = self.options.peer_timeout;
        let mut buf = Vec::new();
        self.handler.on_identified(&hello, local)?;
        for msg in pending {
            self.handler.on_received_message(msg).await?;
        }
        for msg in self.handler.initial_messages() {
            send_message(&mut write, &mut buf, &msg, rwtimeout).await?;
        }
        self.manage(ManageArgs {
            reader: FrameReader::new(read),
            write,
            rx,
            have_rx,
        })
        .await
    }

    async fn manage<R, W>(&self, args: ManageArgs<R, W>) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let ManageArgs {
            mut reader,
            mut write,
            mut rx,
            mut have_rx,
        } = args;
        let rwtimeout = self.options.peer_timeout;

        let writer = async move {
            let mut buf = Vec::new();
            let mut broadcast_closed = false;
            loop {
                let req = tokio::select! {
                    r = have_rx.recv(), if !broadcast_closed => match r {
                        Ok(_piece) => match self.handler.build_status_update() {
                            Some(msg) => WriterRequest::Message(msg),
                            None => continue,
                        },
                        Err(broadcast::error::RecvError::Closed) => {
                            broadcast_closed = true;
                            continue;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    },
                    r = timeout(self.options.keep_alive_interval, rx.recv()) => match r {
                        Ok(Some(req)) => req,
                        // All senders gone: the transfer dropped us.
                        Ok(None) => return Ok(()),
                        // Idle: keep the wire warm with a status update.
                        Err(_) => match self.handler.build_status_update() {
                            Some(msg) => WriterRequest::Message(msg),
                            None => continue,
                        },
                    },
                };

                match req {
                    WriterRequest::Message(msg) => {
                        send_message(&mut write, &mut buf, &msg, rwtimeout).await?;
                    }
                    WriterRequest::ReadPart { offset, len } => {
                        let mut data = vec![0u8; len as usize];
                        self.spawner
                            .spawn_block_in_place(|| self.handler.read_part(offset, &mut data))?;
                        let msg = PeerMessage::SendingPart {
                            hash: self.handler.file_hash(),
                            begin: offset,
                            data: Bytes::from(data),
                        };
                        send_message(&mut write, &mut buf, &msg, rwtimeout).await?;
                        self.handler.on_uploaded_bytes(len);
                    }
                    WriterRequest::Disconnect(res) => {
                        trace!("disconnect requested, closing writer");
                        return res;
                    }
                }
            }
        };

        let reader_loop = async move {
            loop {
                let msg = reader.read_message(rwtimeout).await?;
                self.handler.on_received_message(msg).await?;
            }
            // For type inference.
            #[allow(unreachable_code)]
            Ok::<_, Error>(())
        };

        tokio::select! {
            r = reader_loop => {
                trace!("reader finished: {:?}", r.as_ref().err());
                r
            }
            r = writer => {
                trace!("writer finished: {:?}", r.as_ref().err());
                r
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_reader_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);

        let msg = PeerMessage::FileRequest {
            hash: Md4Hash::TERMINAL,
        };
        let mut buf = Vec::new();
        send_message(&mut client_write, &mut buf, &msg, Duration::from_secs(1))
            .await
            .unwrap();

        let mut reader = FrameReader::new(server_read);
        let got = reader.read_message(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_frame_reader_times_out() {
        let (_client, server) = tokio::io::duplex(64);
        let (server_read, _server_write) = tokio::io::split(server);
        let mut reader = FrameReader::new(server_read);
        let res = reader.read_message(Duration::from_millis(20)).await;
        assert!(matches!(res, Err(Error::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_frame_reader_rejects_garbage() {
        let (client, server) = tokio::io::duplex(64);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(&[0x42u8; 6]).await.unwrap();

        let mut reader = FrameReader::new(server_read);
        let res = reader.read_message(Duration::from_secs(1)).await;
        assert!(matches!(res, Err(Error::Wire(_))));
    }
}
