use governor::InsufficientCapacity;
use wire_protocol::MessageDeserializeError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    // Serialization and protocol errors: fatal for the connection that
    // produced them, never for the transfer.
    #[error(transparent)]
    Wire(#[from] MessageDeserializeError),
    #[error("unexpected message {0} in this connection state")]
    UnexpectedMessage(&'static str),

    // Transport errors.
    #[error("session is closing")]
    SessionClosing,
    #[error("timed out waiting for {0}")]
    TimedOut(&'static str),
    #[error("connection to ourselves")]
    SelfConnection,
    #[error("duplicate peer connection")]
    DuplicatePeer,
    #[error("too many connections")]
    TooManyConnections,
    #[error("peer is banned")]
    Banned,
    #[error("peer disconnected")]
    PeerDisconnected,
    #[error("error connecting: {0:#}")]
    Connect(#[source] std::io::Error),
    #[error("error reading: {0:#}")]
    Read(#[source] std::io::Error),
    #[error("error writing: {0:#}")]
    Write(#[source] std::io::Error),

    // Transfer errors.
    #[error("transfer already exists in session")]
    DuplicateTransfer,
    #[error("transfer is paused")]
    TransferPaused,
    #[error("transfer is aborted")]
    TransferAborted,
    #[error("transfer was removed")]
    TransferRemoved,
    #[error("transfer is not live")]
    TransferNotLive,
    #[error("invalid transfer handle")]
    InvalidTransferHandle,
    #[error("peer has no such file")]
    NoSuchFile,
    #[error("mismatching hash")]
    MismatchingHash,
    #[error("piece {0} failed hash check")]
    FailedPieceVerification(u32),

    // Storage errors: pause the transfer and surface an alert.
    #[error("file unavailable: {0:#}")]
    FileUnavailable(#[source] std::io::Error),
    #[error("file is too short")]
    FileTooShort,
    #[error("file collision at {0}")]
    FileCollision(std::path::PathBuf),
    #[error("resume data is missing pieces")]
    MissingPieces,
    #[error("resume data has an invalid piece list")]
    InvalidResumeData,
    #[error("no free disk buffers")]
    NoMemory,

    #[error("rate limiter cannot satisfy request: {0:#}")]
    RateLimitInsufficientCapacity(
        #[from]
        #[source]
        InsufficientCapacity,
    ),

    #[error(transparent)]
    Anyhow(anyhow::Error),
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Anyhow(e)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
