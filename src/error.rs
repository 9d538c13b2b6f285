//! The error types used throughout the engine.
//!
//! Errors are split along the containment boundary described in the protocol:
//! peer-level failures (parsing, protocol violations) only ever tear down the
//! offending peer session, while torrent-level failures (storage) are
//! surfaced to the owner of the torrent.

use std::fmt;

use tokio::sync::mpsc;

/// The result type used by the engine, defaulting to the crate's error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type used by the engine.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A peer sent a malformed handshake or wire message. The session it
    /// came from is closed; the torrent is unaffected.
    Parse(ParseError),
    /// A peer broke the protocol. The session it came from is closed; the
    /// torrent is unaffected.
    Protocol(ProtocolViolation),
    /// A completed piece or an assembled metadata buffer did not hash to its
    /// expected digest. The data is discarded and contributors are struck,
    /// but the torrent carries on.
    HashMismatch,
    /// Reading from or writing to content storage failed. Propagated to the
    /// owner of the torrent as this cannot be attributed to a peer.
    Storage(std::io::Error),
    /// A connect attempt, block request, or piece download exceeded its
    /// deadline. Recovered from locally by re-picking blocks or dropping the
    /// peer.
    Timeout,
    /// The operation was cancelled, e.g. due to shutdown. Silent.
    Cancelled,
    /// An mpsc channel to another part of the engine was unexpectedly
    /// closed.
    Channel,
    /// A piece index outside the torrent was used.
    InvalidPieceIndex,
    /// A file index outside the torrent was used.
    InvalidFileIndex,
    /// An attempt was made to skip a file that has already been fully
    /// downloaded and verified.
    FileAlreadyComplete,
    /// A socket level IO error.
    Io(std::io::Error),
}

/// The ways in which a wire message can fail to parse.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParseError {
    /// The 68 byte handshake did not start with the BitTorrent protocol
    /// string.
    InvalidHandshake,
    /// The 4 byte message length prefix exceeds the configured frame cap.
    MessageTooLarge { len: u32, max: u32 },
    /// The message id is not one we know about.
    UnknownMessageId(u8),
    /// A message's payload was shorter than its type mandates.
    TruncatedPayload,
    /// A bencoded payload (extended handshake or metadata header) was
    /// malformed.
    InvalidBencode,
}

/// Protocol rules whose violation closes the offending peer session.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ProtocolViolation {
    /// The info hash in the peer's handshake is not the torrent's.
    WrongInfoHash,
    /// The peer advertised a hybrid v1/v2 torrent in its extended handshake.
    /// Its piece hashes would not align with ours, so the session must not
    /// proceed.
    HybridTorrent,
    /// A bitfield message arrived at a point other than directly after the
    /// handshake.
    UnexpectedBitfield,
    /// A HAVE_ALL or HAVE_NONE message arrived without the Fast extension
    /// having been negotiated.
    FastNotNegotiated,
    /// A piece, request, or cancel message refers to data outside the
    /// torrent.
    OutOfRange,
    /// The peer requested a block while we are choking it.
    RequestWhileChoked,
    /// The peer announced a metadata size conflicting with the size
    /// established by another peer.
    MetadataSizeMismatch,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "parse error: {}", e),
            Self::Protocol(e) => write!(f, "protocol violation: {}", e),
            Self::HashMismatch => write!(f, "hash mismatch"),
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Channel => write!(f, "channel unexpectedly closed"),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidFileIndex => write!(f, "invalid file index"),
            Self::FileAlreadyComplete => {
                write!(f, "cannot skip a fully downloaded file")
            }
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidHandshake => write!(f, "invalid handshake"),
            Self::MessageTooLarge { len, max } => {
                write!(f, "message length {} exceeds cap {}", len, max)
            }
            Self::UnknownMessageId(id) => write!(f, "unknown message id {}", id),
            Self::TruncatedPayload => write!(f, "truncated message payload"),
            Self::InvalidBencode => write!(f, "malformed bencode payload"),
        }
    }
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::WrongInfoHash => write!(f, "wrong info hash in handshake"),
            Self::HybridTorrent => write!(f, "peer is on a hybrid v1/v2 torrent"),
            Self::UnexpectedBitfield => {
                write!(f, "bitfield not directly after handshake")
            }
            Self::FastNotNegotiated => {
                write!(f, "Fast extension message without negotiation")
            }
            Self::OutOfRange => write!(f, "message refers to data out of range"),
            Self::RequestWhileChoked => write!(f, "request while choked"),
            Self::MetadataSizeMismatch => {
                write!(f, "conflicting metadata size")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<ProtocolViolation> for Error {
    fn from(e: ProtocolViolation) -> Self {
        Self::Protocol(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// An engine channel closing from under us means the other half was dropped,
// which only happens on shutdown or an internal bug.
impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}

impl Error {
    /// Returns true if the error is contained at the peer that caused it and
    /// must not affect the rest of the torrent.
    pub fn is_peer_local(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::Protocol(_) | Self::Io(_) | Self::Timeout
        )
    }
}
