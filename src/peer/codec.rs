//! Pure encoding and decoding of the BitTorrent wire protocol.
//!
//! The send side goes through [`tokio_util::codec`] encoders into a write
//! buffer; the receive side frames messages directly out of the session's
//! [`ChunkedBuffer`], which lets a partially received message stay queued
//! without copies until the rest of it arrives.

use std::convert::TryFrom;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::Encoder;

use crate::{
    chunk_buf::ChunkedBuffer,
    error::{Error, ParseError, Result},
    BlockInfo, InfoHash, PeerId, PieceIndex,
};

/// The protocol string included in the handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The length of the fixed size handshake: 1 byte protocol string length,
/// the protocol string, 8 reserved bytes, the info hash, and the peer id.
pub(crate) const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// The reserved byte and mask advertising the extension protocol (BEP 10).
const LTEP_BYTE: usize = 5;
const LTEP_MASK: u8 = 0x10;

/// The reserved byte and mask advertising the Fast extension (BEP 6).
const FAST_BYTE: usize = 7;
const FAST_MASK: u8 = 0x04;

/// The handshake each side sends as the first bytes of a connection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The reserved bytes, some bits of which advertise extension support.
    pub reserved: [u8; 8],
    /// The torrent the connection is for; sessions with a different hash
    /// than ours are aborted.
    pub info_hash: InfoHash,
    /// The arbitrary 20 byte id of the remote client.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates our own handshake, advertising the extension protocol and the
    /// Fast extension.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0; 8];
        reserved[LTEP_BYTE] |= LTEP_MASK;
        reserved[FAST_BYTE] |= FAST_MASK;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the handshake advertises the extension protocol (BEP 10).
    pub fn supports_ltep(&self) -> bool {
        self.reserved[LTEP_BYTE] & LTEP_MASK != 0
    }

    /// Whether the handshake advertises the Fast extension (BEP 6).
    pub fn supports_fast(&self) -> bool {
        self.reserved[FAST_BYTE] & FAST_MASK != 0
    }
}

/// Frames a handshake out of the receive buffer.
///
/// Returns `Ok(None)` while fewer than 68 bytes are buffered. A wrong
/// protocol string is a parse error, which closes the session.
pub(crate) fn decode_handshake(
    buf: &mut ChunkedBuffer,
) -> Result<Option<Handshake>> {
    if buf.len() < HANDSHAKE_LEN {
        return Ok(None);
    }
    let raw = match buf.consume(HANDSHAKE_LEN) {
        Some(raw) => raw,
        None => return Ok(None),
    };

    if raw[0] as usize != PROTOCOL_STRING.len()
        || &raw[1..20] != PROTOCOL_STRING.as_bytes()
    {
        return Err(Error::Parse(ParseError::InvalidHandshake));
    }

    let mut reserved = [0; 8];
    reserved.copy_from_slice(&raw[20..28]);
    let mut info_hash = [0; 20];
    info_hash.copy_from_slice(&raw[28..48]);
    let mut peer_id = [0; 20];
    peer_id.copy_from_slice(&raw[48..68]);

    Ok(Some(Handshake {
        reserved,
        info_hash,
        peer_id,
    }))
}

/// Encodes handshakes into a session's write buffer.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        dst: &mut BytesMut,
    ) -> Result<()> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(PROTOCOL_STRING.len() as u8);
        dst.put_slice(PROTOCOL_STRING.as_bytes());
        dst.put_slice(&handshake.reserved);
        dst.put_slice(&handshake.info_hash);
        dst.put_slice(&handshake.peer_id);
        Ok(())
    }
}

/// The id of a peer wire message, the byte following the length prefix.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    HaveAll = 0x0d,
    HaveNone = 0x0e,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = ParseError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match id {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Piece),
            8 => Ok(Cancel),
            0x0d => Ok(HaveAll),
            0x0e => Ok(HaveNone),
            20 => Ok(Extended),
            id => Err(ParseError::UnknownMessageId(id)),
        }
    }
}

/// A framed peer wire message.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    /// A zero length frame; resets the peer's inactivity timer and nothing
    /// else.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    /// The peer's piece availability, as raw wire bytes since the piece
    /// count may not be known yet when the message arrives.
    Bitfield(Vec<u8>),
    Request(BlockInfo),
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    },
    Cancel(BlockInfo),
    /// Fast extension shorthand for a fully set bitfield.
    HaveAll,
    /// Fast extension shorthand for an empty bitfield.
    HaveNone,
    /// An extension protocol message; id 0 is the extended handshake, other
    /// ids are whatever the receiving side advertised for them.
    Extended {
        id: u8,
        payload: Bytes,
    },
}

impl Message {
    /// The message's wire id, if it has one (keep-alives don't).
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Piece { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::HaveAll => Some(MessageId::HaveAll),
            Self::HaveNone => Some(MessageId::HaveNone),
            Self::Extended { .. } => Some(MessageId::Extended),
        }
    }
}

/// Frames a message out of the receive buffer.
///
/// Returns `Ok(None)` while the buffer holds less than a full frame. A
/// length prefix above `max_frame_len` is a parse error: the length is
/// attacker controlled, and buffering an arbitrarily large frame would let a
/// single peer balloon our memory.
pub(crate) fn decode_message(
    buf: &mut ChunkedBuffer,
    max_frame_len: u32,
) -> Result<Option<Message>> {
    let frame_len = match buf.peek_u32_be(0) {
        Some(len) => len,
        None => return Ok(None),
    };
    if frame_len > max_frame_len {
        return Err(Error::Parse(ParseError::MessageTooLarge {
            len: frame_len,
            max: max_frame_len,
        }));
    }
    if frame_len == 0 {
        buf.discard(4);
        return Ok(Some(Message::KeepAlive));
    }
    let frame_len = frame_len as usize;
    if buf.len() < 4 + frame_len {
        return Ok(None);
    }

    buf.discard(4);
    // one copy into a contiguous frame; payload carrying messages hand out
    // zero-copy slices of it
    let frame = Bytes::from(
        buf.consume(frame_len).expect("frame length was checked"),
    );

    let id = MessageId::try_from(frame[0]).map_err(Error::Parse)?;
    let msg = match id {
        MessageId::Choke => expect_empty(&frame, Message::Choke)?,
        MessageId::Unchoke => expect_empty(&frame, Message::Unchoke)?,
        MessageId::Interested => expect_empty(&frame, Message::Interested)?,
        MessageId::NotInterested => {
            expect_empty(&frame, Message::NotInterested)?
        }
        MessageId::Have => Message::Have {
            piece_index: read_u32(&frame, 1)? as PieceIndex,
        },
        MessageId::Bitfield => Message::Bitfield(frame[1..].to_vec()),
        MessageId::Request => Message::Request(read_block_info(&frame)?),
        MessageId::Piece => {
            if frame.len() < 9 {
                return Err(Error::Parse(ParseError::TruncatedPayload));
            }
            Message::Piece {
                piece_index: read_u32(&frame, 1)? as PieceIndex,
                offset: read_u32(&frame, 5)?,
                data: frame.slice(9..),
            }
        }
        MessageId::Cancel => Message::Cancel(read_block_info(&frame)?),
        MessageId::HaveAll => expect_empty(&frame, Message::HaveAll)?,
        MessageId::HaveNone => expect_empty(&frame, Message::HaveNone)?,
        MessageId::Extended => {
            if frame.len() < 2 {
                return Err(Error::Parse(ParseError::TruncatedPayload));
            }
            Message::Extended {
                id: frame[1],
                payload: frame.slice(2..),
            }
        }
    };
    Ok(Some(msg))
}

fn expect_empty(frame: &Bytes, msg: Message) -> Result<Message> {
    if frame.len() != 1 {
        return Err(Error::Parse(ParseError::TruncatedPayload));
    }
    Ok(msg)
}

fn read_u32(frame: &Bytes, at: usize) -> Result<u32> {
    frame
        .get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(Error::Parse(ParseError::TruncatedPayload))
}

fn read_block_info(frame: &Bytes) -> Result<BlockInfo> {
    Ok(BlockInfo {
        piece_index: read_u32(frame, 1)? as PieceIndex,
        offset: read_u32(frame, 5)?,
        len: read_u32(frame, 9)?,
    })
}

/// Encodes messages into a session's write buffer.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                dst.put_u32(0);
            }
            Choke | Unchoke | Interested | NotInterested | HaveAll
            | HaveNone => {
                dst.put_u32(1);
                dst.put_u8(msg.id().expect("flag message has an id") as u8);
            }
            Have { piece_index } => {
                dst.put_u32(1 + 4);
                dst.put_u8(MessageId::Have as u8);
                dst.put_u32(piece_index as u32);
            }
            Bitfield(bytes) => {
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.put_slice(&bytes);
            }
            Request(block) => {
                dst.put_u32(1 + 3 * 4);
                dst.put_u8(MessageId::Request as u8);
                put_block_info(dst, &block);
            }
            Piece {
                piece_index,
                offset,
                data,
            } => {
                dst.put_u32(1 + 2 * 4 + data.len() as u32);
                dst.put_u8(MessageId::Piece as u8);
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.put_slice(&data);
            }
            Cancel(block) => {
                dst.put_u32(1 + 3 * 4);
                dst.put_u8(MessageId::Cancel as u8);
                put_block_info(dst, &block);
            }
            Extended { id, payload } => {
                dst.put_u32(1 + 1 + payload.len() as u32);
                dst.put_u8(MessageId::Extended as u8);
                dst.put_u8(id);
                dst.put_slice(&payload);
            }
        }
        Ok(())
    }
}

fn put_block_info(dst: &mut BytesMut, block: &BlockInfo) {
    dst.put_u32(block.piece_index as u32);
    dst.put_u32(block.offset);
    dst.put_u32(block.len);
}
