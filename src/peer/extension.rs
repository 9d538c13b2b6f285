//! Extension protocol payloads: the BEP 10 extended handshake and the BEP 9
//! metadata exchange messages.
//!
//! Extended message ids are negotiated per peer and per direction: we tell
//! the peer which ids we expect in our `m` dictionary, the peer tells us its
//! ids in its own. Outgoing metadata messages are therefore addressed with
//! the peer's advertised id, while incoming ones arrive under ours.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde_bytes::ByteBuf;

use crate::{
    error::{Error, ParseError, Result},
    metainfo::bencoded_value_len,
};

/// The extended message id of the extended handshake itself.
pub(crate) const EXT_HANDSHAKE_ID: u8 = 0;

/// The id under which we expect incoming ut_metadata messages.
pub(crate) const OUR_METADATA_ID: u8 = 1;

/// The metadata is exchanged in 16 KiB pieces, like torrent blocks.
pub(crate) const METADATA_PIECE_LEN: usize = 0x4000;

/// How many bytes of a peer's client name string are kept.
const CLIENT_NAME_CAP: usize = 64;

/// The bencoded dictionary sent right after the handshake by both sides of
/// an extension protocol capable connection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct ExtendedHandshake {
    /// Advertised by peers on a hybrid v1/v2 torrent. Its presence aborts
    /// the session: the peer's piece hashes would not align with ours.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info_hash2: Option<ByteBuf>,
    /// Maps sub-extension names to the ids the sender wants them addressed
    /// by.
    #[serde(default)]
    pub m: BTreeMap<String, u8>,
    /// The size of the info dictionary, sent by peers that have it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<i64>,
    /// The sender's client name and version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<ByteBuf>,
}

impl ExtendedHandshake {
    /// Builds our own extended handshake, advertising ut_metadata support
    /// and, once we have the info dictionary, its size.
    pub fn ours(metadata_size: Option<u64>) -> Self {
        let mut m = BTreeMap::new();
        m.insert("ut_metadata".to_string(), OUR_METADATA_ID);
        Self {
            info_hash2: None,
            m,
            metadata_size: metadata_size.map(|s| s as i64),
            v: Some(ByteBuf::from(
                concat!("tidetorrent ", env!("CARGO_PKG_VERSION")).as_bytes()
                    .to_vec(),
            )),
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        serde_bencode::from_bytes(buf)
            .map_err(|_| Error::Parse(ParseError::InvalidBencode))
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_bencode::to_bytes(self)
            .map(Bytes::from)
            .map_err(|_| Error::Parse(ParseError::InvalidBencode))
    }

    /// The id the peer wants ut_metadata messages addressed by.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.m.get("ut_metadata").copied().filter(|id| *id != 0)
    }

    /// The id the peer wants ut_pex messages addressed by.
    pub fn ut_pex_id(&self) -> Option<u8> {
        self.m.get("ut_pex").copied().filter(|id| *id != 0)
    }

    pub fn metadata_size(&self) -> Option<u64> {
        self.metadata_size.and_then(|s| {
            if s > 0 {
                Some(s as u64)
            } else {
                None
            }
        })
    }

    /// The peer's client name, capped at 64 bytes.
    pub fn client_name(&self) -> Option<String> {
        self.v.as_ref().map(|v| {
            let end = v.len().min(CLIENT_NAME_CAP);
            String::from_utf8_lossy(&v[..end]).into_owned()
        })
    }

    /// Whether the peer advertised a 32 byte v2 info hash.
    pub fn has_hybrid_hash(&self) -> bool {
        self.info_hash2
            .as_ref()
            .map(|h| h.len() == 32)
            .unwrap_or(false)
    }
}

/// The bencoded header prefixed to every ut_metadata message. In data
/// messages the raw metadata piece follows the header directly.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
struct MetadataHeader {
    msg_type: u8,
    piece: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_size: Option<i64>,
}

const MSG_REQUEST: u8 = 0;
const MSG_DATA: u8 = 1;
const MSG_REJECT: u8 = 2;

/// A decoded ut_metadata message (BEP 9).
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum MetadataMsg {
    Request { piece: u32 },
    Data {
        piece: u32,
        total_size: u64,
        data: Bytes,
    },
    Reject { piece: u32 },
}

impl MetadataMsg {
    /// Decodes a ut_metadata payload: the bencoded header, then, for data
    /// messages, the trailing raw piece.
    ///
    /// The header's end is found with a real bencode scan; matching on
    /// `msg_type`/`total_size` substrings would misparse headers whose byte
    /// strings happen to contain them.
    pub fn decode(payload: &Bytes) -> Result<Self> {
        let header_len = bencoded_value_len(payload)?;
        let header: MetadataHeader =
            serde_bencode::from_bytes(&payload[..header_len])
                .map_err(|_| Error::Parse(ParseError::InvalidBencode))?;
        match header.msg_type {
            MSG_REQUEST => Ok(Self::Request {
                piece: header.piece,
            }),
            MSG_DATA => {
                let total_size = match header.total_size {
                    Some(s) if s > 0 => s as u64,
                    _ => {
                        return Err(Error::Parse(ParseError::InvalidBencode))
                    }
                };
                Ok(Self::Data {
                    piece: header.piece,
                    total_size,
                    data: payload.slice(header_len..),
                })
            }
            MSG_REJECT => Ok(Self::Reject {
                piece: header.piece,
            }),
            _ => Err(Error::Parse(ParseError::InvalidBencode)),
        }
    }

    /// Encodes the message into the payload of an extended message.
    pub fn encode(&self) -> Result<Bytes> {
        let (header, data) = match self {
            Self::Request { piece } => (
                MetadataHeader {
                    msg_type: MSG_REQUEST,
                    piece: *piece,
                    total_size: None,
                },
                None,
            ),
            Self::Data {
                piece,
                total_size,
                data,
            } => (
                MetadataHeader {
                    msg_type: MSG_DATA,
                    piece: *piece,
                    total_size: Some(*total_size as i64),
                },
                Some(data),
            ),
            Self::Reject { piece } => (
                MetadataHeader {
                    msg_type: MSG_REJECT,
                    piece: *piece,
                    total_size: None,
                },
                None,
            ),
        };
        let mut buf = serde_bencode::to_bytes(&header)
            .map_err(|_| Error::Parse(ParseError::InvalidBencode))?;
        if let Some(data) = data {
            buf.extend_from_slice(data);
        }
        Ok(Bytes::from(buf))
    }
}
