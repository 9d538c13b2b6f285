//! Parsing of bencoded torrent metainfo.
//!
//! The info hash is computed over the raw bencoded info dictionary as it
//! appears in the source buffer, not over a re-serialization, so torrents
//! whose info dictionaries contain fields we don't model still hash
//! correctly.

use std::path::PathBuf;

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{
    error::{Error, ParseError, Result},
    FileInfo, InfoHash, Sha1Hash,
};

/// A parsed .torrent file, or an info dictionary fetched from peers.
#[derive(Debug)]
pub struct Metainfo {
    pub info: Info,
    /// The tracker announce URL, if any. Tracker announcing itself is the
    /// job of a peer source collaborator, not this engine.
    pub announce: Option<String>,
    pub announce_list: Option<Vec<Vec<String>>>,
    /// The raw bencoded info dictionary, kept to serve metadata requests.
    pub info_bytes: Vec<u8>,
    /// The SHA-1 digest of `info_bytes`.
    pub info_hash: InfoHash,
}

/// The info dictionary of a torrent.
///
/// Field order matters: bencoded dictionaries are sorted by key, and these
/// fields are declared in their bencoded key order.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_len: u32,
    pub pieces: ByteBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

/// One file entry of a multi file torrent.
#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    info: Info,
    #[serde(default)]
    announce: Option<String>,
    #[serde(default, rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    /// Parses a .torrent buffer.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)
            .map_err(|_| Error::Parse(ParseError::InvalidBencode))?;
        let info_bytes = raw_info_slice(buf)?.to_vec();
        let info_hash = sha1_digest(&info_bytes);
        let metainfo = Self {
            info: raw.info,
            announce: raw.announce,
            announce_list: raw.announce_list,
            info_bytes,
            info_hash,
        };
        metainfo.validate()?;
        Ok(metainfo)
    }

    /// Parses a bare info dictionary, e.g. one assembled from peers over the
    /// metadata extension.
    pub fn from_info_bytes(info_bytes: Vec<u8>) -> Result<Self> {
        let info: Info = serde_bencode::from_bytes(&info_bytes)
            .map_err(|_| Error::Parse(ParseError::InvalidBencode))?;
        let info_hash = sha1_digest(&info_bytes);
        let metainfo = Self {
            info,
            announce: None,
            announce_list: None,
            info_bytes,
            info_hash,
        };
        metainfo.validate()?;
        Ok(metainfo)
    }

    fn validate(&self) -> Result<()> {
        if self.info.piece_len == 0
            || self.info.pieces.len() % 20 != 0
            || self.info.pieces.is_empty()
        {
            return Err(Error::Parse(ParseError::InvalidBencode));
        }
        // exactly one of length (single file) and files (archive)
        if self.info.length.is_some() == self.info.files.is_some() {
            return Err(Error::Parse(ParseError::InvalidBencode));
        }
        let download_len = self.download_len();
        let expected_piece_count = (download_len + self.info.piece_len as u64
            - 1)
            / self.info.piece_len as u64;
        if expected_piece_count != self.piece_count() as u64 {
            return Err(Error::Parse(ParseError::InvalidBencode));
        }
        Ok(())
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// The expected SHA-1 digest of each piece.
    pub fn piece_hashes(&self) -> Vec<Sha1Hash> {
        self.info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect()
    }

    /// The sum of the length of all files in the torrent.
    pub fn download_len(&self) -> u64 {
        match (&self.info.length, &self.info.files) {
            (Some(len), _) => *len,
            (None, Some(files)) => files.iter().map(|f| f.length).sum(),
            (None, None) => 0,
        }
    }

    /// The torrent's files flattened into torrent order with their byte
    /// offsets. A single file torrent yields a one element list.
    pub fn files(&self) -> Vec<FileInfo> {
        match &self.info.files {
            Some(files) => {
                let mut offset = 0;
                files
                    .iter()
                    .map(|f| {
                        let info = FileInfo {
                            path: f.path.iter().collect::<PathBuf>(),
                            len: f.length,
                            torrent_offset: offset,
                        };
                        offset += f.length;
                        info
                    })
                    .collect()
            }
            None => vec![FileInfo {
                path: PathBuf::from(&self.info.name),
                len: self.info.length.unwrap_or_default(),
                torrent_offset: 0,
            }],
        }
    }
}

fn sha1_digest(buf: &[u8]) -> Sha1Hash {
    let digest = Sha1::digest(buf);
    let mut hash = [0; 20];
    hash.copy_from_slice(&digest);
    hash
}

/// Returns the raw bencoded info dictionary slice of a .torrent buffer.
fn raw_info_slice(buf: &[u8]) -> Result<&[u8]> {
    if buf.first() != Some(&b'd') {
        return Err(Error::Parse(ParseError::InvalidBencode));
    }
    let mut pos = 1;
    while buf.get(pos).map(|b| *b != b'e').unwrap_or(false) {
        let key_len = bencoded_value_len(&buf[pos..])?;
        let key = &buf[pos..pos + key_len];
        let value_start = pos + key_len;
        let value_len = bencoded_value_len(&buf[value_start..])?;
        if key == b"4:info" {
            return Ok(&buf[value_start..value_start + value_len]);
        }
        pos = value_start + value_len;
    }
    Err(Error::Parse(ParseError::InvalidBencode))
}

/// Returns the length of the first complete bencoded value in `buf`.
///
/// Used wherever a bencoded value is embedded in a larger buffer: slicing
/// the info dictionary out of a .torrent file and splitting the metadata
/// message header from its trailing piece data.
pub(crate) fn bencoded_value_len(buf: &[u8]) -> Result<usize> {
    fn malformed() -> Error {
        Error::Parse(ParseError::InvalidBencode)
    }
    fn value_end(buf: &[u8], at: usize) -> Result<usize> {
        match buf.get(at) {
            Some(b'i') => {
                let mut pos = at + 1;
                while *buf.get(pos).ok_or_else(malformed)? != b'e' {
                    pos += 1;
                }
                Ok(pos + 1)
            }
            Some(b'l') | Some(b'd') => {
                let mut pos = at + 1;
                // dictionary keys are themselves valid (string) values, so
                // one walk handles both containers
                while *buf.get(pos).ok_or_else(malformed)? != b'e' {
                    pos = value_end(buf, pos)?;
                }
                Ok(pos + 1)
            }
            Some(b'0'..=b'9') => {
                let mut pos = at;
                let mut len: usize = 0;
                while let Some(digit @ b'0'..=b'9') = buf.get(pos) {
                    len = len
                        .checked_mul(10)
                        .and_then(|l| l.checked_add((digit - b'0') as usize))
                        .ok_or_else(malformed)?;
                    pos += 1;
                }
                if buf.get(pos) != Some(&b':') {
                    return Err(malformed());
                }
                let end = pos + 1 + len;
                if end > buf.len() {
                    return Err(malformed());
                }
                Ok(end)
            }
            _ => Err(malformed()),
        }
    }
    value_end(buf, 0)
}
