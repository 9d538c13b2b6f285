//! Fetching the info dictionary from peers (BEP 9).
//!
//! Used when a torrent is started from a magnet link: we know the info hash
//! but not the info dictionary. Every metadata capable peer gets its own
//! piece buffer, so a peer feeding us garbage only poisons its own copy and
//! the others can still complete.

use std::{collections::HashMap, net::SocketAddr};

use bytes::Bytes;
use sha1::{Digest, Sha1};

use crate::{
    error::{Error, ProtocolViolation, Result},
    peer::extension::METADATA_PIECE_LEN,
    InfoHash,
};

/// The progress made by a metadata data message.
#[derive(Debug, PartialEq)]
pub(crate) enum MetadataProgress {
    /// More pieces are still missing.
    InFlight,
    /// The assembled buffer hashed to the expected info hash.
    Complete(Bytes),
    /// The assembling peer's buffer hashed wrong and was discarded; other
    /// peers' buffers are unaffected.
    Mismatch,
}

/// Assembles the info dictionary from per peer piece buffers and verifies
/// it against the torrent's info hash.
pub(crate) struct MetadataFetcher {
    /// The expected digest of the complete metadata.
    info_hash: InfoHash,
    /// The metadata size established by the first peer; peers disagreeing
    /// with it are rejected.
    total_size: Option<u64>,
    /// Each peer's partially filled piece buffer.
    peers: HashMap<SocketAddr, Vec<Option<Bytes>>>,
    complete: bool,
}

impl MetadataFetcher {
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            total_size: None,
            peers: HashMap::new(),
            complete: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn metadata_size(&self) -> Option<u64> {
        self.total_size
    }

    /// The number of metadata pieces, once the size is known.
    fn piece_count(size: u64) -> usize {
        ((size as usize) + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN
    }

    /// The expected length of a metadata piece.
    fn piece_len(size: u64, piece: usize) -> usize {
        let start = piece * METADATA_PIECE_LEN;
        (size as usize - start).min(METADATA_PIECE_LEN)
    }

    /// Registers a peer that advertised the metadata extension and a size.
    ///
    /// The first such peer establishes the total size; a later peer
    /// announcing a different size has a different (or corrupt) dictionary
    /// and is rejected. Returns the piece indices to request from the peer,
    /// all at once, as metadata transfers are small enough to pipeline
    /// fully.
    pub fn register_peer(
        &mut self,
        addr: SocketAddr,
        metadata_size: u64,
    ) -> Result<Vec<u32>> {
        debug_assert!(!self.complete);
        match self.total_size {
            Some(size) if size != metadata_size => {
                log::warn!(
                    "Peer {} advertises metadata size {} instead of {}",
                    addr,
                    metadata_size,
                    size
                );
                return Err(Error::Protocol(
                    ProtocolViolation::MetadataSizeMismatch,
                ));
            }
            Some(_) => {}
            None => {
                log::info!("Metadata size established: {}", metadata_size);
                self.total_size = Some(metadata_size);
            }
        }

        let piece_count = Self::piece_count(metadata_size);
        self.peers.insert(addr, vec![None; piece_count]);
        Ok((0..piece_count as u32).collect())
    }

    /// Drops a peer's partial buffer, e.g. on disconnect.
    pub fn drop_peer(&mut self, addr: &SocketAddr) {
        self.peers.remove(addr);
    }

    /// Feeds a received metadata piece into the sending peer's buffer.
    ///
    /// When the peer's buffer is full it is assembled and hashed: a match
    /// completes the fetch and discards all buffers, a mismatch discards
    /// only this peer's buffer.
    pub fn on_data(
        &mut self,
        addr: SocketAddr,
        piece: u32,
        total_size: u64,
        data: Bytes,
    ) -> Result<MetadataProgress> {
        if self.complete {
            return Ok(MetadataProgress::InFlight);
        }
        let size = match self.total_size {
            Some(size) => size,
            None => return Ok(MetadataProgress::InFlight),
        };
        if total_size != size {
            return Err(Error::Protocol(
                ProtocolViolation::MetadataSizeMismatch,
            ));
        }
        let piece = piece as usize;
        let piece_count = Self::piece_count(size);
        if piece >= piece_count
            || data.len() != Self::piece_len(size, piece)
        {
            return Err(Error::Protocol(ProtocolViolation::OutOfRange));
        }

        let slots = match self.peers.get_mut(&addr) {
            Some(slots) => slots,
            // data from a peer we never registered; drop it
            None => return Ok(MetadataProgress::InFlight),
        };
        slots[piece] = Some(data);
        if slots.iter().any(|slot| slot.is_none()) {
            return Ok(MetadataProgress::InFlight);
        }

        // all slots filled: assemble and verify
        let mut buf = Vec::with_capacity(size as usize);
        for slot in slots.iter() {
            buf.extend_from_slice(
                slot.as_ref().expect("all slots were checked"),
            );
        }
        let digest = Sha1::digest(&buf);
        if digest.as_slice() == self.info_hash {
            log::info!("Metadata complete: {} bytes", buf.len());
            self.complete = true;
            self.peers.clear();
            Ok(MetadataProgress::Complete(Bytes::from(buf)))
        } else {
            log::warn!(
                "Metadata from peer {} hashes to {} instead of {}",
                addr,
                hex::encode(digest),
                hex::encode(&self.info_hash)
            );
            self.peers.remove(&addr);
            Ok(MetadataProgress::Mismatch)
        }
    }

    /// Serves a metadata request from our own copy of the info dictionary.
    /// Returns `None` for out of range pieces, which the caller answers
    /// with a reject.
    pub fn serve(info_bytes: &[u8], piece: u32) -> Option<Bytes> {
        let start = piece as usize * METADATA_PIECE_LEN;
        if start >= info_bytes.len() {
            return None;
        }
        let end = (start + METADATA_PIECE_LEN).min(info_bytes.len());
        Some(Bytes::copy_from_slice(&info_bytes[start..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn info_hash_of(buf: &[u8]) -> InfoHash {
        let digest = Sha1::digest(buf);
        let mut hash = [0; 20];
        hash.copy_from_slice(&digest);
        hash
    }

    /// 40000 bytes of metadata: pieces of 16384, 16384, and 7232 bytes.
    fn forty_k() -> Vec<u8> {
        (0..40000u32).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_assembles_and_verifies_across_three_pieces() {
        let metadata = forty_k();
        let mut fetcher = MetadataFetcher::new(info_hash_of(&metadata));
        let peer = addr(1);

        let to_request = fetcher.register_peer(peer, 40000).unwrap();
        assert_eq!(to_request, vec![0, 1, 2]);

        for piece in 0..3u32 {
            let start = piece as usize * METADATA_PIECE_LEN;
            let end = (start + METADATA_PIECE_LEN).min(metadata.len());
            let progress = fetcher
                .on_data(
                    peer,
                    piece,
                    40000,
                    Bytes::copy_from_slice(&metadata[start..end]),
                )
                .unwrap();
            if piece < 2 {
                assert_eq!(progress, MetadataProgress::InFlight);
                assert!(!fetcher.is_complete());
            } else {
                match progress {
                    MetadataProgress::Complete(buf) => {
                        assert_eq!(buf.len(), 40000);
                        assert_eq!(&buf[..], &metadata[..]);
                    }
                    other => panic!("expected completion, got {:?}", other),
                }
                assert!(fetcher.is_complete());
            }
        }
    }

    #[test]
    fn test_mismatch_discards_only_the_offending_peer() {
        let metadata = forty_k();
        let mut fetcher = MetadataFetcher::new(info_hash_of(&metadata));
        let (liar, honest) = (addr(1), addr(2));

        fetcher.register_peer(liar, 40000).unwrap();
        fetcher.register_peer(honest, 40000).unwrap();

        // the liar delivers garbage in all three pieces
        for piece in 0..3u32 {
            let len = MetadataFetcher::piece_len(40000, piece as usize);
            let progress = fetcher
                .on_data(liar, piece, 40000, Bytes::from(vec![0xff; len]))
                .unwrap();
            if piece == 2 {
                assert_eq!(progress, MetadataProgress::Mismatch);
            }
        }
        assert!(!fetcher.is_complete());

        // the honest peer still completes
        for piece in 0..3u32 {
            let start = piece as usize * METADATA_PIECE_LEN;
            let end = (start + METADATA_PIECE_LEN).min(metadata.len());
            let progress = fetcher
                .on_data(
                    honest,
                    piece,
                    40000,
                    Bytes::copy_from_slice(&metadata[start..end]),
                )
                .unwrap();
            if piece == 2 {
                assert!(matches!(progress, MetadataProgress::Complete(_)));
            }
        }
        assert!(fetcher.is_complete());
    }

    #[test]
    fn test_conflicting_size_is_rejected() {
        let mut fetcher = MetadataFetcher::new([0; 20]);
        fetcher.register_peer(addr(1), 40000).unwrap();
        assert!(matches!(
            fetcher.register_peer(addr(2), 39999),
            Err(Error::Protocol(ProtocolViolation::MetadataSizeMismatch))
        ));
    }

    #[test]
    fn test_out_of_range_and_bad_length_pieces_are_rejected() {
        let mut fetcher = MetadataFetcher::new([0; 20]);
        let peer = addr(1);
        fetcher.register_peer(peer, 40000).unwrap();

        assert!(fetcher
            .on_data(peer, 3, 40000, Bytes::from(vec![0; 16]))
            .is_err());
        // piece 0 must be exactly 16384 bytes
        assert!(fetcher
            .on_data(peer, 0, 40000, Bytes::from(vec![0; 100]))
            .is_err());
    }

    #[test]
    fn test_serving_slices() {
        let info: Vec<u8> = (0..20000u32).map(|i| (i % 256) as u8).collect();
        let piece0 = MetadataFetcher::serve(&info, 0).unwrap();
        assert_eq!(piece0.len(), METADATA_PIECE_LEN);
        assert_eq!(&piece0[..], &info[..METADATA_PIECE_LEN]);
        let piece1 = MetadataFetcher::serve(&info, 1).unwrap();
        assert_eq!(piece1.len(), 20000 - METADATA_PIECE_LEN);
        assert_eq!(MetadataFetcher::serve(&info, 2), None);
    }
}
