//! Block level bookkeeping for pieces that are being downloaded.
//!
//! Every in-flight piece keeps, per block, the received data, the peer that
//! supplied it, and the list of peers with live requests for it. Requests
//! carry the requesting peer's id because several peers may request the same
//! block near completion, and a disconnecting peer must only release its own
//! outstanding work.

use std::{
    collections::HashSet,
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::{block_count, block_len, PieceIndex};

/// A block request attributed to the peer that issued it.
#[derive(Clone, Copy, Debug)]
struct BlockRequest {
    peer: SocketAddr,
    requested_at: Instant,
}

/// The outcome of registering a received block.
#[derive(Debug)]
pub(crate) struct AddBlock {
    /// False if the block was already present; duplicate data is dropped
    /// without penalty since a cancelled request may legitimately still be
    /// answered.
    pub added: bool,
    /// The peers whose live requests for this block were cleared, in request
    /// order. Near completion these are the peers that get a CANCEL.
    pub cleared_requests: Vec<SocketAddr>,
}

/// Block level state of a piece being downloaded.
pub(crate) struct PieceDownload {
    /// The piece's index in the torrent.
    index: PieceIndex,
    /// The piece's length in bytes.
    len: u32,
    /// The piece sized scratch buffer, leased from the torrent's
    /// [`BufferPool`] and returned there when the piece is disposed of.
    buf: Vec<u8>,
    /// Whether the block at each index has been received into `buf`.
    received: Vec<bool>,
    /// The peer that supplied each received block, for blame on a failed
    /// hash check.
    senders: Vec<Option<SocketAddr>>,
    /// The live requests per block.
    requests: Vec<Vec<BlockRequest>>,
    received_count: usize,
    /// The number of payload bytes buffered so far.
    buffered_bytes: usize,
    /// When a peer was fast enough to be made the sole requester of this
    /// piece, other peers stay away from it until near completion.
    pub exclusive_peer: Option<SocketAddr>,
    /// Refreshed on every request and received block; drives stale piece
    /// collection.
    last_activity: Instant,
}

impl PieceDownload {
    /// Creates the block state for a piece, taking ownership of a piece
    /// sized buffer.
    pub fn new(index: PieceIndex, len: u32, buf: Vec<u8>, now: Instant) -> Self {
        debug_assert_eq!(buf.len(), len as usize);
        let blocks = block_count(len);
        Self {
            index,
            len,
            buf,
            received: vec![false; blocks],
            senders: vec![None; blocks],
            requests: vec![Vec::new(); blocks],
            received_count: 0,
            buffered_bytes: 0,
            exclusive_peer: None,
            last_activity: now,
        }
    }

    pub fn index(&self) -> PieceIndex {
        self.index
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn block_count(&self) -> usize {
        self.received.len()
    }

    /// The length of the block at the given index; only the last block of an
    /// uneven piece is shorter than the canonical block length.
    pub fn block_len(&self, block: usize) -> u32 {
        block_len(self.len, block)
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn has_block(&self, block: usize) -> bool {
        self.received[block]
    }

    pub fn have_all_blocks(&self) -> bool {
        self.received_count == self.received.len()
    }

    /// Whether any peer has a live request for the block.
    pub fn is_block_requested(&self, block: usize) -> bool {
        !self.requests[block].is_empty()
    }

    /// Whether the given peer has a live request for the block.
    pub fn is_block_requested_by(&self, block: usize, peer: &SocketAddr) -> bool {
        self.requests[block].iter().any(|r| r.peer == *peer)
    }

    /// Records that the block was requested from the peer.
    pub fn add_request(&mut self, block: usize, peer: SocketAddr, now: Instant) {
        debug_assert!(block < self.block_count());
        debug_assert!(!self.received[block]);
        self.requests[block].push(BlockRequest {
            peer,
            requested_at: now,
        });
        self.last_activity = now;
    }

    /// Registers a received block, storing its data and clearing every live
    /// request for it.
    ///
    /// Returns `added: false` for a block that is already present; the
    /// duplicate is ignored.
    pub fn add_block(
        &mut self,
        block: usize,
        data: &[u8],
        peer: SocketAddr,
        now: Instant,
    ) -> AddBlock {
        debug_assert!(block < self.block_count());
        debug_assert_eq!(data.len() as u32, self.block_len(block));

        if self.received[block] {
            return AddBlock {
                added: false,
                cleared_requests: Vec::new(),
            };
        }

        let offset = block * crate::BLOCK_LEN as usize;
        self.buf[offset..offset + data.len()].copy_from_slice(data);
        self.received[block] = true;
        self.senders[block] = Some(peer);
        self.received_count += 1;
        self.buffered_bytes += data.len();
        self.last_activity = now;

        let cleared_requests = self.requests[block]
            .drain(..)
            .map(|r| r.peer)
            .collect();
        AddBlock {
            added: true,
            cleared_requests,
        }
    }

    /// Releases every live request the peer holds on this piece, making
    /// those blocks requestable again. Returns how many were cleared.
    pub fn clear_requests_for_peer(&mut self, peer: &SocketAddr) -> usize {
        let mut cleared = 0;
        for requests in self.requests.iter_mut() {
            let before = requests.len();
            requests.retain(|r| r.peer != *peer);
            cleared += before - requests.len();
        }
        cleared
    }

    /// Releases every request older than the timeout. Returns the owners of
    /// the cleared requests so the scheduler can give them pipeline slots
    /// back.
    pub fn check_timeouts(
        &mut self,
        timeout: Duration,
        now: Instant,
    ) -> Vec<SocketAddr> {
        let mut cleared = Vec::new();
        for requests in self.requests.iter_mut() {
            requests.retain(|r| {
                if now.duration_since(r.requested_at) > timeout {
                    cleared.push(r.peer);
                    false
                } else {
                    true
                }
            });
        }
        cleared
    }

    /// The blocks with no data and no live request, in order, up to `max`.
    pub fn needed_blocks(&self, max: usize) -> Vec<usize> {
        (0..self.block_count())
            .filter(|b| !self.received[*b] && self.requests[*b].is_empty())
            .take(max)
            .collect()
    }

    /// The blocks that are requested but not yet received; near completion
    /// these become requestable from additional peers.
    pub fn requested_but_not_received_blocks(&self) -> Vec<usize> {
        (0..self.block_count())
            .filter(|b| !self.received[*b] && !self.requests[*b].is_empty())
            .collect()
    }

    /// The peers holding a live request for the block.
    pub fn requesters(&self, block: usize) -> Vec<SocketAddr> {
        self.requests[block].iter().map(|r| r.peer).collect()
    }

    /// The set of peers that supplied at least one block; after a failed
    /// hash check each of them is a suspect.
    pub fn contributing_peers(&self) -> HashSet<SocketAddr> {
        self.senders.iter().filter_map(|s| *s).collect()
    }

    /// The piece's bytes, available once every block has been received.
    pub fn assemble(&self) -> Option<&[u8]> {
        if !self.have_all_blocks() {
            return None;
        }
        Some(&self.buf)
    }

    /// Tears the piece down, handing the scratch buffer back for reuse.
    pub fn into_buf(self) -> Vec<u8> {
        self.buf
    }
}

/// Recycles piece sized scratch buffers between piece downloads.
///
/// Every buffer leased at piece creation comes back exactly once, whether
/// the piece verified, failed its hash check, went stale, or was
/// blacklisted.
pub(crate) struct BufferPool {
    free: Vec<Vec<u8>>,
    /// How many buffers are kept around; the rest are dropped on release.
    cap: usize,
}

const DEFAULT_POOL_CAP: usize = 32;

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            cap: DEFAULT_POOL_CAP,
        }
    }

    /// Leases a zeroed buffer of the given length.
    pub fn acquire(&mut self, len: usize) -> Vec<u8> {
        match self.free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf.resize(len, 0);
                buf
            }
            None => vec![0; len],
        }
    }

    /// Returns a leased buffer to the pool.
    pub fn release(&mut self, buf: Vec<u8>) {
        if self.free.len() < self.cap {
            self.free.push(buf);
        }
    }

    /// Drops all pooled buffers, e.g. on shutdown.
    pub fn drain(&mut self) {
        self.free.clear();
    }

    #[cfg(test)]
    fn pooled_count(&self) -> usize {
        self.free.len()
    }
}
