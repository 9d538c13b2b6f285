//! The upload side: a validated queue of peer block requests drained under
//! a token bucket rate limit.
//!
//! The queue and bucket live here; the drain loop itself runs in the
//! torrent's event loop, where the peer states and the content storage are,
//! and re-checks every request against them right before sending.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::BlockInfo;

/// A peer's block request waiting to be served.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct QueuedRequest {
    pub peer: SocketAddr,
    pub block: BlockInfo,
    pub queued_at: Instant,
}

/// The upload queue and its rate limiter.
pub(crate) struct Uploader {
    queue: VecDeque<QueuedRequest>,
    pub bucket: TokenBucket,
    /// Guards the drain loop against re-entry: a drain suspends on storage
    /// reads and sends, and the events completing those must not start a
    /// second drain.
    draining: bool,
}

impl Uploader {
    pub fn new(rate_limit: Option<u64>, now: Instant) -> Self {
        Self {
            queue: VecDeque::new(),
            bucket: TokenBucket::new(rate_limit, now),
            draining: false,
        }
    }

    /// Appends a validated request, ignoring exact duplicates.
    pub fn push(&mut self, request: QueuedRequest) {
        let dup = self
            .queue
            .iter()
            .any(|q| q.peer == request.peer && q.block == request.block);
        if !dup {
            self.queue.push_back(request);
        }
    }

    /// Dequeues the oldest request.
    pub fn pop(&mut self) -> Option<QueuedRequest> {
        self.queue.pop_front()
    }

    /// Puts a request back at the front, e.g. when the rate limit refused
    /// it.
    pub fn push_front(&mut self, request: QueuedRequest) {
        self.queue.push_front(request);
    }

    /// Removes a cancelled request. Returns whether it was still queued.
    pub fn cancel(&mut self, peer: &SocketAddr, block: &BlockInfo) -> bool {
        let before = self.queue.len();
        self.queue.retain(|q| !(q.peer == *peer && q.block == *block));
        before != self.queue.len()
    }

    /// Drops every queued request of a disconnected peer.
    pub fn remove_peer(&mut self, peer: &SocketAddr) {
        self.queue.retain(|q| q.peer != *peer);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Marks the drain loop as running; returns false if it already is.
    pub fn try_begin_drain(&mut self) -> bool {
        if self.draining {
            return false;
        }
        self.draining = true;
        true
    }

    pub fn end_drain(&mut self) {
        debug_assert!(self.draining);
        self.draining = false;
    }
}

/// A token bucket: accumulates tokens at the configured rate, and sending
/// `n` bytes consumes `n` tokens.
pub(crate) struct TokenBucket {
    /// Bytes per second, or `None` for unlimited.
    rate: Option<u64>,
    /// The most tokens the bucket holds; accumulating beyond this would let
    /// an idle period turn into an arbitrarily large burst.
    capacity: u64,
    tokens: f64,
    last_refill: Instant,
}

/// The bucket always holds at least a few blocks' worth of tokens so that
/// even a tiny rate limit can eventually pass a full block.
const MIN_CAPACITY: u64 = 4 * crate::BLOCK_LEN as u64;

impl TokenBucket {
    pub fn new(rate: Option<u64>, now: Instant) -> Self {
        let capacity = Self::capacity_for(rate);
        Self {
            rate,
            capacity,
            // start full: the first requests after an unchoke go out
            // immediately
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    fn capacity_for(rate: Option<u64>) -> u64 {
        rate.map(|r| r.max(MIN_CAPACITY)).unwrap_or(u64::MAX)
    }

    /// Changes the rate, keeping the current token level (clamped to the
    /// new capacity).
    pub fn set_rate(&mut self, rate: Option<u64>, now: Instant) {
        self.refill(now);
        self.rate = rate;
        self.capacity = Self::capacity_for(rate);
        self.tokens = self.tokens.min(self.capacity as f64);
    }

    fn refill(&mut self, now: Instant) {
        if let Some(rate) = self.rate {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * rate as f64)
                .min(self.capacity as f64);
        }
        self.last_refill = now;
    }

    /// Takes `n` tokens if available; refuses (taking nothing) otherwise.
    pub fn try_consume(&mut self, n: u64, now: Instant) -> bool {
        if self.rate.is_none() {
            return true;
        }
        self.refill(now);
        if self.tokens >= n as f64 {
            self.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    /// How long until `n` tokens will have accumulated.
    pub fn duration_until_available(&self, n: u64, now: Instant) -> Duration {
        let rate = match self.rate {
            Some(rate) => rate,
            None => return Duration::from_secs(0),
        };
        let mut tokens = self.tokens;
        if let Some(rate) = self.rate {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            tokens = (tokens + elapsed * rate as f64).min(self.capacity as f64);
        }
        let missing = n as f64 - tokens;
        if missing <= 0.0 {
            return Duration::from_secs(0);
        }
        Duration::from_secs_f64(missing / rate as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;
    use pretty_assertions::assert_eq;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn block(piece: usize, offset: u32) -> BlockInfo {
        BlockInfo {
            piece_index: piece,
            offset,
            len: BLOCK_LEN,
        }
    }

    #[test]
    fn test_queue_is_fifo_and_dedupes() {
        let now = Instant::now();
        let mut uploader = Uploader::new(None, now);
        let first = QueuedRequest {
            peer: addr(1),
            block: block(0, 0),
            queued_at: now,
        };
        let second = QueuedRequest {
            peer: addr(2),
            block: block(0, 0),
            queued_at: now,
        };
        uploader.push(first);
        uploader.push(second);
        // the same peer re-requesting the same block is dropped
        uploader.push(first);

        assert_eq!(uploader.pop(), Some(first));
        assert_eq!(uploader.pop(), Some(second));
        assert_eq!(uploader.pop(), None);
    }

    #[test]
    fn test_cancel_and_peer_removal() {
        let now = Instant::now();
        let mut uploader = Uploader::new(None, now);
        for offset in [0, BLOCK_LEN, 2 * BLOCK_LEN] {
            uploader.push(QueuedRequest {
                peer: addr(1),
                block: block(0, offset),
                queued_at: now,
            });
        }
        uploader.push(QueuedRequest {
            peer: addr(2),
            block: block(1, 0),
            queued_at: now,
        });

        assert!(uploader.cancel(&addr(1), &block(0, BLOCK_LEN)));
        assert!(!uploader.cancel(&addr(1), &block(0, BLOCK_LEN)));

        uploader.remove_peer(&addr(1));
        let remaining = uploader.pop().unwrap();
        assert_eq!(remaining.peer, addr(2));
        assert!(uploader.is_empty());
    }

    #[test]
    fn test_drain_guard_is_not_reentrant() {
        let mut uploader = Uploader::new(None, Instant::now());
        assert!(uploader.try_begin_drain());
        assert!(!uploader.try_begin_drain());
        uploader.end_drain();
        assert!(uploader.try_begin_drain());
    }

    #[test]
    fn test_unlimited_bucket_always_allows() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(None, now);
        assert!(bucket.try_consume(u64::MAX / 2, now));
        assert_eq!(
            bucket.duration_until_available(u64::MAX / 2, now),
            Duration::from_secs(0)
        );
    }

    #[test]
    fn test_bucket_consumes_and_refills_at_rate() {
        let start = Instant::now();
        // plenty of capacity: 1 MiB/s
        let rate = 1024 * 1024;
        let mut bucket = TokenBucket::new(Some(rate), start);

        // the bucket starts full
        let mut spent = 0;
        while bucket.try_consume(BLOCK_LEN as u64, start) {
            spent += BLOCK_LEN as u64;
        }
        assert_eq!(spent, rate);

        // empty now; a block's worth takes 16ms at 1 MiB/s
        let wait = bucket.duration_until_available(BLOCK_LEN as u64, start);
        assert_eq!(wait.as_millis(), 15);

        // after half a second, half the bucket is back
        let later = start + Duration::from_millis(500);
        assert!(bucket.try_consume(rate / 2, later));
        assert!(!bucket.try_consume(BLOCK_LEN as u64, later));
    }

    #[test]
    fn test_tiny_rate_still_fits_a_block() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(Some(1024), start);
        // capacity is floored at a few blocks despite the 1 KiB/s rate
        assert!(bucket.try_consume(BLOCK_LEN as u64, start));
    }
}
