//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The prefix of the client id announced to peers, followed by 16 random
/// ASCII digits.
pub const CLIENT_ID_PREFIX: &[u8; 4] = b"tdt-";

/// Generates a fresh client id: the client prefix followed by random digits.
pub fn gen_client_id() -> PeerId {
    use rand::Rng;
    let mut id = [0; 20];
    id[..4].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id[4..].iter_mut() {
        *b = rng.gen_range(b'0'..=b'9');
    }
    id
}

/// The global configuration for a torrent and all its parts.
///
/// The engine applies an instance of this to each torrent; individual
/// torrents may override it.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// The max number of peers unchoked for upload at any one time.
    pub max_unchoked_peer_count: usize,

    /// The number of candidate pieces asked of the piece picker in a single
    /// scheduling pass for one peer.
    pub max_picked_piece_count: usize,

    /// The request pipeline sizing applied to every peer session.
    pub pipeline: PipelineConf,

    /// How long an individual block request may stay unanswered before it is
    /// released and the block becomes requestable again.
    pub request_timeout: Duration,

    /// How long a partially downloaded piece may go without any activity
    /// before the stale piece collector considers discarding it.
    pub stale_piece_timeout: Duration,

    /// How often the stale piece collector runs.
    pub stale_piece_gc_interval: Duration,

    /// The number of hash failure strikes after which a contributing peer is
    /// banned for this torrent.
    pub strike_ban_threshold: u8,

    /// The largest wire message frame accepted from a peer. Chosen large
    /// enough for the bitfield of a very large torrent but small enough that
    /// a malicious length prefix cannot balloon the receive buffer.
    pub max_frame_len: u32,

    /// The adaptive connect timeout bounds.
    pub connect: ConnectConf,

    /// Bytes per second the torrent may upload, or `None` for unlimited.
    pub upload_rate_limit: Option<u64>,

    /// A session sends a keep-alive if it hasn't written anything to the
    /// socket for this long.
    pub keep_alive_interval: Duration,

    /// A peer is considered fast for piece affinity purposes if it is
    /// estimated to download a whole piece within this duration.
    pub fast_piece_threshold: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peer_count: 50,
            max_unchoked_peer_count: 8,
            max_picked_piece_count: 8,
            pipeline: PipelineConf::default(),
            request_timeout: Duration::from_secs(30),
            stale_piece_timeout: Duration::from_secs(30),
            stale_piece_gc_interval: Duration::from_secs(5),
            strike_ban_threshold: 2,
            max_frame_len: 2 * 1024 * 1024,
            connect: ConnectConf::default(),
            upload_rate_limit: None,
            keep_alive_interval: Duration::from_secs(120),
            fast_piece_threshold: Duration::from_secs(30),
        }
    }
}

/// The bounds and steps of the per-peer adaptive request pipeline.
#[derive(Clone, Copy, Debug)]
pub struct PipelineConf {
    /// The pipeline depth a session starts out with.
    pub initial_depth: usize,
    /// The hard lower bound, reachable only through congestion halving.
    pub min_depth: usize,
    /// The hard upper bound.
    pub max_depth: usize,
    /// How much the depth grows per second while the peer delivers above the
    /// raise rate.
    pub raise_step: usize,
    /// How much the depth shrinks per second while the peer delivers below
    /// the lower rate. Rate-based shrinking never goes below
    /// `initial_depth`; only a choke does.
    pub lower_step: usize,
    /// Blocks per second above which the depth is raised.
    pub raise_rate: u32,
    /// Blocks per second below which the depth is lowered.
    pub lower_rate: u32,
}

impl Default for PipelineConf {
    fn default() -> Self {
        Self {
            initial_depth: 50,
            min_depth: 5,
            max_depth: 500,
            raise_step: 50,
            lower_step: 10,
            raise_rate: 10,
            lower_rate: 2,
        }
    }
}

/// The bounds of the adaptive connect timeout, derived from the distribution
/// of observed connect times.
#[derive(Clone, Copy, Debug)]
pub struct ConnectConf {
    /// The timeout used until enough samples have been collected.
    pub default_timeout: Duration,
    /// The lower clamp of the derived timeout.
    pub min_timeout: Duration,
    /// The upper clamp of the derived timeout.
    pub max_timeout: Duration,
    /// How many successful connect durations are kept in the sliding window.
    pub sample_window: usize,
    /// How many samples are needed before the timeout is derived from them.
    pub min_sample_count: usize,
}

impl Default for ConnectConf {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            min_timeout: Duration::from_secs(3),
            max_timeout: Duration::from_secs(30),
            sample_window: 50,
            min_sample_count: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_shape() {
        let id = gen_client_id();
        assert_eq!(&id[..4], CLIENT_ID_PREFIX);
        assert!(id[4..].iter().all(|b| b.is_ascii_digit()));
    }
}
