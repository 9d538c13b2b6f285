//! The per torrent orchestrator: owns all peers and active pieces, drives
//! the piece picker, verifies and persists completed pieces, and serves
//! uploads.
//!
//! Everything here runs on one task. Peer sessions publish events into a
//! single channel that is consumed serially, so no orchestrator state is
//! ever observed mid-mutation; the suspension points are all at storage and
//! channel boundaries.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::{select, stream::Fuse, StreamExt};
use sha1::{Digest, Sha1};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task, time,
};

use crate::{
    conf::TorrentConf,
    counter::ThruputCounters,
    download::{BufferPool, PieceDownload},
    error::{Error, ProtocolViolation, Result},
    file_priority::{FilePriorities, FilePriority},
    metadata::{MetadataFetcher, MetadataProgress},
    metainfo::Metainfo,
    peer::{
        CommandSender, EventReceiver, EventSender, PeerEvent, PeerSession,
        Pipeline, SessionCommand, SessionContext,
    },
    piece_picker::{pick_pieces, PickContext},
    storage::ContentStorage,
    storage_info::StorageInfo,
    uploader::{QueuedRequest, Uploader},
    Bitfield, BlockInfo, FileIndex, InfoHash, PeerId, PieceIndex, Sha1Hash,
    BLOCK_LEN,
};

/// Creates the content storage for a torrent once its file layout is known,
/// which for metadata-less (magnet) torrents is only after the metadata
/// fetch completes.
pub type StorageFactory = Box<
    dyn FnMut(&StorageInfo) -> std::io::Result<Box<dyn ContentStorage>>
        + Send,
>;

/// The commands a torrent accepts from its owner.
pub enum TorrentCommand {
    /// Connect out to a peer address from a peer source.
    AddPeer(SocketAddr),
    /// Adopt an already accepted incoming connection.
    AddIncomingPeer(TcpStream, SocketAddr),
    SetFilePriority {
        file: FileIndex,
        priority: FilePriority,
    },
    SetUploadRateLimit(Option<u64>),
    /// Snapshot the state the session layer persists between runs.
    RequestResumeState(oneshot::Sender<ResumeState>),
    Shutdown,
}

/// What a torrent reports to its owner.
#[derive(Debug)]
pub enum TorrentAlert {
    /// The info dictionary was fetched from peers and verified.
    MetadataComplete { metadata_size: u64 },
    PieceCompleted { index: PieceIndex },
    /// Every wanted (non skipped) piece is downloaded and verified.
    DownloadComplete,
    /// A peer accumulated too many hash failure strikes.
    PeerBanned { addr: SocketAddr },
    /// A piece could not be persisted; it will be re-downloaded.
    StorageError { index: PieceIndex },
}

/// The per torrent state handed to the session persistence collaborator.
#[derive(Clone, Debug, Default)]
pub struct ResumeState {
    /// Our piece bitfield, in wire byte order.
    pub bitfield: Vec<u8>,
    pub uploaded: u64,
    pub downloaded: u64,
    /// The raw info dictionary, if known.
    pub info: Option<Vec<u8>>,
}

/// The parameters a torrent is created with.
pub struct TorrentParams {
    /// The torrent's identity. Required when starting without metainfo.
    pub info_hash: InfoHash,
    pub client_id: PeerId,
    pub conf: TorrentConf,
    /// The parsed metainfo, or `None` to fetch it from peers (BEP 9).
    pub metainfo: Option<Metainfo>,
    pub storage: StorageFactory,
    pub resume: Option<ResumeState>,
}

/// Everything that only exists once the info dictionary is known.
struct TorrentContext {
    storage_info: StorageInfo,
    piece_hashes: Vec<Sha1Hash>,
    /// The raw info dictionary, served to peers over the metadata
    /// extension.
    info_bytes: Vec<u8>,
    own_pieces: Bitfield,
    priorities: FilePriorities,
    /// Per piece count of non seed peers that have it.
    availability: Vec<usize>,
    /// Peers with a full bitfield; they don't contribute to
    /// `availability`.
    seed_count: usize,
    /// The pieces currently being downloaded.
    active: HashMap<PieceIndex, PieceDownload>,
    storage: Box<dyn ContentStorage>,
    /// Near completion, block requests are duplicated across peers and the
    /// loser of each race gets a CANCEL.
    endgame: bool,
    /// Set once the completion alert has been emitted.
    complete: bool,
}

/// The orchestrator's record of one peer.
struct Peer {
    cmd: CommandSender,
    /// Mirror of the peer's piece availability, fed by its session's
    /// bitfield and (already deduplicated) HAVE events.
    pieces: Option<Bitfield>,
    /// Whether this peer is counted in `seed_count` rather than in the per
    /// piece availability.
    counted_as_seed: bool,
    peer_choking: bool,
    peer_interested: bool,
    am_choking: bool,
    am_interested: bool,
    pipeline: Pipeline,
    /// Requests in flight to this peer; bounded by the pipeline depth.
    outstanding: usize,
    counters: ThruputCounters,
    /// Hash failure strikes; reaching the ban threshold disconnects and
    /// bans the peer for this torrent.
    strikes: u8,
    peer_id: Option<PeerId>,
    metadata_id: Option<u8>,
    metadata_size: Option<u64>,
    pex_id: Option<u8>,
    client: Option<String>,
    connected_at: Instant,
}

impl Peer {
    fn new(cmd: CommandSender, pipeline: Pipeline, now: Instant) -> Self {
        Self {
            cmd,
            pieces: None,
            counted_as_seed: false,
            peer_choking: true,
            peer_interested: false,
            am_choking: true,
            am_interested: false,
            pipeline,
            outstanding: 0,
            counters: ThruputCounters::default(),
            strikes: 0,
            peer_id: None,
            metadata_id: None,
            metadata_size: None,
            pex_id: None,
            client: None,
            connected_at: now,
        }
    }
}

/// A torrent's download/seed engine; see the module docs.
pub struct Torrent {
    conf: TorrentConf,
    info_hash: InfoHash,
    client_id: PeerId,
    storage_factory: StorageFactory,
    /// `None` until the info dictionary is known.
    ctx: Option<TorrentContext>,
    /// Present while the metadata is being fetched from peers.
    metadata: Option<MetadataFetcher>,
    peers: HashMap<SocketAddr, Peer>,
    banned: HashSet<IpAddr>,
    /// The channel all peer sessions publish into; the sender side is
    /// cloned into every spawned session.
    events_tx: EventSender,
    events_rx: Fuse<EventReceiver>,
    cmd_port: Fuse<UnboundedReceiver<TorrentCommand>>,
    alerts: UnboundedSender<TorrentAlert>,
    uploader: Uploader,
    /// Wakes the event loop to resume draining uploads after the rate
    /// limit refused a block.
    upload_wake_tx: UnboundedSender<()>,
    upload_wake_rx: Fuse<UnboundedReceiver<()>>,
    timing: crate::timing::ConnectTimes,
    counters: ThruputCounters,
    pool: BufferPool,
    /// Seconds since the torrent started, for the stale piece GC cadence.
    ticks: u64,
}

impl Torrent {
    /// Creates a torrent engine, returning its command channel and alert
    /// port alongside. Run it with [`Torrent::start`].
    pub fn new(
        params: TorrentParams,
    ) -> Result<(
        Self,
        UnboundedSender<TorrentCommand>,
        UnboundedReceiver<TorrentAlert>,
    )> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (alerts, alert_port) = mpsc::unbounded_channel();
        let (upload_wake_tx, upload_wake_rx) = mpsc::unbounded_channel();

        let now = Instant::now();
        let TorrentParams {
            info_hash,
            client_id,
            conf,
            metainfo,
            storage,
            resume,
        } = params;

        // a resume snapshot can stand in for the metainfo
        let metainfo = match metainfo {
            Some(metainfo) => Some(metainfo),
            None => match resume.as_ref().and_then(|r| r.info.clone()) {
                Some(info) => Some(Metainfo::from_info_bytes(info)?),
                None => None,
            },
        };

        let info_hash = metainfo
            .as_ref()
            .map(|m| m.info_hash)
            .unwrap_or(info_hash);

        let mut torrent = Self {
            metadata: if metainfo.is_none() {
                Some(MetadataFetcher::new(info_hash))
            } else {
                None
            },
            info_hash,
            client_id,
            storage_factory: storage,
            ctx: None,
            peers: HashMap::new(),
            banned: HashSet::new(),
            events_tx,
            events_rx: events_rx.fuse(),
            cmd_port: cmd_port.fuse(),
            alerts,
            uploader: Uploader::new(conf.upload_rate_limit, now),
            upload_wake_tx,
            upload_wake_rx: upload_wake_rx.fuse(),
            timing: crate::timing::ConnectTimes::new(conf.connect),
            counters: ThruputCounters::default(),
            pool: BufferPool::new(),
            ticks: 0,
            conf,
        };

        if let Some(metainfo) = metainfo {
            torrent.init_context(metainfo, resume.as_ref())?;
        }

        Ok((torrent, cmd_chan, alert_port))
    }

    /// Opens storage and builds all the piece level state; called at
    /// construction when the metainfo is known, or when the metadata fetch
    /// completes.
    fn init_context(
        &mut self,
        metainfo: Metainfo,
        resume: Option<&ResumeState>,
    ) -> Result<()> {
        debug_assert!(self.ctx.is_none());
        let storage_info =
            StorageInfo::new(&metainfo, self.conf.download_dir.clone());
        log::info!(
            "Torrent {} has {} pieces of {} bytes",
            hex::encode(&self.info_hash),
            storage_info.piece_count,
            storage_info.piece_len,
        );

        let storage = (self.storage_factory)(&storage_info)
            .map_err(Error::Storage)?;

        let own_pieces = resume
            .and_then(|r| {
                Bitfield::from_bytes(&r.bitfield, storage_info.piece_count)
            })
            .unwrap_or_else(|| Bitfield::new(storage_info.piece_count));
        if let Some(resume) = resume {
            self.counters.up.add(resume.uploaded);
            self.counters.down.add(resume.downloaded);
            self.counters.tick();
        }

        let piece_count = storage_info.piece_count;
        self.ctx = Some(TorrentContext {
            priorities: FilePriorities::new(storage_info.clone()),
            piece_hashes: metainfo.piece_hashes(),
            info_bytes: metainfo.info_bytes,
            complete: own_pieces.is_all_set(),
            own_pieces,
            availability: vec![0; piece_count],
            seed_count: 0,
            active: HashMap::new(),
            storage,
            endgame: false,
            storage_info,
        });
        Ok(())
    }

    /// Runs the torrent until it is shut down.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting torrent {}", hex::encode(&self.info_hash));
        let mut tick = time::interval(Duration::from_secs(1)).fuse();

        loop {
            select! {
                event = self.events_rx.select_next_some() => {
                    let (addr, event) = event;
                    if let Err(e) = self.handle_peer_event(addr, event).await {
                        if e.is_peer_local() {
                            // contained at the offending peer
                            log::info!("Disconnecting peer {}: {}", addr, e);
                            self.disconnect_peer(&addr);
                        } else {
                            return Err(e);
                        }
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    if !self.handle_cmd(cmd).await? {
                        break;
                    }
                }
                _ = self.upload_wake_rx.select_next_some() => {
                    self.drain_uploads().await?;
                }
                _ = tick.select_next_some() => {
                    self.tick().await?;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    async fn handle_cmd(&mut self, cmd: TorrentCommand) -> Result<bool> {
        match cmd {
            TorrentCommand::AddPeer(addr) => self.connect_to_peer(addr),
            TorrentCommand::AddIncomingPeer(socket, addr) => {
                self.accept_peer(socket, addr)
            }
            TorrentCommand::SetFilePriority { file, priority } => {
                if let Err(e) = self.set_file_priority(file, priority) {
                    log::warn!(
                        "Cannot set file {} priority to {:?}: {}",
                        file,
                        priority,
                        e
                    );
                }
            }
            TorrentCommand::SetUploadRateLimit(limit) => {
                log::info!("Upload rate limit set to {:?}", limit);
                self.uploader.bucket.set_rate(limit, Instant::now());
            }
            TorrentCommand::RequestResumeState(reply) => {
                let _ = reply.send(self.resume_state());
            }
            TorrentCommand::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    /// Spawns an outbound session, applying the adaptive connect timeout.
    fn connect_to_peer(&mut self, addr: SocketAddr) {
        if !self.may_add_peer(&addr) {
            return;
        }
        let (session, cmd) = PeerSession::outbound(
            self.session_context(addr),
            self.events_tx.clone(),
        );
        task::spawn(session.start());
        self.register_peer(addr, cmd);
    }

    /// Adopts an accepted incoming connection.
    fn accept_peer(&mut self, socket: TcpStream, addr: SocketAddr) {
        if !self.may_add_peer(&addr) {
            return;
        }
        let (session, cmd) = PeerSession::inbound(
            self.session_context(addr),
            self.events_tx.clone(),
            socket,
        );
        task::spawn(session.start());
        self.register_peer(addr, cmd);
    }

    fn may_add_peer(&self, addr: &SocketAddr) -> bool {
        if self.banned.contains(&addr.ip()) {
            log::info!("Not adding banned peer {}", addr);
            false
        } else if self.peers.contains_key(addr) {
            log::debug!("Peer {} already connected", addr);
            false
        } else if self.peers.len() >= self.conf.max_connected_peer_count {
            log::debug!("Torrent peer limit reached, not adding {}", addr);
            false
        } else {
            true
        }
    }

    fn session_context(&self, addr: SocketAddr) -> SessionContext {
        SessionContext {
            addr,
            info_hash: self.info_hash,
            client_id: self.client_id,
            piece_count: self
                .ctx
                .as_ref()
                .map(|ctx| ctx.storage_info.piece_count),
            metadata_size: self
                .ctx
                .as_ref()
                .map(|ctx| ctx.info_bytes.len() as u64),
            max_frame_len: self.conf.max_frame_len,
            keep_alive_interval: self.conf.keep_alive_interval,
            connect_timeout: self.timing.timeout(),
        }
    }

    fn register_peer(&mut self, addr: SocketAddr, cmd: CommandSender) {
        let peer =
            Peer::new(cmd, Pipeline::new(self.conf.pipeline), Instant::now());
        self.peers.insert(addr, peer);
    }

    /// Asks a session to shut down; its state is cleaned up when its final
    /// `Closed` event arrives.
    fn disconnect_peer(&mut self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.get(addr) {
            let _ = peer.cmd.send(SessionCommand::Shutdown);
        }
    }

    async fn handle_peer_event(
        &mut self,
        addr: SocketAddr,
        event: PeerEvent,
    ) -> Result<()> {
        // events may trail behind a removed peer; drop them
        if !self.peers.contains_key(&addr)
            && !matches!(event, PeerEvent::Closed)
        {
            return Ok(());
        }

        match event {
            PeerEvent::Connected { elapsed } => {
                self.timing.record_success(elapsed);
            }
            PeerEvent::ConnectFailed { timed_out } => {
                if timed_out {
                    self.timing.record_timeout();
                }
            }
            PeerEvent::HandshakeDone { peer_id, .. } => {
                self.on_handshake_done(addr, peer_id)?;
            }
            PeerEvent::ExtendedHandshake {
                metadata_id,
                metadata_size,
                pex_id,
                client,
            } => {
                self.on_extended_handshake(
                    addr,
                    metadata_id,
                    metadata_size,
                    pex_id,
                    client,
                )?;
            }
            PeerEvent::Bitfield(pieces) => {
                self.on_peer_bitfield(addr, pieces)?;
            }
            PeerEvent::Have(index) => self.on_peer_have(addr, index)?,
            PeerEvent::Choked => self.on_peer_choked(addr),
            PeerEvent::Unchoked => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    log::info!("Peer {} unchoked us", addr);
                    peer.peer_choking = false;
                }
                self.schedule_peer(addr)?;
            }
            PeerEvent::Interested => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_interested = true;
                }
                self.update_peer_choking(addr)?;
            }
            PeerEvent::NotInterested => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_interested = false;
                }
            }
            PeerEvent::Request(block) => {
                self.on_peer_request(addr, block).await?;
            }
            PeerEvent::Cancel(block) => {
                self.uploader.cancel(&addr, &block);
            }
            PeerEvent::Block { block, data } => {
                self.on_block(addr, block, data).await?;
            }
            PeerEvent::MetadataRequest { piece } => {
                self.on_metadata_request(addr, piece)?;
            }
            PeerEvent::MetadataData {
                piece,
                total_size,
                data,
            } => {
                self.on_metadata_data(addr, piece, total_size, data)?;
            }
            PeerEvent::MetadataReject { piece } => {
                log::info!(
                    "Peer {} rejected metadata request {}",
                    addr,
                    piece
                );
            }
            PeerEvent::Closed => self.on_peer_closed(addr),
        }
        Ok(())
    }

    fn on_handshake_done(
        &mut self,
        addr: SocketAddr,
        peer_id: PeerId,
    ) -> Result<()> {
        let own_pieces = self
            .ctx
            .as_ref()
            .map(|ctx| ctx.own_pieces.clone());
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.peer_id = Some(peer_id);
            // announce what we have; without metainfo there is nothing to
            // say yet
            if let Some(own_pieces) = own_pieces {
                let _ = peer
                    .cmd
                    .send(SessionCommand::AnnouncePieces(own_pieces));
            }
        }
        Ok(())
    }

    fn on_extended_handshake(
        &mut self,
        addr: SocketAddr,
        metadata_id: Option<u8>,
        metadata_size: Option<u64>,
        pex_id: Option<u8>,
        client: Option<String>,
    ) -> Result<()> {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.metadata_id = metadata_id;
            peer.metadata_size = metadata_size;
            peer.pex_id = pex_id;
            if let Some(client) = &client {
                log::info!("Peer {} is {}", addr, client);
            }
            peer.client = client;
        }

        // if we're still after the metadata, pipeline requests for all of
        // it to this peer
        if self.ctx.is_none() {
            if let (Some(fetcher), Some(_), Some(size)) =
                (self.metadata.as_mut(), metadata_id, metadata_size)
            {
                match fetcher.register_peer(addr, size) {
                    Ok(pieces) => {
                        if let Some(peer) = self.peers.get(&addr) {
                            for piece in pieces {
                                let _ = peer.cmd.send(
                                    SessionCommand::MetadataRequest(piece),
                                );
                            }
                        }
                    }
                    Err(e) => {
                        log::info!(
                            "Disconnecting peer {}: {}",
                            addr,
                            e
                        );
                        self.disconnect_peer(&addr);
                    }
                }
            }
        }
        Ok(())
    }

    fn on_peer_bitfield(
        &mut self,
        addr: SocketAddr,
        pieces: Bitfield,
    ) -> Result<()> {
        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            // sessions only emit bitfields once the piece count is known
            None => return Ok(()),
        };
        if pieces.len() != ctx.storage_info.piece_count {
            return Err(Error::Protocol(
                ProtocolViolation::OutOfRange,
            ));
        }

        let peer = match self.peers.get_mut(&addr) {
            Some(peer) => peer,
            None => return Ok(()),
        };
        debug_assert!(peer.pieces.is_none());

        log::info!(
            "Peer {} has {}/{} pieces",
            addr,
            pieces.count(),
            pieces.len()
        );
        if pieces.is_all_set() {
            peer.counted_as_seed = true;
            ctx.seed_count += 1;
        } else {
            for index in pieces.iter_set() {
                ctx.availability[index] += 1;
            }
        }
        peer.pieces = Some(pieces);

        self.update_interest(addr)?;
        self.schedule_peer(addr)
    }

    fn on_peer_have(
        &mut self,
        addr: SocketAddr,
        index: PieceIndex,
    ) -> Result<()> {
        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            None => return Ok(()),
        };
        if index >= ctx.storage_info.piece_count {
            return Err(Error::Protocol(
                ProtocolViolation::OutOfRange,
            ));
        }
        let peer = match self.peers.get_mut(&addr) {
            Some(peer) => peer,
            None => return Ok(()),
        };

        let pieces = peer.pieces.get_or_insert_with(|| {
            Bitfield::new(ctx.storage_info.piece_count)
        });
        // the session deduplicates HAVEs, but stay safe against double
        // counting availability regardless
        if !pieces.set(index) {
            return Ok(());
        }
        if !peer.counted_as_seed {
            ctx.availability[index] += 1;
            if pieces.is_all_set() {
                // a completed peer stops differentiating availability
                for piece in pieces.iter_set() {
                    ctx.availability[piece] -= 1;
                }
                peer.counted_as_seed = true;
                ctx.seed_count += 1;
                log::info!("Peer {} became a seed", addr);
            }
        }

        self.update_interest(addr)?;
        self.schedule_peer(addr)
    }

    fn on_peer_choked(&mut self, addr: SocketAddr) {
        let peer = match self.peers.get_mut(&addr) {
            Some(peer) => peer,
            None => return,
        };
        if peer.peer_choking {
            return;
        }
        log::info!("Peer {} choked us", addr);
        peer.peer_choking = true;
        // congestion signal: halve the pipeline
        peer.pipeline.on_choke();
        // the peer won't serve what we have in flight; release it all so
        // the blocks are requestable again (a late arrival is handled as
        // a duplicate)
        peer.outstanding = 0;
        if let Some(ctx) = self.ctx.as_mut() {
            for piece in ctx.active.values_mut() {
                piece.clear_requests_for_peer(&addr);
            }
        }
    }

    /// Recomputes whether we want anything from this peer and tells the
    /// session if that changed.
    fn update_interest(&mut self, addr: SocketAddr) -> Result<()> {
        let ctx = match self.ctx.as_ref() {
            Some(ctx) => ctx,
            None => return Ok(()),
        };
        let peer = match self.peers.get_mut(&addr) {
            Some(peer) => peer,
            None => return Ok(()),
        };
        let pieces = match peer.pieces.as_ref() {
            Some(pieces) => pieces,
            None => return Ok(()),
        };

        let interested = (0..ctx.storage_info.piece_count).any(|index| {
            pieces.has(index)
                && !ctx.own_pieces.has(index)
                && ctx.priorities.is_piece_wanted(index)
        });
        if interested != peer.am_interested {
            log::info!(
                "{} in peer {}",
                if interested {
                    "Interested"
                } else {
                    "No longer interested"
                },
                addr
            );
            peer.am_interested = interested;
            let _ = peer
                .cmd
                .send(SessionCommand::SetInterested(interested));
        }
        Ok(())
    }

    /// Unchokes interested peers up to the configured cap; chokes peers
    /// that lost interest.
    fn update_peer_choking(&mut self, addr: SocketAddr) -> Result<()> {
        let unchoked_count =
            self.peers.values().filter(|p| !p.am_choking).count();
        let peer = match self.peers.get_mut(&addr) {
            Some(peer) => peer,
            None => return Ok(()),
        };
        if peer.peer_interested
            && peer.am_choking
            && unchoked_count < self.conf.max_unchoked_peer_count
        {
            log::info!("Unchoking peer {}", addr);
            peer.am_choking = false;
            let _ = peer.cmd.send(SessionCommand::Unchoke);
        } else if !peer.peer_interested && !peer.am_choking {
            log::info!("Choking peer {}", addr);
            peer.am_choking = true;
            let _ = peer.cmd.send(SessionCommand::Choke);
        }
        Ok(())
    }

    /// Fills the peer's request pipeline: first with blocks of pieces we
    /// already started, then with freshly picked pieces.
    fn schedule_peer(&mut self, addr: SocketAddr) -> Result<()> {
        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            None => return Ok(()),
        };
        let peer = match self.peers.get_mut(&addr) {
            Some(peer) => peer,
            None => return Ok(()),
        };
        if peer.peer_choking || !peer.am_interested {
            return Ok(());
        }
        let peer_pieces = match peer.pieces.clone() {
            Some(pieces) => pieces,
            None => return Ok(()),
        };

        let mut budget =
            peer.pipeline.depth().saturating_sub(peer.outstanding);
        if budget == 0 {
            return Ok(());
        }

        let now = Instant::now();
        // a peer fast enough to finish a piece quickly gets pieces of its
        // own, so one slow peer can't hold a fast peer's piece hostage
        let piece_secs = ctx.storage_info.piece_len as u64
            / peer.counters.down.avg().max(1);
        let peer_is_fast = Duration::from_secs(piece_secs)
            < self.conf.fast_piece_threshold;

        let mut to_request: Vec<BlockInfo> = Vec::new();

        // continue what we started: all active pieces this peer can supply
        let mut active_indices: Vec<PieceIndex> =
            ctx.active.keys().copied().collect();
        active_indices.sort_unstable();
        for index in active_indices {
            if budget == 0 {
                break;
            }
            if !peer_pieces.has(index) {
                continue;
            }
            let piece = ctx
                .active
                .get_mut(&index)
                .expect("index came from the active map");
            // a piece claimed by a fast peer is off limits to others until
            // the endgame
            if let Some(owner) = piece.exclusive_peer {
                if owner != addr && !ctx.endgame {
                    continue;
                }
            }
            let blocks: Vec<usize> = if ctx.endgame {
                // duplicate in-flight requests, but never against our own
                // outstanding ones
                (0..piece.block_count())
                    .filter(|b| {
                        !piece.has_block(*b)
                            && !piece.is_block_requested_by(*b, &addr)
                    })
                    .take(budget)
                    .collect()
            } else {
                piece.needed_blocks(budget)
            };
            for block in blocks {
                piece.add_request(block, addr, now);
                to_request.push(BlockInfo {
                    piece_index: index,
                    offset: block as u32 * BLOCK_LEN,
                    len: piece.block_len(block),
                });
                budget -= 1;
            }
        }

        // start new pieces while the pipeline has room
        while budget > 0 {
            let started: HashSet<PieceIndex> =
                ctx.active.keys().copied().collect();
            let picked = pick_pieces(
                PickContext {
                    peer_pieces: &peer_pieces,
                    own_pieces: &ctx.own_pieces,
                    priorities: ctx.priorities.piece_priorities(),
                    availability: &ctx.availability,
                    started: &started,
                },
                self.conf.max_picked_piece_count,
            );
            let mut started_new_piece = false;
            for index in picked {
                if budget == 0 {
                    break;
                }
                if ctx.active.contains_key(&index) {
                    // already handled in the first pass
                    continue;
                }
                let piece_len = ctx.storage_info.piece_len(index)?;
                let buf = self.pool.acquire(piece_len as usize);
                let mut piece = PieceDownload::new(index, piece_len, buf, now);
                if peer_is_fast && !ctx.endgame {
                    piece.exclusive_peer = Some(addr);
                }
                log::debug!("Peer {} starting piece {}", addr, index);
                for block in piece.needed_blocks(budget) {
                    piece.add_request(block, addr, now);
                    to_request.push(BlockInfo {
                        piece_index: index,
                        offset: block as u32 * BLOCK_LEN,
                        len: piece.block_len(block),
                    });
                    budget -= 1;
                }
                ctx.active.insert(index, piece);
                started_new_piece = true;
            }
            if !started_new_piece {
                break;
            }
        }

        if to_request.is_empty() {
            return Ok(());
        }
        log::debug!(
            "Requesting {} blocks from peer {}",
            to_request.len(),
            addr
        );
        peer.outstanding += to_request.len();
        for block in to_request {
            let _ = peer.cmd.send(SessionCommand::Request(block));
        }

        self.update_endgame();
        Ok(())
    }

    /// Enters endgame once every remaining wanted piece is active with all
    /// of its blocks either received or in flight.
    fn update_endgame(&mut self) {
        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            None => return,
        };
        if ctx.endgame {
            return;
        }
        for index in 0..ctx.storage_info.piece_count {
            if ctx.own_pieces.has(index)
                || !ctx.priorities.is_piece_wanted(index)
            {
                continue;
            }
            match ctx.active.get(&index) {
                Some(piece) if piece.needed_blocks(1).is_empty() => {}
                _ => return,
            }
        }
        log::info!("Torrent entering endgame");
        ctx.endgame = true;
    }

    /// The receive path: locates the active piece, registers the block,
    /// cancels raced duplicates, and completes the piece when it is whole.
    async fn on_block(
        &mut self,
        addr: SocketAddr,
        block: BlockInfo,
        data: Bytes,
    ) -> Result<()> {
        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            None => return Ok(()),
        };
        let piece = match ctx.active.get_mut(&block.piece_index) {
            Some(piece) => piece,
            None => {
                // a block for a piece we dropped (stale GC, blacklist) or
                // never started; harmless
                log::debug!(
                    "Peer {} sent block for inactive piece {}",
                    addr,
                    block.piece_index
                );
                return Ok(());
            }
        };

        if block.offset % BLOCK_LEN != 0 {
            return Err(Error::Protocol(
                ProtocolViolation::OutOfRange,
            ));
        }
        let block_index = (block.offset / BLOCK_LEN) as usize;
        if block_index >= piece.block_count()
            || block.len != piece.block_len(block_index)
        {
            return Err(Error::Protocol(
                ProtocolViolation::OutOfRange,
            ));
        }

        let now = Instant::now();
        let result = piece.add_block(block_index, &data, addr, now);
        let piece_done = piece.have_all_blocks();

        // give the cleared requests' owners their pipeline slots back, and
        // cancel the raced duplicates
        for owner in &result.cleared_requests {
            if let Some(peer) = self.peers.get_mut(owner) {
                peer.outstanding = peer.outstanding.saturating_sub(1);
                if result.added && *owner != addr {
                    let _ = peer.cmd.send(SessionCommand::Cancel(block));
                }
            }
        }

        if result.added {
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.pipeline.record_block();
                peer.counters.down.add(block.len as u64);
            }
            self.counters.down.add(block.len as u64);
        } else {
            log::debug!(
                "Peer {} sent duplicate block {:?}",
                addr,
                block
            );
        }

        if piece_done {
            self.complete_piece(block.piece_index).await?;
        }

        // the pipeline freed up; keep it saturated
        self.schedule_peer(addr)?;
        self.update_endgame();
        Ok(())
    }

    /// Verifies a fully buffered piece and persists it, or strikes its
    /// contributors.
    async fn complete_piece(&mut self, index: PieceIndex) -> Result<()> {
        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            None => return Ok(()),
        };
        let piece = match ctx.active.remove(&index) {
            Some(piece) => piece,
            None => return Ok(()),
        };

        let data = match piece.assemble() {
            Some(data) => data,
            None => {
                debug_assert!(false, "complete_piece on incomplete piece");
                self.pool.release(piece.into_buf());
                return Ok(());
            }
        };
        let expected: Sha1Hash = ctx.piece_hashes[index];
        let digest = Sha1::digest(data);

        if digest.as_slice() != &expected[..] {
            log::warn!("Piece {} failed its hash check", index);
            let contributors = piece.contributing_peers();
            self.pool.release(piece.into_buf());
            self.strike_peers(contributors);
            return Ok(());
        }

        log::info!("Piece {} is valid", index);
        let write_ok =
            Self::persist_piece(ctx, index, data, &expected, &self.alerts);
        if !write_ok {
            // the piece stays unowned and will be re-picked; its buffer
            // still goes back to the pool
            self.pool.release(piece.into_buf());
            return Ok(());
        }

        ctx.own_pieces.set(index);
        self.pool.release(piece.into_buf());

        // everyone who doesn't have the piece learns that we do now
        for peer in self.peers.values() {
            let peer_has = peer
                .pieces
                .as_ref()
                .map(|pieces| pieces.has(index))
                .unwrap_or(false);
            if !peer_has {
                let _ = peer.cmd.send(SessionCommand::Have(index));
            }
        }
        let _ = self
            .alerts
            .send(TorrentAlert::PieceCompleted { index });

        // we may have lost interest in peers that only had this piece
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.update_interest(addr)?;
        }

        self.check_completion();
        Ok(())
    }

    /// Writes a verified piece to storage with a single retry. Uses the
    /// storage's verified write for single file pieces; otherwise writes
    /// and re-verifies the stored bytes. Returns whether the piece is
    /// persisted.
    fn persist_piece(
        ctx: &mut TorrentContext,
        index: PieceIndex,
        data: &[u8],
        expected: &Sha1Hash,
        alerts: &UnboundedSender<TorrentAlert>,
    ) -> bool {
        let mut attempt = || -> std::io::Result<()> {
            if ctx.storage_info.piece_in_single_file(index) {
                if ctx.storage.write_piece_verified(index, data, expected)? {
                    return Ok(());
                }
            }
            ctx.storage.write_piece(index, data)?;
            // post-verify what actually landed in storage
            let stored = ctx.storage.read(index, 0, data.len() as u32)?;
            if Sha1::digest(&stored).as_slice() != &expected[..] {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "stored piece does not match its hash",
                ));
            }
            Ok(())
        };

        let mut result = attempt();
        if let Err(e) = &result {
            // transient failures get a single retry before escalating
            log::warn!("Retrying piece {} write: {}", index, e);
            result = attempt();
        }
        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("Piece {} write failed: {}", index, e);
                let _ = alerts.send(TorrentAlert::StorageError { index });
                false
            }
        }
    }

    /// Strikes every peer that contributed to a corrupt piece; repeat
    /// offenders are banned for this torrent.
    fn strike_peers(&mut self, contributors: HashSet<SocketAddr>) {
        for addr in contributors {
            let peer = match self.peers.get_mut(&addr) {
                Some(peer) => peer,
                None => continue,
            };
            peer.strikes += 1;
            log::warn!(
                "Peer {} struck for corrupt data ({} strikes)",
                addr,
                peer.strikes
            );
            if peer.strikes >= self.conf.strike_ban_threshold {
                log::warn!("Banning peer {}", addr);
                self.banned.insert(addr.ip());
                let _ = self
                    .alerts
                    .send(TorrentAlert::PeerBanned { addr });
                self.disconnect_peer(&addr);
            }
        }
    }

    fn check_completion(&mut self) {
        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            None => return,
        };
        if ctx.complete {
            return;
        }
        let done = (0..ctx.storage_info.piece_count).all(|index| {
            ctx.own_pieces.has(index)
                || !ctx.priorities.is_piece_wanted(index)
        });
        if done {
            log::info!(
                "Torrent {} download complete",
                hex::encode(&self.info_hash)
            );
            ctx.complete = true;
            let _ = self.alerts.send(TorrentAlert::DownloadComplete);
        }
    }

    /// The upload admission path; requests are validated here, the actual
    /// sends happen in the drain loop.
    async fn on_peer_request(
        &mut self,
        addr: SocketAddr,
        block: BlockInfo,
    ) -> Result<()> {
        let peer = match self.peers.get(&addr) {
            Some(peer) => peer,
            None => return Ok(()),
        };
        // the session already closes choked requesters; this guards the
        // window where our choke is still in flight to the peer
        if peer.am_choking {
            log::debug!(
                "Dropping request from choked peer {}",
                addr
            );
            return Ok(());
        }
        let ctx = match self.ctx.as_ref() {
            Some(ctx) => ctx,
            // no storage to read from yet
            None => return Ok(()),
        };
        if block.piece_index >= ctx.storage_info.piece_count {
            return Err(Error::Protocol(ProtocolViolation::OutOfRange));
        }
        if !ctx.own_pieces.has(block.piece_index) {
            log::debug!(
                "Peer {} requested unowned piece {}",
                addr,
                block.piece_index
            );
            return Ok(());
        }
        let piece_len = ctx.storage_info.piece_len(block.piece_index)?;
        if block.offset as u64 + block.len as u64 > piece_len as u64 {
            return Err(Error::Protocol(
                ProtocolViolation::OutOfRange,
            ));
        }

        self.uploader.push(QueuedRequest {
            peer: addr,
            block,
            queued_at: Instant::now(),
        });
        self.drain_uploads().await
    }

    /// Serves queued requests in FIFO order under the token bucket. When
    /// the bucket refuses a block, a wakeup is scheduled and the loop
    /// suspends itself.
    async fn drain_uploads(&mut self) -> Result<()> {
        if !self.uploader.try_begin_drain() {
            return Ok(());
        }
        let result = self.drain_uploads_inner().await;
        self.uploader.end_drain();
        result
    }

    async fn drain_uploads_inner(&mut self) -> Result<()> {
        loop {
            let request = match self.uploader.pop() {
                Some(request) => request,
                None => return Ok(()),
            };

            // re-check: the peer may be gone or choked since it queued
            match self.peers.get(&request.peer) {
                Some(peer) if !peer.am_choking => {}
                _ => continue,
            }

            let now = Instant::now();
            if !self
                .uploader
                .bucket
                .try_consume(request.block.len as u64, now)
            {
                // out of tokens: requeue and come back when enough have
                // accumulated
                let wait = self
                    .uploader
                    .bucket
                    .duration_until_available(request.block.len as u64, now)
                    .max(Duration::from_millis(10));
                self.uploader.push_front(request);
                let wake = self.upload_wake_tx.clone();
                task::spawn(async move {
                    time::delay_for(wait).await;
                    let _ = wake.send(());
                });
                return Ok(());
            }

            let ctx = match self.ctx.as_mut() {
                Some(ctx) => ctx,
                None => continue,
            };
            let data = match ctx.storage.read(
                request.block.piece_index,
                request.block.offset,
                request.block.len,
            ) {
                Ok(data) => data,
                Err(e) => {
                    log::warn!(
                        "Dropping upload {:?} to {}: {}",
                        request.block,
                        request.peer,
                        e
                    );
                    continue;
                }
            };

            if let Some(peer) = self.peers.get_mut(&request.peer) {
                let _ = peer.cmd.send(SessionCommand::Piece {
                    block: request.block,
                    data: Bytes::from(data),
                });
                peer.counters.up.add(request.block.len as u64);
                self.counters.up.add(request.block.len as u64);
                log::debug!(
                    "Serving block {:?} to peer {}",
                    request.block,
                    request.peer
                );
            }
        }
    }

    /// Serves a peer's metadata request from our info dictionary.
    fn on_metadata_request(
        &mut self,
        addr: SocketAddr,
        piece: u32,
    ) -> Result<()> {
        let peer = match self.peers.get(&addr) {
            Some(peer) => peer,
            None => return Ok(()),
        };
        let slice = self
            .ctx
            .as_ref()
            .and_then(|ctx| MetadataFetcher::serve(&ctx.info_bytes, piece));
        match slice {
            Some(data) => {
                let total_size = self
                    .ctx
                    .as_ref()
                    .map(|ctx| ctx.info_bytes.len() as u64)
                    .unwrap_or_default();
                let _ = peer.cmd.send(SessionCommand::MetadataData {
                    piece,
                    total_size,
                    data,
                });
            }
            None => {
                let _ =
                    peer.cmd.send(SessionCommand::MetadataReject(piece));
            }
        }
        Ok(())
    }

    fn on_metadata_data(
        &mut self,
        addr: SocketAddr,
        piece: u32,
        total_size: u64,
        data: Bytes,
    ) -> Result<()> {
        if self.ctx.is_some() {
            return Ok(());
        }
        let fetcher = match self.metadata.as_mut() {
            Some(fetcher) => fetcher,
            None => return Ok(()),
        };
        match fetcher.on_data(addr, piece, total_size, data)? {
            MetadataProgress::InFlight => Ok(()),
            MetadataProgress::Mismatch => {
                // only this peer's buffer was poisoned; it may try again,
                // others are unaffected
                log::warn!("Peer {} sent corrupt metadata", addr);
                Ok(())
            }
            MetadataProgress::Complete(buf) => self.on_metadata_complete(buf),
        }
    }

    /// The fetched metadata checked out: build the piece level state and
    /// let every session materialize its deferred availability.
    fn on_metadata_complete(&mut self, buf: Bytes) -> Result<()> {
        let metadata_size = buf.len() as u64;
        let metainfo = match Metainfo::from_info_bytes(buf.to_vec()) {
            Ok(metainfo) => metainfo,
            Err(e) => {
                // hash-correct but unparseable metadata: nothing sane to do
                // but keep fetching from scratch
                log::error!("Fetched metadata does not parse: {}", e);
                self.metadata =
                    Some(MetadataFetcher::new(self.info_hash));
                return Ok(());
            }
        };
        self.init_context(metainfo, None)?;
        self.metadata = None;

        let piece_count = self
            .ctx
            .as_ref()
            .map(|ctx| ctx.storage_info.piece_count)
            .unwrap_or_default();
        for peer in self.peers.values() {
            let _ = peer
                .cmd
                .send(SessionCommand::PieceCountKnown(piece_count));
        }
        let _ = self
            .alerts
            .send(TorrentAlert::MetadataComplete { metadata_size });
        Ok(())
    }

    /// Applies a file priority change and discards any now-blacklisted
    /// in-flight pieces.
    fn set_file_priority(
        &mut self,
        file: FileIndex,
        priority: FilePriority,
    ) -> Result<()> {
        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            None => return Err(Error::InvalidFileIndex),
        };
        let change = ctx.priorities.set_file_priority(
            file,
            priority,
            &ctx.own_pieces,
        )?;

        for index in change.newly_blacklisted {
            if let Some(piece) = ctx.active.remove(&index) {
                log::info!("Discarding blacklisted piece {}", index);
                // hand back pipeline slots and cancel what's in flight
                for block in piece.requested_but_not_received_blocks() {
                    let block_info = BlockInfo {
                        piece_index: index,
                        offset: block as u32 * BLOCK_LEN,
                        len: piece.block_len(block),
                    };
                    for owner in piece.requesters(block) {
                        if let Some(peer) = self.peers.get_mut(&owner) {
                            peer.outstanding =
                                peer.outstanding.saturating_sub(1);
                            let _ = peer
                                .cmd
                                .send(SessionCommand::Cancel(block_info));
                        }
                    }
                }
                self.pool.release(piece.into_buf());
            }
        }

        // both interest and completion depend on what is wanted
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.update_interest(addr)?;
        }
        self.check_completion();
        Ok(())
    }

    /// A session is gone: release everything attributed to it.
    fn on_peer_closed(&mut self, addr: SocketAddr) {
        let peer = match self.peers.remove(&addr) {
            Some(peer) => peer,
            None => return,
        };
        log::info!(
            "Peer {} removed after {}s",
            addr,
            peer.connected_at.elapsed().as_secs()
        );

        if let Some(ctx) = self.ctx.as_mut() {
            // availability bookkeeping
            if peer.counted_as_seed {
                ctx.seed_count -= 1;
            } else if let Some(pieces) = &peer.pieces {
                for index in pieces.iter_set() {
                    ctx.availability[index] -= 1;
                }
            }
            // its outstanding requests become requestable again
            for piece in ctx.active.values_mut() {
                let cleared = piece.clear_requests_for_peer(&addr);
                if cleared > 0 {
                    log::debug!(
                        "Released {} requests of peer {} on piece {}",
                        cleared,
                        addr,
                        piece.index()
                    );
                }
                if piece.exclusive_peer == Some(addr) {
                    piece.exclusive_peer = None;
                }
            }
        }
        self.uploader.remove_peer(&addr);
        if let Some(fetcher) = self.metadata.as_mut() {
            fetcher.drop_peer(&addr);
        }
    }

    /// The periodic tick: rate accounting, pipeline adaptation, request
    /// scheduling, and stale piece collection.
    async fn tick(&mut self) -> Result<()> {
        self.ticks += 1;
        self.counters.tick();
        for peer in self.peers.values_mut() {
            peer.counters.tick();
            peer.pipeline.tick();
        }

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.schedule_peer(addr)?;
        }

        if self.ticks % self.conf.stale_piece_gc_interval.as_secs().max(1)
            == 0
        {
            self.gc_stale_pieces();
        }

        self.drain_uploads().await
    }

    /// Releases timed out block requests and discards pieces that have
    /// been inactive for too long without receiving any data.
    fn gc_stale_pieces(&mut self) {
        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            None => return,
        };
        let now = Instant::now();
        let mut discard: Vec<PieceIndex> = Vec::new();

        for (index, piece) in ctx.active.iter_mut() {
            // requests age out individually even on an otherwise active
            // piece, freeing their blocks and pipeline slots
            let cleared =
                piece.check_timeouts(self.conf.request_timeout, now);
            for owner in cleared {
                if let Some(peer) = self.peers.get_mut(&owner) {
                    peer.outstanding = peer.outstanding.saturating_sub(1);
                }
            }
            if now.duration_since(piece.last_activity())
                > self.conf.stale_piece_timeout
                && piece.buffered_bytes() == 0
                && piece.requested_but_not_received_blocks().is_empty()
            {
                discard.push(*index);
            }
        }

        for index in discard {
            log::info!("Discarding stale piece {}", index);
            if let Some(piece) = ctx.active.remove(&index) {
                self.pool.release(piece.into_buf());
            }
        }
    }

    fn resume_state(&self) -> ResumeState {
        ResumeState {
            bitfield: self
                .ctx
                .as_ref()
                .map(|ctx| ctx.own_pieces.to_bytes())
                .unwrap_or_default(),
            uploaded: self.counters.up.total(),
            downloaded: self.counters.down.total(),
            info: self.ctx.as_ref().map(|ctx| ctx.info_bytes.clone()),
        }
    }

    /// Tears the torrent down: sessions, upload queue, buffers, storage.
    fn shutdown(&mut self) {
        log::info!("Shutting down torrent {}", hex::encode(&self.info_hash));
        for peer in self.peers.values() {
            let _ = peer.cmd.send(SessionCommand::Shutdown);
        }
        self.uploader.clear();
        if let Some(ctx) = self.ctx.as_mut() {
            for (_, piece) in ctx.active.drain() {
                self.pool.release(piece.into_buf());
            }
            if let Err(e) = ctx.storage.close() {
                log::warn!("Error closing storage: {}", e);
            }
        }
        self.pool.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metainfo::Info,
        storage::tests::MemoryStorage,
        Bitfield,
    };
    use pretty_assertions::assert_eq;
    use serde_bytes::ByteBuf;
    use std::sync::{Arc, Mutex};

    /// Storage handle the tests keep a second reference to, so they can
    /// inspect and pre-fill what the torrent persists.
    struct SharedStorage(Arc<Mutex<MemoryStorage>>);

    impl ContentStorage for SharedStorage {
        fn read(
            &mut self,
            piece_index: PieceIndex,
            offset: u32,
            len: u32,
        ) -> std::io::Result<Vec<u8>> {
            self.0.lock().unwrap().read(piece_index, offset, len)
        }

        fn write(
            &mut self,
            piece_index: PieceIndex,
            offset: u32,
            data: &[u8],
        ) -> std::io::Result<()> {
            self.0.lock().unwrap().write(piece_index, offset, data)
        }
    }

    fn sha1(data: &[u8]) -> Sha1Hash {
        let digest = Sha1::digest(data);
        let mut hash = [0; 20];
        hash.copy_from_slice(&digest);
        hash
    }

    /// Builds a single file metainfo over the given piece contents.
    fn metainfo_for(piece_data: &[Vec<u8>], piece_len: u32) -> Metainfo {
        let mut pieces = Vec::new();
        for data in piece_data {
            pieces.extend_from_slice(&sha1(data));
        }
        let total: u64 = piece_data.iter().map(|d| d.len() as u64).sum();
        let info = Info {
            files: None,
            length: Some(total),
            name: "test".to_string(),
            piece_len,
            pieces: ByteBuf::from(pieces),
            private: None,
        };
        let info_bytes = serde_bencode::to_bytes(&info).unwrap();
        let info_hash = sha1(&info_bytes);
        Metainfo {
            info,
            announce: None,
            announce_list: None,
            info_bytes,
            info_hash,
        }
    }

    struct Fixture {
        torrent: Torrent,
        alerts: UnboundedReceiver<TorrentAlert>,
        storage: Arc<Mutex<MemoryStorage>>,
        piece_data: Vec<Vec<u8>>,
    }

    /// A torrent over `piece_count` equal sized pieces with deterministic
    /// contents and correct hashes.
    fn fixture(piece_len: u32, piece_count: usize) -> Fixture {
        let piece_data: Vec<Vec<u8>> = (0..piece_count)
            .map(|i| vec![i as u8 + 1; piece_len as usize])
            .collect();
        fixture_with_data(piece_len, piece_data, None)
    }

    fn fixture_with_data(
        piece_len: u32,
        piece_data: Vec<Vec<u8>>,
        resume: Option<ResumeState>,
    ) -> Fixture {
        let metainfo = metainfo_for(&piece_data, piece_len);
        let storage = Arc::new(Mutex::new(MemoryStorage::default()));
        let handle = Arc::clone(&storage);
        let params = TorrentParams {
            info_hash: metainfo.info_hash,
            client_id: *b"tdt-0000000000000000",
            conf: TorrentConf::new("/unused"),
            metainfo: Some(metainfo),
            storage: Box::new(move |_| {
                Ok(Box::new(SharedStorage(Arc::clone(&handle)))
                    as Box<dyn ContentStorage>)
            }),
            resume,
        };
        let (torrent, _cmd, alerts) = Torrent::new(params).unwrap();
        Fixture {
            torrent,
            alerts,
            storage,
            piece_data,
        }
    }

    /// Registers a scripted peer, returning its address and the receiving
    /// end of its session command channel.
    fn attach_peer(
        torrent: &mut Torrent,
        port: u16,
    ) -> (SocketAddr, UnboundedReceiver<SessionCommand>) {
        let addr: SocketAddr =
            format!("127.0.0.1:{}", port).parse().unwrap();
        let (cmd, rx) = mpsc::unbounded_channel();
        torrent.register_peer(addr, cmd);
        (addr, rx)
    }

    fn drain_cmds(
        rx: &mut UnboundedReceiver<SessionCommand>,
    ) -> Vec<SessionCommand> {
        let mut cmds = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            cmds.push(cmd);
        }
        cmds
    }

    fn drain_alerts(
        rx: &mut UnboundedReceiver<TorrentAlert>,
    ) -> Vec<TorrentAlert> {
        let mut alerts = Vec::new();
        while let Ok(alert) = rx.try_recv() {
            alerts.push(alert);
        }
        alerts
    }

    fn requested_blocks(cmds: &[SessionCommand]) -> Vec<BlockInfo> {
        cmds.iter()
            .filter_map(|cmd| match cmd {
                SessionCommand::Request(block) => Some(*block),
                _ => None,
            })
            .collect()
    }

    fn cancelled_blocks(cmds: &[SessionCommand]) -> Vec<BlockInfo> {
        cmds.iter()
            .filter_map(|cmd| match cmd {
                SessionCommand::Cancel(block) => Some(*block),
                _ => None,
            })
            .collect()
    }

    /// Walks a peer through handshake, full bitfield, and unchoke.
    async fn seed_peer(
        torrent: &mut Torrent,
        addr: SocketAddr,
        piece_count: usize,
    ) {
        torrent
            .handle_peer_event(
                addr,
                PeerEvent::HandshakeDone {
                    peer_id: [0; 20],
                    ltep: true,
                    fast: true,
                },
            )
            .await
            .unwrap();
        torrent
            .handle_peer_event(
                addr,
                PeerEvent::Bitfield(Bitfield::new_all_set(piece_count)),
            )
            .await
            .unwrap();
        torrent
            .handle_peer_event(addr, PeerEvent::Unchoked)
            .await
            .unwrap();
    }

    async fn deliver(
        torrent: &mut Torrent,
        addr: SocketAddr,
        block: BlockInfo,
        data: &[u8],
    ) {
        torrent
            .handle_peer_event(
                addr,
                PeerEvent::Block {
                    block,
                    data: Bytes::copy_from_slice(data),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_basic_download() {
        let piece_len = BLOCK_LEN;
        let mut fx = fixture(piece_len, 3);

        let (seed, mut seed_rx) = attach_peer(&mut fx.torrent, 6001);
        // a leech that has nothing; it should be told about our progress
        let (leech, mut leech_rx) = attach_peer(&mut fx.torrent, 6002);
        fx.torrent
            .handle_peer_event(
                leech,
                PeerEvent::HandshakeDone {
                    peer_id: [1; 20],
                    ltep: false,
                    fast: false,
                },
            )
            .await
            .unwrap();

        seed_peer(&mut fx.torrent, seed, 3).await;

        let cmds = drain_cmds(&mut seed_rx);
        // the seed has everything we want
        assert!(cmds
            .iter()
            .any(|c| matches!(c, SessionCommand::SetInterested(true))));
        // one block per piece, in index order (equal priority and
        // availability)
        let requests = requested_blocks(&cmds);
        assert_eq!(
            requests,
            vec![
                BlockInfo { piece_index: 0, offset: 0, len: piece_len },
                BlockInfo { piece_index: 1, offset: 0, len: piece_len },
                BlockInfo { piece_index: 2, offset: 0, len: piece_len },
            ]
        );

        for (i, block) in requests.iter().enumerate() {
            deliver(&mut fx.torrent, seed, *block, &fx.piece_data[i]).await;
        }

        // every piece verified and persisted
        let ctx = fx.torrent.ctx.as_ref().unwrap();
        assert!(ctx.own_pieces.is_all_set());
        assert!(ctx.active.is_empty());
        {
            let storage = fx.storage.lock().unwrap();
            for i in 0..3 {
                assert_eq!(storage.pieces[&i], fx.piece_data[i]);
            }
        }

        // the seed already has the pieces, so only the leech hears HAVE
        let have_count = drain_cmds(&mut leech_rx)
            .iter()
            .filter(|c| matches!(c, SessionCommand::Have(_)))
            .count();
        assert_eq!(have_count, 3);
        assert!(!drain_cmds(&mut seed_rx)
            .iter()
            .any(|c| matches!(c, SessionCommand::Have(_))));

        let alerts = drain_alerts(&mut fx.alerts);
        assert_eq!(
            alerts
                .iter()
                .filter(|a| matches!(a, TorrentAlert::PieceCompleted { .. }))
                .count(),
            3
        );
        assert!(alerts
            .iter()
            .any(|a| matches!(a, TorrentAlert::DownloadComplete)));

        // the resume snapshot reflects the completed download
        let resume = fx.torrent.resume_state();
        assert_eq!(resume.bitfield, vec![0b1110_0000]);
        assert_eq!(resume.downloaded, 3 * piece_len as u64);
        assert!(resume.info.is_some());
    }

    #[tokio::test]
    async fn test_hash_failure_strikes_all_contributors() {
        // one piece of four blocks whose real hash we sabotage
        let piece_len = 4 * BLOCK_LEN;
        let mut piece = vec![0u8; piece_len as usize];
        for (i, b) in piece.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut fx = fixture_with_data(piece_len, vec![piece], None);
        fx.torrent.ctx.as_mut().unwrap().piece_hashes[0] = [0; 20];

        let (a, mut a_rx) = attach_peer(&mut fx.torrent, 6001);
        let (b, mut b_rx) = attach_peer(&mut fx.torrent, 6002);
        seed_peer(&mut fx.torrent, a, 1).await;
        seed_peer(&mut fx.torrent, b, 1).await;

        let a_requests = requested_blocks(&drain_cmds(&mut a_rx));
        assert_eq!(a_requests.len(), 4);
        // endgame: the second peer duplicates the outstanding requests
        assert!(fx.torrent.ctx.as_ref().unwrap().endgame);
        let b_requests = requested_blocks(&drain_cmds(&mut b_rx));
        assert_eq!(b_requests.len(), 4);

        // a supplies blocks 0 and 2, b supplies 1 and 3
        for (addr, block) in [
            (a, a_requests[0]),
            (b, b_requests[1]),
            (a, a_requests[2]),
            (b, b_requests[3]),
        ] {
            let start = block.offset as usize;
            let data =
                fx.piece_data[0][start..start + block.len as usize].to_vec();
            deliver(&mut fx.torrent, addr, block, &data).await;
        }

        // the piece failed verification: both contributors struck, piece
        // dropped
        assert_eq!(fx.torrent.peers[&a].strikes, 1);
        assert_eq!(fx.torrent.peers[&b].strikes, 1);
        let ctx = fx.torrent.ctx.as_ref().unwrap();
        assert!(ctx.active.is_empty());
        assert!(!ctx.own_pieces.has(0));

        // next scheduling pass re-requests all four blocks
        fx.torrent.schedule_peer(a).unwrap();
        assert_eq!(requested_blocks(&drain_cmds(&mut a_rx)).len(), 4);
    }

    #[tokio::test]
    async fn test_second_strike_bans_peer() {
        let piece_len = BLOCK_LEN;
        let mut fx = fixture(piece_len, 1);
        fx.torrent.ctx.as_mut().unwrap().piece_hashes[0] = [0; 20];

        let (a, mut a_rx) = attach_peer(&mut fx.torrent, 6001);
        seed_peer(&mut fx.torrent, a, 1).await;

        for _ in 0..2 {
            let requests = requested_blocks(&drain_cmds(&mut a_rx));
            assert_eq!(requests.len(), 1);
            deliver(&mut fx.torrent, a, requests[0], &fx.piece_data[0])
                .await;
            fx.torrent.schedule_peer(a).unwrap();
        }

        assert!(fx.torrent.banned.contains(&a.ip()));
        assert!(drain_cmds(&mut a_rx)
            .iter()
            .any(|c| matches!(c, SessionCommand::Shutdown)));
        assert!(drain_alerts(&mut fx.alerts)
            .iter()
            .any(|al| matches!(al, TorrentAlert::PeerBanned { addr } if *addr == a)));

        // once its session winds down, the banned address is not
        // reconnected to
        fx.torrent
            .handle_peer_event(a, PeerEvent::Closed)
            .await
            .unwrap();
        fx.torrent.connect_to_peer(a);
        assert!(!fx.torrent.peers.contains_key(&a));
    }

    #[tokio::test]
    async fn test_disconnect_releases_requests_for_other_peers() {
        // two blocks in one piece, sole requester disconnects mid flight
        let piece_len = 2 * BLOCK_LEN;
        let mut fx = fixture(piece_len, 1);

        let (a, mut a_rx) = attach_peer(&mut fx.torrent, 6001);
        seed_peer(&mut fx.torrent, a, 1).await;
        let a_requests = requested_blocks(&drain_cmds(&mut a_rx));
        assert_eq!(a_requests.len(), 2);

        fx.torrent
            .handle_peer_event(a, PeerEvent::Closed)
            .await
            .unwrap();
        assert!(!fx.torrent.peers.contains_key(&a));
        {
            let ctx = fx.torrent.ctx.as_ref().unwrap();
            let piece = &ctx.active[&0];
            assert_eq!(piece.needed_blocks(10), vec![0, 1]);
        }

        // the released blocks go to the next eligible peer
        let (b, mut b_rx) = attach_peer(&mut fx.torrent, 6002);
        seed_peer(&mut fx.torrent, b, 1).await;
        assert_eq!(
            requested_blocks(&drain_cmds(&mut b_rx)),
            a_requests
        );
    }

    #[tokio::test]
    async fn test_endgame_winner_cancels_loser() {
        let piece_len = BLOCK_LEN;
        let mut fx = fixture(piece_len, 1);

        let (a, mut a_rx) = attach_peer(&mut fx.torrent, 6001);
        let (b, mut b_rx) = attach_peer(&mut fx.torrent, 6002);
        seed_peer(&mut fx.torrent, a, 1).await;
        seed_peer(&mut fx.torrent, b, 1).await;

        let a_requests = requested_blocks(&drain_cmds(&mut a_rx));
        let b_requests = requested_blocks(&drain_cmds(&mut b_rx));
        assert_eq!(a_requests, b_requests);
        assert_eq!(a_requests.len(), 1);

        // a wins the race; the duplicate to b is cancelled
        deliver(&mut fx.torrent, a, a_requests[0], &fx.piece_data[0]).await;
        assert_eq!(cancelled_blocks(&drain_cmds(&mut b_rx)), a_requests);
        assert!(cancelled_blocks(&drain_cmds(&mut a_rx)).is_empty());

        // b's late duplicate block is ignored without penalty
        deliver(&mut fx.torrent, b, b_requests[0], &fx.piece_data[0]).await;
        assert_eq!(fx.torrent.peers[&b].strikes, 0);
        assert!(fx.torrent.ctx.as_ref().unwrap().own_pieces.has(0));
    }

    #[tokio::test]
    async fn test_metadata_fetch_builds_torrent() {
        // the metainfo the magnet style torrent will learn from its peers
        let piece_data: Vec<Vec<u8>> =
            (0..2).map(|i| vec![i as u8; BLOCK_LEN as usize]).collect();
        let metainfo = metainfo_for(&piece_data, BLOCK_LEN);
        let info_bytes = metainfo.info_bytes.clone();

        let storage = Arc::new(Mutex::new(MemoryStorage::default()));
        let handle = Arc::clone(&storage);
        let params = TorrentParams {
            info_hash: metainfo.info_hash,
            client_id: *b"tdt-0000000000000000",
            conf: TorrentConf::new("/unused"),
            metainfo: None,
            storage: Box::new(move |_| {
                Ok(Box::new(SharedStorage(Arc::clone(&handle)))
                    as Box<dyn ContentStorage>)
            }),
            resume: None,
        };
        let (mut torrent, _cmd, mut alerts) = Torrent::new(params).unwrap();
        assert!(torrent.ctx.is_none());

        let (a, mut a_rx) = attach_peer(&mut torrent, 6001);
        torrent
            .handle_peer_event(
                a,
                PeerEvent::HandshakeDone {
                    peer_id: [0; 20],
                    ltep: true,
                    fast: false,
                },
            )
            .await
            .unwrap();
        torrent
            .handle_peer_event(
                a,
                PeerEvent::ExtendedHandshake {
                    metadata_id: Some(3),
                    metadata_size: Some(info_bytes.len() as u64),
                    pex_id: None,
                    client: Some("test client".to_string()),
                },
            )
            .await
            .unwrap();

        // the whole dictionary is pipelined at once (it fits one piece)
        let cmds = drain_cmds(&mut a_rx);
        assert!(matches!(cmds[..], [SessionCommand::MetadataRequest(0)]));

        torrent
            .handle_peer_event(
                a,
                PeerEvent::MetadataData {
                    piece: 0,
                    total_size: info_bytes.len() as u64,
                    data: Bytes::copy_from_slice(&info_bytes),
                },
            )
            .await
            .unwrap();

        // the torrent switched to downloading mode
        assert!(torrent.metadata.is_none());
        let ctx = torrent.ctx.as_ref().unwrap();
        assert_eq!(ctx.storage_info.piece_count, 2);
        assert_eq!(ctx.info_bytes, info_bytes);
        assert!(matches!(
            drain_alerts(&mut alerts)[..],
            [TorrentAlert::MetadataComplete { metadata_size }]
                if metadata_size == info_bytes.len() as u64
        ));
        // sessions are told to materialize their deferred availability
        assert!(drain_cmds(&mut a_rx)
            .iter()
            .any(|c| matches!(c, SessionCommand::PieceCountKnown(2))));
    }

    #[tokio::test]
    async fn test_serves_requests_when_unchoked_only() {
        // a completed torrent seeding from resume data
        let piece_len = BLOCK_LEN;
        let piece_data = vec![vec![0x5a; piece_len as usize]];
        let resume = ResumeState {
            bitfield: vec![0b1000_0000],
            uploaded: 0,
            downloaded: 0,
            info: None,
        };
        let mut fx =
            fixture_with_data(piece_len, piece_data.clone(), Some(resume));
        fx.storage
            .lock()
            .unwrap()
            .pieces
            .insert(0, piece_data[0].clone());
        assert!(fx.torrent.ctx.as_ref().unwrap().own_pieces.is_all_set());

        let (a, mut a_rx) = attach_peer(&mut fx.torrent, 6001);
        fx.torrent
            .handle_peer_event(
                a,
                PeerEvent::HandshakeDone {
                    peer_id: [0; 20],
                    ltep: false,
                    fast: false,
                },
            )
            .await
            .unwrap();

        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        // a request before we unchoke the peer is dropped
        fx.torrent
            .handle_peer_event(a, PeerEvent::Request(block))
            .await
            .unwrap();
        assert!(!drain_cmds(&mut a_rx)
            .iter()
            .any(|c| matches!(c, SessionCommand::Piece { .. })));

        // interest gets the peer unchoked, then its request is served
        fx.torrent
            .handle_peer_event(a, PeerEvent::Interested)
            .await
            .unwrap();
        let cmds = drain_cmds(&mut a_rx);
        assert!(cmds
            .iter()
            .any(|c| matches!(c, SessionCommand::Unchoke)));

        fx.torrent
            .handle_peer_event(a, PeerEvent::Request(block))
            .await
            .unwrap();
        let cmds = drain_cmds(&mut a_rx);
        match &cmds[..] {
            [SessionCommand::Piece { block: b, data }] => {
                assert_eq!(*b, block);
                assert_eq!(data.as_ref(), &piece_data[0][..]);
            }
            other => panic!("expected a piece, got {:?}", other),
        }
        assert_eq!(
            fx.torrent.peers[&a].counters.up.total(),
            BLOCK_LEN as u64
        );

        // a request for a block we don't have is dropped, not answered
        let unowned = BlockInfo {
            piece_index: 0,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        assert!(fx
            .torrent
            .handle_peer_event(a, PeerEvent::Request(unowned))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_storage_failure_is_retried_then_surfaced() {
        let piece_len = BLOCK_LEN;
        let mut fx = fixture(piece_len, 1);

        let (a, mut a_rx) = attach_peer(&mut fx.torrent, 6001);
        seed_peer(&mut fx.torrent, a, 1).await;
        let requests = requested_blocks(&drain_cmds(&mut a_rx));

        // both the write and its retry fail
        fx.storage.lock().unwrap().fail_writes = 2;
        deliver(&mut fx.torrent, a, requests[0], &fx.piece_data[0]).await;

        assert!(drain_alerts(&mut fx.alerts)
            .iter()
            .any(|al| matches!(al, TorrentAlert::StorageError { index: 0 })));
        let ctx = fx.torrent.ctx.as_ref().unwrap();
        // the piece is not owned and will be re-downloaded
        assert!(!ctx.own_pieces.has(0));
        assert!(ctx.active.is_empty());

        // with storage healthy again the retry path succeeds
        fx.torrent.schedule_peer(a).unwrap();
        let requests = requested_blocks(&drain_cmds(&mut a_rx));
        deliver(&mut fx.torrent, a, requests[0], &fx.piece_data[0]).await;
        assert!(fx.torrent.ctx.as_ref().unwrap().own_pieces.has(0));
    }

    #[tokio::test]
    async fn test_skipping_file_discards_active_pieces() {
        let piece_len = BLOCK_LEN;
        let mut fx = fixture(piece_len, 2);

        let (a, mut a_rx) = attach_peer(&mut fx.torrent, 6001);
        seed_peer(&mut fx.torrent, a, 2).await;
        assert_eq!(requested_blocks(&drain_cmds(&mut a_rx)).len(), 2);

        // skipping the single file blacklists both pieces
        fx.torrent
            .set_file_priority(0, FilePriority::Skip)
            .unwrap();

        let ctx = fx.torrent.ctx.as_ref().unwrap();
        assert!(ctx.active.is_empty());
        let cmds = drain_cmds(&mut a_rx);
        assert_eq!(cancelled_blocks(&cmds).len(), 2);
        // nothing left to want from this peer
        assert!(cmds
            .iter()
            .any(|c| matches!(c, SessionCommand::SetInterested(false))));
        assert_eq!(fx.torrent.peers[&a].outstanding, 0);
    }

    #[tokio::test]
    async fn test_availability_tracks_non_seed_peers() {
        let piece_len = BLOCK_LEN;
        let mut fx = fixture(piece_len, 3);

        // a non seed peer with pieces 0 and 2
        let (a, _a_rx) = attach_peer(&mut fx.torrent, 6001);
        let mut partial = Bitfield::new(3);
        partial.set(0);
        partial.set(2);
        fx.torrent
            .handle_peer_event(a, PeerEvent::Bitfield(partial))
            .await
            .unwrap();
        {
            let ctx = fx.torrent.ctx.as_ref().unwrap();
            assert_eq!(ctx.availability, vec![1, 0, 1]);
            assert_eq!(ctx.seed_count, 0);
        }

        // a seed does not contribute to per piece availability
        let (b, _b_rx) = attach_peer(&mut fx.torrent, 6002);
        fx.torrent
            .handle_peer_event(b, PeerEvent::Bitfield(Bitfield::new_all_set(3)))
            .await
            .unwrap();
        {
            let ctx = fx.torrent.ctx.as_ref().unwrap();
            assert_eq!(ctx.availability, vec![1, 0, 1]);
            assert_eq!(ctx.seed_count, 1);
        }

        // the partial peer completing flips it into the seed count
        fx.torrent
            .handle_peer_event(a, PeerEvent::Have(1))
            .await
            .unwrap();
        {
            let ctx = fx.torrent.ctx.as_ref().unwrap();
            assert_eq!(ctx.availability, vec![0, 0, 0]);
            assert_eq!(ctx.seed_count, 2);
        }

        // disconnects unwind their contribution
        fx.torrent
            .handle_peer_event(a, PeerEvent::Closed)
            .await
            .unwrap();
        assert_eq!(fx.torrent.ctx.as_ref().unwrap().seed_count, 1);
    }

    #[tokio::test]
    async fn test_rarest_piece_is_started_first() {
        let piece_len = BLOCK_LEN;
        let mut fx = fixture(piece_len, 3);

        // piece 1 is the rarest: only the eventual requester has it
        let (a, _a_rx) = attach_peer(&mut fx.torrent, 6001);
        let mut common = Bitfield::new(3);
        common.set(0);
        common.set(2);
        fx.torrent
            .handle_peer_event(a, PeerEvent::Bitfield(common.clone()))
            .await
            .unwrap();
        let (b, _b_rx) = attach_peer(&mut fx.torrent, 6002);
        fx.torrent
            .handle_peer_event(b, PeerEvent::Bitfield(common))
            .await
            .unwrap();

        let (c, mut c_rx) = attach_peer(&mut fx.torrent, 6003);
        seed_peer(&mut fx.torrent, c, 3).await;
        let requests = requested_blocks(&drain_cmds(&mut c_rx));
        assert_eq!(requests[0].piece_index, 1);
    }
}
