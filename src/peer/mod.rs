//! The per peer connection: handshake, framing, message dispatch, and the
//! extension protocol.
//!
//! Each session runs as its own task and owns nothing but its socket and
//! receive buffer. It publishes what happens on the wire as [`PeerEvent`]s
//! into the torrent's event channel and acts on [`SessionCommand`]s sent
//! back by the torrent; all cross peer state (piece scheduling, uploads,
//! bans) lives with the torrent, so a misbehaving peer can only ever take
//! down its own session.

pub(crate) mod codec;
pub(crate) mod extension;

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use futures::{select, stream::Fuse, FutureExt, StreamExt};
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt, WriteHalf},
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time,
};
use tokio_util::codec::Encoder;

use crate::{
    chunk_buf::ChunkedBuffer,
    conf::PipelineConf,
    error::{Error, ProtocolViolation, Result},
    Bitfield, BlockInfo, InfoHash, PeerId, PieceIndex,
};

use codec::{
    decode_handshake, decode_message, Handshake, HandshakeCodec, Message,
    PeerCodec,
};
use extension::{ExtendedHandshake, MetadataMsg, EXT_HANDSHAKE_ID, OUR_METADATA_ID};

/// How much is read from the socket in one go.
const RECV_CHUNK_LEN: usize = 16 * 1024;

/// The largest block a peer may request from us.
const MAX_REQUEST_LEN: u32 = 128 * 1024;

/// The channel on which all sessions of a torrent publish their events,
/// tagged with the session's address.
pub(crate) type EventSender = UnboundedSender<(SocketAddr, PeerEvent)>;
pub(crate) type EventReceiver = UnboundedReceiver<(SocketAddr, PeerEvent)>;

/// The channel on which the torrent addresses one session.
pub(crate) type CommandSender = UnboundedSender<SessionCommand>;
type CommandReceiver = UnboundedReceiver<SessionCommand>;

/// What a session reports to its torrent. Events of one session arrive in
/// wire order; events of distinct sessions are interleaved arbitrarily.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    /// An outbound TCP connect succeeded, with how long it took.
    Connected { elapsed: Duration },
    /// An outbound TCP connect failed before the handshake.
    ConnectFailed { timed_out: bool },
    /// The wire handshake completed and the info hash checked out.
    HandshakeDone {
        peer_id: PeerId,
        /// Both sides support the extension protocol.
        ltep: bool,
        /// Both sides support the Fast extension.
        fast: bool,
    },
    /// The peer's extended handshake arrived.
    ExtendedHandshake {
        metadata_id: Option<u8>,
        metadata_size: Option<u64>,
        pex_id: Option<u8>,
        client: Option<String>,
    },
    /// The peer's full piece availability became known (bitfield, Fast
    /// shorthand, or deferred availability materialized once the piece
    /// count was learned).
    Bitfield(Bitfield),
    /// The peer announced a piece it previously did not have. Redundant
    /// HAVEs are swallowed by the session so availability is never double
    /// counted.
    Have(PieceIndex),
    Choked,
    Unchoked,
    Interested,
    NotInterested,
    /// A block of piece data arrived.
    Block { block: BlockInfo, data: Bytes },
    /// The peer requests a block from us.
    Request(BlockInfo),
    /// The peer cancelled one of its requests.
    Cancel(BlockInfo),
    MetadataRequest { piece: u32 },
    MetadataData {
        piece: u32,
        total_size: u64,
        data: Bytes,
    },
    MetadataReject { piece: u32 },
    /// The session is gone. Always the last event of a session.
    Closed,
}

/// What the torrent asks a session to do.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Request(BlockInfo),
    Cancel(BlockInfo),
    Have(PieceIndex),
    /// Announce our piece availability right after the handshake; the
    /// session picks BITFIELD or the Fast shorthands depending on what was
    /// negotiated.
    AnnouncePieces(Bitfield),
    Choke,
    Unchoke,
    SetInterested(bool),
    Piece { block: BlockInfo, data: Bytes },
    MetadataRequest(u32),
    MetadataData {
        piece: u32,
        total_size: u64,
        data: Bytes,
    },
    MetadataReject(u32),
    /// The torrent learned the piece count (metadata completed); deferred
    /// availability can now be materialized.
    PieceCountKnown(usize),
    Shutdown,
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    /// Waiting for the peer's 68 byte handshake.
    AwaitHandshake,
    /// The handshake was parsed; this is the window in which a bitfield (or
    /// Fast shorthand) may arrive.
    HandshakeReceived,
    /// The normal state: any message apart from the bitfield family may be
    /// exchanged.
    Active,
    /// Terminal; set on shutdown, transport error, or protocol violation.
    Closed,
}

/// The static parameters a session is started with.
#[derive(Clone, Debug)]
pub(crate) struct SessionContext {
    pub addr: SocketAddr,
    pub info_hash: InfoHash,
    pub client_id: PeerId,
    /// Known unless the torrent is still fetching its metadata.
    pub piece_count: Option<usize>,
    /// The size of our info dictionary, advertised in the extended
    /// handshake once we have it.
    pub metadata_size: Option<u64>,
    pub max_frame_len: u32,
    pub keep_alive_interval: Duration,
    /// Applied to the TCP connect of outbound sessions.
    pub connect_timeout: Duration,
}

/// The session half of a peer connection; see the module docs.
pub(crate) struct PeerSession {
    ctx: SessionContext,
    events: EventSender,
    /// The port on which the session receives commands from its torrent.
    cmd_port: Fuse<CommandReceiver>,
    /// Present for inbound sessions until the session starts.
    socket: Option<TcpStream>,
    is_outbound: bool,
    state: State,
    recv_buf: ChunkedBuffer,

    /// The peer's piece availability, authoritative for HAVE deduping.
    peer_pieces: Option<Bitfield>,
    /// Availability announcements that arrived before the piece count was
    /// known, replayed once it is.
    pending_bitfield: Option<Vec<u8>>,
    pending_have_all: bool,
    pending_haves: Vec<PieceIndex>,

    peer_choking: bool,
    peer_interested: bool,
    am_choking: bool,
    am_interested: bool,

    /// Set once both handshakes agree on the extension protocol.
    ltep: bool,
    /// Set once both handshakes agree on the Fast extension.
    fast: bool,
    /// The id the peer wants ut_metadata messages addressed by.
    peer_metadata_id: Option<u8>,
}

impl PeerSession {
    /// Creates a session that will connect out to the peer.
    pub fn outbound(
        ctx: SessionContext,
        events: EventSender,
    ) -> (Self, CommandSender) {
        Self::new(ctx, events, None, true)
    }

    /// Creates a session over an already accepted socket.
    pub fn inbound(
        ctx: SessionContext,
        events: EventSender,
        socket: TcpStream,
    ) -> (Self, CommandSender) {
        Self::new(ctx, events, Some(socket), false)
    }

    fn new(
        ctx: SessionContext,
        events: EventSender,
        socket: Option<TcpStream>,
        is_outbound: bool,
    ) -> (Self, CommandSender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                ctx,
                events,
                cmd_port: cmd_port.fuse(),
                socket,
                is_outbound,
                state: State::AwaitHandshake,
                recv_buf: ChunkedBuffer::new(),
                peer_pieces: None,
                pending_bitfield: None,
                pending_have_all: false,
                pending_haves: Vec::new(),
                peer_choking: true,
                peer_interested: false,
                am_choking: true,
                am_interested: false,
                ltep: false,
                fast: false,
                peer_metadata_id: None,
            },
            cmd_chan,
        )
    }

    /// Runs the session to completion. The final `Closed` event is emitted
    /// unconditionally so the torrent can always clean up after us.
    pub async fn start(mut self) {
        match self.run().await {
            Ok(()) => log::info!("Peer {} session ended", self.ctx.addr),
            Err(e) => {
                log::info!("Peer {} session stopped: {}", self.ctx.addr, e)
            }
        }
        self.state = State::Closed;
        let _ = self.events.send((self.ctx.addr, PeerEvent::Closed));
    }

    async fn run(&mut self) -> Result<()> {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => self.connect().await?,
        };

        let (mut read_half, write_half) = io::split(socket);
        let mut sink = Sink::new(write_half);

        // an outbound connection sends the first handshake
        if self.is_outbound {
            log::info!("Sending handshake to peer {}", self.ctx.addr);
            sink.send_handshake(Handshake::new(
                self.ctx.info_hash,
                self.ctx.client_id,
            ))
            .await?;
        }

        // what one turn of the session loop woke up for
        enum Turn {
            Read(usize),
            Cmd(SessionCommand),
            Tick,
        }

        let mut tick = time::interval(Duration::from_secs(1)).fuse();
        loop {
            let mut chunk = BytesMut::new();
            chunk.resize(RECV_CHUNK_LEN, 0);

            // the read future borrows the chunk, so resolve the turn first
            // and act on it once the borrow is over
            let turn = {
                let read = read_half.read(&mut chunk[..]).fuse();
                futures::pin_mut!(read);
                select! {
                    res = read => Turn::Read(res?),
                    cmd = self.cmd_port.select_next_some() => Turn::Cmd(cmd),
                    _ = tick.select_next_some() => Turn::Tick,
                }
            };

            match turn {
                Turn::Read(0) => {
                    log::info!(
                        "Peer {} closed the connection",
                        self.ctx.addr
                    );
                    return Ok(());
                }
                Turn::Read(n) => {
                    chunk.truncate(n);
                    self.recv_buf.push(chunk.freeze());
                    self.process_recv(&mut sink).await?;
                }
                Turn::Cmd(cmd) => {
                    if !self.handle_cmd(cmd, &mut sink).await? {
                        return Ok(());
                    }
                }
                Turn::Tick => self.on_tick(&mut sink).await?,
            }
        }
    }

    /// Establishes the outbound TCP connection under the adaptive connect
    /// timeout.
    async fn connect(&mut self) -> Result<TcpStream> {
        log::info!("Connecting to peer {}", self.ctx.addr);
        let started_at = Instant::now();
        match time::timeout(
            self.ctx.connect_timeout,
            TcpStream::connect(self.ctx.addr),
        )
        .await
        {
            Ok(Ok(socket)) => {
                let elapsed = started_at.elapsed();
                log::info!(
                    "Connected to peer {} in {} ms",
                    self.ctx.addr,
                    elapsed.as_millis()
                );
                self.emit(PeerEvent::Connected { elapsed })?;
                Ok(socket)
            }
            Ok(Err(e)) => {
                log::info!("Peer {} connect error: {}", self.ctx.addr, e);
                self.emit(PeerEvent::ConnectFailed { timed_out: false })?;
                Err(e.into())
            }
            Err(_) => {
                log::info!("Peer {} connect timed out", self.ctx.addr);
                self.emit(PeerEvent::ConnectFailed { timed_out: true })?;
                Err(Error::Timeout)
            }
        }
    }

    /// Frames and dispatches everything the receive buffer holds.
    async fn process_recv(&mut self, sink: &mut Sink) -> Result<()> {
        loop {
            match self.state {
                State::Closed => return Ok(()),
                State::AwaitHandshake => {
                    match decode_handshake(&mut self.recv_buf)? {
                        Some(handshake) => {
                            self.on_handshake(handshake, sink).await?
                        }
                        None => return Ok(()),
                    }
                }
                State::HandshakeReceived | State::Active => {
                    match decode_message(
                        &mut self.recv_buf,
                        self.ctx.max_frame_len,
                    )? {
                        Some(msg) => self.handle_msg(msg)?,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn on_handshake(
        &mut self,
        handshake: Handshake,
        sink: &mut Sink,
    ) -> Result<()> {
        log::info!("Received handshake from peer {}", self.ctx.addr);
        log::debug!("Peer {} handshake: {:?}", self.ctx.addr, handshake);

        // verify that the advertised torrent info hash is the same as ours
        if handshake.info_hash != self.ctx.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.ctx.addr);
            return Err(Error::Protocol(ProtocolViolation::WrongInfoHash));
        }

        // we advertise both extensions, so negotiation is just whether the
        // peer does too
        self.ltep = handshake.supports_ltep();
        self.fast = handshake.supports_fast();

        // an inbound connection replies with its own handshake
        if !self.is_outbound {
            log::info!("Sending handshake to peer {}", self.ctx.addr);
            sink.send_handshake(Handshake::new(
                self.ctx.info_hash,
                self.ctx.client_id,
            ))
            .await?;
        }

        self.state = State::HandshakeReceived;
        self.emit(PeerEvent::HandshakeDone {
            peer_id: handshake.peer_id,
            ltep: self.ltep,
            fast: self.fast,
        })?;

        if self.ltep {
            let payload =
                ExtendedHandshake::ours(self.ctx.metadata_size).to_bytes()?;
            sink.send(Message::Extended {
                id: EXT_HANDSHAKE_ID,
                payload,
            })
            .await?;
        }

        Ok(())
    }

    /// Dispatches one framed message. Nothing in here writes to the socket;
    /// all sends happen on the torrent's commands.
    fn handle_msg(&mut self, msg: Message) -> Result<()> {
        log::debug!(
            "Received message {:?} from peer {}",
            msg.id(),
            self.ctx.addr
        );

        // the bitfield family may only arrive directly after the handshake
        let in_bitfield_window = self.state == State::HandshakeReceived;
        // a keep-alive doesn't close the bitfield window, everything else
        // does
        if !matches!(msg, Message::KeepAlive) {
            self.state = State::Active;
        }

        match msg {
            Message::KeepAlive => {
                log::trace!("Peer {} sent keep alive", self.ctx.addr);
            }
            Message::Bitfield(raw) => {
                if !in_bitfield_window {
                    log::info!(
                        "Peer {} sent bitfield message not after handshake",
                        self.ctx.addr
                    );
                    return Err(Error::Protocol(
                        ProtocolViolation::UnexpectedBitfield,
                    ));
                }
                self.on_bitfield(raw)?;
            }
            Message::HaveAll | Message::HaveNone => {
                if !self.fast {
                    return Err(Error::Protocol(
                        ProtocolViolation::FastNotNegotiated,
                    ));
                }
                if !in_bitfield_window {
                    return Err(Error::Protocol(
                        ProtocolViolation::UnexpectedBitfield,
                    ));
                }
                self.on_have_shorthand(matches!(msg, Message::HaveAll))?;
            }
            Message::Choke => {
                if !self.peer_choking {
                    log::info!("Peer {} choked us", self.ctx.addr);
                    self.peer_choking = true;
                    self.emit(PeerEvent::Choked)?;
                }
            }
            Message::Unchoke => {
                if self.peer_choking {
                    log::info!("Peer {} unchoked us", self.ctx.addr);
                    self.peer_choking = false;
                    self.emit(PeerEvent::Unchoked)?;
                }
            }
            Message::Interested => {
                if !self.peer_interested {
                    log::info!("Peer {} is interested", self.ctx.addr);
                    self.peer_interested = true;
                    self.emit(PeerEvent::Interested)?;
                }
            }
            Message::NotInterested => {
                if self.peer_interested {
                    log::info!("Peer {} is not interested", self.ctx.addr);
                    self.peer_interested = false;
                    self.emit(PeerEvent::NotInterested)?;
                }
            }
            Message::Have { piece_index } => self.on_have(piece_index)?,
            Message::Request(block) => self.on_request(block)?,
            Message::Cancel(block) => self.emit(PeerEvent::Cancel(block))?,
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                if let Some(count) = self.ctx.piece_count {
                    if piece_index >= count {
                        return Err(Error::Protocol(
                            ProtocolViolation::OutOfRange,
                        ));
                    }
                }
                let block = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.emit(PeerEvent::Block { block, data })?;
            }
            Message::Extended { id, payload } => {
                self.on_extended(id, payload)?
            }
        }
        Ok(())
    }

    fn on_bitfield(&mut self, raw: Vec<u8>) -> Result<()> {
        log::info!("Handling peer {} bitfield message", self.ctx.addr);
        match self.ctx.piece_count {
            Some(count) => {
                // The bitfield raw data that is sent over the wire may be
                // longer than the logical pieces it represents, if the
                // number of pieces in torrent is not a multiple of 8.
                let bitfield = Bitfield::from_bytes(&raw, count).ok_or(
                    Error::Protocol(ProtocolViolation::OutOfRange),
                )?;
                self.peer_pieces = Some(bitfield.clone());
                self.emit(PeerEvent::Bitfield(bitfield))?;
            }
            // defer until the metadata tells us the piece count
            None => self.pending_bitfield = Some(raw),
        }
        Ok(())
    }

    fn on_have_shorthand(&mut self, all: bool) -> Result<()> {
        match self.ctx.piece_count {
            Some(count) => {
                let bitfield = if all {
                    Bitfield::new_all_set(count)
                } else {
                    Bitfield::new(count)
                };
                self.peer_pieces = Some(bitfield.clone());
                self.emit(PeerEvent::Bitfield(bitfield))?;
            }
            None => self.pending_have_all = all,
        }
        Ok(())
    }

    fn on_have(&mut self, piece_index: PieceIndex) -> Result<()> {
        if let Some(count) = self.ctx.piece_count {
            if piece_index >= count {
                return Err(Error::Protocol(ProtocolViolation::OutOfRange));
            }
            let pieces = self
                .peer_pieces
                .get_or_insert_with(|| Bitfield::new(count));
            // only a fresh HAVE mutates state and is surfaced; a redundant
            // one would double count availability
            if pieces.set(piece_index) {
                self.emit(PeerEvent::Have(piece_index))?;
            }
        } else {
            self.pending_haves.push(piece_index);
        }
        Ok(())
    }

    fn on_request(&mut self, block: BlockInfo) -> Result<()> {
        if self.am_choking {
            log::info!(
                "Peer {} requested a block while choked",
                self.ctx.addr
            );
            return Err(Error::Protocol(
                ProtocolViolation::RequestWhileChoked,
            ));
        }
        if block.len == 0 || block.len > MAX_REQUEST_LEN {
            return Err(Error::Protocol(ProtocolViolation::OutOfRange));
        }
        if let Some(count) = self.ctx.piece_count {
            if block.piece_index >= count {
                return Err(Error::Protocol(ProtocolViolation::OutOfRange));
            }
        }
        self.emit(PeerEvent::Request(block))
    }

    fn on_extended(&mut self, id: u8, payload: Bytes) -> Result<()> {
        match id {
            EXT_HANDSHAKE_ID => {
                let handshake = ExtendedHandshake::from_bytes(&payload)?;
                log::debug!(
                    "Peer {} extended handshake: {:?}",
                    self.ctx.addr,
                    handshake
                );

                // hybrid v1/v2 peers hash pieces differently than we do;
                // the session must not continue
                if handshake.has_hybrid_hash() {
                    log::info!(
                        "Peer {} is on a hybrid torrent, closing",
                        self.ctx.addr
                    );
                    return Err(Error::Protocol(
                        ProtocolViolation::HybridTorrent,
                    ));
                }

                self.peer_metadata_id = handshake.ut_metadata_id();
                self.emit(PeerEvent::ExtendedHandshake {
                    metadata_id: self.peer_metadata_id,
                    metadata_size: handshake.metadata_size(),
                    pex_id: handshake.ut_pex_id(),
                    client: handshake.client_name(),
                })?;
            }
            OUR_METADATA_ID => match MetadataMsg::decode(&payload)? {
                MetadataMsg::Request { piece } => {
                    self.emit(PeerEvent::MetadataRequest { piece })?
                }
                MetadataMsg::Data {
                    piece,
                    total_size,
                    data,
                } => self.emit(PeerEvent::MetadataData {
                    piece,
                    total_size,
                    data,
                })?,
                MetadataMsg::Reject { piece } => {
                    self.emit(PeerEvent::MetadataReject { piece })?
                }
            },
            id => {
                // an extension we didn't advertise; harmless
                log::debug!(
                    "Peer {} sent unknown extended message {}",
                    self.ctx.addr,
                    id
                );
            }
        }
        Ok(())
    }

    /// Executes one command from the torrent. Returns false on shutdown.
    async fn handle_cmd(
        &mut self,
        cmd: SessionCommand,
        sink: &mut Sink,
    ) -> Result<bool> {
        match cmd {
            SessionCommand::Request(block) => {
                sink.send(Message::Request(block)).await?
            }
            SessionCommand::Cancel(block) => {
                sink.send(Message::Cancel(block)).await?
            }
            SessionCommand::Have(piece_index) => {
                sink.send(Message::Have { piece_index }).await?
            }
            SessionCommand::AnnouncePieces(pieces) => {
                // the Fast shorthands beat a full bitfield, and an empty
                // availability without Fast is conveyed by silence
                if self.fast && pieces.is_all_set() {
                    sink.send(Message::HaveAll).await?
                } else if self.fast && pieces.count() == 0 {
                    sink.send(Message::HaveNone).await?
                } else if pieces.count() > 0 {
                    sink.send(Message::Bitfield(pieces.to_bytes())).await?
                }
            }
            SessionCommand::Choke => {
                if !self.am_choking {
                    self.am_choking = true;
                    sink.send(Message::Choke).await?
                }
            }
            SessionCommand::Unchoke => {
                if self.am_choking {
                    self.am_choking = false;
                    sink.send(Message::Unchoke).await?
                }
            }
            SessionCommand::SetInterested(interested) => {
                if self.am_interested != interested {
                    self.am_interested = interested;
                    let msg = if interested {
                        Message::Interested
                    } else {
                        Message::NotInterested
                    };
                    sink.send(msg).await?
                }
            }
            SessionCommand::Piece { block, data } => {
                debug_assert_eq!(block.len as usize, data.len());
                sink.send(Message::Piece {
                    piece_index: block.piece_index,
                    offset: block.offset,
                    data,
                })
                .await?
            }
            SessionCommand::MetadataRequest(piece) => {
                self.send_metadata_msg(
                    MetadataMsg::Request { piece },
                    sink,
                )
                .await?
            }
            SessionCommand::MetadataData {
                piece,
                total_size,
                data,
            } => {
                self.send_metadata_msg(
                    MetadataMsg::Data {
                        piece,
                        total_size,
                        data,
                    },
                    sink,
                )
                .await?
            }
            SessionCommand::MetadataReject(piece) => {
                self.send_metadata_msg(
                    MetadataMsg::Reject { piece },
                    sink,
                )
                .await?
            }
            SessionCommand::PieceCountKnown(count) => {
                self.on_piece_count_known(count)?
            }
            SessionCommand::Shutdown => {
                log::info!("Shutting down peer {} session", self.ctx.addr);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Sends a ut_metadata message under the id the peer advertised for it.
    async fn send_metadata_msg(
        &mut self,
        msg: MetadataMsg,
        sink: &mut Sink,
    ) -> Result<()> {
        let id = match self.peer_metadata_id {
            Some(id) => id,
            None => {
                log::debug!(
                    "Peer {} does not support ut_metadata",
                    self.ctx.addr
                );
                return Ok(());
            }
        };
        let payload = msg.encode()?;
        sink.send(Message::Extended { id, payload }).await
    }

    /// Materializes availability that had to wait for the piece count.
    fn on_piece_count_known(&mut self, count: usize) -> Result<()> {
        self.ctx.piece_count = Some(count);

        let bitfield = if let Some(raw) = self.pending_bitfield.take() {
            Some(Bitfield::from_bytes(&raw, count).ok_or(Error::Protocol(
                ProtocolViolation::OutOfRange,
            ))?)
        } else if self.pending_have_all {
            self.pending_have_all = false;
            Some(Bitfield::new_all_set(count))
        } else if !self.pending_haves.is_empty() {
            let mut bitfield = Bitfield::new(count);
            for piece in self.pending_haves.drain(..) {
                if piece >= count {
                    return Err(Error::Protocol(
                        ProtocolViolation::OutOfRange,
                    ));
                }
                bitfield.set(piece);
            }
            Some(bitfield)
        } else {
            None
        };

        if let Some(bitfield) = bitfield {
            self.peer_pieces = Some(bitfield.clone());
            self.emit(PeerEvent::Bitfield(bitfield))?;
        }
        Ok(())
    }

    async fn on_tick(&mut self, sink: &mut Sink) -> Result<()> {
        // don't let the peer's inactivity timer starve us out
        if self.state != State::AwaitHandshake
            && sink.last_write.elapsed() >= self.ctx.keep_alive_interval
        {
            sink.send(Message::KeepAlive).await?;
        }
        Ok(())
    }

    fn emit(&self, event: PeerEvent) -> Result<()> {
        self.events
            .send((self.ctx.addr, event))
            .map_err(|_| Error::Channel)
    }
}

/// The socket write half with its encode buffer.
struct Sink {
    write_half: WriteHalf<TcpStream>,
    buf: BytesMut,
    last_write: Instant,
}

impl Sink {
    fn new(write_half: WriteHalf<TcpStream>) -> Self {
        Self {
            write_half,
            buf: BytesMut::new(),
            last_write: Instant::now(),
        }
    }

    async fn send(&mut self, msg: Message) -> Result<()> {
        PeerCodec.encode(msg, &mut self.buf)?;
        self.flush().await
    }

    async fn send_handshake(&mut self, handshake: Handshake) -> Result<()> {
        HandshakeCodec.encode(handshake, &mut self.buf)?;
        self.flush().await
    }

    async fn flush(&mut self) -> Result<()> {
        self.write_half.write_all(&self.buf).await?;
        self.buf.clear();
        self.last_write = Instant::now();
        Ok(())
    }
}

/// The adaptive request pipeline depth of one peer.
///
/// The torrent keeps one of these per peer, counts received blocks into it,
/// and ticks it once a second: a peer delivering quickly gets a deeper
/// pipeline, a slow one drains back towards the initial depth, and a CHOKE
/// halves it outright as a congestion signal.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Pipeline {
    conf: PipelineConf,
    depth: usize,
    blocks_in_round: u32,
}

impl Pipeline {
    pub fn new(conf: PipelineConf) -> Self {
        Self {
            conf,
            depth: conf.initial_depth,
            blocks_in_round: 0,
        }
    }

    /// The number of requests that may be in flight to this peer.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn record_block(&mut self) {
        self.blocks_in_round += 1;
    }

    /// Closes a one second round and adapts the depth to the observed rate.
    pub fn tick(&mut self) {
        let rate = self.blocks_in_round;
        self.blocks_in_round = 0;
        if rate > self.conf.raise_rate {
            self.depth = (self.depth + self.conf.raise_step)
                .min(self.conf.max_depth);
        } else if rate < self.conf.lower_rate
            && self.depth > self.conf.initial_depth
        {
            // rate based draining never goes below the initial depth; only
            // a choke does
            self.depth = self
                .depth
                .saturating_sub(self.conf.lower_step)
                .max(self.conf.initial_depth);
        }
    }

    /// A CHOKE is a congestion signal: halve the pipeline.
    pub fn on_choke(&mut self) {
        self.depth = (self.depth / 2).max(self.conf.min_depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    mod session {
        use super::*;
        use pretty_assertions::assert_eq;
        use tokio::net::TcpListener;

        async fn next_event(
            events: &mut EventReceiver,
        ) -> (SocketAddr, PeerEvent) {
            time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for a session event")
                .expect("event channel closed")
        }

        /// Drives an outbound session against a scripted remote end:
        /// handshake exchange, availability, HAVE deduping, and an outgoing
        /// request.
        #[tokio::test]
        async fn test_outbound_session_against_scripted_peer() {
            let mut listener =
                TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let info_hash = [7; 20];

            let (events_tx, mut events) = mpsc::unbounded_channel();
            let ctx = SessionContext {
                addr,
                info_hash,
                client_id: *b"tdt-0123456789012345",
                piece_count: Some(4),
                metadata_size: None,
                max_frame_len: 1 << 20,
                keep_alive_interval: Duration::from_secs(120),
                connect_timeout: Duration::from_secs(5),
            };
            let (session, cmd) = PeerSession::outbound(ctx, events_tx);
            tokio::spawn(session.start());

            let (mut remote, _) = listener.accept().await.unwrap();

            // the session sends the first handshake, advertising both
            // extensions
            let mut their_handshake = [0u8; codec::HANDSHAKE_LEN];
            remote.read_exact(&mut their_handshake).await.unwrap();
            assert_eq!(
                &their_handshake[1..20],
                codec::PROTOCOL_STRING.as_bytes()
            );
            assert_eq!(&their_handshake[28..48], &info_hash[..]);
            assert_eq!(
                &their_handshake[48..68],
                &b"tdt-0123456789012345"[..]
            );

            // reply as a plain peer without extensions
            let mut reply = Handshake::new(info_hash, [9; 20]);
            reply.reserved = [0; 8];
            let mut wire = BytesMut::new();
            HandshakeCodec.encode(reply, &mut wire).unwrap();
            PeerCodec
                .encode(Message::Bitfield(vec![0b1010_0000]), &mut wire)
                .unwrap();
            PeerCodec.encode(Message::Unchoke, &mut wire).unwrap();
            PeerCodec
                .encode(Message::Have { piece_index: 1 }, &mut wire)
                .unwrap();
            // a redundant HAVE must be swallowed by the session
            PeerCodec
                .encode(Message::Have { piece_index: 1 }, &mut wire)
                .unwrap();
            remote.write_all(&wire).await.unwrap();

            assert!(matches!(
                next_event(&mut events).await,
                (a, PeerEvent::Connected { .. }) if a == addr
            ));
            match next_event(&mut events).await.1 {
                PeerEvent::HandshakeDone {
                    peer_id,
                    ltep,
                    fast,
                } => {
                    assert_eq!(peer_id, [9; 20]);
                    assert!(!ltep);
                    assert!(!fast);
                }
                other => panic!("expected handshake event, got {:?}", other),
            }
            match next_event(&mut events).await.1 {
                PeerEvent::Bitfield(pieces) => {
                    assert_eq!(pieces.len(), 4);
                    assert!(pieces.has(0));
                    assert!(!pieces.has(1));
                    assert!(pieces.has(2));
                }
                other => panic!("expected bitfield event, got {:?}", other),
            }
            assert!(matches!(
                next_event(&mut events).await.1,
                PeerEvent::Unchoked
            ));
            assert!(matches!(
                next_event(&mut events).await.1,
                PeerEvent::Have(1)
            ));

            // a request command goes out as a wire REQUEST frame
            let block = BlockInfo {
                piece_index: 0,
                offset: 0,
                len: crate::BLOCK_LEN,
            };
            cmd.send(SessionCommand::Request(block)).unwrap();
            let mut frame = [0u8; 17];
            remote.read_exact(&mut frame).await.unwrap();
            let mut expected = BytesMut::new();
            PeerCodec
                .encode(Message::Request(block), &mut expected)
                .unwrap();
            assert_eq!(&frame[..], &expected[..]);

            // the remote answers with the block
            let mut wire = BytesMut::new();
            PeerCodec
                .encode(
                    Message::Piece {
                        piece_index: 0,
                        offset: 0,
                        data: Bytes::from(vec![0xab; crate::BLOCK_LEN as usize]),
                    },
                    &mut wire,
                )
                .unwrap();
            remote.write_all(&wire).await.unwrap();
            match next_event(&mut events).await.1 {
                PeerEvent::Block { block: b, data } => {
                    assert_eq!(b, block);
                    assert_eq!(data.len(), crate::BLOCK_LEN as usize);
                }
                other => panic!("expected block event, got {:?}", other),
            }

            // shutdown ends the session with a final Closed event
            cmd.send(SessionCommand::Shutdown).unwrap();
            assert!(matches!(
                next_event(&mut events).await.1,
                PeerEvent::Closed
            ));
        }

        /// A wrong info hash in the peer's handshake must end the session.
        #[tokio::test]
        async fn test_wrong_info_hash_closes_session() {
            let mut listener =
                TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let (events_tx, mut events) = mpsc::unbounded_channel();
            let ctx = SessionContext {
                addr,
                info_hash: [7; 20],
                client_id: *b"tdt-0123456789012345",
                piece_count: Some(4),
                metadata_size: None,
                max_frame_len: 1 << 20,
                keep_alive_interval: Duration::from_secs(120),
                connect_timeout: Duration::from_secs(5),
            };
            let (session, _cmd) = PeerSession::outbound(ctx, events_tx);
            tokio::spawn(session.start());

            let (mut remote, _) = listener.accept().await.unwrap();
            let mut their_handshake = [0u8; codec::HANDSHAKE_LEN];
            remote.read_exact(&mut their_handshake).await.unwrap();

            let mut wire = BytesMut::new();
            HandshakeCodec
                .encode(Handshake::new([8; 20], [9; 20]), &mut wire)
                .unwrap();
            remote.write_all(&wire).await.unwrap();

            loop {
                match next_event(&mut events).await.1 {
                    PeerEvent::Closed => break,
                    PeerEvent::Connected { .. } => continue,
                    other => {
                        panic!("expected session close, got {:?}", other)
                    }
                }
            }
        }
    }

    mod pipeline {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn test_fast_delivery_deepens_up_to_the_cap() {
            let conf = PipelineConf::default();
            let mut pipeline = Pipeline::new(conf);
            assert_eq!(pipeline.depth(), 50);

            // 15 blocks/s for three rounds
            for round in 1..=3 {
                for _ in 0..15 {
                    pipeline.record_block();
                }
                pipeline.tick();
                assert_eq!(pipeline.depth(), 50 + round * conf.raise_step);
            }

            // and it never exceeds the cap
            for _ in 0..100 {
                for _ in 0..15 {
                    pipeline.record_block();
                }
                pipeline.tick();
            }
            assert_eq!(pipeline.depth(), conf.max_depth);
        }

        #[test]
        fn test_slow_delivery_drains_to_initial_depth_only() {
            let conf = PipelineConf::default();
            let mut pipeline = Pipeline::new(conf);
            for _ in 0..2 {
                for _ in 0..15 {
                    pipeline.record_block();
                }
                pipeline.tick();
            }
            assert_eq!(pipeline.depth(), 150);

            // a stall drains the depth, but not below the initial depth
            for _ in 0..100 {
                pipeline.tick();
            }
            assert_eq!(pipeline.depth(), conf.initial_depth);
        }

        #[test]
        fn test_choke_halves_down_to_the_floor() {
            let conf = PipelineConf::default();
            let mut pipeline = Pipeline::new(conf);
            pipeline.on_choke();
            assert_eq!(pipeline.depth(), 25);
            pipeline.on_choke();
            assert_eq!(pipeline.depth(), 12);
            for _ in 0..10 {
                pipeline.on_choke();
            }
            assert_eq!(pipeline.depth(), conf.min_depth);
        }

        #[test]
        fn test_moderate_rate_leaves_depth_alone() {
            let mut pipeline = Pipeline::new(PipelineConf::default());
            // 5 blocks/s is between the lower and raise thresholds
            for _ in 0..10 {
                for _ in 0..5 {
                    pipeline.record_block();
                }
                pipeline.tick();
            }
            assert_eq!(pipeline.depth(), 50);

            // a choked down pipeline is not raised back by a slow round
            pipeline.on_choke();
            pipeline.tick();
            assert_eq!(pipeline.depth(), 25);
        }
    }
}
