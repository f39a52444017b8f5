use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use floscan_primitives::block::{Block, BlockHeader};
use floscan_primitives::hash::{BlockHash, Rhash};
use floscan_primitives::transaction::Transaction;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::p2p::{self, DisconnectClass, InventoryVector, NetTotals, Peer, PeerError, PeerWriter};

/// How often an open session asks its peer for more addresses.
pub const ADDR_REQUEST_INTERVAL_SECS: u64 = 60;
/// A `headers` batch at or above this size resets the sliding window.
pub const MID_SYNC_RESET_THRESHOLD: usize = 1000;

const CONNECT_TIMEOUT_SECS: u64 = 5;
const HANDSHAKE_TIMEOUT_SECS: u64 = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionPhase {
    Dialing,
    Handshaking,
    Open,
    HeaderSync,
    BlockSync,
    Live,
    Dead,
}

impl SessionPhase {
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            SessionPhase::Open | SessionPhase::HeaderSync | SessionPhase::BlockSync | SessionPhase::Live
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionPhase::Dialing => "dialing",
            SessionPhase::Handshaking => "handshaking",
            SessionPhase::Open => "open",
            SessionPhase::HeaderSync => "header-sync",
            SessionPhase::BlockSync => "block-sync",
            SessionPhase::Live => "live",
            SessionPhase::Dead => "dead",
        }
    }
}

/// Messages a session posts back to the supervisor loop.
#[derive(Debug)]
pub enum SessionEvent {
    /// One gossiped `host:port`, straight from an `addr` payload.
    Address { addr: String },
    /// The session failed with a non-silent error class.
    Disconnect { peer_hash: String, was_open: bool },
}

#[derive(Debug)]
pub enum SessionCommand {
    /// Re-issue `getblocks` from the current block cursor (stall recovery).
    RequestBlocks,
    Destroy,
}

/// Capabilities the supervisor hands to each session at construction.
#[derive(Clone)]
pub struct SessionContext {
    pub magic: [u8; 4],
    pub anchor: BlockHash,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub net_totals: Arc<NetTotals>,
}

pub struct SessionState {
    pub phase: SessionPhase,
    pub best_height_reported: i32,
    pub user_agent: String,
    pub protocol_version: i32,
    pub headers_buffer: Vec<BlockHeader>,
    pub last_header: Option<BlockHeader>,
    pub last_header_hash: BlockHash,
    pub header_sync_complete: bool,
    pub block_map: HashMap<Rhash, Block>,
    pub block_height_map: HashMap<Rhash, i32>,
    pub requested_blocks: HashSet<BlockHash>,
    pub last_block_hash: BlockHash,
    pub last_rblock_hash: Rhash,
    pub initial_sync_complete: bool,
    pub mempool: Vec<Transaction>,
}

impl SessionState {
    pub fn new(anchor: BlockHash) -> Self {
        SessionState {
            phase: SessionPhase::Dialing,
            best_height_reported: -1,
            user_agent: String::new(),
            protocol_version: 0,
            headers_buffer: Vec::new(),
            last_header: None,
            last_header_hash: anchor,
            header_sync_complete: false,
            block_map: HashMap::new(),
            block_height_map: HashMap::new(),
            requested_blocks: HashSet::new(),
            last_block_hash: anchor,
            last_rblock_hash: anchor.reversed(),
            initial_sync_complete: false,
            mempool: Vec::new(),
        }
    }

    fn release_caches(&mut self) {
        self.headers_buffer = Vec::new();
        self.last_header = None;
        self.block_map = HashMap::new();
        self.block_height_map = HashMap::new();
        self.requested_blocks = HashSet::new();
        self.mempool = Vec::new();
    }
}

/// Immutable projection of one session, consumed by ChainView and status.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub peer_hash: String,
    pub addr: String,
    pub phase: SessionPhase,
    pub user_agent: String,
    pub protocol_version: i32,
    pub best_height_reported: i32,
    pub header_sync_complete: bool,
    pub initial_sync_complete: bool,
    pub headers_buffered: usize,
    pub blocks_received: usize,
    pub requested_blocks: usize,
    pub mempool_size: usize,
    pub last_header_hash: BlockHash,
    pub last_block_hash: BlockHash,
    pub last_rblock_hash: Rhash,
    pub block_heights: BTreeMap<i32, Rhash>,
}

/// One supervised outbound connection.
///
/// The session's task owns the socket; everything else observes through
/// [`PeerSession::snapshot`] or talks to it over the command channel.
pub struct PeerSession {
    peer_hash: String,
    addr: String,
    sock_addr: SocketAddr,
    state: Arc<Mutex<SessionState>>,
    ctx: SessionContext,
    commands: mpsc::UnboundedSender<SessionCommand>,
    command_rx: Option<mpsc::UnboundedReceiver<SessionCommand>>,
    destroyed: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl PeerSession {
    pub fn new(peer_hash: String, addr: String, ctx: SessionContext) -> Result<Self, String> {
        let sock_addr = addr
            .parse::<SocketAddr>()
            .map_err(|_| format!("unparseable peer address '{addr}'"))?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(SessionState::new(ctx.anchor)));
        Ok(PeerSession {
            peer_hash,
            addr,
            sock_addr,
            state,
            ctx,
            commands,
            command_rx: Some(command_rx),
            destroyed: Arc::new(AtomicBool::new(false)),
            task: None,
        })
    }

    pub fn peer_hash(&self) -> &str {
        &self.peer_hash
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Dials the peer and drives the session to completion on its own task.
    pub fn start(&mut self) {
        let Some(command_rx) = self.command_rx.take() else {
            return;
        };
        let driver = SessionDriver {
            peer_hash: self.peer_hash.clone(),
            addr: self.sock_addr,
            state: Arc::clone(&self.state),
            ctx: self.ctx.clone(),
            destroyed: Arc::clone(&self.destroyed),
        };
        self.task = Some(tokio::spawn(driver.run(command_rx)));
    }

    /// Cancels the session task, closes the socket, and releases the heavy
    /// caches. Safe to call any number of times.
    pub fn destroy(&mut self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(SessionCommand::Destroy);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Ok(mut state) = self.state.lock() {
            state.phase = SessionPhase::Dead;
            state.release_caches();
        }
    }

    pub fn is_open(&self) -> bool {
        if self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        self.state
            .lock()
            .map(|state| state.phase.is_open())
            .unwrap_or(false)
    }

    pub fn request_blocks(&self) {
        let _ = self.commands.send(SessionCommand::RequestBlocks);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().expect("session state poisoned");
        let mut block_heights = BTreeMap::new();
        for (rhash, height) in state.block_height_map.iter() {
            block_heights.insert(*height, *rhash);
        }
        SessionSnapshot {
            peer_hash: self.peer_hash.clone(),
            addr: self.addr.clone(),
            phase: state.phase,
            user_agent: state.user_agent.clone(),
            protocol_version: state.protocol_version,
            best_height_reported: state.best_height_reported,
            header_sync_complete: state.header_sync_complete,
            initial_sync_complete: state.initial_sync_complete,
            headers_buffered: state.headers_buffer.len(),
            blocks_received: state.block_map.len(),
            requested_blocks: state.requested_blocks.len(),
            mempool_size: state.mempool.len(),
            last_header_hash: state.last_header_hash,
            last_block_hash: state.last_block_hash,
            last_rblock_hash: state.last_rblock_hash,
            block_heights,
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct SessionDriver {
    peer_hash: String,
    addr: SocketAddr,
    state: Arc<Mutex<SessionState>>,
    ctx: SessionContext,
    destroyed: Arc<AtomicBool>,
}

impl SessionDriver {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        let connect = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Peer::connect(self.addr, self.ctx.magic, Arc::clone(&self.ctx.net_totals)),
        );
        let mut peer = match connect.await {
            Ok(Ok(peer)) => peer,
            Ok(Err(err)) => return self.finish_with_error(err),
            Err(_) => {
                return self.finish_with_error(PeerError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection timed out",
                )))
            }
        };

        self.set_phase(SessionPhase::Handshaking);
        let handshake = tokio::time::timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            peer.handshake(0),
        );
        let info = match handshake.await {
            Ok(Ok(info)) => info,
            Ok(Err(err)) => return self.finish_with_error(err),
            Err(_) => return self.finish_with_error(PeerError::Stalling("handshake timed out")),
        };

        let anchor = self.ctx.anchor;
        {
            let mut state = self.state.lock().expect("session state poisoned");
            state.best_height_reported = info.start_height;
            state.user_agent = info.user_agent;
            state.protocol_version = info.version;
            state.phase = SessionPhase::Open;
        }
        debug!(
            peer = %self.addr,
            height = info.start_height,
            version = info.version,
            "peer open"
        );

        let (mut reader, mut writer) = peer.split();
        self.set_phase(SessionPhase::HeaderSync);
        self.swallow_send(writer.send_getheaders(&[anchor]).await, "getheaders");

        let mut addr_timer =
            tokio::time::interval(Duration::from_secs(ADDR_REQUEST_INTERVAL_SECS));
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(SessionCommand::RequestBlocks) => {
                        let cursor = self
                            .state
                            .lock()
                            .map(|state| state.last_block_hash)
                            .unwrap_or(anchor);
                        debug!(peer = %self.addr, "re-driving block sync");
                        self.swallow_send(writer.send_getblocks(&[cursor]).await, "getblocks");
                    }
                    Some(SessionCommand::Destroy) | None => {
                        writer.shutdown().await;
                        return;
                    }
                },
                _ = addr_timer.tick() => {
                    self.swallow_send(writer.send_getaddr().await, "getaddr");
                }
                message = reader.read_message() => match message {
                    Ok((command, payload)) => {
                        self.handle_packet(&mut writer, &command, &payload).await;
                    }
                    Err(err) => return self.finish_with_error(err),
                },
            }
        }
    }

    async fn handle_packet(&self, peer: &mut PeerWriter, command: &str, payload: &[u8]) {
        match command {
            "addr" => self.on_addr(payload),
            "headers" => self.on_headers(peer, payload).await,
            "inv" => self.on_inv(peer, payload).await,
            "block" => self.on_block(peer, payload).await,
            "tx" => self.on_tx(payload),
            // Keepalive is codec duty; the session treats the verb as noise.
            "ping" => self.swallow_send(peer.send_pong(payload).await, "pong"),
            "version" | "verack" | "pong" | "sendcmpct" | "sendheaders" | "getheaders"
            | "feefilter" => {
                trace!(peer = %self.addr, command, "ignoring");
            }
            other => {
                debug!(peer = %self.addr, command = other, "dropping unhandled message");
            }
        }
    }

    fn on_addr(&self, payload: &[u8]) {
        let addrs = match p2p::parse_addr(payload) {
            Ok(addrs) => addrs,
            Err(err) => {
                debug!(peer = %self.addr, %err, "malformed addr payload");
                return;
            }
        };
        if addrs.is_empty() {
            return;
        }
        trace!(peer = %self.addr, count = addrs.len(), "addr gossip");
        for addr in addrs {
            let _ = self.ctx.events.send(SessionEvent::Address {
                addr: addr.to_string(),
            });
        }
    }

    async fn on_headers(&self, peer: &mut PeerWriter, payload: &[u8]) {
        let headers = match p2p::parse_headers(payload) {
            Ok(headers) => headers,
            Err(err) => {
                debug!(peer = %self.addr, %err, "malformed headers payload");
                return;
            }
        };
        let action = {
            let mut state = self.state.lock().expect("session state poisoned");
            apply_headers(&mut state, headers)
        };
        match action {
            HeadersAction::RequestMore(from) => {
                self.swallow_send(peer.send_getheaders(&[from]).await, "getheaders");
            }
            HeadersAction::BeginBlockSync(from) => {
                debug!(peer = %self.addr, "header sync complete, fetching blocks");
                self.swallow_send(peer.send_getblocks(&[from]).await, "getblocks");
            }
            HeadersAction::Synced => {
                debug!(peer = %self.addr, "nothing beyond anchor, session live");
            }
            HeadersAction::AlreadyComplete => {
                trace!(peer = %self.addr, "headers after sync completion dropped");
            }
        }
    }

    async fn on_inv(&self, peer: &mut PeerWriter, payload: &[u8]) {
        let items = match p2p::parse_inv(payload) {
            Ok(items) => items,
            Err(err) => {
                debug!(peer = %self.addr, %err, "malformed inv payload");
                return;
            }
        };
        let request = {
            let mut state = self.state.lock().expect("session state poisoned");
            apply_inv(&mut state, &items)
        };
        if request.is_empty() {
            return;
        }
        trace!(peer = %self.addr, count = request.len(), "requesting inventory");
        self.swallow_send(peer.send_getdata(&request).await, "getdata");
    }

    async fn on_block(&self, peer: &mut PeerWriter, payload: &[u8]) {
        let block = match Block::consensus_decode(payload) {
            Ok(block) => block,
            Err(err) => {
                debug!(peer = %self.addr, %err, "malformed block payload");
                return;
            }
        };
        let action = {
            let mut state = self.state.lock().expect("session state poisoned");
            apply_block(&mut state, block)
        };
        match action {
            BlockAction::ContinueSync(from) => {
                self.swallow_send(peer.send_getblocks(&[from]).await, "getblocks");
            }
            BlockAction::SyncComplete => {
                debug!(peer = %self.addr, "initial block sync complete");
            }
            BlockAction::None => {}
        }
    }

    fn on_tx(&self, payload: &[u8]) {
        let tx = match Transaction::consensus_decode(payload) {
            Ok(tx) => tx,
            Err(err) => {
                debug!(peer = %self.addr, %err, "malformed tx payload");
                return;
            }
        };
        let mut state = self.state.lock().expect("session state poisoned");
        state.mempool.push(tx);
    }

    fn set_phase(&self, phase: SessionPhase) {
        if let Ok(mut state) = self.state.lock() {
            state.phase = phase;
        }
    }

    /// Post-close sends are expected to fail; the read side of the loop will
    /// surface the real error and drive the disconnect path.
    fn swallow_send(&self, result: Result<(), PeerError>, what: &'static str) {
        if let Err(err) = result {
            trace!(peer = %self.addr, what, %err, "send failed");
        }
    }

    fn finish_with_error(&self, err: PeerError) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let was_open = {
            let mut state = self.state.lock().expect("session state poisoned");
            let was_open = state.phase.is_open();
            state.phase = SessionPhase::Dead;
            state.release_caches();
            was_open
        };
        match err.disconnect_class() {
            DisconnectClass::Silent => {
                trace!(peer = %self.addr, %err, "connection reset, ignoring");
            }
            DisconnectClass::Quiet => {
                let _ = self.ctx.events.send(SessionEvent::Disconnect {
                    peer_hash: self.peer_hash.clone(),
                    was_open,
                });
            }
            DisconnectClass::Loud => {
                error!(peer = %self.addr, %err, "peer session failed");
                let _ = self.ctx.events.send(SessionEvent::Disconnect {
                    peer_hash: self.peer_hash.clone(),
                    was_open,
                });
            }
        }
    }
}

pub(crate) enum HeadersAction {
    RequestMore(BlockHash),
    BeginBlockSync(BlockHash),
    Synced,
    AlreadyComplete,
}

/// Folds one `headers` batch into the session per the sync contract:
/// a batch of ≥ 1000 resets the sliding window first, a full batch of 2000
/// advances the cursor and asks for more, and anything shorter completes
/// header sync and hands over to block sync from the window start.
pub(crate) fn apply_headers(state: &mut SessionState, headers: Vec<BlockHeader>) -> HeadersAction {
    if state.header_sync_complete {
        return HeadersAction::AlreadyComplete;
    }
    let batch_len = headers.len();
    if batch_len >= MID_SYNC_RESET_THRESHOLD {
        state.headers_buffer.clear();
    }
    state.headers_buffer.extend(headers);
    if let Some(tip) = state.headers_buffer.last() {
        state.last_header = Some(tip.clone());
    }

    if batch_len == floscan_consensus::constants::MAX_HEADERS_RESULTS {
        if let Some(tip) = state.last_header.as_ref() {
            state.last_header_hash = tip.hash();
        }
        return HeadersAction::RequestMore(state.last_header_hash);
    }

    // Short or empty batch: the peer has nothing more.
    if let Some(tip) = state.headers_buffer.last() {
        state.last_header_hash = tip.hash();
    }
    state.header_sync_complete = true;
    let window_start = state
        .headers_buffer
        .first()
        .map(BlockHeader::hash)
        .unwrap_or(state.last_header_hash);
    state.last_block_hash = window_start;
    state.last_rblock_hash = window_start.reversed();
    if state.last_block_hash == state.last_header_hash {
        state.initial_sync_complete = true;
        state.phase = SessionPhase::Live;
        HeadersAction::Synced
    } else {
        state.phase = SessionPhase::BlockSync;
        HeadersAction::BeginBlockSync(window_start)
    }
}

/// Decides which inventory to fetch. During initial block sync a multi-block
/// announcement replaces the in-flight window; afterwards block hashes are
/// fetched as they gossip in. Transactions are always fetched.
pub(crate) fn apply_inv(
    state: &mut SessionState,
    items: &[InventoryVector],
) -> Vec<InventoryVector> {
    let blocks: Vec<InventoryVector> = items.iter().copied().filter(|i| i.is_block()).collect();
    let txs = items.iter().copied().filter(|i| i.is_tx());

    let mut request = Vec::new();
    let in_initial_block_sync = state.header_sync_complete && !state.initial_sync_complete;
    if in_initial_block_sync && blocks.len() > 1 {
        state.requested_blocks = blocks.iter().map(|item| item.hash).collect();
        request.extend(blocks);
    } else if state.initial_sync_complete && !blocks.is_empty() {
        request.extend(blocks);
    }
    request.extend(txs);
    request
}

pub(crate) enum BlockAction {
    None,
    ContinueSync(BlockHash),
    SyncComplete,
}

/// Records a received block and advances block sync: completion when the
/// block cursor reaches the header tip, another `getblocks` round once the
/// in-flight window drains.
pub(crate) fn apply_block(state: &mut SessionState, block: Block) -> BlockAction {
    let hash = block.hash();
    let rhash = hash.reversed();
    if let Some(height) = block.coinbase_height() {
        if height > state.best_height_reported {
            state.best_height_reported = height;
        }
        state.block_height_map.insert(rhash, height);
    }
    if !state.mempool.is_empty() {
        let mined: HashSet<BlockHash> = block.txids().into_iter().collect();
        state.mempool.retain(|tx| !mined.contains(&tx.txid()));
    }
    state.block_map.insert(rhash, block);
    state.last_block_hash = hash;
    state.last_rblock_hash = rhash;
    state.requested_blocks.remove(&hash);

    if !state.initial_sync_complete {
        if state.last_block_hash == state.last_header_hash {
            state.initial_sync_complete = true;
            state.phase = SessionPhase::Live;
            return BlockAction::SyncComplete;
        }
        if state.requested_blocks.is_empty() {
            return BlockAction::ContinueSync(state.last_block_hash);
        }
    }
    BlockAction::None
}
