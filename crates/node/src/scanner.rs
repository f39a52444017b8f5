use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use floscan_consensus::params::{chain_params, hash256_from_hex, ChainParams, Network};
use floscan_primitives::hash::BlockHash;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::chain_view::group_chains;
use crate::fullnode::{ChainSummary, ChainTip, FullNodeAdapter, TipStatus};
use crate::p2p::NetTotals;
use crate::session::{PeerSession, SessionContext, SessionEvent, SessionSnapshot};
use crate::stats::{chain_status_rows, peer_key, StatusSnapshot};

pub const DEFAULT_MAX_PEERS: usize = 1000;
pub const DEFAULT_REORG_TRIGGER_LENGTH: u64 = 10;
pub const DEFAULT_REORG_TIP_MAXAGE: i64 = 25;

const STALL_RECOVERY_INTERVAL_SECS: u64 = 60;
const CHAIN_TIP_INTERVAL_SECS: u64 = 5;
const STATUS_REFRESH_MILLIS: u64 = 50;
const DESTROY_LOG_INTERVAL_SECS: u64 = 10;

#[derive(Clone, Debug)]
pub struct ScannerConfig {
    pub network: Network,
    pub max_peers: usize,
    /// Minimum fork branch length worth alerting on.
    pub reorg_trigger_length: u64,
    /// How far below the active tip a fork may sit and still count as recent.
    pub reorg_tip_maxage: i64,
    /// Drives the 50 ms status refresh (the `disableLogUpdate` switch).
    pub status_updates: bool,
    /// Run DNS seed discovery at startup.
    pub discover: bool,
    /// Extra peers admitted at startup, before any gossip.
    pub seed_peers: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            network: Network::Livenet,
            max_peers: DEFAULT_MAX_PEERS,
            reorg_trigger_length: DEFAULT_REORG_TRIGGER_LENGTH,
            reorg_tip_maxage: DEFAULT_REORG_TIP_MAXAGE,
            status_updates: true,
            discover: true,
            seed_peers: Vec::new(),
        }
    }
}

/// Fired at most once per armed subscription when a competing branch
/// qualifies under the configured thresholds.
#[derive(Clone, Debug)]
pub struct ReorgEvent {
    pub best_height_tip: ChainTip,
    pub reorg_tip: ChainTip,
}

enum ScannerCommand {
    AddPeer(String),
    RemovePeer { peer_hash: String, restart: bool },
    WatchReorg(oneshot::Sender<ReorgEvent>),
    Inspect(oneshot::Sender<String>),
    Shutdown,
}

/// Clonable front door to a running scanner.
#[derive(Clone)]
pub struct ScannerHandle {
    commands: mpsc::UnboundedSender<ScannerCommand>,
    status: watch::Receiver<StatusSnapshot>,
}

impl ScannerHandle {
    pub fn add_peer(&self, addr: impl Into<String>) {
        let _ = self.commands.send(ScannerCommand::AddPeer(addr.into()));
    }

    pub fn remove_peer(&self, peer_hash: impl Into<String>, restart: bool) {
        let _ = self.commands.send(ScannerCommand::RemovePeer {
            peer_hash: peer_hash.into(),
            restart,
        });
    }

    /// Arms the single reorg subscription. The returned receiver resolves at
    /// most once; call again after a trigger to re-arm.
    pub fn watch_reorgs(&self) -> oneshot::Receiver<ReorgEvent> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(ScannerCommand::WatchReorg(tx));
        rx
    }

    pub async fn inspect(&self) -> String {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(ScannerCommand::Inspect(tx));
        rx.await.unwrap_or_default()
    }

    pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(ScannerCommand::Shutdown);
    }
}

/// Discovers, admits, supervises, and reaps peer sessions.
pub struct Scanner {
    config: ScannerConfig,
    params: ChainParams,
    anchor: BlockHash,
    fullnode: FullNodeAdapter,
    net_totals: Arc<NetTotals>,
    peers: HashMap<String, PeerSession>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    commands_tx: mpsc::UnboundedSender<ScannerCommand>,
    commands_rx: Option<mpsc::UnboundedReceiver<ScannerCommand>>,
    status_tx: watch::Sender<StatusSnapshot>,
    reorg_slot: Option<oneshot::Sender<ReorgEvent>>,
    destroyed_counter: u64,
    destroyed_since_log: u64,
    last_destroy_log: Instant,
    best_active_tip: Option<ChainTip>,
    competing_tips: Vec<ChainTip>,
    node_summary: Option<ChainSummary>,
    started_at: Instant,
}

impl Scanner {
    pub fn new(
        config: ScannerConfig,
        fullnode: FullNodeAdapter,
    ) -> Result<(Scanner, ScannerHandle), String> {
        let params = chain_params(config.network);
        let anchor = hash256_from_hex(params.sync_anchor)
            .map(BlockHash::from_bytes)
            .map_err(|err| format!("bad sync anchor for {}: {err}", params.name))?;
        if config.max_peers == 0 {
            return Err("max_peers must be at least 1".to_string());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::empty(params.name));
        let handle = ScannerHandle {
            commands: commands_tx.clone(),
            status: status_rx,
        };
        let scanner = Scanner {
            config,
            params,
            anchor,
            fullnode,
            net_totals: Arc::new(NetTotals::default()),
            peers: HashMap::new(),
            events_tx,
            events_rx: Some(events_rx),
            commands_tx,
            commands_rx: Some(commands_rx),
            status_tx,
            reorg_slot: None,
            destroyed_counter: 0,
            destroyed_since_log: 0,
            last_destroy_log: Instant::now(),
            best_active_tip: None,
            competing_tips: Vec::new(),
            node_summary: None,
            started_at: Instant::now(),
        };
        Ok((scanner, handle))
    }

    /// Supervisor loop. Admission, reaping, and every periodic task run on
    /// this single task; sessions only talk to it through the event channel.
    pub async fn run(mut self) {
        if let Err(err) = self.fullnode.start().await {
            warn!(%err, "full node unavailable, reorg monitoring degraded");
        }

        if self.config.discover {
            let params = self.params;
            let commands = self.commands_tx.clone();
            tokio::spawn(async move {
                let addrs = resolve_seed_addresses(&params).await;
                info!(count = addrs.len(), "dns discovery finished");
                for addr in addrs {
                    let _ = commands.send(ScannerCommand::AddPeer(addr.to_string()));
                }
            });
        }
        for addr in self.config.seed_peers.clone() {
            self.add_peer(addr);
        }

        let mut commands_rx = self.commands_rx.take().expect("scanner already ran");
        let mut events_rx = self.events_rx.take().expect("scanner already ran");
        let mut stall_timer = tokio::time::interval(Duration::from_secs(STALL_RECOVERY_INTERVAL_SECS));
        let mut tips_timer = tokio::time::interval(Duration::from_secs(CHAIN_TIP_INTERVAL_SECS));
        let mut status_timer = tokio::time::interval(Duration::from_millis(STATUS_REFRESH_MILLIS));

        loop {
            tokio::select! {
                command = commands_rx.recv() => match command {
                    Some(ScannerCommand::AddPeer(addr)) => self.add_peer(addr),
                    Some(ScannerCommand::RemovePeer { peer_hash, restart }) => {
                        self.remove_peer(&peer_hash, restart);
                    }
                    Some(ScannerCommand::WatchReorg(slot)) => {
                        self.reorg_slot = Some(slot);
                    }
                    Some(ScannerCommand::Inspect(reply)) => {
                        let _ = reply.send(self.build_status().render());
                    }
                    Some(ScannerCommand::Shutdown) | None => break,
                },
                event = events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                }
                _ = stall_timer.tick() => self.recover_stalled(),
                _ = tips_timer.tick() => self.poll_chain_tips().await,
                _ = status_timer.tick(), if self.config.status_updates => {
                    self.publish_status();
                }
            }
        }

        info!(sessions = self.peers.len(), "scanner shutting down");
        for (_, mut session) in self.peers.drain() {
            session.destroy();
        }
        self.publish_status();
    }

    /// Admission: canonicalize, dedup by peer hash, and respect the cap on
    /// both open and total sessions.
    fn add_peer(&mut self, addr: String) {
        let Ok(sock_addr) = addr.parse::<SocketAddr>() else {
            debug!(%addr, "ignoring unparseable peer address");
            return;
        };
        let canonical = sock_addr.to_string();
        let key = peer_key(&canonical);
        if self.peers.contains_key(&key) {
            return;
        }
        let open = self.peers.values().filter(|session| session.is_open()).count();
        if open >= self.config.max_peers || self.peers.len() >= self.config.max_peers {
            debug!(addr = %canonical, "peer table full, rejecting");
            return;
        }
        let ctx = SessionContext {
            magic: self.params.message_start,
            anchor: self.anchor,
            events: self.events_tx.clone(),
            net_totals: Arc::clone(&self.net_totals),
        };
        match PeerSession::new(key.clone(), canonical, ctx) {
            Ok(mut session) => {
                session.start();
                self.peers.insert(key, session);
            }
            Err(err) => debug!(%err, "session construction failed"),
        }
    }

    fn remove_peer(&mut self, peer_hash: &str, restart: bool) {
        let Some(mut session) = self.peers.remove(peer_hash) else {
            return;
        };
        let addr = session.addr().to_string();
        session.destroy();
        self.destroyed_counter += 1;
        self.destroyed_since_log += 1;
        if self.last_destroy_log.elapsed() >= Duration::from_secs(DESTROY_LOG_INTERVAL_SECS) {
            debug!(
                reaped = self.destroyed_since_log,
                total = self.destroyed_counter,
                "reaped dead sessions"
            );
            self.destroyed_since_log = 0;
            self.last_destroy_log = Instant::now();
        }
        if restart {
            self.add_peer(addr);
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Address { addr } => self.add_peer(addr),
            SessionEvent::Disconnect { peer_hash, was_open } => {
                if was_open {
                    debug!(peer = &peer_hash[..12.min(peer_hash.len())], "open session lost");
                }
                self.remove_peer(&peer_hash, false);
            }
        }
    }

    /// T2: nudge synced-but-lagging peers back into block sync.
    fn recover_stalled(&mut self) {
        let snapshots = self.session_snapshots();
        for peer_hash in stalled_peers(&snapshots) {
            if let Some(session) = self.peers.get(&peer_hash) {
                debug!(peer = &peer_hash[..12.min(peer_hash.len())], "stall recovery");
                session.request_blocks();
            }
        }
    }

    /// T3: refresh the full node's tip view and fire the armed reorg
    /// subscription if a qualifying fork shows up.
    async fn poll_chain_tips(&mut self) {
        if !self.fullnode.is_enabled() {
            return;
        }
        match self.fullnode.chain().await {
            Ok(summary) => self.node_summary = Some(summary),
            Err(err) => debug!(%err, "chain summary unavailable"),
        }
        let tips = match self.fullnode.chain_tips().await {
            Ok(tips) => tips,
            Err(err) => {
                debug!(%err, "chain tips unavailable");
                return;
            }
        };
        let (best_active, others) = partition_tips(tips);
        self.best_active_tip = best_active.clone();
        self.competing_tips = others.clone();

        let Some(best_active) = best_active else {
            return;
        };
        let Some(reorg_tip) = select_reorg_tip(
            &best_active,
            &others,
            self.config.reorg_trigger_length,
            self.config.reorg_tip_maxage,
        ) else {
            return;
        };
        if let Some(slot) = self.reorg_slot.take() {
            info!(
                active_height = best_active.height,
                fork_height = reorg_tip.height,
                branchlen = reorg_tip.branchlen,
                "reorg trigger"
            );
            let _ = slot.send(ReorgEvent {
                best_height_tip: best_active.clone(),
                reorg_tip: reorg_tip.clone(),
            });
        }
    }

    fn session_snapshots(&self) -> Vec<SessionSnapshot> {
        self.peers.values().map(PeerSession::snapshot).collect()
    }

    fn build_status(&self) -> StatusSnapshot {
        let snapshots = self.session_snapshots();
        let view = group_chains(&snapshots);
        let mut status = StatusSnapshot::empty(self.params.name);
        status.uptime_secs = self.started_at.elapsed().as_secs();
        status.sessions = snapshots.len();
        status.open_sessions = snapshots
            .iter()
            .filter(|snapshot| snapshot.phase.is_open())
            .count();
        status.synced_sessions = snapshots
            .iter()
            .filter(|snapshot| snapshot.initial_sync_complete)
            .count();
        status.destroyed_sessions = self.destroyed_counter;
        status.apply_net_totals(self.net_totals.snapshot());
        status.chains = chain_status_rows(&view);
        status.node = self.node_summary.clone();
        status.best_active_tip = self.best_active_tip.clone();
        status.competing_tips = self.competing_tips.clone();
        status
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.build_status());
    }
}

/// Resolves every DNS seed concurrently; failures are dropped quietly
/// (discovery is best-effort) and the result is shuffled so restarts do not
/// always dial the same peers first.
pub async fn resolve_seed_addresses(params: &ChainParams) -> Vec<SocketAddr> {
    let mut join_set = JoinSet::new();
    for seed in params.dns_seeds {
        let host = format!("{seed}:{}", params.default_port);
        join_set.spawn(async move {
            match tokio::net::lookup_host(&host).await {
                Ok(entries) => entries.collect::<Vec<SocketAddr>>(),
                Err(err) => {
                    debug!(seed = %host, %err, "seed resolution failed");
                    Vec::new()
                }
            }
        });
    }
    let mut seen = HashSet::new();
    let mut addrs = Vec::new();
    while let Some(result) = join_set.join_next().await {
        let Ok(entries) = result else { continue };
        for addr in entries {
            if seen.insert(addr) {
                addrs.push(addr);
            }
        }
    }
    addrs.shuffle(&mut rand::thread_rng());
    addrs
}

/// Splits `getchaintips` rows into the winning active tip and the rest.
pub fn partition_tips(tips: Vec<ChainTip>) -> (Option<ChainTip>, Vec<ChainTip>) {
    let mut best_active: Option<ChainTip> = None;
    let mut others = Vec::new();
    for tip in tips {
        if tip.status == TipStatus::Active {
            match &best_active {
                Some(current) if current.height >= tip.height => {}
                _ => best_active = Some(tip),
            }
        } else {
            others.push(tip);
        }
    }
    (best_active, others)
}

/// A competing tip qualifies when its branch is long enough to matter and
/// its tip sits close enough to the active tip to be recent.
pub fn select_reorg_tip<'a>(
    best_active: &ChainTip,
    others: &'a [ChainTip],
    trigger_length: u64,
    tip_maxage: i64,
) -> Option<&'a ChainTip> {
    others.iter().find(|tip| {
        tip.status != TipStatus::Unknown
            && tip.branchlen >= trigger_length
            && tip.height >= best_active.height - tip_maxage
    })
}

/// T2 selection: peers that finished header sync, drained their in-flight
/// window, and still trail the best height reported across all sessions.
pub fn stalled_peers(snapshots: &[SessionSnapshot]) -> Vec<String> {
    let best = snapshots
        .iter()
        .map(|snapshot| snapshot.best_height_reported)
        .max()
        .unwrap_or(-1);
    snapshots
        .iter()
        .filter(|snapshot| {
            snapshot.header_sync_complete
                && snapshot.best_height_reported < best
                && snapshot.requested_blocks == 0
        })
        .map(|snapshot| snapshot.peer_hash.clone())
        .collect()
}
