use serde::Serialize;

use floscan_primitives::hash::{bytes_to_hex, sha256};

use crate::chain_view::ChainView;
use crate::fullnode::{ChainSummary, ChainTip};
use crate::p2p::NetTotalsSnapshot;

/// Stable supervisor identity for a canonical `host:port` string.
pub fn peer_key(addr: &str) -> String {
    bytes_to_hex(&sha256(addr.as_bytes()))
}

#[derive(Clone, Debug, Serialize)]
pub struct ChainStatus {
    pub chain_id: String,
    pub peers: usize,
    pub best_height: i32,
    pub best_hash: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StatusSnapshot {
    pub network: String,
    pub uptime_secs: u64,
    pub sessions: usize,
    pub open_sessions: usize,
    pub synced_sessions: usize,
    pub destroyed_sessions: u64,
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub connections: usize,
    pub chains: Vec<ChainStatus>,
    pub node: Option<ChainSummary>,
    pub best_active_tip: Option<ChainTip>,
    pub competing_tips: Vec<ChainTip>,
}

impl StatusSnapshot {
    pub fn empty(network: &str) -> Self {
        StatusSnapshot {
            network: network.to_string(),
            ..StatusSnapshot::default()
        }
    }

    pub fn apply_net_totals(&mut self, totals: NetTotalsSnapshot) {
        self.bytes_recv = totals.bytes_recv;
        self.bytes_sent = totals.bytes_sent;
        self.connections = totals.connections;
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(512);
        out.push_str(&format!(
            "[floscan {}] up {}s  sessions {} ({} open, {} synced, {} reaped)  rx {} tx {}\n",
            self.network,
            self.uptime_secs,
            self.sessions,
            self.open_sessions,
            self.synced_sessions,
            self.destroyed_sessions,
            format_bytes(self.bytes_recv),
            format_bytes(self.bytes_sent),
        ));
        if self.chains.is_empty() {
            out.push_str("chains: none observed yet\n");
        } else {
            out.push_str("chains:\n");
            for chain in &self.chains {
                out.push_str(&format!(
                    "  {}  peers {}  best {}{}\n",
                    &chain.chain_id[..16.min(chain.chain_id.len())],
                    chain.peers,
                    chain.best_height,
                    chain
                        .best_hash
                        .as_deref()
                        .map(|hash| format!(" ({hash})"))
                        .unwrap_or_default(),
                ));
            }
        }
        if let Some(node) = &self.node {
            out.push_str(&format!(
                "full node: height {} ({})\n",
                node.height,
                if node.synced { "synced" } else { "syncing" },
            ));
        }
        match &self.best_active_tip {
            Some(tip) => {
                out.push_str(&format!("active tip: {} {}\n", tip.height, tip.hash));
            }
            None => out.push_str("active tip: unknown\n"),
        }
        for tip in &self.competing_tips {
            out.push_str(&format!(
                "competing tip: {} {} branchlen {} ({})\n",
                tip.height,
                tip.hash,
                tip.branchlen,
                tip.status.as_str(),
            ));
        }
        out
    }
}

/// Collapses a chain view into per-chain status rows, longest chain first.
pub fn chain_status_rows(view: &ChainView) -> Vec<ChainStatus> {
    let mut rows: Vec<ChainStatus> = view
        .peer_map
        .iter()
        .map(|(chain_id, bucket)| ChainStatus {
            chain_id: chain_id.to_string(),
            peers: bucket.peers.len(),
            best_height: bucket.best_height,
            best_hash: bucket.best_hash.map(|hash| hash.to_string()),
        })
        .collect();
    rows.sort_by(|a, b| {
        b.best_height
            .cmp(&a.best_height)
            .then_with(|| b.peers.cmp(&a.peers))
    });
    rows
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.1}GiB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.1}MiB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1}KiB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes}B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_key_is_stable_and_hex() {
        let key = peer_key("127.0.0.1:7312");
        assert_eq!(key.len(), 64);
        assert_eq!(key, peer_key("127.0.0.1:7312"));
        assert_ne!(key, peer_key("127.0.0.1:7313"));
        assert!(key.bytes().all(|byte| byte.is_ascii_hexdigit()));
    }

    #[test]
    fn render_mentions_core_figures() {
        let mut snapshot = StatusSnapshot::empty("livenet");
        snapshot.sessions = 3;
        snapshot.open_sessions = 2;
        let text = snapshot.render();
        assert!(text.contains("livenet"));
        assert!(text.contains("3 (2 open"));
        assert!(text.contains("chains: none"));
    }

    #[test]
    fn bytes_format_scales() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.0KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0MiB");
    }
}
