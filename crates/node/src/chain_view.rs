use std::collections::{BTreeMap, HashMap};

use floscan_primitives::hash::Rhash;

use crate::session::SessionSnapshot;

/// One peer's identity inside a chain bucket.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChainPeer {
    pub user_agent: String,
    pub addr: String,
}

/// The peers observed following one chain, with the best tip among them.
#[derive(Clone, Debug, Default)]
pub struct ChainPeers {
    pub peers: Vec<ChainPeer>,
    pub best_height: i32,
    pub best_hash: Option<Rhash>,
}

/// Grouping of synced peers by the `(height -> rhash)` mapping they report.
///
/// Chain ids are opaque labels (the rhash of the first block observed for
/// the chain) and are order-dependent; callers must not read meaning into
/// them beyond equality.
#[derive(Clone, Debug, Default)]
pub struct ChainView {
    pub chains: HashMap<Rhash, BTreeMap<i32, Rhash>>,
    pub peer_map: HashMap<Rhash, ChainPeers>,
}

/// Folds a set of session snapshots into chain buckets.
///
/// Peers that have not finished their initial sync, or that have observed no
/// block heights yet, carry no grouping information and are skipped. A peer
/// matches a chain when every height it has observed maps to the same rhash
/// in that chain; the comparison covers only the observed window, so two
/// chains that agree inside the window but diverge outside it collapse into
/// one bucket by design.
pub fn group_chains(snapshots: &[SessionSnapshot]) -> ChainView {
    let mut view = ChainView::default();
    // Keep bucket probing deterministic in snapshot order.
    let mut chain_order: Vec<Rhash> = Vec::new();

    for snapshot in snapshots {
        if !snapshot.initial_sync_complete {
            continue;
        }
        let observed = &snapshot.block_heights;
        if observed.is_empty() {
            continue;
        }

        let mut matched = None;
        for chain_id in &chain_order {
            let chain = &view.chains[chain_id];
            let agrees = observed
                .iter()
                .all(|(height, rhash)| chain.get(height) == Some(rhash));
            if agrees {
                matched = Some(*chain_id);
                break;
            }
        }

        let chain_id = match matched {
            Some(chain_id) => chain_id,
            None => {
                let (_, first_rhash) = observed
                    .iter()
                    .next()
                    .expect("observed window checked non-empty");
                let chain_id = *first_rhash;
                view.chains.insert(chain_id, observed.clone());
                chain_order.push(chain_id);
                chain_id
            }
        };

        let bucket = view.peer_map.entry(chain_id).or_default();
        bucket.peers.push(ChainPeer {
            user_agent: snapshot.user_agent.clone(),
            addr: snapshot.addr.clone(),
        });
        if snapshot.best_height_reported > bucket.best_height || bucket.best_hash.is_none() {
            bucket.best_height = snapshot.best_height_reported;
            bucket.best_hash = Some(snapshot.last_rblock_hash);
        }
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionPhase;
    use floscan_primitives::hash::{sha256d, BlockHash};
    use std::collections::BTreeMap;

    fn rhash(tag: &str) -> Rhash {
        BlockHash::from_bytes(sha256d(tag.as_bytes())).reversed()
    }

    fn snapshot(
        addr: &str,
        best_height: i32,
        synced: bool,
        heights: &[(i32, Rhash)],
    ) -> SessionSnapshot {
        let block_heights: BTreeMap<i32, Rhash> = heights.iter().copied().collect();
        let last = heights
            .last()
            .map(|(_, rhash)| *rhash)
            .unwrap_or_else(|| rhash("none"));
        SessionSnapshot {
            peer_hash: format!("hash-{addr}"),
            addr: addr.to_string(),
            phase: if synced {
                SessionPhase::Live
            } else {
                SessionPhase::BlockSync
            },
            user_agent: "/Florincoin:0.15.2/".to_string(),
            protocol_version: 70_015,
            best_height_reported: best_height,
            header_sync_complete: true,
            initial_sync_complete: synced,
            headers_buffered: heights.len(),
            blocks_received: heights.len(),
            requested_blocks: 0,
            mempool_size: 0,
            last_header_hash: last.internal(),
            last_block_hash: last.internal(),
            last_rblock_hash: last,
            block_heights,
        }
    }

    #[test]
    fn partitions_agreeing_and_diverging_peers() {
        let shared: Vec<(i32, Rhash)> = (100..=105)
            .map(|height| (height, rhash(&format!("main-{height}"))))
            .collect();
        let mut forked = shared.clone();
        for entry in forked.iter_mut().skip(3) {
            entry.1 = rhash(&format!("fork-{}", entry.0));
        }

        let snapshots = vec![
            snapshot("10.0.0.1:7312", 105, true, &shared),
            snapshot("10.0.0.2:7312", 104, true, &shared),
            snapshot("10.0.0.3:7312", 105, true, &forked),
        ];
        let view = group_chains(&snapshots);
        assert_eq!(view.chains.len(), 2);
        assert_eq!(view.peer_map.len(), 2);

        let main_id = shared[0].1;
        let main_bucket = &view.peer_map[&main_id];
        assert_eq!(main_bucket.peers.len(), 2);
        assert_eq!(main_bucket.best_height, 105);

        let fork_bucket = view
            .peer_map
            .iter()
            .find(|(chain_id, _)| **chain_id != main_id)
            .map(|(_, bucket)| bucket)
            .expect("fork bucket exists");
        assert_eq!(fork_bucket.peers.len(), 1);
        assert_eq!(fork_bucket.best_height, 105);
    }

    #[test]
    fn skips_unsynced_and_empty_peers() {
        let window: Vec<(i32, Rhash)> = vec![(7, rhash("h7"))];
        let snapshots = vec![
            snapshot("10.0.0.1:7312", 7, false, &window),
            snapshot("10.0.0.2:7312", 7, true, &[]),
        ];
        let view = group_chains(&snapshots);
        assert!(view.chains.is_empty());
        assert!(view.peer_map.is_empty());
    }

    #[test]
    fn subset_window_joins_existing_chain() {
        let full: Vec<(i32, Rhash)> = (200..=205)
            .map(|height| (height, rhash(&format!("c-{height}"))))
            .collect();
        let partial = full[..3].to_vec();

        let snapshots = vec![
            snapshot("10.0.0.1:7312", 205, true, &full),
            snapshot("10.0.0.2:7312", 202, true, &partial),
        ];
        let view = group_chains(&snapshots);
        assert_eq!(view.chains.len(), 1);
        let bucket = view.peer_map.values().next().unwrap();
        assert_eq!(bucket.peers.len(), 2);
        assert_eq!(bucket.best_height, 205);
    }

    #[test]
    fn grouping_is_stable_modulo_labels() {
        let window_a: Vec<(i32, Rhash)> = (1..=4)
            .map(|height| (height, rhash(&format!("a-{height}"))))
            .collect();
        let window_b: Vec<(i32, Rhash)> = (1..=4)
            .map(|height| (height, rhash(&format!("b-{height}"))))
            .collect();

        let forward = vec![
            snapshot("10.0.0.1:7312", 4, true, &window_a),
            snapshot("10.0.0.2:7312", 4, true, &window_b),
        ];
        let reversed: Vec<SessionSnapshot> = forward.iter().rev().cloned().collect();

        let sizes = |view: &ChainView| {
            let mut sizes: Vec<usize> = view
                .peer_map
                .values()
                .map(|bucket| bucket.peers.len())
                .collect();
            sizes.sort_unstable();
            sizes
        };
        assert_eq!(sizes(&group_chains(&forward)), sizes(&group_chains(&reversed)));
    }
}
