use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::worker::Worker;
use crate::Peer;

/// Folds per-peer download/upload counters into torrent-wide totals, keeping
/// the contribution of a peer that has disconnected rather than letting it
/// vanish from the running total.
///
/// The fold is a one-pass ledger: every peer the worker currently reports
/// live has its latest snapshot written into `recent`; every peer that used
/// to be in `recent` but has since dropped out of the live set has its last
/// snapshot folded into the disconnected accumulators and removed from
/// `recent`. Doing the overwrite before the migration guarantees a peer is
/// counted on exactly one side of the ledger at every call boundary.
pub struct SessionStateAggregator {
    worker: Arc<Worker>,
    ledger: Mutex<HashMap<Peer, (u64, u64)>>,
    disconnected_down: AtomicU64,
    disconnected_up: AtomicU64,
}

impl SessionStateAggregator {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self {
            worker,
            ledger: Mutex::new(HashMap::new()),
            disconnected_down: AtomicU64::new(0),
            disconnected_up: AtomicU64::new(0),
        }
    }

    pub fn pieces_total(&self) -> u32 {
        self.worker.pieces_total().unwrap_or(1)
    }

    pub fn pieces_remaining(&self) -> u32 {
        self.worker.pieces_remaining().unwrap_or(1)
    }

    pub fn downloaded(&self) -> u64 {
        self.fold().0
    }

    pub fn uploaded(&self) -> u64 {
        self.fold().1
    }

    pub fn connected_peers(&self) -> Vec<Peer> {
        self.worker.peers()
    }

    /// Single entry point for both axes: guarantees `downloaded()` and
    /// `uploaded()` observe the same live/disconnected split, so a peer can
    /// never be live for one axis and disconnected for the other.
    fn fold(&self) -> (u64, u64) {
        let live_peers = self.worker.peers();
        let mut live: HashMap<Peer, (u64, u64)> = HashMap::with_capacity(live_peers.len());
        for peer in live_peers {
            if let Some(state) = self.worker.connection_state(&peer) {
                live.insert(peer, (state.downloaded, state.uploaded));
            }
        }

        let mut ledger = self.ledger.lock().unwrap();

        for (peer, amounts) in live.iter() {
            ledger.insert(*peer, *amounts);
        }

        let disconnected: Vec<Peer> = ledger
            .keys()
            .filter(|peer| !live.contains_key(*peer))
            .copied()
            .collect();
        for peer in disconnected {
            if let Some((down, up)) = ledger.remove(&peer) {
                self.disconnected_down.fetch_add(down, Ordering::SeqCst);
                self.disconnected_up.fetch_add(up, Ordering::SeqCst);
            }
        }

        let recent_down: u64 = ledger.values().map(|(d, _)| d).sum();
        let recent_up: u64 = ledger.values().map(|(_, u)| u).sum();

        (
            recent_down + self.disconnected_down.load(Ordering::SeqCst),
            recent_up + self.disconnected_up.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TorrentConfig;
    use crate::metainfo::test_support::sample_metainfo_bytes;
    use crate::MetaInfo;

    fn worker() -> Arc<Worker> {
        let bytes = sample_metainfo_bytes();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.torrent");
        std::fs::write(&path, &bytes).unwrap();
        let metainfo = MetaInfo::new(&path).unwrap();
        Arc::new(Worker::new(metainfo, TorrentConfig { output_dir: dir.path().into(), ..Default::default() }).unwrap())
    }

    // S4: counter conservation across connect/disconnect.
    #[test]
    fn preserves_disconnected_peer_contribution() {
        let worker = worker();
        let aggregator = SessionStateAggregator::new(worker.clone());

        let p1: Peer = "127.0.0.1:1".parse().unwrap();
        let p2: Peer = "127.0.0.1:2".parse().unwrap();
        worker.insert_peer_for_test(p1);
        worker.insert_peer_for_test(p2);
        worker.set_counters_for_test(&p1, 100, 50);
        worker.set_counters_for_test(&p2, 200, 0);

        assert_eq!(aggregator.downloaded(), 300);
        assert_eq!(aggregator.uploaded(), 50);

        worker.remove_peer_for_test(&p2);
        worker.set_counters_for_test(&p1, 150, 80);

        assert_eq!(aggregator.downloaded(), 150 + 200);
        assert_eq!(aggregator.uploaded(), 80);
    }

    // Invariant 7: monotonic across calls even as peers churn.
    #[test]
    fn downloaded_is_monotonic_across_calls() {
        let worker = worker();
        let aggregator = SessionStateAggregator::new(worker.clone());

        let p1: Peer = "127.0.0.1:3".parse().unwrap();
        worker.insert_peer_for_test(p1);
        worker.set_counters_for_test(&p1, 10, 0);
        let first = aggregator.downloaded();

        worker.remove_peer_for_test(&p1);
        let second = aggregator.downloaded();
        assert!(second >= first);

        let p2: Peer = "127.0.0.1:4".parse().unwrap();
        worker.insert_peer_for_test(p2);
        worker.set_counters_for_test(&p2, 5, 0);
        let third = aggregator.downloaded();
        assert!(third >= second);
    }

    // Invariant 8: a peer that reconnects under the same identity is not
    // double counted by replaying its pre-disconnect snapshot.
    #[test]
    fn reconnect_does_not_double_count() {
        let worker = worker();
        let aggregator = SessionStateAggregator::new(worker.clone());

        let p1: Peer = "127.0.0.1:5".parse().unwrap();
        worker.insert_peer_for_test(p1);
        worker.set_counters_for_test(&p1, 100, 0);
        assert_eq!(aggregator.downloaded(), 100);

        worker.remove_peer_for_test(&p1);
        assert_eq!(aggregator.downloaded(), 100);

        worker.insert_peer_for_test(p1);
        worker.set_counters_for_test(&p1, 20, 0);
        assert_eq!(aggregator.downloaded(), 120);
    }
}
