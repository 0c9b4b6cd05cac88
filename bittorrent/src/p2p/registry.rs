use std::collections::HashSet;
use std::sync::RwLock;

use crate::TorrentId;

/// Liveness predicate the dispatcher consults before offering a connection's
/// messages to anyone: a torrent that has been removed or paused is neither
/// drained nor supplied, even if its connections are still open.
pub trait TorrentRegistry: Send + Sync {
    fn is_supported_and_active(&self, torrent_id: TorrentId) -> bool;
}

#[derive(Default)]
pub struct InMemoryTorrentRegistry {
    active: RwLock<HashSet<TorrentId>>,
}

impl InMemoryTorrentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self, torrent_id: TorrentId) {
        self.active.write().unwrap().insert(torrent_id);
    }

    pub fn deactivate(&self, torrent_id: TorrentId) {
        self.active.write().unwrap().remove(&torrent_id);
    }
}

impl TorrentRegistry for InMemoryTorrentRegistry {
    fn is_supported_and_active(&self, torrent_id: TorrentId) -> bool {
        self.active.read().unwrap().contains(&torrent_id)
    }
}
