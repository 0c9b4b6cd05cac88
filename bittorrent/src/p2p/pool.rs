use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::p2p::connection::PeerConnection;
use crate::{Peer, TorrentId};

/// Lookup from peer identity to its live connection, shared by the dispatcher
/// and whatever accepts/dials connections on a torrent's behalf.
pub trait PeerConnectionPool: Send + Sync {
    fn get_connection(&self, peer: &Peer) -> Option<Arc<dyn PeerConnection>>;

    /// Invokes `visitor` with every connection currently registered for `torrent_id`.
    fn visit_connections(&self, torrent_id: TorrentId, visitor: &mut dyn FnMut(&Peer, &Arc<dyn PeerConnection>));

    fn size(&self) -> usize;

    /// Registers `connection` for `peer` unless one is already present, in
    /// which case the existing connection is returned instead.
    fn add_connection_if_absent(&self, peer: Peer, connection: Arc<dyn PeerConnection>) -> Arc<dyn PeerConnection>;

    fn remove_connection(&self, peer: &Peer);

    /// All peers currently registered, regardless of torrent.
    fn peers(&self) -> Vec<Peer>;
}

#[derive(Default)]
pub struct InMemoryConnectionPool {
    connections: RwLock<HashMap<Peer, Arc<dyn PeerConnection>>>,
}

impl InMemoryConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerConnectionPool for InMemoryConnectionPool {
    fn get_connection(&self, peer: &Peer) -> Option<Arc<dyn PeerConnection>> {
        self.connections.read().unwrap().get(peer).cloned()
    }

    fn visit_connections(&self, torrent_id: TorrentId, visitor: &mut dyn FnMut(&Peer, &Arc<dyn PeerConnection>)) {
        for (peer, conn) in self.connections.read().unwrap().iter() {
            if conn.torrent_id() == torrent_id {
                visitor(peer, conn);
            }
        }
    }

    fn size(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    fn add_connection_if_absent(&self, peer: Peer, connection: Arc<dyn PeerConnection>) -> Arc<dyn PeerConnection> {
        self.connections
            .write()
            .unwrap()
            .entry(peer)
            .or_insert(connection)
            .clone()
    }

    fn remove_connection(&self, peer: &Peer) {
        self.connections.write().unwrap().remove(peer);
    }

    fn peers(&self) -> Vec<Peer> {
        self.connections.read().unwrap().keys().copied().collect()
    }
}
