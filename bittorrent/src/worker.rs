use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::block::{BlockInfo, BlockRequest};
use crate::config::TorrentConfig;
use crate::fs::{self, DiskEvent};
use crate::metainfo::MetaInfo;
use crate::p2p::connection::PeerConnection;
use crate::p2p::dispatcher::MessageDispatcher;
use crate::p2p::message::Message;
use crate::p2p::pool::{InMemoryConnectionPool, PeerConnectionPool};
use crate::p2p::registry::InMemoryTorrentRegistry;
use crate::p2p::state::ConnectionState;
use crate::picker::Picker;
use crate::store::StoreInfo;
use crate::tracker::{AnnounceParams, Event, Tracker, TrackerError};
use crate::{Peer, TorrentId};

const TARGET_QUEUE_LEN: usize = 8;
const DEFAULT_MAX_BACKOFF_MS: u64 = 64;
const CONNECTION_SWEEP_INTERVAL_MS: u64 = 500;

#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("disk error: {0}")]
    Disk(#[from] fs::DiskError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),
}

/// The per-torrent object: owns per-peer [`ConnectionState`], registers one
/// consumer and one supplier per peer with its [`MessageDispatcher`], and
/// drives the piece picker and disk I/O in response to inbound messages.
///
/// Each worker runs its own dispatch loop thread rather than sharing one
/// across torrents; [`crate::Client`] owns one worker per active torrent.
pub struct Worker {
    info_hash: TorrentId,
    client_id: [u8; 20],
    store: StoreInfo,
    picker: Picker,
    peer_states: Mutex<HashMap<Peer, ConnectionState>>,
    outstanding_requests: Mutex<HashMap<Peer, HashSet<BlockRequest>>>,
    outbound: Mutex<HashMap<Peer, VecDeque<Message>>>,
    // `mpsc::Sender` is `Send` but not `Sync`; a `Mutex` makes the worker as
    // a whole safely `Sync` so it can be shared via `Arc` across the
    // dispatch, disk-pump, and accept threads.
    disk_tx: Mutex<fs::DiskTx>,
    disk_events: Mutex<Option<fs::DiskEventRx>>,
    trackers: Mutex<Vec<Vec<Tracker>>>,
    pool: Arc<dyn PeerConnectionPool>,
    dispatcher: Arc<MessageDispatcher>,
    registry: Arc<InMemoryTorrentRegistry>,
    sweep_shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(metainfo: MetaInfo, config: TorrentConfig) -> Result<Worker, WorkerError> {
        Self::with_client_id(
            metainfo,
            config,
            [0u8; 20],
            std::time::Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
        )
    }

    pub fn with_client_id(
        metainfo: MetaInfo,
        config: TorrentConfig,
        client_id: [u8; 20],
        max_backoff: std::time::Duration,
    ) -> Result<Worker, WorkerError> {
        let info_hash = metainfo.info_hash();
        let store = StoreInfo::new(&metainfo, config.output_dir);
        let piece_hashes = metainfo.piece_hashes();
        let (_disk_handle, disk_tx, disk_events) = fs::spawn(store.clone(), piece_hashes)?;
        let picker = Picker::new(store.num_pieces, store.piece_len, store.last_piece_len);
        let trackers = metainfo.trackers();

        let pool: Arc<dyn PeerConnectionPool> = Arc::new(InMemoryConnectionPool::new());
        let registry = Arc::new(InMemoryTorrentRegistry::new());
        registry.activate(info_hash);
        let loop_control = Arc::new(crate::p2p::loop_control::LoopControl::new(max_backoff));
        let dispatcher = MessageDispatcher::new(
            pool.clone(),
            registry.clone() as Arc<dyn crate::p2p::registry::TorrentRegistry>,
            loop_control,
        );

        Ok(Worker {
            info_hash,
            client_id,
            store,
            picker,
            peer_states: Mutex::new(HashMap::new()),
            outstanding_requests: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
            disk_tx: Mutex::new(disk_tx),
            disk_events: Mutex::new(Some(disk_events)),
            trackers: Mutex::new(trackers),
            pool,
            dispatcher,
            registry,
            sweep_shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Spawns the dispatch loop thread, the disk-event pump, and the
    /// closed-connection sweep. Bound to the "startup" lifecycle hook by
    /// [`crate::Client`].
    pub fn start(self: &Arc<Self>) {
        self.dispatcher.spawn();
        if let Some(events) = self.disk_events.lock().unwrap().take() {
            self.spawn_disk_event_pump(events);
        }
        self.spawn_connection_sweep();
    }

    pub fn info_hash(&self) -> TorrentId {
        self.info_hash
    }

    pub fn pieces_total(&self) -> Option<u32> {
        Some(self.store.num_pieces)
    }

    pub fn pieces_remaining(&self) -> Option<u32> {
        let picker = self.picker.piece_picker.read().unwrap();
        Some(picker.own_bitfield().count_zeros() as u32)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peer_states.lock().unwrap().keys().copied().collect()
    }

    pub fn connection_state(&self, peer: &Peer) -> Option<ConnectionState> {
        self.peer_states.lock().unwrap().get(peer).cloned()
    }

    /// Registers a freshly accepted/dialed connection for this torrent,
    /// wiring its consumer and supplier into the dispatcher.
    pub fn register_connection(self: &Arc<Self>, peer: Peer, connection: Arc<dyn PeerConnection>) {
        self.pool.add_connection_if_absent(peer, connection);
        self.peer_states.lock().unwrap().insert(peer, ConnectionState::default());
        self.outbound.lock().unwrap().insert(peer, VecDeque::new());
        self.outstanding_requests.lock().unwrap().insert(peer, HashSet::new());

        let worker = Arc::clone(self);
        self.dispatcher
            .add_consumer(peer, Arc::new(move |message| worker.handle_message(peer, message)));

        let worker = Arc::clone(self);
        self.dispatcher.add_supplier(
            peer,
            Arc::new(move || worker.outbound.lock().unwrap().get_mut(&peer).and_then(|q| q.pop_front())),
        );
    }

    pub fn disconnect(&self, peer: &Peer) {
        self.pool.remove_connection(peer);
        self.peer_states.lock().unwrap().remove(peer);
        self.outbound.lock().unwrap().remove(peer);
        self.outstanding_requests.lock().unwrap().remove(peer);
    }

    /// Runs synchronously on the dispatch loop thread; must never block.
    fn handle_message(&self, peer: Peer, message: Message) {
        match message {
            Message::KeepAlive => {}

            Message::Choke => {
                self.with_state(peer, |s| s.peer_choking = true);
            }

            Message::Unchoke => {
                self.with_state(peer, |s| s.peer_choking = false);
                self.refill_requests(peer);
            }

            Message::Interested => {
                self.with_state(peer, |s| {
                    s.peer_interested = true;
                    s.choked = false;
                });
                if let Some(queue) = self.outbound.lock().unwrap().get_mut(&peer) {
                    queue.push_back(Message::Unchoke);
                }
            }

            Message::NotInterested => {
                self.with_state(peer, |s| s.peer_interested = false);
            }

            Message::Have { idx } => {
                let num_pieces = self.store.num_pieces;
                self.with_state(peer, |s| {
                    let bf = s.peer_bitfield.get_or_insert_with(|| {
                        let mut bf = crate::Bitfield::new();
                        bf.resize(num_pieces as usize, false);
                        bf
                    });
                    if (idx as usize) < bf.len() {
                        bf.set(idx as usize, true);
                    }
                });
                self.refill_requests(peer);
            }

            Message::Bitfield(bf) => {
                self.with_state(peer, |s| s.peer_bitfield = Some(bf));
                self.refill_requests(peer);
            }

            Message::Request(info) => {
                let choked = self.connection_state(&peer).map(|s| s.choked).unwrap_or(true);
                if !choked {
                    if let Err(e) = self.disk_tx.lock().unwrap().send(fs::CommandToDisk::ReadBlock { block: info, peer }) {
                        tracing::error!("failed to queue disk read for peer {}: {}", peer, e);
                    }
                }
            }

            Message::Block(data) => {
                let len = data.data.len() as u64;
                self.with_state(peer, |s| s.record_download(len));
                let info = BlockInfo { piece_idx: data.piece_idx, offset: data.offset, len: data.data.len() };
                if let Some(requests) = self.outstanding_requests.lock().unwrap().get_mut(&peer) {
                    requests.remove(&info);
                }
                if let Err(e) = self.disk_tx.lock().unwrap().send(fs::CommandToDisk::WriteBlock { block: info, data: data.data }) {
                    tracing::error!("failed to queue disk write for peer {}: {}", peer, e);
                }
                self.refill_requests(peer);
            }

            Message::Cancel(info) => {
                if let Some(requests) = self.outstanding_requests.lock().unwrap().get_mut(&peer) {
                    requests.remove(&info);
                }
            }

            Message::Port { .. } => {}
        }
    }

    fn with_state(&self, peer: Peer, f: impl FnOnce(&mut ConnectionState)) {
        if let Some(state) = self.peer_states.lock().unwrap().get_mut(&peer) {
            f(state);
        }
    }

    fn refill_requests(&self, peer: Peer) {
        let (peer_choking, bitfield) = match self.connection_state(&peer) {
            Some(s) => (s.peer_choking, s.peer_bitfield),
            None => return,
        };
        let Some(bitfield) = bitfield else { return };
        if peer_choking {
            return;
        }

        let mut outstanding = self.outstanding_requests.lock().unwrap();
        let current = outstanding.entry(peer).or_default();
        let picked = self.picker.pick_blocks(current, TARGET_QUEUE_LEN, &bitfield);
        if picked.is_empty() {
            return;
        }
        for request in &picked {
            current.insert(*request);
        }
        drop(outstanding);

        let mut outbound = self.outbound.lock().unwrap();
        let queue = outbound.entry(peer).or_default();
        for request in picked {
            queue.push_back(Message::Request(request));
        }
    }

    /// Drains piece-written/block-read events from the disk thread and turns
    /// them into dispatcher-visible effects (an outbound `Message::Block`, or
    /// bookkeeping on a completed/failed piece).
    fn spawn_disk_event_pump(self: &Arc<Self>, events: fs::DiskEventRx) {
        let worker = Arc::clone(self);
        std::thread::Builder::new()
            .name("disk-event-pump".into())
            .spawn(move || {
                while let Ok(event) = events.recv() {
                    worker.handle_disk_event(event);
                }
            })
            .expect("failed to spawn disk event pump thread");
    }

    /// The dispatcher itself never observes a closed connection once it
    /// starts skipping it, so nothing else ever notices a peer went away.
    /// This sweep periodically scans the pool and tears down any connection
    /// that has closed, which is what lets `SessionStateAggregator` actually
    /// migrate a disconnected peer's counters instead of leaving it live
    /// forever.
    fn spawn_connection_sweep(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        std::thread::Builder::new()
            .name("connection-sweep".into())
            .spawn(move || {
                while !worker.sweep_shutdown.load(Ordering::SeqCst) {
                    for peer in worker.pool.peers() {
                        let closed = worker.pool.get_connection(&peer).map(|c| c.is_closed()).unwrap_or(true);
                        if closed {
                            worker.disconnect(&peer);
                        }
                    }
                    std::thread::sleep(std::time::Duration::from_millis(CONNECTION_SWEEP_INTERVAL_MS));
                }
            })
            .expect("failed to spawn connection sweep thread");
    }

    fn handle_disk_event(&self, event: DiskEvent) {
        match event {
            DiskEvent::BlockRead { peer, block } => {
                let len = block.data.len() as u64;
                self.with_state(peer, |s| s.record_upload(len));
                if let Some(queue) = self.outbound.lock().unwrap().get_mut(&peer) {
                    queue.push_back(Message::Block(block));
                }
            }
            DiskEvent::PieceWritten { idx, valid } => {
                if valid {
                    self.picker.partial_pieces.write().unwrap().remove(&idx);
                    self.picker.piece_picker.write().unwrap().received_piece(idx);
                    tracing::info!(
                        "piece {} downloaded, {} pieces remain",
                        idx,
                        self.pieces_remaining().unwrap_or(0)
                    );
                } else {
                    tracing::warn!("piece {} failed verification, freeing its blocks", idx);
                    if let Some(partial) = self.picker.partial_pieces.read().unwrap().get(&idx) {
                        partial.write().unwrap().free_all_blocks();
                    }
                }
            }
        }
    }

    /// Announces to every tier of trackers in priority order, collecting any
    /// peers they return. Performs blocking HTTP; callers must run this off
    /// the dispatch loop thread.
    pub fn announce(&self, event: Option<Event>) -> Vec<std::net::SocketAddr> {
        let mut discovered = Vec::new();
        let now = std::time::Instant::now();
        let num_peers = self.peers().len();
        let (downloaded, uploaded) = {
            let states = self.peer_states.lock().unwrap();
            (
                states.values().map(|s| s.downloaded).sum(),
                states.values().map(|s| s.uploaded).sum(),
            )
        };

        for tier in self.trackers.lock().unwrap().iter_mut() {
            for tracker in tier {
                let should = event.is_some() || tracker.can_announce(now) || tracker.should_announce(now);
                if !should {
                    continue;
                }
                let params = AnnounceParams {
                    info_hash: self.info_hash,
                    peer_id: self.client_id,
                    port: 6881,
                    uploaded,
                    downloaded,
                    left: self.store.total_len,
                    event,
                    num_want: Some(50usize.saturating_sub(num_peers)),
                    tracker_id: tracker.tracker_id.clone(),
                };
                match tracker.send_announce(params) {
                    Ok(peers) => discovered.extend(peers),
                    Err(e) => tracing::error!("tracker announce error: {}", e),
                }
            }
        }
        discovered
    }

    /// Bound to the "shutdown" lifecycle hook by [`crate::Client`].
    pub fn shutdown(&self) {
        self.registry.deactivate(self.info_hash);
        self.dispatcher.shutdown();
        self.sweep_shutdown.store(true, Ordering::SeqCst);
        let _ = self.announce(Some(Event::Stopped));
        let _ = self.disk_tx.lock().unwrap().send(fs::CommandToDisk::Shutdown);
    }

    #[cfg(test)]
    pub(crate) fn insert_peer_for_test(&self, peer: Peer) {
        self.peer_states.lock().unwrap().insert(peer, ConnectionState::default());
    }

    #[cfg(test)]
    pub(crate) fn remove_peer_for_test(&self, peer: &Peer) {
        self.peer_states.lock().unwrap().remove(peer);
    }

    #[cfg(test)]
    pub(crate) fn set_counters_for_test(&self, peer: &Peer, downloaded: u64, uploaded: u64) {
        if let Some(state) = self.peer_states.lock().unwrap().get_mut(peer) {
            state.downloaded = downloaded;
            state.uploaded = uploaded;
        }
    }
}
