use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{ClientConfig, TorrentConfig};
use crate::metainfo::{MetaInfo, MetaInfoError};
use crate::p2p::connection::{ConnectionError, PeerConnection, TcpPeerConnection};
use crate::p2p::handshake::{Handshake, HandshakeCodec};
use crate::worker::{Worker, WorkerError};
use crate::{Peer, TorrentId};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metainfo error: {0}")]
    MetaInfo(#[from] MetaInfoError),

    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("unknown torrent")]
    UnknownTorrent,

    #[error("handshake did not match the expected torrent")]
    HandshakeMismatch,
}

/// The process-wide entry point: owns [`ClientConfig`] and every active
/// torrent's [`Worker`], and accepts incoming peer connections on the
/// configured listen address, routing each one to its torrent by info-hash.
pub struct Client {
    config: ClientConfig,
    workers: Mutex<HashMap<TorrentId, Arc<Worker>>>,
    accepting: Arc<AtomicBool>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Arc<Client> {
        Arc::new(Client {
            config,
            workers: Mutex::new(HashMap::new()),
            accepting: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Reads and validates the .torrent file, builds its [`Worker`] and
    /// starts its dispatch loop and disk pump. Returns the torrent's info-hash.
    pub fn add_torrent<P: AsRef<Path>>(
        self: &Arc<Self>,
        path: P,
        torrent_config: TorrentConfig,
    ) -> Result<TorrentId, ClientError> {
        let metainfo = MetaInfo::new(path)?;
        let info_hash = metainfo.info_hash();
        let worker = Arc::new(Worker::with_client_id(
            metainfo,
            torrent_config,
            self.config.client_id,
            self.config.max_message_processing_interval,
        )?);
        worker.start();
        self.workers.lock().unwrap().insert(info_hash, worker);
        Ok(info_hash)
    }

    /// Announces the torrent's trackers with a stopped event, tears down its
    /// dispatch loop and disk thread, and drops the worker.
    pub fn remove_torrent(&self, torrent_id: TorrentId) -> Result<(), ClientError> {
        let worker = self
            .workers
            .lock()
            .unwrap()
            .remove(&torrent_id)
            .ok_or(ClientError::UnknownTorrent)?;
        worker.shutdown();
        Ok(())
    }

    pub fn worker(&self, torrent_id: TorrentId) -> Option<Arc<Worker>> {
        self.workers.lock().unwrap().get(&torrent_id).cloned()
    }

    pub fn torrents(&self) -> Vec<TorrentId> {
        self.workers.lock().unwrap().keys().copied().collect()
    }

    /// Dials a peer for an already-added torrent, performs the blocking
    /// handshake, and registers the resulting connection with its worker.
    pub fn connect_peer(self: &Arc<Self>, torrent_id: TorrentId, addr: Peer) -> Result<(), ClientError> {
        let worker = self.worker(torrent_id).ok_or(ClientError::UnknownTorrent)?;
        let stream = TcpStream::connect(addr)?;
        let stream = self.exchange_handshake(stream, torrent_id)?;
        let connection: Arc<dyn PeerConnection> = Arc::new(TcpPeerConnection::new(stream, torrent_id)?);
        worker.register_connection(addr, connection);
        Ok(())
    }

    /// Spawns a background thread that accepts inbound connections on
    /// `config.listen_address`, dispatching each to the torrent named by its
    /// handshake's info-hash.
    pub fn start_accepting(self: &Arc<Self>) -> Result<(), ClientError> {
        let listener = TcpListener::bind(self.config.listen_address)?;
        self.accepting.store(true, Ordering::SeqCst);
        let client = Arc::clone(self);
        std::thread::Builder::new()
            .name("client-accept".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    if !client.accepting.load(Ordering::SeqCst) {
                        break;
                    }
                    let stream = match stream {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = client.accept_one(stream) {
                        tracing::warn!("inbound handshake failed: {}", e);
                    }
                }
            })
            .expect("failed to spawn accept thread");
        Ok(())
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    fn accept_one(self: &Arc<Self>, mut stream: TcpStream) -> Result<(), ClientError> {
        let peer_addr = stream.peer_addr()?;
        let mut buf = BytesMut::with_capacity(68);
        let mut codec = HandshakeCodec;
        let handshake = loop {
            if let Some(hs) = codec.decode(&mut buf).map_err(|e| ConnectionError::Codec(e.to_string()))? {
                break hs;
            }
            let mut chunk = [0u8; 68];
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                return Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed during handshake",
                )));
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let worker = self.worker(handshake.info_hash).ok_or(ClientError::UnknownTorrent)?;

        let mut reply = BytesMut::new();
        codec
            .encode(Handshake::new(handshake.info_hash, self.config.client_id), &mut reply)
            .map_err(|e| ConnectionError::Codec(e.to_string()))?;
        stream.write_all(&reply)?;

        let connection: Arc<dyn PeerConnection> = Arc::new(TcpPeerConnection::new(stream, handshake.info_hash)?);
        worker.register_connection(peer_addr, connection);
        Ok(())
    }

    fn exchange_handshake(&self, mut stream: TcpStream, torrent_id: TorrentId) -> Result<TcpStream, ClientError> {
        let mut codec = HandshakeCodec;
        let mut out = BytesMut::new();
        codec
            .encode(Handshake::new(torrent_id, self.config.client_id), &mut out)
            .map_err(|e| ConnectionError::Codec(e.to_string()))?;
        stream.write_all(&out)?;

        let mut buf = BytesMut::with_capacity(68);
        let reply = loop {
            if let Some(hs) = codec.decode(&mut buf).map_err(|e| ConnectionError::Codec(e.to_string()))? {
                break hs;
            }
            let mut chunk = [0u8; 68];
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                return Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed during handshake",
                )));
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        if reply.info_hash != torrent_id {
            return Err(ClientError::HandshakeMismatch);
        }
        Ok(stream)
    }
}
