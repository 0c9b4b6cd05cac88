#![allow(dead_code)]

mod metainfo;
mod store;
mod tracker;
mod p2p;
mod fs;
mod block;
mod picker;
mod de;
mod config;
mod aggregator;
mod worker;
mod client;

const BLOCK_SIZE: usize = 0x4000;

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

/// Identity of one remote participant on one transport connection. Stable for the
/// lifetime of a TCP connection, which is the granularity the peer messaging core
/// tracks peers at.
pub type Peer = std::net::SocketAddr;

/// A torrent's info-hash, stable for the lifetime of a session.
pub type TorrentId = [u8; 20];

pub use metainfo::MetaInfo;
pub use config::{ClientConfig, TorrentConfig};
pub use client::{Client, ClientError};
pub use worker::{Worker, WorkerError};
pub use aggregator::SessionStateAggregator;
pub use p2p::dispatcher::MessageDispatcher;
pub use p2p::loop_control::LoopControl;
pub use p2p::connection::{PeerConnection, ConnectionError, TcpPeerConnection};
pub use p2p::pool::{PeerConnectionPool, InMemoryConnectionPool};
pub use p2p::registry::{TorrentRegistry, InMemoryTorrentRegistry};
pub use p2p::state::ConnectionState;
