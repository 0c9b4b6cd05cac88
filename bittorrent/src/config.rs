use std::{net::SocketAddr, path::PathBuf, time::Duration};

/// Tunables shared by every torrent a [`crate::Client`] drives.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Unique 20-byte identifier advertised to peers and trackers.
    pub client_id: [u8; 20],

    /// Address the client listens for incoming peer connections on.
    pub listen_address: SocketAddr,

    /// Ceiling for the dispatch loop's adaptive backoff sleep.
    pub max_message_processing_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: *b"-RS0133-73b3b0b0b0b0",
            listen_address: SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 6881),
            max_message_processing_interval: Duration::from_millis(64),
        }
    }
}

/// Per-torrent tunables, supplied when a torrent is added to the client.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Minimum and maximum number of peers the worker tries to stay connected to.
    pub min_max_peers: (u32, u32),

    /// Directory the torrent's files are written into.
    pub output_dir: PathBuf,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            min_max_peers: (5, 100),
            output_dir: PathBuf::from("."),
        }
    }
}
