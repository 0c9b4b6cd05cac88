use bittorrent::{Client, ClientConfig, TorrentConfig};
use std::path::PathBuf;

fn main() {
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub).unwrap();

    let mut args = std::env::args().skip(1);
    let torrent_path = args.next().expect("usage: bittorrent <path-to-torrent> [output-dir]");
    let output_dir = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));

    let client = Client::new(ClientConfig::default());
    client
        .start_accepting()
        .unwrap_or_else(|e| tracing::warn!("failed to accept inbound connections: {}", e));

    let torrent_id = client
        .add_torrent(&torrent_path, TorrentConfig { output_dir, ..Default::default() })
        .unwrap_or_else(|e| panic!("failed to add torrent: {}", e));

    let worker = client.worker(torrent_id).expect("worker was just inserted");
    loop {
        let discovered = worker.announce(None);
        for peer in discovered {
            if let Err(e) = client.connect_peer(torrent_id, peer) {
                tracing::warn!("failed to connect to {}: {}", peer, e);
            }
        }

        std::thread::sleep(std::time::Duration::from_secs(30));
        if worker.pieces_remaining() == Some(0) {
            tracing::info!("torrent complete");
            break;
        }
    }
}
