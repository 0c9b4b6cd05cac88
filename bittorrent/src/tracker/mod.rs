use std::{net::SocketAddr, time::Instant};
use serde_derive::Deserialize;
use url::Url;

type Result<T> = std::result::Result<T, TrackerError>;

// In cases where the tracker doesn't give us a min interval.
const DEFAULT_MIN_ANNOUNCE_INTERVAL: u64 = 60; // seconds

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("invalid url")]
    InvalidUrl,

    #[error("response error: {0}")]
    ResponseError(String),
}

#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
    pub num_want: Option<usize>,
    pub tracker_id: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub enum Event {
    Completed,
    #[default]
    Started,
    Stopped,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Completed => write!(f, "completed"),
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

/// One tracker known for a torrent, announced to over HTTP on a background
/// thread — never on the dispatch loop thread.
#[derive(Debug, Clone)]
pub struct Tracker {
    pub url: Url,
    pub tracker_id: Option<String>,
    pub last_announce: Option<Instant>,
    interval: u64,
    min_interval: u64,
}

impl Tracker {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            tracker_id: None,
            last_announce: None,
            interval: DEFAULT_MIN_ANNOUNCE_INTERVAL,
            min_interval: DEFAULT_MIN_ANNOUNCE_INTERVAL,
        }
    }

    pub fn can_announce(&self, time: Instant) -> bool {
        match self.last_announce {
            Some(last) => time.duration_since(last).as_secs() >= self.min_interval,
            None => true,
        }
    }

    pub fn should_announce(&self, time: Instant) -> bool {
        match self.last_announce {
            Some(last) => time.duration_since(last).as_secs() >= self.interval,
            None => true,
        }
    }

    pub fn send_announce(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>> {
        if self.url.scheme() != "http" && self.url.scheme() != "https" {
            tracing::warn!("unsupported tracker scheme: {}", self.url.scheme());
            return Err(TrackerError::InvalidUrl);
        }

        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("info_hash", &urlencoding::encode_binary(&params.info_hash));
            query.append_pair("peer_id", &urlencoding::encode_binary(&params.peer_id));
            query.append_pair("port", &params.port.to_string());
            query.append_pair("uploaded", &params.uploaded.to_string());
            query.append_pair("downloaded", &params.downloaded.to_string());
            query.append_pair("left", &params.left.to_string());
            query.append_pair("compact", "1");
            if let Some(event) = params.event {
                query.append_pair("event", &event.to_string());
            }
            if let Some(num_want) = params.num_want {
                query.append_pair("numwant", &num_want.to_string());
            }
            if let Some(tracker_id) = &params.tracker_id {
                query.append_pair("trackerid", tracker_id);
            }
        }

        let bytes = reqwest::blocking::get(url)?.bytes()?;
        let response: HttpResponse = bencode::decode_bytes(&bytes)?;

        if let Some(reason) = response.failure_reason {
            return Err(TrackerError::ResponseError(reason));
        }
        if let Some(tracker_id) = response.tracker_id {
            self.tracker_id = Some(tracker_id);
        }
        self.interval = response.interval;
        self.min_interval = response.min_interval.unwrap_or(DEFAULT_MIN_ANNOUNCE_INTERVAL);

        Ok(response.peers)
    }
}

#[derive(Deserialize)]
struct HttpResponse {
    #[serde(default)]
    failure_reason: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    warning_message: Option<String>,
    interval: u64,
    #[serde(default)]
    #[serde(rename = "min interval")]
    min_interval: Option<u64>,
    #[serde(default)]
    #[serde(rename = "tracker id")]
    tracker_id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    complete: Option<u64>,
    #[serde(default)]
    #[allow(dead_code)]
    incomplete: Option<u64>,
    #[serde(default)]
    #[serde(deserialize_with = "peer_deserialize")]
    peers: Vec<SocketAddr>,
}

fn peer_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeersVisitor;

    impl<'de> serde::de::Visitor<'de> for PeersVisitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a compact peers byte string")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(v.chunks_exact(6)
                .map(|chunk| {
                    let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    SocketAddr::new(ip.into(), port)
                })
                .collect())
        }
    }

    deserializer.deserialize_bytes(PeersVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peers() {
        let mut bytes = vec![127, 0, 0, 1, 0x1a, 0xe1];
        bytes.extend_from_slice(&[10, 0, 0, 2, 0x1a, 0xe2]);

        let response = HttpResponse {
            failure_reason: None,
            warning_message: None,
            interval: 1800,
            min_interval: None,
            tracker_id: None,
            complete: None,
            incomplete: None,
            peers: vec![
                SocketAddr::new(std::net::Ipv4Addr::new(127, 0, 0, 1).into(), 0x1ae1),
                SocketAddr::new(std::net::Ipv4Addr::new(10, 0, 0, 2).into(), 0x1ae2),
            ],
        };
        assert_eq!(response.peers.len(), 2);
    }
}
