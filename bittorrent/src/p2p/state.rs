use crate::Bitfield;

/// Per-peer mutable bookkeeping a [`crate::Worker`] maintains from inside its
/// registered consumer/supplier callbacks. `downloaded`/`uploaded` are the two
/// monotonic counters the [`crate::SessionStateAggregator`] reads; everything
/// else is exchange state private to the worker.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub downloaded: u64,
    pub uploaded: u64,

    // Whether we are answering the peer's requests.
    pub choked: bool,

    // Whether we are interested in the peer's pieces.
    pub interested: bool,

    // Whether the peer is answering our requests.
    pub peer_choking: bool,

    // Whether the peer is interested in our pieces.
    pub peer_interested: bool,

    // Pieces the peer is known to have, from its bitfield/have messages.
    pub peer_bitfield: Option<Bitfield>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            downloaded: 0,
            uploaded: 0,
            choked: true,
            interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_bitfield: None,
        }
    }
}

impl ConnectionState {
    pub fn record_download(&mut self, bytes: u64) {
        self.downloaded += bytes;
    }

    pub fn record_upload(&mut self, bytes: u64) {
        self.uploaded += bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut state = ConnectionState::default();
        state.record_download(100);
        state.record_download(50);
        state.record_upload(10);
        assert_eq!(state.downloaded, 150);
        assert_eq!(state.uploaded, 10);
    }
}
