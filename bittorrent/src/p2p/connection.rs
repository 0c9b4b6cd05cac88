use std::io::{Read, Write};
use std::net::TcpStream;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::{p2p::message::{Message, MessageCodec}, TorrentId};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message codec error: {0}")]
    Codec(String),
}

/// The dispatcher's view of one peer connection. Every method here must be
/// non-blocking: the dispatch loop calls these from its single thread and a
/// blocking call here stalls every other peer.
pub trait PeerConnection: Send + Sync {
    /// Attempts to decode one message already buffered by the transport.
    /// Returns `Ok(None)` when nothing is currently available; does not block
    /// waiting for more bytes to arrive.
    fn read_message_now(&self) -> Result<Option<Message>, ConnectionError>;

    /// Attempts to send one message. May buffer internally if the socket
    /// isn't immediately writable.
    fn post_message(&self, message: Message) -> Result<(), ConnectionError>;

    fn is_closed(&self) -> bool;

    fn torrent_id(&self) -> TorrentId;
}

/// A [`PeerConnection`] over a non-blocking `std::net::TcpStream`, reusing the
/// wire-format [`MessageCodec`] the rest of the crate already speaks.
///
/// Internal mutability is needed because `read_message_now`/`post_message`
/// take `&self`: the dispatcher only ever touches one connection at a time
/// from its single loop thread, so a plain `Mutex` is sufficient and never
/// contended.
pub struct TcpPeerConnection {
    stream: std::sync::Mutex<TcpStream>,
    read_buf: std::sync::Mutex<BytesMut>,
    write_buf: std::sync::Mutex<BytesMut>,
    closed: std::sync::atomic::AtomicBool,
    torrent_id: TorrentId,
}

impl TcpPeerConnection {
    pub fn new(stream: TcpStream, torrent_id: TorrentId) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream: std::sync::Mutex::new(stream),
            read_buf: std::sync::Mutex::new(BytesMut::with_capacity(4096)),
            write_buf: std::sync::Mutex::new(BytesMut::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
            torrent_id,
        })
    }

    fn mark_closed(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

impl PeerConnection for TcpPeerConnection {
    fn read_message_now(&self) -> Result<Option<Message>, ConnectionError> {
        let mut read_buf = self.read_buf.lock().unwrap();

        // Try decoding what's already buffered before touching the socket.
        if let Some(msg) = MessageCodec
            .decode(&mut read_buf)
            .map_err(|e| ConnectionError::Codec(e.to_string()))?
        {
            return Ok(Some(msg));
        }

        let mut stream = self.stream.lock().unwrap();
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk) {
            Ok(0) => {
                self.mark_closed();
                Ok(None)
            }
            Ok(n) => {
                read_buf.extend_from_slice(&chunk[..n]);
                MessageCodec
                    .decode(&mut read_buf)
                    .map_err(|e| ConnectionError::Codec(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => {
                self.mark_closed();
                Err(e.into())
            }
        }
    }

    fn post_message(&self, message: Message) -> Result<(), ConnectionError> {
        let mut write_buf = self.write_buf.lock().unwrap();
        MessageCodec
            .encode(message, &mut write_buf)
            .map_err(|e| ConnectionError::Codec(e.to_string()))?;

        let mut stream = self.stream.lock().unwrap();
        match stream.write(&write_buf) {
            Ok(n) => {
                write_buf.clear();
                let _ = n;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                self.mark_closed();
                Err(e.into())
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn torrent_id(&self) -> TorrentId {
        self.torrent_id
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// An in-memory [`PeerConnection`] for dispatcher/worker unit tests: no
    /// sockets, just queues a test can push into and inspect.
    pub struct FakeConnection {
        pub inbound: Mutex<VecDeque<Result<Option<Message>, String>>>,
        pub outbound: Mutex<Vec<Message>>,
        pub closed: std::sync::atomic::AtomicBool,
        pub torrent_id: TorrentId,
    }

    impl FakeConnection {
        pub fn new(torrent_id: TorrentId) -> Self {
            Self {
                inbound: Mutex::new(VecDeque::new()),
                outbound: Mutex::new(Vec::new()),
                closed: std::sync::atomic::AtomicBool::new(false),
                torrent_id,
            }
        }

        pub fn push_inbound(&self, message: Message) {
            self.inbound.lock().unwrap().push_back(Ok(Some(message)));
        }

        pub fn close(&self) {
            self.closed.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    }

    impl PeerConnection for FakeConnection {
        fn read_message_now(&self) -> Result<Option<Message>, ConnectionError> {
            match self.inbound.lock().unwrap().pop_front() {
                Some(Ok(msg)) => Ok(msg),
                Some(Err(e)) => Err(ConnectionError::Codec(e)),
                None => Ok(None),
            }
        }

        fn post_message(&self, message: Message) -> Result<(), ConnectionError> {
            self.outbound.lock().unwrap().push(message);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(std::sync::atomic::Ordering::Relaxed)
        }

        fn torrent_id(&self) -> TorrentId {
            self.torrent_id
        }
    }
}
