pub mod message;
pub mod handshake;
pub mod connection;
pub mod pool;
pub mod registry;
pub mod loop_control;
pub mod dispatcher;
pub mod state;

pub use message::{Message, MessageCodec};
pub use handshake::{Handshake, HandshakeCodec};

#[derive(thiserror::Error, Debug)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake received")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("bitfield sent before handshake")]
    UnexpectedBitfield,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("connection timeout")]
    Timeout,
}
