//! Error types for slimlink.

use thiserror::Error;

/// Main error type for slimlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failed; recoverable by reconnecting.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Byte stream desynchronised; only a reconnect can repair it.
    #[error("malformed frame: declared length {len}")]
    MalformedFrame { len: u32 },

    /// A frame could not be turned into a command.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The audio engine rejected or lost the stream.
    #[error(transparent)]
    AudioEngine(#[from] AudioEngineError),

    /// The recovery snapshot is older than the grace window.
    #[error("recovery snapshot expired")]
    RecoveryExpired,

    /// A remote store round-trip exceeded its deadline.
    #[error("remote store timed out")]
    RemoteStoreTimeout,

    /// HTTP request to the server side-channel failed.
    #[error("RPC error: {0}")]
    Rpc(#[from] reqwest::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Local persistent store failed.
    #[error("store error: {0}")]
    Store(String),

    /// The session task has exited.
    #[error("session closed")]
    SessionClosed,

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Failure to turn a frame body into a typed command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Tag not known to this client. Never fatal.
    #[error("unknown command tag {}", String::from_utf8_lossy(.0))]
    UnknownCommand([u8; 4]),

    /// Known tag with an unparseable payload. The frame is dropped.
    #[error("bad {} payload: {reason}", String::from_utf8_lossy(.tag))]
    Payload { tag: [u8; 4], reason: String },
}

/// Failure reported by the audio engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AudioEngineError {
    #[error("format rejected: {0}")]
    FormatRejected(String),

    #[error("stream stalled")]
    Stalled,

    #[error("no such stream")]
    UnknownHandle,

    #[error("engine failure: {0}")]
    Failed(String),
}
