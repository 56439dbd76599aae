//! # Slimlink
//!
//! Session protocol core for a network audio player: the framed control
//! connection to a music server, interpolated playback position, and
//! recovery of the server playlist position after a disconnect.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use slimlink::{Collaborators, FileStore, JsonRpcStore, SessionConfig, SessionCoordinator, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> slimlink::Result<()> {
//!     let config = SessionConfig::new("Living Room", "192.168.1.10");
//!     let (engine_tx, engine_rx) = slimlink::engine::channel();
//!     let engine = Arc::new(MyEngine::new(engine_tx));
//!     let remote = Arc::new(JsonRpcStore::new(&config.rpc_url)?);
//!     let store = Arc::new(FileStore::new("state"));
//!
//!     let (session, mut events) = SessionCoordinator::start(
//!         config,
//!         Collaborators::new(engine, engine_rx, store, remote),
//!     );
//!
//!     while let Some(event) = events.recv().await {
//!         if let SessionEvent::TrackStarted { session: s } = event {
//!             println!("Now streaming {}", s.track_id);
//!         }
//!     }
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod msg;
pub mod playback;
pub mod recovery;
pub mod remote;
pub mod session;
pub mod store;
pub mod timesync;
pub mod transport;
pub mod types;

// Internal modules
pub(crate) mod runner;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main public API
pub use config::{SessionConfig, Timing};
pub use connection::ConnectionState;
pub use engine::{AudioEngine, EngineEvent, EngineEventKind, EngineEvents, EngineHandle};
pub use event::{DisplayState, LifecycleEvent, SessionEvent};
pub use playback::PlaybackState;
pub use recovery::{RecoveryManager, RecoveryMode, RecoveryOutcome};
pub use remote::{Control, JsonRpcStore, RemoteStore};
pub use session::{Collaborators, SessionCoordinator};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use timesync::PositionReader;
pub use transport::{Connector, TcpConnector};

pub use error::{AudioEngineError, DispatchError, Error};
pub use types::*;

/// Result type for slimlink operations.
pub type Result<T> = std::result::Result<T, Error>;
