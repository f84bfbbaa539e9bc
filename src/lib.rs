//! # castwire
//!
//! Signaling and session-lifecycle coordination for one live audio
//! broadcaster and many listeners, using a shared pub/sub key-value store as
//! the only rendezvous channel.
//!
//! ```text
//!                 ┌──────────── shared store ────────────┐
//!                 │ /broadcast        epoch (sessionId)  │
//!   Broadcaster ◄─┤ /listeners/{id}   per-listener state ├─► ListenerCoordinator
//!   (one)         │ /offers/{id}      offer mailbox      │   (many)
//!                 │ /candidates/...   ICE trickle        │
//!                 └──────────────────────────────────────┘
//!                          ▲                    ▲
//!                          └── PeerTransport ───┘   (media flows here)
//! ```
//!
//! Every on-air period gets a fresh `sessionId`. Everything written during
//! an epoch is tagged with it, and both sides drop what belongs to any other
//! epoch. The transport, the media pipeline and the store are traits; an
//! in-memory [`store::MemoryStore`] is included.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use castwire::{Broadcaster, ListenerCoordinator, MemoryStore, SignalingConfig};
//! # use castwire::{media::MediaPipeline, peer::PeerTransport};
//! # async fn run(transport: Arc<dyn PeerTransport>, media: Arc<dyn MediaPipeline>) -> castwire::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//!
//! let broadcaster = Broadcaster::new(store.clone(), transport.clone(), media.clone(), SignalingConfig::default());
//! broadcaster.start().await?;
//!
//! let listener = ListenerCoordinator::new("listener-1", store, transport, media, SignalingConfig::default());
//! listener.join().await?;
//! listener.enable_audio().await?;
//! # Ok(())
//! # }
//! ```

pub mod broadcaster;
pub mod config;
pub mod control;
pub mod error;
pub mod listener;
pub mod media;
pub mod peer;
pub mod registry;
pub mod store;
pub mod time;

pub use broadcaster::Broadcaster;
pub use config::SignalingConfig;
pub use error::{Error, Result};
pub use listener::{ListenerCoordinator, ListenerStatus};
pub use registry::SessionId;
pub use store::{MemoryStore, Store, StoreError};
