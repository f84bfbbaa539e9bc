//! Crate-level error type
//!
//! Only the top-level lifecycle operations (`Broadcaster::start`,
//! `ListenerCoordinator::join` / `enable_audio`) return errors. Failures
//! inside a running negotiation are expected races of an eventually
//! consistent store and are logged and repaired by renegotiation instead.

use thiserror::Error;

use crate::media::MediaError;
use crate::peer::PeerError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("transport: {0}")]
    Peer(#[from] PeerError),

    #[error("media: {0}")]
    Media(#[from] MediaError),
}

pub type Result<T> = std::result::Result<T, Error>;
