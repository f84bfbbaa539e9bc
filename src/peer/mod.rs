//! Peer transport capability
//!
//! The coordinators drive an opaque transport (typically WebRTC) through
//! these traits. A session reports asynchronous happenings (gathered local
//! candidates, connection-state changes, incoming tracks) on the event
//! channel returned when it is created; the channel closes when the session
//! is closed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::MediaTrack;

/// Error type for transport operations
#[derive(Debug, Error)]
pub enum PeerError {
    /// The session was closed
    #[error("peer session closed")]
    Closed,

    /// The operation is not allowed in the session's signaling state
    #[error("{operation} not allowed in signaling state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SignalingState,
    },

    /// The transport rejected a description or candidate
    #[error("transport error: {0}")]
    Transport(String),
}

/// Kind of session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP offer or answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in its JSON wire form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,

    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,

    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,

    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// Offer/answer state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    /// A local offer is set; waiting for the remote answer
    HaveLocalOffer,
    /// A remote offer is set; a local answer is due
    HaveRemoteOffer,
    Closed,
}

/// Connectivity state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Whether the state calls for rebuilding the session
    pub fn needs_reconnect(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

/// Asynchronous notifications from a session
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered
    LocalCandidate(IceCandidate),

    /// Connectivity changed
    ConnectionStateChanged(ConnectionState),

    /// The remote side started sending media
    RemoteTrack(MediaTrack),
}

/// Parameters of a new session
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    /// Listener the session talks to (or, on the listener side, its own id)
    pub label: String,

    /// ICE server URLs
    pub ice_servers: Vec<String>,

    /// Track to send; None for receive-only sessions
    pub outgoing_track: Option<MediaTrack>,

    /// Cap on the outgoing encoding in bits per second; None = unlimited
    pub max_bitrate_bps: Option<u32>,
}

/// One negotiated transport session
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Produce a local offer (not yet applied)
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Produce a local answer to the applied remote offer (not yet applied)
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Feed a remote candidate; feeding a duplicate must be harmless
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    fn signaling_state(&self) -> SignalingState;

    /// Change the outgoing encoding cap; None = unlimited
    async fn set_max_bitrate(&self, bps: Option<u32>) -> Result<(), PeerError>;

    /// Close the session; idempotent
    async fn close(&self);
}

/// Factory of transport sessions
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn create_session(
        &self,
        config: PeerConfig,
    ) -> Result<(Arc<dyn PeerSession>, mpsc::UnboundedReceiver<PeerEvent>), PeerError>;
}
