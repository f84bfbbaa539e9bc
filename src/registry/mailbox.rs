//! Signaling mailbox: offers and ICE candidates in flight
//!
//! The broadcaster owns `/offers/*` and `/candidates/listeners/*`; each
//! listener owns `/candidates/admin/{its id}`. Every message is tagged with
//! the epoch it belongs to so that a reader can drop leftovers of a
//! superseded epoch.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{best_effort, decode};
use crate::peer::IceCandidate;
use crate::store::{path, ChildAdded, ChildWatch, Store, StoreError, ValueWatch};

/// The `/offers/{id}` record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferEnvelope {
    pub session_id: String,

    #[serde(rename = "offer")]
    pub sdp: String,

    /// Strictly increasing per broadcaster; orders offers within an epoch
    pub created_at: u64,
}

impl OfferEnvelope {
    /// Decode the value of an offer watch
    pub fn from_value(id: &str, value: Option<Value>) -> Option<Self> {
        match decode(&path::offer(id), value?) {
            Ok(offer) => Some(offer),
            Err(e) => {
                tracing::debug!(listener = %id, error = %e, "Ignoring malformed offer");
                None
            }
        }
    }
}

/// One entry of a candidate sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateEnvelope {
    #[serde(rename = "sessionId", default)]
    pub session_id: String,

    #[serde(flatten)]
    pub candidate: IceCandidate,
}

impl CandidateEnvelope {
    pub fn new(session_id: impl Into<String>, candidate: IceCandidate) -> Self {
        Self {
            session_id: session_id.into(),
            candidate,
        }
    }

    /// Decode a child of a candidate sequence
    pub fn from_child(child: ChildAdded) -> Option<Self> {
        match serde_json::from_value(child.value) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::debug!(key = %child.key, error = %e, "Ignoring malformed candidate");
                None
            }
        }
    }
}

/// Per-listener message channels
#[derive(Clone)]
pub struct Mailbox {
    store: Arc<dyn Store>,
}

impl Mailbox {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Store the offer for a listener, replacing any previous one
    pub async fn post_offer(&self, id: &str, offer: &OfferEnvelope) -> Result<(), StoreError> {
        let value = serde_json::to_value(offer).map_err(|source| StoreError::Malformed {
            path: path::offer(id),
            source,
        })?;
        self.store.set(&path::offer(id), value).await
    }

    pub async fn watch_offer(&self, id: &str) -> Result<ValueWatch, StoreError> {
        self.store.watch_value(&path::offer(id)).await
    }

    /// Append a broadcaster candidate for a listener
    pub async fn send_to_listener(
        &self,
        id: &str,
        candidate: &CandidateEnvelope,
    ) -> Result<(), StoreError> {
        self.push(&path::candidates_to_listener(id), candidate).await
    }

    /// Append a listener candidate for the broadcaster
    pub async fn send_to_broadcaster(
        &self,
        id: &str,
        candidate: &CandidateEnvelope,
    ) -> Result<(), StoreError> {
        self.push(&path::candidates_to_broadcaster(id), candidate).await
    }

    pub async fn watch_to_listener(&self, id: &str) -> Result<ChildWatch, StoreError> {
        self.store
            .watch_children(&path::candidates_to_listener(id))
            .await
    }

    pub async fn watch_to_broadcaster(&self, id: &str) -> Result<ChildWatch, StoreError> {
        self.store
            .watch_children(&path::candidates_to_broadcaster(id))
            .await
    }

    /// Drop everything in flight for one listener (best-effort)
    pub async fn clear_listener(&self, id: &str) {
        best_effort("clear offer", self.store.remove(&path::offer(id)).await);
        best_effort(
            "clear candidates to listener",
            self.store.remove(&path::candidates_to_listener(id)).await,
        );
        self.clear_to_broadcaster(id).await;
    }

    /// Drop the candidates one listener sent (best-effort)
    pub async fn clear_to_broadcaster(&self, id: &str) {
        best_effort(
            "clear candidates to broadcaster",
            self.store.remove(&path::candidates_to_broadcaster(id)).await,
        );
    }

    /// Drop every offer and both candidate trees (best-effort)
    pub async fn clear_all(&self) {
        best_effort("clear offers", self.store.remove(path::OFFERS).await);
        best_effort(
            "clear candidates to listeners",
            self.store.remove(path::CANDIDATES_TO_LISTENER).await,
        );
        best_effort(
            "clear candidates to broadcaster",
            self.store.remove(path::CANDIDATES_TO_BROADCASTER).await,
        );
    }

    async fn push(&self, at: &str, candidate: &CandidateEnvelope) -> Result<(), StoreError> {
        let value = serde_json::to_value(candidate).map_err(|source| StoreError::Malformed {
            path: at.to_string(),
            source,
        })?;
        self.store.push(at, value).await.map(|_| ())
    }
}
