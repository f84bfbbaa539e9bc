//! Listener registry: one record per listener identity

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::decode;
use super::epoch::SessionId;
use crate::store::{fields, path, ChildWatch, Store, StoreError, ValueWatch};

/// Opaque listener identity (the key under `/listeners`)
pub type ListenerId = String;

/// Negotiation state as published in the listener record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationState {
    #[default]
    Waiting,
    Connecting,
    Connected,
}

/// A `/listeners/{id}` record
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerRecord {
    /// Taken from the record's key, not stored in it
    #[serde(skip)]
    pub id: ListenerId,

    #[serde(default, rename = "state")]
    pub negotiation_state: NegotiationState,

    /// The listener opted in to audio
    #[serde(default)]
    pub audio_enabled: bool,

    /// Epoch the listener believes it is bound to
    #[serde(default)]
    pub session_id: String,

    /// Answer SDP for the outstanding offer
    #[serde(default)]
    pub answer: Option<String>,

    #[serde(default)]
    pub updated_at: u64,

    #[serde(default)]
    pub joined_at: u64,

    /// `createdAt` of the offer that `answer` replies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_offer: Option<u64>,
}

impl ListenerRecord {
    /// Decode a record stored under `id`
    pub fn decode(id: &str, value: Value) -> Result<Self, StoreError> {
        let mut record: ListenerRecord = decode(&path::listener(id), value)?;
        record.id = id.to_string();
        Ok(record)
    }

    /// Decode every record of a `/listeners` snapshot, skipping malformed ones
    pub fn decode_all(snapshot: Option<Value>) -> Vec<ListenerRecord> {
        let Some(Value::Object(children)) = snapshot else {
            return Vec::new();
        };

        children
            .into_iter()
            .filter_map(|(id, value)| match ListenerRecord::decode(&id, value) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::debug!(listener = %id, error = %e, "Skipping malformed listener record");
                    None
                }
            })
            .collect()
    }

    /// Whether the record claims to be bound to the given epoch
    pub fn is_bound_to(&self, session_id: &SessionId) -> bool {
        *session_id == self.session_id
    }
}

/// Reads and writes listener records
#[derive(Clone)]
pub struct ListenerRegistry {
    store: Arc<dyn Store>,
}

impl ListenerRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Create (or recreate) a listener's record on first contact
    pub async fn create(&self, id: &str, now: u64) -> Result<(), StoreError> {
        self.store
            .set(
                &path::listener(id),
                json!({
                    "state": NegotiationState::Waiting,
                    "joinedAt": now,
                    "updatedAt": now,
                    "audioEnabled": false,
                    "sessionId": "",
                    "answer": null,
                }),
            )
            .await
    }

    /// Record the listener's audio opt-in
    pub async fn enable_audio(&self, id: &str, now: u64) -> Result<(), StoreError> {
        self.merge(id, json!({ "audioEnabled": true, "updatedAt": now }))
            .await
    }

    /// Refresh the liveness timestamp of an existing record
    ///
    /// Returns false, without writing, if the record is gone.
    pub async fn touch(&self, id: &str, now: u64) -> Result<bool, StoreError> {
        if self.store.get(&path::listener(id)).await?.is_none() {
            return Ok(false);
        }
        self.merge(id, json!({ "updatedAt": now })).await?;
        Ok(true)
    }

    /// Claim the listener for a fresh negotiation in `session_id`
    pub async fn mark_connecting(
        &self,
        id: &str,
        session_id: &SessionId,
        now: u64,
    ) -> Result<(), StoreError> {
        self.merge(
            id,
            json!({
                "state": NegotiationState::Connecting,
                "sessionId": session_id.as_str(),
                "answer": null,
                "answeredOffer": null,
                "updatedAt": now,
            }),
        )
        .await
    }

    /// Record that the listener's answer was applied
    pub async fn mark_connected(
        &self,
        id: &str,
        session_id: &SessionId,
        now: u64,
    ) -> Result<(), StoreError> {
        self.merge(
            id,
            json!({
                "state": NegotiationState::Connected,
                "sessionId": session_id.as_str(),
                "updatedAt": now,
            }),
        )
        .await
    }

    /// Publish the listener's answer to an offer
    pub async fn post_answer(
        &self,
        id: &str,
        session_id: &SessionId,
        sdp: &str,
        offer_created_at: u64,
        now: u64,
    ) -> Result<(), StoreError> {
        self.merge(
            id,
            json!({
                "answer": sdp,
                "answeredOffer": offer_created_at,
                "state": NegotiationState::Connecting,
                "sessionId": session_id.as_str(),
                "updatedAt": now,
            }),
        )
        .await
    }

    /// Ask the broadcaster for a fresh offer in the current epoch
    ///
    /// Clearing `sessionId` makes the record diverge from the epoch, which
    /// the broadcaster repairs by renegotiating. The stamp written is newer
    /// than the stored one even if another participant's clock wrote it.
    pub async fn request_renegotiation(&self, id: &str, now: u64) -> Result<(), StoreError> {
        let stored = self.read(id).await?.map_or(0, |record| record.updated_at);
        let now = now.max(stored.saturating_add(1));
        self.merge(
            id,
            json!({
                "state": NegotiationState::Connecting,
                "sessionId": "",
                "answer": null,
                "answeredOffer": null,
                "updatedAt": now,
            }),
        )
        .await
    }

    /// Put every existing record back to `waiting`, returning how many
    ///
    /// One merge at the root; records that vanish meanwhile are simply
    /// recreated partially and converge on the listener's next write.
    pub async fn reset_all(&self, now: u64) -> Result<usize, StoreError> {
        let records = self.list().await?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut updates = Map::new();
        for record in &records {
            let base = path::listener(&record.id);
            updates.insert(format!("{}/state", base), json!(NegotiationState::Waiting));
            updates.insert(format!("{}/sessionId", base), json!(""));
            updates.insert(format!("{}/answer", base), Value::Null);
            updates.insert(format!("{}/answeredOffer", base), Value::Null);
            updates.insert(format!("{}/updatedAt", base), json!(now));
        }

        self.store.update(path::ROOT, updates).await?;
        Ok(records.len())
    }

    /// Read one record
    pub async fn read(&self, id: &str) -> Result<Option<ListenerRecord>, StoreError> {
        match self.store.get(&path::listener(id)).await? {
            Some(value) => Ok(Some(ListenerRecord::decode(id, value)?)),
            None => Ok(None),
        }
    }

    /// Read every record
    pub async fn list(&self) -> Result<Vec<ListenerRecord>, StoreError> {
        let snapshot = self.store.get(path::LISTENERS).await?;
        Ok(ListenerRecord::decode_all(snapshot))
    }

    /// Subscribe to listeners appearing
    pub async fn watch_added(&self) -> Result<ChildWatch, StoreError> {
        self.store.watch_children(path::LISTENERS).await
    }

    /// Subscribe to every change of any record
    pub async fn watch_all(&self) -> Result<ValueWatch, StoreError> {
        self.store.watch_value(path::LISTENERS).await
    }

    /// Subscribe to one record
    pub async fn watch_one(&self, id: &str) -> Result<ValueWatch, StoreError> {
        self.store.watch_value(&path::listener(id)).await
    }

    async fn merge(&self, id: &str, value: Value) -> Result<(), StoreError> {
        self.store.update(&path::listener(id), fields(value)).await
    }
}
