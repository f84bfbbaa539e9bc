//! Session registry: the singleton broadcast epoch record

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::decode;
use crate::store::{fields, path, Store, StoreError, ValueWatch};

/// Broadcast status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpochStatus {
    /// No broadcast
    #[default]
    Idle,
    /// Broadcaster is on air
    Live,
}

/// Fencing token of one on-air period
///
/// 128 random bits, rendered as a UUID so that existing stores keep
/// recognising it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Mint a fresh token
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl PartialEq<str> for SessionId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<String> for SessionId {
    fn eq(&self, other: &String) -> bool {
        &self.0 == other
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_volume() -> f32 {
    1.0
}

/// The `/broadcast` record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEpoch {
    #[serde(default)]
    pub status: EpochStatus,

    /// Non-empty only while live
    #[serde(default)]
    pub session_id: String,

    #[serde(default, rename = "adminOnline", alias = "broadcasterOnline")]
    pub broadcaster_online: bool,

    #[serde(default = "default_volume")]
    pub volume: f32,

    #[serde(default)]
    pub muted: bool,

    /// None = unlimited
    #[serde(default)]
    pub max_bitrate_kbps: Option<u32>,
}

impl Default for BroadcastEpoch {
    fn default() -> Self {
        Self {
            status: EpochStatus::Idle,
            session_id: String::new(),
            broadcaster_online: false,
            volume: 1.0,
            muted: false,
            max_bitrate_kbps: None,
        }
    }
}

impl BroadcastEpoch {
    /// Session id of the current epoch, if the record describes a live one
    ///
    /// A record claiming `live` without a session id is treated as idle.
    pub fn live_session(&self) -> Option<&str> {
        match self.status {
            EpochStatus::Live if !self.session_id.is_empty() => Some(&self.session_id),
            _ => None,
        }
    }
}

/// Subscription to `/broadcast` yielding decoded records
///
/// Malformed records are reported as absent.
pub struct EpochWatch {
    inner: ValueWatch,
}

impl EpochWatch {
    pub async fn next(&mut self) -> Option<Option<BroadcastEpoch>> {
        let value = self.inner.next().await?;
        Some(value.and_then(|v| match decode(path::BROADCAST, v) {
            Ok(epoch) => Some(epoch),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed broadcast record");
                None
            }
        }))
    }
}

/// Reads and writes the broadcast epoch record
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn Store>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Read the current record
    pub async fn read(&self) -> Result<Option<BroadcastEpoch>, StoreError> {
        match self.store.get(path::BROADCAST).await? {
            Some(value) => Ok(Some(decode(path::BROADCAST, value)?)),
            None => Ok(None),
        }
    }

    /// Open a new epoch
    pub async fn go_live(
        &self,
        session_id: &SessionId,
        volume: f32,
        muted: bool,
        max_bitrate_kbps: Option<u32>,
    ) -> Result<(), StoreError> {
        self.store
            .update(
                path::BROADCAST,
                fields(json!({
                    "status": EpochStatus::Live,
                    "sessionId": session_id.as_str(),
                    "adminOnline": true,
                    "volume": volume,
                    "muted": muted,
                    "maxBitrateKbps": max_bitrate_kbps,
                })),
            )
            .await
    }

    /// Close the current epoch
    ///
    /// The bitrate cap is left in place so the next epoch inherits it.
    pub async fn go_idle(&self) -> Result<(), StoreError> {
        self.store
            .update(
                path::BROADCAST,
                fields(json!({
                    "status": EpochStatus::Idle,
                    "sessionId": "",
                    "adminOnline": false,
                    "muted": false,
                    "volume": 1.0,
                })),
            )
            .await
    }

    pub async fn set_volume(&self, volume: f32) -> Result<(), StoreError> {
        self.store
            .update(path::BROADCAST, fields(json!({ "volume": volume })))
            .await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), StoreError> {
        self.store
            .update(path::BROADCAST, fields(json!({ "muted": muted })))
            .await
    }

    pub async fn set_max_bitrate(&self, kbps: Option<u32>) -> Result<(), StoreError> {
        self.store
            .update(path::BROADCAST, fields(json!({ "maxBitrateKbps": kbps })))
            .await
    }

    /// Subscribe to epoch changes
    pub async fn watch(&self) -> Result<EpochWatch, StoreError> {
        Ok(EpochWatch {
            inner: self.store.watch_value(path::BROADCAST).await?,
        })
    }
}
