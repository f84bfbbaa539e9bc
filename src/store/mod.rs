//! Shared key-path store contract
//!
//! The coordinators never talk to each other directly: every offer, answer,
//! candidate and state change goes through a store of JSON values addressed
//! by slash-separated paths. The store offers single-path operations and two
//! kinds of subscription, but no multi-path transactions.
//!
//! ```text
//!   /broadcast                      BroadcastEpoch
//!   /listeners/{id}                 ListenerRecord
//!   /offers/{id}                    OfferEnvelope
//!   /candidates/listeners/{id}/*    broadcaster -> listener candidates
//!   /candidates/admin/{id}/*        listener -> broadcaster candidates
//! ```
//!
//! Subscriptions are channel receivers. Dropping one unsubscribes; events
//! already buffered in it are discarded with it.

pub mod error;
pub mod memory;
pub mod path;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

pub use error::StoreError;
pub use memory::MemoryStore;

/// A child that appeared under a watched path
#[derive(Debug, Clone, PartialEq)]
pub struct ChildAdded {
    /// Key of the new child
    pub key: String,
    /// Value of the child at the time it was observed
    pub value: Value,
}

/// Subscription to the value at one path
///
/// Yields `None` when the path holds no value.
#[derive(Debug)]
pub struct ValueWatch {
    rx: mpsc::UnboundedReceiver<Option<Value>>,
}

impl ValueWatch {
    /// Create a watch and the sender a store implementation feeds it with
    pub fn channel() -> (mpsc::UnboundedSender<Option<Value>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Wait for the next observed value
    ///
    /// Returns `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<Option<Value>> {
        self.rx.recv().await
    }
}

/// Subscription to children added under one path
#[derive(Debug)]
pub struct ChildWatch {
    rx: mpsc::UnboundedReceiver<ChildAdded>,
}

impl ChildWatch {
    /// Create a watch and the sender a store implementation feeds it with
    pub fn channel() -> (mpsc::UnboundedSender<ChildAdded>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Wait for the next added child
    pub async fn next(&mut self) -> Option<ChildAdded> {
        self.rx.recv().await
    }
}

/// Key-path pub/sub store
///
/// Writing `null` is equivalent to deleting. `update` merges the given
/// fields (keys may be nested relative paths such as `"a/b"`) into the value
/// at `path` without touching its other fields.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Read the value at a path
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the value at a path
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Merge fields into the value at a path
    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError>;

    /// Recursively delete a path (the root path wipes the whole store)
    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Append a child under a path with a store-generated key, returned
    ///
    /// Generated keys sort in append order.
    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError>;

    /// Subscribe to the value at a path
    ///
    /// The current value is delivered first, then every change.
    async fn watch_value(&self, path: &str) -> Result<ValueWatch, StoreError>;

    /// Subscribe to children added under a path
    ///
    /// Every existing child is delivered first, then each new one once.
    async fn watch_children(&self, path: &str) -> Result<ChildWatch, StoreError>;
}

/// Convert a JSON object literal into the field map `update` expects
///
/// Non-object values produce an empty map.
pub fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
