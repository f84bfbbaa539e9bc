//! Typed views over the shared store
//!
//! Three registries partition the store by owner:
//!
//! ```text
//!                      Arc<dyn Store>
//!          ┌──────────────────┼───────────────────┐
//!          ▼                  ▼                   ▼
//!   SessionRegistry    ListenerRegistry        Mailbox
//!    /broadcast         /listeners/{id}     /offers/{id}
//!   (broadcaster)      (listener creates,   /candidates/...
//!                       both write)         (per-direction owner)
//! ```
//!
//! Writes are single-path merges so that a partially applied multi-field
//! update never leaves a record worse than stale; the next negotiation or a
//! reset converges it.

pub mod epoch;
pub mod listener;
pub mod mailbox;

pub use epoch::{BroadcastEpoch, EpochStatus, SessionId, SessionRegistry};
pub use listener::{ListenerId, ListenerRecord, ListenerRegistry, NegotiationState};
pub use mailbox::{CandidateEnvelope, Mailbox, OfferEnvelope};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::store::StoreError;

/// Decode a stored value into a record type
pub(crate) fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|source| StoreError::Malformed {
        path: path.to_string(),
        source,
    })
}

/// Log and swallow a failed best-effort store operation
pub(crate) fn best_effort<T>(what: &'static str, result: Result<T, StoreError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(operation = what, error = %e, "Best-effort store write failed");
            None
        }
    }
}
