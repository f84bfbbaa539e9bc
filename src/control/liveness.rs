//! Active-listener derivation
//!
//! "Active" is observational only: a listener that opted in and wrote its
//! record recently. It is never used to decide whether to negotiate.

use std::time::Duration;

use crate::registry::{ListenerRecord, ListenerRegistry, NegotiationState};
use crate::store::StoreError;

/// Whether a listener counts as active at `now_ms`
pub fn is_active(record: &ListenerRecord, now_ms: u64, window: Duration) -> bool {
    record.audio_enabled && now_ms.saturating_sub(record.updated_at) < window.as_millis() as u64
}

/// Listener counts for a dashboard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerOverview {
    /// Records present
    pub total: usize,
    /// Listeners that opted in to audio
    pub audio_enabled: usize,
    /// Opted in and seen within the liveness window
    pub active: usize,
    /// Records in the `connected` state
    pub connected: usize,
    /// Ids of the active listeners
    pub active_ids: Vec<String>,
}

/// Summarise a set of listener records
pub fn overview(records: &[ListenerRecord], now_ms: u64, window: Duration) -> ListenerOverview {
    let mut summary = ListenerOverview {
        total: records.len(),
        ..Default::default()
    };

    for record in records {
        if record.audio_enabled {
            summary.audio_enabled += 1;
        }
        if record.negotiation_state == NegotiationState::Connected {
            summary.connected += 1;
        }
        if is_active(record, now_ms, window) {
            summary.active += 1;
            summary.active_ids.push(record.id.clone());
        }
    }

    summary
}

/// Read the listener registry and summarise it
pub async fn read_overview(
    registry: &ListenerRegistry,
    now_ms: u64,
    window: Duration,
) -> Result<ListenerOverview, StoreError> {
    let records = registry.list().await?;
    Ok(overview(&records, now_ms, window))
}
