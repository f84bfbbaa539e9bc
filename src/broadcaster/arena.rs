//! Per-listener negotiation slots
//!
//! Every listener the broadcaster negotiates with owns exactly one slot.
//! Renegotiating replaces the slot as a whole. The replaced slot is retired
//! on a task of its own (cancel, join, close) and the new negotiation waits
//! for that retirement before it creates a session, so the arena lock is
//! never held across transport calls. A negotiation task only touches its
//! slot while its generation is still the slot's generation, which is
//! checked under the arena lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::peer::PeerSession;
use crate::registry::{ListenerId, ListenerRecord, SessionId};

/// Progress of a slot's negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotPhase {
    /// Spawned; the connecting-write has not landed yet
    Preparing,
    /// The listener record was claimed for this negotiation
    Claimed,
    /// The listener's answer was applied
    Connected,
}

/// The listener record version that caused a negotiation
///
/// Snapshots that are not newer than this were emitted before the
/// negotiation claimed the record and must not trigger another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Trigger {
    pub updated_at: u64,
    pub joined_at: u64,
}

impl From<&ListenerRecord> for Trigger {
    fn from(record: &ListenerRecord) -> Self {
        Self {
            updated_at: record.updated_at,
            joined_at: record.joined_at,
        }
    }
}

pub(crate) struct PeerSlot {
    generation: u64,
    phase: SlotPhase,
    trigger: Trigger,
    cancel: CancellationToken,
    session: Option<Arc<dyn PeerSession>>,
    task: Option<JoinHandle<()>>,
    /// Cancelled once the slot this one replaced is fully shut down
    retired: Option<CancellationToken>,
    /// Cancelled once a session creation for this slot has settled
    opening: Option<CancellationToken>,
}

impl PeerSlot {
    /// Cancel the negotiation, wait for its task to finish, close its session
    ///
    /// Returns only after every slot this one replaced is shut down too.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(retired) = self.retired.take() {
            retired.cancelled().await;
        }
        // A creation still in flight finds the slot gone and closes its session
        if let Some(opening) = self.opening.take() {
            opening.cancelled().await;
        }
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    /// Shut the slot down on a task of its own
    ///
    /// The returned token is cancelled when the shutdown completes.
    fn retire(self) -> CancellationToken {
        let done = CancellationToken::new();
        let guard = done.clone().drop_guard();
        tokio::spawn(async move {
            let _guard = guard;
            self.shutdown().await;
        });
        done
    }
}

/// Map of listener id to negotiation slot
#[derive(Default)]
pub(crate) struct PeerArena {
    slots: HashMap<ListenerId, PeerSlot>,
    next_generation: u64,
    max_bitrate_bps: Option<u32>,
}

impl PeerArena {
    pub fn new(max_bitrate_kbps: Option<u32>) -> Self {
        Self {
            max_bitrate_bps: max_bitrate_kbps.map(|kbps| kbps * 1000),
            ..Default::default()
        }
    }

    /// Decide whether a listener record calls for a (new) negotiation
    ///
    /// First sight of an opted-in listener always does. After that, only a
    /// record that diverges from the epoch and was written after the
    /// negotiation's trigger does, and never while the slot is still
    /// preparing.
    pub fn wants_negotiation(&self, record: &ListenerRecord, session_id: &SessionId) -> bool {
        if !record.audio_enabled {
            return false;
        }
        let Some(slot) = self.slots.get(&record.id) else {
            return true;
        };
        if record.is_bound_to(session_id) || slot.phase == SlotPhase::Preparing {
            return false;
        }
        record.updated_at > slot.trigger.updated_at || record.joined_at != slot.trigger.joined_at
    }

    /// Open a fresh slot for a listener, retiring the slot it replaces
    ///
    /// Returns the new generation and, if a slot was replaced, a token that
    /// is cancelled once that slot is shut down. The new negotiation must
    /// not create a session before then.
    pub fn begin(
        &mut self,
        id: &str,
        trigger: Trigger,
        cancel: CancellationToken,
    ) -> (u64, Option<CancellationToken>) {
        self.next_generation += 1;
        let generation = self.next_generation;

        let retired = self.slots.remove(id).map(PeerSlot::retire);
        self.slots.insert(
            id.to_string(),
            PeerSlot {
                generation,
                phase: SlotPhase::Preparing,
                trigger,
                cancel,
                session: None,
                task: None,
                retired: retired.clone(),
                opening: None,
            },
        );
        (generation, retired)
    }

    /// Hand the negotiation task to its slot
    pub fn attach_task(&mut self, id: &str, generation: u64, task: JoinHandle<()>) {
        match self.current_mut(id, generation) {
            Some(slot) => slot.task = Some(task),
            None => task.abort(),
        }
    }

    pub fn is_current(&self, id: &str, generation: u64) -> bool {
        self.slots
            .get(id)
            .is_some_and(|slot| slot.generation == generation)
    }

    /// Trigger of the listener's current slot
    pub fn trigger(&self, id: &str) -> Trigger {
        self.slots.get(id).map(|slot| slot.trigger).unwrap_or_default()
    }

    /// Advance a slot's phase; false if the generation is stale
    pub fn set_phase(&mut self, id: &str, generation: u64, phase: SlotPhase) -> bool {
        match self.current_mut(id, generation) {
            Some(slot) => {
                slot.phase = phase;
                true
            }
            None => false,
        }
    }

    /// Register a session creation for a slot
    ///
    /// The creation holds the returned guard until it has either installed
    /// or closed its session; None if the generation is stale.
    pub fn track_opening(&mut self, id: &str, generation: u64) -> Option<DropGuard> {
        let slot = self.current_mut(id, generation)?;
        let opening = CancellationToken::new();
        slot.opening = Some(opening.clone());
        Some(opening.drop_guard())
    }

    /// Record the session a negotiation created; false if the generation is
    /// stale, in which case the caller still owns the session and must close it
    pub fn install_session(
        &mut self,
        id: &str,
        generation: u64,
        session: Arc<dyn PeerSession>,
    ) -> bool {
        match self.current_mut(id, generation) {
            Some(slot) => {
                slot.session = Some(session);
                true
            }
            None => false,
        }
    }

    /// Bitrate cap new sessions start with
    pub fn max_bitrate_bps(&self) -> Option<u32> {
        self.max_bitrate_bps
    }

    pub fn set_max_bitrate_bps(&mut self, bps: Option<u32>) {
        self.max_bitrate_bps = bps;
    }

    /// Every live session, with its listener id
    pub fn sessions(&self) -> Vec<(ListenerId, Arc<dyn PeerSession>)> {
        self.slots
            .iter()
            .filter_map(|(id, slot)| slot.session.clone().map(|s| (id.clone(), s)))
            .collect()
    }

    /// Number of slots holding an open session
    pub fn open_sessions(&self) -> usize {
        self.slots.values().filter(|s| s.session.is_some()).count()
    }

    /// Remove every slot; generations keep counting so stale tasks stay stale
    pub fn drain(&mut self) -> Vec<PeerSlot> {
        self.slots.drain().map(|(_, slot)| slot).collect()
    }

    fn current_mut(&mut self, id: &str, generation: u64) -> Option<&mut PeerSlot> {
        self.slots
            .get_mut(id)
            .filter(|slot| slot.generation == generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, session: &str, updated_at: u64) -> ListenerRecord {
        ListenerRecord {
            id: id.into(),
            audio_enabled: true,
            session_id: session.into(),
            updated_at,
            joined_at: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_sight_negotiates() {
        let arena = PeerArena::new(None);
        let session = SessionId::from("s1");

        assert!(arena.wants_negotiation(&record("a", "", 10), &session));

        let mut muted = record("a", "", 10);
        muted.audio_enabled = false;
        assert!(!arena.wants_negotiation(&muted, &session));
    }

    #[test]
    fn test_stale_snapshot_is_ignored() {
        let mut arena = PeerArena::new(None);
        let session = SessionId::from("s1");
        let trigger_record = record("a", "", 10);

        let (generation, retired) =
            arena.begin("a", Trigger::from(&trigger_record), CancellationToken::new());
        assert!(retired.is_none());

        // Still preparing: every divergence is suppressed
        assert!(!arena.wants_negotiation(&record("a", "", 11), &session));

        arena.set_phase("a", generation, SlotPhase::Claimed);

        // The snapshot that triggered us, delivered again
        assert!(!arena.wants_negotiation(&trigger_record, &session));
        // Bound to the epoch
        assert!(!arena.wants_negotiation(&record("a", "s1", 50), &session));
        // The listener reset itself later
        assert!(arena.wants_negotiation(&record("a", "", 11), &session));
    }

    #[test]
    fn test_rejoined_listener_negotiates() {
        let mut arena = PeerArena::new(None);
        let session = SessionId::from("s1");
        let (generation, _) = arena.begin("a", Trigger::from(&record("a", "", 10)), CancellationToken::new());
        arena.set_phase("a", generation, SlotPhase::Connected);

        let mut rejoined = record("a", "", 5);
        rejoined.joined_at = 2;
        assert!(arena.wants_negotiation(&rejoined, &session));
    }

    #[tokio::test]
    async fn test_generations_fence_stale_tasks() {
        let mut arena = PeerArena::new(Some(64));
        assert_eq!(arena.max_bitrate_bps(), Some(64_000));

        let first_cancel = CancellationToken::new();
        let (first, _) = arena.begin("a", Trigger::default(), first_cancel.clone());
        let (second, retired) = arena.begin("a", Trigger::default(), CancellationToken::new());

        // The replaced slot is cancelled and its retirement completes
        retired.unwrap().cancelled().await;
        assert!(first_cancel.is_cancelled());
        assert!(second > first);
        assert!(!arena.is_current("a", first));
        assert!(!arena.set_phase("a", first, SlotPhase::Claimed));
        assert!(arena.is_current("a", second));

        let drained = arena.drain();
        assert_eq!(drained.len(), 1);

        let (third, _) = arena.begin("a", Trigger::default(), CancellationToken::new());
        assert!(third > second);
    }
}
