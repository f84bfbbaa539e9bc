//! One offer/answer exchange with one listener
//!
//! ```text
//!   clear mailbox ─► claim record ─► create session ─► offer ─► post offer
//!                                                                  │
//!         ┌────────────────────────────────────────────────────────┘
//!         ▼
//!   loop: local candidates  ─► /candidates/listeners/{id}
//!         remote candidates ◄─ /candidates/admin/{id}   (epoch-filtered)
//!         record snapshots  ─► apply answer once        (epoch + offer fenced)
//! ```
//!
//! The task lives as long as its slot: it keeps trickling candidates after
//! the answer is applied and ends only when cancelled or when the transport
//! drops the session.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::arena::SlotPhase;
use super::Shared;
use crate::error::Error;
use crate::media::MediaTrack;
use crate::peer::{
    PeerConfig, PeerError, PeerEvent, PeerSession, SessionDescription, SignalingState,
};
use crate::registry::{
    best_effort, CandidateEnvelope, ListenerId, ListenerRecord, OfferEnvelope, SessionId,
};
use crate::store::{ChildAdded, ChildWatch, ValueWatch};

/// Everything a negotiation task needs to know about its slot
pub(crate) struct Negotiation {
    pub listener: ListenerId,
    pub generation: u64,
    pub session_id: SessionId,
    pub track: MediaTrack,
    pub cancel: CancellationToken,
    /// Cancelled once the slot this negotiation replaced is shut down
    pub retired: Option<CancellationToken>,
}

/// Run a negotiation until it is cancelled, retrying it after a failure
pub(crate) async fn run(shared: Arc<Shared>, negotiation: Negotiation) {
    let result = tokio::select! {
        _ = negotiation.cancel.cancelled() => return,
        result = async {
            if let Some(retired) = &negotiation.retired {
                retired.cancelled().await;
            }
            drive(&shared, &negotiation).await
        } => result,
    };

    match result {
        Ok(()) => {
            tracing::debug!(
                listener = %negotiation.listener,
                generation = negotiation.generation,
                "Negotiation ended"
            );
        }
        Err(e) => {
            tracing::warn!(
                listener = %negotiation.listener,
                session_id = %negotiation.session_id,
                error = %e,
                "Negotiation failed, retrying"
            );
            shared.schedule_retry(negotiation.listener, negotiation.generation);
        }
    }
}

async fn drive(shared: &Arc<Shared>, n: &Negotiation) -> Result<(), Error> {
    let id = n.listener.as_str();

    shared.mailbox.clear_listener(id).await;

    best_effort(
        "mark connecting",
        shared
            .listeners
            .mark_connecting(id, &n.session_id, shared.clock.stamp())
            .await,
    );
    if !shared.peers.lock().await.set_phase(id, n.generation, SlotPhase::Claimed) {
        return Ok(());
    }

    let Some(guard) = shared.peers.lock().await.track_opening(id, n.generation) else {
        return Ok(());
    };
    let opening = tokio::spawn(open_session(
        Arc::clone(shared),
        n.listener.clone(),
        n.generation,
        n.track.clone(),
        guard,
    ));
    let (session, mut events) = match opening.await {
        Ok(Ok(Some(opened))) => opened,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e.into()),
        Err(e) => return Err(PeerError::Transport(e.to_string()).into()),
    };

    let mut remote = Some(shared.mailbox.watch_to_broadcaster(id).await?);

    let offer = session.create_offer().await?;
    session.set_local_description(offer.clone()).await?;

    let envelope = OfferEnvelope {
        session_id: n.session_id.to_string(),
        sdp: offer.sdp,
        created_at: shared.clock.stamp(),
    };
    let mut answers = Some(shared.listeners.watch_one(id).await?);
    shared.mailbox.post_offer(id, &envelope).await?;

    // Remote candidates that arrived before the answer
    let mut pending = Vec::new();
    let mut answered = false;

    tracing::debug!(
        listener = %id,
        session_id = %n.session_id,
        created_at = envelope.created_at,
        "Offer posted"
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(PeerEvent::LocalCandidate(candidate)) => {
                    let envelope = CandidateEnvelope::new(n.session_id.as_str(), candidate);
                    best_effort(
                        "send candidate",
                        shared.mailbox.send_to_listener(id, &envelope).await,
                    );
                }
                Some(PeerEvent::ConnectionStateChanged(state)) => {
                    tracing::debug!(listener = %id, state = ?state, "Connection state changed");
                }
                Some(PeerEvent::RemoteTrack(_)) => {}
                None => return Ok(()),
            },
            child = next_child(&mut remote) => match child {
                Some(child) => {
                    match CandidateEnvelope::from_child(child) {
                        Some(envelope) if !answered => pending.push(envelope),
                        Some(envelope) => add_candidate(n, session.as_ref(), envelope).await,
                        None => {}
                    }
                }
                None => remote = None,
            },
            snapshot = next_value(&mut answers) => match snapshot {
                Some(value) => {
                    if apply_answer(shared, n, session.as_ref(), envelope.created_at, value).await? {
                        answers = None;
                        answered = true;
                        for envelope in pending.drain(..) {
                            add_candidate(n, session.as_ref(), envelope).await;
                        }
                    }
                }
                None => answers = None,
            },
        }
    }
}

type Opened = (Arc<dyn PeerSession>, mpsc::UnboundedReceiver<PeerEvent>);

/// Create a session and hand it to the slot, or close it if the slot moved on
///
/// Runs on its own task: aborting the negotiation must not drop a session
/// that is neither installed nor closed. The arena lock is not held while
/// the transport works.
async fn open_session(
    shared: Arc<Shared>,
    listener: ListenerId,
    generation: u64,
    track: MediaTrack,
    _settled: DropGuard,
) -> Result<Option<Opened>, PeerError> {
    let requested_bps = shared.peers.lock().await.max_bitrate_bps();
    let config = PeerConfig {
        label: listener.clone(),
        ice_servers: shared.config.ice_servers.clone(),
        outgoing_track: Some(track),
        max_bitrate_bps: requested_bps,
    };
    let (session, events) = shared.transport.create_session(config).await?;

    let applied_bps = {
        let mut arena = shared.peers.lock().await;
        if !arena.install_session(&listener, generation, Arc::clone(&session)) {
            drop(arena);
            tracing::debug!(listener = %listener, generation, "Slot replaced, closing new session");
            session.close().await;
            return Ok(None);
        }
        arena.max_bitrate_bps()
    };

    // The cap changed while the transport was busy
    if applied_bps != requested_bps {
        session.set_max_bitrate(applied_bps).await?;
    }
    Ok(Some((session, events)))
}

/// Apply the listener's answer if the snapshot carries a valid one
///
/// Returns true once the answer is applied.
async fn apply_answer(
    shared: &Shared,
    n: &Negotiation,
    session: &dyn PeerSession,
    offered_at: u64,
    value: Option<Value>,
) -> Result<bool, Error> {
    let Some(value) = value else {
        return Ok(false);
    };
    let record = match ListenerRecord::decode(&n.listener, value) {
        Ok(record) => record,
        Err(e) => {
            tracing::debug!(listener = %n.listener, error = %e, "Ignoring malformed listener record");
            return Ok(false);
        }
    };
    let Some(answer) = record.answer.as_deref().filter(|a| !a.is_empty()) else {
        return Ok(false);
    };

    if !record.is_bound_to(&n.session_id) {
        tracing::debug!(listener = %n.listener, "Ignoring answer from another epoch");
        return Ok(false);
    }
    if record.answered_offer.is_some_and(|at| at != offered_at) {
        tracing::debug!(listener = %n.listener, "Ignoring answer to a superseded offer");
        return Ok(false);
    }
    if session.signaling_state() != SignalingState::HaveLocalOffer {
        tracing::debug!(
            listener = %n.listener,
            state = ?session.signaling_state(),
            "Not awaiting an answer"
        );
        return Ok(false);
    }

    session
        .set_remote_description(SessionDescription::answer(answer))
        .await?;

    best_effort(
        "mark connected",
        shared
            .listeners
            .mark_connected(&n.listener, &n.session_id, shared.clock.stamp())
            .await,
    );
    shared
        .peers
        .lock()
        .await
        .set_phase(&n.listener, n.generation, SlotPhase::Connected);

    tracing::info!(
        listener = %n.listener,
        session_id = %n.session_id,
        "Listener connected"
    );
    Ok(true)
}

async fn add_candidate(n: &Negotiation, session: &dyn PeerSession, envelope: CandidateEnvelope) {
    if n.session_id != envelope.session_id {
        tracing::trace!(
            listener = %n.listener,
            candidate_session = %envelope.session_id,
            "Dropping candidate from another epoch"
        );
        return;
    }
    if let Err(e) = session.add_remote_candidate(envelope.candidate).await {
        tracing::debug!(listener = %n.listener, error = %e, "Remote candidate rejected");
    }
}

async fn next_child(watch: &mut Option<ChildWatch>) -> Option<ChildAdded> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}

async fn next_value(watch: &mut Option<ValueWatch>) -> Option<Option<Value>> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}
