//! The listener's event loop
//!
//! Everything that changes listener state runs on one task, fed through an
//! mpsc channel:
//!
//! ```text
//!   /broadcast watch ─────────┐
//!   /offers/{id} watch ───────┤  (tagged with
//!   /candidates/listeners ────┤   generation)
//!   transport events ─────────┤
//!   reconnect timer ──────────┤
//!   heartbeat ────────────────┤
//!                             ▼
//!                           Actor ──► transport / media / store writes
//! ```
//!
//! Every `connect()` bumps the connection generation; inputs tagged with an
//! older generation are dropped, including ones already queued when their
//! forwarder was aborted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::state::{ListenerStatus, OfferDecision, OfferGuard};
use super::Context;
use crate::peer::{IceCandidate, PeerConfig, PeerError, PeerEvent, PeerSession, SessionDescription};
use crate::registry::epoch::EpochWatch;
use crate::registry::{best_effort, BroadcastEpoch, CandidateEnvelope, OfferEnvelope, SessionId};
use crate::store::{ChildWatch, ValueWatch};

pub(crate) enum Input {
    Epoch(Option<BroadcastEpoch>),
    Offer {
        generation: u64,
        offer: Option<OfferEnvelope>,
    },
    RemoteCandidate {
        generation: u64,
        envelope: CandidateEnvelope,
    },
    Peer {
        generation: u64,
        event: PeerEvent,
    },
    ReconnectDue {
        generation: u64,
    },
    Heartbeat,
    Shutdown(Option<oneshot::Sender<()>>),
}

/// One transport session and the tasks feeding the actor on its behalf
struct Connection {
    generation: u64,
    session: Arc<dyn PeerSession>,
    forwarders: Vec<JoinHandle<()>>,
    /// Remote candidates that arrived before the offer was applied
    pending: Vec<IceCandidate>,
    answered: bool,
}

impl Connection {
    async fn close(self) {
        for task in &self.forwarders {
            task.abort();
        }
        self.session.close().await;
    }
}

pub(crate) struct Actor {
    ctx: Arc<Context>,
    tx: mpsc::UnboundedSender<Input>,
    status: watch::Sender<ListenerStatus>,
    epoch: Option<SessionId>,
    guard: OfferGuard,
    generation: u64,
    connection: Option<Connection>,
    reconnect: Option<(u64, JoinHandle<()>)>,
    background: Vec<JoinHandle<()>>,
}

impl Actor {
    /// Spawn the actor for an audio-enabled listener
    pub fn spawn(
        ctx: Arc<Context>,
        status: watch::Sender<ListenerStatus>,
        epochs: EpochWatch,
    ) -> (mpsc::UnboundedSender<Input>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut background = vec![tokio::spawn(forward_epochs(tx.clone(), epochs))];
        if let Some(interval) = ctx.config.heartbeat_interval {
            background.push(tokio::spawn(heartbeat(tx.clone(), interval)));
        }

        let actor = Actor {
            ctx,
            tx: tx.clone(),
            status,
            epoch: None,
            guard: OfferGuard::default(),
            generation: 0,
            connection: None,
            reconnect: None,
            background,
        };
        let task = tokio::spawn(actor.run(rx));
        (tx, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = rx.recv().await {
            match input {
                Input::Epoch(epoch) => self.on_epoch(epoch).await,
                Input::Offer { generation, offer } => {
                    if self.is_current(generation) {
                        if let Some(offer) = offer {
                            self.on_offer(offer).await;
                        }
                    }
                }
                Input::RemoteCandidate {
                    generation,
                    envelope,
                } => {
                    if self.is_current(generation) {
                        self.on_remote_candidate(envelope).await;
                    }
                }
                Input::Peer { generation, event } => {
                    if self.is_current(generation) {
                        self.on_peer_event(generation, event).await;
                    }
                }
                Input::ReconnectDue { generation } => self.on_reconnect_due(generation).await,
                Input::Heartbeat => {
                    let touched = best_effort(
                        "heartbeat",
                        self.ctx.listeners.touch(&self.ctx.id, self.ctx.clock.stamp()).await,
                    );
                    if touched == Some(false) {
                        self.restore_record().await;
                    }
                }
                Input::Shutdown(ack) => {
                    self.shutdown().await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    return;
                }
            }
        }

        self.shutdown().await;
    }

    fn is_current(&self, generation: u64) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| c.generation == generation)
    }

    async fn on_epoch(&mut self, epoch: Option<BroadcastEpoch>) {
        let live = epoch
            .as_ref()
            .and_then(BroadcastEpoch::live_session)
            .map(SessionId::from);

        // A wiped store takes our record with it
        if epoch.is_none() {
            self.ensure_record().await;
        }

        match live {
            None => {
                if self.epoch.is_none() && self.connection.is_none() {
                    self.status.send_replace(ListenerStatus::Waiting);
                    return;
                }
                self.teardown().await;
                self.epoch = None;
                self.guard.clear();
                self.ctx.media.detach_remote_track().await;
                self.status.send_replace(ListenerStatus::Waiting);
                tracing::info!(listener = %self.ctx.id, "Broadcast ended");
            }
            Some(session_id) if self.epoch.as_ref() == Some(&session_id) => {}
            Some(session_id) => {
                tracing::info!(
                    listener = %self.ctx.id,
                    session_id = %session_id,
                    "Joining broadcast"
                );
                self.ensure_record().await;
                self.guard.adopt(session_id.clone());
                self.epoch = Some(session_id);
                self.connect().await;
            }
        }
    }

    /// Replace the transport session and resubscribe the mailbox
    async fn connect(&mut self) {
        self.teardown().await;
        self.generation += 1;
        let generation = self.generation;
        self.guard.new_session();
        self.status.send_replace(ListenerStatus::Connecting);

        let id = self.ctx.id.clone();
        self.ctx.mailbox.clear_to_broadcaster(&id).await;

        let config = PeerConfig {
            label: id.clone(),
            ice_servers: self.ctx.config.ice_servers.clone(),
            outgoing_track: None,
            max_bitrate_bps: None,
        };
        let (session, events) = match self.ctx.transport.create_session(config).await {
            Ok(created) => created,
            Err(e) => {
                tracing::warn!(listener = %id, error = %e, "Failed to create session");
                self.schedule_reconnect(generation);
                return;
            }
        };

        let mut connection = Connection {
            generation,
            session,
            forwarders: vec![tokio::spawn(forward_peer_events(
                self.tx.clone(),
                generation,
                events,
            ))],
            pending: Vec::new(),
            answered: false,
        };

        match self.ctx.mailbox.watch_to_listener(&id).await {
            Ok(watch) => connection.forwarders.push(tokio::spawn(forward_candidates(
                self.tx.clone(),
                generation,
                watch,
            ))),
            Err(e) => {
                tracing::warn!(listener = %id, error = %e, "Failed to watch candidates");
            }
        }

        let offers = self.ctx.mailbox.watch_offer(&id).await;
        match offers {
            Ok(watch) => connection.forwarders.push(tokio::spawn(forward_offers(
                self.tx.clone(),
                id.clone(),
                generation,
                watch,
            ))),
            Err(e) => {
                tracing::warn!(listener = %id, error = %e, "Failed to watch offers");
                self.connection = Some(connection);
                self.schedule_reconnect(generation);
                return;
            }
        }

        tracing::debug!(listener = %id, generation, "Session created");
        self.connection = Some(connection);
    }

    async fn on_offer(&mut self, offer: OfferEnvelope) {
        match self.guard.decide(&offer) {
            OfferDecision::Ignore => {
                tracing::debug!(
                    listener = %self.ctx.id,
                    offer_session = %offer.session_id,
                    created_at = offer.created_at,
                    "Ignoring offer"
                );
            }
            OfferDecision::Rebuild => {
                // The new offer watch redelivers this offer to the fresh session
                tracing::info!(listener = %self.ctx.id, "Broadcaster renegotiated, rebuilding session");
                self.connect().await;
            }
            OfferDecision::Apply => self.apply_offer(offer).await,
        }
    }

    async fn apply_offer(&mut self, offer: OfferEnvelope) {
        let Some(epoch) = self.epoch.clone() else {
            return;
        };
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        let generation = connection.generation;

        self.guard.consumed(offer.created_at);

        let answer = match answer_offer(connection.session.as_ref(), &offer.sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(listener = %self.ctx.id, error = %e, "Failed to answer offer");
                self.schedule_reconnect(generation);
                return;
            }
        };

        connection.answered = true;
        for candidate in connection.pending.drain(..) {
            if let Err(e) = connection.session.add_remote_candidate(candidate).await {
                tracing::debug!(listener = %self.ctx.id, error = %e, "Remote candidate rejected");
            }
        }

        let posted = self
            .ctx
            .listeners
            .post_answer(
                &self.ctx.id,
                &epoch,
                &answer.sdp,
                offer.created_at,
                self.ctx.clock.stamp(),
            )
            .await;
        match posted {
            Ok(()) => tracing::debug!(
                listener = %self.ctx.id,
                session_id = %epoch,
                offer_created_at = offer.created_at,
                "Answer posted"
            ),
            Err(e) => {
                tracing::warn!(listener = %self.ctx.id, error = %e, "Failed to post answer");
                self.schedule_reconnect(generation);
            }
        }
    }

    async fn on_remote_candidate(&mut self, envelope: CandidateEnvelope) {
        let Some(epoch) = &self.epoch else {
            return;
        };
        if *epoch != envelope.session_id {
            tracing::trace!(listener = %self.ctx.id, "Dropping candidate from another epoch");
            return;
        }
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        if !connection.answered {
            connection.pending.push(envelope.candidate);
            return;
        }
        if let Err(e) = connection.session.add_remote_candidate(envelope.candidate).await {
            tracing::debug!(listener = %self.ctx.id, error = %e, "Remote candidate rejected");
        }
    }

    async fn on_peer_event(&mut self, generation: u64, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let Some(epoch) = &self.epoch else {
                    return;
                };
                let envelope = CandidateEnvelope::new(epoch.as_str(), candidate);
                best_effort(
                    "send candidate",
                    self.ctx.mailbox.send_to_broadcaster(&self.ctx.id, &envelope).await,
                );
            }
            PeerEvent::ConnectionStateChanged(state) => {
                tracing::debug!(listener = %self.ctx.id, state = ?state, "Connection state changed");
                if state.needs_reconnect() {
                    self.schedule_reconnect(generation);
                }
            }
            PeerEvent::RemoteTrack(track) => {
                if let Err(e) = self.ctx.media.attach_remote_track(track).await {
                    tracing::warn!(listener = %self.ctx.id, error = %e, "Failed to play remote track");
                    return;
                }
                self.status.send_replace(ListenerStatus::Connected);
                tracing::info!(listener = %self.ctx.id, "Receiving broadcast");
            }
        }
    }

    /// Arm the reconnect timer unless one is already armed for this generation
    fn schedule_reconnect(&mut self, generation: u64) {
        if self.reconnect.as_ref().is_some_and(|(g, _)| *g == generation) {
            return;
        }
        if let Some((_, timer)) = self.reconnect.take() {
            timer.abort();
        }

        let delay = self.ctx.config.reconnect_delay;
        let tx = self.tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Input::ReconnectDue { generation });
        });
        self.reconnect = Some((generation, timer));

        tracing::info!(
            listener = %self.ctx.id,
            generation,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
    }

    async fn on_reconnect_due(&mut self, generation: u64) {
        if self.reconnect.as_ref().is_some_and(|(g, _)| *g == generation) {
            self.reconnect = None;
        }
        if generation != self.generation || self.epoch.is_none() {
            return;
        }

        self.connect().await;
        best_effort(
            "request renegotiation",
            self.ctx
                .listeners
                .request_renegotiation(&self.ctx.id, self.ctx.clock.stamp())
                .await,
        );
    }

    /// Restore our record unless it exists and still carries the opt-in
    async fn ensure_record(&self) {
        match self.ctx.listeners.read(&self.ctx.id).await {
            Ok(Some(record)) if record.audio_enabled && record.joined_at > 0 => {}
            Ok(_) => self.restore_record().await,
            Err(e) => {
                tracing::warn!(listener = %self.ctx.id, error = %e, "Failed to read own record");
            }
        }
    }

    /// Recreate our record and opt in again, so the next epoch offers to us
    async fn restore_record(&self) {
        let id = &self.ctx.id;
        best_effort(
            "recreate record",
            self.ctx.listeners.create(id, self.ctx.clock.stamp()).await,
        );
        best_effort(
            "re-enable audio",
            self.ctx.listeners.enable_audio(id, self.ctx.clock.stamp()).await,
        );
        tracing::info!(listener = %id, "Listener record restored");
    }

    /// Drop the current session and its subscriptions
    async fn teardown(&mut self) {
        if let Some((_, timer)) = self.reconnect.take() {
            timer.abort();
        }
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
    }

    async fn shutdown(&mut self) {
        for task in self.background.drain(..) {
            task.abort();
        }
        self.teardown().await;
        self.epoch = None;
        self.guard.clear();
        self.ctx.mailbox.clear_to_broadcaster(&self.ctx.id).await;
        self.ctx.media.detach_remote_track().await;
        self.status.send_replace(ListenerStatus::Waiting);
        tracing::info!(listener = %self.ctx.id, "Listener shut down");
    }
}

async fn answer_offer(
    session: &dyn PeerSession,
    sdp: &str,
) -> Result<SessionDescription, PeerError> {
    session
        .set_remote_description(SessionDescription::offer(sdp))
        .await?;
    let answer = session.create_answer().await?;
    session.set_local_description(answer.clone()).await?;
    Ok(answer)
}

async fn forward_epochs(tx: mpsc::UnboundedSender<Input>, mut watch: EpochWatch) {
    while let Some(epoch) = watch.next().await {
        if tx.send(Input::Epoch(epoch)).is_err() {
            break;
        }
    }
}

async fn forward_offers(
    tx: mpsc::UnboundedSender<Input>,
    id: String,
    generation: u64,
    mut watch: ValueWatch,
) {
    while let Some(value) = watch.next().await {
        let offer = OfferEnvelope::from_value(&id, value);
        if tx.send(Input::Offer { generation, offer }).is_err() {
            break;
        }
    }
}

async fn forward_candidates(
    tx: mpsc::UnboundedSender<Input>,
    generation: u64,
    mut watch: ChildWatch,
) {
    while let Some(child) = watch.next().await {
        let Some(envelope) = CandidateEnvelope::from_child(child) else {
            continue;
        };
        if tx
            .send(Input::RemoteCandidate {
                generation,
                envelope,
            })
            .is_err()
        {
            break;
        }
    }
}

async fn forward_peer_events(
    tx: mpsc::UnboundedSender<Input>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(event) = events.recv().await {
        if tx.send(Input::Peer { generation, event }).is_err() {
            break;
        }
    }
}

async fn heartbeat(tx: mpsc::UnboundedSender<Input>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if tx.send(Input::Heartbeat).is_err() {
            break;
        }
    }
}
