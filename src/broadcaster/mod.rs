//! Broadcaster coordinator
//!
//! Owns the broadcast epoch and one negotiation slot per listener.
//!
//! ```text
//!  start() ──► capture ──► /broadcast live(S) ──► watch /listeners
//!                                                     │
//!                     record diverges from S ◄────────┘
//!                                │
//!                                ▼
//!                  negotiate(id): replace slot, offer, await answer
//!
//!  stop()  ──► cancel epoch ──► close every slot ──► /broadcast idle
//!              ──► clear mailbox ──► reset listener records
//! ```
//!
//! Lock order is `state` before `peers`. Negotiation tasks only take
//! `peers`, so `stop()` can hold `state` while it joins them. Neither lock
//! is held across a transport call by the listener watch or by a
//! negotiation, so one slow session never stalls the other listeners.

mod arena;
mod negotiation;

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SignalingConfig;
use crate::control::{clamp_bitrate_kbps, clamp_volume};
use crate::error::Result;
use crate::media::{MediaError, MediaPipeline, MediaTrack};
use crate::peer::PeerTransport;
use crate::registry::{
    best_effort, ListenerId, ListenerRecord, ListenerRegistry, Mailbox, SessionId, SessionRegistry,
};
use crate::store::{path, ChildWatch, Store, ValueWatch};
use crate::time::MonotonicClock;

use arena::{PeerArena, Trigger};
use negotiation::Negotiation;

/// Output controls that outlive an epoch
#[derive(Debug, Clone, Copy)]
struct Controls {
    volume: f32,
    muted: bool,
    max_bitrate_kbps: Option<u32>,
}

impl Controls {
    fn gain(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.volume
        }
    }
}

/// The epoch currently on air
struct LiveEpoch {
    session_id: SessionId,
    track: MediaTrack,
    cancel: CancellationToken,
    watcher: JoinHandle<()>,
}

struct BroadcastState {
    live: Option<LiveEpoch>,
    controls: Controls,
}

pub(crate) struct Shared {
    store: Arc<dyn Store>,
    epochs: SessionRegistry,
    listeners: ListenerRegistry,
    mailbox: Mailbox,
    transport: Arc<dyn PeerTransport>,
    media: Arc<dyn MediaPipeline>,
    config: SignalingConfig,
    clock: MonotonicClock,
    state: Mutex<BroadcastState>,
    peers: Mutex<PeerArena>,
}

/// The single broadcaster
///
/// Cheap to clone; every clone drives the same epoch.
#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

impl Broadcaster {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn PeerTransport>,
        media: Arc<dyn MediaPipeline>,
        config: SignalingConfig,
    ) -> Self {
        let controls = Controls {
            volume: config.initial_volume,
            muted: false,
            max_bitrate_kbps: config.initial_max_bitrate_kbps,
        };

        Self {
            shared: Arc::new(Shared {
                epochs: SessionRegistry::new(Arc::clone(&store)),
                listeners: ListenerRegistry::new(Arc::clone(&store)),
                mailbox: Mailbox::new(Arc::clone(&store)),
                store,
                transport,
                media,
                clock: MonotonicClock::new(),
                state: Mutex::new(BroadcastState {
                    live: None,
                    controls,
                }),
                peers: Mutex::new(PeerArena::new(controls.max_bitrate_kbps)),
                config,
            }),
        }
    }

    /// Go on air with a fresh epoch
    ///
    /// Does nothing if already live. On failure nothing is left running
    /// and capture is released.
    pub async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        if let Some(live) = &state.live {
            tracing::debug!(session_id = %live.session_id, "Already live");
            return Ok(());
        }

        shared.media.start_capture().await?;
        let Some(track) = shared.media.output_track() else {
            shared.media.stop_capture().await;
            return Err(MediaError::NoOutputTrack.into());
        };

        let controls = state.controls;
        shared.media.set_gain(controls.gain());

        let session_id = SessionId::generate();
        if let Err(e) = shared
            .epochs
            .go_live(
                &session_id,
                controls.volume,
                controls.muted,
                controls.max_bitrate_kbps,
            )
            .await
        {
            shared.media.stop_capture().await;
            return Err(e.into());
        }

        let watches = async {
            let added = shared.listeners.watch_added().await?;
            let snapshots = shared.listeners.watch_all().await?;
            Ok::<_, crate::store::StoreError>((added, snapshots))
        };
        let (added, snapshots) = match watches.await {
            Ok(watches) => watches,
            Err(e) => {
                best_effort("reset broadcast", shared.epochs.go_idle().await);
                shared.media.stop_capture().await;
                return Err(e.into());
            }
        };

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(watch_listeners(
            Arc::clone(shared),
            session_id.clone(),
            cancel.clone(),
            added,
            snapshots,
        ));

        tracing::info!(session_id = %session_id, track = %track.id, "Broadcast started");

        state.live = Some(LiveEpoch {
            session_id,
            track,
            cancel,
            watcher,
        });
        Ok(())
    }

    /// Go off air and converge the store to idle
    ///
    /// Safe to call when not live; the store is converged regardless.
    pub async fn stop(&self) {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        let live = state.live.take();

        if let Some(live) = &live {
            live.cancel.cancel();
            // The watcher may be waiting on `state`, which we hold. It only
            // awaits lock acquisitions and hands replaced slots to their own
            // retirement tasks, so aborting it cannot orphan a session.
            live.watcher.abort();
        }
        let was_live = match live {
            Some(live) => {
                let _ = live.watcher.await;
                Some(live.session_id)
            }
            None => None,
        };

        let slots = shared.peers.lock().await.drain();
        let closed = slots.len();
        for slot in slots {
            slot.shutdown().await;
        }

        if was_live.is_some() {
            shared.media.stop_capture().await;
        }

        best_effort("reset broadcast", shared.epochs.go_idle().await);
        shared.mailbox.clear_all().await;
        let reset = best_effort(
            "reset listeners",
            shared.listeners.reset_all(shared.clock.stamp()).await,
        );

        match was_live {
            Some(session_id) => tracing::info!(
                session_id = %session_id,
                sessions_closed = closed,
                listeners_reset = reset.unwrap_or(0),
                "Broadcast stopped"
            ),
            None => tracing::debug!(
                listeners_reset = reset.unwrap_or(0),
                "Store reset while idle"
            ),
        }
    }

    /// Cap the outgoing bitrate of every session, current and future
    ///
    /// The request is normalised first (see [`clamp_bitrate_kbps`]); the
    /// applied cap is returned. `None` or a non-positive value removes it.
    pub async fn set_bitrate_cap(&self, kbps: Option<f64>) -> Option<u32> {
        let shared = &self.shared;
        let kbps = clamp_bitrate_kbps(kbps);

        let mut state = shared.state.lock().await;
        state.controls.max_bitrate_kbps = kbps;
        best_effort("persist bitrate cap", shared.epochs.set_max_bitrate(kbps).await);

        let bps = kbps.map(|kbps| kbps * 1000);
        let sessions = {
            let mut arena = shared.peers.lock().await;
            arena.set_max_bitrate_bps(bps);
            arena.sessions()
        };
        drop(state);

        for (listener, session) in sessions {
            if let Err(e) = session.set_max_bitrate(bps).await {
                tracing::warn!(listener = %listener, error = %e, "Failed to apply bitrate cap");
            }
        }

        tracing::info!(max_bitrate_kbps = ?kbps, "Bitrate cap updated");
        kbps
    }

    /// Set the outgoing gain; persisted even while idle
    pub async fn set_volume(&self, volume: f32) {
        let volume = clamp_volume(volume);
        let mut state = self.shared.state.lock().await;
        state.controls.volume = volume;
        self.shared.media.set_gain(state.controls.gain());
        best_effort("persist volume", self.shared.epochs.set_volume(volume).await);
        tracing::debug!(volume, "Volume updated");
    }

    /// Mute the outgoing audio without renegotiating
    pub async fn pause(&self) {
        self.set_muted(true).await;
    }

    /// Undo [`pause`](Self::pause)
    pub async fn resume(&self) {
        self.set_muted(false).await;
    }

    /// Stop if live, then wipe the entire store
    pub async fn hard_reset(&self) {
        if self.is_live().await {
            self.stop().await;
        }
        best_effort("wipe store", self.shared.store.remove(path::ROOT).await);
        tracing::warn!("Store wiped");
    }

    pub async fn is_live(&self) -> bool {
        self.shared.state.lock().await.live.is_some()
    }

    /// Session id of the epoch on air
    pub async fn session_id(&self) -> Option<SessionId> {
        let state = self.shared.state.lock().await;
        state.live.as_ref().map(|live| live.session_id.clone())
    }

    /// Number of listener sessions currently open
    pub async fn open_sessions(&self) -> usize {
        self.shared.peers.lock().await.open_sessions()
    }

    /// Current volume, mute flag and bitrate cap
    pub async fn controls(&self) -> (f32, bool, Option<u32>) {
        let controls = self.shared.state.lock().await.controls;
        (controls.volume, controls.muted, controls.max_bitrate_kbps)
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.shared.config
    }

    async fn set_muted(&self, muted: bool) {
        let mut state = self.shared.state.lock().await;
        state.controls.muted = muted;
        self.shared.media.set_gain(state.controls.gain());
        best_effort("persist mute", self.shared.epochs.set_muted(muted).await);
        tracing::debug!(muted, "Mute updated");
    }
}

/// Watch `/listeners` for one epoch and negotiate wherever needed
async fn watch_listeners(
    shared: Arc<Shared>,
    session_id: SessionId,
    cancel: CancellationToken,
    mut added: ChildWatch,
    mut snapshots: ValueWatch,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            child = added.next() => match child {
                Some(child) => match ListenerRecord::decode(&child.key, child.value) {
                    Ok(record) => shared.consider(&record, &session_id).await,
                    Err(e) => {
                        tracing::debug!(listener = %child.key, error = %e, "Skipping malformed listener record");
                    }
                },
                None => break,
            },
            snapshot = snapshots.next() => match snapshot {
                Some(snapshot) => {
                    for record in ListenerRecord::decode_all(snapshot) {
                        shared.consider(&record, &session_id).await;
                    }
                }
                None => break,
            },
        }
    }

    tracing::debug!(session_id = %session_id, "Listener watch ended");
}

impl Shared {
    async fn consider(self: &Arc<Self>, record: &ListenerRecord, session_id: &SessionId) {
        let wanted = self.peers.lock().await.wants_negotiation(record, session_id);
        if wanted {
            self.negotiate(&record.id, Trigger::from(record)).await;
        }
    }

    /// Replace a listener's slot with a fresh negotiation in the live epoch
    async fn negotiate(self: &Arc<Self>, id: &str, trigger: Trigger) {
        let Some((session_id, track, epoch_cancel)) = self.live_epoch().await else {
            return;
        };

        let mut arena = self.peers.lock().await;
        // stop() cancels before it drains, so this also keeps slots from
        // leaking into the next epoch
        if epoch_cancel.is_cancelled() {
            return;
        }
        let cancel = epoch_cancel.child_token();
        let (generation, retired) = arena.begin(id, trigger, cancel.clone());

        tracing::info!(
            listener = %id,
            session_id = %session_id,
            generation,
            "Negotiating"
        );

        let task = tokio::spawn(negotiation::run(
            Arc::clone(self),
            Negotiation {
                listener: id.to_string(),
                generation,
                session_id,
                track,
                cancel,
                retired,
            },
        ));
        arena.attach_task(id, generation, task);
    }

    /// Renegotiate after the reconnect delay unless the slot moved on
    fn schedule_retry(self: &Arc<Self>, id: ListenerId, generation: u64) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(shared.config.reconnect_delay).await;

            let trigger = {
                let arena = shared.peers.lock().await;
                if !arena.is_current(&id, generation) {
                    return;
                }
                arena.trigger(&id)
            };
            shared.negotiate(&id, trigger).await;
        });
    }

    async fn live_epoch(&self) -> Option<(SessionId, MediaTrack, CancellationToken)> {
        let state = self.state.lock().await;
        let live = state.live.as_ref()?;
        if live.cancel.is_cancelled() {
            return None;
        }
        Some((live.session_id.clone(), live.track.clone(), live.cancel.clone()))
    }
}
