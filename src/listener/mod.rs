//! Listener coordinator
//!
//! One instance per listener identity. It owns at most one transport
//! session, bound to the epoch it last adopted, and publishes its progress
//! as a [`ListenerStatus`] on a watch channel.
//!
//! ```text
//!   join() ─► /listeners/{id} waiting
//!   enable_audio() ─► audioEnabled ─► watch /broadcast
//!        live(S) ─► connect() ─► answer offer(S) ─► Connected
//!        idle    ─► teardown  ─► Waiting
//! ```

mod actor;
pub mod state;

pub use state::ListenerStatus;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::SignalingConfig;
use crate::error::Result;
use crate::media::MediaPipeline;
use crate::peer::PeerTransport;
use crate::registry::{ListenerId, ListenerRegistry, Mailbox, SessionRegistry};
use crate::store::Store;
use crate::time::MonotonicClock;

use actor::{Actor, Input};

/// Collaborators shared by the coordinator and its actor
pub(crate) struct Context {
    id: ListenerId,
    epochs: SessionRegistry,
    listeners: ListenerRegistry,
    mailbox: Mailbox,
    transport: Arc<dyn PeerTransport>,
    media: Arc<dyn MediaPipeline>,
    config: SignalingConfig,
    clock: MonotonicClock,
}

struct ActorHandle {
    tx: mpsc::UnboundedSender<Input>,
    task: JoinHandle<()>,
}

/// A listener's side of the protocol
pub struct ListenerCoordinator {
    ctx: Arc<Context>,
    status_tx: watch::Sender<ListenerStatus>,
    status_rx: watch::Receiver<ListenerStatus>,
    actor: Mutex<Option<ActorHandle>>,
}

impl ListenerCoordinator {
    pub fn new(
        id: impl Into<ListenerId>,
        store: Arc<dyn Store>,
        transport: Arc<dyn PeerTransport>,
        media: Arc<dyn MediaPipeline>,
        config: SignalingConfig,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(ListenerStatus::Waiting);

        Self {
            ctx: Arc::new(Context {
                id: id.into(),
                epochs: SessionRegistry::new(Arc::clone(&store)),
                listeners: ListenerRegistry::new(Arc::clone(&store)),
                mailbox: Mailbox::new(store),
                transport,
                media,
                config,
                clock: MonotonicClock::new(),
            }),
            status_tx,
            status_rx,
            actor: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.ctx.id
    }

    /// Create this listener's record
    pub async fn join(&self) -> Result<()> {
        self.ctx
            .listeners
            .create(&self.ctx.id, self.ctx.clock.stamp())
            .await?;
        tracing::info!(listener = %self.ctx.id, "Joined");
        Ok(())
    }

    /// Opt in to audio and start following the broadcast
    ///
    /// One-time; later calls do nothing. A store-rule rejection of the
    /// opt-in write is returned and leaves the listener untouched.
    pub async fn enable_audio(&self) -> Result<()> {
        let mut actor = self.actor.lock().await;
        if actor.is_some() {
            return Ok(());
        }

        self.ctx
            .listeners
            .enable_audio(&self.ctx.id, self.ctx.clock.stamp())
            .await?;
        let epochs = self.ctx.epochs.watch().await?;

        let (tx, task) = Actor::spawn(Arc::clone(&self.ctx), self.status_tx.clone(), epochs);
        *actor = Some(ActorHandle { tx, task });

        tracing::info!(listener = %self.ctx.id, "Audio enabled");
        Ok(())
    }

    pub async fn is_audio_enabled(&self) -> bool {
        self.actor.lock().await.is_some()
    }

    /// Mute or unmute local playback
    pub fn set_muted(&self, muted: bool) {
        self.ctx.media.set_gain(if muted { 0.0 } else { 1.0 });
    }

    pub fn status(&self) -> ListenerStatus {
        *self.status_rx.borrow()
    }

    /// Follow status changes
    pub fn subscribe(&self) -> watch::Receiver<ListenerStatus> {
        self.status_rx.clone()
    }

    /// Unsubscribe everything, close the session and clean up after ourselves
    pub async fn destroy(&self) {
        let handle = self.actor.lock().await.take();
        match handle {
            Some(handle) => {
                let (ack_tx, ack_rx) = oneshot::channel();
                if handle.tx.send(Input::Shutdown(Some(ack_tx))).is_ok() {
                    let _ = ack_rx.await;
                }
                let _ = handle.task.await;
            }
            None => {
                self.ctx.mailbox.clear_to_broadcaster(&self.ctx.id).await;
                self.ctx.media.detach_remote_track().await;
                self.status_tx.send_replace(ListenerStatus::Waiting);
            }
        }
    }
}

impl Drop for ListenerCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.actor.get_mut().take() {
            let _ = handle.tx.send(Input::Shutdown(None));
        }
    }
}
