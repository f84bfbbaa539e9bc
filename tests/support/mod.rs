//! Scripted transport and media pipeline for driving both coordinators
//! against a `MemoryStore`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use castwire::media::{MediaError, MediaPipeline, MediaTrack};
use castwire::peer::{
    ConnectionState, IceCandidate, PeerConfig, PeerError, PeerEvent, PeerSession, PeerTransport,
    SdpKind, SessionDescription, SignalingState,
};
use castwire::{Broadcaster, ListenerCoordinator, MemoryStore, SignalingConfig};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config used by every scenario: defaults without the heartbeat
pub fn test_config() -> SignalingConfig {
    SignalingConfig::default().disable_heartbeat()
}

/// Poll `check` until it holds, panicking after 60s of (virtual) time
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Let every runnable task make progress
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Broadcaster,
    Listener,
}

#[derive(Default)]
struct Counters {
    open: HashMap<(Side, String), usize>,
    peak: HashMap<(Side, String), usize>,
    created: HashMap<(Side, String), usize>,
}

struct SessionState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    max_bitrate_bps: Option<u32>,
    events: Option<mpsc::UnboundedSender<PeerEvent>>,
}

/// A transport session following the offer/answer state machine
pub struct FakeSession {
    pub id: u64,
    pub side: Side,
    pub label: String,
    state: Mutex<SessionState>,
    counters: Arc<Mutex<Counters>>,
}

impl FakeSession {
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().signaling == SignalingState::Closed
    }

    pub fn remote_sdp(&self) -> Option<String> {
        self.state.lock().unwrap().remote.as_ref().map(|d| d.sdp.clone())
    }

    pub fn local_sdp(&self) -> Option<String> {
        self.state.lock().unwrap().local.as_ref().map(|d| d.sdp.clone())
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().remote_candidates.clone()
    }

    pub fn max_bitrate_bps(&self) -> Option<u32> {
        self.state.lock().unwrap().max_bitrate_bps
    }

    /// Inject a transport event as if the network produced it
    pub fn emit(&self, event: PeerEvent) {
        if let Some(events) = &self.state.lock().unwrap().events {
            let _ = events.send(event);
        }
    }

    fn candidate(&self) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.{} 5000 typ host", self.id, self.id % 250))
    }
}

fn invalid(operation: &'static str, state: SignalingState) -> PeerError {
    PeerError::InvalidState { operation, state }
}

#[async_trait]
impl PeerSession for FakeSession {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let state = self.state.lock().unwrap();
        match state.signaling {
            SignalingState::Closed => Err(PeerError::Closed),
            SignalingState::Stable | SignalingState::HaveLocalOffer => {
                Ok(SessionDescription::offer(format!("offer-{}", self.id)))
            }
            other => Err(invalid("create_offer", other)),
        }
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let state = self.state.lock().unwrap();
        match state.signaling {
            SignalingState::HaveRemoteOffer => {
                Ok(SessionDescription::answer(format!("answer-{}", self.id)))
            }
            SignalingState::Closed => Err(PeerError::Closed),
            other => Err(invalid("create_answer", other)),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut state = self.state.lock().unwrap();
        let mut emitted = vec![PeerEvent::LocalCandidate(self.candidate())];

        match (desc.kind, state.signaling) {
            (_, SignalingState::Closed) => return Err(PeerError::Closed),
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                state.signaling = SignalingState::HaveLocalOffer;
            }
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => {
                state.signaling = SignalingState::Stable;
                emitted.push(PeerEvent::RemoteTrack(MediaTrack::audio(format!(
                    "remote-{}",
                    self.id
                ))));
                emitted.push(PeerEvent::ConnectionStateChanged(ConnectionState::Connected));
            }
            (_, other) => return Err(invalid("set_local_description", other)),
        }

        state.local = Some(desc);
        if let Some(events) = &state.events {
            for event in emitted {
                let _ = events.send(event);
            }
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut state = self.state.lock().unwrap();
        match (desc.kind, state.signaling) {
            (_, SignalingState::Closed) => return Err(PeerError::Closed),
            (SdpKind::Offer, SignalingState::Stable) => {
                state.signaling = SignalingState::HaveRemoteOffer;
            }
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                state.signaling = SignalingState::Stable;
                if let Some(events) = &state.events {
                    let _ = events.send(PeerEvent::ConnectionStateChanged(ConnectionState::Connected));
                }
            }
            (_, other) => return Err(invalid("set_remote_description", other)),
        }
        state.remote = Some(desc);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut state = self.state.lock().unwrap();
        if state.signaling == SignalingState::Closed {
            return Err(PeerError::Closed);
        }
        if state.remote.is_none() {
            return Err(PeerError::Transport("no remote description".into()));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().unwrap().signaling
    }

    async fn set_max_bitrate(&self, bps: Option<u32>) -> Result<(), PeerError> {
        let mut state = self.state.lock().unwrap();
        if state.signaling == SignalingState::Closed {
            return Err(PeerError::Closed);
        }
        state.max_bitrate_bps = bps;
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if state.signaling == SignalingState::Closed {
            return;
        }
        state.signaling = SignalingState::Closed;
        state.events = None;

        let mut counters = self.counters.lock().unwrap();
        if let Some(open) = counters.open.get_mut(&(self.side, self.label.clone())) {
            *open -= 1;
        }
    }
}

/// Transport that hands out `FakeSession`s and tracks how many are open
#[derive(Default)]
pub struct FakeTransport {
    next_id: AtomicU64,
    failures: AtomicU64,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    counters: Arc<Mutex<Counters>>,
    gates: Mutex<HashMap<(Side, String), Arc<Notify>>>,
    stalled: Mutex<HashMap<(Side, String), usize>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` session creations fail
    pub fn fail_next(&self, n: u64) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Hold the next session creation for a side and label until the
    /// returned gate is notified
    pub fn stall(&self, side: Side, label: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert((side, label.to_string()), Arc::clone(&gate));
        gate
    }

    /// Number of creations currently held at a gate
    pub fn stalled(&self, side: Side, label: &str) -> usize {
        let stalled = self.stalled.lock().unwrap();
        stalled.get(&(side, label.to_string())).copied().unwrap_or(0)
    }

    pub fn sessions(&self, side: Side, label: &str) -> Vec<Arc<FakeSession>> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.side == side && s.label == label)
            .cloned()
            .collect()
    }

    /// Most recently created session for a side and label
    pub fn latest(&self, side: Side, label: &str) -> Option<Arc<FakeSession>> {
        self.sessions(side, label).pop()
    }

    pub fn open(&self, side: Side, label: &str) -> usize {
        let counters = self.counters.lock().unwrap();
        counters.open.get(&(side, label.to_string())).copied().unwrap_or(0)
    }

    /// Highest number of simultaneously open sessions ever seen
    pub fn peak(&self, side: Side, label: &str) -> usize {
        let counters = self.counters.lock().unwrap();
        counters.peak.get(&(side, label.to_string())).copied().unwrap_or(0)
    }

    pub fn created(&self, side: Side, label: &str) -> usize {
        let counters = self.counters.lock().unwrap();
        counters.created.get(&(side, label.to_string())).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_session(
        &self,
        config: PeerConfig,
    ) -> Result<(Arc<dyn PeerSession>, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PeerError::Transport("scripted failure".into()));
        }

        let side = if config.outgoing_track.is_some() {
            Side::Broadcaster
        } else {
            Side::Listener
        };
        let key = (side, config.label.clone());
        let gate = self.gates.lock().unwrap().remove(&key);
        if let Some(gate) = gate {
            *self.stalled.lock().unwrap().entry(key.clone()).or_default() += 1;
            gate.notified().await;
            *self.stalled.lock().unwrap().entry(key).or_default() -= 1;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(FakeSession {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            side,
            label: config.label.clone(),
            state: Mutex::new(SessionState {
                signaling: SignalingState::Stable,
                local: None,
                remote: None,
                remote_candidates: Vec::new(),
                max_bitrate_bps: config.max_bitrate_bps,
                events: Some(tx),
            }),
            counters: Arc::clone(&self.counters),
        });

        {
            let mut counters = self.counters.lock().unwrap();
            let key = (side, config.label);
            let open = counters.open.entry(key.clone()).or_default();
            *open += 1;
            let open = *open;
            let peak = counters.peak.entry(key.clone()).or_default();
            *peak = (*peak).max(open);
            *counters.created.entry(key).or_default() += 1;
        }

        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok((session, rx))
    }
}

/// Media pipeline that records what it was asked to do
#[derive(Default)]
pub struct FakeMedia {
    capturing: AtomicBool,
    deny_capture: AtomicBool,
    gain: Mutex<Option<f32>>,
    attached: Mutex<Option<MediaTrack>>,
    capture_starts: AtomicU64,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny_capture(&self) {
        self.deny_capture.store(true, Ordering::SeqCst);
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    pub fn capture_starts(&self) -> u64 {
        self.capture_starts.load(Ordering::SeqCst)
    }

    pub fn gain(&self) -> Option<f32> {
        *self.gain.lock().unwrap()
    }

    pub fn attached(&self) -> Option<MediaTrack> {
        self.attached.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaPipeline for FakeMedia {
    async fn start_capture(&self) -> Result<(), MediaError> {
        if self.deny_capture.load(Ordering::SeqCst) {
            return Err(MediaError::Capture("permission refused".into()));
        }
        self.capturing.store(true, Ordering::SeqCst);
        self.capture_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_capture(&self) {
        self.capturing.store(false, Ordering::SeqCst);
    }

    fn output_track(&self) -> Option<MediaTrack> {
        self.is_capturing().then(|| MediaTrack::audio("mic"))
    }

    fn set_gain(&self, gain: f32) {
        *self.gain.lock().unwrap() = Some(gain);
    }

    async fn attach_remote_track(&self, track: MediaTrack) -> Result<(), MediaError> {
        *self.attached.lock().unwrap() = Some(track);
        Ok(())
    }

    async fn detach_remote_track(&self) {
        *self.attached.lock().unwrap() = None;
    }
}

/// One broadcaster and its collaborators on a fresh store
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub transport: Arc<FakeTransport>,
    pub media: Arc<FakeMedia>,
    pub broadcaster: Broadcaster,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SignalingConfig) -> Self {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let transport = FakeTransport::new();
        let media = FakeMedia::new();
        let broadcaster = Broadcaster::new(store.clone(), transport.clone(), media.clone(), config);
        Self {
            store,
            transport,
            media,
            broadcaster,
        }
    }

    /// A listener sharing the store and transport, with its own media pipeline
    pub fn listener(&self, id: &str) -> (ListenerCoordinator, Arc<FakeMedia>) {
        let media = FakeMedia::new();
        let listener = ListenerCoordinator::new(
            id,
            self.store.clone(),
            self.transport.clone(),
            media.clone(),
            test_config(),
        );
        (listener, media)
    }
}
