//! Coordinator configuration

use std::time::Duration;

/// Public STUN server used when no ICE servers are configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Delay before a listener rebuilds a failed or disconnected transport
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1500);

/// Window in which a listener counts as active after its last update
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(30);

/// Settings shared by the broadcaster and listener coordinators
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Fixed (non-exponential) delay before a reconnect or negotiation retry
    pub reconnect_delay: Duration,

    /// Recency window of the "active listener" predicate
    pub liveness_window: Duration,

    /// How often a listener refreshes `updatedAt` while audio is enabled
    /// (None = only on state changes)
    pub heartbeat_interval: Option<Duration>,

    /// ICE server URLs handed to every transport session
    pub ice_servers: Vec<String>,

    /// Broadcaster gain before any `set_volume` call
    pub initial_volume: f32,

    /// Broadcaster bitrate cap before any `set_bitrate_cap` call
    pub initial_max_bitrate_kbps: Option<u32>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            liveness_window: DEFAULT_LIVENESS_WINDOW,
            heartbeat_interval: Some(Duration::from_secs(10)),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            initial_volume: 1.0,
            initial_max_bitrate_kbps: None,
        }
    }
}

impl SignalingConfig {
    /// Set the reconnect delay
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the liveness window
    pub fn liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }

    /// Set the heartbeat interval
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Disable the listener heartbeat
    pub fn disable_heartbeat(mut self) -> Self {
        self.heartbeat_interval = None;
        self
    }

    /// Replace the ICE server list
    pub fn ice_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ice_servers = servers.into_iter().map(Into::into).collect();
        self
    }

    /// Set the initial broadcaster volume (clamped to [0, 1])
    pub fn initial_volume(mut self, volume: f32) -> Self {
        self.initial_volume = crate::control::clamp_volume(volume);
        self
    }

    /// Set the initial bitrate cap (clamped to [6, 320] kbps, 0 = unlimited)
    pub fn initial_max_bitrate_kbps(mut self, kbps: u32) -> Self {
        self.initial_max_bitrate_kbps = crate::control::clamp_bitrate_kbps(Some(kbps as f64));
        self
    }
}
