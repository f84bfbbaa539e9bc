//! Liveness and output-level control
//!
//! Pure computations shared by the broadcaster (normalising the values it
//! persists and applies) and by observers such as dashboards (deriving which
//! listeners are active). Nothing here mutates state.

pub mod levels;
pub mod liveness;

pub use levels::{clamp_bitrate_kbps, clamp_volume, MAX_BITRATE_KBPS, MIN_BITRATE_KBPS};
pub use liveness::{is_active, overview, read_overview, ListenerOverview};
