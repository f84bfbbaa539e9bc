//! Volume and bitrate normalisation

/// Lowest accepted bitrate cap (kbps)
pub const MIN_BITRATE_KBPS: u32 = 6;

/// Highest accepted bitrate cap (kbps)
pub const MAX_BITRATE_KBPS: u32 = 320;

/// Clamp a gain to [0, 1]; non-finite input becomes 0
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_finite() {
        volume.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Normalise a requested bitrate cap
///
/// Missing, non-finite, zero or negative requests mean "unlimited" (None);
/// anything else is rounded and clamped to [6, 320] kbps.
pub fn clamp_bitrate_kbps(kbps: Option<f64>) -> Option<u32> {
    let kbps = kbps?;
    if !kbps.is_finite() || kbps <= 0.0 {
        return None;
    }
    let rounded = kbps.round().clamp(MIN_BITRATE_KBPS as f64, MAX_BITRATE_KBPS as f64);
    Some(rounded as u32)
}
