//! Store path layout
//!
//! The layout is a wire contract shared with existing deployments and must
//! not change.

use super::error::StoreError;

/// Singleton broadcast epoch record
pub const BROADCAST: &str = "broadcast";

/// Parent of all listener records
pub const LISTENERS: &str = "listeners";

/// Parent of all pending offers
pub const OFFERS: &str = "offers";

/// Parent of broadcaster -> listener candidate sequences
pub const CANDIDATES_TO_LISTENER: &str = "candidates/listeners";

/// Parent of listener -> broadcaster candidate sequences
pub const CANDIDATES_TO_BROADCASTER: &str = "candidates/admin";

/// The whole store
pub const ROOT: &str = "";

/// Path of one listener record
pub fn listener(id: &str) -> String {
    format!("{}/{}", LISTENERS, id)
}

/// Path of one listener's pending offer
pub fn offer(id: &str) -> String {
    format!("{}/{}", OFFERS, id)
}

/// Path of the candidates the broadcaster sends to one listener
pub fn candidates_to_listener(id: &str) -> String {
    format!("{}/{}", CANDIDATES_TO_LISTENER, id)
}

/// Path of the candidates one listener sends to the broadcaster
pub fn candidates_to_broadcaster(id: &str) -> String {
    format!("{}/{}", CANDIDATES_TO_BROADCASTER, id)
}

/// Split a path into its segments, validating each one
///
/// Leading, trailing and repeated slashes are ignored; the empty path is the
/// root.
pub fn segments(path: &str) -> Result<Vec<String>, StoreError> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s.contains(['.', '#', '$', '[', ']']) {
                Err(StoreError::InvalidPath(path.to_string()))
            } else {
                Ok(s.to_string())
            }
        })
        .collect()
}
