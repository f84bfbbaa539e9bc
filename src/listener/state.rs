//! Listener connection state and offer fencing

use crate::registry::{OfferEnvelope, SessionId};

/// What the listener reports to its embedder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerStatus {
    /// No broadcast, or audio not enabled yet
    #[default]
    Waiting,
    /// Bound to an epoch, negotiating
    Connecting,
    /// Receiving the broadcast
    Connected,
}

impl ListenerStatus {
    pub fn is_connected(self) -> bool {
        self == ListenerStatus::Connected
    }
}

/// What to do with an offer read from the mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OfferDecision {
    /// Stale, duplicate or from another epoch
    Ignore,
    /// Answer it on the current session
    Apply,
    /// The current session already answered an offer; build a fresh one first
    Rebuild,
}

/// One-shot fence over the offers of one epoch
///
/// Offers are ordered by `createdAt`. Once an offer was answered (or failed
/// to apply), it and everything older stay ignored for the rest of the
/// epoch, across reconnects. A session answers at most one offer.
#[derive(Debug, Default)]
pub(crate) struct OfferGuard {
    epoch: Option<SessionId>,
    watermark: Option<u64>,
    session_used: bool,
}

impl OfferGuard {
    /// Start fencing a new epoch
    pub fn adopt(&mut self, epoch: SessionId) {
        *self = Self {
            epoch: Some(epoch),
            ..Default::default()
        };
    }

    /// Forget the epoch entirely
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// A fresh session was created
    pub fn new_session(&mut self) {
        self.session_used = false;
    }

    /// The offer created at `created_at` was consumed by the current session
    pub fn consumed(&mut self, created_at: u64) {
        self.watermark = Some(self.watermark.map_or(created_at, |w| w.max(created_at)));
        self.session_used = true;
    }

    pub fn decide(&self, offer: &OfferEnvelope) -> OfferDecision {
        let Some(epoch) = &self.epoch else {
            return OfferDecision::Ignore;
        };
        if *epoch != offer.session_id {
            return OfferDecision::Ignore;
        }
        if self.watermark.is_some_and(|w| offer.created_at <= w) {
            return OfferDecision::Ignore;
        }
        if self.session_used {
            OfferDecision::Rebuild
        } else {
            OfferDecision::Apply
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(session: &str, created_at: u64) -> OfferEnvelope {
        OfferEnvelope {
            session_id: session.into(),
            sdp: "v=0".into(),
            created_at,
        }
    }

    #[test]
    fn test_default_status() {
        assert_eq!(ListenerStatus::default(), ListenerStatus::Waiting);
        assert!(!ListenerStatus::Connecting.is_connected());
        assert!(ListenerStatus::Connected.is_connected());
    }

    #[test]
    fn test_without_epoch_everything_is_ignored() {
        let guard = OfferGuard::default();
        assert_eq!(guard.decide(&offer("s1", 1)), OfferDecision::Ignore);
    }

    #[test]
    fn test_other_epoch_is_ignored() {
        let mut guard = OfferGuard::default();
        guard.adopt(SessionId::from("s2"));

        assert_eq!(guard.decide(&offer("s1", 100)), OfferDecision::Ignore);
        assert_eq!(guard.decide(&offer("s2", 1)), OfferDecision::Apply);
    }

    #[test]
    fn test_one_shot() {
        let mut guard = OfferGuard::default();
        guard.adopt(SessionId::from("s1"));

        assert_eq!(guard.decide(&offer("s1", 10)), OfferDecision::Apply);
        guard.consumed(10);

        // Redelivered or older
        assert_eq!(guard.decide(&offer("s1", 10)), OfferDecision::Ignore);
        assert_eq!(guard.decide(&offer("s1", 9)), OfferDecision::Ignore);

        // The broadcaster renegotiated
        assert_eq!(guard.decide(&offer("s1", 11)), OfferDecision::Rebuild);
        guard.new_session();
        assert_eq!(guard.decide(&offer("s1", 11)), OfferDecision::Apply);
    }

    #[test]
    fn test_watermark_survives_reconnect() {
        let mut guard = OfferGuard::default();
        guard.adopt(SessionId::from("s1"));
        guard.consumed(10);

        guard.new_session();
        assert_eq!(guard.decide(&offer("s1", 10)), OfferDecision::Ignore);
        assert_eq!(guard.decide(&offer("s1", 12)), OfferDecision::Apply);
    }

    #[test]
    fn test_adopt_resets() {
        let mut guard = OfferGuard::default();
        guard.adopt(SessionId::from("s1"));
        guard.consumed(50);

        guard.adopt(SessionId::from("s2"));
        assert_eq!(guard.decide(&offer("s2", 1)), OfferDecision::Apply);

        guard.clear();
        assert_eq!(guard.decide(&offer("s2", 1)), OfferDecision::Ignore);
    }
}
