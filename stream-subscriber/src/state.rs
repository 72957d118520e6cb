//! Subscription lifecycle states.

use std::fmt;

/// Lifecycle state of a subscription. Each state is a distinct bit so the
/// state machine can test membership in a set of states with one mask.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionState(u8);

impl SubscriptionState {
    pub const SUBSCRIBE_REQUESTED: SubscriptionState = SubscriptionState(1);
    pub const SUBSCRIBED: SubscriptionState = SubscriptionState(2);
    pub const UNSUBSCRIBE_REQUESTED: SubscriptionState = SubscriptionState(4);
    pub const UNSUBSCRIBED: SubscriptionState = SubscriptionState(8);
    pub const PATCH_REQUESTED: SubscriptionState = SubscriptionState(16);
    pub const REPLACE_REQUESTED: SubscriptionState = SubscriptionState(32);
    pub const READY_FOR_UNSUBSCRIBE_BY_TAG: SubscriptionState = SubscriptionState(64);

    /// States in which new intents are queued rather than performed.
    /// The tag state waits on the external bulk unsubscribe.
    const TRANSITIONING: u8 = Self::SUBSCRIBE_REQUESTED.0
        | Self::UNSUBSCRIBE_REQUESTED.0
        | Self::PATCH_REQUESTED.0
        | Self::REPLACE_REQUESTED.0
        | Self::READY_FOR_UNSUBSCRIBE_BY_TAG.0;

    const SUBSCRIBING: u8 = Self::SUBSCRIBE_REQUESTED.0 | Self::REPLACE_REQUESTED.0;

    /// States where the server holds (or is about to hold) the subscription.
    const CONNECTED: u8 = Self::SUBSCRIBED.0 | Self::PATCH_REQUESTED.0 | Self::SUBSCRIBING;

    pub fn is_transitioning(self) -> bool {
        self.0 & Self::TRANSITIONING != 0
    }

    /// Waiting for a create or replace response.
    pub fn is_subscribing(self) -> bool {
        self.0 & Self::SUBSCRIBING != 0
    }

    /// Subscribed, patching, or mid-subscribing.
    pub fn is_connected(self) -> bool {
        self.0 & Self::CONNECTED != 0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    fn name(self) -> &'static str {
        match self {
            Self::SUBSCRIBE_REQUESTED => "SubscribeRequested",
            Self::SUBSCRIBED => "Subscribed",
            Self::UNSUBSCRIBE_REQUESTED => "UnsubscribeRequested",
            Self::UNSUBSCRIBED => "Unsubscribed",
            Self::PATCH_REQUESTED => "PatchRequested",
            Self::REPLACE_REQUESTED => "ReplaceRequested",
            Self::READY_FOR_UNSUBSCRIBE_BY_TAG => "ReadyForUnsubscribeByTag",
            _ => "Unknown",
        }
    }
}

impl Default for SubscriptionState {
    fn default() -> Self {
        Self::UNSUBSCRIBED
    }
}

impl fmt::Debug for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitioning_states() {
        assert!(SubscriptionState::SUBSCRIBE_REQUESTED.is_transitioning());
        assert!(SubscriptionState::UNSUBSCRIBE_REQUESTED.is_transitioning());
        assert!(SubscriptionState::PATCH_REQUESTED.is_transitioning());
        assert!(SubscriptionState::REPLACE_REQUESTED.is_transitioning());
        assert!(SubscriptionState::READY_FOR_UNSUBSCRIBE_BY_TAG.is_transitioning());
        assert!(!SubscriptionState::SUBSCRIBED.is_transitioning());
        assert!(!SubscriptionState::UNSUBSCRIBED.is_transitioning());
    }

    #[test]
    fn connected_states() {
        assert!(SubscriptionState::SUBSCRIBED.is_connected());
        assert!(SubscriptionState::PATCH_REQUESTED.is_connected());
        assert!(SubscriptionState::REPLACE_REQUESTED.is_connected());
        assert!(SubscriptionState::SUBSCRIBE_REQUESTED.is_subscribing());
        assert!(!SubscriptionState::PATCH_REQUESTED.is_subscribing());
        assert!(!SubscriptionState::UNSUBSCRIBE_REQUESTED.is_connected());
        assert!(!SubscriptionState::READY_FOR_UNSUBSCRIBE_BY_TAG.is_connected());
    }

    #[test]
    fn initial_state_is_unsubscribed() {
        assert_eq!(SubscriptionState::default(), SubscriptionState::UNSUBSCRIBED);
        assert_eq!(format!("{:?}", SubscriptionState::default()), "Unsubscribed");
    }
}
