//! Control intents that can be performed on, or queued for, a subscription.

use std::fmt;

use crate::types::Error;

/// A single control intent. Values are distinct bits so sets of actions can
/// be tested with one mask.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Action(u8);

impl Action {
    pub const SUBSCRIBE: Action = Action(1);
    pub const UNSUBSCRIBE: Action = Action(2);
    pub const MODIFY_PATCH: Action = Action(8);
    pub const MODIFY_REPLACE: Action = Action(16);
    pub const UNSUBSCRIBE_BY_TAG_PENDING: Action = Action(32);
    pub const REMOVE: Action = Action(64);

    const ALL: [Action; 6] = [
        Action::SUBSCRIBE,
        Action::UNSUBSCRIBE,
        Action::MODIFY_PATCH,
        Action::MODIFY_REPLACE,
        Action::UNSUBSCRIBE_BY_TAG_PENDING,
        Action::REMOVE,
    ];

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True for the actions that leave the subscription disconnected.
    pub fn is_unsubscribe(self) -> bool {
        self == Action::UNSUBSCRIBE || self == Action::UNSUBSCRIBE_BY_TAG_PENDING
    }

    fn name(self) -> &'static str {
        match self {
            Action::SUBSCRIBE => "Subscribe",
            Action::UNSUBSCRIBE => "Unsubscribe",
            Action::MODIFY_PATCH => "ModifyPatch",
            Action::MODIFY_REPLACE => "ModifyReplace",
            Action::UNSUBSCRIBE_BY_TAG_PENDING => "UnsubscribeByTagPending",
            Action::REMOVE => "Remove",
            _ => "Unknown",
        }
    }
}

impl TryFrom<u8> for Action {
    type Error = Error;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        Action::ALL
            .into_iter()
            .find(|a| a.0 == bits)
            .ok_or(Error::InvalidAction(bits))
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A queued intent together with its action-specific arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedItem {
    Subscribe { replace: bool },
    /// `force` marks a subscription already considered dead locally.
    Unsubscribe { force: bool },
    /// Each patch carries real data and is never merged with another.
    ModifyPatch { delta: serde_json::Value },
    ModifyReplace,
    UnsubscribeByTagPending,
    Remove,
}

impl QueuedItem {
    pub fn action(&self) -> Action {
        match self {
            QueuedItem::Subscribe { .. } => Action::SUBSCRIBE,
            QueuedItem::Unsubscribe { .. } => Action::UNSUBSCRIBE,
            QueuedItem::ModifyPatch { .. } => Action::MODIFY_PATCH,
            QueuedItem::ModifyReplace => Action::MODIFY_REPLACE,
            QueuedItem::UnsubscribeByTagPending => Action::UNSUBSCRIBE_BY_TAG_PENDING,
            QueuedItem::Remove => Action::REMOVE,
        }
    }
}
