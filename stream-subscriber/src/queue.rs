//! Ordered buffer of pending intents.
//!
//! Intents issued while a request is in flight are queued here. Enqueueing
//! merges or cancels contradicting neighbours so the queue stays short even
//! under bursts of UI-driven calls, and dequeueing skips straight to the last
//! queued unsubscribe because everything before it is moot.

use std::collections::VecDeque;

use crate::action::{Action, QueuedItem};

#[derive(Debug, Default)]
pub struct ActionQueue {
    items: VecDeque<QueuedItem>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn enqueue(&mut self, item: QueuedItem) {
        loop {
            let Some(tail) = self.items.back_mut() else {
                self.items.push_back(item);
                return;
            };

            if tail.action() == item.action() && item.action() != Action::MODIFY_PATCH {
                if let (
                    QueuedItem::Unsubscribe { force: tail_force },
                    QueuedItem::Unsubscribe { force },
                ) = (tail, &item)
                {
                    *tail_force |= *force;
                }
                return;
            }

            let supersedes_tail = match (&*tail, &item) {
                (QueuedItem::Unsubscribe { force: false }, QueuedItem::Subscribe { .. }) => true,
                (
                    QueuedItem::Subscribe { .. },
                    QueuedItem::Unsubscribe { .. } | QueuedItem::UnsubscribeByTagPending,
                ) => true,
                (
                    QueuedItem::ModifyPatch { .. },
                    QueuedItem::Unsubscribe { force: true } | QueuedItem::UnsubscribeByTagPending,
                ) => true,
                (QueuedItem::Unsubscribe { .. }, QueuedItem::UnsubscribeByTagPending) => true,
                _ => false,
            };

            if !supersedes_tail {
                self.items.push_back(item);
                return;
            }
            self.items.pop_back();
        }
    }

    /// Drop the leading run of subscribe/modify items. Returns `true` if a
    /// Subscribe or ModifyReplace was among them, i.e. new arguments were
    /// waiting to be sent.
    pub fn clear_modifys(&mut self) -> bool {
        let mut had_subscribe = false;
        while let Some(front) = self.items.front() {
            match front {
                QueuedItem::Subscribe { .. } | QueuedItem::ModifyReplace => had_subscribe = true,
                QueuedItem::ModifyPatch { .. } => {}
                _ => break,
            }
            self.items.pop_front();
        }
        had_subscribe
    }

    pub fn dequeue(&mut self) -> Option<QueuedItem> {
        let head = self.items.pop_front()?;
        let last_unsubscribe = self.items.iter().rposition(|item| {
            matches!(
                item,
                QueuedItem::Unsubscribe { .. } | QueuedItem::UnsubscribeByTagPending
            )
        });
        match last_unsubscribe {
            Some(pos) => {
                self.items.drain(..pos);
                self.items.pop_front()
            }
            None => Some(head),
        }
    }

    pub fn peek(&self) -> Option<&QueuedItem> {
        self.items.front()
    }

    pub fn peek_action(&self) -> Option<Action> {
        self.items.front().map(QueuedItem::action)
    }

    /// True when the next action to leave the queue is a forced unsubscribe.
    pub fn next_is_forced_unsubscribe(&self) -> bool {
        matches!(self.peek(), Some(QueuedItem::Unsubscribe { force: true }))
    }

    /// Whether the queue, once drained, leaves the subscription connected.
    /// The last Subscribe/ModifyReplace or Unsubscribe/UnsubscribeByTagPending/Remove
    /// decides; `None` if no queued item affects connectivity.
    pub fn ends_connected(&self) -> Option<bool> {
        self.items.iter().rev().find_map(|item| match item {
            QueuedItem::Subscribe { .. } | QueuedItem::ModifyReplace => Some(true),
            QueuedItem::Unsubscribe { .. }
            | QueuedItem::UnsubscribeByTagPending
            | QueuedItem::Remove => Some(false),
            QueuedItem::ModifyPatch { .. } => None,
        })
    }

    pub fn reset(&mut self) {
        self.items.clear();
    }
}
