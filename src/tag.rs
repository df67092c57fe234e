//! Completion tags: an arena of pending actions.
//!
//! Every operation the event loop will later react to (a slot waiting for
//! its call, a cancel notification, a sent response) is parked here and
//! identified by a [`Tag`]. The transport only ever hands the tag back;
//! the loop then [`take`](TagTable::take)s the action, which removes it.
//!
//! Slab indices are recycled, so each entry also carries a generation. A
//! tag whose generation no longer matches is stale and is reported as
//! [`CoordinatorError::StaleTag`] instead of silently running someone
//! else's action.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;

use crate::error::{CoordinatorError, Result};
use crate::slot::CallSlot;

/// Opaque handle for one pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    index: u32,
    generation: u32,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// What the event loop does when a tag completes.
pub(crate) enum TagAction {
    /// The transport filled an Awaiting slot with an incoming call.
    RequestReceived(Arc<CallSlot>),
    /// The client cancelled an Active call.
    CancelRequested(Arc<CallSlot>),
    /// The call's response has been handed to the connection writer.
    ResponseSent(Arc<CallSlot>),
}

impl TagAction {
    pub(crate) fn slot(&self) -> &Arc<CallSlot> {
        match self {
            TagAction::RequestReceived(slot)
            | TagAction::CancelRequested(slot)
            | TagAction::ResponseSent(slot) => slot,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            TagAction::RequestReceived(_) => "request_received",
            TagAction::CancelRequested(_) => "cancel_requested",
            TagAction::ResponseSent(_) => "response_sent",
        }
    }
}

impl fmt::Debug for TagAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagAction")
            .field("kind", &self.kind())
            .field("slot", &self.slot().id())
            .finish()
    }
}

struct Entry {
    generation: u32,
    action: TagAction,
}

/// Arena of pending actions keyed by [`Tag`].
pub(crate) struct TagTable {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: Slab<Entry>,
    next_generation: u32,
}

impl TagTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Slab::new(),
                next_generation: 0,
            }),
        }
    }

    /// Park an action and return its tag.
    pub fn insert(&self, action: TagAction) -> Tag {
        let mut inner = self.inner.lock();
        let generation = inner.next_generation;
        inner.next_generation = inner.next_generation.wrapping_add(1);
        let index = inner.entries.insert(Entry { generation, action });
        Tag {
            index: index as u32,
            generation,
        }
    }

    /// Remove and return the action for `tag`. Each tag can be taken once.
    pub fn take(&self, tag: Tag) -> Result<TagAction> {
        let mut inner = self.inner.lock();
        let index = tag.index as usize;
        match inner.entries.get(index) {
            Some(entry) if entry.generation == tag.generation => {
                Ok(inner.entries.remove(index).action)
            }
            _ => Err(CoordinatorError::StaleTag(tag)),
        }
    }

    /// Drop a pending action without running it.
    pub fn discard(&self, tag: Tag) -> bool {
        self.take(tag).is_ok()
    }

    /// Number of actions still pending.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

impl Default for TagTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Method;

    #[test]
    fn test_take_is_single_use() {
        let table = TagTable::new();
        let slot = CallSlot::new(Method::RunStep);
        let tag = table.insert(TagAction::RequestReceived(slot.clone()));

        let action = table.take(tag).unwrap();
        assert_eq!(action.slot().id(), slot.id());
        assert!(matches!(table.take(tag), Err(CoordinatorError::StaleTag(t)) if t == tag));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_recycled_index_does_not_revive_old_tag() {
        let table = TagTable::new();
        let first = table.insert(TagAction::ResponseSent(CallSlot::new(Method::Reset)));
        assert!(table.discard(first));

        let second = table.insert(TagAction::ResponseSent(CallSlot::new(Method::Reset)));
        assert_eq!(first.index, second.index);
        assert_ne!(first, second);

        assert!(table.take(first).is_err());
        assert!(table.take(second).is_ok());
    }

    #[test]
    fn test_action_kind() {
        let slot = CallSlot::new(Method::RunStep);
        assert_eq!(TagAction::CancelRequested(slot).kind(), "cancel_requested");
    }
}
