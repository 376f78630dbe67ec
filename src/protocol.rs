//! Shared scheduling types and outbound bus notifications.
//!
//! This module defines the request/status vocabulary exchanged between the
//! scheduler core and its front ends, and the notification payloads published
//! on the broadcast bus.

use crate::item::ItemId;

/// Scheduler run state as exposed to front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Running,
}

/// A pending, not-yet-applied scheduling intent.
///
/// At most one request is held at a time; submitting a new one overwrites an
/// unconsumed predecessor (last-writer-wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Run state the caller wants the scheduler to reach.
    pub target: PlayState,
    /// Specific item to play, when targeting `Running`.
    pub item: Option<ItemId>,
    /// Context node that scopes subsequent next-item computation.
    pub node: Option<ItemId>,
}

impl Request {
    /// Resume or start playback under the current context node.
    pub fn play() -> Self {
        Self {
            target: PlayState::Running,
            item: None,
            node: None,
        }
    }

    /// Play a specific item.
    pub fn play_item(item: ItemId) -> Self {
        Self {
            target: PlayState::Running,
            item: Some(item),
            node: None,
        }
    }

    /// Play a specific item and rescope next-item computation to `node`.
    pub fn play_item_in(item: ItemId, node: ItemId) -> Self {
        Self {
            target: PlayState::Running,
            item: Some(item),
            node: Some(node),
        }
    }

    /// Stop playback.
    pub fn stop() -> Self {
        Self {
            target: PlayState::Stopped,
            item: None,
            node: None,
        }
    }
}

/// Why the last session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The worker reached end of stream on its own.
    Eof,
    /// The worker reported an unrecoverable error.
    Error,
    /// An external request stopped the session.
    Requested,
}

/// Point-in-time view of the scheduler status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Item the scheduler considers current, if any.
    pub item: Option<ItemId>,
    /// Node scoping next-item computation.
    pub node: ItemId,
    /// Current run state.
    pub state: PlayState,
}

/// Notifications published on the scheduler's broadcast bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// A session started playing the item.
    ItemStarted { item: ItemId },
    /// The session for the item was reaped.
    ItemStopped { item: ItemId, reason: StopReason },
    /// The scheduler run state changed.
    StateChanged(PlayState),
    /// The item trees were mutated; flattened play order is invalid.
    StructureChanged,
    /// End of playlist reached with play-and-exit set. Published exactly once.
    ExitRequested,
}
