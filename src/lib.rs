//! Playback scheduler core.
//!
//! Owns an ordered/hierarchical collection of playable items, decides which
//! item plays next under the configured policy (sequential, random, repeat,
//! loop-all), and supervises the lifecycle of exactly one active playback
//! session at a time, including handoff of a downstream output pipeline
//! across item boundaries.
//!
//! Decoding, rendering, and front ends are external: embedders provide a
//! [`WorkerFactory`] that builds [`PlaybackWorker`]s for items, spawn a
//! thread for [`Scheduler::run`], and drive it through requests and the
//! notification bus.

pub mod config;
pub mod item;
pub mod order;
pub mod protocol;
pub mod scheduler;
pub mod session;

pub use config::{sanitize_config, PlaybackConfig};
pub use item::{Item, ItemDescriptor, ItemFlags, ItemId, ItemStore, StoreError};
pub use order::{next_item, OrderCache, REBUILD_DEBOUNCE};
pub use protocol::{Notification, PlayState, Request, StatusSnapshot, StopReason};
pub use scheduler::Scheduler;
pub use session::{
    ActiveSession, OutputSink, PlaybackWorker, SessionHandle, SessionLifecycle, StartError,
    WakeSignal, WorkerControl, WorkerFactory, WorkerOutcome,
};
