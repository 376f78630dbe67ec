//! Play-order policy: tree-order traversal and the debounced shuffle cache.

use std::time::{Duration, Instant};

use log::debug;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::config::PlaybackConfig;
use crate::item::{ItemId, ItemStore};

/// Minimum interval between successive play-order rebuilds. Rapid reset
/// triggers inside one window collapse into a single regeneration.
pub const REBUILD_DEBOUNCE: Duration = Duration::from_millis(30);

/// Cached play order, regenerated on demand under the debounce window.
pub struct OrderCache {
    order: Vec<ItemId>,
    built_at: Option<Instant>,
    reset_pending: bool,
    // StdRng reseeded per rebuild so the cache itself stays Send.
    rng_seed: [u8; 32],
}

impl OrderCache {
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        getrandom::fill(&mut seed).expect("Failed to generate random seed");
        Self {
            order: Vec::new(),
            built_at: None,
            reset_pending: true,
            rng_seed: seed,
        }
    }

    /// Marks the cached order invalid. The rebuild itself happens on the next
    /// [`OrderCache::maybe_rebuild`] outside the debounce window.
    pub fn request_reset(&mut self) {
        self.reset_pending = true;
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_pending
    }

    /// Cached order entries, oldest first.
    pub fn entries(&self) -> &[ItemId] {
        &self.order
    }

    /// Regenerates the order if a reset was requested and the debounce window
    /// has elapsed. Returns whether a rebuild happened.
    pub fn maybe_rebuild(&mut self, store: &ItemStore, node: ItemId, random: bool) -> bool {
        if !self.reset_pending {
            return false;
        }
        if let Some(built_at) = self.built_at {
            if built_at.elapsed() < REBUILD_DEBOUNCE {
                return false;
            }
        }
        self.order = store.leaves_under(node);
        if random {
            let mut rng = StdRng::from_seed(self.rng_seed);
            self.order.shuffle(&mut rng);
            for byte in self.rng_seed.iter_mut() {
                *byte = byte.wrapping_add(1);
            }
        }
        self.built_at = Some(Instant::now());
        self.reset_pending = false;
        debug!(
            "play order rebuilt. entries={} random={}",
            self.order.len(),
            random
        );
        true
    }

    /// Cache successor of `current`; wraps to the first entry when `wrap` is
    /// set. An absent or unknown `current` yields the first entry.
    fn successor(&self, current: Option<ItemId>, wrap: bool) -> Option<ItemId> {
        if self.order.is_empty() {
            return None;
        }
        match current.and_then(|item| self.order.iter().position(|&entry| entry == item)) {
            None => self.order.first().copied(),
            Some(position) if position + 1 < self.order.len() => {
                Some(self.order[position + 1])
            }
            Some(_) if wrap => self.order.first().copied(),
            Some(_) => None,
        }
    }
}

impl Default for OrderCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Picks the item to play after `current` under `node` per the configured
/// policy. `None` means the playlist has run out.
pub fn next_item(
    store: &ItemStore,
    cache: &OrderCache,
    current: Option<ItemId>,
    node: ItemId,
    config: &PlaybackConfig,
) -> Option<ItemId> {
    if config.random {
        return cache.successor(current, config.loop_all);
    }
    match current {
        None => store.first_leaf(node),
        Some(current) => match store.next_leaf_after(node, current) {
            Some(next) => Some(next),
            None => {
                let leaves = store.leaves_under(node);
                let at_end = leaves.last() == Some(&current);
                if at_end && !(config.repeat || config.loop_all) {
                    None
                } else {
                    // Wrap at the end, or restart when the current item is
                    // no longer in scope (removed mid-playlist).
                    leaves.first().copied()
                }
            }
        },
    }
}
