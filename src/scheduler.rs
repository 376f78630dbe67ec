//! Supervisory scheduling loop and the shared playlist state it protects.
//!
//! One mutex guards all playlist state; the loop holds it for the whole of
//! each tick except the bounded idle wait while a session is dying and the
//! worker join during reap. Front ends talk to the scheduler through the
//! request slot and read state back through snapshots and the broadcast bus.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::config::PlaybackConfig;
use crate::item::{ItemId, ItemStore, StoreError};
use crate::order::{self, OrderCache, REBUILD_DEBOUNCE};
use crate::protocol::{Notification, PlayState, Request, StatusSnapshot, StopReason};
use crate::session::{ActiveSession, SessionHandle, StartError, WakeSignal, WorkerFactory};

const BUS_CAPACITY: usize = 256;

/// Everything the shared lock protects.
struct SchedulerState {
    store: ItemStore,
    cache: OrderCache,
    config: PlaybackConfig,
    state: PlayState,
    current_item: Option<ItemId>,
    current_node: ItemId,
    pending: Option<Request>,
    session: Option<ActiveSession>,
    carryover: Option<Box<dyn crate::session::OutputSink>>,
    activity: u32,
    exit_signalled: bool,
    shutdown: bool,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    wake: Condvar,
    bus: broadcast::Sender<Notification>,
}

/// Wakes the supervisory loop from worker threads. Locks the state mutex
/// around the notify so a wake can never slip between the loop's re-check
/// and its wait.
struct SchedulerWake {
    shared: Arc<SchedulerShared>,
}

impl WakeSignal for SchedulerWake {
    fn wake(&self) {
        let _guard = self.shared.state.lock().unwrap();
        self.shared.wake.notify_all();
    }
}

/// What the session sub-machine wants the tick to do next.
enum SessionAction {
    /// A pending request conflicts with the live session.
    StopForRequest,
    /// The worker finished on its own; ask it to unwind.
    StopFinished,
    /// Worker fully exited, safe to reap.
    Reap,
    /// Worker is unwinding; bounded idle wait, then re-check.
    IdleWait,
    /// Starting or running with nothing pending.
    Settled,
}

/// Playback scheduler core. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    factory: Arc<dyn WorkerFactory>,
}

impl Scheduler {
    pub fn new(factory: Arc<dyn WorkerFactory>, config: PlaybackConfig) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        let store = ItemStore::new();
        let current_node = store.root_onelevel();
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedulerState {
                store,
                cache: OrderCache::new(),
                config: crate::config::sanitize_config(config),
                state: PlayState::Stopped,
                current_item: None,
                current_node,
                pending: None,
                session: None,
                carryover: None,
                activity: 0,
                exit_signalled: false,
                shutdown: false,
            }),
            wake: Condvar::new(),
            bus,
        });
        Self {
            shared,
            factory,
        }
    }

    /// Subscribes to scheduler notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.shared.bus.subscribe()
    }

    // ---- control surface -------------------------------------------------

    /// Submits a scheduling request. An unconsumed pending request is
    /// overwritten; last writer wins.
    pub fn submit(&self, request: Request) {
        let mut st = self.shared.state.lock().unwrap();
        if st.pending.is_some() {
            debug!("overwriting unconsumed pending request");
        }
        st.pending = Some(request);
        self.shared.wake.notify_all();
    }

    pub fn play(&self) {
        self.submit(Request::play());
    }

    /// Requests playback of a specific item (or a node, which rescopes the
    /// play order to it).
    pub fn play_item(&self, item: ItemId) -> Result<(), StoreError> {
        {
            let st = self.shared.state.lock().unwrap();
            st.store
                .lookup(item)
                .ok_or(StoreError::NotFound(item.raw()))?;
        }
        self.submit(Request::play_item(item));
        Ok(())
    }

    pub fn stop(&self) {
        self.submit(Request::stop());
    }

    pub fn current_status(&self) -> StatusSnapshot {
        let st = self.shared.state.lock().unwrap();
        StatusSnapshot {
            item: st.current_item,
            node: st.current_node,
            state: st.state,
        }
    }

    /// Shared handle to the live session, if one exists.
    pub fn current_session(&self) -> Option<SessionHandle> {
        let st = self.shared.state.lock().unwrap();
        st.session.as_ref().map(|session| session.handle())
    }

    /// Running, and not about to stop because of an unconsumed stop request.
    pub fn is_playing(&self) -> bool {
        let st = self.shared.state.lock().unwrap();
        st.state == PlayState::Running
            && !matches!(
                st.pending,
                Some(request) if request.target == PlayState::Stopped
            )
    }

    /// Number of sessions currently holding a carried-over output pipeline.
    pub fn activity(&self) -> u32 {
        self.shared.state.lock().unwrap().activity
    }

    pub fn config(&self) -> PlaybackConfig {
        self.shared.state.lock().unwrap().config
    }

    /// Asks the run loop to exit. The live session, if any, is stopped and
    /// reaped on the way out.
    pub fn shutdown(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.shutdown = true;
        self.shared.wake.notify_all();
    }

    // ---- configuration ---------------------------------------------------

    /// Toggles random mode. Invalidates the play order.
    pub fn set_random(&self, random: bool) {
        let mut st = self.shared.state.lock().unwrap();
        if st.config.random != random {
            st.config.random = random;
            st.cache.request_reset();
            self.shared.wake.notify_all();
        }
    }

    pub fn set_repeat(&self, repeat: bool) {
        self.update_config(|config| config.repeat = repeat);
    }

    pub fn set_loop(&self, loop_all: bool) {
        self.update_config(|config| config.loop_all = loop_all);
    }

    pub fn set_play_and_stop(&self, on: bool) {
        self.update_config(|config| config.play_and_stop = on);
    }

    pub fn set_play_and_exit(&self, on: bool) {
        self.update_config(|config| config.play_and_exit = on);
    }

    pub fn set_keep_output(&self, on: bool) {
        self.update_config(|config| config.keep_output = on);
    }

    fn update_config(&self, apply: impl FnOnce(&mut PlaybackConfig)) {
        let mut st = self.shared.state.lock().unwrap();
        apply(&mut st.config);
        st.config = crate::config::sanitize_config(st.config);
        self.shared.wake.notify_all();
    }

    // ---- item store surface ----------------------------------------------

    pub fn root_category(&self) -> ItemId {
        self.shared.state.lock().unwrap().store.root_category()
    }

    pub fn root_onelevel(&self) -> ItemId {
        self.shared.state.lock().unwrap().store.root_onelevel()
    }

    /// Read access to the item store under the shared lock.
    pub fn with_store<R>(&self, read: impl FnOnce(&ItemStore) -> R) -> R {
        let st = self.shared.state.lock().unwrap();
        read(&st.store)
    }

    pub fn add_leaf(&self, parent: ItemId, uri: &str) -> Result<ItemId, StoreError> {
        let mut st = self.shared.state.lock().unwrap();
        let id = st.store.add_leaf(parent, uri)?;
        self.structure_changed(&mut st);
        Ok(id)
    }

    pub fn create_node(&self, parent: ItemId, name: &str) -> Result<ItemId, StoreError> {
        let mut st = self.shared.state.lock().unwrap();
        let id = st.store.create_node(parent, name)?;
        self.structure_changed(&mut st);
        Ok(id)
    }

    pub fn remove_item(&self, id: ItemId) -> Result<(), StoreError> {
        let mut st = self.shared.state.lock().unwrap();
        let state = &mut *st;
        let mut in_use = vec![state.current_node];
        if let Some(current) = state.current_item {
            in_use.push(current);
        }
        state.store.remove(id, &in_use)?;
        self.structure_changed(&mut st);
        Ok(())
    }

    /// Any structural change invalidates the flattened play order.
    fn structure_changed(&self, st: &mut MutexGuard<'_, SchedulerState>) {
        st.cache.request_reset();
        let _ = self.shared.bus.send(Notification::StructureChanged);
        self.shared.wake.notify_all();
    }

    // ---- main loop -------------------------------------------------------

    /// Runs the supervisory loop until [`Scheduler::shutdown`] (or the
    /// play-and-exit policy) ends it. Intended to own its thread.
    pub fn run(&self) {
        info!("playback scheduler started");
        let mut st = self.shared.state.lock().unwrap();
        while !st.shutdown {
            st = self.tick(st);
            if st.shutdown {
                break;
            }
            if st.pending.is_some() {
                continue;
            }
            st = if st.cache.reset_pending() {
                // Retry once the debounce window can have elapsed.
                self.shared
                    .wake
                    .wait_timeout(st, REBUILD_DEBOUNCE)
                    .unwrap()
                    .0
            } else {
                self.shared.wake.wait(st).unwrap()
            };
        }

        // Drain the live session before exiting.
        if let Some(session) = st.session.as_ref() {
            session.request_stop();
        }
        st.state = PlayState::Stopped;
        st.pending = None;
        while st.session.is_some() {
            st = self.tick(st);
        }
        drop(st);
        info!("playback scheduler exited");
    }

    /// One scheduling tick. Keeps re-evaluating while a transition is
    /// immediately actionable; only the dying case releases the lock to wait.
    fn tick<'a>(
        &'a self,
        mut st: MutexGuard<'a, SchedulerState>,
    ) -> MutexGuard<'a, SchedulerState> {
        {
            let state = &mut *st;
            let node = state.current_node;
            let random = state.config.random;
            state.cache.maybe_rebuild(&state.store, node, random);
        }

        let mut start_failures: usize = 0;
        'check: loop {
            if st.shutdown && st.session.is_none() {
                break 'check;
            }

            let action = match st.session.as_ref() {
                Some(session) => {
                    let lifecycle = session.lifecycle();
                    if st.pending.is_some() && !lifecycle.is_dying() {
                        Some(SessionAction::StopForRequest)
                    } else if lifecycle.is_dead() {
                        Some(SessionAction::Reap)
                    } else if lifecycle.is_dying() {
                        Some(SessionAction::IdleWait)
                    } else if lifecycle.is_error() || lifecycle.is_eof() {
                        Some(SessionAction::StopFinished)
                    } else {
                        Some(SessionAction::Settled)
                    }
                }
                None => None,
            };

            match action {
                Some(SessionAction::StopForRequest) => {
                    debug!("incoming request - stopping current session");
                    if let Some(session) = st.session.as_ref() {
                        session.request_stop();
                    }
                    continue 'check;
                }
                Some(SessionAction::StopFinished) => {
                    debug!("finished session");
                    if let Some(session) = st.session.as_ref() {
                        session.request_stop();
                    }
                    // No wait here; the dying case below handles that.
                    continue 'check;
                }
                Some(SessionAction::Reap) => {
                    debug!("dead session");
                    st = self.reap_current(st);
                    continue 'check;
                }
                Some(SessionAction::IdleWait) => {
                    let idle = Duration::from_millis(st.config.idle_sleep_ms);
                    drop(st);
                    thread::sleep(idle);
                    st = self.shared.state.lock().unwrap();
                    continue 'check;
                }
                Some(SessionAction::Settled) => break 'check,
                None => {
                    // No session. Apply the pending request, if any, and
                    // decide whether something should start.
                    let state = &mut *st;
                    // The run state only flips to Running on a successful
                    // start, so a failure scan in progress must keep the
                    // Running target alive itself.
                    let target = match state.pending {
                        Some(request) => request.target,
                        None if start_failures > 0 => PlayState::Running,
                        None => state.state,
                    };
                    if target == PlayState::Stopped {
                        state.pending = None;
                        if state.state != PlayState::Stopped {
                            state.state = PlayState::Stopped;
                            let _ = self
                                .shared
                                .bus
                                .send(Notification::StateChanged(PlayState::Stopped));
                            debug!("playback stopped");
                        }
                        break 'check;
                    }

                    let request = state.pending.take();
                    if let Some(request) = request {
                        self.apply_request_scope(state, &request);
                    }
                    let chosen = self.select_item(state, request);
                    match chosen {
                        None => {
                            debug!("nothing to play");
                            if state.state != PlayState::Stopped {
                                state.state = PlayState::Stopped;
                                let _ = self
                                    .shared
                                    .bus
                                    .send(Notification::StateChanged(PlayState::Stopped));
                            }
                            if state.config.play_and_exit && !state.exit_signalled {
                                info!("end of playlist, requesting exit");
                                state.exit_signalled = true;
                                state.shutdown = true;
                                let _ = self.shared.bus.send(Notification::ExitRequested);
                            }
                            break 'check;
                        }
                        Some(item) => match self.start_session(state, item) {
                            Ok(()) => {
                                if state.state != PlayState::Running {
                                    state.state = PlayState::Running;
                                    let _ = self
                                        .shared
                                        .bus
                                        .send(Notification::StateChanged(PlayState::Running));
                                }
                                let _ =
                                    self.shared.bus.send(Notification::ItemStarted { item });
                                // Re-validate the new session's flags.
                                continue 'check;
                            }
                            Err(err) => {
                                // Same policy as an immediate worker error:
                                // advance past the item instead of halting.
                                warn!(
                                    "failed to start item, skipping. id={} err={}",
                                    item.raw(),
                                    err
                                );
                                state.current_item = Some(item);
                                start_failures += 1;
                                let cycle = state
                                    .store
                                    .leaves_under(state.current_node)
                                    .len()
                                    .max(1);
                                if start_failures >= cycle {
                                    warn!("no startable item in playlist, stopping");
                                    state.state = PlayState::Stopped;
                                    let _ = self
                                        .shared
                                        .bus
                                        .send(Notification::StateChanged(PlayState::Stopped));
                                    break 'check;
                                }
                                continue 'check;
                            }
                        },
                    }
                }
            }
        }
        st
    }

    /// Applies the request's context-node rescope, if any.
    fn apply_request_scope(&self, state: &mut SchedulerState, request: &Request) {
        if let Some(node) = request.node {
            let is_node = state
                .store
                .lookup(node)
                .is_some_and(|item| item.is_node());
            if is_node && node != state.current_node {
                state.current_node = node;
                state.cache.request_reset();
            }
        }
    }

    /// Resolves which item should start, honoring explicit request targets,
    /// node rescoping, and the play-and-stop policy.
    fn select_item(
        &self,
        state: &mut SchedulerState,
        request: Option<Request>,
    ) -> Option<ItemId> {
        match request.and_then(|request| request.item) {
            Some(id) => match state.store.lookup(id) {
                Some(item) if item.is_node() => {
                    // Playing a node rescopes to it and starts from the top.
                    if state.current_node != id {
                        state.current_node = id;
                        state.cache.request_reset();
                    }
                    order::next_item(&state.store, &state.cache, None, id, &state.config)
                }
                Some(_) => Some(id),
                None => {
                    warn!("requested item no longer exists. id={}", id.raw());
                    order::next_item(
                        &state.store,
                        &state.cache,
                        state.current_item,
                        state.current_node,
                        &state.config,
                    )
                }
            },
            None => {
                if request.is_none()
                    && state.config.play_and_stop
                    && state.current_item.is_some()
                {
                    // Natural end of an item with play-and-stop: don't chain.
                    debug!("play-and-stop, not advancing");
                    None
                } else {
                    order::next_item(
                        &state.store,
                        &state.cache,
                        state.current_item,
                        state.current_node,
                        &state.config,
                    )
                }
            }
        }
    }

    /// Allocates and spawns a session for `item`, reattaching the free
    /// carryover resource when the keep-output policy asks for it.
    fn start_session(&self, state: &mut SchedulerState, item: ItemId) -> Result<(), StartError> {
        let descriptor = state
            .store
            .descriptor(item)
            .ok_or(StartError::NoDecoder)?;
        debug!("starting new item. id={} uri={}", item.raw(), descriptor.uri);
        let mut worker = self.factory.create(&descriptor)?;

        state.current_item = Some(item);
        let in_use = [item, state.current_node];
        state.store.purge_pending(&in_use);

        let keep_output = state.config.keep_output;
        let output = if keep_output {
            state.carryover.take()
        } else {
            None
        };
        let attached = output.is_some();
        if let Some(sink) = output {
            worker.attach_output(sink);
        }

        let wake = Arc::new(SchedulerWake {
            shared: Arc::clone(&self.shared),
        });
        let session = ActiveSession::spawn(item, worker, keep_output, attached, wake)?;
        if attached {
            state.activity += 1;
        }
        state.session = Some(session);
        Ok(())
    }

    /// Reaps the dead session. The worker join happens outside the shared
    /// lock so status readers are not blocked on it.
    fn reap_current<'a>(
        &'a self,
        mut st: MutexGuard<'a, SchedulerState>,
    ) -> MutexGuard<'a, SchedulerState> {
        let mut session = match st.session.take() {
            Some(session) => session,
            None => panic!("reap with no active session"),
        };
        drop(st);

        let detached = session.reap();
        let item = session.item();
        let had_carryover = session.carryover_attached();
        let reason = if session.lifecycle().is_error() {
            StopReason::Error
        } else if session.lifecycle().is_eof() {
            StopReason::Eof
        } else {
            StopReason::Requested
        };

        let mut st = self.shared.state.lock().unwrap();
        {
            let state = &mut *st;
            if had_carryover {
                assert!(state.activity > 0, "carryover activity counter underflow");
                state.activity -= 1;
            }
            if let Some(sink) = detached {
                assert!(
                    state.carryover.is_none(),
                    "carryover resource detached while one is already free"
                );
                state.carryover = Some(sink);
            }
        }
        debug!("session reaped. item={} reason={:?}", item.raw(), reason);
        let _ = self
            .shared
            .bus
            .send(Notification::ItemStopped { item, reason });
        st
    }
}
