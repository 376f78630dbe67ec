//! Active playback session supervision.
//!
//! A session is one worker thread bound to one item, owning the decode+output
//! pipeline for it. The supervisor reads back lifecycle flags and nothing
//! else; stopping is cooperative and teardown waits for the worker to exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;

use crate::item::{ItemDescriptor, ItemId};

/// Worker allocation failures. Both make the scheduler skip to the next item
/// rather than halt.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    #[error("no worker backend can play this item")]
    NoDecoder,
    #[error("worker allocation failed")]
    ResourceExhausted,
}

/// How a worker's run loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// End of stream reached.
    Eof,
    /// Unrecoverable decode/output error.
    Error,
    /// The worker observed an external stop request and unwound.
    Stopped,
}

/// Downstream output pipeline that can survive a session boundary instead of
/// being recreated per item.
pub trait OutputSink: Send {
    /// Flush buffered output before handoff or teardown.
    fn drain(&mut self) {}
}

/// Decode+output worker bound to a single item.
pub trait PlaybackWorker: Send {
    /// Plays until EOF, an unrecoverable error, or `control.stop_requested()`.
    fn run(&mut self, control: &WorkerControl) -> WorkerOutcome;

    /// Hands the worker a previously detached output pipeline to reuse.
    /// Called at most once, before `run`.
    fn attach_output(&mut self, sink: Box<dyn OutputSink>);

    /// Transfers the downstream pipeline out of the worker after `run`
    /// returned, if it kept one alive.
    fn release_output(&mut self) -> Option<Box<dyn OutputSink>>;
}

/// Creates workers for items — the registry of available decode backends.
pub trait WorkerFactory: Send + Sync {
    fn create(&self, item: &ItemDescriptor) -> Result<Box<dyn PlaybackWorker>, StartError>;
}

/// Signals the supervisory loop that a lifecycle flag changed.
pub trait WakeSignal: Send + Sync + 'static {
    fn wake(&self);
}

/// Monotonic worker lifecycle flags, shared between the supervisor, the
/// worker thread, and external session handles.
#[derive(Debug, Default)]
pub struct SessionLifecycle {
    running: AtomicBool,
    eof: AtomicBool,
    error: AtomicBool,
    dying: AtomicBool,
    dead: AtomicBool,
}

impl SessionLifecycle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    fn mark_running(&self) {
        self.running.store(true, Ordering::Release);
    }

    fn mark_eof(&self) {
        self.eof.store(true, Ordering::Release);
    }

    fn mark_error(&self) {
        self.error.store(true, Ordering::Release);
    }

    /// Returns whether this call was the first stop request.
    fn mark_dying(&self) -> bool {
        !self.dying.swap(true, Ordering::AcqRel)
    }

    fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }
}

/// Worker-facing control surface.
pub struct WorkerControl {
    lifecycle: Arc<SessionLifecycle>,
}

impl WorkerControl {
    /// Whether the supervisor asked the worker to unwind.
    pub fn stop_requested(&self) -> bool {
        self.lifecycle.is_dying()
    }

    /// Marks the session as producing output (starting → running).
    pub fn mark_running(&self) {
        self.lifecycle.mark_running();
    }
}

/// Cloneable external view of a session. Keeps the lifecycle readable
/// independently of the supervisor's teardown authority.
#[derive(Clone)]
pub struct SessionHandle {
    item: ItemId,
    lifecycle: Arc<SessionLifecycle>,
}

impl SessionHandle {
    pub fn item(&self) -> ItemId {
        self.item
    }

    pub fn lifecycle(&self) -> &SessionLifecycle {
        &self.lifecycle
    }
}

// Worker-side wait for the supervisor's stop request after a terminal
// condition; bounded poll, the supervisor reacts within one tick.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Supervisor-owned handle to the one live worker.
pub struct ActiveSession {
    item: ItemId,
    lifecycle: Arc<SessionLifecycle>,
    join: Option<JoinHandle<Option<Box<dyn OutputSink>>>>,
    carryover_attached: bool,
}

impl ActiveSession {
    /// Spawns the worker thread for `item`. `carryover_attached` records
    /// whether a detached output pipeline was re-attached before start.
    pub fn spawn(
        item: ItemId,
        worker: Box<dyn PlaybackWorker>,
        keep_output: bool,
        carryover_attached: bool,
        wake: Arc<dyn WakeSignal>,
    ) -> Result<Self, StartError> {
        let lifecycle = Arc::new(SessionLifecycle::default());
        let thread_lifecycle = Arc::clone(&lifecycle);
        let join = thread::Builder::new()
            .name(format!("session-{}", item.raw()))
            .spawn(move || worker_main(worker, thread_lifecycle, keep_output, wake))
            .map_err(|err| {
                warn!("failed to spawn session worker thread: {}", err);
                StartError::ResourceExhausted
            })?;
        debug!(
            "session started. item={} carryover={}",
            item.raw(),
            carryover_attached
        );
        Ok(Self {
            item,
            lifecycle,
            join: Some(join),
            carryover_attached,
        })
    }

    pub fn item(&self) -> ItemId {
        self.item
    }

    pub fn lifecycle(&self) -> &SessionLifecycle {
        &self.lifecycle
    }

    /// External shared handle for this session.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            item: self.item,
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }

    pub fn carryover_attached(&self) -> bool {
        self.carryover_attached
    }

    /// Asks the worker to begin shutdown. Never blocks; duplicate requests
    /// are no-ops.
    pub fn request_stop(&self) {
        if self.lifecycle.mark_dying() {
            debug!("stop requested. item={}", self.item.raw());
        }
    }

    /// Joins the worker and returns the detached output pipeline, if any.
    ///
    /// Must only be called after the lifecycle reports dead; calling earlier,
    /// or twice, indicates scheduler corruption and panics. The join is
    /// expected to return promptly because `dead` is the last thing the
    /// worker sets before exiting.
    pub fn reap(&mut self) -> Option<Box<dyn OutputSink>> {
        assert!(
            self.lifecycle.is_dead(),
            "reap called before session {} died",
            self.item.raw()
        );
        let join = match self.join.take() {
            Some(join) => join,
            None => panic!("session {} reaped twice", self.item.raw()),
        };
        match join.join() {
            Ok(detached) => detached,
            Err(_) => {
                warn!("session worker panicked during teardown. item={}", self.item.raw());
                None
            }
        }
    }

    /// Whether the session has already been reaped.
    pub fn reaped(&self) -> bool {
        self.join.is_none()
    }
}

fn worker_main(
    mut worker: Box<dyn PlaybackWorker>,
    lifecycle: Arc<SessionLifecycle>,
    keep_output: bool,
    wake: Arc<dyn WakeSignal>,
) -> Option<Box<dyn OutputSink>> {
    let control = WorkerControl {
        lifecycle: Arc::clone(&lifecycle),
    };
    match worker.run(&control) {
        WorkerOutcome::Eof => lifecycle.mark_eof(),
        WorkerOutcome::Error => lifecycle.mark_error(),
        WorkerOutcome::Stopped => {}
    }
    wake.wake();

    // The supervisor turns eof/error into a stop request; the worker must
    // hold its resources until that arrives.
    while !lifecycle.is_dying() {
        thread::sleep(STOP_POLL_INTERVAL);
    }

    let mut detached = if keep_output {
        worker.release_output()
    } else {
        None
    };
    if let Some(sink) = detached.as_mut() {
        sink.drain();
    }
    drop(worker);
    lifecycle.mark_dead();
    wake.wake();
    detached
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct NullWake;

    impl WakeSignal for NullWake {
        fn wake(&self) {}
    }

    struct CountingWake(AtomicUsize);

    impl WakeSignal for CountingWake {
        fn wake(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NullSink;

    impl OutputSink for NullSink {}

    /// Worker that finishes with a fixed outcome, or runs until stopped when
    /// `outcome` is `Stopped`.
    struct ScriptedWorker {
        outcome: WorkerOutcome,
        sink: Option<Box<dyn OutputSink>>,
    }

    impl ScriptedWorker {
        fn new(outcome: WorkerOutcome) -> Box<Self> {
            Box::new(Self {
                outcome,
                sink: Some(Box::new(NullSink)),
            })
        }
    }

    impl PlaybackWorker for ScriptedWorker {
        fn run(&mut self, control: &WorkerControl) -> WorkerOutcome {
            control.mark_running();
            if self.outcome == WorkerOutcome::Stopped {
                while !control.stop_requested() {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            self.outcome
        }

        fn attach_output(&mut self, sink: Box<dyn OutputSink>) {
            self.sink = Some(sink);
        }

        fn release_output(&mut self) -> Option<Box<dyn OutputSink>> {
            self.sink.take()
        }
    }

    fn test_item() -> ItemId {
        let mut store = crate::item::ItemStore::new();
        let root = store.root_onelevel();
        store.add_leaf(root, "test").unwrap()
    }

    fn wait_until<F: Fn() -> bool>(timeout: Duration, predicate: F) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn eof_worker_waits_for_stop_before_dying() {
        let item = test_item();
        let mut session = ActiveSession::spawn(
            item,
            ScriptedWorker::new(WorkerOutcome::Eof),
            false,
            false,
            Arc::new(NullWake),
        )
        .unwrap();

        assert!(wait_until(Duration::from_secs(1), || session
            .lifecycle()
            .is_eof()));
        // Terminal on its own, but not dead until asked to stop.
        thread::sleep(Duration::from_millis(20));
        assert!(!session.lifecycle().is_dead());

        session.request_stop();
        assert!(wait_until(Duration::from_secs(1), || session
            .lifecycle()
            .is_dead()));
        assert!(session.reap().is_none());
    }

    #[test]
    fn stop_is_idempotent() {
        let item = test_item();
        let mut session = ActiveSession::spawn(
            item,
            ScriptedWorker::new(WorkerOutcome::Stopped),
            false,
            false,
            Arc::new(NullWake),
        )
        .unwrap();

        assert!(wait_until(Duration::from_secs(1), || session
            .lifecycle()
            .is_running()));
        session.request_stop();
        session.request_stop();
        assert!(wait_until(Duration::from_secs(1), || session
            .lifecycle()
            .is_dead()));
        assert!(!session.lifecycle().is_eof());
        assert!(!session.lifecycle().is_error());
        session.reap();
    }

    #[test]
    fn keep_output_returns_detached_sink() {
        let item = test_item();
        let mut session = ActiveSession::spawn(
            item,
            ScriptedWorker::new(WorkerOutcome::Eof),
            true,
            false,
            Arc::new(NullWake),
        )
        .unwrap();

        session.request_stop();
        assert!(wait_until(Duration::from_secs(1), || session
            .lifecycle()
            .is_dead()));
        assert!(session.reap().is_some());
    }

    #[test]
    fn terminal_flags_wake_the_supervisor() {
        let item = test_item();
        let wake = Arc::new(CountingWake(AtomicUsize::new(0)));
        let session = ActiveSession::spawn(
            item,
            ScriptedWorker::new(WorkerOutcome::Error),
            false,
            false,
            Arc::clone(&wake) as Arc<dyn WakeSignal>,
        )
        .unwrap();

        assert!(wait_until(Duration::from_secs(1), || session
            .lifecycle()
            .is_error()));
        assert!(wake.0.load(Ordering::SeqCst) >= 1);
        session.request_stop();
        assert!(wait_until(Duration::from_secs(1), || session
            .lifecycle()
            .is_dead()));
    }

    #[test]
    #[should_panic(expected = "reap called before session")]
    fn reap_before_dead_panics() {
        let item = test_item();
        let mut session = ActiveSession::spawn(
            item,
            ScriptedWorker::new(WorkerOutcome::Stopped),
            false,
            false,
            Arc::new(NullWake),
        )
        .unwrap();
        let _ = session.reap();
    }

    #[test]
    #[should_panic(expected = "reaped twice")]
    fn double_reap_panics() {
        let item = test_item();
        let mut session = ActiveSession::spawn(
            item,
            ScriptedWorker::new(WorkerOutcome::Eof),
            false,
            false,
            Arc::new(NullWake),
        )
        .unwrap();
        session.request_stop();
        assert!(wait_until(Duration::from_secs(1), || session
            .lifecycle()
            .is_dead()));
        let _ = session.reap();
        let _ = session.reap();
    }
}
