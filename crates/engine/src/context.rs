//! Execution context – per-run environment handed to every command runtime.
//!
//! Holds the live-I/O and expression collaborators plus the run-wide state
//! the sequencer shares with its controlling thread: the interruption
//! flags, the work counter, the active-step stack and the event bus.

use crate::error::{ScanError, ScanResult};
use crate::monitor::StepMonitor;
use crate::traits::{ExpressionEval, ValueIo};
use crate::types::ScanEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

// ===========================================================================
// Run control flags
// ===========================================================================

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    paused: bool,
    aborted: bool,
}

/// Pause and abort requests, written by the controlling thread and polled by
/// the worker at safe points.
#[derive(Debug, Default)]
pub struct RunControl {
    flags: Mutex<Flags>,
    cond: Condvar,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn flags(&self) -> Flags {
        *self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_paused(&self) -> bool {
        self.flags().paused
    }

    pub fn is_aborted(&self) -> bool {
        self.flags().aborted
    }

    pub fn pause(&self) {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner).paused = true;
        self.cond.notify_all();
    }

    pub fn resume(&self) {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner).paused = false;
        self.cond.notify_all();
    }

    pub fn abort(&self) {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner).aborted = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.flags.lock().unwrap_or_else(PoisonError::into_inner) = Flags::default();
        self.cond.notify_all();
    }

    /// Block while paused. Returns `Interrupted` once an abort is requested.
    pub fn wait_while_paused(&self) -> ScanResult<()> {
        let guard = self.flags.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = self
            .cond
            .wait_while(guard, |f| f.paused && !f.aborted)
            .unwrap_or_else(PoisonError::into_inner);
        if guard.aborted {
            Err(ScanError::Interrupted)
        } else {
            Ok(())
        }
    }
}

// ===========================================================================
// Work counter
// ===========================================================================

/// Monotonic count of work units performed in the current run.
#[derive(Debug, Default)]
pub struct WorkCounter {
    performed: AtomicU64,
    total: AtomicU64,
}

impl WorkCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self, total: u64) {
        self.performed.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    /// Add `n` units and return the new count.
    pub fn add(&self, n: u64) -> u64 {
        self.performed.fetch_add(n, Ordering::SeqCst) + n
    }

    pub fn performed(&self) -> u64 {
        self.performed.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn fraction(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.performed() as f64 / total as f64).min(1.0)
    }
}

// ===========================================================================
// Active step stack
// ===========================================================================

/// Monitors of the runtimes currently inside `execute`, outermost first.
/// Composite commands push their children, so the last entry is the step
/// that control signals should reach.
#[derive(Debug, Default)]
pub struct ActiveSteps {
    stack: Mutex<Vec<Arc<StepMonitor>>>,
}

impl ActiveSteps {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, monitor: Arc<StepMonitor>) {
        self.stack
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(monitor);
    }

    fn pop(&self) {
        self.stack.lock().unwrap_or_else(PoisonError::into_inner).pop();
    }

    pub fn innermost(&self) -> Option<Arc<StepMonitor>> {
        self.stack
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn depth(&self) -> usize {
        self.stack.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn clear(&self) {
        self.stack.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Pops the monitor pushed by [`ExecutionContext::enter`] when dropped.
pub struct ActiveGuard<'a> {
    active: &'a ActiveSteps,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.pop();
    }
}

// ===========================================================================
// Event bus
// ===========================================================================

#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ScanEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ScanEvent> {
        let (tx, rx) = channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver to every live subscriber; dropped receivers are pruned.
    pub fn publish(&self, event: ScanEvent) {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

// ===========================================================================
// Execution context
// ===========================================================================

/// Central context passed to every runtime's `execute`.
pub struct ExecutionContext {
    io: Arc<dyn ValueIo>,
    eval: Arc<dyn ExpressionEval>,
    control: Arc<RunControl>,
    work: Arc<WorkCounter>,
    active: Arc<ActiveSteps>,
    events: Arc<EventBus>,
    poll_interval: Duration,
}

impl ExecutionContext {
    pub fn new(io: Arc<dyn ValueIo>, eval: Arc<dyn ExpressionEval>) -> Self {
        Self {
            io,
            eval,
            control: Arc::new(RunControl::new()),
            work: Arc::new(WorkCounter::new()),
            active: Arc::new(ActiveSteps::new()),
            events: Arc::new(EventBus::new()),
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Share run-wide state owned by a sequencer.
    pub(crate) fn with_shared(
        mut self,
        control: Arc<RunControl>,
        work: Arc<WorkCounter>,
        active: Arc<ActiveSteps>,
        events: Arc<EventBus>,
    ) -> Self {
        self.control = control;
        self.work = work;
        self.active = active;
        self.events = events;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn work(&self) -> &WorkCounter {
        &self.work
    }

    pub fn active(&self) -> &ActiveSteps {
        &self.active
    }

    /// Non-blocking poll: has an abort been requested?
    pub fn check_interrupted(&self) -> bool {
        self.control.is_aborted()
    }

    /// Safe point: blocks while paused, fails with `Interrupted` on abort.
    pub fn checkpoint(&self) -> ScanResult<()> {
        if self.control.is_paused() {
            tracing::debug!("paused at safe point");
        }
        self.control.wait_while_paused()
    }

    pub fn work_performed(&self, n: u64) {
        let performed = self.work.add(n);
        self.events.publish(ScanEvent::WorkPerformed {
            performed,
            total: self.work.total(),
        });
    }

    pub fn read_value(&self, channel: &str) -> ScanResult<f64> {
        self.io
            .read(channel)
            .map_err(|e| ScanError::live_io(channel, e))
    }

    pub fn write_value(&self, channel: &str, value: f64) -> ScanResult<()> {
        tracing::debug!(channel, value, "write");
        self.io
            .write(channel, value)
            .map_err(|e| ScanError::live_io(channel, e))
    }

    pub fn evaluate(&self, expression: &str) -> ScanResult<f64> {
        Ok(self.eval.evaluate(expression)?)
    }

    pub fn evaluator(&self) -> &dyn ExpressionEval {
        self.eval.as_ref()
    }

    /// Mark `monitor` as the innermost active step until the guard drops.
    pub fn enter(&self, monitor: Arc<StepMonitor>) -> ActiveGuard<'_> {
        self.active.push(monitor);
        ActiveGuard {
            active: &self.active,
        }
    }
}
