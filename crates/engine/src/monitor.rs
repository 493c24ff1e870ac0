//! Cross-thread view of a running step.
//!
//! The worker thread is the only writer of a [`StepMonitor`]; the controlling
//! side reads its status and start timestamp and may release its latch.

use crate::types::{format_seconds, StepStatus};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

// ===========================================================================
// Release-once latch
// ===========================================================================

/// Single-use latch. Created per run attempt and never reset, so a release
/// aimed at one attempt cannot leak into the next.
#[derive(Debug, Default)]
pub struct Latch {
    released: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        let mut released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        *released = true;
        self.cond.notify_all();
    }

    pub fn is_released(&self) -> bool {
        *self.released.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until released or `timeout` elapses. Returns `true` if released.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |released| !*released)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

// ===========================================================================
// Step monitor
// ===========================================================================

#[derive(Debug)]
pub struct StepMonitor {
    description: String,
    skippable: bool,
    status: Mutex<StepStatus>,
    started: Mutex<Option<Instant>>,
    wait: Mutex<WaitSlot>,
}

/// Latch of the wait in progress, plus a skip that arrived while the step was
/// running but not yet waiting.
#[derive(Debug, Default)]
struct WaitSlot {
    latch: Option<Arc<Latch>>,
    skip_pending: bool,
}

impl StepMonitor {
    pub fn new(description: impl Into<String>, skippable: bool) -> Arc<Self> {
        Arc::new(Self {
            description: description.into(),
            skippable,
            status: Mutex::new(StepStatus::Idle),
            started: Mutex::new(None),
            wait: Mutex::new(WaitSlot::default()),
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_skippable(&self) -> bool {
        self.skippable
    }

    pub fn status(&self) -> StepStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if that is a forward transition. Returns whether it moved.
    pub fn advance(&self, next: StepStatus) -> bool {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if status.can_advance_to(next) {
            *status = next;
            true
        } else {
            tracing::debug!(
                step = %self.description,
                from = ?*status,
                to = ?next,
                "ignored backward status transition"
            );
            false
        }
    }

    /// Record the start timestamp and install a fresh latch for this attempt.
    /// A skip requested earlier in the same run releases it immediately.
    pub fn begin_wait(&self) -> Arc<Latch> {
        let latch = Arc::new(Latch::new());
        {
            let mut slot = self.wait.lock().unwrap_or_else(PoisonError::into_inner);
            if std::mem::take(&mut slot.skip_pending) {
                latch.release();
            }
            slot.latch = Some(latch.clone());
        }
        *self.started.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        latch
    }

    pub fn end_wait(&self) {
        *self.started.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.wait
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latch = None;
    }

    pub fn is_waiting(&self) -> bool {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|t| t.elapsed())
    }

    /// Release the current wait early. Ignored unless the step is skippable
    /// and running. A request that lands before the wait begins is held for
    /// the next `begin_wait`. Returns whether the request was accepted.
    pub fn request_early_completion(&self) -> bool {
        if !self.skippable || self.status() != StepStatus::Running {
            return false;
        }
        let mut slot = self.wait.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.latch.as_ref() {
            Some(latch) => latch.release(),
            None => slot.skip_pending = true,
        }
        true
    }

    /// Human-readable status, including elapsed time while waiting.
    pub fn describe(&self) -> String {
        match self.elapsed() {
            Some(elapsed) => format!(
                "{}. Elapsed: {}",
                self.description,
                format_seconds(elapsed.as_secs_f64())
            ),
            None => self.description.clone(),
        }
    }
}
