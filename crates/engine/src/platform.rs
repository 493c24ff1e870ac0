//! Bundled implementations of the collaborator traits.
//!
//! - [`MemoryProcess`]: in-memory channels, optionally ramping toward a
//!   written target at a fixed slew rate
//! - [`LiteralEvaluator`]: numeric literals only

use crate::traits::*;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

// ===========================================================================
// In-memory process
// ===========================================================================

#[derive(Debug, Clone)]
struct Channel {
    /// Value at `since`.
    origin: f64,
    target: f64,
    /// Units per second. `None` means writes take effect immediately.
    slew_rate: Option<f64>,
    since: Instant,
}

impl Channel {
    fn current(&self, now: Instant) -> f64 {
        match self.slew_rate {
            Some(rate) if rate > 0.0 => {
                let travelled = rate * now.duration_since(self.since).as_secs_f64();
                let distance = self.target - self.origin;
                if travelled >= distance.abs() {
                    self.target
                } else {
                    self.origin + travelled * distance.signum()
                }
            }
            _ => self.target,
        }
    }
}

/// A process simulator holding named numeric channels.
///
/// Reads and writes on undeclared channels fail with
/// [`LiveIoError::UnknownChannel`].
#[derive(Debug, Default)]
pub struct MemoryProcess {
    channels: Mutex<HashMap<String, Channel>>,
}

impl MemoryProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a channel with an initial value and optional slew rate.
    pub fn with_channel(self, name: &str, initial: f64, slew_rate: Option<f64>) -> Self {
        self.declare(name, initial, slew_rate);
        self
    }

    pub fn declare(&self, name: &str, initial: f64, slew_rate: Option<f64>) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.insert(
            name.to_string(),
            Channel {
                origin: initial,
                target: initial,
                slew_rate,
                since: Instant::now(),
            },
        );
    }

    /// Sorted channel names.
    pub fn list(&self) -> Vec<String> {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = channels.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ValueIo for MemoryProcess {
    fn read(&self, channel: &str) -> IoResult<f64> {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .get(channel)
            .map(|c| c.current(Instant::now()))
            .ok_or_else(|| LiveIoError::UnknownChannel(channel.to_string()))
    }

    fn write(&self, channel: &str, value: f64) -> IoResult<()> {
        if !value.is_finite() {
            return Err(LiveIoError::TypeMismatch(format!(
                "{} cannot hold non-finite value {}",
                channel, value
            )));
        }
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = channels
            .get_mut(channel)
            .ok_or_else(|| LiveIoError::UnknownChannel(channel.to_string()))?;
        let now = Instant::now();
        entry.origin = entry.current(now);
        entry.target = value;
        entry.since = now;
        Ok(())
    }
}

// ===========================================================================
// Literal evaluator
// ===========================================================================

/// Accepts numeric literals only. A scripting binding replaces this when
/// descriptors carry real formulas.
pub struct LiteralEvaluator;

impl ExpressionEval for LiteralEvaluator {
    fn evaluate(&self, expression: &str) -> Result<f64, EvalError> {
        expression
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| EvalError {
                expression: expression.to_string(),
                reason: "not a numeric literal".into(),
            })
    }
}
