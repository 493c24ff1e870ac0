//! Dry-run environment. Accumulates estimated cost and a textual trace
//! without ever touching live values.

use crate::error::ScanResult;
use crate::traits::ExpressionEval;
use crate::types::SimulationStep;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// What the estimator knows about a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulatedChannel {
    #[serde(default)]
    pub initial: Option<f64>,
    /// Units per second. `None` means the channel moves instantly.
    #[serde(default)]
    pub slew_rate: Option<f64>,
}

/// Static inputs for a simulation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationProfile {
    #[serde(default)]
    pub channels: HashMap<String, SimulatedChannel>,
    /// Used only for channels missing from `channels`. `None` means instant.
    #[serde(default)]
    pub default_slew_rate: Option<f64>,
}

impl SimulationProfile {
    pub fn with_channel(mut self, name: &str, initial: Option<f64>, slew_rate: Option<f64>) -> Self {
        self.channels
            .insert(name.to_string(), SimulatedChannel { initial, slew_rate });
        self
    }

    fn slew_rate(&self, channel: &str) -> Option<f64> {
        match self.channels.get(channel) {
            Some(declared) => declared.slew_rate,
            None => self.default_slew_rate,
        }
        .filter(|r| *r > 0.0)
    }
}

pub struct SimulationContext {
    profile: SimulationProfile,
    eval: Arc<dyn ExpressionEval>,
    values: HashMap<String, f64>,
    steps: Vec<SimulationStep>,
    total_seconds: f64,
}

impl SimulationContext {
    pub fn new(profile: SimulationProfile, eval: Arc<dyn ExpressionEval>) -> Self {
        let values = profile
            .channels
            .iter()
            .filter_map(|(name, c)| c.initial.map(|v| (name.clone(), v)))
            .collect();
        Self {
            profile,
            eval,
            values,
            steps: Vec::new(),
            total_seconds: 0.0,
        }
    }

    /// Append to the trace and add to the running total.
    pub fn log_step(&mut self, label: impl Into<String>, estimated_seconds: f64) {
        let label = label.into();
        tracing::debug!(step = %label, seconds = estimated_seconds, "simulated");
        self.total_seconds += estimated_seconds;
        self.steps.push(SimulationStep {
            label,
            seconds: estimated_seconds,
        });
    }

    /// Accumulated estimate so far; valid mid-pass.
    pub fn total_estimated_seconds(&self) -> f64 {
        self.total_seconds
    }

    pub fn steps(&self) -> &[SimulationStep] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<SimulationStep> {
        self.steps
    }

    pub fn evaluate(&self, expression: &str) -> ScanResult<f64> {
        Ok(self.eval.evaluate(expression)?)
    }

    pub fn simulated_value(&self, channel: &str) -> Option<f64> {
        self.values.get(channel).copied()
    }

    /// Record a simulated write and return the estimated time for the
    /// channel to reach `value`. Unknown start values or slew rates cost 0.
    pub fn simulate_change(&mut self, channel: &str, value: f64) -> f64 {
        let seconds = match (self.values.get(channel), self.profile.slew_rate(channel)) {
            (Some(old), Some(rate)) => (value - old).abs() / rate,
            _ => 0.0,
        };
        self.values.insert(channel.to_string(), value);
        seconds
    }
}
