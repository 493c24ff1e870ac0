use super::{await_condition, Param, ParamReader};
use crate::context::ExecutionContext;
use crate::error::ScanResult;
use crate::monitor::StepMonitor;
use crate::simulation::SimulationContext;
use crate::types::CommandDescriptor;
use std::sync::Arc;
use std::time::Duration;

pub(super) const DEFAULT_TOLERANCE: f64 = 0.1;

/// Completion settings shared by `set` and `loop`.
#[derive(Debug, Clone)]
pub(super) struct Completion {
    pub wait: bool,
    pub readback: String,
    pub tolerance: f64,
    pub timeout: Option<Duration>,
}

impl Completion {
    pub fn read(params: &ParamReader<'_>, channel: &str) -> ScanResult<Self> {
        Ok(Self {
            wait: params.bool_or("wait", true)?,
            readback: params
                .opt_string("readback")?
                .unwrap_or_else(|| channel.to_string()),
            tolerance: params
                .opt_non_negative("tolerance")?
                .unwrap_or(DEFAULT_TOLERANCE),
            timeout: params.opt_timeout("timeout")?,
        })
    }

    /// Write `value` and, when waiting, poll the readback until it settles.
    pub fn write_and_wait(
        &self,
        ctx: &ExecutionContext,
        monitor: &StepMonitor,
        channel: &str,
        value: f64,
    ) -> ScanResult<()> {
        ctx.write_value(channel, value)?;
        if !self.wait {
            return Ok(());
        }
        let tolerance = self.tolerance;
        await_condition(ctx, monitor, &self.readback, self.timeout, |v| {
            (v - value).abs() <= tolerance
        })
    }

    /// Estimated settle time; updates the simulated value either way.
    pub fn simulate_write(&self, sim: &mut SimulationContext, channel: &str, value: f64) -> f64 {
        let seconds = sim.simulate_change(channel, value);
        if self.readback != channel {
            sim.simulate_change(&self.readback, value);
        }
        if self.wait {
            seconds
        } else {
            0.0
        }
    }

    pub fn suffix(&self) -> String {
        if !self.wait {
            return String::new();
        }
        let mut s = format!(" (wait for '{}' ±{}", self.readback, self.tolerance);
        if let Some(t) = self.timeout {
            s.push_str(&format!(", timeout {} sec", t.as_secs_f64()));
        }
        s.push(')');
        s
    }
}

/// Writes a value and optionally waits for a readback to confirm it.
#[derive(Debug)]
pub struct SetCommand {
    channel: String,
    value: Param,
    completion: Completion,
    pub(super) monitor: Arc<StepMonitor>,
}

impl SetCommand {
    pub(super) fn compile(descriptor: &CommandDescriptor) -> ScanResult<Self> {
        let params = ParamReader::new(
            descriptor,
            &["channel", "value", "wait", "readback", "tolerance", "timeout"],
        )?;
        params.require_no_body()?;
        let channel = params.string("channel")?;
        let value = params.param("value")?;
        let completion = Completion::read(&params, &channel)?;
        let description = descriptor.label().map(String::from).unwrap_or_else(|| {
            format!("Set '{}' = {}{}", channel, value, completion.suffix())
        });
        Ok(Self {
            monitor: StepMonitor::new(description, completion.wait),
            channel,
            value,
            completion,
        })
    }

    pub(super) fn simulate(&self, sim: &mut SimulationContext) -> ScanResult<()> {
        let value = self.value.resolve_sim(sim)?;
        let seconds = self.completion.simulate_write(sim, &self.channel, value);
        sim.log_step(self.monitor.description(), seconds);
        Ok(())
    }

    pub(super) fn execute(&self, ctx: &ExecutionContext) -> ScanResult<()> {
        let value = self.value.resolve(ctx.evaluator())?;
        tracing::info!(channel = %self.channel, value, "set");
        self.completion
            .write_and_wait(ctx, &self.monitor, &self.channel, value)
    }
}
