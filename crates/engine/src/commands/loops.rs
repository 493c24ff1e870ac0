use super::set::Completion;
use super::{compile_all, total_work_units, ParamReader};
use crate::context::ExecutionContext;
use crate::error::ScanResult;
use crate::monitor::StepMonitor;
use crate::simulation::SimulationContext;
use crate::types::CommandDescriptor;
use std::sync::Arc;

/// Absorbs rounding in `(end - start) / step` so the end point is included.
const ITERATION_EPSILON: f64 = 1e-9;

/// Upper bound on the values a single loop may step through.
pub const MAX_ITERATIONS: u64 = 1_000_000;

/// Steps a channel from `start` to `end`, running the body at each value.
///
/// The body is compiled afresh for every iteration: runtimes never run twice.
#[derive(Debug)]
pub struct LoopCommand {
    channel: String,
    start: f64,
    end: f64,
    step: f64,
    completion: Completion,
    body: Vec<CommandDescriptor>,
    iterations: u64,
    work_units: u64,
    pub(super) monitor: Arc<StepMonitor>,
}

impl LoopCommand {
    pub(super) fn compile(descriptor: &CommandDescriptor) -> ScanResult<Self> {
        let params = ParamReader::new(
            descriptor,
            &[
                "channel", "start", "end", "step", "wait", "readback", "tolerance", "timeout",
            ],
        )?;
        let channel = params.string("channel")?;
        let start = params.f64("start")?;
        let end = params.f64("end")?;
        let step = params.f64("step")?;
        if step == 0.0 {
            return Err(params.invalid("step must not be 0"));
        }
        let completion = Completion::read(&params, &channel)?;
        let iterations = iteration_count(start, end, step).ok_or_else(|| {
            params.invalid(format!(
                "{} .. {} step {} exceeds {} iterations",
                start, end, step, MAX_ITERATIONS
            ))
        })?;
        let work_units = total_work_units(&compile_all(descriptor.body())?)
            .and_then(|body| body.checked_add(1))
            .and_then(|per_value| per_value.checked_mul(iterations))
            .ok_or_else(|| params.invalid("total work overflows"))?;

        let description = descriptor.label().map(String::from).unwrap_or_else(|| {
            format!(
                "Loop '{}' = {} .. {} step {}{}",
                channel,
                start,
                end,
                step,
                completion.suffix()
            )
        });
        Ok(Self {
            channel,
            start,
            end,
            step,
            completion,
            body: descriptor.body().to_vec(),
            iterations,
            work_units,
            monitor: StepMonitor::new(description, false),
        })
    }

    /// Number of loop values. Zero when `step` points away from `end`.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.iterations()).map(move |i| self.start + i as f64 * self.step)
    }

    pub(super) fn work_units(&self) -> u64 {
        self.work_units
    }

    pub(super) fn simulate(&self, sim: &mut SimulationContext) -> ScanResult<()> {
        for value in self.values() {
            let seconds = self.completion.simulate_write(sim, &self.channel, value);
            sim.log_step(format!("Loop '{}' = {}", self.channel, value), seconds);
            for mut runtime in compile_all(&self.body)? {
                runtime.simulate(sim)?;
            }
        }
        Ok(())
    }

    pub(super) fn execute(&self, ctx: &ExecutionContext) -> ScanResult<()> {
        for value in self.values() {
            ctx.checkpoint()?;
            tracing::info!(channel = %self.channel, value, "loop");
            self.completion
                .write_and_wait(ctx, &self.monitor, &self.channel, value)?;
            ctx.work_performed(1);
            for mut runtime in compile_all(&self.body)? {
                ctx.checkpoint()?;
                runtime.execute(ctx)?;
            }
        }
        Ok(())
    }
}

/// `None` when the span is not finite or exceeds [`MAX_ITERATIONS`].
fn iteration_count(start: f64, end: f64, step: f64) -> Option<u64> {
    let span = (end - start) / step;
    if !span.is_finite() {
        return None;
    }
    if span < -ITERATION_EPSILON {
        return Some(0);
    }
    let span = (span + ITERATION_EPSILON).floor();
    if span >= MAX_ITERATIONS as f64 {
        return None;
    }
    Some(span as u64 + 1)
}
