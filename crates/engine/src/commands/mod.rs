//! Command runtimes and descriptor compilation.
//!
//! Every supported kind is a variant of [`CommandRuntime`]. Descriptors are
//! compiled into runtimes by [`compile`]; an unrecognised kind rejects the
//! whole sequence.

mod delay;
mod group;
mod loops;
mod set;
mod wait;

pub use delay::DelayCommand;
pub use group::{CommentCommand, GroupCommand};
pub use loops::{LoopCommand, MAX_ITERATIONS};
pub use set::SetCommand;
pub use wait::{Comparison, WaitCommand};

use crate::context::ExecutionContext;
use crate::error::{ScanError, ScanResult};
use crate::monitor::StepMonitor;
use crate::simulation::SimulationContext;
use crate::traits::ExpressionEval;
use crate::types::{CommandDescriptor, StepStatus};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ===========================================================================
// Compilation
// ===========================================================================

pub fn compile(descriptor: &CommandDescriptor) -> ScanResult<CommandRuntime> {
    let runtime = match descriptor.kind() {
        "delay" => CommandRuntime::Delay(DelayCommand::compile(descriptor)?),
        "set" => CommandRuntime::Set(SetCommand::compile(descriptor)?),
        "wait" => CommandRuntime::Wait(WaitCommand::compile(descriptor)?),
        "loop" => CommandRuntime::Loop(LoopCommand::compile(descriptor)?),
        "comment" => CommandRuntime::Comment(CommentCommand::compile(descriptor)?),
        "group" => CommandRuntime::Group(GroupCommand::compile(descriptor)?),
        other => return Err(ScanError::Compilation(other.to_string())),
    };
    Ok(runtime)
}

pub fn compile_all(descriptors: &[CommandDescriptor]) -> ScanResult<Vec<CommandRuntime>> {
    descriptors.iter().map(compile).collect()
}

// ===========================================================================
// Runtime
// ===========================================================================

/// Executable counterpart of one descriptor, valid for a single run.
#[derive(Debug)]
pub enum CommandRuntime {
    Delay(DelayCommand),
    Set(SetCommand),
    Wait(WaitCommand),
    Loop(LoopCommand),
    Comment(CommentCommand),
    Group(GroupCommand),
}

impl CommandRuntime {
    pub fn monitor(&self) -> &Arc<StepMonitor> {
        match self {
            CommandRuntime::Delay(c) => &c.monitor,
            CommandRuntime::Set(c) => &c.monitor,
            CommandRuntime::Wait(c) => &c.monitor,
            CommandRuntime::Loop(c) => &c.monitor,
            CommandRuntime::Comment(c) => &c.monitor,
            CommandRuntime::Group(c) => &c.monitor,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CommandRuntime::Delay(_) => "delay",
            CommandRuntime::Set(_) => "set",
            CommandRuntime::Wait(_) => "wait",
            CommandRuntime::Loop(_) => "loop",
            CommandRuntime::Comment(_) => "comment",
            CommandRuntime::Group(_) => "group",
        }
    }

    pub fn status(&self) -> StepStatus {
        self.monitor().status()
    }

    pub fn describe(&self) -> String {
        self.monitor().describe()
    }

    /// Units this runtime reports through `work_performed` on success.
    pub fn work_units(&self) -> u64 {
        match self {
            CommandRuntime::Loop(c) => c.work_units(),
            CommandRuntime::Group(c) => c.work_units(),
            _ => 1,
        }
    }

    fn is_composite(&self) -> bool {
        matches!(self, CommandRuntime::Loop(_) | CommandRuntime::Group(_))
    }

    /// Record an estimated cost. Never blocks and never touches live values.
    pub fn simulate(&mut self, sim: &mut SimulationContext) -> ScanResult<()> {
        self.monitor().advance(StepStatus::Simulated);
        match self {
            CommandRuntime::Delay(c) => c.simulate(sim),
            CommandRuntime::Set(c) => c.simulate(sim),
            CommandRuntime::Wait(c) => c.simulate(sim),
            CommandRuntime::Loop(c) => c.simulate(sim),
            CommandRuntime::Comment(c) => c.simulate(sim),
            CommandRuntime::Group(c) => c.simulate(sim),
        }
    }

    /// Perform the real action, blocking until it completes, fails or is
    /// interrupted.
    pub fn execute(&mut self, ctx: &ExecutionContext) -> ScanResult<()> {
        let monitor = self.monitor().clone();
        if !monitor.advance(StepStatus::Running) {
            return Err(ScanError::Busy(format!(
                "'{}' is {:?} and cannot run again",
                monitor.description(),
                monitor.status()
            )));
        }
        let _active = ctx.enter(monitor.clone());
        tracing::debug!(kind = self.kind(), step = %monitor.description(), "execute");

        let result = match self {
            CommandRuntime::Delay(c) => c.execute(ctx),
            CommandRuntime::Set(c) => c.execute(ctx),
            CommandRuntime::Wait(c) => c.execute(ctx),
            CommandRuntime::Loop(c) => c.execute(ctx),
            CommandRuntime::Comment(c) => c.execute(ctx),
            CommandRuntime::Group(c) => c.execute(ctx),
        };

        match &result {
            Ok(()) => {
                monitor.advance(StepStatus::Completed);
                if !self.is_composite() {
                    ctx.work_performed(1);
                }
            }
            Err(ScanError::Interrupted) => {
                monitor.advance(StepStatus::Aborted);
            }
            Err(e) => {
                tracing::warn!(step = %monitor.description(), error = %e, "command failed");
                monitor.advance(StepStatus::Failed);
            }
        }
        result
    }

    /// Ask a waiting command to finish now. No-op for kinds without a wait
    /// phase or when not running.
    pub fn request_early_completion(&self) -> bool {
        self.monitor().request_early_completion()
    }
}

// ===========================================================================
// Parameters
// ===========================================================================

/// A numeric parameter given either literally or as an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Value(f64),
    Expr(String),
}

impl Param {
    pub fn resolve(&self, eval: &dyn ExpressionEval) -> ScanResult<f64> {
        match self {
            Param::Value(v) => Ok(*v),
            Param::Expr(e) => Ok(eval.evaluate(e)?),
        }
    }

    /// Same as [`Param::resolve`], through the simulation's evaluator.
    pub fn resolve_sim(&self, sim: &SimulationContext) -> ScanResult<f64> {
        match self {
            Param::Value(v) => Ok(*v),
            Param::Expr(e) => sim.evaluate(e),
        }
    }
}

impl std::fmt::Display for Param {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Param::Value(v) => write!(f, "{}", v),
            Param::Expr(e) => write!(f, "`{}`", e),
        }
    }
}

/// Typed access to a descriptor's parameters. Every failure is a
/// validation error naming the command kind.
pub(crate) struct ParamReader<'a> {
    descriptor: &'a CommandDescriptor,
}

impl<'a> ParamReader<'a> {
    pub fn new(descriptor: &'a CommandDescriptor, known: &[&str]) -> ScanResult<Self> {
        let reader = Self { descriptor };
        if let Some(unknown) = descriptor.params().keys().find(|k| !known.contains(&k.as_str())) {
            return Err(reader.invalid(format!("unknown parameter '{}'", unknown)));
        }
        Ok(reader)
    }

    fn kind(&self) -> &str {
        self.descriptor.kind()
    }

    pub fn invalid(&self, message: impl Into<String>) -> ScanError {
        ScanError::validation(self.kind(), message)
    }

    pub fn require_no_body(&self) -> ScanResult<()> {
        if self.descriptor.body().is_empty() {
            Ok(())
        } else {
            Err(self.invalid("does not take a body"))
        }
    }

    pub fn f64(&self, name: &str) -> ScanResult<f64> {
        self.opt_f64(name)?
            .ok_or_else(|| self.invalid(format!("missing '{}' number", name)))
    }

    pub fn opt_f64(&self, name: &str) -> ScanResult<Option<f64>> {
        match self.descriptor.param(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => match n.as_f64().filter(|v| v.is_finite()) {
                Some(v) => Ok(Some(v)),
                None => Err(self.invalid(format!("'{}' is not a finite number", name))),
            },
            Some(other) => Err(self.invalid(format!("'{}' must be a number, got {}", name, other))),
        }
    }

    /// Non-negative number of seconds that fits a [`Duration`].
    pub fn duration(&self, name: &str) -> ScanResult<Duration> {
        let seconds = self.opt_non_negative(name)?.unwrap_or(0.0);
        Duration::try_from_secs_f64(seconds)
            .map_err(|_| self.invalid(format!("'{}' of {} sec is out of range", name, seconds)))
    }

    /// Timeouts of 0 or absent mean "wait indefinitely".
    pub fn opt_timeout(&self, name: &str) -> ScanResult<Option<Duration>> {
        let timeout = self.duration(name)?;
        Ok((!timeout.is_zero()).then_some(timeout))
    }

    /// Optional non-negative number.
    pub fn opt_non_negative(&self, name: &str) -> ScanResult<Option<f64>> {
        match self.opt_f64(name)? {
            Some(v) if v < 0.0 => Err(self.invalid(format!("'{}' must be >= 0, got {}", name, v))),
            other => Ok(other),
        }
    }

    pub fn string(&self, name: &str) -> ScanResult<String> {
        self.opt_string(name)?
            .ok_or_else(|| self.invalid(format!("missing '{}' string", name)))
    }

    pub fn opt_string(&self, name: &str) -> ScanResult<Option<String>> {
        match self.descriptor.param(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(Some(s.clone())),
            Some(Value::String(_)) => Err(self.invalid(format!("'{}' must not be empty", name))),
            Some(other) => Err(self.invalid(format!("'{}' must be a string, got {}", name, other))),
        }
    }

    pub fn bool_or(&self, name: &str, default: bool) -> ScanResult<bool> {
        match self.descriptor.param(name) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(self.invalid(format!("'{}' must be a boolean, got {}", name, other))),
        }
    }

    /// Number, numeric string, or expression string.
    pub fn param(&self, name: &str) -> ScanResult<Param> {
        match self.descriptor.param(name) {
            Some(Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(Param::Value(v)),
                _ if !s.trim().is_empty() => Ok(Param::Expr(s.clone())),
                _ => Err(self.invalid(format!("'{}' must not be empty", name))),
            },
            _ => Ok(Param::Value(self.f64(name)?)),
        }
    }
}

/// Sum of work units, `None` on overflow.
pub(crate) fn total_work_units(runtimes: &[CommandRuntime]) -> Option<u64> {
    runtimes
        .iter()
        .try_fold(0u64, |sum, rt| sum.checked_add(rt.work_units()))
}

// ===========================================================================
// Shared polling wait
// ===========================================================================

/// Poll `channel` until `satisfied` holds. Each cycle is a safe point (pause
/// and abort are honored) and the monitor's latch lets an operator skip the
/// rest of the wait.
pub(crate) fn await_condition(
    ctx: &ExecutionContext,
    monitor: &StepMonitor,
    channel: &str,
    timeout: Option<Duration>,
    satisfied: impl Fn(f64) -> bool,
) -> ScanResult<()> {
    let latch = monitor.begin_wait();
    let start = Instant::now();
    let result = loop {
        if let Err(e) = ctx.checkpoint() {
            break Err(e);
        }
        let value = match ctx.read_value(channel) {
            Ok(v) => v,
            Err(e) => break Err(e),
        };
        if satisfied(value) {
            break Ok(());
        }
        if let Some(limit) = timeout {
            if start.elapsed() >= limit {
                break Err(ScanError::Timeout {
                    channel: channel.to_string(),
                    seconds: limit.as_secs_f64(),
                });
            }
        }
        if latch.wait_timeout(ctx.poll_interval()) {
            tracing::debug!(channel, "wait released early");
            break Ok(());
        }
    };
    monitor.end_wait();
    result
}
