use super::set::DEFAULT_TOLERANCE;
use super::{await_condition, Param, ParamReader};
use crate::context::ExecutionContext;
use crate::error::ScanResult;
use crate::monitor::StepMonitor;
use crate::simulation::SimulationContext;
use crate::types::CommandDescriptor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Equals,
    AtLeast,
    Above,
    AtMost,
    Below,
    IncreaseBy,
    DecreaseBy,
}

impl Comparison {
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }

    fn symbol(self) -> &'static str {
        match self {
            Comparison::Equals => "=",
            Comparison::AtLeast => ">=",
            Comparison::Above => ">",
            Comparison::AtMost => "<=",
            Comparison::Below => "<",
            Comparison::IncreaseBy => "+=",
            Comparison::DecreaseBy => "-=",
        }
    }

    fn is_relative(self) -> bool {
        matches!(self, Comparison::IncreaseBy | Comparison::DecreaseBy)
    }

    /// Absolute threshold for `desired`, given the value at the start of the
    /// wait for the relative comparisons.
    fn threshold(self, desired: f64, initial: f64) -> f64 {
        match self {
            Comparison::IncreaseBy => initial + desired,
            Comparison::DecreaseBy => initial - desired,
            _ => desired,
        }
    }

    fn holds(self, value: f64, threshold: f64, tolerance: f64) -> bool {
        match self {
            Comparison::Equals => (value - threshold).abs() <= tolerance,
            Comparison::AtLeast | Comparison::IncreaseBy => value >= threshold,
            Comparison::Above => value > threshold,
            Comparison::AtMost | Comparison::DecreaseBy => value <= threshold,
            Comparison::Below => value < threshold,
        }
    }
}

/// Blocks until a channel satisfies a condition.
#[derive(Debug)]
pub struct WaitCommand {
    channel: String,
    comparison: Comparison,
    value: Param,
    tolerance: f64,
    timeout: Option<Duration>,
    pub(super) monitor: Arc<StepMonitor>,
}

impl WaitCommand {
    pub(super) fn compile(descriptor: &CommandDescriptor) -> ScanResult<Self> {
        let params = ParamReader::new(
            descriptor,
            &["channel", "comparison", "value", "tolerance", "timeout"],
        )?;
        params.require_no_body()?;
        let channel = params.string("channel")?;
        let comparison = params
            .opt_string("comparison")?
            .map(|c| {
                Comparison::parse(&c)
                    .ok_or_else(|| params.invalid(format!("unknown comparison '{}'", c)))
            })
            .transpose()?
            .unwrap_or(Comparison::Equals);
        let value = params.param("value")?;
        let tolerance = params
            .opt_non_negative("tolerance")?
            .unwrap_or(DEFAULT_TOLERANCE);
        let timeout = params.opt_timeout("timeout")?;

        let description = descriptor.label().map(String::from).unwrap_or_else(|| {
            let mut s = format!("Wait for '{}' {} {}", channel, comparison.symbol(), value);
            if let Some(t) = timeout {
                s.push_str(&format!(" (timeout {} sec)", t.as_secs_f64()));
            }
            s
        });
        Ok(Self {
            channel,
            comparison,
            value,
            tolerance,
            timeout,
            monitor: StepMonitor::new(description, true),
        })
    }

    pub(super) fn simulate(&self, sim: &mut SimulationContext) -> ScanResult<()> {
        let desired = self.value.resolve_sim(sim)?;
        let label = self.monitor.description();
        let already = match sim.simulated_value(&self.channel) {
            Some(v) if !self.comparison.is_relative() => {
                self.comparison.holds(v, desired, self.tolerance)
            }
            _ => false,
        };
        if already {
            sim.log_step(label, 0.0);
            return Ok(());
        }

        let threshold = sim
            .simulated_value(&self.channel)
            .map(|v| self.comparison.threshold(desired, v))
            .unwrap_or(desired);
        match self.timeout {
            Some(t) => sim.log_step(label, t.as_secs_f64()),
            None => sim.log_step(format!("{} - unbounded", label), 0.0),
        }
        sim.simulate_change(&self.channel, threshold);
        Ok(())
    }

    pub(super) fn execute(&self, ctx: &ExecutionContext) -> ScanResult<()> {
        let desired = self.value.resolve(ctx.evaluator())?;
        let threshold = if self.comparison.is_relative() {
            self.comparison
                .threshold(desired, ctx.read_value(&self.channel)?)
        } else {
            desired
        };
        tracing::info!(channel = %self.channel, comparison = ?self.comparison, threshold, "wait");
        let (comparison, tolerance) = (self.comparison, self.tolerance);
        await_condition(ctx, &self.monitor, &self.channel, self.timeout, |v| {
            comparison.holds(v, threshold, tolerance)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::compile;
    use super::*;
    use crate::error::ScanError;
    use crate::platform::{LiteralEvaluator, MemoryProcess};
    use crate::simulation::SimulationProfile;
    use crate::traits::ValueIo;
    use crate::types::StepStatus;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_comparisons() {
        assert!(Comparison::Equals.holds(1.05, 1.0, 0.1));
        assert!(!Comparison::Equals.holds(1.2, 1.0, 0.1));
        assert!(Comparison::AtLeast.holds(1.0, 1.0, 0.0));
        assert!(!Comparison::Above.holds(1.0, 1.0, 0.0));
        assert!(Comparison::AtMost.holds(1.0, 1.0, 0.0));
        assert!(!Comparison::Below.holds(1.0, 1.0, 0.0));
        assert_eq!(Comparison::IncreaseBy.threshold(5.0, 10.0), 15.0);
        assert_eq!(Comparison::DecreaseBy.threshold(5.0, 10.0), 5.0);
        assert_eq!(Comparison::parse("at_least"), Some(Comparison::AtLeast));
        assert_eq!(Comparison::parse("roughly"), None);
    }

    #[test]
    fn test_unknown_comparison_rejected() {
        let d = CommandDescriptor::wait("temp", "roughly", 1.0);
        assert!(matches!(
            compile(&d).unwrap_err(),
            ScanError::Validation { .. }
        ));
    }

    #[test]
    fn test_wait_returns_once_condition_holds() {
        let io = Arc::new(process());
        let ctx = crate::context::ExecutionContext::new(io.clone(), Arc::new(LiteralEvaluator))
            .with_poll_interval(Duration::from_millis(10));
        let mut rt = compile(&CommandDescriptor::wait("temp", "above", 25.0)).unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                io.write("temp", 30.0).unwrap();
            });
            rt.execute(&ctx).unwrap();
        });
        assert_eq!(rt.status(), StepStatus::Completed);
        assert_eq!(ctx.work().performed(), 1);
    }

    #[test]
    fn test_relative_wait_uses_initial_value() {
        let io = MemoryProcess::new().with_channel("count", 10.0, Some(100.0));
        io.write("count", 20.0).unwrap();
        let ctx = exec_ctx(io);
        // Reads ~10 at start, so waits for ~13.
        let d = CommandDescriptor::wait("count", "increase_by", 3.0);
        compile(&d).unwrap().execute(&ctx).unwrap();
    }

    #[test]
    fn test_wait_timeout() {
        let ctx = exec_ctx(process());
        let d = CommandDescriptor::wait("temp", "above", 100.0).with_param("timeout", 0.05);
        let start = Instant::now();
        let err = compile(&d).unwrap().execute(&ctx).unwrap_err();
        assert!(matches!(err, ScanError::Timeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_pause_holds_wait_until_resume() {
        let io = Arc::new(process());
        let ctx = crate::context::ExecutionContext::new(io.clone(), Arc::new(LiteralEvaluator))
            .with_poll_interval(Duration::from_millis(10));
        ctx.control().pause();
        let mut rt = compile(&CommandDescriptor::wait("temp", "at_least", 20.0)).unwrap();
        let start = Instant::now();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(60));
                ctx.control().resume();
            });
            rt.execute(&ctx).unwrap();
        });
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_simulate_condition_already_met() {
        let profile = SimulationProfile::default().with_channel("temp", Some(20.0), None);
        let mut sim = SimulationContext::new(profile, Arc::new(LiteralEvaluator));
        let d = CommandDescriptor::wait("temp", "at_least", 10.0).with_param("timeout", 30.0);
        compile(&d).unwrap().simulate(&mut sim).unwrap();
        assert_eq!(sim.total_estimated_seconds(), 0.0);
    }

    #[test]
    fn test_simulate_unmet_condition_costs_timeout() {
        let mut sim = sim_ctx();
        let d = CommandDescriptor::wait("temp", "at_least", 10.0).with_param("timeout", 30.0);
        compile(&d).unwrap().simulate(&mut sim).unwrap();
        assert_eq!(sim.total_estimated_seconds(), 30.0);
        assert_eq!(sim.simulated_value("temp"), Some(10.0));

        let d = CommandDescriptor::wait("other", "below", 0.0);
        compile(&d).unwrap().simulate(&mut sim).unwrap();
        assert!(sim.steps()[1].label.ends_with("unbounded"));
    }
}
