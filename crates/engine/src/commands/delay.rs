use super::ParamReader;
use crate::context::ExecutionContext;
use crate::error::{ScanError, ScanResult};
use crate::monitor::{Latch, StepMonitor};
use crate::simulation::SimulationContext;
use crate::types::CommandDescriptor;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Waits a fixed time. `skip` ends the wait early as if it had elapsed.
#[derive(Debug)]
pub struct DelayCommand {
    seconds: f64,
    duration: Duration,
    pub(super) monitor: Arc<StepMonitor>,
}

impl DelayCommand {
    pub(super) fn compile(descriptor: &CommandDescriptor) -> ScanResult<Self> {
        let params = ParamReader::new(descriptor, &["seconds"])?;
        params.require_no_body()?;
        let seconds = params.f64("seconds")?;
        if seconds < 0.0 {
            return Err(params.invalid(format!("seconds must be >= 0, got {}", seconds)));
        }
        let duration = params.duration("seconds")?;
        let description = descriptor
            .label()
            .map(String::from)
            .unwrap_or_else(|| format!("Delay {} sec", seconds));
        Ok(Self {
            seconds,
            duration,
            monitor: StepMonitor::new(description, true),
        })
    }

    pub fn seconds(&self) -> f64 {
        self.seconds
    }

    pub(super) fn simulate(&self, sim: &mut SimulationContext) -> ScanResult<()> {
        sim.log_step(self.monitor.description(), self.seconds);
        Ok(())
    }

    pub(super) fn execute(&self, ctx: &ExecutionContext) -> ScanResult<()> {
        let latch = self.monitor.begin_wait();
        let result = self.wait(ctx, &latch);
        self.monitor.end_wait();
        result
    }

    /// Sleep on the latch in slices of at most one poll interval so an abort
    /// is noticed promptly. A deadline past what `Instant` can represent
    /// means waiting until skipped or aborted.
    fn wait(&self, ctx: &ExecutionContext, latch: &Latch) -> ScanResult<()> {
        let deadline = Instant::now().checked_add(self.duration);
        loop {
            if ctx.check_interrupted() {
                return Err(ScanError::Interrupted);
            }
            let now = Instant::now();
            let slice = match deadline {
                Some(deadline) if now >= deadline => return Ok(()),
                Some(deadline) => (deadline - now).min(ctx.poll_interval()),
                None => ctx.poll_interval(),
            };
            if latch.wait_timeout(slice) {
                tracing::debug!(seconds = self.seconds, "delay released early");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{compile, CommandRuntime};
    use super::*;
    use crate::types::StepStatus;
    use std::thread;

    fn delay(seconds: f64) -> CommandRuntime {
        compile(&CommandDescriptor::delay(seconds)).unwrap()
    }

    #[test]
    fn test_full_duration_and_one_work_unit() {
        let ctx = exec_ctx(process());
        let mut rt = delay(0.15);
        let start = Instant::now();
        rt.execute(&ctx).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert_eq!(ctx.work().performed(), 1);
        assert_eq!(rt.status(), StepStatus::Completed);
        assert!(!rt.monitor().is_waiting());
    }

    #[test]
    fn test_zero_duration_does_not_block() {
        let ctx = exec_ctx(process());
        let mut rt = delay(0.0);
        let start = Instant::now();
        rt.execute(&ctx).unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(ctx.work().performed(), 1);
    }

    #[test]
    fn test_negative_duration_is_rejected() {
        let err = compile(&CommandDescriptor::delay(-1.0)).unwrap_err();
        assert!(matches!(err, ScanError::Validation { .. }));
    }

    #[test]
    fn test_unrepresentable_duration_is_rejected() {
        let err = compile(&CommandDescriptor::delay(1e20)).unwrap_err();
        assert!(matches!(err, ScanError::Validation { .. }));
    }

    #[test]
    fn test_early_completion_ends_wait() {
        let ctx = exec_ctx(process());
        let mut rt = delay(5.0);
        let monitor = rt.monitor().clone();
        let skipper = thread::spawn(move || {
            while !monitor.is_waiting() {
                thread::sleep(Duration::from_millis(5));
            }
            assert!(monitor.request_early_completion());
        });
        let start = Instant::now();
        rt.execute(&ctx).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(ctx.work().performed(), 1);
        assert_eq!(rt.status(), StepStatus::Completed);
        skipper.join().unwrap();
    }

    #[test]
    fn test_skip_before_execute_does_not_leak() {
        let ctx = exec_ctx(process());
        let mut rt = delay(0.1);
        assert!(!rt.request_early_completion());
        let start = Instant::now();
        rt.execute(&ctx).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_abort_ends_wait_as_interrupted() {
        let ctx = exec_ctx(process());
        let mut rt = delay(5.0);
        let monitor = rt.monitor().clone();
        let start = Instant::now();
        thread::scope(|s| {
            s.spawn(|| {
                while !monitor.is_waiting() {
                    thread::sleep(Duration::from_millis(5));
                }
                ctx.control().abort();
            });
            assert_eq!(rt.execute(&ctx), Err(ScanError::Interrupted));
        });
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(rt.status(), StepStatus::Aborted);
        assert_eq!(ctx.work().performed(), 0);
    }

    #[test]
    fn test_simulate_records_duration_without_blocking() {
        let mut sim = sim_ctx();
        let mut rt = delay(3600.0);
        let start = Instant::now();
        rt.simulate(&mut sim).unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(sim.total_estimated_seconds(), 3600.0);
        assert_eq!(sim.steps()[0].label, "Delay 3600 sec");
    }

    #[test]
    fn test_fresh_simulations_are_idempotent() {
        let d = CommandDescriptor::delay(1.5);
        let mut sim = sim_ctx();
        compile(&d).unwrap().simulate(&mut sim).unwrap();
        let first = sim.total_estimated_seconds();
        compile(&d).unwrap().simulate(&mut sim).unwrap();
        assert_eq!(sim.total_estimated_seconds(), first * 2.0);
    }

    #[test]
    fn test_status_reports_elapsed_while_running() {
        let ctx = exec_ctx(process());
        let mut rt = delay(0.2);
        let monitor = rt.monitor().clone();
        thread::scope(|s| {
            s.spawn(|| {
                while !monitor.is_waiting() {
                    thread::sleep(Duration::from_millis(5));
                }
                assert!(monitor.describe().contains("Elapsed: "));
            });
            rt.execute(&ctx).unwrap();
        });
        assert_eq!(rt.describe(), "Delay 0.2 sec");
    }
}
