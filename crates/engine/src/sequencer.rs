//! Sequencer – drives a compiled sequence one step at a time.
//!
//! # State machine
//!
//! ```text
//! Idle ──execute()──▶ Running ◀──resume()── Paused
//!                        │ ──────pause()─────▶ │
//!                        ▼                     ▼
//!              Finished | Aborted | Failed (abort() from either)
//! ```
//!
//! Simulation has its own `Idle → Simulating → Simulated` track and never
//! changes the run state.
//!
//! A [`Sequencer`] is a cheap handle: clone it to the controlling thread and
//! call `pause`, `resume`, `abort`, `skip_current` or `progress` there while
//! the worker blocks in `execute`. Every control call is a no-op outside an
//! active run.

use crate::commands::{compile_all, total_work_units, CommandRuntime};
use crate::context::{ActiveSteps, EventBus, ExecutionContext, RunControl, WorkCounter};
use crate::error::{ScanError, ScanResult};
use crate::simulation::{SimulationContext, SimulationProfile};
use crate::traits::{ExpressionEval, ValueIo};
use crate::types::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Upper bound on how long a blocked command goes without checking for
    /// abort.
    pub poll_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct States {
    run: RunState,
    sim: SimulationState,
}

struct Shared {
    sequence: Sequence,
    options: EngineOptions,
    total_work: u64,
    states: Mutex<States>,
    control: Arc<RunControl>,
    work: Arc<WorkCounter>,
    active: Arc<ActiveSteps>,
    events: Arc<EventBus>,
    /// 1-based index of the running top-level step; 0 when none.
    current_step: AtomicUsize,
}

#[derive(Clone)]
pub struct Sequencer {
    shared: Arc<Shared>,
}

impl Sequencer {
    /// Compile once up front so a bad sequence is rejected before anything
    /// runs.
    pub fn new(sequence: Sequence, options: EngineOptions) -> ScanResult<Self> {
        let total_work = total_work_units(&compile_all(&sequence.steps)?)
            .ok_or_else(|| ScanError::validation("sequence", "total work overflows"))?;
        Ok(Self {
            shared: Arc::new(Shared {
                sequence,
                options,
                total_work,
                states: Mutex::new(States {
                    run: RunState::Idle,
                    sim: SimulationState::Idle,
                }),
                control: Arc::new(RunControl::new()),
                work: Arc::new(WorkCounter::new()),
                active: Arc::new(ActiveSteps::new()),
                events: Arc::new(EventBus::new()),
                current_step: AtomicUsize::new(0),
            }),
        })
    }

    fn states(&self) -> MutexGuard<'_, States> {
        self.shared
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_run_state(&self, state: RunState) {
        self.states().run = state;
        self.shared
            .events
            .publish(ScanEvent::StateChanged { state });
    }

    pub fn sequence(&self) -> &Sequence {
        &self.shared.sequence
    }

    pub fn state(&self) -> RunState {
        self.states().run
    }

    pub fn simulation_state(&self) -> SimulationState {
        self.states().sim
    }

    pub fn total_work(&self) -> u64 {
        self.shared.total_work
    }

    pub fn subscribe(&self) -> Receiver<ScanEvent> {
        self.shared.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Simulation
    // -----------------------------------------------------------------------

    /// Estimate the sequence on fresh runtimes. Rejected while a real run is
    /// active.
    pub fn simulate(
        &self,
        profile: &SimulationProfile,
        eval: Arc<dyn ExpressionEval>,
    ) -> ScanResult<SimulationReport> {
        {
            let mut states = self.states();
            if states.run.is_active() || states.sim == SimulationState::Simulating {
                return Err(ScanError::Busy("sequence is executing".into()));
            }
            states.sim = SimulationState::Simulating;
        }

        let mut sim = SimulationContext::new(profile.clone(), eval);
        let result = compile_all(&self.shared.sequence.steps)
            .and_then(|mut runtimes| runtimes.iter_mut().try_for_each(|rt| rt.simulate(&mut sim)));

        let mut states = self.states();
        match result {
            Ok(()) => {
                states.sim = SimulationState::Simulated;
                let total_seconds = sim.total_estimated_seconds();
                tracing::info!(seconds = total_seconds, "simulation complete");
                Ok(SimulationReport {
                    run_id: new_run_id(),
                    name: self.shared.sequence.name.clone(),
                    total_seconds,
                    total_work: self.shared.total_work,
                    steps: sim.into_steps(),
                })
            }
            Err(e) => {
                states.sim = SimulationState::Idle;
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run every step in order on the calling thread. Returns `Err` only when
    /// the run is rejected before it starts; failures and aborts during the
    /// run are reported in the [`RunReport`].
    pub fn execute(
        &self,
        io: Arc<dyn ValueIo>,
        eval: Arc<dyn ExpressionEval>,
    ) -> ScanResult<RunReport> {
        let shared = &self.shared;
        {
            let mut states = self.states();
            if states.run.is_active() || states.sim == SimulationState::Simulating {
                return Err(ScanError::Busy(format!("sequencer is {}", states.run)));
            }
            shared.control.reset();
            shared.work.reset(shared.total_work);
            shared.active.clear();
            states.run = RunState::Running;
        }
        shared.events.publish(ScanEvent::StateChanged {
            state: RunState::Running,
        });

        let mut runtimes = match compile_all(&shared.sequence.steps) {
            Ok(r) => r,
            Err(e) => {
                self.set_run_state(RunState::Idle);
                return Err(e);
            }
        };

        let run_id = new_run_id();
        let ctx = ExecutionContext::new(io, eval)
            .with_poll_interval(shared.options.poll_interval)
            .with_shared(
                shared.control.clone(),
                shared.work.clone(),
                shared.active.clone(),
                shared.events.clone(),
            );
        let started = Instant::now();
        tracing::info!(run_id = %run_id, steps = runtimes.len(), total_work = shared.total_work, "run started");

        let (state, completed, stopped_at) = self.drive(&mut runtimes, &ctx);

        shared.current_step.store(0, Ordering::SeqCst);
        shared.active.clear();
        let report = RunReport {
            run_id,
            name: shared.sequence.name.clone(),
            state,
            steps_completed: completed,
            work_performed: shared.work.performed(),
            total_work: shared.total_work,
            elapsed_ms: started.elapsed().as_millis() as u64,
            stopped_at,
        };
        match &report.stopped_at {
            Some(s) => tracing::warn!(run_id = %report.run_id, state = %state, step = s.step, error = %s.error.message, "run stopped"),
            None => tracing::info!(run_id = %report.run_id, elapsed_ms = report.elapsed_ms, "run finished"),
        }
        self.set_run_state(state);
        shared.events.publish(ScanEvent::Finished {
            report: report.clone(),
        });
        Ok(report)
    }

    fn drive(
        &self,
        runtimes: &mut [CommandRuntime],
        ctx: &ExecutionContext,
    ) -> (RunState, usize, Option<StoppedStep>) {
        let shared = &self.shared;
        for (i, runtime) in runtimes.iter_mut().enumerate() {
            let step = i + 1;
            let description = runtime.monitor().description().to_string();
            let stopped = |error: &ScanError| StoppedStep {
                step,
                description: description.clone(),
                error: error.to_info(),
            };

            if let Err(e) = ctx.checkpoint() {
                return (RunState::Aborted, i, Some(stopped(&e)));
            }

            shared.current_step.store(step, Ordering::SeqCst);
            shared.events.publish(ScanEvent::StepStarted {
                step,
                description: runtime.describe(),
            });
            tracing::info!(step, kind = runtime.kind(), description = %runtime.describe(), "step started");

            let result = runtime.execute(ctx);
            shared.events.publish(ScanEvent::StepFinished {
                step,
                status: runtime.status(),
            });
            match result {
                Ok(()) => {}
                Err(e @ ScanError::Interrupted) => {
                    return (RunState::Aborted, i, Some(stopped(&e)));
                }
                Err(e) => {
                    return (RunState::Failed, i, Some(stopped(&e)));
                }
            }
        }
        (RunState::Finished, runtimes.len(), None)
    }

    /// Run `execute` on a dedicated worker thread.
    pub fn spawn(
        &self,
        io: Arc<dyn ValueIo>,
        eval: Arc<dyn ExpressionEval>,
    ) -> std::io::Result<JoinHandle<ScanResult<RunReport>>> {
        let this = self.clone();
        std::thread::Builder::new()
            .name("scan-worker".into())
            .spawn(move || this.execute(io, eval))
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Cooperative: takes effect at the next safe point.
    pub fn pause(&self) {
        let mut states = self.states();
        if states.run == RunState::Running {
            states.run = RunState::Paused;
            self.shared.control.pause();
            drop(states);
            tracing::info!("pause requested");
            self.shared.events.publish(ScanEvent::StateChanged {
                state: RunState::Paused,
            });
        }
    }

    pub fn resume(&self) {
        let mut states = self.states();
        if states.run == RunState::Paused {
            states.run = RunState::Running;
            self.shared.control.resume();
            drop(states);
            tracing::info!("resumed");
            self.shared.events.publish(ScanEvent::StateChanged {
                state: RunState::Running,
            });
        }
    }

    /// Stop the active step at its next safe point; later steps never start.
    pub fn abort(&self) {
        let states = self.states();
        if states.run.is_active() {
            self.shared.control.abort();
            tracing::info!("abort requested");
        }
    }

    /// Forward early completion to the innermost active step. A request made
    /// after the step starts but before its wait begins still ends that wait.
    /// Returns `false` for steps that cannot be skipped.
    pub fn skip_current(&self) -> bool {
        if !self.state().is_active() {
            return false;
        }
        let skipped = self
            .shared
            .active
            .innermost()
            .map(|m| m.request_early_completion())
            .unwrap_or(false);
        tracing::debug!(skipped, "skip requested");
        skipped
    }

    pub fn progress(&self) -> ProgressSnapshot {
        let step = self.shared.current_step.load(Ordering::SeqCst);
        ProgressSnapshot {
            state: self.state(),
            performed: self.shared.work.performed(),
            total: self.shared.total_work,
            fraction: self.shared.work.fraction(),
            current_step: (step > 0).then_some(step),
            current_status: self.shared.active.innermost().map(|m| m.describe()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{LiteralEvaluator, MemoryProcess};
    use crate::traits::{IoResult, LiveIoError};
    use std::thread;

    fn options() -> EngineOptions {
        EngineOptions {
            poll_interval: Duration::from_millis(10),
        }
    }

    fn io() -> Arc<dyn ValueIo> {
        Arc::new(
            MemoryProcess::new()
                .with_channel("motor", 0.0, None)
                .with_channel("shutter", 0.0, None),
        )
    }

    fn eval() -> Arc<dyn ExpressionEval> {
        Arc::new(LiteralEvaluator)
    }

    fn sequencer(steps: Vec<CommandDescriptor>) -> Sequencer {
        Sequencer::new(Sequence::named("test", steps), options()).unwrap()
    }

    fn wait_for_step(seq: &Sequencer, step: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while seq.progress().current_step != Some(step) || seq.progress().current_status.is_none() {
            assert!(Instant::now() < deadline, "step {} never started", step);
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_runs_all_steps_in_order() {
        let seq = sequencer(vec![
            CommandDescriptor::comment("one"),
            CommandDescriptor::set("motor", 1.0),
            CommandDescriptor::delay(0.01),
            CommandDescriptor::set("shutter", 1.0).with_param("wait", false),
        ]);
        let events = seq.subscribe();
        let report = seq.execute(io(), eval()).unwrap();

        assert_eq!(report.state, RunState::Finished);
        assert_eq!(report.steps_completed, 4);
        assert_eq!(report.work_performed, 4);
        assert_eq!(report.total_work, 4);
        assert!(report.stopped_at.is_none());
        assert_eq!(seq.state(), RunState::Finished);

        // Each step finishes before the next one starts.
        let mut expected_next = 1;
        let mut open: Option<usize> = None;
        for event in events.try_iter() {
            match event {
                ScanEvent::StepStarted { step, .. } => {
                    assert!(open.is_none(), "step {} overlapped", step);
                    assert_eq!(step, expected_next);
                    open = Some(step);
                }
                ScanEvent::StepFinished { step, status } => {
                    assert_eq!(open, Some(step));
                    assert_eq!(status, StepStatus::Completed);
                    open = None;
                    expected_next += 1;
                }
                _ => {}
            }
        }
        assert_eq!(expected_next, 5);
    }

    #[test]
    fn test_unknown_kind_rejected_before_start() {
        let err = Sequencer::new(
            Sequence::new(vec![
                CommandDescriptor::comment("ok"),
                CommandDescriptor::new("acquire"),
            ]),
            options(),
        )
        .err()
        .unwrap();
        assert_eq!(err, ScanError::Compilation("acquire".into()));
    }

    #[test]
    fn test_out_of_range_durations_rejected_before_start() {
        for step in [
            CommandDescriptor::delay(1e20),
            CommandDescriptor::set("motor", 1.0).with_param("timeout", 1e20),
            CommandDescriptor::loop_over("motor", 0.0, 1e300, 1.0, vec![]),
        ] {
            let err = Sequencer::new(Sequence::new(vec![step]), options())
                .err()
                .unwrap();
            assert!(matches!(err, ScanError::Validation { .. }), "{:?}", err);
        }
    }

    #[test]
    fn test_total_work_overflow_rejected() {
        let max = (crate::commands::MAX_ITERATIONS - 1) as f64;
        let mut big = CommandDescriptor::loop_over("motor", 0.0, max, 1.0, vec![]);
        for _ in 0..2 {
            big = CommandDescriptor::loop_over("motor", 0.0, max, 1.0, vec![big]);
        }
        big = CommandDescriptor::loop_over("motor", 0.0, 9.0, 1.0, vec![big]);
        let err = Sequencer::new(Sequence::new(vec![big.clone(), big]), options())
            .err()
            .unwrap();
        assert_eq!(err, ScanError::validation("sequence", "total work overflows"));
    }

    #[test]
    fn test_invalid_parameters_rejected_before_start() {
        let err = Sequencer::new(
            Sequence::new(vec![CommandDescriptor::delay(-2.0)]),
            options(),
        )
        .err()
        .unwrap();
        assert!(err.is_rejection());
    }

    /// Counts writes and fails on one channel.
    struct FailOn {
        channel: &'static str,
        writes: Mutex<Vec<String>>,
    }

    impl ValueIo for FailOn {
        fn read(&self, _channel: &str) -> IoResult<f64> {
            Ok(0.0)
        }
        fn write(&self, channel: &str, _value: f64) -> IoResult<()> {
            self.writes.lock().unwrap().push(channel.to_string());
            if channel == self.channel {
                Err(LiveIoError::Timeout(channel.to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_failure_stops_at_failing_step() {
        let seq = sequencer(vec![
            CommandDescriptor::set("a", 0.0),
            CommandDescriptor::set("b", 0.0),
            CommandDescriptor::set("c", 0.0),
        ]);
        let io = Arc::new(FailOn {
            channel: "b",
            writes: Mutex::new(Vec::new()),
        });
        let report = seq.execute(io.clone(), eval()).unwrap();

        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.steps_completed, 1);
        let stopped = report.stopped_at.unwrap();
        assert_eq!(stopped.step, 2);
        assert_eq!(stopped.error.code, ErrorCode::IoError);
        assert!(stopped.description.starts_with("Set 'b'"));
        assert_eq!(*io.writes.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_abort_during_step_stops_run() {
        let seq = sequencer(vec![
            CommandDescriptor::comment("first"),
            CommandDescriptor::delay(10.0),
            CommandDescriptor::comment("never"),
        ]);
        let worker = seq.spawn(io(), eval()).unwrap();
        wait_for_step(&seq, 2);
        let start = Instant::now();
        seq.abort();
        let report = worker.join().unwrap().unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(report.state, RunState::Aborted);
        assert_eq!(report.steps_completed, 1);
        assert_eq!(report.work_performed, 1);
        let stopped = report.stopped_at.unwrap();
        assert_eq!(stopped.step, 2);
        assert_eq!(stopped.error.code, ErrorCode::Interrupted);
        assert_eq!(seq.state(), RunState::Aborted);
    }

    #[test]
    fn test_skip_current_delay() {
        let seq = sequencer(vec![CommandDescriptor::delay(10.0), CommandDescriptor::comment("after")]);
        let worker = seq.spawn(io(), eval()).unwrap();
        wait_for_step(&seq, 1);
        assert!(seq.skip_current());
        let report = worker.join().unwrap().unwrap();
        assert_eq!(report.state, RunState::Finished);
        assert_eq!(report.steps_completed, 2);
        assert!(report.elapsed_ms < 5_000);
    }

    #[test]
    fn test_skip_on_non_skippable_step_is_noop() {
        let seq = sequencer(vec![CommandDescriptor::comment("x")]);
        assert!(!seq.skip_current());
        let report = seq.execute(io(), eval()).unwrap();
        assert_eq!(report.state, RunState::Finished);
        assert!(!seq.skip_current());
    }

    #[test]
    fn test_control_calls_are_noops_outside_a_run() {
        let seq = sequencer(vec![CommandDescriptor::delay(0.0)]);
        seq.pause();
        seq.resume();
        seq.abort();
        assert_eq!(seq.state(), RunState::Idle);
        let report = seq.execute(io(), eval()).unwrap();
        assert_eq!(report.state, RunState::Finished);
        seq.abort();
        seq.pause();
        assert_eq!(seq.state(), RunState::Finished);
    }

    #[test]
    fn test_pause_holds_next_step_until_resume() {
        let seq = sequencer(vec![
            CommandDescriptor::delay(0.1),
            CommandDescriptor::comment("after pause"),
        ]);
        let worker = seq.spawn(io(), eval()).unwrap();
        wait_for_step(&seq, 1);
        seq.pause();
        assert_eq!(seq.state(), RunState::Paused);

        thread::sleep(Duration::from_millis(250));
        let progress = seq.progress();
        assert_eq!(progress.performed, 1, "second step ran while paused");
        assert_eq!(progress.state, RunState::Paused);

        seq.resume();
        let report = worker.join().unwrap().unwrap();
        assert_eq!(report.state, RunState::Finished);
        assert_eq!(report.work_performed, 2);
    }

    #[test]
    fn test_abort_while_paused() {
        let seq = sequencer(vec![CommandDescriptor::delay(0.05), CommandDescriptor::delay(0.05)]);
        let worker = seq.spawn(io(), eval()).unwrap();
        wait_for_step(&seq, 1);
        seq.pause();
        seq.abort();
        let report = worker.join().unwrap().unwrap();
        assert_eq!(report.state, RunState::Aborted);
    }

    #[test]
    fn test_second_concurrent_run_is_busy() {
        let seq = sequencer(vec![CommandDescriptor::delay(10.0)]);
        let worker = seq.spawn(io(), eval()).unwrap();
        wait_for_step(&seq, 1);
        assert!(matches!(seq.execute(io(), eval()), Err(ScanError::Busy(_))));
        assert!(matches!(
            seq.simulate(&SimulationProfile::default(), eval()),
            Err(ScanError::Busy(_))
        ));
        seq.abort();
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_rerun_uses_fresh_runtimes() {
        let seq = sequencer(vec![CommandDescriptor::delay(0.0), CommandDescriptor::comment("x")]);
        let first = seq.execute(io(), eval()).unwrap();
        let second = seq.execute(io(), eval()).unwrap();
        assert_eq!(first.state, RunState::Finished);
        assert_eq!(second.state, RunState::Finished);
        assert_eq!(second.work_performed, 2);
        assert_ne!(first.run_id, second.run_id);
    }

    #[test]
    fn test_progress_reports_step_and_elapsed() {
        let seq = sequencer(vec![
            CommandDescriptor::comment("a"),
            CommandDescriptor::delay(10.0),
        ]);
        assert_eq!(seq.progress().current_step, None);
        let worker = seq.spawn(io(), eval()).unwrap();
        wait_for_step(&seq, 2);
        let p = seq.progress();
        assert_eq!(p.performed, 1);
        assert_eq!(p.total, 2);
        assert_eq!(p.fraction, 0.5);
        assert!(p.current_status.unwrap().starts_with("Delay 10 sec"));
        assert!(seq.skip_current());
        worker.join().unwrap().unwrap();
        let p = seq.progress();
        assert_eq!(p.fraction, 1.0);
        assert_eq!(p.current_step, None);
    }

    #[test]
    fn test_simulation_matches_configured_delays() {
        let seq = sequencer(vec![
            CommandDescriptor::delay(1.5),
            CommandDescriptor::comment("x"),
            CommandDescriptor::delay(2.0),
        ]);
        let start = Instant::now();
        let first = seq.simulate(&SimulationProfile::default(), eval()).unwrap();
        let second = seq.simulate(&SimulationProfile::default(), eval()).unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(first.total_seconds, 3.5);
        assert_eq!(second.total_seconds, first.total_seconds);
        assert_eq!(first.steps.len(), 3);
        assert_eq!(seq.simulation_state(), SimulationState::Simulated);
        assert_eq!(seq.state(), RunState::Idle);
    }

    #[test]
    fn test_simulation_covers_nested_commands() {
        let seq = sequencer(vec![
            CommandDescriptor::set("motor", 3.0),
            CommandDescriptor::wait("motor", "at_least", 3.0),
            CommandDescriptor::loop_over("motor", 0.0, 2.0, 1.0, vec![CommandDescriptor::delay(1.0)]),
        ]);
        let report = seq.simulate(&SimulationProfile::default(), eval()).unwrap();
        assert_eq!(report.total_seconds, 3.0);
        assert_eq!(report.total_work, 8);
    }

    #[test]
    fn test_expression_failure_is_reported_as_failed() {
        let seq = sequencer(vec![
            CommandDescriptor::set("motor", 0.0).with_param("value", "2 * pi"),
        ]);
        let report = seq.execute(io(), eval()).unwrap();
        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.stopped_at.unwrap().error.code, ErrorCode::InvalidInput);
    }
}
