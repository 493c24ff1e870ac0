use super::{compile_all, total_work_units, CommandRuntime, ParamReader};
use crate::context::ExecutionContext;
use crate::error::ScanResult;
use crate::monitor::StepMonitor;
use crate::simulation::SimulationContext;
use crate::types::CommandDescriptor;
use std::sync::Arc;

// ===========================================================================
// Comment
// ===========================================================================

/// Logs a note. Instantaneous.
#[derive(Debug)]
pub struct CommentCommand {
    text: String,
    pub(super) monitor: Arc<StepMonitor>,
}

impl CommentCommand {
    pub(super) fn compile(descriptor: &CommandDescriptor) -> ScanResult<Self> {
        let params = ParamReader::new(descriptor, &["text"])?;
        params.require_no_body()?;
        let text = params.string("text")?;
        let description = descriptor
            .label()
            .map(String::from)
            .unwrap_or_else(|| format!("Comment '{}'", text));
        Ok(Self {
            text,
            monitor: StepMonitor::new(description, false),
        })
    }

    pub(super) fn simulate(&self, sim: &mut SimulationContext) -> ScanResult<()> {
        sim.log_step(self.monitor.description(), 0.0);
        Ok(())
    }

    pub(super) fn execute(&self, _ctx: &ExecutionContext) -> ScanResult<()> {
        tracing::info!(comment = %self.text, "scan comment");
        Ok(())
    }
}

// ===========================================================================
// Group
// ===========================================================================

/// Runs nested commands in order.
#[derive(Debug)]
pub struct GroupCommand {
    children: Vec<CommandRuntime>,
    work_units: u64,
    pub(super) monitor: Arc<StepMonitor>,
}

impl GroupCommand {
    pub(super) fn compile(descriptor: &CommandDescriptor) -> ScanResult<Self> {
        let params = ParamReader::new(descriptor, &[])?;
        let children = compile_all(descriptor.body())?;
        let work_units =
            total_work_units(&children).ok_or_else(|| params.invalid("total work overflows"))?;
        let description = descriptor
            .label()
            .map(String::from)
            .unwrap_or_else(|| format!("Group of {} commands", children.len()));
        Ok(Self {
            children,
            work_units,
            monitor: StepMonitor::new(description, false),
        })
    }

    pub fn children(&self) -> &[CommandRuntime] {
        &self.children
    }

    pub(super) fn work_units(&self) -> u64 {
        self.work_units
    }

    pub(super) fn simulate(&mut self, sim: &mut SimulationContext) -> ScanResult<()> {
        for child in &mut self.children {
            child.simulate(sim)?;
        }
        Ok(())
    }

    pub(super) fn execute(&mut self, ctx: &ExecutionContext) -> ScanResult<()> {
        for child in &mut self.children {
            ctx.checkpoint()?;
            child.execute(ctx)?;
        }
        Ok(())
    }
}
