//! Engine crate – scan command execution.
//!
//! A scan is a [`Sequence`] of [`CommandDescriptor`]s. The [`Sequencer`]
//! compiles descriptors into runtimes and either simulates them (estimated
//! duration, no live I/O) or executes them against a [`ValueIo`] on a worker
//! thread, with pause, resume, abort, skip and progress available from any
//! other thread.
//!
//! The crate has no async runtime or transport dependency; live values come
//! in through the traits in [`traits`].

pub mod commands;
pub mod context;
pub mod error;
pub mod monitor;
pub mod platform;
pub mod scenario;
pub mod sequencer;
pub mod simulation;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use commands::CommandRuntime;
pub use context::ExecutionContext;
pub use error::{ScanError, ScanResult};
pub use platform::{LiteralEvaluator, MemoryProcess};
pub use sequencer::{EngineOptions, Sequencer};
pub use simulation::{SimulationContext, SimulationProfile};
pub use traits::{EvalError, ExpressionEval, LiveIoError, ValueIo};
pub use types::{
    CommandDescriptor, ErrorCode, ErrorInfo, ProgressSnapshot, RunReport, RunState, ScanEvent,
    Sequence, SimulationReport,
};
