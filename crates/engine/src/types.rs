use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Command descriptors
// ---------------------------------------------------------------------------

/// Immutable description of one scan step.
///
/// `params` keeps insertion order so descriptors round-trip through YAML and
/// JSON exactly as authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    body: Vec<CommandDescriptor>,
}

impl CommandDescriptor {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            label: None,
            params: Map::new(),
            body: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn with_body(mut self, body: Vec<CommandDescriptor>) -> Self {
        self.body = body;
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn body(&self) -> &[CommandDescriptor] {
        &self.body
    }

    // Shorthands for the built-in kinds.

    pub fn delay(seconds: f64) -> Self {
        Self::new("delay").with_param("seconds", seconds)
    }

    pub fn set(channel: &str, value: f64) -> Self {
        Self::new("set")
            .with_param("channel", channel)
            .with_param("value", value)
    }

    pub fn wait(channel: &str, comparison: &str, value: f64) -> Self {
        Self::new("wait")
            .with_param("channel", channel)
            .with_param("comparison", comparison)
            .with_param("value", value)
    }

    pub fn comment(text: &str) -> Self {
        Self::new("comment").with_param("text", text)
    }

    pub fn group(body: Vec<CommandDescriptor>) -> Self {
        Self::new("group").with_body(body)
    }

    pub fn loop_over(
        channel: &str,
        start: f64,
        end: f64,
        step: f64,
        body: Vec<CommandDescriptor>,
    ) -> Self {
        Self::new("loop")
            .with_param("channel", channel)
            .with_param("start", start)
            .with_param("end", end)
            .with_param("step", step)
            .with_body(body)
    }
}

/// Ordered list of descriptors. Insertion order is execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<CommandDescriptor>,
}

impl Sequence {
    pub fn new(steps: Vec<CommandDescriptor>) -> Self {
        Self { name: None, steps }
    }

    pub fn named(name: &str, steps: Vec<CommandDescriptor>) -> Self {
        Self {
            name: Some(name.to_string()),
            steps,
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle states
// ---------------------------------------------------------------------------

/// Lifecycle of one command runtime. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Aborted,
    Simulated,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Idle | StepStatus::Running)
    }

    pub fn can_advance_to(self, next: StepStatus) -> bool {
        match (self, next) {
            (StepStatus::Idle, StepStatus::Running) => true,
            (StepStatus::Idle, StepStatus::Simulated) => true,
            (StepStatus::Running, n) => {
                matches!(n, StepStatus::Completed | StepStatus::Failed | StepStatus::Aborted)
            }
            _ => false,
        }
    }
}

/// Overall state of a sequencer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Finished,
    Aborted,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Finished | RunState::Aborted | RunState::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, RunState::Running | RunState::Paused)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Finished => "finished",
            RunState::Aborted => "aborted",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// State of the dry-run path, independent of [`RunState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationState {
    Idle,
    Simulating,
    Simulated,
}

// ---------------------------------------------------------------------------
// Errors as reported to observers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    UnknownCommand,
    IoError,
    Timeout,
    Interrupted,
    Busy,
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&s)
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// The step that was active when a run stopped early.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoppedStep {
    /// 1-based position in the sequence.
    pub step: usize,
    pub description: String,
    pub error: ErrorInfo,
}

/// Terminal result of one real run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub name: Option<String>,
    pub state: RunState,
    pub steps_completed: usize,
    pub work_performed: u64,
    pub total_work: u64,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<StoppedStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationStep {
    pub label: String,
    pub seconds: f64,
}

/// Result of a simulation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub run_id: String,
    pub name: Option<String>,
    pub total_seconds: f64,
    pub total_work: u64,
    pub steps: Vec<SimulationStep>,
}

/// Point-in-time view of a run for status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub state: RunState,
    pub performed: u64,
    pub total: u64,
    pub fraction: f64,
    /// 1-based number of the top-level step being executed.
    pub current_step: Option<usize>,
    pub current_status: Option<String>,
}

/// Events republished by the sequencer while a run is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    StateChanged { state: RunState },
    StepStarted { step: usize, description: String },
    WorkPerformed { performed: u64, total: u64 },
    StepFinished { step: usize, status: StepStatus },
    Finished { report: RunReport },
}

// ---------------------------------------------------------------------------
// Serve / daemon protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Generate a new run ID (UUIDv4).
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Format seconds as `HH:MM:SS.mmm`.
pub fn format_seconds(seconds: f64) -> String {
    let millis = (seconds.max(0.0) * 1000.0).round() as u64;
    let (h, rest) = (millis / 3_600_000, millis % 3_600_000);
    let (m, rest) = (rest / 60_000, rest % 60_000);
    let (s, ms) = (rest / 1000, rest % 1000);
    format!("{:02}:{:02}:{:02}.{:03}", h, m, s, ms)
}
