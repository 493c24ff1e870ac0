use config::{Config, ConfigError, Environment, File};
use scan_engine::simulation::SimulatedChannel;
use scan_engine::{EngineOptions, MemoryProcess, SimulationProfile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "scanctl.yaml";
pub const LOCAL_CONFIG_FILE: &str = ".scanctl.yaml";
pub const ENV_PREFIX: &str = "SCANCTL";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScanctlConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SimulationConfig {
    /// Units per second for channels not listed under `process.channels`.
    /// A listed channel without `slew_rate` moves instantly, as it does in
    /// the process.
    pub default_slew_rate: Option<f64>,
}

/// Channels of the in-memory process the CLI runs against.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ProcessConfig {
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ChannelConfig {
    #[serde(default)]
    pub initial: f64,
    pub slew_rate: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub verbose: bool,
    pub format: LoggingFormatConfig,
    pub levels: LoggingLevelsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingFormatConfig {
    pub show_time: bool,
    /// One JSON object per line instead of the human format.
    #[serde(default)]
    pub json: bool,
    pub location: LoggingLocationConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingLocationConfig {
    pub show_file: bool,
    pub show_line: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingLevelsConfig {
    pub debug: bool,
    pub info: bool,
    pub warning: bool,
    pub error: bool,
}

impl ScanctlConfig {
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            poll_interval: Duration::from_millis(self.engine.poll_interval_ms.max(1)),
        }
    }

    /// The simulator starts from the same channel values and slew rates the
    /// process does.
    pub fn simulation_profile(&self) -> SimulationProfile {
        SimulationProfile {
            channels: self
                .process
                .channels
                .iter()
                .map(|(name, c)| {
                    let channel = SimulatedChannel {
                        initial: Some(c.initial),
                        slew_rate: c.slew_rate,
                    };
                    (name.clone(), channel)
                })
                .collect(),
            default_slew_rate: self.simulation.default_slew_rate,
        }
    }

    pub fn process(&self) -> MemoryProcess {
        let process = MemoryProcess::new();
        for (name, c) in &self.process.channels {
            process.declare(name, c.initial, c.slew_rate);
        }
        process
    }
}

/// `scanctl.yaml` in the working directory, falling back to the copy next to
/// this crate's manifest.
fn default_config_path() -> PathBuf {
    let cwd = Path::new(CONFIG_FILE);
    if cwd.exists() {
        cwd.to_path_buf()
    } else {
        Path::new(env!("CARGO_MANIFEST_DIR")).join(CONFIG_FILE)
    }
}

/// Layered load: the main file (mandatory), a `.scanctl.yaml` beside it
/// (optional), then `SCANCTL__SECTION__KEY` environment variables.
pub fn load_config(explicit: Option<&Path>) -> Result<ScanctlConfig, ConfigError> {
    let config_path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);
    let local_config_path = config_path.with_file_name(LOCAL_CONFIG_FILE);

    let builder = Config::builder()
        .add_source(File::from(config_path).required(true))
        .add_source(File::from(local_config_path).required(false))
        // Map nested env vars like SCANCTL__ENGINE__POLL_INTERVAL_MS=50
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    builder.build()?.try_deserialize()
}
