//! `scanctl` – operator and test harness for the scan engine.
//!
//! Loads scan sequences from YAML, estimates them, runs them against the
//! configured in-memory process with live progress, and exposes a daemon for
//! out-of-process control. `read` and `write` talk to that daemon.

mod config;
mod logging;
mod serve;

use anyhow::Context;
use clap::{Parser, Subcommand};
use scan_engine::scenario::load_sequence_file;
use scan_engine::types::*;
use scan_engine::{ExpressionEval, LiteralEvaluator, Sequencer, ValueIo};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

/// Exit status for input and configuration errors.
const EXIT_INPUT: i32 = 2;

// ===========================================================================
// CLI definition
// ===========================================================================

#[derive(Parser)]
#[command(
    name = "scanctl",
    version,
    about = "Simulate, run and control scan sequences"
)]
struct Cli {
    /// Config file (default: ./scanctl.yaml, then the bundled one).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate a sequence's duration without touching live values.
    Simulate {
        /// Path to the sequence YAML file.
        file: PathBuf,
        /// Output as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,
        /// Write the simulation report JSON to this path.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Run a sequence against the configured process.
    Run {
        /// Path to the sequence YAML file.
        file: PathBuf,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
        /// Directory for artifacts output.
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },

    /// Read one channel of a running daemon's process.
    Read {
        channel: String,
        /// Socket of the daemon started with `scanctl serve`.
        #[arg(long)]
        socket: PathBuf,
        #[arg(long)]
        json: bool,
    },

    /// Write one channel of a running daemon's process.
    Write {
        channel: String,
        value: f64,
        /// Socket of the daemon started with `scanctl serve`.
        #[arg(long)]
        socket: PathBuf,
        #[arg(long)]
        json: bool,
    },

    /// Start daemon mode over a Unix socket.
    Serve {
        /// Path for the Unix domain socket.
        #[arg(long)]
        socket: PathBuf,
    },
}

// ===========================================================================
// Main
// ===========================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match config::load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: failed to load configuration: {}", e);
            std::process::exit(EXIT_INPUT);
        }
    };
    logging::init_logging(&config.logging);

    let code = match dispatch(cli.command, &config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            EXIT_INPUT
        }
    };
    std::process::exit(code);
}

async fn dispatch(command: Commands, config: &config::ScanctlConfig) -> anyhow::Result<i32> {
    match command {
        Commands::Simulate { file, json, out } => cmd_simulate(&file, json, out, config),
        Commands::Run {
            file,
            json,
            yes,
            artifacts,
        } => cmd_run(&file, json, yes, artifacts, config).await,
        Commands::Read {
            channel,
            socket,
            json,
        } => {
            let params = serde_json::json!({ "channel": channel });
            cmd_channel(&socket, "read", params, json).await
        }
        Commands::Write {
            channel,
            value,
            socket,
            json,
        } => {
            let params = serde_json::json!({ "channel": channel, "value": value });
            cmd_channel(&socket, "write", params, json).await
        }
        Commands::Serve { socket } => {
            serve::run_daemon(socket, serve::Daemon::new(config)).await?;
            Ok(0)
        }
    }
}

// ===========================================================================
// Subcommand implementations
// ===========================================================================

fn evaluator() -> Arc<dyn ExpressionEval> {
    Arc::new(LiteralEvaluator)
}

/// Load and compile a sequence file. Rejections are reported and mapped to
/// the input-error exit status.
fn prepare(file: &Path, config: &config::ScanctlConfig, json: bool) -> Result<Sequencer, i32> {
    let sequence = match load_sequence_file(file) {
        Ok(s) => s,
        Err(e) => {
            let info = ErrorInfo {
                code: ErrorCode::InvalidInput,
                message: e,
            };
            report_error(&info, json);
            return Err(EXIT_INPUT);
        }
    };
    Sequencer::new(sequence, config.engine_options()).map_err(|e| {
        report_error(&e.to_info(), json);
        EXIT_INPUT
    })
}

fn cmd_simulate(
    file: &Path,
    json: bool,
    out: Option<PathBuf>,
    config: &config::ScanctlConfig,
) -> anyhow::Result<i32> {
    let sequencer = match prepare(file, config, json) {
        Ok(s) => s,
        Err(code) => return Ok(code),
    };
    let report = match sequencer.simulate(&config.simulation_profile(), evaluator()) {
        Ok(r) => r,
        Err(e) => {
            report_error(&e.to_info(), json);
            return Ok(exit_code_for_error(&e.to_info()));
        }
    };

    if let Some(ref path) = out {
        write_json_file(path, &report)?;
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_simulation(&report);
    }
    Ok(0)
}

async fn cmd_run(
    file: &Path,
    json: bool,
    yes: bool,
    artifacts: Option<PathBuf>,
    config: &config::ScanctlConfig,
) -> anyhow::Result<i32> {
    let sequencer = match prepare(file, config, json) {
        Ok(s) => s,
        Err(code) => return Ok(code),
    };
    let estimate = match sequencer.simulate(&config.simulation_profile(), evaluator()) {
        Ok(r) => r,
        Err(e) => {
            report_error(&e.to_info(), json);
            return Ok(exit_code_for_error(&e.to_info()));
        }
    };

    if !yes {
        let prompt = format!(
            "Run '{}' ({} steps, estimated {})?",
            estimate.name.as_deref().unwrap_or("<unnamed>"),
            sequencer.sequence().steps.len(),
            format_seconds(estimate.total_seconds)
        );
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("confirmation prompt failed (use --yes when not on a terminal)")?;
        if !confirmed {
            eprintln!("run cancelled");
            return Ok(0);
        }
    }

    let events = sequencer.subscribe();
    let io: Arc<dyn ValueIo> = Arc::new(config.process());
    let runner = sequencer.clone();
    let eval = evaluator();
    let mut worker = tokio::task::spawn_blocking(move || runner.execute(io, eval));

    let mut interrupt = signal(SignalKind::interrupt()).context("cannot install Ctrl-C handler")?;
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let joined = loop {
        tokio::select! {
            joined = &mut worker => break joined,
            _ = interrupt.recv() => {
                eprintln!("abort requested");
                sequencer.abort();
            }
            _ = ticker.tick() => {
                if !json {
                    print_progress(&sequencer.progress());
                }
            }
        }
    };
    let report = match joined.context("scan worker panicked")? {
        Ok(r) => r,
        Err(e) => {
            report_error(&e.to_info(), json);
            return Ok(exit_code_for_error(&e.to_info()));
        }
    };

    let events: Vec<ScanEvent> = events.try_iter().collect();
    if let Some(ref dir) = artifacts {
        write_artifacts(dir, &report, &events);
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(exit_code(report.state))
}

/// Forward a `read` or `write` to the daemon on `socket`.
async fn cmd_channel(
    socket: &Path,
    method: &str,
    params: serde_json::Value,
    json: bool,
) -> anyhow::Result<i32> {
    let response = serve::request(socket, method, params).await?;
    if let Some(info) = response.error {
        report_error(&info, json);
        return Ok(1);
    }
    let result = response.result.unwrap_or_default();
    if json {
        println!("{}", result);
    } else {
        let arrow = if method == "write" { "<-" } else { "=" };
        println!(
            "{} {} {}",
            result["channel"].as_str().unwrap_or_default(),
            arrow,
            result["value"]
        );
    }
    Ok(0)
}

// ===========================================================================
// Output helpers
// ===========================================================================

fn exit_code(state: RunState) -> i32 {
    match state {
        RunState::Finished => 0,
        _ => 1,
    }
}

fn exit_code_for_error(info: &ErrorInfo) -> i32 {
    match info.code {
        ErrorCode::InvalidInput | ErrorCode::UnknownCommand => EXIT_INPUT,
        _ => 1,
    }
}

fn report_error(info: &ErrorInfo, json: bool) {
    if json {
        let j = serde_json::to_string_pretty(&serde_json::json!({ "error": info }))
            .unwrap_or_default();
        println!("{}", j);
    } else {
        eprintln!("[ERROR] {} – {}", info.code, info.message);
    }
}

fn print_simulation(r: &SimulationReport) {
    println!(
        "[SIMULATED] {}",
        r.name.as_deref().unwrap_or("<unnamed>")
    );
    for step in &r.steps {
        println!("  {:>12}  {}", format_seconds(step.seconds), step.label);
    }
    println!("  total:  {} ({} work units)", format_seconds(r.total_seconds), r.total_work);
}

fn print_progress(p: &ProgressSnapshot) {
    let step = p
        .current_step
        .map(|s| format!("step {}", s))
        .unwrap_or_else(|| "-".into());
    eprintln!(
        "  [{:>5.1}%] {} {}: {}",
        p.fraction * 100.0,
        p.state,
        step,
        p.current_status.as_deref().unwrap_or("")
    );
}

fn print_report(r: &RunReport) {
    let status_icon = match r.state {
        RunState::Finished => "FINISHED",
        RunState::Aborted => "ABORTED",
        RunState::Failed => "FAILED",
        _ => "INCOMPLETE",
    };

    println!(
        "[{}] {}",
        status_icon,
        r.name.as_deref().unwrap_or("<unnamed>")
    );
    println!("  run_id:  {}", r.run_id);
    println!("  work:    {}/{}", r.work_performed, r.total_work);
    println!("  elapsed: {}", format_seconds(r.elapsed_ms as f64 / 1000.0));

    if let Some(ref stopped) = r.stopped_at {
        println!("  stopped at step {}: {}", stopped.step, stopped.description);
        println!("  error:   {} – {}", stopped.error.code, stopped.error.message);
    }
}

// ===========================================================================
// Artifact helpers
// ===========================================================================

fn write_json_file<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let j = serde_json::to_string_pretty(value)?;
    std::fs::write(path, j).with_context(|| format!("failed to write {}", path.display()))
}

/// `<dir>/<run_id>/result.json` plus one event per line in `events.jsonl`.
fn write_artifacts(dir: &Path, report: &RunReport, events: &[ScanEvent]) -> Option<PathBuf> {
    let art_dir = dir.join(&report.run_id);
    if let Err(e) = std::fs::create_dir_all(&art_dir) {
        eprintln!(
            "warning: failed to create artifacts dir {}: {}",
            art_dir.display(),
            e
        );
        return None;
    }

    if let Err(e) = write_json_file(&art_dir.join("result.json"), report) {
        eprintln!("warning: {:#}", e);
    }

    let mut lines = String::new();
    for event in events {
        if let Ok(line) = serde_json::to_string(event) {
            lines.push_str(&line);
            lines.push('\n');
        }
    }
    if let Err(e) = std::fs::write(art_dir.join("events.jsonl"), lines) {
        eprintln!("warning: failed to write events.jsonl: {}", e);
    }
    Some(art_dir)
}
