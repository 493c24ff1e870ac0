//! Daemon mode – newline-delimited JSON requests over a Unix socket.
//!
//! One sequence runs at a time. `submit` starts it on a blocking worker and
//! returns immediately; `status`, `pause`, `resume`, `abort` and `skip` act on
//! it from any connection. `read` and `write` act on the daemon's process,
//! which lives as long as the daemon does.

use crate::config::ScanctlConfig;
use anyhow::Context;
use scan_engine::scenario::load_sequence;
use scan_engine::types::*;
use scan_engine::{
    EngineOptions, ExpressionEval, LiteralEvaluator, MemoryProcess, ScanError, Sequencer,
    SimulationProfile, ValueIo,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct Job {
    sequencer: Sequencer,
    worker: JoinHandle<()>,
}

pub struct Daemon {
    options: EngineOptions,
    profile: SimulationProfile,
    process: Arc<MemoryProcess>,
    eval: Arc<dyn ExpressionEval>,
    job: Mutex<Option<Job>>,
    last_report: Arc<Mutex<Option<RunReport>>>,
}

impl Daemon {
    pub fn new(config: &ScanctlConfig) -> Self {
        Self {
            options: config.engine_options(),
            profile: config.simulation_profile(),
            process: Arc::new(config.process()),
            eval: Arc::new(LiteralEvaluator),
            job: Mutex::new(None),
            last_report: Arc::new(Mutex::new(None)),
        }
    }
}

pub async fn run_daemon(socket_path: PathBuf, daemon: Daemon) -> anyhow::Result<()> {
    // Remove stale socket if it exists
    let _ = std::fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path)
        .map_err(|e| anyhow::anyhow!("cannot bind socket {}: {}", socket_path.display(), e))?;

    eprintln!("scanctl daemon listening on {}", socket_path.display());
    let daemon = Arc::new(daemon);

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let daemon = daemon.clone();
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.into_split();
                    let mut lines = BufReader::new(reader).lines();

                    while let Ok(Some(line)) = lines.next_line().await {
                        let response = handle_request(&line, &daemon).await;
                        let mut resp_json =
                            serde_json::to_string(&response).unwrap_or_else(|_| "{}".into());
                        resp_json.push('\n');
                        if writer.write_all(resp_json.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept error");
            }
        }
    }
}

/// Client side: send one request to a running daemon and wait for its reply.
pub async fn request(
    socket_path: &Path,
    method: &str,
    params: Value,
) -> anyhow::Result<DaemonResponse> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("cannot connect to daemon at {}", socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();

    let req = DaemonRequest {
        id: new_run_id(),
        method: method.to_string(),
        params,
    };
    let mut req_json = serde_json::to_string(&req)?;
    req_json.push('\n');
    writer.write_all(req_json.as_bytes()).await?;

    let line = BufReader::new(reader)
        .lines()
        .next_line()
        .await?
        .context("daemon closed the connection without replying")?;
    let response: DaemonResponse =
        serde_json::from_str(&line).context("invalid daemon response")?;
    if response.id != req.id {
        anyhow::bail!("daemon answered request {} instead of {}", response.id, req.id);
    }
    Ok(response)
}

fn error_info(code: ErrorCode, message: impl Into<String>) -> ErrorInfo {
    ErrorInfo {
        code,
        message: message.into(),
    }
}

pub async fn handle_request(line: &str, daemon: &Daemon) -> DaemonResponse {
    let req: DaemonRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            return DaemonResponse {
                id: "unknown".into(),
                result: None,
                error: Some(error_info(
                    ErrorCode::InvalidInput,
                    format!("invalid JSON request: {}", e),
                )),
            };
        }
    };

    tracing::debug!(id = %req.id, method = %req.method, "daemon request");
    let outcome = match req.method.as_str() {
        "simulate" => simulate(&req.params, daemon),
        "submit" => submit(&req.params, daemon).await,
        "pause" | "resume" | "abort" => control(&req.method, daemon).await,
        "skip" => skip(daemon).await,
        "status" => Ok(status(daemon).await),
        "read" => read(&req.params, daemon),
        "write" => write(&req.params, daemon),
        other => Err(error_info(
            ErrorCode::InvalidInput,
            format!("unknown method: {}", other),
        )),
    };

    match outcome {
        Ok(result) => DaemonResponse {
            id: req.id,
            result: Some(result),
            error: None,
        },
        Err(error) => DaemonResponse {
            id: req.id,
            result: None,
            error: Some(error),
        },
    }
}

// ===========================================================================
// Methods
// ===========================================================================

/// Accepts `{"yaml": "..."}` or `{"sequence": {...}}`.
fn sequence_param(params: &Value) -> Result<Sequence, ErrorInfo> {
    if let Some(yaml) = params.get("yaml").and_then(Value::as_str) {
        return load_sequence(yaml).map_err(|e| error_info(ErrorCode::InvalidInput, e));
    }
    match params.get("sequence") {
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| error_info(ErrorCode::InvalidInput, format!("invalid sequence: {}", e))),
        None => Err(error_info(
            ErrorCode::InvalidInput,
            "expected 'yaml' or 'sequence' param",
        )),
    }
}

fn channel_param(params: &Value) -> Result<&str, ErrorInfo> {
    params
        .get("channel")
        .and_then(Value::as_str)
        .ok_or_else(|| error_info(ErrorCode::InvalidInput, "missing 'channel' param"))
}

fn to_value<T: serde::Serialize>(v: &T) -> Result<Value, ErrorInfo> {
    serde_json::to_value(v).map_err(|e| error_info(ErrorCode::InternalError, e.to_string()))
}

fn simulate(params: &Value, daemon: &Daemon) -> Result<Value, ErrorInfo> {
    let sequence = sequence_param(params)?;
    let sequencer = Sequencer::new(sequence, daemon.options.clone()).map_err(|e| e.to_info())?;
    let report = sequencer
        .simulate(&daemon.profile, daemon.eval.clone())
        .map_err(|e| e.to_info())?;
    to_value(&report)
}

async fn submit(params: &Value, daemon: &Daemon) -> Result<Value, ErrorInfo> {
    let sequence = sequence_param(params)?;
    let mut job = daemon.job.lock().await;
    if let Some(current) = job.as_ref() {
        if !current.worker.is_finished() {
            return Err(ScanError::Busy(format!(
                "sequence is {}",
                current.sequencer.state()
            ))
            .to_info());
        }
    }

    let sequencer = Sequencer::new(sequence, daemon.options.clone()).map_err(|e| e.to_info())?;
    let total_work = sequencer.total_work();
    let io: Arc<dyn ValueIo> = daemon.process.clone();
    let eval = daemon.eval.clone();
    let last_report = daemon.last_report.clone();
    let runner = sequencer.clone();
    let worker = tokio::task::spawn_blocking(move || {
        let report = runner.execute(io, eval);
        match report {
            Ok(report) => *last_report.blocking_lock() = Some(report),
            Err(e) => tracing::warn!(error = %e, "submitted run rejected"),
        }
    });
    *job = Some(Job { sequencer, worker });
    Ok(json!({ "accepted": true, "total_work": total_work }))
}

async fn control(method: &str, daemon: &Daemon) -> Result<Value, ErrorInfo> {
    let job = daemon.job.lock().await;
    let Some(job) = job.as_ref() else {
        return Ok(json!({ "state": RunState::Idle }));
    };
    match method {
        "pause" => job.sequencer.pause(),
        "resume" => job.sequencer.resume(),
        _ => job.sequencer.abort(),
    }
    Ok(json!({ "state": job.sequencer.state() }))
}

async fn skip(daemon: &Daemon) -> Result<Value, ErrorInfo> {
    let job = daemon.job.lock().await;
    let skipped = job
        .as_ref()
        .map(|j| j.sequencer.skip_current())
        .unwrap_or(false);
    Ok(json!({ "skipped": skipped }))
}

async fn status(daemon: &Daemon) -> Value {
    let progress = daemon
        .job
        .lock()
        .await
        .as_ref()
        .map(|j| j.sequencer.progress());
    let last_report = daemon.last_report.lock().await.clone();
    json!({ "progress": progress, "last_report": last_report })
}

fn read(params: &Value, daemon: &Daemon) -> Result<Value, ErrorInfo> {
    let channel = channel_param(params)?;
    let value = daemon
        .process
        .read(channel)
        .map_err(|e| ScanError::live_io(channel, e).to_info())?;
    Ok(json!({ "channel": channel, "value": value }))
}

fn write(params: &Value, daemon: &Daemon) -> Result<Value, ErrorInfo> {
    let channel = channel_param(params)?;
    let value = params
        .get("value")
        .and_then(Value::as_f64)
        .ok_or_else(|| error_info(ErrorCode::InvalidInput, "missing numeric 'value' param"))?;
    daemon
        .process
        .write(channel, value)
        .map_err(|e| ScanError::live_io(channel, e).to_info())?;
    Ok(json!({ "channel": channel, "value": value }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;
    use std::path::Path;
    use std::time::Duration;

    fn daemon() -> Daemon {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(crate::config::CONFIG_FILE);
        let mut config = load_config(Some(&path)).expect("bundled config");
        config.engine.poll_interval_ms = 10;
        Daemon::new(&config)
    }

    async fn call(daemon: &Daemon, method: &str, params: Value) -> DaemonResponse {
        let line = json!({ "id": "t", "method": method, "params": params }).to_string();
        handle_request(&line, daemon).await
    }

    async fn wait_for_state(daemon: &Daemon, want: &str) -> Value {
        for _ in 0..500 {
            let resp = call(daemon, "status", Value::Null).await;
            let result = resp.result.unwrap();
            if result["progress"]["state"] == want {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never reached state {}", want);
    }

    #[tokio::test]
    async fn test_invalid_json_request() {
        let resp = handle_request("{nope", &daemon()).await;
        assert_eq!(resp.id, "unknown");
        assert_eq!(resp.error.unwrap().code, ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let resp = call(&daemon(), "teleport", Value::Null).await;
        assert_eq!(resp.id, "t");
        assert!(resp.result.is_none());
        assert!(resp.error.unwrap().message.contains("teleport"));
    }

    #[tokio::test]
    async fn test_read_write_channels() {
        let d = daemon();
        let resp = call(&d, "read", json!({ "channel": "temp" })).await;
        assert_eq!(resp.result.unwrap()["value"], 20.0);

        let resp = call(&d, "write", json!({ "channel": "shutter", "value": 1.0 })).await;
        assert!(resp.error.is_none());
        let resp = call(&d, "read", json!({ "channel": "shutter" })).await;
        assert_eq!(resp.result.unwrap()["value"], 1.0);

        let resp = call(&d, "read", json!({ "channel": "nope" })).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::IoError);
    }

    #[tokio::test]
    async fn test_client_values_persist_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("scanctl.sock");
        let server = tokio::spawn(run_daemon(socket.clone(), daemon()));
        for _ in 0..500 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let params = json!({ "channel": "shutter", "value": 1.0 });
        let resp = request(&socket, "write", params).await.unwrap();
        assert!(resp.error.is_none());
        let resp = request(&socket, "read", json!({ "channel": "shutter" }))
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()["value"], 1.0);

        let resp = request(&socket, "read", json!({ "channel": "nope" }))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, ErrorCode::IoError);
        server.abort();
    }

    #[tokio::test]
    async fn test_client_reports_missing_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let err = request(&dir.path().join("absent.sock"), "status", Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot connect"));
    }

    #[tokio::test]
    async fn test_simulate_yaml() {
        let yaml = "steps:\n  - kind: delay\n    params: { seconds: 2 }\n  - kind: delay\n    params: { seconds: 3 }\n";
        let resp = call(&daemon(), "simulate", json!({ "yaml": yaml })).await;
        let result = resp.result.unwrap();
        assert_eq!(result["total_seconds"], 5.0);
        assert_eq!(result["total_work"], 2);
    }

    #[tokio::test]
    async fn test_simulate_rejects_unknown_kind() {
        let seq = json!({ "steps": [ { "kind": "acquire" } ] });
        let resp = call(&daemon(), "simulate", json!({ "sequence": seq })).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::UnknownCommand);
    }

    #[tokio::test]
    async fn test_control_without_job_is_noop() {
        let d = daemon();
        let resp = call(&d, "abort", Value::Null).await;
        assert_eq!(resp.result.unwrap()["state"], "idle");
        let resp = call(&d, "skip", Value::Null).await;
        assert_eq!(resp.result.unwrap()["skipped"], false);
        let resp = call(&d, "status", Value::Null).await;
        assert!(resp.result.unwrap()["progress"].is_null());
    }

    #[tokio::test]
    async fn test_submit_busy_then_abort() {
        let d = daemon();
        let yaml = "name: long\nsteps:\n  - kind: delay\n    params: { seconds: 30 }\n";
        let resp = call(&d, "submit", json!({ "yaml": yaml })).await;
        assert_eq!(resp.result.unwrap()["accepted"], true);

        wait_for_state(&d, "running").await;
        let resp = call(&d, "submit", json!({ "yaml": yaml })).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::Busy);

        let resp = call(&d, "pause", Value::Null).await;
        assert_eq!(resp.result.unwrap()["state"], "paused");
        call(&d, "abort", Value::Null).await;

        let status = wait_for_state(&d, "aborted").await;
        // The worker stores the report right after the state flips.
        for _ in 0..100 {
            if d.last_report.lock().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let report = d.last_report.lock().await.clone().unwrap();
        assert_eq!(report.state, RunState::Aborted);
        assert_eq!(report.name.as_deref(), Some("long"));
        assert_eq!(status["progress"]["total"], 1);
    }

    #[tokio::test]
    async fn test_skip_submitted_delay() {
        let d = daemon();
        let yaml = "steps:\n  - kind: delay\n    params: { seconds: 30 }\n";
        call(&d, "submit", json!({ "yaml": yaml })).await;
        wait_for_state(&d, "running").await;
        let mut skipped = false;
        for _ in 0..500 {
            let resp = call(&d, "skip", Value::Null).await;
            if resp.result.unwrap()["skipped"] == true {
                skipped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(skipped);
        wait_for_state(&d, "finished").await;
    }
}
