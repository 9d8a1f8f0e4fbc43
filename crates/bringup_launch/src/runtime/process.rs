//! Child process spawning and the live process set

use crate::config::{ActionId, OutputPolicy};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

/// Node name pattern matching every node in a parameters file
pub const PARAMS_WILDCARD: &str = "/**";

/// Configuration for spawning a process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Process name (for logging)
    pub name: String,
    /// Executable path
    pub executable: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
    /// Output routing
    pub output: OutputPolicy,
    /// Node parameters, handed over in a generated parameters file
    pub parameters: IndexMap<String, String>,
}

impl ProcessConfig {
    /// Full command line, for display
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.executable.clone()
        } else {
            format!("{} {}", self.executable, self.args.join(" "))
        }
    }

    /// Write the node parameters to `<dir>/<name>-params.yaml` and return a
    /// config whose command line points at that file
    pub async fn with_params_file(&self, dir: &Path) -> Result<ProcessConfig, ActionSpawnError> {
        let path = dir.join(format!("{}-params.yaml", self.name));
        let yaml = params_yaml(&self.parameters).map_err(|e| ActionSpawnError::Params {
            name: self.name.clone(),
            path: path.clone(),
            reason: e.to_string(),
        })?;
        tokio::fs::write(&path, yaml)
            .await
            .map_err(|e| ActionSpawnError::Params {
                name: self.name.clone(),
                path: path.clone(),
                reason: e.to_string(),
            })?;
        log::debug!("[{}] Parameters written to {}", self.name, path.display());

        let mut config = self.clone();
        config.args.push("--params-file".to_string());
        config.args.push(path.to_string_lossy().into_owned());
        Ok(config)
    }
}

/// `/**: {ros__parameters: {...}}`
fn params_yaml(parameters: &IndexMap<String, String>) -> Result<String, serde_yaml::Error> {
    let mut values = serde_yaml::Mapping::new();
    for (key, value) in parameters {
        values.insert(key.as_str().into(), parameter_value(value));
    }
    let mut node = serde_yaml::Mapping::new();
    node.insert("ros__parameters".into(), serde_yaml::Value::Mapping(values));
    let mut root = serde_yaml::Mapping::new();
    root.insert(PARAMS_WILDCARD.into(), serde_yaml::Value::Mapping(node));
    serde_yaml::to_string(&root)
}

/// Booleans and numbers keep their type; everything else stays a string
fn parameter_value(text: &str) -> serde_yaml::Value {
    match serde_yaml::from_str::<serde_yaml::Value>(text) {
        Ok(value @ (serde_yaml::Value::Bool(_) | serde_yaml::Value::Number(_))) => value,
        _ => serde_yaml::Value::String(text.to_string()),
    }
}

/// How a process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitOutcome {
    /// Exited on its own; `None` when killed by a signal
    Exited(Option<i32>),
    /// Stopped by the launcher during shutdown
    Terminated,
    /// Could not be started
    SpawnFailed(String),
}

impl ExitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(Some(0)))
    }

    /// Counts against the overall result
    pub fn is_failure(&self) -> bool {
        match self {
            ExitOutcome::Exited(code) => *code != Some(0),
            ExitOutcome::Terminated => false,
            ExitOutcome::SpawnFailed(_) => true,
        }
    }
}

/// Exit notification sent by a process waiter
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub id: ActionId,
    pub outcome: ExitOutcome,
}

/// Stop request handled by a process waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopRequest {
    Terminate,
    Kill,
}

/// A spawned process tracked by the live set
#[derive(Debug)]
pub struct LiveProcess {
    pub name: String,
    pub pid: Option<u32>,
    stop_tx: mpsc::UnboundedSender<StopRequest>,
    kill_sent: bool,
}

impl LiveProcess {
    /// Ask the waiter for a graceful stop
    fn terminate(&mut self) {
        log::info!("[{}] Stopping process...", self.name);
        let _ = self.stop_tx.send(StopRequest::Terminate);
    }

    /// Forcefully kill the child through its waiter
    fn kill(&mut self) {
        if !self.kill_sent {
            log::warn!("[{}] Process did not exit gracefully, forcing kill", self.name);
            let _ = self.stop_tx.send(StopRequest::Kill);
            self.kill_sent = true;
        }
    }
}

/// Running child processes, keyed by action.
///
/// The dispatcher inserts on spawn and removes on exit; shutdown signals
/// entries through the same lock. Cloning shares the underlying set.
#[derive(Debug, Clone, Default)]
pub struct LiveProcessSet {
    inner: Arc<Mutex<IndexMap<ActionId, LiveProcess>>>,
}

impl LiveProcessSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: ActionId, process: LiveProcess) {
        self.inner.lock().await.insert(id, process);
    }

    pub async fn remove(&self, id: ActionId) -> Option<LiveProcess> {
        self.inner.lock().await.shift_remove(&id)
    }

    pub async fn contains(&self, id: ActionId) -> bool {
        self.inner.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Ids of running actions, in spawn order
    pub async fn ids(&self) -> Vec<ActionId> {
        self.inner.lock().await.keys().copied().collect()
    }

    /// Send a graceful stop request to every live process, newest first
    pub async fn terminate_all(&self) {
        let mut live = self.inner.lock().await;
        for (_, process) in live.iter_mut().rev() {
            process.terminate();
        }
    }

    /// Force-kill every live process
    pub async fn kill_all(&self) {
        let mut live = self.inner.lock().await;
        for (_, process) in live.iter_mut() {
            process.kill();
        }
    }
}

/// Spawns child processes and reports their exits
pub struct ManagedProcess;

impl ManagedProcess {
    /// Spawn `config` for action `id`.
    ///
    /// Output is routed per the config's [`OutputPolicy`]; file output goes to
    /// `<log_dir>/<name>-<pid>-{stdout,stderr}.log`. The exit is reported on
    /// `events` once the child has been reaped.
    pub async fn spawn(
        id: ActionId,
        config: &ProcessConfig,
        log_dir: Option<&Path>,
        events: mpsc::UnboundedSender<ExitEvent>,
    ) -> Result<LiveProcess, ActionSpawnError> {
        log::info!("[{}] Starting: {}", config.name, config.command_line());

        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            log::error!("[{}] Failed to spawn process: {}", config.name, e);
            ActionSpawnError::Spawn {
                name: config.name.clone(),
                executable: config.executable.clone(),
                source: e,
            }
        })?;

        let pid = child.id();
        log::info!(
            "[{}] Process started with PID: {}",
            config.name,
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
        );

        let file_base = match (config.output.to_file(), log_dir) {
            (true, Some(dir)) => Some(dir.join(format!(
                "{}-{}",
                config.name,
                pid.unwrap_or_default()
            ))),
            _ => None,
        };

        if let Some(stdout) = child.stdout.take() {
            let sink = OutputSink::new(
                &config.name,
                config.output,
                file_base.as_deref(),
                "stdout",
                false,
            );
            tokio::spawn(forward_lines(stdout, sink));
        }
        if let Some(stderr) = child.stderr.take() {
            let sink = OutputSink::new(
                &config.name,
                config.output,
                file_base.as_deref(),
                "stderr",
                true,
            );
            tokio::spawn(forward_lines(stderr, sink));
        }

        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        tokio::spawn(wait_for_exit(id, config.name.clone(), child, stop_rx, events));

        Ok(LiveProcess {
            name: config.name.clone(),
            pid,
            stop_tx,
            kill_sent: false,
        })
    }
}

/// Reap the child, delivering stop requests while it is still running.
///
/// Signals only go out before the child is reaped, so a recycled pid is
/// never hit. An exit after a delivered stop request is `Terminated`.
async fn wait_for_exit(
    id: ActionId,
    name: String,
    mut child: Child,
    mut stop_rx: mpsc::UnboundedReceiver<StopRequest>,
    events: mpsc::UnboundedSender<ExitEvent>,
) {
    let mut stopped = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(request) = stop_rx.recv() => {
                stopped = true;
                match request {
                    StopRequest::Terminate => terminate_child(&mut child),
                    StopRequest::Kill => {
                        let _ = child.start_kill();
                    }
                }
            }
        }
    };

    let outcome = match status {
        Ok(status) => {
            log::info!("[{}] Process exited with code: {:?}", name, status.code());
            if stopped {
                ExitOutcome::Terminated
            } else {
                ExitOutcome::Exited(status.code())
            }
        }
        Err(e) => {
            log::error!("[{}] Error waiting for process: {}", name, e);
            ExitOutcome::Exited(None)
        }
    };

    let _ = events.send(ExitEvent { id, outcome });
}

/// SIGTERM on Unix so the child can shut down cleanly
fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            return;
        }
    }

    // On non-Unix, just kill immediately
    let _ = child.start_kill();
}

/// Destination of one output stream
struct OutputSink {
    name: String,
    to_screen: bool,
    is_stderr: bool,
    file: Option<PathBuf>,
}

impl OutputSink {
    fn new(
        name: &str,
        policy: OutputPolicy,
        file_base: Option<&Path>,
        stream: &str,
        is_stderr: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            to_screen: policy.to_screen(),
            is_stderr,
            file: file_base
                .map(|base| PathBuf::from(format!("{}-{}.log", base.display(), stream))),
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, sink: OutputSink) {
    let mut file = match &sink.file {
        Some(path) => match tokio::fs::File::create(path).await {
            Ok(file) => Some(file),
            Err(e) => {
                log::warn!(
                    "[{}] Cannot write output to {}: {}",
                    sink.name,
                    path.display(),
                    e
                );
                None
            }
        },
        None => None,
    };

    // Undecodable bytes are replaced; the pipe is drained until EOF either way
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("[{}] Error reading output: {}", sink.name, e);
                break;
            }
        }
        if buf.ends_with(b"\n") {
            buf.pop();
        }
        let line = String::from_utf8_lossy(&buf);

        if sink.to_screen {
            if sink.is_stderr {
                log::warn!("[{}] {}", sink.name, line);
            } else {
                log::info!("[{}] {}", sink.name, line);
            }
        } else if file.is_none() {
            log::debug!("[{}] {}", sink.name, line);
        }

        if let Some(f) = file.as_mut() {
            let written = f.write_all(line.as_bytes()).await;
            if written.and(f.write_all(b"\n").await).is_err() {
                log::warn!("[{}] Failed to write output log", sink.name);
                file = None;
            }
        }
    }

    if let Some(mut f) = file {
        let _ = f.flush().await;
    }
}

/// Errors that can occur when starting an action's process
#[derive(Debug, thiserror::Error)]
pub enum ActionSpawnError {
    #[error("Failed to spawn process '{name}' ({executable}): {source}")]
    Spawn {
        name: String,
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write parameters for '{name}' to {}: {reason}", path.display())]
    Params {
        name: String,
        path: PathBuf,
        reason: String,
    },
}
