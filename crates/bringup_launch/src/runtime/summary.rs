//! Per-action terminal states and the overall result of a run

use crate::config::ActionId;
use crate::runtime::process::ExitOutcome;
use serde::Serialize;
use std::fmt;
use std::time::Instant;

/// Why an action never started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Its condition evaluated to false
    Condition,
    /// No handler that could start it fired
    TriggerNeverFired,
    /// The run was interrupted first
    Cancelled,
}

/// Lifecycle state of an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Pending,
    Running { pid: Option<u32> },
    Skipped(SkipReason),
    Exited(ExitOutcome),
}

impl ActionState {
    pub fn is_pending(&self) -> bool {
        matches!(self, ActionState::Pending)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ActionState::Running { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionState::Skipped(_) | ActionState::Exited(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ActionState::Exited(outcome) if outcome.is_failure())
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionState::Pending => write!(f, "pending"),
            ActionState::Running { pid: Some(pid) } => write!(f, "running (pid {})", pid),
            ActionState::Running { pid: None } => write!(f, "running"),
            ActionState::Skipped(SkipReason::Condition) => write!(f, "skipped (condition false)"),
            ActionState::Skipped(SkipReason::TriggerNeverFired) => {
                write!(f, "skipped (trigger never fired)")
            }
            ActionState::Skipped(SkipReason::Cancelled) => write!(f, "skipped (cancelled)"),
            ActionState::Exited(ExitOutcome::Exited(Some(code))) => {
                write!(f, "exited (code {})", code)
            }
            ActionState::Exited(ExitOutcome::Exited(None)) => write!(f, "exited (signal)"),
            ActionState::Exited(ExitOutcome::Terminated) => write!(f, "terminated"),
            ActionState::Exited(ExitOutcome::SpawnFailed(error)) => {
                write!(f, "failed to spawn: {}", error)
            }
        }
    }
}

/// What happened to one action
#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    pub id: ActionId,
    pub label: String,
    pub state: ActionState,
    pub pid: Option<u32>,
    #[serde(skip)]
    pub started_at: Option<Instant>,
    #[serde(skip)]
    pub exited_at: Option<Instant>,
    /// Wall time between spawn and exit
    pub runtime_ms: Option<u64>,
}

impl ActionReport {
    pub fn new(id: ActionId, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            state: ActionState::Pending,
            pid: None,
            started_at: None,
            exited_at: None,
            runtime_ms: None,
        }
    }

    /// Whether a process was ever spawned for this action
    pub fn was_spawned(&self) -> bool {
        self.started_at.is_some()
    }
}

/// Result of [`Executor::run`](crate::runtime::Executor::run)
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Reports in plan (insertion) order
    pub actions: Vec<ActionReport>,
    /// Whether the run was stopped by a shutdown request
    pub interrupted: bool,
}

impl RunSummary {
    pub fn report(&self, id: ActionId) -> Option<&ActionReport> {
        self.actions.iter().find(|r| r.id == id)
    }

    pub fn find(&self, label: &str) -> Option<&ActionReport> {
        self.actions.iter().find(|r| r.label == label)
    }

    /// Actions that exited non-zero or failed to spawn
    pub fn failures(&self) -> impl Iterator<Item = &ActionReport> {
        self.actions.iter().filter(|r| r.state.is_failure())
    }

    pub fn success(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Process exit code for the launcher
    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Launch Summary")?;
        writeln!(f, "==============")?;
        let width = self
            .actions
            .iter()
            .map(|r| r.label.len())
            .max()
            .unwrap_or(0);
        for report in &self.actions {
            writeln!(f, "  {:<width$}  {}", report.label, report.state, width = width)?;
        }
        if self.interrupted {
            writeln!(f, "Run interrupted by shutdown request")?;
        }
        write!(
            f,
            "Result: {}",
            if self.success() { "success" } else { "FAILED" }
        )
    }
}
