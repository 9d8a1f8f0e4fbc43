//! Launch executor - resolves a plan and drives it to completion

use crate::config::{
    find_executable, ActionId, ExecutableRef, LaunchDescription, Substitution,
    SubstitutionContext, SubstitutionError, SubstitutionResolver,
};
use crate::runtime::plan::{LaunchPlan, PlanBuilder, PlanError, PlannedAction, PlannedEffect};
use crate::runtime::process::{
    ActionSpawnError, ExitEvent, ExitOutcome, LiveProcessSet, ManagedProcess, ProcessConfig,
};
use crate::runtime::summary::{ActionReport, ActionState, RunSummary, SkipReason};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

/// Environment variable naming the log root
pub const ROS_LOG_DIR: &str = "ROS_LOG_DIR";

/// Which exits fire the handlers registered on an action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TriggerPolicy {
    /// Any exit, including a failed spawn
    #[default]
    AnyExit,
    /// Only an exit with code 0
    SuccessOnly,
}

impl TriggerPolicy {
    pub fn fires(&self, outcome: &ExitOutcome) -> bool {
        match self {
            TriggerPolicy::AnyExit => true,
            TriggerPolicy::SuccessOnly => outcome.is_success(),
        }
    }
}

/// Launch executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Grace period between SIGTERM and a forced kill on shutdown
    pub shutdown_timeout: Duration,
    pub trigger_policy: TriggerPolicy,
    /// Root under which the session log directory is created; `None`
    /// disables output files
    pub log_root: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(5),
            trigger_policy: TriggerPolicy::default(),
            log_root: None,
        }
    }
}

/// `$ROS_LOG_DIR`, else `~/.ros/log`
pub fn default_log_root() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(ROS_LOG_DIR) {
        if !dir.is_empty() {
            return Some(PathBuf::from(dir));
        }
    }
    dirs::home_dir().map(|home| home.join(".ros").join("log"))
}

/// An action with every substitution evaluated
#[derive(Debug, Clone)]
pub struct ResolvedAction {
    pub id: ActionId,
    pub label: String,
    pub is_root: bool,
    /// Labels of the actions whose exit may start this one
    pub triggered_by: Vec<String>,
    /// The condition as written, if any
    pub condition: Option<String>,
    /// `None` when the condition disabled the action
    pub process: Option<ProcessConfig>,
}

impl ResolvedAction {
    pub fn is_enabled(&self) -> bool {
        self.process.is_some()
    }
}

/// A plan with every condition and enabled command resolved
#[derive(Debug, Clone)]
pub struct ResolvedPlan {
    /// Launch arguments in declaration order
    pub arguments: Vec<(String, String)>,
    /// Environment passed to every child
    pub env: HashMap<String, String>,
    actions: IndexMap<ActionId, ResolvedAction>,
}

impl ResolvedPlan {
    pub fn get(&self, id: ActionId) -> Option<&ResolvedAction> {
        self.actions.get(&id)
    }

    /// Actions in launch order
    pub fn actions(&self) -> impl Iterator<Item = &ResolvedAction> {
        self.actions.values()
    }

    pub fn find(&self, label: &str) -> Option<&ResolvedAction> {
        self.actions.values().find(|action| action.label == label)
    }

    fn writes_log_files(&self) -> bool {
        self.actions
            .values()
            .filter_map(|action| action.process.as_ref())
            .any(|process| process.output.to_file())
    }
}

/// Launch executor
pub struct Executor {
    config: ExecutorConfig,
    context: SubstitutionContext,
}

impl Executor {
    pub fn new(config: ExecutorConfig, context: SubstitutionContext) -> Self {
        Self { config, context }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Evaluate every condition and every enabled action's command.
    ///
    /// Nothing is spawned; any error here aborts the launch.
    pub fn resolve(&self, plan: &LaunchPlan) -> Result<ResolvedPlan, ExecutorError> {
        let resolver = self.context.resolver(plan.registry());
        let mut actions = IndexMap::new();

        for action in plan.launch_order() {
            let enabled = match action.condition() {
                Some(condition) => {
                    let value = resolver
                        .evaluate_bool(condition.substitution())
                        .map_err(|e| ExecutorError::Substitution {
                            context: format!("action '{}' condition", action.label),
                            source: e,
                        })?;
                    condition.admits(value)
                }
                None => true,
            };

            let process = if enabled {
                Some(self.resolve_process(&resolver, action)?)
            } else {
                log::debug!("[{}] Disabled by its condition", action.label);
                None
            };

            let triggered_by = action
                .triggered_by
                .iter()
                .filter_map(|id| plan.action(*id))
                .map(|trigger| trigger.label.clone())
                .collect();

            actions.insert(
                action.id,
                ResolvedAction {
                    id: action.id,
                    label: action.label.clone(),
                    is_root: action.is_root,
                    triggered_by,
                    condition: action.condition().map(|c| c.to_string()),
                    process,
                },
            );
        }

        Ok(ResolvedPlan {
            arguments: plan
                .registry()
                .iter()
                .map(|(arg, value)| (arg.name.clone(), value.to_string()))
                .collect(),
            env: self.context.env.clone(),
            actions,
        })
    }

    fn resolve_process(
        &self,
        resolver: &SubstitutionResolver<'_>,
        action: &PlannedAction,
    ) -> Result<ProcessConfig, ExecutorError> {
        let eval = |field: &str, value: &Substitution| {
            resolver
                .evaluate(value)
                .map_err(|e| ExecutorError::Substitution {
                    context: format!("action '{}' {}", action.label, field),
                    source: e,
                })
        };
        let spec = &action.spec;

        let executable = match &spec.executable {
            ExecutableRef::Package {
                package,
                executable,
            } => self.locate_node(package, executable),
            ExecutableRef::Path(value) => self.locate_program(eval("executable", value)?),
        };

        let mut args = Vec::new();
        for (i, arg) in spec.arguments.iter().enumerate() {
            args.push(eval(&format!("arguments[{}]", i), arg)?);
        }

        // Node name and parameters trail as ROS arguments; the parameters
        // file itself is written at spawn time
        let mut parameters = IndexMap::new();
        for (key, value) in &spec.parameters {
            parameters.insert(key.clone(), eval(&format!("parameter '{}'", key), value)?);
        }
        if spec.node_name.is_some() || !parameters.is_empty() {
            args.push("--ros-args".to_string());
            if let Some(name) = &spec.node_name {
                args.push("-r".to_string());
                args.push(format!("__node:={}", name));
            }
        }

        let mut env = self.context.env.clone();
        for (key, value) in &spec.env {
            env.insert(key.clone(), eval(&format!("env '{}'", key), value)?);
        }

        let working_dir = match &spec.working_dir {
            Some(dir) => Some(PathBuf::from(eval("working_dir", dir)?)),
            None => None,
        };

        Ok(ProcessConfig {
            name: action.label.clone(),
            executable,
            args,
            env,
            working_dir,
            output: spec.output,
            parameters,
        })
    }

    /// `<lib>/<package>/<executable>`, falling back to the search path so a
    /// missing node fails at spawn time for its own branch only
    fn locate_node(&self, package: &str, executable: &str) -> String {
        let installed = self
            .context
            .packages
            .lib_dir(package)
            .map(|dir| dir.join(executable))
            .filter(|path| path.is_file());

        match installed {
            Some(path) => path.to_string_lossy().into_owned(),
            None => {
                log::warn!(
                    "Executable '{}' not found in package '{}', trying the search path",
                    executable,
                    package
                );
                self.locate_program(executable.to_string())
            }
        }
    }

    fn locate_program(&self, program: String) -> String {
        if program.contains(std::path::MAIN_SEPARATOR) {
            return program;
        }
        find_executable(&program, self.context.search_path.as_deref())
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or(program)
    }

    /// Build, resolve and run a description
    pub async fn launch(
        &self,
        desc: &LaunchDescription,
        overrides: Vec<(String, String)>,
        shutdown_rx: watch::Receiver<()>,
    ) -> Result<RunSummary, ExecutorError> {
        let plan = PlanBuilder::new().with_overrides(overrides).build(desc)?;
        self.run(&plan, shutdown_rx).await
    }

    /// Resolve and run a plan until every action is terminal
    pub async fn run(
        &self,
        plan: &LaunchPlan,
        shutdown_rx: watch::Receiver<()>,
    ) -> Result<RunSummary, ExecutorError> {
        let resolved = self.resolve(plan)?;
        Ok(self.execute(plan, &resolved, shutdown_rx).await)
    }

    /// Run an already resolved plan.
    ///
    /// Any change on `shutdown_rx` terminates the running children and skips
    /// everything still pending.
    pub async fn execute(
        &self,
        plan: &LaunchPlan,
        resolved: &ResolvedPlan,
        shutdown_rx: watch::Receiver<()>,
    ) -> RunSummary {
        log::info!("Launching {} actions...", plan.len());

        let log_dir = if resolved.writes_log_files() {
            self.session_log_dir()
        } else {
            None
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reports = plan
            .actions()
            .map(|action| (action.id, ActionReport::new(action.id, action.label.clone())))
            .collect();

        let dispatcher = Dispatcher {
            plan,
            resolved,
            policy: self.config.trigger_policy,
            grace: self.config.shutdown_timeout,
            log_dir,
            reports,
            registered: plan.initial_handlers().to_vec(),
            fired: HashSet::new(),
            live: LiveProcessSet::new(),
            backlog: VecDeque::new(),
            events_tx,
            params_dir: None,
        };
        dispatcher.run(events_rx, shutdown_rx).await
    }

    /// `<log_root>/<timestamp>-<pid>`, created on demand
    fn session_log_dir(&self) -> Option<PathBuf> {
        let root = self.config.log_root.as_ref()?;
        let name = format!(
            "{}-{}",
            chrono::Local::now().format("%Y-%m-%d-%H-%M-%S-%6f"),
            std::process::id()
        );
        let dir = root.join(name);
        match std::fs::create_dir_all(&dir) {
            Ok(()) => {
                log::info!("Writing process output to {}", dir.display());
                Some(dir)
            }
            Err(e) => {
                log::warn!("Cannot create log directory {}: {}", dir.display(), e);
                None
            }
        }
    }
}

/// Owns the run state; the only task that reads exit events
struct Dispatcher<'a> {
    plan: &'a LaunchPlan,
    resolved: &'a ResolvedPlan,
    policy: TriggerPolicy,
    grace: Duration,
    log_dir: Option<PathBuf>,
    reports: IndexMap<ActionId, ActionReport>,
    /// Handler indices in registration order
    registered: Vec<usize>,
    fired: HashSet<usize>,
    live: LiveProcessSet,
    /// Exits that happened without a process (failed spawns)
    backlog: VecDeque<ExitEvent>,
    events_tx: mpsc::UnboundedSender<ExitEvent>,
    /// Generated parameter files, removed when the run ends
    params_dir: Option<TempDir>,
}

impl<'a> Dispatcher<'a> {
    async fn run(
        mut self,
        mut events_rx: mpsc::UnboundedReceiver<ExitEvent>,
        mut shutdown_rx: watch::Receiver<()>,
    ) -> RunSummary {
        let mut interrupted = false;

        if shutdown_rx.has_changed().unwrap_or(false) {
            log::info!("Shutdown requested, aborting launch");
            interrupted = true;
        } else {
            let plan = self.plan;
            for id in plan.roots() {
                self.start(*id).await;
            }

            let mut shutdown_open = true;
            loop {
                while let Some(event) = self.backlog.pop_front() {
                    self.handle_exit(event).await;
                }
                if self.live.is_empty().await {
                    break;
                }

                tokio::select! {
                    changed = shutdown_rx.changed(), if shutdown_open => {
                        if changed.is_ok() {
                            log::info!("Shutdown signal received");
                            interrupted = true;
                            self.shutdown(&mut events_rx).await;
                            break;
                        }
                        // Sender gone: no shutdown can be requested anymore
                        shutdown_open = false;
                    }
                    Some(event) = events_rx.recv() => self.handle_exit(event).await,
                    else => break,
                }
            }
        }

        self.finish(interrupted)
    }

    async fn start(&mut self, id: ActionId) {
        let Some(report) = self.reports.get_mut(&id) else {
            log::warn!("Action {} is not part of the plan", id);
            return;
        };
        if !report.state.is_pending() {
            log::debug!("[{}] Already started, ignoring", report.label);
            return;
        }
        let Some(action) = self.resolved.get(id) else {
            return;
        };
        let Some(process) = &action.process else {
            log::info!("[{}] Condition is false, skipping", report.label);
            report.state = ActionState::Skipped(SkipReason::Condition);
            return;
        };

        let prepared = if process.parameters.is_empty() {
            Ok(Cow::Borrowed(process))
        } else {
            match params_dir(&mut self.params_dir, &process.name) {
                Ok(dir) => process.with_params_file(dir).await.map(Cow::Owned),
                Err(e) => Err(e),
            }
        };
        let spawned = match prepared {
            Ok(config) => {
                ManagedProcess::spawn(
                    id,
                    &config,
                    self.log_dir.as_deref(),
                    self.events_tx.clone(),
                )
                .await
            }
            Err(e) => Err(e),
        };

        match spawned {
            Ok(live) => {
                report.state = ActionState::Running { pid: live.pid };
                report.pid = live.pid;
                report.started_at = Some(Instant::now());
                self.live.insert(id, live).await;
            }
            Err(e) => {
                let outcome = ExitOutcome::SpawnFailed(e.to_string());
                report.state = ActionState::Exited(outcome.clone());
                self.backlog.push_back(ExitEvent { id, outcome });
            }
        }
    }

    async fn handle_exit(&mut self, event: ExitEvent) {
        self.live.remove(event.id).await;
        let Some(report) = self.reports.get_mut(&event.id) else {
            return;
        };
        record_exit(report, event.outcome.clone());
        let label = report.label.clone();

        if !self.policy.fires(&event.outcome) {
            log::info!("[{}] Exit does not fire its handlers", label);
            return;
        }

        // Handlers registered while firing wait for the next matching exit
        let plan = self.plan;
        let registered = self.registered.len();
        for k in 0..registered {
            let index = self.registered[k];
            let Some(handler) = plan.handler(index) else {
                continue;
            };
            if handler.target != event.id || !self.fired.insert(index) {
                continue;
            }
            log::debug!("[{}] Exit handler #{} fired", label, index);

            for effect in &handler.effects {
                match effect {
                    PlannedEffect::Start(target) => self.start(*target).await,
                    PlannedEffect::Register(nested) => self.registered.push(*nested),
                }
            }
        }
    }

    /// Terminate every live child, escalating to a kill after the grace period
    async fn shutdown(&mut self, events_rx: &mut mpsc::UnboundedReceiver<ExitEvent>) {
        self.backlog.clear();
        let running = self.live.len().await;
        log::info!("Shutting down {} processes...", running);
        self.live.terminate_all().await;

        let deadline = tokio::time::sleep(self.grace);
        tokio::pin!(deadline);
        let mut killed = false;

        while !self.live.is_empty().await {
            tokio::select! {
                _ = &mut deadline, if !killed => {
                    self.live.kill_all().await;
                    killed = true;
                }
                event = events_rx.recv() => match event {
                    Some(event) => {
                        // Exits that beat the stop request keep their code
                        self.live.remove(event.id).await;
                        if let Some(report) = self.reports.get_mut(&event.id) {
                            record_exit(report, event.outcome);
                        }
                    }
                    None => break,
                },
            }
        }

        log::info!("All processes shut down");
    }

    fn finish(self, interrupted: bool) -> RunSummary {
        let reason = if interrupted {
            SkipReason::Cancelled
        } else {
            SkipReason::TriggerNeverFired
        };

        let actions = self
            .reports
            .into_values()
            .map(|mut report| {
                if report.state.is_pending() {
                    log::debug!("[{}] Never started", report.label);
                    report.state = ActionState::Skipped(reason);
                }
                report
            })
            .collect();

        RunSummary {
            actions,
            interrupted,
        }
    }
}

/// Temporary directory for parameter files, created on first use
fn params_dir<'d>(
    slot: &'d mut Option<TempDir>,
    name: &str,
) -> Result<&'d Path, ActionSpawnError> {
    let dir = match slot.take() {
        Some(dir) => dir,
        None => tempfile::Builder::new()
            .prefix("bringup_launch-")
            .tempdir()
            .map_err(|e| ActionSpawnError::Params {
                name: name.to_string(),
                path: std::env::temp_dir(),
                reason: e.to_string(),
            })?,
    };
    Ok(slot.insert(dir).path())
}

fn record_exit(report: &mut ActionReport, outcome: ExitOutcome) {
    let now = Instant::now();
    report.exited_at = Some(now);
    report.runtime_ms = report
        .started_at
        .map(|started| now.duration_since(started).as_millis() as u64);
    report.state = ActionState::Exited(outcome);
}

/// Errors that can occur in the executor
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Invalid launch plan: {0}")]
    Plan(#[from] PlanError),

    #[error("Substitution failed in {context}: {source}")]
    Substitution {
        context: String,
        #[source]
        source: SubstitutionError,
    },
}

/// Display the resolved plan in a human-readable format
impl fmt::Display for ResolvedPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Launch Plan")?;
        writeln!(f, "===========")?;
        writeln!(f)?;

        if !self.arguments.is_empty() {
            writeln!(f, "Arguments:")?;
            for (key, value) in &self.arguments {
                writeln!(f, "  {}: {}", key, value)?;
            }
            writeln!(f)?;
        }

        if !self.env.is_empty() {
            let mut env: Vec<_> = self.env.iter().collect();
            env.sort();
            writeln!(f, "Global Environment:")?;
            for (key, value) in env {
                writeln!(f, "  {}={}", key, value)?;
            }
            writeln!(f)?;
        }

        writeln!(f, "Actions (in launch order):")?;
        for (i, action) in self.actions.values().enumerate() {
            writeln!(f)?;
            writeln!(
                f,
                "  {}. {}{}",
                i + 1,
                action.label,
                if action.is_root { " [root]" } else { "" }
            )?;

            match &action.process {
                Some(process) => writeln!(f, "     Command: {}", process.command_line())?,
                None => writeln!(f, "     Skipped: condition is false")?,
            }

            if let Some(condition) = &action.condition {
                writeln!(f, "     Condition: {}", condition)?;
            }

            if !action.triggered_by.is_empty() {
                writeln!(f, "     Starts after: {}", action.triggered_by.join(", "))?;
            }

            if let Some(process) = &action.process {
                if !process.parameters.is_empty() {
                    writeln!(f, "     Parameters:")?;
                    for (key, value) in &process.parameters {
                        match value.lines().count() {
                            0 | 1 => writeln!(f, "       {}: {}", key, value)?,
                            n => writeln!(f, "       {}: <{} lines>", key, n)?,
                        }
                    }
                }
                writeln!(f, "     Output: {:?}", process.output)?;
                if let Some(dir) = &process.working_dir {
                    writeln!(f, "     Working directory: {}", dir.display())?;
                }
            }
        }

        Ok(())
    }
}
