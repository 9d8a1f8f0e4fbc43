//! In-memory launch description: declared arguments, actions and exit handlers

use super::args::DeclaredArgument;
use super::substitution::Substitution;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an action: its insertion index in the description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub usize);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a child's stdout/stderr goes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputPolicy {
    /// Forwarded to the launcher's log
    Screen,
    /// Written to files in the session log directory
    #[default]
    Log,
    /// Both of the above
    Both,
}

impl OutputPolicy {
    pub fn to_screen(&self) -> bool {
        matches!(self, OutputPolicy::Screen | OutputPolicy::Both)
    }

    pub fn to_file(&self) -> bool {
        matches!(self, OutputPolicy::Log | OutputPolicy::Both)
    }
}

/// Gate deciding whether an action may start
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Start when the value is true
    If(Substitution),
    /// Start when the value is false
    Unless(Substitution),
}

impl Condition {
    pub fn substitution(&self) -> &Substitution {
        match self {
            Condition::If(sub) | Condition::Unless(sub) => sub,
        }
    }

    /// Apply the gate to an evaluated boolean
    pub fn admits(&self, value: bool) -> bool {
        match self {
            Condition::If(_) => value,
            Condition::Unless(_) => !value,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::If(sub) => write!(f, "if {}", sub),
            Condition::Unless(sub) => write!(f, "unless {}", sub),
        }
    }
}

/// What to execute for an action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutableRef {
    /// A path, or a bare name looked up on `PATH` at spawn time
    Path(Substitution),
    /// `<prefix>/lib/<package>/<executable>` via the package locator
    Package { package: String, executable: String },
}

/// Specification of one child process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSpec {
    /// Human-readable label used in logs and summaries
    pub label: Option<String>,
    pub executable: ExecutableRef,
    pub arguments: Vec<Substitution>,
    /// Node name, passed as `-r __node:=<name>`
    pub node_name: Option<String>,
    /// Node parameters, passed in a generated `--params-file`
    pub parameters: Vec<(String, Substitution)>,
    pub env: Vec<(String, Substitution)>,
    pub working_dir: Option<Substitution>,
    pub output: OutputPolicy,
    pub condition: Option<Condition>,
}

impl ActionSpec {
    fn with_executable(executable: ExecutableRef) -> Self {
        Self {
            label: None,
            executable,
            arguments: Vec::new(),
            node_name: None,
            parameters: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            output: OutputPolicy::default(),
            condition: None,
        }
    }

    /// An executable installed by a package
    pub fn node(package: impl Into<String>, executable: impl Into<String>) -> Self {
        Self::with_executable(ExecutableRef::Package {
            package: package.into(),
            executable: executable.into(),
        })
    }

    /// An arbitrary program
    pub fn process(executable: impl Into<Substitution>) -> Self {
        Self::with_executable(ExecutableRef::Path(executable.into()))
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<Substitution>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Substitution>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = Some(name.into());
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<Substitution>) -> Self {
        self.parameters.push((name.into(), value.into()));
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<Substitution>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<Substitution>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn output(mut self, output: OutputPolicy) -> Self {
        self.output = output;
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Start only when `value` evaluates to true
    pub fn if_condition(self, value: impl Into<Substitution>) -> Self {
        self.condition(Condition::If(value.into()))
    }

    /// Start only when `value` evaluates to false
    pub fn unless_condition(self, value: impl Into<Substitution>) -> Self {
        self.condition(Condition::Unless(value.into()))
    }

    /// Label to report when none was given explicitly
    pub fn default_label(&self) -> String {
        if let Some(label) = &self.label {
            return label.clone();
        }
        match &self.executable {
            ExecutableRef::Package { executable, .. } => executable.clone(),
            ExecutableRef::Path(Substitution::Text(path)) => std::path::Path::new(path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.clone()),
            ExecutableRef::Path(_) => "process".to_string(),
        }
    }
}

/// An entry of a description or of a handler's effects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchEntity {
    /// Start an action
    Action(ActionId),
    /// Register a handler
    OnExit(EventHandler),
}

/// Starts its effects once `target` has exited
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHandler {
    pub target: ActionId,
    pub effects: Vec<LaunchEntity>,
}

impl EventHandler {
    pub fn on_exit(target: ActionId, effects: impl IntoIterator<Item = LaunchEntity>) -> Self {
        Self {
            target,
            effects: effects.into_iter().collect(),
        }
    }

    /// Shorthand for a handler that only starts actions
    pub fn starting(target: ActionId, actions: impl IntoIterator<Item = ActionId>) -> Self {
        Self::on_exit(target, actions.into_iter().map(LaunchEntity::Action))
    }
}

/// Declared arguments plus the action arena and top-level entities
#[derive(Debug, Clone, Default)]
pub struct LaunchDescription {
    arguments: Vec<DeclaredArgument>,
    actions: Vec<ActionSpec>,
    entities: Vec<LaunchEntity>,
}

impl LaunchDescription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a launch argument (duplicates are reported when the plan is built)
    pub fn declare_argument(
        &mut self,
        name: impl Into<String>,
        default: impl Into<String>,
        description: impl Into<String>,
    ) {
        self.arguments
            .push(DeclaredArgument::new(name, default, description));
    }

    /// Register an action without scheduling it
    pub fn add_action(&mut self, spec: ActionSpec) -> ActionId {
        self.actions.push(spec);
        ActionId(self.actions.len() - 1)
    }

    /// Register an action and start it at launch
    pub fn launch(&mut self, spec: ActionSpec) -> ActionId {
        let id = self.add_action(spec);
        self.entities.push(LaunchEntity::Action(id));
        id
    }

    /// Add a top-level entity
    pub fn add(&mut self, entity: LaunchEntity) {
        self.entities.push(entity);
    }

    /// Register a top-level exit handler
    pub fn on_exit(&mut self, target: ActionId, effects: impl IntoIterator<Item = LaunchEntity>) {
        self.add(LaunchEntity::OnExit(EventHandler::on_exit(target, effects)));
    }

    pub fn arguments(&self) -> &[DeclaredArgument] {
        &self.arguments
    }

    pub fn actions(&self) -> &[ActionSpec] {
        &self.actions
    }

    pub fn action(&self, id: ActionId) -> Option<&ActionSpec> {
        self.actions.get(id.0)
    }

    pub fn entities(&self) -> &[LaunchEntity] {
        &self.entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_follow_insertion_order() {
        let mut desc = LaunchDescription::new();
        let a = desc.launch(ActionSpec::node("controller_manager", "spawner"));
        let b = desc.add_action(ActionSpec::node("controller_manager", "spawner"));
        desc.on_exit(a, [LaunchEntity::Action(b)]);

        assert_eq!(a, ActionId(0));
        assert_eq!(b, ActionId(1));
        assert_eq!(desc.actions().len(), 2);
        assert_eq!(desc.entities().len(), 2);
        assert_eq!(desc.action(b).unwrap().default_label(), "spawner");
    }

    #[test]
    fn test_default_label() {
        assert_eq!(ActionSpec::process("/usr/bin/rviz2").default_label(), "rviz2");
        assert_eq!(
            ActionSpec::process(Substitution::find_executable("rviz2")).default_label(),
            "process"
        );
        assert_eq!(
            ActionSpec::node("rviz2", "rviz2").label("viz").default_label(),
            "viz"
        );
    }

    #[test]
    fn test_condition_gate() {
        let gate = Condition::If(Substitution::arg("gui"));
        assert!(gate.admits(true));
        assert!(!gate.admits(false));
        let inverse = Condition::Unless(Substitution::arg("gui"));
        assert!(inverse.admits(false));
        assert_eq!(inverse.to_string(), "unless $(arg gui)");
    }

    #[test]
    fn test_output_policy() {
        assert!(OutputPolicy::Both.to_screen() && OutputPolicy::Both.to_file());
        assert!(!OutputPolicy::Log.to_screen());
        assert!(!OutputPolicy::Screen.to_file());
        assert_eq!(OutputPolicy::default(), OutputPolicy::Log);
    }
}
