//! Launch file YAML schema definitions

use super::description::{
    ActionId, ActionSpec, EventHandler, LaunchDescription, LaunchEntity, OutputPolicy,
};
use super::substitution::{Substitution, SubstitutionError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Root launch file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchFile {
    /// Launch file format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Argument definitions with defaults
    #[serde(default)]
    pub args: IndexMap<String, ArgDefinition>,

    /// Environment overrides for `$(env ...)` lookups and every action
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Package share directory overrides (`package: /path/to/share/package`)
    #[serde(default)]
    pub packages: HashMap<String, String>,

    /// Action definitions (ordered map for deterministic launch order)
    pub actions: IndexMap<String, ActionConfig>,

    /// Exit handlers: `target: [effects...]`
    #[serde(default)]
    pub on_exit: IndexMap<String, Vec<EffectConfig>>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Argument definition with default value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgDefinition {
    /// Default value for the argument
    pub default: ArgValue,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
}

/// Argument values can be strings, booleans, or numbers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ArgValue {
    /// Convert to string representation
    pub fn as_str(&self) -> String {
        match self {
            ArgValue::Bool(b) => b.to_string(),
            ArgValue::Int(i) => i.to_string(),
            ArgValue::Float(f) => f.to_string(),
            ArgValue::String(s) => s.clone(),
        }
    }
}

/// A value expression: a template string or a structured substitution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueConfig {
    /// Plain scalar; strings may contain `$(...)` directives
    Scalar(ArgValue),
    /// `{ if: ..., then: ..., else: ... }`
    Conditional {
        #[serde(rename = "if")]
        condition: Box<ValueConfig>,
        then: Box<ValueConfig>,
        #[serde(rename = "else")]
        otherwise: Box<ValueConfig>,
    },
    /// `{ command: ..., deterministic: false }`
    Command {
        command: Box<ValueConfig>,
        #[serde(default = "default_deterministic")]
        deterministic: bool,
    },
    /// `{ path_join: [...] }`
    PathJoin { path_join: Vec<ValueConfig> },
    /// `{ concat: [...] }`
    Concat { concat: Vec<ValueConfig> },
}

fn default_deterministic() -> bool {
    true
}

impl ValueConfig {
    /// Lower into a substitution tree
    pub fn to_substitution(&self) -> Result<Substitution, SubstitutionError> {
        Ok(match self {
            ValueConfig::Scalar(ArgValue::String(s)) => Substitution::parse(s)?,
            ValueConfig::Scalar(other) => Substitution::Text(other.as_str()),
            ValueConfig::Conditional {
                condition,
                then,
                otherwise,
            } => Substitution::if_else(
                condition.to_substitution()?,
                then.to_substitution()?,
                otherwise.to_substitution()?,
            ),
            ValueConfig::Command {
                command,
                deterministic,
            } => Substitution::Command {
                command: Box::new(command.to_substitution()?),
                deterministic: *deterministic,
            },
            ValueConfig::PathJoin { path_join } => Substitution::path_join(
                path_join
                    .iter()
                    .map(ValueConfig::to_substitution)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            ValueConfig::Concat { concat } => Substitution::concat(
                concat
                    .iter()
                    .map(ValueConfig::to_substitution)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        })
    }
}

/// Action configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Package providing the executable (resolved to `<prefix>/lib/<package>`)
    #[serde(default)]
    pub package: Option<String>,

    /// Executable name within the package, or a command/path template
    pub executable: String,

    /// Node name
    #[serde(default)]
    pub name: Option<String>,

    /// Ordered command line arguments
    #[serde(default)]
    pub arguments: Vec<ValueConfig>,

    /// Node parameters
    #[serde(default)]
    pub parameters: IndexMap<String, ValueConfig>,

    /// Environment variables specific to this action
    #[serde(default)]
    pub env: IndexMap<String, ValueConfig>,

    /// Working directory for the process
    #[serde(default)]
    pub working_dir: Option<ValueConfig>,

    #[serde(default)]
    pub output: OutputPolicy,

    /// Start only if this evaluates to true
    #[serde(default, rename = "if")]
    pub if_condition: Option<ValueConfig>,

    /// Start only if this evaluates to false
    #[serde(default)]
    pub unless: Option<ValueConfig>,
}

/// Effect of an exit handler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EffectConfig {
    /// Start the named action
    Start(String),
    /// Register a nested handler
    Handler {
        on_exit: IndexMap<String, Vec<EffectConfig>>,
    },
}

impl LaunchFile {
    /// Load launch file from a YAML file
    pub fn from_file(path: &str) -> Result<Self, LaunchFileError> {
        let content = std::fs::read_to_string(path).map_err(|e| LaunchFileError::Io {
            path: path.to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse launch file from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, LaunchFileError> {
        let launch_file: LaunchFile =
            serde_yaml::from_str(content).map_err(LaunchFileError::Parse)?;
        launch_file.validate()?;
        Ok(launch_file)
    }

    /// Validate the launch file configuration
    pub fn validate(&self) -> Result<(), LaunchFileError> {
        for (name, action) in &self.actions {
            if action.executable.trim().is_empty() {
                return Err(LaunchFileError::Validation(format!(
                    "Action '{}': 'executable' must not be empty",
                    name
                )));
            }
            if action.if_condition.is_some() && action.unless.is_some() {
                return Err(LaunchFileError::Validation(format!(
                    "Action '{}': cannot specify both 'if' and 'unless'",
                    name
                )));
            }
        }

        self.validate_handlers(&self.on_exit)
    }

    fn validate_handlers(
        &self,
        handlers: &IndexMap<String, Vec<EffectConfig>>,
    ) -> Result<(), LaunchFileError> {
        for (target, effects) in handlers {
            if !self.actions.contains_key(target) {
                return Err(LaunchFileError::Validation(format!(
                    "Exit handler targets unknown action '{}'",
                    target
                )));
            }
            for effect in effects {
                match effect {
                    EffectConfig::Start(name) => {
                        if !self.actions.contains_key(name) {
                            return Err(LaunchFileError::Validation(format!(
                                "Exit handler of '{}' starts unknown action '{}'",
                                target, name
                            )));
                        }
                    }
                    EffectConfig::Handler { on_exit } => self.validate_handlers(on_exit)?,
                }
            }
        }
        Ok(())
    }

    /// Actions that only start from an exit handler
    pub fn triggered_actions(&self) -> HashSet<&str> {
        fn collect<'a>(
            handlers: &'a IndexMap<String, Vec<EffectConfig>>,
            out: &mut HashSet<&'a str>,
        ) {
            for effects in handlers.values() {
                for effect in effects {
                    match effect {
                        EffectConfig::Start(name) => {
                            out.insert(name.as_str());
                        }
                        EffectConfig::Handler { on_exit } => collect(on_exit, out),
                    }
                }
            }
        }

        let mut triggered = HashSet::new();
        collect(&self.on_exit, &mut triggered);
        triggered
    }

    /// Package share overrides as paths
    pub fn package_overrides(&self) -> HashMap<String, PathBuf> {
        self.packages
            .iter()
            .map(|(name, path)| (name.clone(), PathBuf::from(path)))
            .collect()
    }

    /// Lower into a launch description.
    ///
    /// Actions named in any exit handler start only when that handler fires;
    /// every other action is a root.
    pub fn to_description(&self) -> Result<LaunchDescription, LaunchFileError> {
        let mut desc = LaunchDescription::new();

        for (name, def) in &self.args {
            desc.declare_argument(
                name.clone(),
                def.default.as_str(),
                def.description.clone().unwrap_or_default(),
            );
        }

        let triggered = self.triggered_actions();
        let mut ids: HashMap<&str, ActionId> = HashMap::new();

        for (name, config) in &self.actions {
            let spec = Self::action_spec(name, config)?;
            let id = if triggered.contains(name.as_str()) {
                desc.add_action(spec)
            } else {
                desc.launch(spec)
            };
            ids.insert(name.as_str(), id);
        }

        for entity in Self::handler_entities(&self.on_exit, &ids)? {
            desc.add(entity);
        }

        Ok(desc)
    }

    fn action_spec(name: &str, config: &ActionConfig) -> Result<ActionSpec, LaunchFileError> {
        let lower = |field: &str, value: &ValueConfig| {
            value
                .to_substitution()
                .map_err(|e| LaunchFileError::Substitution {
                    context: format!("action '{}' {}", name, field),
                    source: e,
                })
        };

        let mut spec = match &config.package {
            Some(package) => ActionSpec::node(package.clone(), config.executable.clone()),
            None => ActionSpec::process(lower(
                "executable",
                &ValueConfig::Scalar(ArgValue::String(config.executable.clone())),
            )?),
        }
        .label(name)
        .output(config.output);

        if let Some(node_name) = &config.name {
            spec = spec.node_name(node_name.clone());
        }
        for (i, arg) in config.arguments.iter().enumerate() {
            spec = spec.arg(lower(&format!("arguments[{}]", i), arg)?);
        }
        for (key, value) in &config.parameters {
            spec = spec.parameter(key.clone(), lower(&format!("parameter '{}'", key), value)?);
        }
        for (key, value) in &config.env {
            spec = spec.env(key.clone(), lower(&format!("env '{}'", key), value)?);
        }
        if let Some(dir) = &config.working_dir {
            spec = spec.working_dir(lower("working_dir", dir)?);
        }
        if let Some(value) = &config.if_condition {
            spec = spec.if_condition(lower("if", value)?);
        }
        if let Some(value) = &config.unless {
            spec = spec.unless_condition(lower("unless", value)?);
        }

        Ok(spec)
    }

    fn handler_entities(
        handlers: &IndexMap<String, Vec<EffectConfig>>,
        ids: &HashMap<&str, ActionId>,
    ) -> Result<Vec<LaunchEntity>, LaunchFileError> {
        let lookup = |name: &str| {
            ids.get(name).copied().ok_or_else(|| {
                LaunchFileError::Validation(format!("Unknown action '{}'", name))
            })
        };

        let mut entities = Vec::with_capacity(handlers.len());
        for (target, effects) in handlers {
            let mut lowered = Vec::with_capacity(effects.len());
            for effect in effects {
                match effect {
                    EffectConfig::Start(name) => lowered.push(LaunchEntity::Action(lookup(name)?)),
                    EffectConfig::Handler { on_exit } => {
                        lowered.extend(Self::handler_entities(on_exit, ids)?)
                    }
                }
            }
            entities.push(LaunchEntity::OnExit(EventHandler::on_exit(
                lookup(target)?,
                lowered,
            )));
        }
        Ok(entities)
    }
}

/// Errors that can occur when loading a launch file
#[derive(Debug, thiserror::Error)]
pub enum LaunchFileError {
    #[error("Failed to read launch file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse launch file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid value in {context}: {source}")]
    Substitution {
        context: String,
        #[source]
        source: SubstitutionError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Condition, ExecutableRef};

    const SINGLE_DOF: &str = include_str!("../../launch/single_dof.launch.yaml");

    #[test]
    fn test_parse_single_dof_launch_file() {
        let launch_file = LaunchFile::from_yaml(SINGLE_DOF).unwrap();
        assert_eq!(launch_file.args.len(), 2);
        assert_eq!(launch_file.args["gui"].default.as_str(), "true");
        assert_eq!(launch_file.args["interface_name"].default.as_str(), "eno0");
        assert_eq!(launch_file.actions.len(), 4);

        let triggered = launch_file.triggered_actions();
        assert!(triggered.contains("joint_state_broadcaster_spawner"));
        assert!(triggered.contains("rviz"));
        assert!(!triggered.contains("robot_state_publisher"));
    }

    #[test]
    fn test_single_dof_description() {
        let desc = LaunchFile::from_yaml(SINGLE_DOF)
            .unwrap()
            .to_description()
            .unwrap();

        assert_eq!(desc.arguments().len(), 2);
        let roots: Vec<ActionId> = desc
            .entities()
            .iter()
            .filter_map(|e| match e {
                LaunchEntity::Action(id) => Some(*id),
                LaunchEntity::OnExit(_) => None,
            })
            .collect();
        assert_eq!(roots, vec![ActionId(0), ActionId(1)]);

        let rviz = desc.action(ActionId(3)).unwrap();
        assert_eq!(rviz.label.as_deref(), Some("rviz"));
        assert_eq!(rviz.node_name.as_deref(), Some("rviz2"));
        assert_eq!(
            rviz.condition,
            Some(Condition::If(Substitution::arg("gui")))
        );
        assert_eq!(rviz.output, OutputPolicy::Log);

        let rsp = desc.action(ActionId(0)).unwrap();
        assert_eq!(rsp.output, OutputPolicy::Both);
        assert!(matches!(
            &rsp.parameters[0].1,
            Substitution::Command { .. }
        ));
    }

    #[test]
    fn test_structured_values() {
        let yaml = r#"
args:
  gui:
    default: false
actions:
  viewer:
    executable: "/usr/bin/viewer"
    arguments:
      - "-d"
      - path_join: ["$(find-pkg-share demo)", "config", "view.rviz"]
      - if: "$(arg gui)"
        then: "--windowed"
        else: "--headless"
      - command: "date +%s"
        deterministic: false
      - 42
"#;
        let desc = LaunchFile::from_yaml(yaml).unwrap().to_description().unwrap();
        let viewer = desc.action(ActionId(0)).unwrap();

        assert_eq!(
            viewer.executable,
            ExecutableRef::Path(Substitution::text("/usr/bin/viewer"))
        );
        assert_eq!(viewer.arguments[0], Substitution::text("-d"));
        assert_eq!(
            viewer.arguments[1],
            Substitution::path_join([
                Substitution::package_share("demo"),
                Substitution::text("config"),
                Substitution::text("view.rviz"),
            ])
        );
        assert_eq!(
            viewer.arguments[2],
            Substitution::if_else(
                Substitution::arg("gui"),
                Substitution::text("--windowed"),
                Substitution::text("--headless"),
            )
        );
        assert!(!viewer.arguments[3].is_deterministic());
        assert_eq!(viewer.arguments[4], Substitution::text("42"));
        assert_eq!(desc.arguments()[0].default, "false");
    }

    #[test]
    fn test_nested_handlers() {
        let yaml = r#"
actions:
  a:
    executable: "bin/a"
  b:
    executable: "bin/b"
  c:
    executable: "bin/c"
on_exit:
  a:
    - b
    - on_exit:
        b: [c]
"#;
        let desc = LaunchFile::from_yaml(yaml).unwrap().to_description().unwrap();
        assert_eq!(desc.entities().len(), 2);
        let LaunchEntity::OnExit(handler) = &desc.entities()[1] else {
            panic!("expected handler");
        };
        assert_eq!(handler.target, ActionId(0));
        assert_eq!(handler.effects[0], LaunchEntity::Action(ActionId(1)));
        assert_eq!(
            handler.effects[1],
            LaunchEntity::OnExit(EventHandler::starting(ActionId(1), [ActionId(2)]))
        );
    }

    #[test]
    fn test_validation_unknown_handler_target() {
        let yaml = r#"
actions:
  a:
    executable: "bin/a"
on_exit:
  missing: [a]
"#;
        assert!(matches!(
            LaunchFile::from_yaml(yaml),
            Err(LaunchFileError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_unknown_effect() {
        let yaml = r#"
actions:
  a:
    executable: "bin/a"
on_exit:
  a: [ghost]
"#;
        assert!(matches!(
            LaunchFile::from_yaml(yaml),
            Err(LaunchFileError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_if_and_unless() {
        let yaml = r#"
actions:
  a:
    executable: "bin/a"
    if: "true"
    unless: "false"
"#;
        assert!(matches!(
            LaunchFile::from_yaml(yaml),
            Err(LaunchFileError::Validation(_))
        ));
    }

    #[test]
    fn test_bad_template_reported_with_context() {
        let yaml = r#"
actions:
  a:
    executable: "bin/a"
    arguments: ["$(arg gui"]
"#;
        let err = LaunchFile::from_yaml(yaml)
            .unwrap()
            .to_description()
            .unwrap_err();
        assert!(err.to_string().contains("action 'a' arguments[0]"));
    }
}
