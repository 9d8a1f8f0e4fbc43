//! Substitution engine for $(arg), $(env), $(find-exec), $(find-pkg-share),
//! $(command) and $(if) expressions

use super::args::{ArgumentError, ArgumentRegistry};
use super::locate::{find_executable, AmentIndex, PackageLocator};
use regex::Regex;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

/// Directive opener at the start of the remaining input: `$(name`
static DIRECTIVE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$\(([a-z][a-z-]*)").unwrap());

/// A lazily evaluated value expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Substitution {
    /// Literal text
    Text(String),
    /// Value of a declared launch argument
    Arg(String),
    /// Environment variable, with an optional fallback
    Env {
        name: String,
        default: Option<Box<Substitution>>,
    },
    /// Children concatenated in order
    Concat(Vec<Substitution>),
    /// Children joined with the platform path separator
    PathJoin(Vec<Substitution>),
    /// Stdout of an external command (whitespace-split command line)
    Command {
        command: Box<Substitution>,
        deterministic: bool,
    },
    /// Full path of an executable found on the search path
    FindExecutable(String),
    /// Share directory of an installed package
    PackageShare(String),
    /// Only the selected branch is evaluated
    Conditional {
        condition: Box<Substitution>,
        then: Box<Substitution>,
        otherwise: Box<Substitution>,
    },
}

impl Substitution {
    pub fn text(value: impl Into<String>) -> Self {
        Substitution::Text(value.into())
    }

    pub fn arg(name: impl Into<String>) -> Self {
        Substitution::Arg(name.into())
    }

    pub fn env(name: impl Into<String>) -> Self {
        Substitution::Env {
            name: name.into(),
            default: None,
        }
    }

    pub fn env_or(name: impl Into<String>, default: impl Into<Substitution>) -> Self {
        Substitution::Env {
            name: name.into(),
            default: Some(Box::new(default.into())),
        }
    }

    /// Concatenate parts, collapsing trivial cases
    pub fn concat(parts: impl IntoIterator<Item = Substitution>) -> Self {
        let mut parts: Vec<Substitution> = parts.into_iter().collect();
        match parts.len() {
            0 => Substitution::Text(String::new()),
            1 => parts.remove(0),
            _ => Substitution::Concat(parts),
        }
    }

    pub fn path_join(parts: impl IntoIterator<Item = Substitution>) -> Self {
        Substitution::PathJoin(parts.into_iter().collect())
    }

    pub fn command(command: impl Into<Substitution>) -> Self {
        Substitution::Command {
            command: Box::new(command.into()),
            deterministic: true,
        }
    }

    /// A command whose output may differ between invocations
    pub fn volatile_command(command: impl Into<Substitution>) -> Self {
        Substitution::Command {
            command: Box::new(command.into()),
            deterministic: false,
        }
    }

    pub fn find_executable(name: impl Into<String>) -> Self {
        Substitution::FindExecutable(name.into())
    }

    pub fn package_share(package: impl Into<String>) -> Self {
        Substitution::PackageShare(package.into())
    }

    pub fn if_else(
        condition: impl Into<Substitution>,
        then: impl Into<Substitution>,
        otherwise: impl Into<Substitution>,
    ) -> Self {
        Substitution::Conditional {
            condition: Box::new(condition.into()),
            then: Box::new(then.into()),
            otherwise: Box::new(otherwise.into()),
        }
    }

    /// Whether re-evaluation is guaranteed to yield the same string
    pub fn is_deterministic(&self) -> bool {
        match self {
            Substitution::Text(_)
            | Substitution::Arg(_)
            | Substitution::FindExecutable(_)
            | Substitution::PackageShare(_) => true,
            Substitution::Env { default, .. } => {
                default.as_deref().map_or(true, Substitution::is_deterministic)
            }
            Substitution::Concat(parts) | Substitution::PathJoin(parts) => {
                parts.iter().all(Substitution::is_deterministic)
            }
            Substitution::Command {
                command,
                deterministic,
            } => *deterministic && command.is_deterministic(),
            Substitution::Conditional {
                condition,
                then,
                otherwise,
            } => {
                condition.is_deterministic()
                    && then.is_deterministic()
                    && otherwise.is_deterministic()
            }
        }
    }

    /// Parse a template string such as `$(find-pkg-share pkg)/config/x.yaml`
    pub fn parse(template: &str) -> Result<Self, SubstitutionError> {
        let mut parser = TemplateParser {
            input: template,
            pos: 0,
        };
        let parts = parser.parse_sequence(false)?;
        Ok(Substitution::concat(parts))
    }
}

impl From<&str> for Substitution {
    fn from(value: &str) -> Self {
        Substitution::Text(value.to_string())
    }
}

impl From<String> for Substitution {
    fn from(value: String) -> Self {
        Substitution::Text(value)
    }
}

impl fmt::Display for Substitution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Substitution::Text(text) => write!(f, "{}", text.replace('$', "$$")),
            Substitution::Arg(name) => write!(f, "$(arg {})", name),
            Substitution::Env { name, default } => match default {
                Some(default) => write!(f, "$(env {} {})", name, default),
                None => write!(f, "$(env {})", name),
            },
            Substitution::Concat(parts) => {
                for part in parts {
                    write!(f, "{}", part)?;
                }
                Ok(())
            }
            Substitution::PathJoin(parts) => {
                let rendered: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "{}", rendered.join("/"))
            }
            Substitution::Command { command, .. } => write!(f, "$(command {})", command),
            Substitution::FindExecutable(name) => write!(f, "$(find-exec {})", name),
            Substitution::PackageShare(package) => write!(f, "$(find-pkg-share {})", package),
            Substitution::Conditional {
                condition,
                then,
                otherwise,
            } => write!(f, "$(if {} {} {})", condition, then, otherwise),
        }
    }
}

/// Recursive-descent parser for `$(...)` templates
struct TemplateParser<'a> {
    input: &'a str,
    pos: usize,
}

impl TemplateParser<'_> {
    fn rest(&self) -> &str {
        &self.input[self.pos..]
    }

    fn error(&self, reason: impl Into<String>) -> SubstitutionError {
        SubstitutionError::InvalidTemplate {
            template: self.input.to_string(),
            reason: reason.into(),
        }
    }

    /// Parse until end of input, or until the closing `)` when `nested`
    fn parse_sequence(&mut self, nested: bool) -> Result<Vec<Substitution>, SubstitutionError> {
        let mut parts = Vec::new();
        let mut literal = String::new();

        loop {
            let rest = self.rest();
            let Some(ch) = rest.chars().next() else {
                if nested {
                    return Err(self.error("unterminated '$('"));
                }
                break;
            };

            if rest.starts_with("$$") {
                literal.push('$');
                self.pos += 2;
            } else if rest.starts_with("$(") {
                if !literal.is_empty() {
                    parts.push(Substitution::Text(std::mem::take(&mut literal)));
                }
                parts.push(self.parse_directive()?);
            } else if nested && ch == ')' {
                break;
            } else {
                literal.push(ch);
                self.pos += ch.len_utf8();
            }
        }

        if !literal.is_empty() {
            parts.push(Substitution::Text(literal));
        }
        Ok(parts)
    }

    fn parse_directive(&mut self) -> Result<Substitution, SubstitutionError> {
        let name = match DIRECTIVE_PATTERN.captures(self.rest()) {
            Some(caps) => caps[1].to_string(),
            None => return Err(self.error("expected directive name after '$('")),
        };
        self.pos += 2 + name.len();
        let skipped = self.rest().len() - self.rest().trim_start().len();
        self.pos += skipped;

        let body = self.parse_sequence(true)?;
        // consume ')'
        self.pos += 1;

        match name.as_str() {
            "command" => Ok(Substitution::command(Substitution::concat(body))),
            "arg" => Ok(Substitution::Arg(self.single_name(&name, body)?)),
            "find-exec" => Ok(Substitution::FindExecutable(self.single_name(&name, body)?)),
            "find-pkg-share" => Ok(Substitution::PackageShare(self.single_name(&name, body)?)),
            "env" => {
                let mut words = split_words(body).into_iter();
                let name_word = words.next();
                let default = words.next();
                if words.next().is_some() {
                    return Err(self.error("'env' takes a name and an optional default"));
                }
                match name_word {
                    Some(Substitution::Text(var)) => Ok(Substitution::Env {
                        name: var,
                        default: default.map(Box::new),
                    }),
                    _ => Err(self.error("'env' requires a literal variable name")),
                }
            }
            "if" => {
                let words = split_words(body);
                let Ok([condition, then, otherwise]) = <[Substitution; 3]>::try_from(words) else {
                    return Err(self.error("'if' takes a condition and two branches"));
                };
                Ok(Substitution::if_else(condition, then, otherwise))
            }
            _ => Err(SubstitutionError::UnknownDirective(name)),
        }
    }

    fn single_name(
        &self,
        directive: &str,
        body: Vec<Substitution>,
    ) -> Result<String, SubstitutionError> {
        let mut words = split_words(body);
        match (words.len(), words.pop()) {
            (1, Some(Substitution::Text(name))) => Ok(name),
            _ => Err(self.error(format!("'{}' takes exactly one literal name", directive))),
        }
    }
}

/// Split directive operands on whitespace inside literal text
fn split_words(pieces: Vec<Substitution>) -> Vec<Substitution> {
    let mut words = Vec::new();
    let mut current: Vec<Substitution> = Vec::new();

    for piece in pieces {
        match piece {
            Substitution::Text(text) => {
                let mut chunk = String::new();
                for ch in text.chars() {
                    if ch.is_whitespace() {
                        if !chunk.is_empty() {
                            current.push(Substitution::Text(std::mem::take(&mut chunk)));
                        }
                        if !current.is_empty() {
                            words.push(Substitution::concat(std::mem::take(&mut current)));
                        }
                    } else {
                        chunk.push(ch);
                    }
                }
                if !chunk.is_empty() {
                    current.push(Substitution::Text(chunk));
                }
            }
            other => current.push(other),
        }
    }

    if !current.is_empty() {
        words.push(Substitution::concat(current));
    }
    words
}

/// Parse a boolean-as-string value
pub fn parse_bool(value: &str) -> Result<bool, SubstitutionError> {
    let trimmed = value.trim();
    for truthy in ["true", "1", "yes", "on"] {
        if trimmed.eq_ignore_ascii_case(truthy) {
            return Ok(true);
        }
    }
    for falsy in ["false", "0", "no", "off"] {
        if trimmed.eq_ignore_ascii_case(falsy) {
            return Ok(false);
        }
    }
    Err(SubstitutionError::InvalidBoolean(value.to_string()))
}

/// Captured result of an external command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs the external commands of `$(command ...)` substitutions
pub trait CommandRunner: Send + Sync {
    /// Run `argv[0]` with the remaining words as arguments.
    ///
    /// A program that cannot be found is reported as
    /// [`std::io::ErrorKind::NotFound`].
    fn run(&self, argv: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runs commands as real child processes
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner {
    search_path: Option<OsString>,
}

impl SystemCommandRunner {
    pub fn with_search_path(search_path: impl Into<OsString>) -> Self {
        Self {
            search_path: Some(search_path.into()),
        }
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, argv: &[String]) -> std::io::Result<CommandOutput> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line")
        })?;
        let path = find_executable(program, self.search_path.as_deref()).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("'{}' not found on the search path", program),
            )
        })?;

        let output = std::process::Command::new(path).args(args).output()?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// External collaborators available to substitutions
#[derive(Clone)]
pub struct SubstitutionContext {
    /// Runner for `$(command ...)`
    pub runner: Arc<dyn CommandRunner>,
    /// Package share/lib lookup
    pub packages: Arc<dyn PackageLocator>,
    /// Environment overrides consulted before the process environment
    pub env: HashMap<String, String>,
    /// Search path for `$(find-exec ...)`, `PATH` when `None`
    pub search_path: Option<OsString>,
}

impl Default for SubstitutionContext {
    fn default() -> Self {
        Self {
            runner: Arc::new(SystemCommandRunner::default()),
            packages: Arc::new(AmentIndex::from_env()),
            env: HashMap::new(),
            search_path: None,
        }
    }
}

impl fmt::Debug for SubstitutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubstitutionContext")
            .field("env", &self.env)
            .field("search_path", &self.search_path)
            .finish_non_exhaustive()
    }
}

impl SubstitutionContext {
    /// Create a context backed by the process environment
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_packages(mut self, packages: Arc<dyn PackageLocator>) -> Self {
        self.packages = packages;
        self
    }

    /// Restrict executable lookups (and system commands) to `search_path`
    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        let search_path = search_path.into();
        self.runner = Arc::new(SystemCommandRunner::with_search_path(search_path.clone()));
        self.search_path = Some(search_path);
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Add multiple environment variables
    pub fn with_envs(mut self, envs: HashMap<String, String>) -> Self {
        self.env.extend(envs);
        self
    }

    /// Bind the context to a set of resolved arguments
    pub fn resolver<'a>(&'a self, registry: &'a ArgumentRegistry) -> SubstitutionResolver<'a> {
        SubstitutionResolver::new(registry, self)
    }
}

/// Evaluates substitutions against an argument registry.
///
/// Every call re-evaluates the whole tree; nothing is cached between calls.
pub struct SubstitutionResolver<'a> {
    registry: &'a ArgumentRegistry,
    context: &'a SubstitutionContext,
}

impl<'a> SubstitutionResolver<'a> {
    pub fn new(registry: &'a ArgumentRegistry, context: &'a SubstitutionContext) -> Self {
        Self { registry, context }
    }

    /// Parse and evaluate a template string
    pub fn substitute(&self, template: &str) -> Result<String, SubstitutionError> {
        self.evaluate(&Substitution::parse(template)?)
    }

    /// Evaluate an expression, children first, left to right
    pub fn evaluate(&self, substitution: &Substitution) -> Result<String, SubstitutionError> {
        match substitution {
            Substitution::Text(text) => Ok(text.clone()),
            Substitution::Arg(name) => Ok(self.registry.resolve(name)?.to_string()),
            Substitution::Env { name, default } => self.resolve_env(name, default.as_deref()),
            Substitution::Concat(parts) => parts.iter().map(|part| self.evaluate(part)).collect(),
            Substitution::PathJoin(parts) => {
                let mut path = PathBuf::new();
                for part in parts {
                    path.push(self.evaluate(part)?);
                }
                Ok(path.to_string_lossy().into_owned())
            }
            Substitution::Command { command, .. } => {
                let command_line = self.evaluate(command)?;
                self.run_command(&command_line)
            }
            Substitution::FindExecutable(name) => {
                find_executable(name, self.context.search_path.as_deref())
                    .map(|path| path.to_string_lossy().into_owned())
                    .ok_or_else(|| SubstitutionError::ExecutableNotFound(name.clone()))
            }
            Substitution::PackageShare(package) => self
                .context
                .packages
                .share_dir(package)
                .map(|path| path.to_string_lossy().into_owned())
                .ok_or_else(|| SubstitutionError::PackageNotFound(package.clone())),
            Substitution::Conditional {
                condition,
                then,
                otherwise,
            } => {
                if self.evaluate_bool(condition)? {
                    self.evaluate(then)
                } else {
                    self.evaluate(otherwise)
                }
            }
        }
    }

    /// Evaluate an expression and interpret it as a boolean
    pub fn evaluate_bool(&self, substitution: &Substitution) -> Result<bool, SubstitutionError> {
        parse_bool(&self.evaluate(substitution)?)
    }

    fn resolve_env(
        &self,
        name: &str,
        default: Option<&Substitution>,
    ) -> Result<String, SubstitutionError> {
        // First check our local env overrides
        if let Some(value) = self.context.env.get(name) {
            return Ok(value.clone());
        }

        // Then check system environment
        if let Ok(value) = std::env::var(name) {
            return Ok(value);
        }

        match default {
            Some(default) => self.evaluate(default),
            None => Err(SubstitutionError::UndefinedEnv(name.to_string())),
        }
    }

    fn run_command(&self, command_line: &str) -> Result<String, SubstitutionError> {
        let argv: Vec<String> = command_line.split_whitespace().map(String::from).collect();
        if argv.is_empty() {
            return Err(SubstitutionError::Execution {
                command: command_line.to_string(),
                reason: "empty command line".to_string(),
            });
        }

        log::debug!("Running substitution command: {}", command_line);
        let output = self
            .context
            .runner
            .run(&argv)
            .map_err(|e| SubstitutionError::Execution {
                command: command_line.to_string(),
                reason: e.to_string(),
            })?;

        if output.status != Some(0) {
            let status = output
                .status
                .map(|code| format!("exit code {}", code))
                .unwrap_or_else(|| "terminated by signal".to_string());
            let stderr = output.stderr.trim();
            return Err(SubstitutionError::Execution {
                command: command_line.to_string(),
                reason: if stderr.is_empty() {
                    status
                } else {
                    format!("{}: {}", status, stderr)
                },
            });
        }

        Ok(output.stdout.trim_end().to_string())
    }
}

/// Errors that can occur during substitution
#[derive(Debug, thiserror::Error)]
pub enum SubstitutionError {
    #[error(transparent)]
    Argument(#[from] ArgumentError),

    #[error("Undefined environment variable: {0}")]
    UndefinedEnv(String),

    #[error("Executable '{0}' not found on the search path")]
    ExecutableNotFound(String),

    #[error("Package '{0}' not found")]
    PackageNotFound(String),

    #[error("Command '{command}' failed: {reason}")]
    Execution { command: String, reason: String },

    #[error("Expected a boolean value, got '{0}'")]
    InvalidBoolean(String),

    #[error("Invalid substitution template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("Unknown substitution directive: {0}")]
    UnknownDirective(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records every command line and answers with a canned output
    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<Vec<String>>>,
        invocations: AtomicUsize,
        exit_code: i32,
    }

    impl RecordingRunner {
        fn failing(exit_code: i32) -> Self {
            Self {
                exit_code,
                ..Default::default()
            }
        }

        fn count(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, argv: &[String]) -> std::io::Result<CommandOutput> {
            let n = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
            self.calls.lock().unwrap().push(argv.to_vec());
            Ok(CommandOutput {
                status: Some(self.exit_code),
                stdout: format!("{}#{}\n\n", argv.join(" "), n),
                stderr: if self.exit_code == 0 {
                    String::new()
                } else {
                    "xacro: file not found\n".to_string()
                },
            })
        }
    }

    fn registry() -> ArgumentRegistry {
        let mut registry = ArgumentRegistry::new();
        registry.declare("gui", "true", "").unwrap();
        registry.declare("interface_name", "eno0", "").unwrap();
        registry
    }

    fn context_with(runner: Arc<RecordingRunner>) -> SubstitutionContext {
        SubstitutionContext::new()
            .with_runner(runner)
            .with_packages(Arc::new(
                AmentIndex::default().with_override("demo_pkg", "/opt/ros/share/demo_pkg"),
            ))
    }

    #[test]
    fn test_arg_substitution() {
        let registry = registry();
        let ctx = SubstitutionContext::new();

        let result = ctx.resolver(&registry).substitute("$(arg interface_name)").unwrap();
        assert_eq!(result, "eno0");
    }

    #[test]
    fn test_env_substitution() {
        let registry = registry();
        let ctx = SubstitutionContext::new().with_env("MY_VAR", "my_value");
        let resolver = ctx.resolver(&registry);

        assert_eq!(resolver.substitute("$(env MY_VAR)").unwrap(), "my_value");
        assert_eq!(
            resolver
                .substitute("$(env BRINGUP_LAUNCH_SURELY_UNSET fallback)")
                .unwrap(),
            "fallback"
        );
        assert!(matches!(
            resolver.substitute("$(env BRINGUP_LAUNCH_SURELY_UNSET)"),
            Err(SubstitutionError::UndefinedEnv(_))
        ));
    }

    #[test]
    fn test_parse_nested_command() {
        let parsed = Substitution::parse(
            "$(command $(find-exec xacro) $(find-pkg-share demo_pkg)/urdf/robot.xacro interface_name:=$(arg interface_name))",
        )
        .unwrap();

        let expected = Substitution::command(Substitution::Concat(vec![
            Substitution::find_executable("xacro"),
            Substitution::text(" "),
            Substitution::package_share("demo_pkg"),
            Substitution::text("/urdf/robot.xacro interface_name:="),
            Substitution::arg("interface_name"),
        ]));
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_parse_plain_and_escaped() {
        assert_eq!(
            Substitution::parse("plain string").unwrap(),
            Substitution::text("plain string")
        );
        assert_eq!(
            Substitution::parse("cost: $$5 (approx)").unwrap(),
            Substitution::text("cost: $5 (approx)")
        );
        assert_eq!(Substitution::parse("").unwrap(), Substitution::text(""));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Substitution::parse("$(arg gui"),
            Err(SubstitutionError::InvalidTemplate { .. })
        ));
        assert!(matches!(
            Substitution::parse("$(var gui)"),
            Err(SubstitutionError::UnknownDirective(name)) if name == "var"
        ));
        assert!(matches!(
            Substitution::parse("$(arg a b)"),
            Err(SubstitutionError::InvalidTemplate { .. })
        ));
        assert!(matches!(
            Substitution::parse("$(if $(arg gui) yes)"),
            Err(SubstitutionError::InvalidTemplate { .. })
        ));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let template = "$(find-pkg-share demo_pkg)/config/$(if $(arg gui) full.rviz lite.rviz)";
        let parsed = Substitution::parse(template).unwrap();
        assert_eq!(parsed.to_string(), template);
    }

    #[test]
    fn test_path_join_uses_platform_separator() {
        let registry = registry();
        let ctx = context_with(Arc::new(RecordingRunner::default()));
        let joined = ctx
            .resolver(&registry)
            .evaluate(&Substitution::path_join([
                Substitution::package_share("demo_pkg"),
                Substitution::text("config"),
                Substitution::text("single_dof.rviz"),
            ]))
            .unwrap();

        let expected: PathBuf = ["/opt/ros/share/demo_pkg", "config", "single_dof.rviz"]
            .iter()
            .collect();
        assert_eq!(joined, expected.to_string_lossy());
    }

    #[test]
    fn test_command_strips_trailing_whitespace() {
        let registry = registry();
        let runner = Arc::new(RecordingRunner::default());
        let ctx = context_with(runner.clone());

        let value = ctx
            .resolver(&registry)
            .substitute("$(command xacro robot.xacro interface_name:=$(arg interface_name))")
            .unwrap();

        assert_eq!(value, "xacro robot.xacro interface_name:=eno0#1");
        assert_eq!(
            runner.calls.lock().unwrap()[0],
            vec!["xacro", "robot.xacro", "interface_name:=eno0"]
        );
    }

    #[test]
    fn test_command_failure() {
        let registry = registry();
        let ctx = context_with(Arc::new(RecordingRunner::failing(2)));

        let err = ctx
            .resolver(&registry)
            .substitute("$(command xacro missing.xacro)")
            .unwrap_err();
        match err {
            SubstitutionError::Execution { command, reason } => {
                assert_eq!(command, "xacro missing.xacro");
                assert!(reason.contains("exit code 2"));
                assert!(reason.contains("file not found"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_command_not_on_search_path() {
        let registry = registry();
        let dir = tempfile::tempdir().unwrap();
        let ctx = SubstitutionContext::new().with_search_path(dir.path().as_os_str());

        let err = ctx
            .resolver(&registry)
            .substitute("$(command xacro robot.xacro)")
            .unwrap_err();
        assert!(matches!(err, SubstitutionError::Execution { .. }));
        assert!(matches!(
            ctx.resolver(&registry).substitute("$(find-exec xacro)"),
            Err(SubstitutionError::ExecutableNotFound(_))
        ));
    }

    #[test]
    fn test_conditional_skips_unselected_command() {
        let mut registry = registry();
        registry.set_override("gui", "false").unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let ctx = context_with(runner.clone());

        let sub = Substitution::if_else(
            Substitution::arg("gui"),
            Substitution::command("rviz_config_generator --full"),
            Substitution::text("headless"),
        );
        let resolver = ctx.resolver(&registry);

        assert_eq!(resolver.evaluate(&sub).unwrap(), "headless");
        assert_eq!(runner.count(), 0);

        let flipped = Substitution::if_else(
            Substitution::text("true"),
            Substitution::command("rviz_config_generator --full"),
            Substitution::command("never_run"),
        );
        resolver.evaluate(&flipped).unwrap();
        assert_eq!(runner.count(), 1);
        assert_eq!(runner.calls.lock().unwrap()[0][0], "rviz_config_generator");
    }

    #[test]
    fn test_each_node_evaluated_once_per_call() {
        let registry = registry();
        let runner = Arc::new(RecordingRunner::default());
        let ctx = context_with(runner.clone());
        let sub = Substitution::concat([
            Substitution::command("first"),
            Substitution::text("|"),
            Substitution::command("second"),
        ]);
        let resolver = ctx.resolver(&registry);

        assert_eq!(resolver.evaluate(&sub).unwrap(), "first#1|second#2");
        assert_eq!(runner.count(), 2);
        // A new top-level call re-runs everything
        assert_eq!(resolver.evaluate(&sub).unwrap(), "first#3|second#4");
        assert_eq!(runner.count(), 4);
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let registry = registry();
        let ctx = context_with(Arc::new(RecordingRunner::default()));
        let sub = Substitution::parse(
            "$(find-pkg-share demo_pkg)/urdf -i $(arg interface_name) $(if $(arg gui) on off)",
        )
        .unwrap();
        assert!(sub.is_deterministic());

        let resolver = ctx.resolver(&registry);
        let first = resolver.evaluate(&sub).unwrap();
        let second = resolver.evaluate(&sub).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "/opt/ros/share/demo_pkg/urdf -i eno0 on");

        assert!(!Substitution::volatile_command("date +%s%N").is_deterministic());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true").unwrap());
        assert!(parse_bool("True").unwrap());
        assert!(parse_bool(" 1 ").unwrap());
        assert!(parse_bool("yes").unwrap());
        assert!(!parse_bool("false").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(!parse_bool("OFF").unwrap());
        assert!(matches!(
            parse_bool("maybe"),
            Err(SubstitutionError::InvalidBoolean(_))
        ));
    }

    #[test]
    fn test_undefined_arg_error() {
        let registry = registry();
        let ctx = SubstitutionContext::new();

        let result = ctx.resolver(&registry).substitute("$(arg undefined)");
        assert!(matches!(
            result,
            Err(SubstitutionError::Argument(ArgumentError::UnknownArgument(_)))
        ));
    }
}
