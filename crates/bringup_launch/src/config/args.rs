//! Declared launch arguments and their run-time values

use indexmap::IndexMap;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;

/// Valid argument names: identifiers, as accepted by `$(arg NAME)`
static ARG_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// A launch argument declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredArgument {
    pub name: String,
    pub default: String,
    pub description: String,
}

impl DeclaredArgument {
    pub fn new(
        name: impl Into<String>,
        default: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            default: default.into(),
            description: description.into(),
        }
    }
}

/// Registry of declared arguments.
///
/// Overrides may only be applied before the first call to [`resolve`]; after
/// that the registry is frozen so every lookup within a session observes the
/// same value.
///
/// [`resolve`]: ArgumentRegistry::resolve
#[derive(Debug, Default)]
pub struct ArgumentRegistry {
    declared: IndexMap<String, DeclaredArgument>,
    overrides: HashMap<String, String>,
    frozen: AtomicBool,
}

impl ArgumentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a new argument
    pub fn declare(
        &mut self,
        name: impl Into<String>,
        default: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<(), ArgumentError> {
        self.insert(DeclaredArgument::new(name, default, description))
    }

    /// Register a prepared declaration
    pub fn insert(&mut self, argument: DeclaredArgument) -> Result<(), ArgumentError> {
        if *self.frozen.get_mut() {
            return Err(ArgumentError::RegistryFrozen(argument.name));
        }
        if !ARG_NAME_PATTERN.is_match(&argument.name) {
            return Err(ArgumentError::InvalidArgumentName(argument.name));
        }
        if self.declared.contains_key(&argument.name) {
            return Err(ArgumentError::DuplicateArgument(argument.name));
        }
        self.declared.insert(argument.name.clone(), argument);
        Ok(())
    }

    /// Override the value of a declared argument
    pub fn set_override(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ArgumentError> {
        let name = name.into();
        if *self.frozen.get_mut() {
            return Err(ArgumentError::RegistryFrozen(name));
        }
        if !self.declared.contains_key(&name) {
            return Err(ArgumentError::UnknownArgument(name));
        }
        self.overrides.insert(name, value.into());
        Ok(())
    }

    /// Apply a batch of `name -> value` overrides (e.g. from the command line)
    pub fn apply_overrides<I, K, V>(&mut self, overrides: I) -> Result<(), ArgumentError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in overrides {
            self.set_override(name, value)?;
        }
        Ok(())
    }

    /// Resolve the run-time value of an argument, freezing the registry
    pub fn resolve(&self, name: &str) -> Result<&str, ArgumentError> {
        self.frozen.store(true, Ordering::Release);
        if let Some(value) = self.overrides.get(name) {
            return Ok(value);
        }
        self.declared
            .get(name)
            .map(|arg| arg.default.as_str())
            .ok_or_else(|| ArgumentError::UnknownArgument(name.to_string()))
    }

    /// Whether resolution has started
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.declared.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.declared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }

    /// Declarations paired with their effective values, in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&DeclaredArgument, &str)> {
        self.declared.values().map(|arg| {
            let value = self
                .overrides
                .get(&arg.name)
                .map(String::as_str)
                .unwrap_or(arg.default.as_str());
            (arg, value)
        })
    }
}

/// Errors raised while declaring or resolving arguments
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArgumentError {
    #[error("Argument '{0}' is declared more than once")]
    DuplicateArgument(String),

    #[error("Unknown argument: {0}")]
    UnknownArgument(String),

    #[error("Invalid argument name '{0}'")]
    InvalidArgumentName(String),

    #[error("Cannot modify argument '{0}': resolution has already started")]
    RegistryFrozen(String),
}
