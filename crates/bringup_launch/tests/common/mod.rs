//! Test helpers for launch scenario tests

#![allow(dead_code)]

use bringup_launch::config::{
    ActionSpec, AmentIndex, CommandOutput, CommandRunner, SubstitutionContext,
};
use bringup_launch::{Executor, ExecutorConfig};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Packages of the single-DOF bringup
pub const PACKAGES: [&str; 4] = [
    "robot_state_publisher",
    "controller_manager",
    "rviz2",
    "synapticon_ros2_control",
];

/// Succeeds only when handed a parameters file carrying a robot description
const STATE_PUBLISHER: &str = r#"prev=""
for arg in "$@"; do
  if [ "$prev" = "--params-file" ]; then
    grep -q robot_description "$arg" && exit 0
  fi
  prev="$arg"
done
exit 1"#;

/// A throwaway install prefix with stand-in node executables.
///
/// The spawners sleep briefly so that exit ordering is observable.
pub struct FakeInstall {
    dir: TempDir,
}

impl FakeInstall {
    pub fn new() -> Self {
        let install = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        for package in PACKAGES {
            std::fs::create_dir_all(install.share(package).join("config")).unwrap();
            std::fs::create_dir_all(install.lib(package)).unwrap();
        }
        install.script(
            &install.lib("robot_state_publisher").join("robot_state_publisher"),
            STATE_PUBLISHER,
        );
        install.script(&install.lib("controller_manager").join("spawner"), "sleep 0.2");
        install.script(&install.lib("rviz2").join("rviz2"), "exit 0");
        install.script(&install.bin().join("xacro"), "echo '<robot/>'");
        install
    }

    pub fn prefix(&self) -> &Path {
        self.dir.path()
    }

    pub fn share(&self, package: &str) -> PathBuf {
        self.prefix().join("share").join(package)
    }

    pub fn lib(&self, package: &str) -> PathBuf {
        self.prefix().join("lib").join(package)
    }

    pub fn bin(&self) -> PathBuf {
        self.prefix().join("bin")
    }

    fn script(&self, path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Package index pinned to this prefix
    pub fn packages(&self) -> AmentIndex {
        PACKAGES
            .iter()
            .fold(AmentIndex::default(), |index, package| {
                index.with_override(*package, self.share(package))
            })
    }

    /// Substitution context over this prefix, with `runner` standing in for
    /// external commands
    pub fn context(&self, runner: Arc<RecordingRunner>) -> SubstitutionContext {
        SubstitutionContext::new()
            .with_search_path(self.bin())
            .with_runner(runner)
            .with_packages(Arc::new(self.packages()))
    }
}

/// Command runner that records every command line
pub struct RecordingRunner {
    stdout: String,
    calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingRunner {
    pub fn new(stdout: &str) -> Arc<Self> {
        Arc::new(Self {
            stdout: stdout.to_string(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, argv: &[String]) -> std::io::Result<CommandOutput> {
        self.calls.lock().unwrap().push(argv.to_vec());
        Ok(CommandOutput {
            status: Some(0),
            stdout: format!("{}\n", self.stdout),
            stderr: String::new(),
        })
    }
}

/// A shell one-liner action
pub fn sh(label: &str, script: &str) -> ActionSpec {
    ActionSpec::process("sh").label(label).args(["-c", script])
}

/// Executor with a short grace period and no output files
pub fn executor(config: ExecutorConfig) -> Executor {
    Executor::new(config, SubstitutionContext::new())
}

pub fn quick_config() -> ExecutorConfig {
    ExecutorConfig {
        shutdown_timeout: Duration::from_millis(300),
        ..Default::default()
    }
}
