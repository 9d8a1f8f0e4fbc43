//! Command-line interface for bringup_launch

use crate::runtime::{default_log_root, TriggerPolicy};
use argh::FromArgs;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// ROS2-style launcher for robot bringup process graphs
#[derive(FromArgs, Debug)]
pub struct LaunchArgs {
    /// path to a YAML launch file (default: the built-in single-DOF bringup)
    #[argh(positional)]
    pub launch_file: Option<String>,

    /// override launch arguments (format: key:=value)
    #[argh(option, short = 'a', from_str_fn(parse_arg_override))]
    pub arg: Vec<(String, String)>,

    /// pin a package's share directory (format: package=/path/to/share)
    #[argh(option, short = 'p', from_str_fn(parse_package_override))]
    pub package: Vec<(String, PathBuf)>,

    /// show the resolved launch plan without executing
    #[argh(switch)]
    pub dry_run: bool,

    /// validate the launch description and exit
    #[argh(switch)]
    pub validate: bool,

    /// list the declared launch arguments and exit
    #[argh(switch)]
    pub show_args: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,

    /// root directory for process output logs (default: $ROS_LOG_DIR or ~/.ros/log)
    #[argh(option)]
    pub log_dir: Option<PathBuf>,

    /// milliseconds between SIGTERM and a forced kill on shutdown
    #[argh(option, default = "5000")]
    pub grace_period_ms: u64,

    /// only fire exit handlers when the process exited with code 0
    #[argh(switch)]
    pub success_only: bool,

    /// write the run summary as JSON to this path
    #[argh(option)]
    pub summary_json: Option<PathBuf>,
}

/// Parse argument override in format "key:=value" (or "key=value")
fn parse_arg_override(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once(":=")
        .or_else(|| s.split_once('='))
        .ok_or_else(|| format!("Invalid argument format '{}'. Expected 'key:=value'", s))?;
    if key.is_empty() {
        return Err(format!("Missing argument name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Parse package override in format "package=/share/path"
fn parse_package_override(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((package, path)) if !package.is_empty() && !path.is_empty() => {
            Ok((package.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!(
            "Invalid package format '{}'. Expected 'package=/path/to/share'",
            s
        )),
    }
}

impl LaunchArgs {
    /// Argument overrides in command-line order
    pub fn arg_overrides(&self) -> Vec<(String, String)> {
        self.arg.clone()
    }

    pub fn package_overrides(&self) -> HashMap<String, PathBuf> {
        self.package.iter().cloned().collect()
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn trigger_policy(&self) -> TriggerPolicy {
        if self.success_only {
            TriggerPolicy::SuccessOnly
        } else {
            TriggerPolicy::AnyExit
        }
    }

    /// `--log-dir`, else the ROS default
    pub fn log_root(&self) -> Option<PathBuf> {
        self.log_dir.clone().or_else(default_log_root)
    }

    /// Level for the default log filter, `info` when unrecognized
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> LaunchArgs {
        LaunchArgs::from_args(&["bringup_launch"], args).unwrap()
    }

    #[test]
    fn test_parse_arg_override() {
        let result = parse_arg_override("gui:=false");
        assert_eq!(result, Ok(("gui".to_string(), "false".to_string())));
    }

    #[test]
    fn test_parse_arg_override_with_equals() {
        let result = parse_arg_override("url:=http://localhost:8080?a=b");
        assert_eq!(
            result,
            Ok(("url".to_string(), "http://localhost:8080?a=b".to_string()))
        );
        let result = parse_arg_override("interface_name=eth0");
        assert_eq!(result, Ok(("interface_name".to_string(), "eth0".to_string())));
    }

    #[test]
    fn test_parse_arg_override_invalid() {
        assert!(parse_arg_override("invalid").is_err());
        assert!(parse_arg_override(":=value").is_err());
    }

    #[test]
    fn test_parse_package_override() {
        let result = parse_package_override("synapticon_ros2_control=/opt/ws/share/synapticon");
        assert_eq!(
            result,
            Ok((
                "synapticon_ros2_control".to_string(),
                PathBuf::from("/opt/ws/share/synapticon")
            ))
        );
        assert!(parse_package_override("no_path=").is_err());
        assert!(parse_package_override("/just/a/path").is_err());
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert!(args.launch_file.is_none());
        assert_eq!(args.grace_period(), Duration::from_secs(5));
        assert_eq!(args.trigger_policy(), TriggerPolicy::AnyExit);
        assert_eq!(args.log_filter(), "info");
        assert!(!args.dry_run);
    }

    #[test]
    fn test_full_command_line() {
        let args = parse(&[
            "launch/single_dof.launch.yaml",
            "-a",
            "gui:=false",
            "-a",
            "interface_name:=eth0",
            "-p",
            "rviz2=/tmp/share/rviz2",
            "--success-only",
            "--grace-period-ms",
            "250",
            "--log-dir",
            "/tmp/bringup-logs",
            "-l",
            "DEBUG",
        ]);
        assert_eq!(args.launch_file.as_deref(), Some("launch/single_dof.launch.yaml"));
        assert_eq!(
            args.arg_overrides(),
            vec![
                ("gui".to_string(), "false".to_string()),
                ("interface_name".to_string(), "eth0".to_string()),
            ]
        );
        assert_eq!(
            args.package_overrides()["rviz2"],
            PathBuf::from("/tmp/share/rviz2")
        );
        assert_eq!(args.trigger_policy(), TriggerPolicy::SuccessOnly);
        assert_eq!(args.grace_period(), Duration::from_millis(250));
        assert_eq!(args.log_root(), Some(PathBuf::from("/tmp/bringup-logs")));
        assert_eq!(args.log_filter(), "debug");
    }
}
