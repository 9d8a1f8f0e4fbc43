//! Bringup Launch System
//!
//! A ROS2-style launcher that starts a robot control stack as a graph of
//! cooperating processes.
//!
//! # Overview
//!
//! The launch system allows you to:
//! - Declare launch arguments and override them at launch time
//! - Compute process arguments from substitutions (argument and environment
//!   lookups, path joins, package share lookups, command output)
//! - Start processes only after other processes have exited
//! - Skip processes whose condition evaluates to false
//! - Shut everything down cleanly on Ctrl+C
//!
//! # Example Launch File
//!
//! ```yaml
//! version: "1.0"
//!
//! args:
//!   gui:
//!     default: true
//!
//! actions:
//!   spawner:
//!     package: controller_manager
//!     executable: spawner
//!     arguments: ["joint_state_broadcaster"]
//!
//!   rviz:
//!     package: rviz2
//!     executable: rviz2
//!     arguments:
//!       - "-d"
//!       - path_join: ["$(find-pkg-share my_robot)", "config", "view.rviz"]
//!     if: "$(arg gui)"
//!
//! on_exit:
//!   spawner: [rviz]
//! ```

pub mod bringup;
pub mod cli;
pub mod config;
pub mod runtime;

pub use cli::LaunchArgs;
pub use config::{
    ActionId, ActionSpec, ArgumentError, ArgumentRegistry, LaunchDescription, LaunchEntity,
    LaunchFile, LaunchFileError, Substitution, SubstitutionContext, SubstitutionError,
};
pub use runtime::{
    ActionState, Executor, ExecutorConfig, ExecutorError, LaunchPlan, PlanBuilder, PlanError,
    ResolvedPlan, RunSummary, SkipReason, TriggerPolicy,
};
