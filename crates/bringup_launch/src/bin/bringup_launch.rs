//! Bringup Launch CLI
//!
//! Usage:
//!   bringup_launch
//!   bringup_launch -a gui:=false -a interface_name:=eth0
//!   bringup_launch launch/single_dof.launch.yaml --dry-run

use bringup_launch::config::AmentIndex;
use bringup_launch::{
    bringup, Executor, ExecutorConfig, LaunchArgs, LaunchDescription, LaunchFile, PlanBuilder,
    RunSummary, SubstitutionContext,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let args: LaunchArgs = argh::from_env();

    // Initialize logging
    let env = env_logger::Env::default().default_filter_or(args.log_filter());
    env_logger::init_from_env(env);

    // Load the launch description
    let mut packages = HashMap::new();
    let mut global_env = HashMap::new();
    let desc: LaunchDescription = match &args.launch_file {
        Some(path) => {
            log::info!("Loading launch file: {}", path);
            let launch_file = match LaunchFile::from_file(path) {
                Ok(lf) => lf,
                Err(e) => {
                    log::error!("Failed to load launch file: {}", e);
                    std::process::exit(1);
                }
            };
            packages = launch_file.package_overrides();
            global_env = launch_file.env.clone();
            match launch_file.to_description() {
                Ok(desc) => desc,
                Err(e) => {
                    log::error!("Invalid launch file: {}", e);
                    std::process::exit(1);
                }
            }
        }
        None => {
            log::info!("Using the built-in single-DOF bringup");
            bringup::single_dof()
        }
    };
    packages.extend(args.package_overrides());

    let plan = match PlanBuilder::new()
        .with_overrides(args.arg_overrides())
        .build(&desc)
    {
        Ok(plan) => plan,
        Err(e) => {
            log::error!("Failed to build launch plan: {}", e);
            std::process::exit(1);
        }
    };

    if args.show_args {
        println!("Arguments:");
        for (arg, value) in plan.registry().iter() {
            println!("  {}: {} (default: {})", arg.name, value, arg.default);
            if !arg.description.is_empty() {
                println!("      {}", arg.description);
            }
        }
        return;
    }

    // Validate only mode
    if args.validate {
        println!(
            "Launch description '{}' is valid",
            args.launch_file.as_deref().unwrap_or("single_dof (built-in)")
        );
        println!("  Args: {}", plan.registry().len());
        println!("  Actions: {}", plan.len());
        println!("  Exit handlers: {}", plan.handlers().len());
        return;
    }

    let context = SubstitutionContext::new()
        .with_packages(Arc::new(AmentIndex::from_env().with_overrides(packages)))
        .with_envs(global_env);
    let executor_config = ExecutorConfig {
        shutdown_timeout: args.grace_period(),
        trigger_policy: args.trigger_policy(),
        log_root: args.log_root(),
    };
    let executor = Executor::new(executor_config, context);

    let resolved = match executor.resolve(&plan) {
        Ok(resolved) => resolved,
        Err(e) => {
            log::error!("Failed to resolve launch plan: {}", e);
            std::process::exit(1);
        }
    };

    // Dry run mode
    if args.dry_run {
        println!("{}", resolved);
        return;
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // Set up Ctrl+C handler
    {
        let shutdown_tx = shutdown_tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            log::info!("Received Ctrl+C, initiating shutdown...");
            let _ = shutdown_tx.send(());
        }) {
            log::error!("Error setting Ctrl+C handler: {}", e);
            std::process::exit(1);
        }
    }

    let summary = executor.execute(&plan, &resolved, shutdown_rx).await;
    println!("{}", summary);

    if let Some(path) = &args.summary_json {
        if let Err(e) = write_summary(&summary, path) {
            log::error!("Failed to write summary to {}: {}", path.display(), e);
        }
    }

    log::info!("Bringup launcher exiting");
    drop(shutdown_tx);
    std::process::exit(summary.exit_code());
}

fn write_summary(summary: &RunSummary, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, json)
}
