//! Built-in single-DOF Synapticon bringup
//!
//! Starts the robot state publisher and the inactive controller spawner
//! immediately, the joint state broadcaster spawner once the inactive spawner
//! has exited, and RViz2 (when `gui` is true) once the broadcaster spawner has
//! exited.

use crate::config::{ActionSpec, LaunchDescription, LaunchEntity, OutputPolicy, Substitution};

/// Package providing the URDF, controller and RViz configuration
pub const DESCRIPTION_PACKAGE: &str = "synapticon_ros2_control";
pub const CONTROLLER_MANAGER: &str = "controller_manager";

pub const URDF_FILE: &str = "single_dof_in_world.urdf.xacro";
pub const CONTROLLERS_FILE: &str = "single_dof_controllers.yaml";
pub const RVIZ_FILE: &str = "single_dof.rviz";

/// Controllers loaded inactive before the broadcaster starts
pub const INACTIVE_CONTROLLERS: [&str; 4] = [
    "forward_torque_controller",
    "forward_velocity_controller",
    "forward_position_controller",
    "quick_stop_controller",
];

fn share_file(dir: &str, file: &str) -> Substitution {
    Substitution::path_join([
        Substitution::package_share(DESCRIPTION_PACKAGE),
        dir.into(),
        file.into(),
    ])
}

/// The single-DOF bringup description
pub fn single_dof() -> LaunchDescription {
    let mut desc = LaunchDescription::new();
    desc.declare_argument(
        "gui",
        "true",
        "Start RViz2 automatically with this launch file.",
    );
    desc.declare_argument(
        "interface_name",
        "eno0",
        "Ethernet interface name (e.g., eno0, eth0)",
    );

    // URDF via xacro, passing the interface name through
    let robot_description = Substitution::command(Substitution::concat([
        Substitution::find_executable("xacro"),
        " ".into(),
        share_file("urdf", URDF_FILE),
        " interface_name:=".into(),
        Substitution::arg("interface_name"),
    ]));

    desc.launch(
        ActionSpec::node("robot_state_publisher", "robot_state_publisher")
            .label("robot_state_publisher")
            .output(OutputPolicy::Both)
            .parameter("robot_description", robot_description),
    );

    let inactive_spawner = desc.launch(
        ActionSpec::node(CONTROLLER_MANAGER, "spawner")
            .label("inactive_controller_spawner")
            .arg("--inactive")
            .args(INACTIVE_CONTROLLERS)
            .arg("--param-file")
            .arg(share_file("config", CONTROLLERS_FILE)),
    );

    let broadcaster_spawner = desc.add_action(
        ActionSpec::node(CONTROLLER_MANAGER, "spawner")
            .label("joint_state_broadcaster_spawner")
            .arg("joint_state_broadcaster"),
    );

    let rviz = desc.add_action(
        ActionSpec::node("rviz2", "rviz2")
            .label("rviz")
            .node_name("rviz2")
            .output(OutputPolicy::Log)
            .arg("-d")
            .arg(share_file("config", RVIZ_FILE))
            .if_condition(Substitution::arg("gui")),
    );

    desc.on_exit(broadcaster_spawner, [LaunchEntity::Action(rviz)]);
    desc.on_exit(inactive_spawner, [LaunchEntity::Action(broadcaster_spawner)]);

    desc
}
