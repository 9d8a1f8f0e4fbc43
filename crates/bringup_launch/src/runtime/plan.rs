//! Launch plan construction: reachability, reference validation and
//! topological ordering of the exit-trigger graph

use crate::config::{
    ActionId, ActionSpec, ArgumentError, ArgumentRegistry, Condition, EventHandler, ExecutableRef,
    LaunchDescription, LaunchEntity,
};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// An action that is part of the plan
#[derive(Debug, Clone)]
pub struct PlannedAction {
    pub id: ActionId,
    /// Unique label (duplicates get a `-N` suffix)
    pub label: String,
    pub spec: ActionSpec,
    /// Started at launch rather than by a handler
    pub is_root: bool,
    /// Actions whose exit may start this one
    pub triggered_by: Vec<ActionId>,
}

/// Effect of a planned handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedEffect {
    /// Start an action
    Start(ActionId),
    /// Register the handler with this index
    Register(usize),
}

/// A flattened exit handler
#[derive(Debug, Clone)]
pub struct PlannedHandler {
    pub index: usize,
    pub target: ActionId,
    pub effects: Vec<PlannedEffect>,
    /// Enclosing handler, `None` for handlers registered at launch
    pub parent: Option<usize>,
}

/// Validated graph of actions and exit handlers, ready for execution
#[derive(Debug)]
pub struct LaunchPlan {
    registry: ArgumentRegistry,
    actions: IndexMap<ActionId, PlannedAction>,
    handlers: Vec<PlannedHandler>,
    roots: Vec<ActionId>,
    initial_handlers: Vec<usize>,
    order: Vec<ActionId>,
}

impl LaunchPlan {
    /// Resolved launch arguments
    pub fn registry(&self) -> &ArgumentRegistry {
        &self.registry
    }

    /// Actions in insertion order
    pub fn actions(&self) -> impl Iterator<Item = &PlannedAction> {
        self.actions.values()
    }

    pub fn action(&self, id: ActionId) -> Option<&PlannedAction> {
        self.actions.get(&id)
    }

    /// Find an action by label
    pub fn find(&self, label: &str) -> Option<&PlannedAction> {
        self.actions.values().find(|action| action.label == label)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Actions started at launch
    pub fn roots(&self) -> &[ActionId] {
        &self.roots
    }

    /// Handlers registered at launch, in registration order
    pub fn initial_handlers(&self) -> &[usize] {
        &self.initial_handlers
    }

    pub fn handler(&self, index: usize) -> Option<&PlannedHandler> {
        self.handlers.get(index)
    }

    pub fn handlers(&self) -> &[PlannedHandler] {
        &self.handlers
    }

    /// Every handler (registered at launch or nested) triggered by `target`
    pub fn handlers_for(&self, target: ActionId) -> impl Iterator<Item = &PlannedHandler> {
        self.handlers.iter().filter(move |h| h.target == target)
    }

    /// Actions in a topological order of the trigger graph
    pub fn launch_order(&self) -> impl Iterator<Item = &PlannedAction> {
        self.order.iter().filter_map(|id| self.actions.get(id))
    }

    fn label_of(&self, id: ActionId) -> &str {
        self.actions
            .get(&id)
            .map(|a| a.label.as_str())
            .unwrap_or("?")
    }
}

/// Builds a [`LaunchPlan`] from a [`LaunchDescription`]
#[derive(Debug, Clone, Default)]
pub struct PlanBuilder {
    overrides: Vec<(String, String)>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Argument overrides applied before any resolution
    pub fn with_overrides(
        mut self,
        overrides: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.overrides.extend(overrides);
        self
    }

    /// Validate a description and build its plan
    pub fn build(&self, desc: &LaunchDescription) -> Result<LaunchPlan, PlanError> {
        let mut registry = ArgumentRegistry::new();
        for argument in desc.arguments() {
            registry.insert(argument.clone())?;
        }
        registry.apply_overrides(self.overrides.iter().cloned())?;

        // Flatten top-level entities
        let mut roots: Vec<ActionId> = Vec::new();
        let mut handlers: Vec<PlannedHandler> = Vec::new();
        let mut initial_handlers = Vec::new();

        for entity in desc.entities() {
            match entity {
                LaunchEntity::Action(id) => {
                    check_declared(desc, *id, "launch description")?;
                    if !roots.contains(id) {
                        roots.push(*id);
                    }
                }
                LaunchEntity::OnExit(handler) => {
                    initial_handlers.push(flatten(desc, handler, None, &mut handlers)?);
                }
            }
        }

        // Everything started by the description or by some handler
        let mut referenced: HashSet<ActionId> = roots.iter().copied().collect();
        for handler in &handlers {
            for effect in &handler.effects {
                if let PlannedEffect::Start(id) = effect {
                    referenced.insert(*id);
                }
            }
        }

        for handler in &handlers {
            if !referenced.contains(&handler.target) {
                return Err(PlanError::DanglingReference {
                    referrer: format!("exit handler #{}", handler.index),
                    target: handler.target,
                });
            }
        }

        let mut members: Vec<ActionId> = referenced.into_iter().collect();
        members.sort();
        for (i, spec) in desc.actions().iter().enumerate() {
            if !members.contains(&ActionId(i)) {
                log::debug!(
                    "Action {} ({}) is never started and is left out of the plan",
                    ActionId(i),
                    spec.default_label()
                );
            }
        }

        let labels = unique_labels(desc, &members);
        let root_set: HashSet<ActionId> = roots.iter().copied().collect();
        let mut actions: IndexMap<ActionId, PlannedAction> = IndexMap::new();
        for id in &members {
            let spec = desc.actions()[id.0].clone();
            actions.insert(
                *id,
                PlannedAction {
                    id: *id,
                    label: labels[id].clone(),
                    spec,
                    is_root: root_set.contains(id),
                    triggered_by: Vec::new(),
                },
            );
        }

        for handler in &handlers {
            for effect in &handler.effects {
                if let PlannedEffect::Start(id) = effect {
                    if let Some(action) = actions.get_mut(id) {
                        if !action.triggered_by.contains(&handler.target) {
                            action.triggered_by.push(handler.target);
                        }
                    }
                }
            }
        }

        let order = topological_sort(&actions)?;

        Ok(LaunchPlan {
            registry,
            actions,
            handlers,
            roots,
            initial_handlers,
            order,
        })
    }
}

fn check_declared(desc: &LaunchDescription, id: ActionId, referrer: &str) -> Result<(), PlanError> {
    if desc.action(id).is_none() {
        return Err(PlanError::DanglingReference {
            referrer: referrer.to_string(),
            target: id,
        });
    }
    Ok(())
}

/// Flatten a handler tree depth-first, returning the handler's index
fn flatten(
    desc: &LaunchDescription,
    handler: &EventHandler,
    parent: Option<usize>,
    handlers: &mut Vec<PlannedHandler>,
) -> Result<usize, PlanError> {
    let index = handlers.len();
    let referrer = format!("exit handler #{}", index);
    check_declared(desc, handler.target, &referrer)?;

    handlers.push(PlannedHandler {
        index,
        target: handler.target,
        effects: Vec::new(),
        parent,
    });

    let mut effects = Vec::with_capacity(handler.effects.len());
    for effect in &handler.effects {
        match effect {
            LaunchEntity::Action(id) => {
                check_declared(desc, *id, &referrer)?;
                effects.push(PlannedEffect::Start(*id));
            }
            LaunchEntity::OnExit(nested) => {
                effects.push(PlannedEffect::Register(flatten(
                    desc,
                    nested,
                    Some(index),
                    handlers,
                )?));
            }
        }
    }
    handlers[index].effects = effects;
    Ok(index)
}

/// Labels in id order; repeated labels are numbered `label-1`, `label-2`, ...
/// skipping numbers another action already uses as its label
fn unique_labels(desc: &LaunchDescription, members: &[ActionId]) -> HashMap<ActionId, String> {
    let base: Vec<(ActionId, String)> = members
        .iter()
        .map(|id| (*id, desc.actions()[id.0].default_label()))
        .collect();

    let mut totals: HashMap<&str, usize> = HashMap::new();
    for (_, label) in &base {
        *totals.entry(label.as_str()).or_insert(0) += 1;
    }

    let mut taken: HashSet<String> = base
        .iter()
        .filter(|(_, label)| totals[label.as_str()] == 1)
        .map(|(_, label)| label.clone())
        .collect();
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut labels = HashMap::new();
    for (id, label) in &base {
        let unique = if totals[label.as_str()] > 1 {
            let n = seen.entry(label.as_str()).or_insert(0);
            loop {
                *n += 1;
                let candidate = format!("{}-{}", label, n);
                if taken.insert(candidate.clone()) {
                    break candidate;
                }
            }
        } else {
            label.clone()
        };
        labels.insert(*id, unique);
    }
    labels
}

/// Topological sort using Kahn's algorithm
fn topological_sort(
    actions: &IndexMap<ActionId, PlannedAction>,
) -> Result<Vec<ActionId>, PlanError> {
    // Build adjacency list and in-degree count
    let mut in_degree: HashMap<ActionId, usize> = HashMap::new();
    let mut dependents: HashMap<ActionId, Vec<ActionId>> = HashMap::new();

    for (id, action) in actions {
        in_degree.entry(*id).or_insert(0);
        for trigger in &action.triggered_by {
            *in_degree.entry(*id).or_insert(0) += 1;
            dependents.entry(*trigger).or_default().push(*id);
        }
    }

    // Start with actions nothing waits on, in insertion order
    let mut queue: VecDeque<ActionId> = actions
        .keys()
        .filter(|id| in_degree[*id] == 0)
        .copied()
        .collect();

    let mut sorted = Vec::with_capacity(actions.len());

    while let Some(id) = queue.pop_front() {
        sorted.push(id);

        // Reduce in-degree for dependents
        if let Some(deps) = dependents.get(&id) {
            for dep in deps {
                if let Some(degree) = in_degree.get_mut(dep) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*dep);
                    }
                }
            }
        }
    }

    // Check for cycles
    if sorted.len() != actions.len() {
        let sorted_ids: HashSet<_> = sorted.iter().collect();
        let cycle: Vec<String> = actions
            .values()
            .filter(|action| !sorted_ids.contains(&action.id))
            .map(|action| action.label.clone())
            .collect();

        return Err(PlanError::CyclicDependency(cycle));
    }

    Ok(sorted)
}

/// Errors that can occur when building a launch plan
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Invalid launch arguments: {0}")]
    Argument(#[from] ArgumentError),

    #[error("{referrer} references action {target}, which is not part of the launch plan")]
    DanglingReference { referrer: String, target: ActionId },

    #[error("Cyclic dependency detected involving actions: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),
}

impl fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Launch Plan")?;
        writeln!(f, "===========")?;
        writeln!(f)?;

        if !self.registry.is_empty() {
            writeln!(f, "Arguments:")?;
            for (arg, value) in self.registry.iter() {
                writeln!(f, "  {}: {}", arg.name, value)?;
            }
            writeln!(f)?;
        }

        writeln!(f, "Actions (in launch order):")?;
        for (i, action) in self.launch_order().enumerate() {
            writeln!(f)?;
            writeln!(
                f,
                "  {}. {}{}",
                i + 1,
                action.label,
                if action.is_root { " [root]" } else { "" }
            )?;
            match &action.spec.executable {
                ExecutableRef::Package {
                    package,
                    executable,
                } => writeln!(f, "     Executable: {} ({})", executable, package)?,
                ExecutableRef::Path(sub) => writeln!(f, "     Executable: {}", sub)?,
            }
            if !action.spec.arguments.is_empty() {
                let args: Vec<String> =
                    action.spec.arguments.iter().map(|a| a.to_string()).collect();
                writeln!(f, "     Arguments: {}", args.join(" "))?;
            }
            if let Some(condition) = &action.spec.condition {
                writeln!(f, "     Condition: {}", condition)?;
            }
            if !action.triggered_by.is_empty() {
                let triggers: Vec<&str> = action
                    .triggered_by
                    .iter()
                    .map(|id| self.label_of(*id))
                    .collect();
                writeln!(f, "     Starts after: {}", triggers.join(", "))?;
            }
        }

        Ok(())
    }
}

impl PlannedAction {
    /// Condition gating this action, if any
    pub fn condition(&self) -> Option<&Condition> {
        self.spec.condition.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Substitution;

    fn sh(label: &str) -> ActionSpec {
        ActionSpec::process("sh").label(label)
    }

    #[test]
    fn test_simple_trigger_order() {
        let mut desc = LaunchDescription::new();
        let a = desc.launch(sh("a"));
        let b = desc.add_action(sh("b"));
        let c = desc.add_action(sh("c"));
        desc.on_exit(b, [LaunchEntity::Action(c)]);
        desc.on_exit(a, [LaunchEntity::Action(b)]);

        let plan = PlanBuilder::new().build(&desc).unwrap();
        let order: Vec<_> = plan.launch_order().map(|n| n.label.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(plan.roots(), &[a]);
        assert_eq!(plan.initial_handlers(), &[0, 1]);
        assert_eq!(plan.action(c).unwrap().triggered_by, vec![b]);
        assert_eq!(plan.handlers_for(a).count(), 1);
    }

    #[test]
    fn test_diamond_dependency() {
        let mut desc = LaunchDescription::new();
        let a = desc.launch(sh("a"));
        let b = desc.add_action(sh("b"));
        let c = desc.add_action(sh("c"));
        let d = desc.add_action(sh("d"));
        desc.on_exit(a, [LaunchEntity::Action(b), LaunchEntity::Action(c)]);
        desc.on_exit(b, [LaunchEntity::Action(d)]);
        desc.on_exit(c, [LaunchEntity::Action(d)]);

        let plan = PlanBuilder::new().build(&desc).unwrap();
        let order: Vec<_> = plan.launch_order().map(|n| n.label.as_str()).collect();
        // a must come first, d must come last, b and c can be in any order
        assert_eq!(order[0], "a");
        assert_eq!(order[3], "d");
        assert!(order[1] == "b" || order[1] == "c");
        assert!(order[2] == "b" || order[2] == "c");
        assert_eq!(plan.action(d).unwrap().triggered_by, vec![b, c]);
    }

    #[test]
    fn test_cyclic_dependency_detection() {
        let mut desc = LaunchDescription::new();
        let root = desc.launch(sh("root"));
        let a = desc.add_action(sh("a"));
        let b = desc.add_action(sh("b"));
        desc.on_exit(root, [LaunchEntity::Action(a)]);
        desc.on_exit(a, [LaunchEntity::Action(b)]);
        desc.on_exit(b, [LaunchEntity::Action(a)]);

        let result = PlanBuilder::new().build(&desc);
        match result {
            Err(PlanError::CyclicDependency(labels)) => assert_eq!(labels, vec!["a", "b"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_trigger_is_a_cycle() {
        let mut desc = LaunchDescription::new();
        let a = desc.launch(sh("a"));
        desc.on_exit(a, [LaunchEntity::Action(a)]);

        assert!(matches!(
            PlanBuilder::new().build(&desc),
            Err(PlanError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_dangling_handler_target() {
        let mut desc = LaunchDescription::new();
        let a = desc.launch(sh("a"));
        let orphan = desc.add_action(sh("orphan"));
        desc.on_exit(orphan, [LaunchEntity::Action(a)]);

        assert!(matches!(
            PlanBuilder::new().build(&desc),
            Err(PlanError::DanglingReference { target, .. }) if target == orphan
        ));
    }

    #[test]
    fn test_dangling_effect_out_of_range() {
        let mut desc = LaunchDescription::new();
        let a = desc.launch(sh("a"));
        desc.on_exit(a, [LaunchEntity::Action(ActionId(7))]);

        assert!(matches!(
            PlanBuilder::new().build(&desc),
            Err(PlanError::DanglingReference { target: ActionId(7), .. })
        ));
    }

    #[test]
    fn test_nested_handlers_are_flattened() {
        let mut desc = LaunchDescription::new();
        let a = desc.launch(sh("a"));
        let b = desc.add_action(sh("b"));
        let c = desc.add_action(sh("c"));
        desc.on_exit(
            a,
            [
                LaunchEntity::Action(b),
                LaunchEntity::OnExit(EventHandler::starting(b, [c])),
            ],
        );

        let plan = PlanBuilder::new().build(&desc).unwrap();
        assert_eq!(plan.initial_handlers(), &[0]);
        assert_eq!(
            plan.handler(0).unwrap().effects,
            vec![PlannedEffect::Start(b), PlannedEffect::Register(1)]
        );
        assert_eq!(plan.handler(1).unwrap().parent, Some(0));
        assert_eq!(plan.action(c).unwrap().triggered_by, vec![b]);
    }

    #[test]
    fn test_unreferenced_actions_left_out() {
        let mut desc = LaunchDescription::new();
        desc.launch(sh("a"));
        desc.add_action(sh("unused"));

        let plan = PlanBuilder::new().build(&desc).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan.find("unused").is_none());
    }

    #[test]
    fn test_duplicate_labels_are_numbered() {
        let mut desc = LaunchDescription::new();
        let first = desc.launch(ActionSpec::node("controller_manager", "spawner"));
        let second = desc.add_action(ActionSpec::node("controller_manager", "spawner"));
        desc.launch(ActionSpec::node("rviz2", "rviz2"));
        desc.on_exit(first, [LaunchEntity::Action(second)]);

        let plan = PlanBuilder::new().build(&desc).unwrap();
        assert_eq!(plan.action(first).unwrap().label, "spawner-1");
        assert_eq!(plan.action(second).unwrap().label, "spawner-2");
        assert!(plan.find("rviz2").is_some());
    }

    #[test]
    fn test_numbering_skips_taken_labels() {
        let mut desc = LaunchDescription::new();
        let explicit =
            desc.launch(ActionSpec::node("controller_manager", "spawner").label("spawner-1"));
        let first = desc.launch(ActionSpec::node("controller_manager", "spawner"));
        let second = desc.launch(ActionSpec::node("controller_manager", "spawner"));

        let plan = PlanBuilder::new().build(&desc).unwrap();
        assert_eq!(plan.action(explicit).unwrap().label, "spawner-1");
        assert_eq!(plan.action(first).unwrap().label, "spawner-2");
        assert_eq!(plan.action(second).unwrap().label, "spawner-3");
        assert_eq!(plan.find("spawner-1").unwrap().id, explicit);
    }

    #[test]
    fn test_argument_errors_surface() {
        let mut desc = LaunchDescription::new();
        desc.declare_argument("gui", "true", "");
        desc.declare_argument("gui", "false", "");
        assert!(matches!(
            PlanBuilder::new().build(&desc),
            Err(PlanError::Argument(ArgumentError::DuplicateArgument(_)))
        ));

        let mut desc = LaunchDescription::new();
        desc.declare_argument("gui", "true", "");
        let result = PlanBuilder::new()
            .with_overrides([("robot_ip".to_string(), "10.0.0.2".to_string())])
            .build(&desc);
        assert!(matches!(
            result,
            Err(PlanError::Argument(ArgumentError::UnknownArgument(_)))
        ));
    }

    #[test]
    fn test_overrides_applied() {
        let mut desc = LaunchDescription::new();
        desc.declare_argument("gui", "true", "");
        desc.launch(sh("viewer").if_condition(Substitution::arg("gui")));

        let plan = PlanBuilder::new()
            .with_overrides([("gui".to_string(), "false".to_string())])
            .build(&desc)
            .unwrap();
        assert_eq!(plan.registry().resolve("gui").unwrap(), "false");

        let shown = plan.to_string();
        assert!(shown.contains("gui: false"));
        assert!(shown.contains("viewer [root]"));
        assert!(shown.contains("Condition: if $(arg gui)"));
    }
}
