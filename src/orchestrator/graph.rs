//! Dependency resolution for requested module sets
//!
//! Produces a deterministic execution order: modules are sorted by
//! descending priority (stable on request order) before a depth-first
//! topological visit, so higher-priority modules run first among
//! independents while dependencies always precede dependents.

use std::collections::HashMap;

use crate::error::OrchestrationError;
use crate::modules::ModuleConfig;

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Compute a valid execution order for the requested modules.
///
/// The graph is restricted to the requested set: dependencies outside it
/// are ignored. A module revisited while still in progress means the
/// requested graph is cyclic, which aborts the whole orchestration.
pub fn execution_order(
    configs: &HashMap<String, ModuleConfig>,
    requested: &[String],
) -> Result<Vec<String>, OrchestrationError> {
    let mut roots: Vec<&String> = Vec::new();
    for name in requested {
        if !configs.contains_key(name) {
            return Err(OrchestrationError::UnknownModule { name: name.clone() });
        }
        if !roots.contains(&name) {
            roots.push(name);
        }
    }

    // Stable sort keeps request order among equal priorities
    roots.sort_by_key(|name| std::cmp::Reverse(configs[*name].priority));

    let mut marks: HashMap<String, Mark> = roots
        .iter()
        .map(|name| ((*name).clone(), Mark::Unvisited))
        .collect();
    let mut order = Vec::with_capacity(roots.len());

    for root in &roots {
        visit(root, configs, &mut marks, &mut order)?;
    }

    Ok(order)
}

fn visit(
    name: &str,
    configs: &HashMap<String, ModuleConfig>,
    marks: &mut HashMap<String, Mark>,
    order: &mut Vec<String>,
) -> Result<(), OrchestrationError> {
    match marks.get(name).copied() {
        // Not part of the requested set
        None => return Ok(()),
        Some(Mark::Done) => return Ok(()),
        Some(Mark::InProgress) => {
            return Err(OrchestrationError::CircularDependency {
                module: name.to_string(),
            });
        }
        Some(Mark::Unvisited) => {}
    }

    marks.insert(name.to_string(), Mark::InProgress);

    // BTreeSet iteration keeps dependency visits deterministic
    for dependency in &configs[name].dependencies {
        visit(dependency, configs, marks, order)?;
    }

    marks.insert(name.to_string(), Mark::Done);
    order.push(name.to_string());
    Ok(())
}
