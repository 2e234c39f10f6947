//! Topological wave computation over the subtask DAG.
//!
//! A wave is the set of subtasks with no unmet dependency among the
//! remaining ones. Waves are scheduling hints only — execution is
//! sequential, specifically to keep multiple agents out of one shared
//! worktree — but they fix the order and catch cycles early.

use std::collections::{BTreeMap, BTreeSet};

use shipwright_utils::error::EngineError;

use crate::stage::Subtask;

/// Compute execution waves for the subtask DAG.
///
/// # Errors
///
/// [`EngineError::Decompose`] on duplicate ids, references to unknown
/// ids, or dependency cycles.
pub fn compute_waves(subtasks: &[Subtask]) -> Result<Vec<Vec<String>>, EngineError> {
    let mut known: BTreeSet<&str> = BTreeSet::new();
    for sub in subtasks {
        if !known.insert(sub.id.as_str()) {
            return Err(EngineError::Decompose {
                reason: format!("duplicate subtask id '{}'", sub.id),
            });
        }
    }

    let mut pending: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for sub in subtasks {
        let mut deps = BTreeSet::new();
        for dep in &sub.blocked_by {
            if !known.contains(dep.as_str()) {
                return Err(EngineError::Decompose {
                    reason: format!(
                        "subtask '{}' is blocked by unknown id '{}'",
                        sub.id, dep
                    ),
                });
            }
            if dep == &sub.id {
                return Err(EngineError::Decompose {
                    reason: format!("subtask '{}' is blocked by itself", sub.id),
                });
            }
            deps.insert(dep.as_str());
        }
        pending.insert(sub.id.as_str(), deps);
    }

    let mut waves = Vec::new();
    while !pending.is_empty() {
        let ready: Vec<String> = pending
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| (*id).to_string())
            .collect();

        if ready.is_empty() {
            let stuck: Vec<&str> = pending.keys().copied().collect();
            return Err(EngineError::Decompose {
                reason: format!("dependency cycle among subtasks: {}", stuck.join(", ")),
            });
        }

        for id in &ready {
            pending.remove(id.as_str());
        }
        for deps in pending.values_mut() {
            for id in &ready {
                deps.remove(id.as_str());
            }
        }
        waves.push(ready);
    }

    Ok(waves)
}
