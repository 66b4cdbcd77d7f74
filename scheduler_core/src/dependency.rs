use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::task::TaskId;

/// Parked dependency-gated tasks, indexed both ways so a completion only
/// touches the tasks that name it.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    /// parked task -> dependencies not yet COMPLETED
    waiting: HashMap<TaskId, HashSet<TaskId>>,
    /// dependency -> parked tasks naming it
    dependents: HashMap<TaskId, Vec<TaskId>>,
}

impl DependencyResolver {
    /// Park `task_id` until every id in `unmet` completes. `unmet` must be non-empty.
    pub fn park(&mut self, task_id: &str, unmet: Vec<TaskId>) {
        debug!("Task {} is waiting for {:?}", task_id, unmet);
        for dep in &unmet {
            self.dependents.entry(dep.clone()).or_default().push(task_id.to_string());
        }
        self.waiting.insert(task_id.to_string(), unmet.into_iter().collect());
    }

    /// Record a completion and return the tasks whose last dependency it was.
    pub fn on_completed(&mut self, completed_id: &str) -> Vec<TaskId> {
        let dependents = self.dependents.remove(completed_id).unwrap_or_default();
        let mut released = Vec::new();

        for dependent in dependents {
            let Some(unmet) = self.waiting.get_mut(&dependent) else {
                continue;
            };
            unmet.remove(completed_id);
            if unmet.is_empty() {
                self.waiting.remove(&dependent);
                debug!("Task {} released, all dependencies completed", dependent);
                released.push(dependent);
            } else {
                debug!("Task {} still has {} unmet dependencies", dependent, unmet.len());
            }
        }

        released
    }

    pub fn remove(&mut self, task_id: &str) -> bool {
        let Some(unmet) = self.waiting.remove(task_id) else {
            return false;
        };
        for dep in unmet {
            if let Some(list) = self.dependents.get_mut(&dep) {
                list.retain(|id| id != task_id);
                if list.is_empty() {
                    self.dependents.remove(&dep);
                }
            }
        }
        true
    }

    pub fn parked(&self) -> impl Iterator<Item = (&TaskId, &HashSet<TaskId>)> {
        self.waiting.iter()
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }
}

/// True when adding `task_id -> depends_on` would close a cycle. `edges`
/// returns the declared dependencies of an existing task.
pub fn creates_cycle<F>(task_id: &str, depends_on: &[TaskId], edges: F) -> bool
where
    F: Fn(&str) -> Vec<TaskId>,
{
    let mut stack: Vec<TaskId> = depends_on.to_vec();
    let mut seen = HashSet::new();

    while let Some(current) = stack.pop() {
        if current == task_id {
            return true;
        }
        if seen.insert(current.clone()) {
            stack.extend(edges(&current));
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<TaskId> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn releases_only_after_all_dependencies() {
        let mut resolver = DependencyResolver::default();
        resolver.park("c", ids(&["a", "b"]));

        assert!(resolver.on_completed("a").is_empty(), "b is still outstanding");
        assert_eq!(resolver.len(), 1, "c should still be parked");
        assert_eq!(resolver.on_completed("b"), ids(&["c"]));
        assert_eq!(resolver.len(), 0);
    }

    #[test]
    fn one_completion_releases_many() {
        let mut resolver = DependencyResolver::default();
        resolver.park("x", ids(&["root"]));
        resolver.park("y", ids(&["root"]));

        let mut released = resolver.on_completed("root");
        released.sort();
        assert_eq!(released, ids(&["x", "y"]));
    }

    #[test]
    fn removed_task_is_never_released() {
        let mut resolver = DependencyResolver::default();
        resolver.park("c", ids(&["a"]));

        assert!(resolver.remove("c"));
        assert!(resolver.on_completed("a").is_empty());
        assert!(!resolver.remove("c"), "already removed");
    }

    #[test]
    fn completion_of_unrelated_task_is_ignored() {
        let mut resolver = DependencyResolver::default();
        resolver.park("c", ids(&["a"]));
        assert!(resolver.on_completed("zzz").is_empty());
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn detects_cycles() {
        let graph: HashMap<&str, Vec<TaskId>> =
            HashMap::from([("a", ids(&["b"])), ("b", ids(&["new"])), ("c", vec![])]);
        let edges = |id: &str| graph.get(id).cloned().unwrap_or_default();

        assert!(creates_cycle("new", &ids(&["a"]), edges), "new -> a -> b -> new");
        assert!(creates_cycle("self", &ids(&["self"]), edges), "self dependency");
        assert!(!creates_cycle("new", &ids(&["c"]), edges));
        assert!(!creates_cycle("new", &[], edges));
    }
}
