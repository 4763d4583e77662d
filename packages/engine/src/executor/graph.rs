// packages/engine/src/executor/graph.rs
//! Task dependency graph
//!
//! Validation runs once at workflow creation. After that the ready set is a
//! pure function of task statuses and the satisfied-id set, so applying the
//! same completions in any order yields the same ready set.

use crate::executor::workflow::{Task, TaskDefinition, TaskStatus};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::TaskId;
use std::collections::{HashMap, HashSet, VecDeque};

/// Check a task graph and return a topological order
///
/// Rejects empty graphs, duplicate ids, self-dependencies, dependencies on
/// unknown ids and cycles.
pub fn validate(defs: &[TaskDefinition]) -> Result<Vec<TaskId>> {
    if defs.is_empty() {
        return Err(EngineError::Validation(
            "workflow must contain at least one task".to_string(),
        ));
    }

    let mut index: HashMap<&TaskId, usize> = HashMap::with_capacity(defs.len());
    for (i, def) in defs.iter().enumerate() {
        if index.insert(&def.id, i).is_some() {
            return Err(EngineError::Validation(format!("duplicate task id '{}'", def.id)));
        }
    }

    let mut in_degree = vec![0usize; defs.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); defs.len()];

    for (i, def) in defs.iter().enumerate() {
        let mut seen = HashSet::new();
        for dep in &def.dependencies {
            if dep == &def.id {
                return Err(EngineError::Validation(format!(
                    "task '{}' depends on itself",
                    def.id
                )));
            }
            let Some(&j) = index.get(dep) else {
                return Err(EngineError::Validation(format!(
                    "task '{}' depends on unknown task '{}'",
                    def.id, dep
                )));
            };
            // Repeated edges count once
            if seen.insert(j) {
                in_degree[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    // Kahn
    let mut queue: VecDeque<usize> = (0..defs.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(defs.len());
    while let Some(i) = queue.pop_front() {
        order.push(defs[i].id.clone());
        for &k in &dependents[i] {
            in_degree[k] -= 1;
            if in_degree[k] == 0 {
                queue.push_back(k);
            }
        }
    }

    if order.len() != defs.len() {
        let mut cyclic: Vec<&str> = defs
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, d)| d.id.as_str())
            .collect();
        cyclic.sort_unstable();
        return Err(EngineError::Validation(format!(
            "dependency cycle among tasks: {}",
            cyclic.join(", ")
        )));
    }

    Ok(order)
}

/// Waiting tasks whose dependencies are all satisfied
///
/// Ordered by priority (highest first), then declaration order.
pub fn compute_ready<'a>(tasks: &'a [Task], satisfied: &HashSet<TaskId>) -> Vec<&'a Task> {
    let mut ready: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Waiting)
        .filter(|t| t.dependencies.iter().all(|d| satisfied.contains(d)))
        .collect();
    ready.sort_by(|a, b| b.priority.cmp(&a.priority));
    ready
}

/// Every task that transitively depends on `root`, in declaration order
pub fn transitive_dependents(tasks: &[Task], root: &TaskId) -> Vec<TaskId> {
    let mut reached: HashSet<&TaskId> = HashSet::new();
    let mut frontier = vec![root];

    while let Some(current) = frontier.pop() {
        for task in tasks {
            if task.dependencies.contains(current) && reached.insert(&task.id) {
                frontier.push(&task.id);
            }
        }
    }

    tasks
        .iter()
        .filter(|t| reached.contains(&t.id))
        .map(|t| t.id.clone())
        .collect()
}

/// First Completed task found with a dependency outside the satisfied set
pub fn find_unmet_completion(
    tasks: &[Task],
    satisfied: &HashSet<TaskId>,
) -> Option<(TaskId, TaskId)> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .find_map(|t| {
            t.dependencies
                .iter()
                .find(|d| !satisfied.contains(*d))
                .map(|d| (t.id.clone(), d.clone()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str, deps: &[&str]) -> TaskDefinition {
        TaskDefinition::new(id, "cap").depends_on(deps.iter().copied())
    }

    fn tasks(defs: Vec<TaskDefinition>) -> Vec<Task> {
        defs.into_iter().map(Task::from).collect()
    }

    fn ids(ready: &[&Task]) -> Vec<String> {
        ready.iter().map(|t| t.id.to_string()).collect()
    }

    #[test]
    fn test_topological_order() {
        let order = validate(&[def("c", &["b"]), def("b", &["a"]), def("a", &[])]).unwrap();
        let order: Vec<&str> = order.iter().map(|t| t.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_rejects_invalid_graphs() {
        assert!(validate(&[]).is_err());
        assert!(validate(&[def("a", &[]), def("a", &[])]).is_err());
        assert!(validate(&[def("a", &["a"])]).is_err());
        assert!(validate(&[def("a", &["ghost"])]).is_err());

        let err = validate(&[def("a", &["b"]), def("b", &["a"]), def("c", &[])]).unwrap_err();
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn test_duplicate_edges_count_once() {
        assert!(validate(&[def("a", &[]), def("b", &["a", "a"])]).is_ok());
    }

    #[test]
    fn test_ready_set_follows_satisfied_ids() {
        let tasks = tasks(vec![def("t1", &[]), def("t2", &["t1"]), def("t3", &["t1"])]);

        assert_eq!(ids(&compute_ready(&tasks, &HashSet::new())), vec!["t1"]);

        let satisfied: HashSet<TaskId> = [TaskId::new("t1")].into_iter().collect();
        let mut tasks = tasks;
        tasks[0].status = TaskStatus::Completed;
        assert_eq!(ids(&compute_ready(&tasks, &satisfied)), vec!["t2", "t3"]);
    }

    #[test]
    fn test_ready_set_orders_by_priority() {
        let tasks = tasks(vec![
            def("low", &[]),
            def("high", &[]).with_priority(5),
            def("mid", &[]).with_priority(1),
        ]);
        assert_eq!(ids(&compute_ready(&tasks, &HashSet::new())), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_transitive_dependents() {
        let tasks = tasks(vec![
            def("a", &[]),
            def("b", &["a"]),
            def("c", &["b"]),
            def("d", &[]),
        ]);
        let dependents = transitive_dependents(&tasks, &TaskId::new("a"));
        assert_eq!(dependents, vec![TaskId::new("b"), TaskId::new("c")]);
    }

    #[test]
    fn test_find_unmet_completion() {
        let mut tasks = tasks(vec![def("a", &[]), def("b", &["a"])]);
        tasks[1].status = TaskStatus::Completed;

        let unmet = find_unmet_completion(&tasks, &HashSet::new());
        assert_eq!(unmet, Some((TaskId::new("b"), TaskId::new("a"))));
    }
}
