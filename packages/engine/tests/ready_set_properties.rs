//! Property tests for ready-set determinism
//!
//! Completing independent tasks in any order must leave the same ready set
//! behind, and every intermediate ready set must depend only on which tasks
//! are done.

use conductor_engine::events::Notifier;
use conductor_engine::executor::{TaskDefinition, TaskStatus, WorkflowEngine, WorkflowOptions};
use conductor_engine::utils::ids::{InstanceId, TaskId, WorkflowId};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeSet;

/// root → w0..wn → join, plus one tail per worker
fn layered(width: usize) -> Vec<TaskDefinition> {
    let mut defs = vec![TaskDefinition::new("root", "plan")];
    for i in 0..width {
        defs.push(TaskDefinition::new(format!("w{}", i), "work").depends_on(["root"]));
        defs.push(TaskDefinition::new(format!("tail{}", i), "check").depends_on([format!("w{}", i)]));
    }
    defs.push(
        TaskDefinition::new("join", "merge").depends_on((0..width).map(|i| format!("w{}", i))),
    );
    defs
}

fn run(engine: &WorkflowEngine, wf: WorkflowId, id: &str) {
    let task_id = TaskId::new(id);
    engine.assign_task(wf, &task_id, InstanceId::new()).unwrap();
    engine.begin_task(wf, &task_id).unwrap();
}

fn ready_ids(engine: &WorkflowEngine, wf: WorkflowId) -> BTreeSet<String> {
    engine
        .ready_tasks(wf)
        .unwrap()
        .into_iter()
        .map(|t| t.id.to_string())
        .collect()
}

fn expected_ready(done: &[usize], width: usize) -> BTreeSet<String> {
    let mut expected: BTreeSet<String> = done.iter().map(|i| format!("tail{}", i)).collect();
    if done.len() == width {
        expected.insert("join".to_string());
    }
    expected
}

fn completion_order() -> impl Strategy<Value = (usize, Vec<usize>)> {
    (2usize..8).prop_flat_map(|width| {
        (Just(width), Just((0..width).collect::<Vec<_>>()).prop_shuffle())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_ready_set_is_order_independent((width, order) in completion_order()) {
        let engine = WorkflowEngine::new(Notifier::new());
        let wf = engine
            .create("layered", "", layered(width), "prop", WorkflowOptions::default())
            .unwrap()
            .id;
        engine.start(wf).unwrap();

        run(&engine, wf, "root");
        engine.complete_task(wf, &TaskId::new("root"), json!(null)).unwrap();

        for i in 0..width {
            run(&engine, wf, &format!("w{}", i));
        }
        prop_assert!(ready_ids(&engine, wf).is_empty());

        let mut done = Vec::new();
        for i in order {
            engine
                .complete_task(wf, &TaskId::new(format!("w{}", i)), json!(i))
                .unwrap();
            done.push(i);
            prop_assert_eq!(ready_ids(&engine, wf), expected_ready(&done, width));
        }

        let all: Vec<usize> = (0..width).collect();
        prop_assert_eq!(ready_ids(&engine, wf), expected_ready(&all, width));
    }

    #[test]
    fn prop_completed_tasks_passed_through_assignment((width, order) in completion_order()) {
        let engine = WorkflowEngine::new(Notifier::new());
        let wf = engine
            .create("layered", "", layered(width), "prop", WorkflowOptions::default())
            .unwrap()
            .id;
        engine.start(wf).unwrap();

        // Completing a task that was never assigned always fails
        for i in order {
            let result = engine.complete_task(wf, &TaskId::new(format!("w{}", i)), json!(i));
            prop_assert!(result.is_err());
        }

        let workflow = engine.get(wf).unwrap();
        prop_assert!(workflow.tasks.iter().all(|t| t.status == TaskStatus::Waiting));
        prop_assert!(workflow.tasks.iter().all(|t| t.attempts == 0));
    }
}
