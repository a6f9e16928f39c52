//! Race-safety of the claim and propagation paths under real threads.

use atelier_blackboard::Blackboard;
use atelier_core::{EventBus, TaskStatus};
use atelier_store::Db;
use serde_json::json;
use std::thread;

fn board() -> Blackboard {
    Blackboard::new(Db::open_in_memory().unwrap(), EventBus::default())
}

#[test]
fn claim_has_exactly_one_winner() {
    let board = board();
    let main = board.create_main_task("root", "root", "u1", json!({})).unwrap();
    let task_id = board
        .create_subtask(main.id, "contended", "contended", "generator", vec![], json!({}))
        .unwrap()
        .id;

    let winners: usize = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let board = board.clone();
                let agent = format!("generator-{i}");
                scope.spawn(move || board.claim_task(task_id, &agent).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).filter(|&won| won).count()
    });

    assert_eq!(winners, 1);
    let task = board.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
}

#[test]
fn propagation_is_deterministic_under_concurrent_completions() {
    let board = board();
    let main = board.create_main_task("root", "root", "u1", json!({})).unwrap();
    let subtasks: Vec<i64> = (0..6)
        .map(|i| {
            board
                .create_subtask(main.id, &format!("s{i}"), "s", "worker", vec![], json!({}))
                .unwrap()
                .id
        })
        .collect();

    thread::scope(|scope| {
        for &id in &subtasks {
            let board = board.clone();
            scope.spawn(move || {
                board.claim_task(id, "worker").unwrap();
                board.complete_task(id, "worker", json!({"id": id})).unwrap();
            });
        }
    });

    // Regardless of completion order, the parent observed every child.
    let main = board.get_task(main.id).unwrap().unwrap();
    assert_eq!(main.status, TaskStatus::Completed);
    let result = main.result.unwrap();
    assert_eq!(result["subtask_count"], json!(6));
}

#[test]
fn one_failure_fails_the_parent_regardless_of_order() {
    let board = board();
    let main = board.create_main_task("root", "root", "u1", json!({})).unwrap();
    let ok: Vec<i64> = (0..4)
        .map(|i| {
            board
                .create_subtask(main.id, &format!("ok{i}"), "s", "worker", vec![], json!({}))
                .unwrap()
                .id
        })
        .collect();
    let bad = board
        .create_subtask(main.id, "bad", "s", "worker", vec![], json!({}))
        .unwrap();

    thread::scope(|scope| {
        for &id in &ok {
            let board = board.clone();
            scope.spawn(move || {
                board.complete_task(id, "worker", json!({})).unwrap();
            });
        }
        let board = board.clone();
        let bad_id = bad.id;
        scope.spawn(move || {
            board.fail_task(bad_id, "worker", "gate rejected").unwrap();
        });
    });

    let main = board.get_task(main.id).unwrap().unwrap();
    assert_eq!(main.status, TaskStatus::Failed);
}
