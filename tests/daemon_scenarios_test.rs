//! End-to-end dispatch scenarios against a throwaway git repository

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{git, wait_for, Harness};
use drover::adapters::fs_lock::{lock_path_for, FileLockGuard};
use drover::adapters::{MockResponse, MockWorker};
use drover::domain::models::{
    ExecutionStatus, RecoveryConfig, RetryConfig, TaskStatus, TransitionMeta,
};
use drover::domain::ports::{BoardStore, ExecutionStore};
use drover::services::task_graph;
use drover::services::DispatchDaemon;
use tokio_util::sync::CancellationToken;

const BOARD: &str = "\
## A
- [ ] build x
- [-] test x

## B
- [ ] refactor y
";

/// Run `cycles` dispatch cycles, waiting for the jobs of each.
async fn settle(daemon: &mut DispatchDaemon, cycles: usize) {
    for _ in 0..cycles {
        daemon.run_cycle().await.unwrap();
        daemon.wait_idle().await;
    }
}

/// Execution id on the board line of `key`, read synchronously.
fn execution_of(board_path: &str, key: &str) -> Option<String> {
    let text = std::fs::read_to_string(board_path).ok()?;
    task_graph::parse(&text)
        .into_iter()
        .find_map(|g| g.find(key).cloned())
        .and_then(|t| t.execution_id)
        .map(|id| id.to_string())
}

fn state_file(harness: &Harness, name: &str) -> std::path::PathBuf {
    Path::new(&harness.config.state_dir).join(name)
}

#[tokio::test]
async fn test_group_runs_in_order_and_commits() {
    common::setup_test_logging();
    let harness = Harness::new(BOARD);
    let worker = Arc::new(MockWorker::new());
    worker
        .push_response("/implement build x", MockResponse::success("built").with_write("x.txt", "x\n"))
        .await;
    let mut daemon = harness.daemon(worker.clone());

    settle(&mut daemon, 4).await;

    for key in ["build x", "test x", "refactor y"] {
        assert_eq!(harness.task(key).await.status, TaskStatus::Done, "{key}");
    }

    // Every build x invocation precedes every test x invocation.
    let prompts: Vec<String> = worker.invocations().await.into_iter().map(|c| c.prompt).collect();
    let last_build = prompts.iter().rposition(|p| p.ends_with("build x")).unwrap();
    let first_test = prompts.iter().position(|p| p.ends_with("test x")).unwrap();
    assert!(last_build < first_test, "{prompts:?}");
    assert_eq!(worker.count_matching("/implement build x").await, 1);
    assert_eq!(worker.count_matching("/verify build x").await, 1);

    // The worker's file landed in a drover commit on the group branch.
    let build = harness.task("build x").await;
    let sha = build.result_ref.unwrap();
    let workspace = harness.worktree("a");
    assert_eq!(git(&workspace, &["log", "-1", "--format=%s", &sha]), format!(
        "drover: build x [{}]",
        build.execution_id.unwrap()
    ));
    assert!(workspace.join("x.txt").exists());
    assert!(!harness.repo.join("x.txt").exists());

    let record = harness.record_of("build x").await;
    assert_eq!(record.status, ExecutionStatus::Succeeded);
    assert_eq!(record.completed_phases, vec!["implement", "verify"]);
    assert_eq!(record.files_touched, vec!["x.txt"]);
    let checkpoints = harness.store.checkpoints(&record.execution_id).await.unwrap();
    assert_eq!(checkpoints.len(), 2);
    assert_eq!(checkpoints[1].sequence, checkpoints[0].sequence + 1);

    let stats = daemon.stats();
    assert_eq!(stats.dispatched, 3);
    assert_eq!(stats.succeeded, 3);
}

#[tokio::test]
async fn test_timeouts_are_retried_then_escalated() {
    // Default attempt and recovery budgets; only the delays are shortened.
    let harness = Harness::with_config("## B\n- [ ] refactor y\n", |config| {
        config.retry = RetryConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            ..RetryConfig::default()
        };
        config.recovery = RecoveryConfig::default();
    });
    let worker = Arc::new(MockWorker::with_default_response(MockResponse::hang(
        Duration::from_secs(30),
    )));
    let mut daemon = harness
        .daemon(worker.clone())
        .with_phase_timeout(Duration::from_millis(100));

    daemon.run_cycle().await.unwrap();
    daemon.wait_idle().await;

    let task = harness.task("refactor y").await;
    assert_eq!(task.status, TaskStatus::Failed);
    let reason = task.error.unwrap();
    assert!(reason.starts_with("implement: phase timed out"), "{reason}");

    // The first attempt plus two retries, then the task fails.
    let record = harness.record_of("refactor y").await;
    assert_eq!(record.status, ExecutionStatus::Escalated);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.retry_rounds, 0);
    assert_eq!(worker.count_matching("/implement refactor y").await, 3);

    let report = state_file(&harness, &format!("escalations/{}.json", record.execution_id));
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(report).unwrap()).unwrap();
    assert_eq!(report["failure_kind"], "retriable");

    let transcripts = state_file(&harness, &format!("transcripts/{}/implement", record.execution_id));
    for n in 1..=3 {
        assert!(transcripts.join(format!("attempt-{n}.log")).exists());
    }
    assert!(!transcripts.join("attempt-4.log").exists());
    assert_eq!(daemon.stats().escalated, 1);
}

#[tokio::test]
async fn test_fixable_failure_reruns_with_feedback() {
    let harness = Harness::new("## B\n- [ ] refactor y\n");
    let worker = Arc::new(MockWorker::new());
    for _ in 0..2 {
        worker
            .push_response("/verify refactor y", MockResponse::failure("2 tests failed in auth"))
            .await;
    }
    let mut daemon = harness.daemon(worker.clone());

    daemon.run_cycle().await.unwrap();
    daemon.wait_idle().await;

    assert_eq!(harness.task("refactor y").await.status, TaskStatus::Done);
    let record = harness.record_of("refactor y").await;
    assert_eq!(record.fix_attempts, 1);
    assert_eq!(record.errors.len(), 1);

    let verify: Vec<String> = worker
        .invocations()
        .await
        .into_iter()
        .filter(|c| c.phase == "verify")
        .map(|c| c.prompt)
        .collect();
    assert_eq!(verify.len(), 3);
    assert!(verify[2].contains("The previous attempt failed: 2 tests failed in auth"));
}

#[tokio::test]
async fn test_restart_resumes_from_last_checkpoint() {
    common::setup_test_logging();
    let harness = Harness::new("## B\n- [ ] refactor y\n");
    let board_path = harness.config.board_path.clone();
    let executions = state_file(&harness, "executions");

    let first = Arc::new(MockWorker::new());
    first
        .push_response("/verify refactor y", MockResponse::hang(Duration::from_secs(30)))
        .await;
    let mut daemon = harness.daemon(first.clone());
    let shutdown = CancellationToken::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { daemon.run(shutdown).await })
    };

    let checkpointed = wait_for(
        || {
            execution_of(&board_path, "refactor y").is_some_and(|id| {
                executions.join(format!("{id}.checkpoints.json")).exists()
            })
        },
        10_000,
    )
    .await;
    assert!(checkpointed, "implement never checkpointed");
    tokio::time::sleep(Duration::from_millis(100)).await;

    shutdown.cancel();
    let stats = handle.await.unwrap().unwrap();
    assert_eq!(stats.interrupted, 1);

    // Shutdown leaves the task owned and the record running.
    let task = harness.task("refactor y").await;
    assert_eq!(task.status, TaskStatus::InProgress);
    let record = harness.record_of("refactor y").await;
    assert_eq!(record.status, ExecutionStatus::Running);
    assert_eq!(record.completed_phases, vec!["implement"]);

    let second = Arc::new(MockWorker::new());
    let mut daemon = harness.daemon(second.clone());
    daemon.run_cycle().await.unwrap();
    daemon.wait_idle().await;

    assert_eq!(second.count_matching("/implement").await, 0);
    assert_eq!(second.count_matching("/verify refactor y").await, 1);
    let task = harness.task("refactor y").await;
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.execution_id, Some(record.execution_id.clone()));
    assert_eq!(daemon.stats().resumed, 1);
}

#[tokio::test]
async fn test_operator_cancel_stops_the_job() {
    let harness = Harness::new("## B\n- [ ] refactor y\n");
    let board_path = harness.config.board_path.clone();
    let worker = Arc::new(MockWorker::with_default_response(MockResponse::hang(
        Duration::from_secs(30),
    )));
    let mut daemon = harness.daemon(worker.clone());
    let shutdown = CancellationToken::new();
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { daemon.run(shutdown).await })
    };

    assert!(wait_for(|| execution_of(&board_path, "refactor y").is_some(), 10_000).await);
    let task = harness.task("refactor y").await;
    let id = task.execution_id.clone().unwrap();
    assert!(harness
        .board
        .transition(
            "refactor y",
            TaskStatus::Failed,
            TransitionMeta::failed(Some(id.clone()), "cancelled by operator"),
        )
        .await
        .unwrap());

    let record_path = state_file(&harness, &format!("executions/{id}.json"));
    let cancelled = wait_for(
        || {
            std::fs::read_to_string(&record_path)
                .is_ok_and(|json| json.contains("\"status\": \"cancelled\""))
        },
        10_000,
    )
    .await;
    assert!(cancelled, "job was not cancelled");

    shutdown.cancel();
    let stats = handle.await.unwrap().unwrap();
    assert_eq!(stats.cancelled, 1);
    assert_eq!(
        harness.task("refactor y").await.error.as_deref(),
        Some("cancelled by operator")
    );
}

#[tokio::test]
async fn test_second_daemon_is_refused() {
    let harness = Harness::new(BOARD);
    let daemon = harness.daemon(Arc::new(MockWorker::new()));
    let _held = daemon.lock_instance().unwrap();

    let other = harness.daemon(Arc::new(MockWorker::new()));
    assert!(other.lock_instance().is_err());
}

#[tokio::test]
async fn test_finished_record_is_applied_on_restart() {
    let harness = Harness::new("## B\n- [ ] refactor y\n");
    let mut daemon = harness.daemon(Arc::new(MockWorker::new()));
    settle(&mut daemon, 3).await;
    let record = harness.record_of("refactor y").await;

    // Simulate a crash between the record finishing and the board update.
    let text = harness.board_text();
    let line = text.lines().find(|l| l.contains("refactor y")).unwrap().to_string();
    let stuck = format!("- [~] <{}> refactor y", record.execution_id);
    std::fs::write(&harness.config.board_path, text.replace(&line, &stuck)).unwrap();

    let mut daemon = harness.daemon(Arc::new(MockWorker::new()));
    daemon.run_cycle().await.unwrap();

    let task = harness.task("refactor y").await;
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.result_ref, Some(record.result_ref()));
    assert_eq!(daemon.stats().reconciled, 1);
    assert_eq!(daemon.stats().dispatched, 0);
}

#[tokio::test]
async fn test_unreadable_record_fails_only_its_task() {
    let harness = Harness::new("## A\n- [~] <abcd1234> stuck\n\n## B\n- [ ] unrelated\n");
    let executions = state_file(&harness, "executions");
    std::fs::create_dir_all(&executions).unwrap();
    std::fs::write(executions.join("abcd1234.json"), "{ not json").unwrap();

    let mut daemon = harness.daemon(Arc::new(MockWorker::new()));
    settle(&mut daemon, 2).await;

    assert_eq!(harness.task("unrelated").await.status, TaskStatus::Done);
    let stuck = harness.task("stuck").await;
    assert_eq!(stuck.status, TaskStatus::Failed);
    assert!(stuck
        .error
        .unwrap()
        .starts_with("could not reconcile execution"));
    assert_eq!(stuck.execution_id.map(|id| id.to_string()).as_deref(), Some("abcd1234"));
}

#[tokio::test]
async fn test_contended_final_write_is_applied_next_cycle() {
    let harness = Harness::with_config("## B\n- [ ] refactor y\n", |config| {
        config.lock_timeout_ms = 150;
    });
    let mut daemon = harness.daemon(Arc::new(MockWorker::new()));
    daemon.run_cycle().await.unwrap();

    // Hold the board lock until the job has finished.
    let held = FileLockGuard::try_acquire(&lock_path_for(Path::new(&harness.config.board_path)))
        .unwrap()
        .expect("lock should be free");
    daemon.wait_idle().await;
    assert!(harness.board_text().contains("- [~] <"), "{}", harness.board_text());
    drop(held);

    let record = harness.record_of("refactor y").await;
    assert_eq!(record.status, ExecutionStatus::Succeeded);

    daemon.run_cycle().await.unwrap();
    let task = harness.task("refactor y").await;
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.result_ref, Some(record.result_ref()));
    assert_eq!(daemon.stats().reconciled, 1);
    assert_eq!(daemon.stats().failed, 0);
}

#[tokio::test]
async fn test_priority_tag_does_not_reorder_dispatch() {
    let harness = Harness::with_config(
        "## A\n- [ ] routine\n\n## B\n- [ ] urgent {priority:high}\n",
        |config| config.daemon.max_dispatch_per_cycle = 1,
    );
    let mut daemon = harness.daemon(Arc::new(MockWorker::new()));
    settle(&mut daemon, 1).await;

    assert_eq!(harness.task("routine").await.status, TaskStatus::Done);
    assert_eq!(harness.task("urgent").await.status, TaskStatus::Pending);

    settle(&mut daemon, 1).await;
    assert_eq!(harness.task("urgent").await.status, TaskStatus::Done);
}
