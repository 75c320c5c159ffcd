use std::time::Duration;

use tokio_util::sync::CancellationToken;

use gaffer::backend::MockChannel;
use gaffer::config::ExecutorConfig;
use gaffer::executor::CheckpointExecutor;
use gaffer::task::{Checkpoint, CheckpointState, Task, TaskStatus};
use gaffer::verify::CommandVerifier;
use gaffer::GafferError;

fn executor(checkpoint_retry_limit: u32, resolver_retry_limit: u32) -> CheckpointExecutor {
    let config = ExecutorConfig {
        checkpoint_retry_limit,
        resolver_retry_limit,
        retry_delay_ms: 1,
        test_timeout_ms: 1000,
        execute_timeout_ms: 1000,
    };
    CheckpointExecutor::new(config, CommandVerifier::new().with_settle(Duration::from_millis(1)))
}

fn checkpoint(name: &str) -> Checkpoint {
    Checkpoint::new(name, format!("{} objective", name))
        .with_instructions("do the work")
        .with_pass_criteria(vec!["the work is done".to_string()])
}

#[tokio::test]
async fn test_checkpoint_passes_on_first_attempt() {
    let channel = MockChannel::new();
    channel.push_response("created the files");
    channel.push_response("TEST_PASS: all files exist");

    let mut task = Task::new("demo", "demo objective").with_checkpoints(vec![checkpoint("setup")]);
    let report = executor(3, 5)
        .execute_all(&channel, &mut task, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.success);
    assert_eq!(report.passed, 1);
    assert_eq!(task.status, TaskStatus::Completed);

    let cp = &task.checkpoints[0];
    assert_eq!(cp.state, CheckpointState::Passed);
    assert_eq!(cp.attempts, 1);
    assert!(!cp.escalated);
}

#[tokio::test]
async fn test_resolver_recovers_after_retry_budget_spent() {
    let channel = MockChannel::new();
    // Two tier-one attempts, both failing the verification.
    channel.push_response("tried something");
    channel.push_response("TEST_FAIL: config.toml missing");
    channel.push_response("tried again");
    channel.push_response("TEST_FAIL: config.toml still missing");
    // Resolver attempt fixes it.
    channel.push_response("found the root cause, created config.toml");
    channel.push_response("TEST_PASS: config.toml present");

    let mut task = Task::new("demo", "demo objective").with_checkpoints(vec![checkpoint("config")]);
    let report = executor(2, 3)
        .execute_all(&channel, &mut task, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.success);
    let cp = &task.checkpoints[0];
    assert_eq!(cp.state, CheckpointState::Passed);
    assert!(cp.escalated);
    assert_eq!(cp.attempts, 3);

    // The resolver prompt carried the failure history to the agent.
    let sent = channel.sent().join("\n");
    assert!(sent.contains("config.toml missing"));
    assert!(sent.contains("failed 2 times"));
}

#[tokio::test]
async fn test_blocking_checkpoint_aborts_remaining() {
    let channel = MockChannel::new();
    // Empty script: every settle wait times out, so nothing ever passes.

    let mut task = Task::new("demo", "demo objective").with_checkpoints(vec![
        checkpoint("first"),
        checkpoint("second"),
        checkpoint("third"),
    ]);
    let report = executor(2, 2)
        .execute_all(&channel, &mut task, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.success);
    assert_eq!(report.blocked, 1);
    assert_eq!(task.status, TaskStatus::Blocked);

    assert_eq!(task.checkpoints[0].state, CheckpointState::Blocked);
    assert_eq!(task.checkpoints[1].state, CheckpointState::Pending);
    assert_eq!(task.checkpoints[2].state, CheckpointState::Pending);
}

#[tokio::test]
async fn test_non_blocking_blocked_checkpoint_continues() {
    let channel = MockChannel::new();
    // First checkpoint fails every attempt, including both resolver passes.
    for _ in 0..2 {
        channel.push_response("work output");
        channel.push_response("TEST_FAIL: nope");
    }
    for _ in 0..2 {
        channel.push_response("resolver output");
        channel.push_response("TEST_FAIL: still nope");
    }
    // Second checkpoint passes.
    channel.push_response("done");
    channel.push_response("TEST_PASS: verified");

    let mut task = Task::new("demo", "demo objective").with_checkpoints(vec![
        checkpoint("optional").non_blocking(),
        checkpoint("main"),
    ]);
    let report = executor(2, 2)
        .execute_all(&channel, &mut task, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.success);
    assert_eq!(report.passed, 1);
    assert_eq!(report.blocked, 1);
    assert_eq!(task.checkpoints[0].state, CheckpointState::Blocked);
    assert_eq!(task.checkpoints[1].state, CheckpointState::Passed);
}

#[tokio::test]
async fn test_missing_verdict_fails_closed() {
    let channel = MockChannel::new();
    channel.push_response("did the work");
    channel.push_response("Everything looks great, we're done here!");
    channel.push_response("resolver pass");
    channel.push_response("I am confident this is complete.");

    let mut task = Task::new("demo", "demo objective").with_checkpoints(vec![checkpoint("vague")]);
    executor(1, 1)
        .execute_all(&channel, &mut task, &CancellationToken::new())
        .await
        .unwrap();

    let cp = &task.checkpoints[0];
    assert_eq!(cp.state, CheckpointState::Blocked);
    assert!(cp
        .test_results
        .iter()
        .any(|r| r.message.contains("defaulting to FAIL")));
}

#[tokio::test]
async fn test_cancelled_run_returns_error() {
    let channel = MockChannel::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut task = Task::new("demo", "demo objective").with_checkpoints(vec![checkpoint("setup")]);
    let err = executor(3, 5)
        .execute_all(&channel, &mut task, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, GafferError::Cancelled(_)));
}

#[tokio::test]
async fn test_dead_session_dispatch_counts_as_failed_attempt() {
    let channel = MockChannel::new();
    channel.set_alive(false);

    let mut task = Task::new("demo", "demo objective").with_checkpoints(vec![checkpoint("setup")]);
    executor(1, 1)
        .execute_all(&channel, &mut task, &CancellationToken::new())
        .await
        .unwrap();

    let cp = &task.checkpoints[0];
    assert_eq!(cp.state, CheckpointState::Blocked);
    assert!(cp
        .test_results
        .iter()
        .any(|r| r.message.contains("dispatch not confirmed")));
}
