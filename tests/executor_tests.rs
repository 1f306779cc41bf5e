use std::time::Duration;

use queuectl::worker::{CommandExecutor, ExecOutcome, FailureReason};

fn test_executor() -> CommandExecutor {
    CommandExecutor::new(Duration::from_secs(10))
}

#[tokio::test]
async fn simple_command_succeeds_with_trimmed_stdout() {
    let result = test_executor().execute("echo hello").await;

    assert!(result.succeeded());
    assert_eq!(result.stdout, "hello");
    assert!(result.stderr.is_empty());
}

#[tokio::test]
async fn command_with_empty_output_succeeds() {
    let result = test_executor().execute("true").await;

    assert!(result.succeeded());
    assert!(result.stdout.is_empty());
    assert!(result.stderr.is_empty());
}

#[tokio::test]
async fn large_output_is_captured_in_full() {
    let result = test_executor().execute("seq 1 1000").await;

    assert!(result.succeeded());
    assert_eq!(result.stdout.lines().count(), 1000);
}

#[tokio::test]
async fn stderr_is_captured_even_on_success() {
    let result = test_executor().execute("echo warn >&2").await;

    assert!(result.succeeded());
    assert_eq!(result.stderr, "warn");
}

#[tokio::test]
async fn non_zero_exit_is_a_failure_with_its_code() {
    let result = test_executor().execute("exit 3").await;

    assert_eq!(
        result.outcome,
        ExecOutcome::Failure(FailureReason::NonZeroExit(3))
    );
}

#[tokio::test]
async fn failure_captures_both_streams() {
    let result = test_executor()
        .execute("echo out; echo err >&2; exit 1")
        .await;

    assert_eq!(
        result.outcome,
        ExecOutcome::Failure(FailureReason::NonZeroExit(1))
    );
    assert_eq!(result.stdout, "out");
    assert_eq!(result.stderr, "err");
}

#[tokio::test]
async fn unknown_command_fails_with_shell_exit_code() {
    let result = test_executor()
        .execute("definitely-not-a-real-command-xyz")
        .await;

    // sh reports "command not found" as exit 127 on stderr.
    assert_eq!(
        result.outcome,
        ExecOutcome::Failure(FailureReason::NonZeroExit(127))
    );
    assert!(!result.stderr.is_empty());
}

#[tokio::test]
async fn slow_command_times_out() {
    let executor = CommandExecutor::new(Duration::from_millis(200));
    let result = executor.execute("sleep 5").await;

    assert_eq!(result.outcome, ExecOutcome::Failure(FailureReason::TimedOut));
}
