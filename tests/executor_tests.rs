use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use clusrun::clusnode::executor::EXIT_START_FAILED;
use clusrun::clusnode::{JobExecutor, Output};

/// Create a test executor with its own scratch directory
fn test_executor() -> (JobExecutor, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    (JobExecutor::new(dir.path().join("command")), dir)
}

#[derive(Debug, Default)]
struct Captured {
    stdout: String,
    stderr: String,
    exit_frames: Vec<i32>,
    exit_code: i32,
}

async fn run(executor: &JobExecutor, label: &str, command: &str, args: &[&str]) -> Captured {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    let (tx, mut rx) = mpsc::channel(8);

    let drain = async {
        let mut captured = Captured::default();
        while let Some(frame) = rx.recv().await {
            match frame {
                Output::Stdout(s) => captured.stdout.push_str(&s),
                Output::Stderr(s) => captured.stderr.push_str(&s),
                Output::Exit(code) => captured.exit_frames.push(code),
            }
        }
        captured
    };
    let (exit_code, mut captured) = tokio::join!(executor.execute(label, command, &args, tx), drain);
    captured.exit_code = exit_code;
    captured
}

#[tokio::test]
async fn test_execute_simple_command() {
    let (executor, _dir) = test_executor();

    let result = run(&executor, "HEAD.50505.1", "echo hello", &[]).await;

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "hello\n");
    assert!(result.stderr.is_empty());
    assert_eq!(result.exit_frames, vec![0], "exit frame should be sent once and last");
}

#[tokio::test]
async fn test_execute_separates_stderr() {
    let (executor, _dir) = test_executor();

    let result = run(&executor, "HEAD.50505.2", "echo out; echo 'error message' >&2; exit 4", &[]).await;

    assert_eq!(result.exit_code, 4);
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "error message\n");
    assert_eq!(result.exit_frames, vec![4]);
}

#[tokio::test]
async fn test_execute_large_output() {
    let (executor, _dir) = test_executor();

    let result = run(&executor, "HEAD.50505.3", "seq 1 5000", &[]).await;

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout.lines().count(), 5000);
    assert_eq!(result.stdout.lines().last(), Some("5000"));
}

#[tokio::test]
async fn test_execute_keeps_characters_split_across_reads() {
    let (executor, _dir) = test_executor();

    let command = "s=$(printf '%*s' 1023 '' | tr ' ' a); printf '%s\u{e9}\n' \"$s\"";
    let result = run(&executor, "HEAD.50505.11", command, &[]).await;

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, format!("{}\u{e9}\n", "a".repeat(1023)));
    assert!(!result.stdout.contains('\u{fffd}'));
}

#[tokio::test]
async fn test_execute_passes_arguments() {
    let (executor, _dir) = test_executor();

    let result = run(&executor, "HEAD.50505.4", "echo \"$#:$1:$2\"", &["a b", "c"]).await;

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "2:a b:c\n");
}

#[tokio::test]
async fn test_execute_multiline_script() {
    let (executor, _dir) = test_executor();

    let script = "for i in 1 2 3\ndo\n  echo line$i\ndone\n";
    let result = run(&executor, "HEAD.50505.5", script, &[]).await;

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "line1\nline2\nline3\n");
}

#[tokio::test]
async fn test_execute_invalid_command() {
    let (executor, _dir) = test_executor();

    let result = run(&executor, "HEAD.50505.6", "nonexistent_command_12345", &[]).await;

    assert_eq!(result.exit_code, 127);
    assert!(!result.stderr.is_empty());
}

#[tokio::test]
async fn test_unwritable_scratch_dir_fails_start() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, "").unwrap();
    let executor = JobExecutor::new(blocker.join("command"));

    let result = run(&executor, "HEAD.50505.7", "echo never", &[]).await;

    assert_eq!(result.exit_code, EXIT_START_FAILED);
    assert!(result.stdout.is_empty());
    assert!(result.stderr.contains("Failed to write command file"));
}

#[tokio::test]
async fn test_script_file_removed_after_exit() {
    let (executor, dir) = test_executor();

    let result = run(&executor, "HEAD.50505.8", "true", &[]).await;

    assert_eq!(result.exit_code, 0);
    assert!(!dir.path().join("command").join("HEAD.50505.8.sh").exists());
    assert!(!executor.is_running("HEAD.50505.8"));
}

#[tokio::test]
async fn test_cancel_kills_process_group() {
    let (executor, _dir) = test_executor();
    let label = "HEAD.50505.9";
    let (tx, mut rx) = mpsc::channel(8);

    let task = {
        let executor = executor.clone();
        tokio::spawn(async move {
            // The child keeps the pipe open, so only a group kill ends the job
            executor
                .execute(label, "sleep 60 & echo started; wait", &[], tx)
                .await
        })
    };

    assert_eq!(rx.recv().await, Some(Output::Stdout("started\n".to_string())));
    assert!(executor.is_running(label));

    executor.cancel(label).unwrap();
    let exit_code = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("cancelled job should end promptly")
        .unwrap();

    assert_ne!(exit_code, 0);
    assert_eq!(rx.recv().await, Some(Output::Exit(exit_code)));
    assert!(!executor.is_running(label));
}

#[tokio::test]
async fn test_cancel_unknown_label_is_noop() {
    let (executor, _dir) = test_executor();
    assert!(executor.cancel("HEAD.50505.404").is_ok());
}

#[tokio::test]
async fn test_execution_continues_after_receiver_dropped() {
    let (executor, dir) = test_executor();
    let marker = dir.path().join("marker");
    let (tx, rx) = mpsc::channel(1);
    drop(rx);

    let command = format!("seq 1 10000; touch {}", marker.display());
    let exit_code = tokio::time::timeout(
        Duration::from_secs(10),
        executor.execute("HEAD.50505.10", &command, &[], tx),
    )
    .await
    .expect("job should not block on a closed stream");

    assert_eq!(exit_code, 0);
    assert!(marker.exists());
}
