
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use clusrun::clusnode::job_label;
use clusrun::error::ClusrunError;
use clusrun::headnode::dispatch::{ReplyReceiver, EXIT_UNREACHABLE};
use clusrun::headnode::{JobSpec, JobState};
use test_harness::{assert_eventually, TestCluster};

/// Output collected from a job's reply stream
#[derive(Debug, Default)]
struct Collected {
    job_id: i32,
    nodes: Vec<String>,
    stdout: BTreeMap<String, String>,
    stderr: BTreeMap<String, String>,
    exit_codes: BTreeMap<String, i32>,
}

async fn collect(mut rx: ReplyReceiver) -> Collected {
    let mut collected = Collected::default();
    while let Some(frame) = rx.recv().await {
        let frame = frame.expect("frame should not be an error");
        if frame.node.is_empty() {
            collected.job_id = frame.job_id;
            collected.nodes = frame.nodes;
            continue;
        }
        collected
            .stdout
            .entry(frame.node.clone())
            .or_default()
            .push_str(&frame.stdout);
        collected
            .stderr
            .entry(frame.node.clone())
            .or_default()
            .push_str(&frame.stderr);
        if let Some(code) = frame.exit_code {
            assert!(
                collected.exit_codes.insert(frame.node, code).is_none(),
                "exit code should be sent once per node"
            );
        }
    }
    collected
}

fn spec(command: &str) -> JobSpec {
    JobSpec {
        command: command.to_string(),
        node_pattern: "^NODE".to_string(),
        ..Default::default()
    }
}

fn ids(v: &[i32]) -> BTreeSet<i32> {
    v.iter().copied().collect()
}

#[tokio::test]
async fn test_run_on_all_nodes_with_sweep() {
    let cluster = TestCluster::new(3).await;
    let dispatcher = &cluster.head.dispatcher;

    let mut job = spec("echo value={i}");
    job.sweep = "{i}{10-11}".to_string();
    let (created, rx) = dispatcher.start_job(job, false).unwrap();
    assert_eq!(created.state, JobState::Created);

    let out = collect(rx).await;
    assert_eq!(out.job_id, created.id);
    assert_eq!(out.nodes, cluster.worker_names());

    // Values follow the resolved node order and wrap after the end
    let expected = [10, 11, 10];
    for (node, value) in out.nodes.iter().zip(expected) {
        assert_eq!(out.stdout[node], format!("value={}\n", value));
        assert_eq!(out.exit_codes[node], 0);
    }

    let stored = &cluster.head.store().get_jobs(&ids(&[created.id])).unwrap()[0];
    assert_eq!(stored.state, JobState::Finished);
    assert!(stored.end_time.is_some());
    assert!(stored.failed_nodes.is_empty());
}

#[tokio::test]
async fn test_output_files_mirror_node_output() {
    let cluster = TestCluster::new(1).await;
    let node = cluster.workers[0].display_name();

    let (job, rx) = cluster
        .head
        .dispatcher
        .start_job(spec("echo out; echo err >&2"), false)
        .unwrap();
    collect(rx).await;

    let (stdout, stderr) = cluster.head.store().output_files(job.id, &node);
    assert_eq!(std::fs::read_to_string(stdout).unwrap(), "out\n");
    assert_eq!(std::fs::read_to_string(stderr).unwrap(), "err\n");

    let (job, rx) = cluster
        .head
        .dispatcher
        .start_job(spec("echo only-out"), false)
        .unwrap();
    collect(rx).await;

    let (stdout, stderr) = cluster.head.store().output_files(job.id, &node);
    assert!(stdout.exists());
    assert!(!stderr.exists(), "empty stderr file should be removed");
}

#[tokio::test]
async fn test_unreachable_node_fails_job() {
    let cluster = TestCluster::new(3).await;
    let down = cluster.workers[2].display_name();
    cluster.workers[2].stop();

    let (job, rx) = cluster
        .head
        .dispatcher
        .start_job(spec("for i in 1 2 3; do echo $i; done"), false)
        .unwrap();
    let out = collect(rx).await;

    assert_eq!(out.exit_codes[&down], EXIT_UNREACHABLE);
    for worker in &cluster.workers[..2] {
        let node = worker.display_name();
        assert_eq!(out.stdout[&node], "1\n2\n3\n");
        assert_eq!(out.exit_codes[&node], 0);
    }

    let stored = &cluster.head.store().get_jobs(&ids(&[job.id])).unwrap()[0];
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(
        stored.failed_nodes,
        BTreeMap::from([(down, EXIT_UNREACHABLE)])
    );
}

#[tokio::test]
async fn test_non_zero_exit_is_recorded() {
    let cluster = TestCluster::new(2).await;
    let target = cluster.workers[1].display_name();

    let mut job = spec("exit 3");
    job.specified_nodes = vec![target.to_lowercase()];
    let (created, rx) = cluster.head.dispatcher.start_job(job, false).unwrap();
    let out = collect(rx).await;

    assert_eq!(out.nodes, vec![target.clone()]);
    let stored = &cluster.head.store().get_jobs(&ids(&[created.id])).unwrap()[0];
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.failed_nodes, BTreeMap::from([(target, 3)]));
}

#[tokio::test]
async fn test_explicit_nodes_resolve_by_host() {
    let cluster = TestCluster::new(2).await;

    let mut job = spec("echo hi");
    job.node_pattern = String::new();
    job.specified_nodes = vec![
        cluster.workers[0].host.clone(),
        cluster.workers[0].display_name(),
    ];
    let (created, rx) = cluster.head.dispatcher.start_job(job, false).unwrap();
    collect(rx).await;

    assert_eq!(created.nodes, vec![cluster.workers[0].display_name()]);
}

#[tokio::test]
async fn test_rejected_submissions_create_no_job() {
    let cluster = TestCluster::new(1).await;
    let dispatcher = &cluster.head.dispatcher;

    let mut job = spec("echo hi");
    job.specified_nodes = vec!["ghost1".to_string(), cluster.workers[0].display_name(), "ghost2".to_string()];
    match dispatcher.start_job(job, false) {
        Err(ClusrunError::InvalidNodes(invalid)) => {
            assert_eq!(invalid, vec!["ghost1".to_string(), "ghost2".to_string()]);
        }
        other => panic!("expected invalid nodes, got {:?}", other.map(|(j, _)| j.id)),
    }

    let mut job = spec("echo hi");
    job.node_pattern = "^NOPE".to_string();
    assert!(matches!(
        dispatcher.start_job(job, false),
        Err(ClusrunError::NoValidNodes)
    ));

    let mut job = spec("echo hi");
    job.sweep = "x{1-3}".to_string();
    assert!(matches!(
        dispatcher.start_job(job, false),
        Err(ClusrunError::InvalidArgument(_))
    ));

    let mut job = spec("echo hi");
    job.sweep = "literal".to_string();
    assert!(matches!(
        dispatcher.start_job(job, false),
        Err(ClusrunError::InvalidArgument(_))
    ));

    assert!(cluster.head.store().jobs().unwrap().is_empty());
}

#[tokio::test]
async fn test_group_scoped_dispatch() {
    let cluster = TestCluster::new(3).await;
    let names = cluster.worker_names();
    cluster
        .head
        .groups
        .set(&["gpu".to_string()], &names[..2], false)
        .unwrap();
    cluster
        .head
        .groups
        .set(&["big".to_string()], &names[1..], false)
        .unwrap();

    let groups = vec!["gpu".to_string(), "big".to_string()];

    let mut job = spec("true");
    job.node_groups = groups.clone();
    let (union, rx) = cluster.head.dispatcher.start_job(job, false).unwrap();
    collect(rx).await;
    assert_eq!(union.nodes, names);

    let mut job = spec("true");
    job.node_groups = groups;
    let (intersection, rx) = cluster.head.dispatcher.start_job(job, true).unwrap();
    collect(rx).await;
    assert_eq!(intersection.nodes, vec![names[1].clone()]);
}

#[tokio::test]
async fn test_cancel_running_job() {
    let cluster = TestCluster::new(2).await;
    let dispatcher = &cluster.head.dispatcher;

    let (job, rx) = dispatcher
        .start_job(spec("echo started; sleep 30"), false)
        .unwrap();
    let label = job_label(&cluster.head.host, job.id);
    assert_eventually(
        || async { cluster.workers.iter().all(|w| w.executor.is_running(&label)) },
        Duration::from_secs(5),
        "job should be running on every worker",
    )
    .await;

    let result = dispatcher.cancel_jobs(&ids(&[-1])).await.unwrap();
    assert_eq!(result, BTreeMap::from([(job.id, JobState::Canceled)]));

    let out = tokio::time::timeout(Duration::from_secs(5), collect(rx))
        .await
        .expect("killed jobs should end promptly");
    for node in &out.nodes {
        assert_ne!(out.exit_codes[node], 0);
    }

    // Completion racing with cancel does not overwrite the cancel result
    let stored = &cluster.head.store().get_jobs(&ids(&[job.id])).unwrap()[0];
    assert_eq!(stored.state, JobState::Canceled);

    let again = dispatcher.cancel_jobs(&ids(&[job.id])).await.unwrap();
    assert!(again.is_empty(), "inactive jobs are not cancelled again");
}

#[tokio::test]
async fn test_cancel_with_unreachable_node_fails() {
    let cluster = TestCluster::new(2).await;
    let dispatcher = &cluster.head.dispatcher;
    let down = cluster.workers[1].display_name();

    let (job, rx) = dispatcher.start_job(spec("sleep 30"), false).unwrap();
    let label = job_label(&cluster.head.host, job.id);
    assert_eventually(
        || async { cluster.workers.iter().all(|w| w.executor.is_running(&label)) },
        Duration::from_secs(5),
        "job should be running on every worker",
    )
    .await;

    cluster.workers[1].stop();
    let result = dispatcher.cancel_jobs(&ids(&[0])).await.unwrap();
    assert_eq!(result, BTreeMap::from([(job.id, JobState::CancelFailed)]));

    let stored = &cluster.head.store().get_jobs(&ids(&[job.id])).unwrap()[0];
    assert_eq!(stored.cancel_failed_nodes, vec![down]);
    drop(rx);
}

#[tokio::test]
async fn test_multi_word_command_line() {
    let cluster = TestCluster::new(2).await;
    let words: Vec<String> = ["echo", "hello", "world"].iter().map(|w| w.to_string()).collect();

    let job = spec("").with_command_line(words.clone(), None);
    assert_eq!(job.command, "echo hello world");
    assert!(job.arguments.is_empty());
    let (created, rx) = cluster.head.dispatcher.start_job(job, false).unwrap();
    let out = collect(rx).await;
    for node in &out.nodes {
        assert_eq!(out.stdout[node], "hello world\n");
    }
    let stored = &cluster.head.store().get_jobs(&ids(&[created.id])).unwrap()[0];
    assert_eq!(stored.command, "echo hello world");

    // Script contents run with the words as positional arguments
    let job = spec("").with_command_line(words, Some("echo \"$#:$2 $3\"\n".to_string()));
    let (_, rx) = cluster.head.dispatcher.start_job(job, false).unwrap();
    let out = collect(rx).await;
    assert_eq!(out.nodes.len(), 2);
    for node in &out.nodes {
        assert_eq!(out.stdout[node], "3:hello world\n");
        assert_eq!(out.exit_codes[node], 0);
    }
}

#[tokio::test]
async fn test_job_completes_after_submitter_disconnects() {
    let cluster = TestCluster::new(1).await;
    let node = cluster.workers[0].display_name();

    let (job, mut rx) = cluster
        .head
        .dispatcher
        .start_job(spec("echo first; sleep 1; seq 1 2000"), false)
        .unwrap();
    let header = rx.recv().await.unwrap().unwrap();
    assert_eq!(header.job_id, job.id);
    drop(rx);

    let store = cluster.head.store();
    assert_eventually(
        || async { store.get_jobs(&ids(&[job.id])).unwrap()[0].state == JobState::Finished },
        Duration::from_secs(10),
        "job should finish without a submitter",
    )
    .await;

    let (stdout, _) = store.output_files(job.id, &node);
    let expected: String = std::iter::once("first".to_string())
        .chain((1..=2000).map(|i| i.to_string()))
        .map(|line| line + "\n")
        .collect();
    assert_eq!(std::fs::read_to_string(stdout).unwrap(), expected);
}
