
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use clusrun::config::Settings;
use clusrun::error::{ClusrunError, Result};
use clusrun::headnode::liveness::{IdentityProbe, NodeQuery, SPOOF_PINNED, VALIDATED};
use clusrun::headnode::{NodeGroups, NodeLiveness, NodeState};
use test_harness::{assert_eventually, ManualClock};

/// Probe answering from a fixed host -> name table; unknown hosts are unreachable
#[derive(Default)]
struct FakeProbe {
    names: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
    held: AtomicBool,
    release: Notify,
}

impl FakeProbe {
    fn answer(&self, host: &str, name: &str) {
        self.names.lock().insert(host.to_string(), name.to_string());
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make the next probe wait until [`FakeProbe::unhold`]
    fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    fn unhold(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }
}

#[tonic::async_trait]
impl IdentityProbe for FakeProbe {
    async fn probe(&self, host: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.held.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        self.names
            .lock()
            .get(host)
            .cloned()
            .ok_or_else(|| ClusrunError::Internal(format!("{} unreachable", host)))
    }
}

struct Fixture {
    liveness: Arc<NodeLiveness>,
    probe: Arc<FakeProbe>,
    clock: Arc<ManualClock>,
}

fn fixture() -> Fixture {
    let probe = Arc::new(FakeProbe::default());
    let clock = ManualClock::new();
    let liveness = Arc::new(NodeLiveness::new(
        "HEAD",
        Arc::new(Settings::default()),
        probe.clone(),
        clock.clone(),
        CancellationToken::new(),
    ));
    Fixture {
        liveness,
        probe,
        clock,
    }
}

async fn wait_counter(liveness: &NodeLiveness, name: &str, expected: i32) {
    assert_eventually(
        || async { liveness.validation_counter(name) == Some(expected) },
        Duration::from_secs(5),
        &format!("validation counter of {} should become {}", name, expected),
    )
    .await;
}

#[tokio::test]
async fn test_validated_node_becomes_ready() {
    let f = fixture();
    f.probe.answer("NODE1:50505", "node1");

    let name = f.liveness.record_heartbeat("node1", "node1").unwrap();
    assert_eq!(name, "NODE1");
    wait_counter(&f.liveness, &name, VALIDATED).await;

    assert_eq!(f.liveness.state_of(&name), Some(NodeState::Ready));
    assert_eq!(f.liveness.ready_nodes(), vec![name.clone()]);

    // Heartbeats from a validated node do not probe again
    f.liveness.record_heartbeat("node1", "node1").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.probe.calls(), 1);
}

#[tokio::test]
async fn test_non_default_host_is_part_of_display_name() {
    let f = fixture();
    f.probe.answer("10.0.0.5:6000", "NODE2");

    let name = f.liveness.record_heartbeat("node2", "10.0.0.5:6000").unwrap();
    assert_eq!(name, "NODE2(10.0.0.5:6000)");
    wait_counter(&f.liveness, &name, VALIDATED).await;
}

#[tokio::test]
async fn test_localhost_resolves_to_headnode_name() {
    let f = fixture();
    f.probe.answer("HEAD:50505", "HEAD");

    let name = f.liveness.record_heartbeat("head", "localhost").unwrap();
    assert_eq!(name, "HEAD");
    wait_counter(&f.liveness, &name, VALIDATED).await;
}

#[tokio::test]
async fn test_spoofed_identity_is_pinned() {
    let f = fixture();
    // The host answers with its real name, not the claimed one
    f.probe.answer("NODE1:50505", "NODE9");

    let name = f.liveness.record_heartbeat("node1", "node1").unwrap();
    wait_counter(&f.liveness, &name, SPOOF_PINNED).await;
    assert_eq!(f.liveness.state_of(&name), Some(NodeState::Error));

    for _ in 0..3 {
        f.liveness.record_heartbeat("node1", "node1").unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.probe.calls(), 1, "pinned nodes are not probed again");
    assert!(f.liveness.ready_nodes().is_empty());
}

#[tokio::test]
async fn test_unreachable_node_retries_with_backoff() {
    let f = fixture();

    let name = f.liveness.record_heartbeat("node1", "node1").unwrap();
    wait_counter(&f.liveness, &name, 1).await;
    assert_eq!(f.liveness.state_of(&name), Some(NodeState::Error));

    // Next heartbeat claims the in-flight slot and waits 2s before probing
    f.probe.answer("NODE1:50505", "NODE1");
    f.liveness.record_heartbeat("node1", "node1").unwrap();
    assert_eq!(f.liveness.validation_counter(&name), Some(0));
    f.liveness.record_heartbeat("node1", "node1").unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(f.probe.calls(), 1, "retry waits for the backoff");

    wait_counter(&f.liveness, &name, VALIDATED).await;
    assert_eq!(f.probe.calls(), 2, "only one attempt runs at a time");
}

#[tokio::test]
async fn test_missing_heartbeats_mark_node_lost_and_reconnect_revalidates() {
    let f = fixture();
    f.probe.answer("NODE1:50505", "NODE9");

    let name = f.liveness.record_heartbeat("node1", "node1").unwrap();
    wait_counter(&f.liveness, &name, SPOOF_PINNED).await;

    f.clock.advance(Duration::from_secs(6));
    assert_eq!(f.liveness.state_of(&name), Some(NodeState::Lost));

    // A reconnect after the gap clears the pinned result
    f.probe.answer("NODE1:50505", "NODE1");
    f.liveness.record_heartbeat("node1", "node1").unwrap();
    wait_counter(&f.liveness, &name, VALIDATED).await;
    assert_eq!(f.liveness.state_of(&name), Some(NodeState::Ready));
    assert_eq!(f.probe.calls(), 2);
}

#[tokio::test]
async fn test_reserved_characters_are_rejected() {
    let f = fixture();
    for bad in ["node(1)", "a(b", "c)"] {
        assert!(matches!(
            f.liveness.record_heartbeat(bad, "node1"),
            Err(ClusrunError::InvalidArgument(_))
        ));
    }
    assert!(matches!(
        f.liveness.record_heartbeat("node1", "node1:1:2"),
        Err(ClusrunError::InvalidHost(..))
    ));
    assert_eq!(f.probe.calls(), 0);
}

#[tokio::test]
async fn test_get_nodes_filters() {
    let dir = tempfile::tempdir().unwrap();
    let groups = NodeGroups::open(dir.path().join("groups")).unwrap();
    let f = fixture();
    for name in ["NODE1", "NODE2", "GPU1"] {
        f.probe.answer(&format!("{}:50505", name), name);
        f.liveness.record_heartbeat(name, name).unwrap();
    }
    f.liveness.record_heartbeat("SPOOF", "node1").unwrap();
    for name in ["NODE1", "NODE2", "GPU1"] {
        wait_counter(&f.liveness, name, VALIDATED).await;
    }
    let spoof = "SPOOF(NODE1:50505)";
    wait_counter(&f.liveness, spoof, SPOOF_PINNED).await;

    groups
        .set(&["a".to_string()], &["node1".to_string(), "gpu1".to_string()], false)
        .unwrap();
    groups
        .set(&["b".to_string()], &["gpu1".to_string(), "node2".to_string()], false)
        .unwrap();

    let names = |query: NodeQuery| -> Vec<String> {
        f.liveness
            .get_nodes(&query, &groups)
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect()
    };

    assert_eq!(
        names(NodeQuery::default()),
        vec!["GPU1", "NODE1", "NODE2", spoof]
    );
    assert_eq!(
        names(NodeQuery {
            pattern: "^NODE".to_string(),
            ..Default::default()
        }),
        vec!["NODE1", "NODE2"]
    );
    assert_eq!(
        names(NodeQuery {
            state: Some(NodeState::Error),
            ..Default::default()
        }),
        vec![spoof]
    );
    assert_eq!(
        names(NodeQuery {
            groups: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        }),
        vec!["GPU1", "NODE1", "NODE2"]
    );
    assert_eq!(
        names(NodeQuery {
            groups: vec!["a".to_string(), "b".to_string()],
            intersect: true,
            ..Default::default()
        }),
        vec!["GPU1"]
    );

    let gpu = f
        .liveness
        .get_nodes(
            &NodeQuery {
                pattern: "GPU".to_string(),
                ..Default::default()
            },
            &groups,
        )
        .unwrap();
    assert_eq!(gpu[0].groups, vec!["a".to_string(), "b".to_string()]);

    assert!(matches!(
        f.liveness.get_nodes(
            &NodeQuery {
                pattern: "(".to_string(),
                ..Default::default()
            },
            &groups
        ),
        Err(ClusrunError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_reconnect_during_validation_keeps_single_attempt() {
    let f = fixture();
    f.probe.hold();

    let name = f.liveness.record_heartbeat("node1", "node1").unwrap();
    assert_eventually(
        || async { f.probe.calls() == 1 },
        Duration::from_secs(5),
        "validation should have started",
    )
    .await;
    assert_eq!(f.liveness.validation_counter(&name), Some(0));

    // A heartbeat after a gap arrives while the first attempt is in flight
    f.clock.advance(Duration::from_secs(6));
    f.liveness.record_heartbeat("node1", "node1").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.probe.calls(), 1);
    assert_eq!(f.liveness.validation_counter(&name), Some(0));

    f.probe.answer("NODE1:50505", "NODE1");
    f.probe.unhold();
    wait_counter(&f.liveness, &name, VALIDATED).await;
    assert_eq!(f.probe.calls(), 1);
}
