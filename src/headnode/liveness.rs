//! Node liveness and identity validation.
//!
//! Every heartbeat refreshes the reporting node's timestamp. A node is only
//! trusted (`Ready`) after the headnode has dialed the claimed host itself
//! and the node there answered with the claimed name.
//!
//! # Validation counter
//!
//! Per display name:
//! - absent: never attempted, validate on the next heartbeat
//! - `-1`: validated
//! - `0`: a validation attempt is in flight
//! - `n > 0`: `n` consecutive failures, retried after `2^n` seconds (max 60)
//! - [`SPOOF_PINNED`]: the host answered with another name, never retried
//!   until a heartbeat gap resets the node

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::{ClusrunError, Result};
use crate::grpc::client;
use crate::headnode::groups::NodeGroups;
use crate::host::HostAddress;
use crate::proto;
use crate::proto::clusnode_client::ClusnodeClient;

pub const VALIDATED: i32 = -1;
pub const VALIDATING: i32 = 0;
pub const SPOOF_PINNED: i32 = 10;

const MAX_BACKOFF: Duration = Duration::from_secs(60);
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of the current time, replaceable in tests.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Asks whatever listens at a host for its node name.
#[tonic::async_trait]
pub trait IdentityProbe: Send + Sync + 'static {
    async fn probe(&self, host: &str) -> Result<String>;
}

/// Probes a clusnode over its `Validate` RPC.
#[derive(Debug, Clone)]
pub struct GrpcProbe {
    headnode: String,
}

impl GrpcProbe {
    pub fn new(headnode: &HostAddress) -> Self {
        Self {
            headnode: headnode.to_string(),
        }
    }
}

#[tonic::async_trait]
impl IdentityProbe for GrpcProbe {
    async fn probe(&self, host: &str) -> Result<String> {
        let channel = client::connect(host).await?;
        let mut client = ClusnodeClient::new(channel);
        let mut request = tonic::Request::new(proto::ValidateRequest {
            headnode: self.headnode.clone(),
            clusnode: host.to_string(),
        });
        request.set_timeout(VALIDATE_TIMEOUT);
        let reply = client.validate(request).await?.into_inner();
        Ok(reply.nodename)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Ready,
    Error,
    Lost,
}

impl NodeState {
    pub fn to_proto(self) -> proto::NodeState {
        match self {
            NodeState::Ready => proto::NodeState::Ready,
            NodeState::Error => proto::NodeState::Error,
            NodeState::Lost => proto::NodeState::Lost,
        }
    }

    /// `None` for the unknown state, which means "any state" in queries.
    pub fn from_proto(state: proto::NodeState) -> Option<Self> {
        match state {
            proto::NodeState::Unknown => None,
            proto::NodeState::Ready => Some(NodeState::Ready),
            proto::NodeState::Error => Some(NodeState::Error),
            proto::NodeState::Lost => Some(NodeState::Lost),
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Ready => write!(f, "Ready"),
            NodeState::Error => write!(f, "Error"),
            NodeState::Lost => write!(f, "Lost"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    pub name: String,
    pub state: NodeState,
    pub groups: Vec<String>,
}

/// Filter for [`NodeLiveness::get_nodes`].
#[derive(Debug, Clone, Default)]
pub struct NodeQuery {
    pub pattern: String,
    pub state: Option<NodeState>,
    pub groups: Vec<String>,
    pub intersect: bool,
}

pub struct NodeLiveness {
    local_name: String,
    reported: DashMap<String, Instant>,
    validation: DashMap<String, i32>,
    settings: Arc<Settings>,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn IdentityProbe>,
    shutdown: CancellationToken,
}

impl NodeLiveness {
    pub fn new(
        local_name: &str,
        settings: Arc<Settings>,
        probe: Arc<dyn IdentityProbe>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            local_name: local_name.to_uppercase(),
            reported: DashMap::new(),
            validation: DashMap::new(),
            settings,
            clock,
            probe,
            shutdown,
        }
    }

    /// Record a heartbeat from `nodename` reporting from `host`.
    ///
    /// Returns the node's display name. Starts a validation when the node is
    /// new, reconnected after a heartbeat gap, or waiting for a retry.
    pub fn record_heartbeat(self: &Arc<Self>, nodename: &str, host: &str) -> Result<String> {
        if nodename.contains(['(', ')']) {
            return Err(ClusrunError::InvalidArgument(format!(
                "Invalid nodename: {}",
                nodename
            )));
        }
        if nodename.trim().is_empty() {
            return Err(ClusrunError::InvalidArgument("Empty nodename".to_string()));
        }
        let host = HostAddress::parse(host, &self.local_name)?;
        let nodename = nodename.trim().to_uppercase();
        let display_name = host.display_name(&nodename);

        let now = self.clock.now();
        match self.reported.insert(display_name.clone(), now) {
            None => tracing::info!(node = %display_name, "First heartbeat"),
            Some(last) if now.saturating_duration_since(last) > self.settings.heartbeat_timeout() => {
                tracing::info!(node = %display_name, "Node reconnected");
                self.validation
                    .remove_if(&display_name, |_, counter| *counter != VALIDATING);
            }
            Some(_) => {}
        }

        if let Some(failures) = self.begin_validation(&display_name) {
            let this = Arc::clone(self);
            let name = display_name.clone();
            tokio::spawn(async move {
                this.validate(name, nodename, host.to_string(), failures).await;
            });
        }
        Ok(display_name)
    }

    /// Claim the in-flight slot for a validation attempt. Returns the number
    /// of failures so far when an attempt should start.
    fn begin_validation(&self, display_name: &str) -> Option<i32> {
        match self.validation.entry(display_name.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(VALIDATING);
                Some(0)
            }
            Entry::Occupied(mut entry) => {
                let failures = *entry.get();
                if failures > 0 && failures < SPOOF_PINNED {
                    entry.insert(VALIDATING);
                    Some(failures)
                } else {
                    None
                }
            }
        }
    }

    async fn validate(&self, display_name: String, nodename: String, host: String, failures: i32) {
        if failures > 0 {
            let delay = backoff(failures);
            tracing::debug!(node = %display_name, ?delay, "Waiting before revalidation");
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(node = %display_name, host = %host, "Validating node");
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            result = self.probe.probe(&host) => result,
        };

        let counter = match result {
            Ok(replied) if replied.to_uppercase() == nodename => {
                tracing::info!(node = %display_name, host = %host, "Node validated");
                VALIDATED
            }
            Ok(replied) => {
                tracing::warn!(
                    node = %display_name,
                    expected = %nodename,
                    replied = %replied.to_uppercase(),
                    "Validation failed: node name mismatch"
                );
                SPOOF_PINNED
            }
            Err(e) => {
                tracing::warn!(node = %display_name, error = %e, "Validation failed");
                (failures + 1).min(SPOOF_PINNED - 1)
            }
        };

        if let Some(mut current) = self.validation.get_mut(&display_name) {
            if *current == VALIDATING {
                *current = counter;
            }
        }
    }

    pub fn validation_counter(&self, display_name: &str) -> Option<i32> {
        self.validation.get(display_name).map(|c| *c)
    }

    pub fn state_of(&self, display_name: &str) -> Option<NodeState> {
        let last = *self.reported.get(display_name)?;
        Some(self.derive_state(display_name, last))
    }

    fn derive_state(&self, display_name: &str, last: Instant) -> NodeState {
        if self.clock.now().saturating_duration_since(last) > self.settings.heartbeat_timeout() {
            NodeState::Lost
        } else if self.validation_counter(display_name) == Some(VALIDATED) {
            NodeState::Ready
        } else {
            NodeState::Error
        }
    }

    /// Display names of all validated, live nodes.
    pub fn ready_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .reported
            .iter()
            .filter(|e| self.derive_state(e.key(), *e.value()) == NodeState::Ready)
            .map(|e| e.key().clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Known nodes matching `query`, each with the groups it belongs to.
    pub fn get_nodes(&self, query: &NodeQuery, groups: &NodeGroups) -> Result<Vec<NodeView>> {
        let pattern = Regex::new(&query.pattern).map_err(|e| {
            ClusrunError::InvalidArgument(format!("Invalid node pattern {:?}: {}", query.pattern, e))
        })?;
        let members = groups.members(&query.groups, query.intersect);

        let mut nodes: Vec<NodeView> = self
            .reported
            .iter()
            .filter(|e| pattern.is_match(e.key()))
            .filter(|e| members.as_ref().map_or(true, |m| m.contains(e.key())))
            .map(|e| NodeView {
                name: e.key().clone(),
                state: self.derive_state(e.key(), *e.value()),
                groups: Vec::new(),
            })
            .filter(|n| query.state.map_or(true, |s| s == n.state))
            .collect();

        for node in nodes.iter_mut() {
            node.groups = groups.groups_of(&node.name);
        }
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }
}

fn backoff(failures: i32) -> Duration {
    let secs = 2u64.saturating_pow(failures.max(0) as u32);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}
