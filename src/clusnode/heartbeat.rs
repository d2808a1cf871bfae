use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use crate::config::Settings;
use crate::grpc::client;
use crate::host::HostAddress;
use crate::proto::headnode_client::HeadnodeClient;
use crate::proto::{HeartbeatRequest, SetHeadnodesMode};

/// Heartbeat task of one headnode.
#[derive(Debug)]
struct Link {
    token: CancellationToken,
    connected: Arc<AtomicBool>,
}

/// Keeps one heartbeat task running per configured headnode.
pub struct HeadnodeReporter {
    node_name: String,
    host: HostAddress,
    settings: Arc<Settings>,
    links: DashMap<String, Link>,
    shutdown: CancellationToken,
}

impl HeadnodeReporter {
    pub fn new(
        node_name: &str,
        host: HostAddress,
        settings: Arc<Settings>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            node_name: node_name.to_uppercase(),
            host,
            settings,
            links: DashMap::new(),
            shutdown,
        }
    }

    /// Apply a headnode list change. Returns a result message per headnode.
    pub fn set_headnodes(&self, headnodes: &[String], mode: SetHeadnodesMode) -> BTreeMap<String, String> {
        let mut results = BTreeMap::new();
        match mode {
            SetHeadnodesMode::Add => {
                for headnode in headnodes {
                    let (key, message) = self.add(headnode);
                    results.insert(key, message);
                }
            }
            SetHeadnodesMode::Remove => {
                for headnode in headnodes {
                    let (key, message) = self.remove(headnode);
                    results.insert(key, message);
                }
            }
            SetHeadnodesMode::Replace => {
                let mut keep = Vec::new();
                for headnode in headnodes {
                    let (key, message) = self.add(headnode);
                    keep.push(key.clone());
                    results.insert(key, message);
                }
                for existing in self.headnodes() {
                    if !keep.contains(&existing) {
                        let (key, message) = self.remove(&existing);
                        results.insert(key, message);
                    }
                }
            }
        }
        results
    }

    fn add(&self, headnode: &str) -> (String, String) {
        let address = match HostAddress::parse(headnode, self.host.hostname()) {
            Ok(address) => address,
            Err(e) => return (headnode.to_string(), format!("Invalid headnode: {}", e)),
        };
        let key = address.to_string();
        if let Some(link) = self.links.get(&key) {
            let message = if link.connected.load(Ordering::Relaxed) {
                "Already connected"
            } else {
                "Connecting"
            };
            return (key, message.to_string());
        }

        let link = Link {
            token: self.shutdown.child_token(),
            connected: Arc::new(AtomicBool::new(false)),
        };
        let task = HeartbeatTask {
            node_name: self.node_name.clone(),
            host: self.host.to_string(),
            headnode: key.clone(),
            settings: Arc::clone(&self.settings),
            token: link.token.clone(),
            connected: Arc::clone(&link.connected),
        };
        self.links.insert(key.clone(), link);
        tokio::spawn(task.run());
        tracing::info!(headnode = %key, "Headnode added");
        (key, "Added".to_string())
    }

    fn remove(&self, headnode: &str) -> (String, String) {
        let address = match HostAddress::parse(headnode, self.host.hostname()) {
            Ok(address) => address,
            Err(e) => return (headnode.to_string(), format!("Invalid headnode: {}", e)),
        };
        let key = address.to_string();
        match self.links.remove(&key) {
            Some((_, link)) => {
                link.token.cancel();
                tracing::info!(headnode = %key, "Headnode removed");
                (key, "Removed".to_string())
            }
            None => (key, "Already removed".to_string()),
        }
    }

    /// Every headnode currently reported to, connected or not.
    pub fn headnodes(&self) -> Vec<String> {
        let mut all: Vec<String> = self.links.iter().map(|l| l.key().clone()).collect();
        all.sort();
        all
    }

    pub fn connected(&self) -> Vec<String> {
        self.filter(true)
    }

    pub fn connecting(&self) -> Vec<String> {
        self.filter(false)
    }

    fn filter(&self, connected: bool) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .links
            .iter()
            .filter(|l| l.connected.load(Ordering::Relaxed) == connected)
            .map(|l| l.key().clone())
            .collect();
        hosts.sort();
        hosts
    }
}

struct HeartbeatTask {
    node_name: String,
    host: String,
    headnode: String,
    settings: Arc<Settings>,
    token: CancellationToken,
    connected: Arc<AtomicBool>,
}

impl HeartbeatTask {
    async fn run(self) {
        let mut client: Option<HeadnodeClient<Channel>> = None;
        loop {
            if client.is_none() {
                match client::connect(&self.headnode).await {
                    Ok(channel) => client = Some(HeadnodeClient::new(channel)),
                    Err(e) => {
                        tracing::debug!(headnode = %self.headnode, error = %e, "Failed to connect headnode");
                    }
                }
            }

            if let Some(c) = client.as_mut() {
                let request = HeartbeatRequest {
                    nodename: self.node_name.clone(),
                    host: self.host.clone(),
                };
                match c.heartbeat(request).await {
                    Ok(_) => {
                        if !self.connected.swap(true, Ordering::Relaxed) {
                            tracing::info!(headnode = %self.headnode, "Connected to headnode");
                        }
                    }
                    Err(status) => {
                        if self.connected.swap(false, Ordering::Relaxed) {
                            tracing::warn!(headnode = %self.headnode, error = %status, "Lost connection to headnode");
                        }
                        client = None;
                    }
                }
            }

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.settings.heartbeat_interval()) => {}
            }
        }
        tracing::debug!(headnode = %self.headnode, "Heartbeat stopped");
    }
}
