use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::error::Result;

/// Durable mapping from group name to member node names.
///
/// Every change is written back to disk before the lock is released.
#[derive(Debug)]
pub struct NodeGroups {
    path: PathBuf,
    groups: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl NodeGroups {
    /// Load the group document at `path`, creating an empty one if missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let groups = if path.exists() {
            let content = std::fs::read(&path)?;
            let raw: BTreeMap<String, Vec<String>> = serde_json::from_slice(&content)?;
            raw.into_iter()
                .map(|(group, nodes)| (group, nodes.into_iter().collect()))
                .collect()
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, b"{}")?;
            BTreeMap::new()
        };
        tracing::info!(path = %path.display(), count = groups.len(), "Node groups loaded");
        Ok(Self {
            path,
            groups: Mutex::new(groups),
        })
    }

    /// Add `nodes` to every group in `groups`, or remove them when `remove` is set.
    ///
    /// Groups left without members are dropped.
    pub fn set(&self, groups: &[String], nodes: &[String], remove: bool) -> Result<()> {
        let mut all = self.groups.lock();
        let mut updated = all.clone();
        for group in groups {
            let group = group.trim();
            if group.is_empty() {
                continue;
            }
            let members = updated.entry(group.to_string()).or_default();
            for node in nodes {
                let node = node.trim().to_uppercase();
                if node.is_empty() {
                    continue;
                }
                if remove {
                    members.remove(&node);
                } else {
                    members.insert(node);
                }
            }
        }
        updated.retain(|_, members| !members.is_empty());

        self.persist(&updated)?;
        *all = updated;
        tracing::info!(?groups, ?nodes, remove, "Node groups updated");
        Ok(())
    }

    /// Members of the union (or intersection) of `groups`.
    ///
    /// Returns `None` when `groups` is empty, meaning no group filter applies.
    pub fn members(&self, groups: &[String], intersect: bool) -> Option<BTreeSet<String>> {
        if groups.is_empty() {
            return None;
        }
        let all = self.groups.lock();
        let empty = BTreeSet::new();
        let mut sets = groups
            .iter()
            .map(|g| all.get(g.trim()).unwrap_or(&empty));

        let first = sets.next().cloned().unwrap_or_default();
        Some(sets.fold(first, |acc, set| {
            if intersect {
                acc.intersection(set).cloned().collect()
            } else {
                acc.union(set).cloned().collect()
            }
        }))
    }

    /// Names of the groups `node` belongs to.
    pub fn groups_of(&self, node: &str) -> Vec<String> {
        self.groups
            .lock()
            .iter()
            .filter(|(_, members)| members.contains(node))
            .map(|(group, _)| group.clone())
            .collect()
    }

    pub fn all(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.groups.lock().clone()
    }

    fn persist(&self, groups: &BTreeMap<String, BTreeSet<String>>) -> Result<()> {
        let content = serde_json::to_vec_pretty(groups)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}
