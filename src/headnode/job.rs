use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ClusrunError, Result};
use crate::proto;

/// Job id meaning "all jobs" in queries and cancellation.
pub const JOB_ID_ALL: i32 = 0;
/// Relative job id of the most recent job.
pub const JOB_ID_LAST: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Created,
    Dispatching,
    Running,
    Canceling,
    Finished,
    Failed,
    Canceled,
    CancelFailed,
}

impl JobState {
    /// Active jobs can be cancelled and are marked canceling on restart.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobState::Dispatching | JobState::Running | JobState::Canceling
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Finished | JobState::Failed | JobState::Canceled | JobState::CancelFailed
        )
    }

    /// Whether `self -> to` is an edge of the job state machine.
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Created, Dispatching)
                | (Dispatching, Running)
                | (Running, Finished)
                | (Running, Failed)
                | (Dispatching, Canceling)
                | (Running, Canceling)
                | (Canceling, Canceled)
                | (Canceling, CancelFailed)
        )
    }

    pub fn to_proto(self) -> proto::JobState {
        match self {
            JobState::Created => proto::JobState::Created,
            JobState::Dispatching => proto::JobState::Dispatching,
            JobState::Running => proto::JobState::Running,
            JobState::Canceling => proto::JobState::Canceling,
            JobState::Finished => proto::JobState::Finished,
            JobState::Failed => proto::JobState::Failed,
            JobState::Canceled => proto::JobState::Canceled,
            JobState::CancelFailed => proto::JobState::CancelFailed,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Created => "Created",
            JobState::Dispatching => "Dispatching",
            JobState::Running => "Running",
            JobState::Canceling => "Canceling",
            JobState::Finished => "Finished",
            JobState::Failed => "Failed",
            JobState::Canceled => "Canceled",
            JobState::CancelFailed => "CancelFailed",
        };
        write!(f, "{}", s)
    }
}

/// What a submitter asked for, before an id is assigned.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub name: String,
    pub command: String,
    pub arguments: Vec<String>,
    pub sweep: String,
    pub node_pattern: String,
    pub node_groups: Vec<String>,
    pub specified_nodes: Vec<String>,
}

impl JobSpec {
    /// Build the command line from what a user typed.
    ///
    /// Without a script every word is joined into one shell command line.
    /// With a script its contents are the command and the words become
    /// its positional arguments.
    pub fn with_command_line(mut self, words: Vec<String>, script: Option<String>) -> Self {
        match script {
            Some(script) => {
                self.command = script;
                self.arguments = words;
            }
            None => {
                self.command = words.join(" ");
                self.arguments = Vec::new();
            }
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i32,
    #[serde(default)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub sweep: String,
    pub state: JobState,
    pub create_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub node_pattern: String,
    #[serde(default)]
    pub node_groups: Vec<String>,
    #[serde(default)]
    pub specified_nodes: Vec<String>,
    /// Resolved nodes the job was dispatched to. Fixed at creation.
    pub nodes: Vec<String>,
    #[serde(default)]
    pub failed_nodes: BTreeMap<String, i32>,
    #[serde(default)]
    pub cancel_failed_nodes: Vec<String>,
    #[serde(default)]
    pub progress: String,
}

impl Job {
    pub fn new(id: i32, spec: JobSpec, nodes: Vec<String>) -> Self {
        Self {
            id,
            name: spec.name,
            command: spec.command,
            arguments: spec.arguments,
            sweep: spec.sweep,
            state: JobState::Created,
            create_time: Utc::now(),
            end_time: None,
            node_pattern: spec.node_pattern,
            node_groups: spec.node_groups,
            specified_nodes: spec.specified_nodes,
            nodes,
            failed_nodes: BTreeMap::new(),
            cancel_failed_nodes: Vec::new(),
            progress: String::new(),
        }
    }

    pub fn to_proto(&self) -> proto::JobInfo {
        proto::JobInfo {
            id: self.id,
            name: self.name.clone(),
            command: self.command.clone(),
            arguments: self.arguments.clone(),
            sweep: self.sweep.clone(),
            state: self.state.to_proto() as i32,
            create_time: self.create_time.timestamp(),
            end_time: self.end_time.map(|t| t.timestamp()).unwrap_or(0),
            node_pattern: self.node_pattern.clone(),
            node_groups: self.node_groups.clone(),
            specified_nodes: self.specified_nodes.clone(),
            nodes: self.nodes.clone(),
            failed_nodes: self.failed_nodes.clone().into_iter().collect(),
            cancel_failed_nodes: self.cancel_failed_nodes.clone(),
            progress: self.progress.clone(),
        }
    }
}

/// Rewrite relative (negative) ids against the newest job id.
///
/// `-1` becomes the newest id, `-2` the one before it, and so on. `0`
/// (all jobs) and positive ids are kept as given.
pub fn normalize_job_ids(ids: &BTreeSet<i32>, max_id: i32) -> BTreeSet<i32> {
    ids.iter()
        .map(|&id| if id < 0 { max_id + 1 + id } else { id })
        .collect()
}

/// Parse job id arguments as typed by a user.
///
/// Accepts comma separated ids, inclusive ranges `a-b` of positive ids,
/// negative relative ids, `*`/`all` for every job and `last`/`~~` for the
/// newest one. `0` is rejected since it only has meaning on the wire.
pub fn parse_job_ids<S: AsRef<str>>(args: &[S]) -> Result<BTreeSet<i32>> {
    let mut ids = BTreeSet::new();
    for arg in args {
        for item in arg.as_ref().split(',') {
            let item = item.trim();
            match item.to_lowercase().as_str() {
                "*" | "all" => {
                    ids.insert(JOB_ID_ALL);
                    continue;
                }
                "last" | "~~" => {
                    ids.insert(JOB_ID_LAST);
                    continue;
                }
                _ => {}
            }

            let (begin, end) = match item.find('-') {
                // "-3" is a relative id, not a range
                None | Some(0) => (item, item),
                Some(_) => match item.split_once('-') {
                    Some((b, e)) if !b.is_empty() && !e.is_empty() => (b, e),
                    _ => return Err(invalid_job_range(item)),
                },
            };
            let begin = parse_job_id(begin)?;
            let end = parse_job_id(end)?;
            if begin != end && (begin < 0 || end < 0) {
                return Err(invalid_job_range(item));
            }
            ids.extend(begin..=end);
        }
    }
    Ok(ids)
}

fn parse_job_id(s: &str) -> Result<i32> {
    match s.trim().parse::<i32>() {
        Ok(id) if id != 0 => Ok(id),
        _ => Err(ClusrunError::InvalidArgument(format!(
            "Invalid job id: {:?}",
            s
        ))),
    }
}

fn invalid_job_range(s: &str) -> ClusrunError {
    ClusrunError::InvalidArgument(format!("Invalid job range: {:?}", s))
}
