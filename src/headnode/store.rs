//! Durable job list.
//!
//! The whole list lives in one gzip-compressed JSON document. Every change
//! goes through [`JobStore::with_jobs`], which holds the store lock across
//! read, mutation and write-back. Per-job output lives next to it in
//! `<output_dir>/<job id>/<node>.out|.err`.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ClusrunError, Result};
use crate::headnode::job::{normalize_job_ids, Job, JobSpec, JobState, JOB_ID_ALL};
use crate::host::file_name_format;

const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct JobDocument {
    version: u32,
    jobs: Vec<Job>,
}

/// Jobs marked canceling by [`JobStore::mark_canceling`].
#[derive(Debug, Default)]
pub struct CancelPlan {
    /// Job id to the nodes each job was dispatched to.
    pub jobs: BTreeMap<i32, Vec<String>>,
}

#[derive(Debug)]
pub struct JobStore {
    path: PathBuf,
    output_dir: PathBuf,
    lock: Mutex<()>,
}

impl JobStore {
    /// Open the store, running crash recovery on an existing job list.
    ///
    /// Jobs left active by a previous process are marked canceling and output
    /// directories of jobs no longer in the list are removed.
    pub fn open(path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            path: path.into(),
            output_dir: output_dir.into(),
            lock: Mutex::new(()),
        };
        std::fs::create_dir_all(&store.output_dir)?;

        if !store.path.exists() {
            store.save(&[])?;
            tracing::info!(path = %store.path.display(), "Job store created");
            return Ok(store);
        }

        let known = store.with_jobs(|jobs| {
            for job in jobs.iter_mut().filter(|j| j.state.is_active()) {
                tracing::warn!(job_id = job.id, state = %job.state, "Marking interrupted job canceling");
                job.state = JobState::Canceling;
            }
            jobs.iter().map(|j| j.id).collect::<BTreeSet<i32>>()
        })?;

        for entry in std::fs::read_dir(&store.output_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            match name.parse::<i32>() {
                Ok(id) if entry.path().is_dir() => {
                    if !known.contains(&id) {
                        remove_output_dir(&entry.path(), id);
                    }
                }
                _ => tracing::warn!(item = %name, "Unexpected item in output dir"),
            }
        }

        tracing::info!(path = %store.path.display(), jobs = known.len(), "Job store recovered");
        Ok(store)
    }

    /// Run `f` over the full job list under the store lock and write it back.
    pub fn with_jobs<R>(&self, f: impl FnOnce(&mut Vec<Job>) -> R) -> Result<R> {
        let _guard = self.lock.lock();
        let mut jobs = self.load()?;
        let result = f(&mut jobs);
        self.save(&jobs)?;
        Ok(result)
    }

    /// Read-only snapshot of the job list.
    pub fn jobs(&self) -> Result<Vec<Job>> {
        let _guard = self.lock.lock();
        self.load()
    }

    /// Jobs matching `ids`. Empty `ids` or [`JOB_ID_ALL`] selects every job.
    pub fn get_jobs(&self, ids: &BTreeSet<i32>) -> Result<Vec<Job>> {
        let jobs = self.jobs()?;
        let all = ids.is_empty() || ids.contains(&JOB_ID_ALL);
        let wanted = normalize_job_ids(ids, max_id(&jobs));
        Ok(jobs
            .into_iter()
            .filter(|j| all || wanted.contains(&j.id))
            .collect())
    }

    /// Append a new job, evicting the oldest inactive jobs beyond `max_job_count`.
    ///
    /// Fails without touching the list if only active jobs would be left to evict.
    pub fn create_job(&self, spec: JobSpec, nodes: Vec<String>, max_job_count: usize) -> Result<Job> {
        let (job, evicted) = self
            .with_jobs(|jobs| -> Result<(Job, Vec<i32>)> {
                let evicted = evict_inactive(jobs, max_job_count)?;
                let job = Job::new(max_id(jobs).max(last_evicted(&evicted)) + 1, spec, nodes);
                jobs.push(job.clone());
                Ok((job, evicted))
            })
            .and_then(|r| r)?;

        for id in evicted {
            remove_output_dir(&self.output_dir(id), id);
        }
        std::fs::create_dir_all(self.output_dir(job.id))?;
        tracing::info!(job_id = job.id, nodes = job.nodes.len(), "Job created");
        Ok(job)
    }

    /// Move job `id` from `from` to `to`. Returns false if the job was not in `from`.
    pub fn update_state(&self, id: i32, from: JobState, to: JobState) -> Result<bool> {
        let changed = self.with_jobs(|jobs| match jobs.iter_mut().find(|j| j.id == id) {
            Some(job) if job.state == from && from.can_transition_to(to) => {
                job.state = to;
                true
            }
            Some(job) => {
                tracing::warn!(job_id = id, %from, %to, current = %job.state, "Skip changing job state");
                false
            }
            None => false,
        })?;
        if changed {
            tracing::info!(job_id = id, %from, %to, "Job state changed");
        }
        Ok(changed)
    }

    /// Record the outcome of a dispatched job.
    ///
    /// The job becomes `Failed` if any node exited non-zero, else `Finished`.
    /// A job that was cancelled meanwhile keeps its state.
    pub fn finish_job(&self, id: i32, failed_nodes: BTreeMap<String, i32>) -> Result<JobState> {
        let to = if failed_nodes.is_empty() {
            JobState::Finished
        } else {
            JobState::Failed
        };
        let state = self.with_jobs(|jobs| {
            let job = jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or(ClusrunError::JobNotFound(id))?;
            for (node, code) in &failed_nodes {
                job.failed_nodes.entry(node.clone()).or_insert(*code);
            }
            if job.state == JobState::Running {
                job.state = to;
                job.end_time = Some(Utc::now());
            }
            Ok::<_, ClusrunError>(job.state)
        })??;
        tracing::info!(job_id = id, state = %state, failed = failed_nodes.len(), "Job ended");
        Ok(state)
    }

    /// Mark every active job in `ids` canceling and return their node lists.
    ///
    /// Empty `ids` or [`JOB_ID_ALL`] selects every job.
    pub fn mark_canceling(&self, ids: &BTreeSet<i32>) -> Result<CancelPlan> {
        let all = ids.is_empty() || ids.contains(&JOB_ID_ALL);
        self.with_jobs(|jobs| {
            let wanted = normalize_job_ids(ids, max_id(jobs));
            let mut plan = CancelPlan::default();
            for job in jobs.iter_mut() {
                if !(all || wanted.contains(&job.id)) || !job.state.is_active() {
                    continue;
                }
                job.state = JobState::Canceling;
                plan.jobs.insert(job.id, job.nodes.clone());
            }
            plan
        })
    }

    /// Record the result of cancelling job `id` on its nodes.
    pub fn finish_cancel(&self, id: i32, cancel_failed_nodes: Vec<String>) -> Result<JobState> {
        let state = self.with_jobs(|jobs| {
            let job = jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or(ClusrunError::JobNotFound(id))?;
            if job.state == JobState::Canceling {
                job.end_time = Some(Utc::now());
                if cancel_failed_nodes.is_empty() {
                    job.state = JobState::Canceled;
                } else {
                    job.state = JobState::CancelFailed;
                    job.cancel_failed_nodes = cancel_failed_nodes.clone();
                }
            }
            Ok::<_, ClusrunError>(job.state)
        })??;
        if state == JobState::CancelFailed {
            tracing::warn!(job_id = id, nodes = ?cancel_failed_nodes, "Cancellation failed on some nodes");
        } else {
            tracing::info!(job_id = id, state = %state, "Job cancellation ended");
        }
        Ok(state)
    }

    pub fn output_dir(&self, id: i32) -> PathBuf {
        self.output_dir.join(id.to_string())
    }

    /// Stdout and stderr file of job `id` on `node`.
    pub fn output_files(&self, id: i32, node: &str) -> (PathBuf, PathBuf) {
        let dir = self.output_dir(id);
        let name = file_name_format(node);
        (
            dir.join(format!("{}.out", name)),
            dir.join(format!("{}.err", name)),
        )
    }

    fn load(&self) -> Result<Vec<Job>> {
        let compressed = std::fs::read(&self.path)?;
        let mut content = Vec::new();
        GzDecoder::new(compressed.as_slice()).read_to_end(&mut content)?;
        let doc: JobDocument = serde_json::from_slice(&content)?;
        if doc.version != STORE_VERSION {
            return Err(ClusrunError::Internal(format!(
                "Unsupported job store version {}",
                doc.version
            )));
        }
        Ok(doc.jobs)
    }

    fn save(&self, jobs: &[Job]) -> Result<()> {
        let doc = serde_json::to_vec(&serde_json::json!({
            "version": STORE_VERSION,
            "jobs": jobs,
        }))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&doc)?;
        let compressed = encoder.finish()?;

        // Write to a temp file first so a crash never leaves a torn document
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, compressed)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn max_id(jobs: &[Job]) -> i32 {
    jobs.iter().map(|j| j.id).max().unwrap_or(0)
}

fn last_evicted(evicted: &[i32]) -> i32 {
    evicted.iter().copied().max().unwrap_or(0)
}

/// Drop the oldest inactive jobs until one more job fits in `max_job_count`.
fn evict_inactive(jobs: &mut Vec<Job>, max_job_count: usize) -> Result<Vec<i32>> {
    let excess = (jobs.len() + 1).saturating_sub(max_job_count);
    if excess == 0 {
        return Ok(Vec::new());
    }

    let evicted: Vec<i32> = jobs
        .iter()
        .filter(|j| !j.state.is_active())
        .take(excess)
        .map(|j| j.id)
        .collect();
    if evicted.len() < excess {
        return Err(ClusrunError::CapacityExceeded {
            capacity: max_job_count,
            active: jobs.iter().filter(|j| j.state.is_active()).count(),
        });
    }

    jobs.retain(|j| !evicted.contains(&j.id));
    tracing::info!(?evicted, "Evicted old jobs");
    Ok(evicted)
}

fn remove_output_dir(dir: &Path, id: i32) {
    tracing::info!(job_id = id, "Cleaning up output dir");
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(job_id = id, error = %e, "Failed to clean up output dir");
        }
    }
}
