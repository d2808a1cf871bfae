use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use dashmap::DashMap;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::host::file_name_format;

/// Exit code reported when the command could not be started.
pub const EXIT_START_FAILED: i32 = -1;

const CHUNK_SIZE: usize = 1024;

/// One frame of a running command's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Stdout(String),
    Stderr(String),
    Exit(i32),
}

/// Label of a job on this node, unique across the headnodes it serves.
pub fn job_label(headnode: &str, job_id: i32) -> String {
    format!("{}.{}", file_name_format(headnode), job_id)
}

/// Runs job commands as process groups and kills them on request.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    scratch_dir: PathBuf,
    running: Arc<DashMap<String, i32>>,
}

impl JobExecutor {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn is_running(&self, label: &str) -> bool {
        self.running.contains_key(label)
    }

    /// Run `command` with `arguments` and send its output to `tx`.
    ///
    /// The command is written to `<scratch_dir>/<label>.sh` and started with
    /// bash as the leader of a new process group. Stdout and stderr are read
    /// concurrently; the final frame is always [`Output::Exit`]. Output keeps
    /// being drained after the receiver goes away so the child never blocks
    /// on a full pipe.
    pub async fn execute(
        &self,
        label: &str,
        command: &str,
        arguments: &[String],
        tx: mpsc::Sender<Output>,
    ) -> i32 {
        let script = self.scratch_dir.join(format!("{}.sh", label));
        let exit_code = self.run(label, &script, command, arguments, &tx).await;

        self.running.remove(label);
        if let Err(e) = tokio::fs::remove_file(&script).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(label, error = %e, "Failed to remove command file");
            }
        }

        let _ = tx.send(Output::Exit(exit_code)).await;
        tracing::info!(label, exit_code, "Job ended");
        exit_code
    }

    async fn run(
        &self,
        label: &str,
        script: &Path,
        command: &str,
        arguments: &[String],
        tx: &mpsc::Sender<Output>,
    ) -> i32 {
        if let Err(e) = write_script(script, command).await {
            tracing::error!(label, error = %e, "Failed to write command file");
            let _ = tx.send(Output::Stderr(format!("Failed to write command file: {}\n", e))).await;
            return EXIT_START_FAILED;
        }

        let spawned = Command::new("/bin/bash")
            .arg(script)
            .args(arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(label, error = %e, "Failed to start job");
                let _ = tx.send(Output::Stderr(format!("Failed to start job: {}\n", e))).await;
                return EXIT_START_FAILED;
            }
        };

        if let Some(pid) = child.id() {
            self.running.insert(label.to_string(), pid as i32);
            tracing::info!(label, pid, "Job started");
        }

        let stdout = child.stdout.take().map(|out| {
            let tx = tx.clone();
            tokio::spawn(relay(out, tx, Output::Stdout))
        });
        let stderr = child.stderr.take().map(|err| {
            let tx = tx.clone();
            tokio::spawn(relay(err, tx, Output::Stderr))
        });
        for reader in [stdout, stderr].into_iter().flatten() {
            if let Err(e) = reader.await {
                tracing::warn!(label, error = %e, "Output reader failed");
            }
        }

        match child.wait().await {
            Ok(status) => status.code().unwrap_or(EXIT_START_FAILED),
            Err(e) => {
                tracing::error!(label, error = %e, "Failed to wait for job");
                EXIT_START_FAILED
            }
        }
    }

    /// Kill the process group of job `label`. Unknown labels are ignored.
    pub fn cancel(&self, label: &str) -> nix::Result<()> {
        let Some(pid) = self.running.get(label).map(|p| *p) else {
            tracing::info!(label, "Job to cancel is not running");
            return Ok(());
        };
        match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => {
                tracing::info!(label, pid, "Job cancelled");
                Ok(())
            }
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => {
                tracing::error!(label, pid, error = %e, "Failed to cancel job");
                Err(e)
            }
        }
    }
}

async fn write_script(script: &Path, command: &str) -> std::io::Result<()> {
    if let Some(dir) = script.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(script, command).await
}

async fn relay<R>(mut reader: R, tx: mpsc::Sender<Output>, frame: fn(String) -> Output)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut pending = Vec::new();
    let mut receiver_gone = false;
    loop {
        let chunk = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if receiver_gone {
                    continue;
                }
                pending.extend_from_slice(&buf[..n]);
                decode_utf8(&mut pending)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read job output");
                break;
            }
        };
        if !chunk.is_empty() && tx.send(frame(chunk)).await.is_err() {
            receiver_gone = true;
        }
    }
    if !receiver_gone && !pending.is_empty() {
        let _ = tx.send(frame(String::from_utf8_lossy(&pending).into_owned())).await;
    }
}

/// Take the decodable prefix of `pending`, leaving an incomplete trailing
/// character for the next read. Invalid sequences become U+FFFD.
fn decode_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    let mut start = 0;
    loop {
        match std::str::from_utf8(&pending[start..]) {
            Ok(valid) => {
                out.push_str(valid);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid_end = start + e.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&pending[start..valid_end]) {
                    out.push_str(valid);
                }
                match e.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        start = valid_end + len;
                    }
                    None => {
                        pending.drain(..valid_end);
                        return out;
                    }
                }
            }
        }
    }
}
