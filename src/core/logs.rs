use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Bytes kept from each end of a stream when building a snippet
pub const SNIPPET_HALF_BYTES: usize = 8 * 1024;

pub const TRUNCATION_MARKER: &str = "\n...[TRUNCATED]...\n";

/// Where a job's output ended up, plus the inline previews stored on the job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SavedLogs {
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub stdout_snippet: String,
    pub stderr_snippet: String,
}

impl SavedLogs {
    /// Snippets only, for when the log directory could not be written.
    pub fn in_memory(stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            stdout_path: None,
            stderr_path: None,
            stdout_snippet: snippet(stdout),
            stderr_snippet: snippet(stderr),
        }
    }
}

/// Bounded preview of a stream: unchanged when it fits the budget, otherwise
/// head and tail joined by [`TRUNCATION_MARKER`].
pub fn snippet(bytes: &[u8]) -> String {
    if bytes.len() <= SNIPPET_HALF_BYTES * 2 {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let head = String::from_utf8_lossy(&bytes[..SNIPPET_HALF_BYTES]);
    let tail = String::from_utf8_lossy(&bytes[bytes.len() - SNIPPET_HALF_BYTES..]);
    format!("{head}{TRUNCATION_MARKER}{tail}")
}

/// Persists full job output under a single directory, one file per stream.
#[derive(Debug, Clone)]
pub struct LogStore {
    dir: PathBuf,
}

impl LogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn paths(&self, job_id: u32) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("job-{job_id}.out")),
            self.dir.join(format!("job-{job_id}.err")),
        )
    }

    pub async fn save(&self, job_id: u32, stdout: &[u8], stderr: &[u8]) -> Result<SavedLogs> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create log directory {}", self.dir.display()))?;

        let (out_path, err_path) = self.paths(job_id);
        tokio::fs::write(&out_path, stdout)
            .await
            .with_context(|| format!("Failed to write {}", out_path.display()))?;
        tokio::fs::write(&err_path, stderr)
            .await
            .with_context(|| format!("Failed to write {}", err_path.display()))?;

        Ok(SavedLogs {
            stdout_path: Some(out_path),
            stderr_path: Some(err_path),
            stdout_snippet: snippet(stdout),
            stderr_snippet: snippet(stderr),
        })
    }
}
