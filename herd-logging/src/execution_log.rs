//! Per-task execution log files
//!
//! Layout: `<execution log dir>/<host>/<task name>_<yyyymmddhhmmss>.log`

use herd_core::Timestamp;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Append-only log file of one task execution on one host
#[derive(Debug, Clone)]
pub struct ExecutionLogFile {
    path: PathBuf,
}

impl ExecutionLogFile {
    /// Compute the log file path without touching the filesystem
    pub fn path_for(log_dir: &Path, host: &str, task_name: &str, timestamp: &Timestamp) -> PathBuf {
        log_dir.join(sanitize(host)).join(format!(
            "{}_{}.log",
            sanitize(task_name),
            timestamp.unformatted()
        ))
    }

    /// Create the file and its host directory
    pub async fn create(log_dir: &Path, host: &str, task_name: &str) -> io::Result<Self> {
        let timestamp = Timestamp::now();
        let path = Self::path_for(log_dir, host, task_name, &timestamp);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let log = Self { path };
        log.write(&format!(
            "Execution of task {} on host {} started at {}\n",
            task_name,
            host,
            timestamp.formatted()
        ))
        .await?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append the output of one step
    pub async fn append_step(&self, step_index: usize, label: &str, output: &str) -> io::Result<()> {
        let mut entry = format!(
            "[{}] step {}: {}\n",
            Timestamp::now().formatted(),
            step_index,
            label
        );
        if !output.is_empty() {
            entry.push_str(output);
            if !output.ends_with('\n') {
                entry.push('\n');
            }
        }
        self.write(&entry).await
    }

    async fn write(&self, text: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await
    }
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}
