use std::{
    fs::{self, File, OpenOptions},
    io::Write as _,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Context as _;
use serde::Serialize;

/// Append-only, newline-delimited JSON log shared by every capture loop or
/// replay session. Each append writes one complete line in a single call, so
/// concurrent writers interleave whole records, never fragments.
#[derive(Debug, Clone)]
pub struct RecordLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl RecordLog {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open log {}", path.display()))?;

        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append<T: Serialize>(&self, record: &T) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(record).context("serialize log record")?;
        line.push(b'\n');

        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || append_line_blocking(&file, &line))
            .await
            .context("join log append task")?
    }
}

fn append_line_blocking(file: &Mutex<File>, line: &[u8]) -> anyhow::Result<()> {
    let mut file = file
        .lock()
        .map_err(|_| anyhow::anyhow!("log file lock poisoned"))?;
    file.write_all(line).context("write log line")?;
    file.flush().context("flush log line")?;
    Ok(())
}
