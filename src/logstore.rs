//! Append-only, line-numbered VPN session log
//!
//! Every line the supervised process prints (plus the daemon's own progress
//! lines) is appended here so that a client attaching later can page back
//! through the session with `get_logs`. Line numbers are 0-based and only go
//! back to zero on [`LogStore::reset`].
//!
//! File access goes through `tokio::fs`, so appends made from the output
//! stream never block a runtime thread.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Error, Debug)]
pub enum LogStoreError {
    #[error("Failed to open session log {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write session log: {0}")]
    Write(std::io::Error),
    #[error("Failed to read session log: {0}")]
    Read(std::io::Error),
}

pub struct LogStore {
    path: PathBuf,
    /// Opened (and truncated) on first write or reset
    file: Option<File>,
    lines: u64,
}

impl LogStore {
    /// A store for `path` that leaves the file alone until first written
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
            lines: 0,
        }
    }

    /// Open the log at `path`, truncating any previous session
    pub async fn create(path: &Path) -> Result<Self, LogStoreError> {
        let mut store = Self::new(path);
        store.reset().await?;
        Ok(store)
    }

    pub fn total_lines(&self) -> u64 {
        self.lines
    }

    /// Append one line and return its line number
    pub async fn append(&mut self, line: &str) -> Result<u64, LogStoreError> {
        let mut buf = String::with_capacity(line.len() + 1);
        // Stored lines must stay one-per-row
        for c in line.chars() {
            buf.push(if c == '\n' || c == '\r' { ' ' } else { c });
        }
        buf.push('\n');

        let file = match self.file.take() {
            Some(file) => file,
            None => open_truncated(&self.path).await?,
        };
        let file = self.file.insert(file);
        file.write_all(buf.as_bytes()).await.map_err(LogStoreError::Write)?;
        // Readers open their own handle
        file.flush().await.map_err(LogStoreError::Write)?;

        let number = self.lines;
        self.lines += 1;
        Ok(number)
    }

    /// Truncate the file and restart numbering at zero
    pub async fn reset(&mut self) -> Result<(), LogStoreError> {
        self.file = Some(open_truncated(&self.path).await?);
        self.lines = 0;
        Ok(())
    }

    /// Lines `from..to` (end exclusive, clamped to what has been written)
    pub async fn read_range(&self, from: u64, to: u64) -> Result<Vec<String>, LogStoreError> {
        let to = to.min(self.lines);
        if from >= to {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path).await.map_err(LogStoreError::Read)?;
        let mut lines = BufReader::new(file).lines();
        let mut out = Vec::with_capacity((to - from) as usize);
        let mut index = 0u64;
        while index < to {
            let Some(line) = lines.next_line().await.map_err(LogStoreError::Read)? else {
                break;
            };
            if index >= from {
                out.push(line);
            }
            index += 1;
        }
        Ok(out)
    }
}

async fn open_truncated(path: &Path) -> Result<File, LogStoreError> {
    let open_error = |source| LogStoreError::Open {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(open_error)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(open_error)?;
    file.set_len(0).await.map_err(open_error)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_numbers_from_zero() {
        let dir = TempDir::new().unwrap();
        let mut store = LogStore::create(&dir.path().join("vpn.log")).await.unwrap();

        assert_eq!(store.append("first").await.unwrap(), 0);
        assert_eq!(store.append("second").await.unwrap(), 1);
        assert_eq!(store.total_lines(), 2);
    }

    #[tokio::test]
    async fn test_range_returns_all_lines_in_order() {
        let dir = TempDir::new().unwrap();
        let mut store = LogStore::create(&dir.path().join("vpn.log")).await.unwrap();
        let lines: Vec<String> = (0..25).map(|i| format!("line {}", i)).collect();
        for l in &lines {
            store.append(l).await.unwrap();
        }

        let got = store.read_range(0, 25).await.unwrap();
        assert_eq!(got, lines);
    }

    #[tokio::test]
    async fn test_range_is_clamped() {
        let dir = TempDir::new().unwrap();
        let mut store = LogStore::create(&dir.path().join("vpn.log")).await.unwrap();
        for i in 0..5 {
            store.append(&format!("l{}", i)).await.unwrap();
        }

        assert_eq!(store.read_range(3, 100).await.unwrap(), vec!["l3", "l4"]);
        assert!(store.read_range(5, 10).await.unwrap().is_empty());
        assert!(store.read_range(4, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_embedded_newlines_do_not_split_rows() {
        let dir = TempDir::new().unwrap();
        let mut store = LogStore::create(&dir.path().join("vpn.log")).await.unwrap();
        store.append("a\nb").await.unwrap();
        store.append("c").await.unwrap();

        assert_eq!(store.read_range(0, 2).await.unwrap(), vec!["a b", "c"]);
    }

    #[tokio::test]
    async fn test_reset_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vpn.log");
        let mut store = LogStore::create(&path).await.unwrap();
        store.append("old").await.unwrap();
        store.reset().await.unwrap();

        assert_eq!(store.total_lines(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
        assert_eq!(store.append("new").await.unwrap(), 0);
        assert_eq!(store.read_range(0, 1).await.unwrap(), vec!["new"]);
    }

    #[tokio::test]
    async fn test_new_leaves_existing_file_until_written() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vpn.log");
        std::fs::write(&path, "other daemon\n").unwrap();

        let mut store = LogStore::new(&path);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "other daemon\n");
        assert!(store.read_range(0, 10).await.unwrap().is_empty());

        assert_eq!(store.append("ours").await.unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ours\n");
    }

    #[tokio::test]
    async fn test_create_discards_previous_session() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vpn.log");
        std::fs::write(&path, "stale\nlines\n").unwrap();

        let store = LogStore::create(&path).await.unwrap();
        assert_eq!(store.total_lines(), 0);
        assert!(store.read_range(0, 10).await.unwrap().is_empty());
    }
}
