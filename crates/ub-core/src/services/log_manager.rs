use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Duration};

/// One line of job output.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub job_id: String,
    pub line: String,
}

/// Collects textual output of managed jobs by tailing the files their
/// batch scripts write to (`<work_dir>/logs/<job_id>.out`).
pub struct LogManager {
    logs_dir: PathBuf,
    tailers: RwLock<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl LogManager {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            logs_dir: work_dir.join("logs"),
            tailers: RwLock::new(HashMap::new()),
        }
    }

    /// Attach to a job's output stream. The stream is infinite while the
    /// job writes, drains once it stops, and is not restartable — a second
    /// `attach` for the same job replaces the first tailer.
    pub async fn attach(&self, job_id: &str) -> mpsc::UnboundedReceiver<LogLine> {
        let (tx, rx) = mpsc::unbounded_channel();
        let path = self.logs_dir.join(format!("{job_id}.out"));
        let handle = spawn_tailer(path, job_id.to_string(), tx);
        let mut tailers = self.tailers.write().await;
        if let Some(old) = tailers.insert(job_id.to_string(), handle) {
            old.abort();
        }
        rx
    }

    /// Stop tailing a job's output.
    pub async fn detach(&self, job_id: &str) {
        if let Some(handle) = self.tailers.write().await.remove(job_id) {
            handle.abort();
        }
    }

    /// Last `line_count` lines of a job's output, for diagnostics.
    pub fn read_tail(&self, job_id: &str, line_count: usize) -> String {
        let path = self.logs_dir.join(format!("{job_id}.out"));
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let lines: Vec<&str> = content.lines().collect();
                let start = lines.len().saturating_sub(line_count);
                lines[start..].join("\n")
            }
            Err(_) => String::new(),
        }
    }
}

fn spawn_tailer(
    file_path: PathBuf,
    job_id: String,
    tx: mpsc::UnboundedSender<LogLine>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_position: u64 = 0;

        // The output file appears once the job starts writing.
        while !file_path.exists() {
            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let mut tick = interval(Duration::from_millis(250));
        loop {
            tick.tick().await;

            if let Ok(new_position) = read_new_content(&file_path, last_position, &job_id, &tx) {
                last_position = new_position;
            }

            if tx.is_closed() {
                break;
            }
        }
    })
}

fn read_new_content(
    path: &Path,
    last_position: u64,
    job_id: &str,
    tx: &mpsc::UnboundedSender<LogLine>,
) -> std::io::Result<u64> {
    let mut file = std::fs::OpenOptions::new().read(true).open(path)?;

    let metadata = file.metadata()?;
    if metadata.len() <= last_position {
        return Ok(last_position);
    }

    file.seek(SeekFrom::Start(last_position))?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    let new_position = file.stream_position()?;

    for line in content.lines() {
        if !line.is_empty() {
            let _ = tx.send(LogLine {
                job_id: job_id.to_string(),
                line: line.to_string(),
            });
        }
    }

    Ok(new_position)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attach_streams_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logs_dir = dir.path().join("logs");
        std::fs::create_dir_all(&logs_dir).unwrap();
        std::fs::write(logs_dir.join("12345678.out"), "first line\n").unwrap();

        let manager = LogManager::new(dir.path());
        let mut rx = manager.attach("12345678").await;

        let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for log line")
            .expect("channel closed");
        assert_eq!(line.job_id, "12345678");
        assert_eq!(line.line, "first line");

        manager.detach("12345678").await;
    }

    #[tokio::test]
    async fn read_tail_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logs_dir = dir.path().join("logs");
        std::fs::create_dir_all(&logs_dir).unwrap();
        std::fs::write(logs_dir.join("1.out"), "a\nb\nc\nd\n").unwrap();

        let manager = LogManager::new(dir.path());
        assert_eq!(manager.read_tail("1", 2), "c\nd");
        assert_eq!(manager.read_tail("1", 10), "a\nb\nc\nd");
        assert_eq!(manager.read_tail("missing", 5), "");
    }
}
