//! Asynchronous access log writer.
//!
//! Lines are queued with [`AccessLogWriter::puts`] and written by a background task, so request
//! handling never waits for the file system. The task keeps files open while they are in use,
//! flushes them every `flush_interval` and closes them after `close_after` without a new line.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AccessLogConfig;

/// One request in Apache combined log format.
///
/// The [`Display`](fmt::Display) implementation renders the line, followed by the quoted and
/// semicolon separated annotations, if there are any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub remote_addr: Option<IpAddr>,
    /// The Basic authentication user name, if the request carried one.
    pub user: Option<String>,
    pub time: DateTime<FixedOffset>,
    pub method: String,
    pub uri: String,
    pub version: String,
    pub status: u16,
    pub content_length: u64,
    pub referer: String,
    pub user_agent: String,
    pub annotations: Vec<String>,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remote_addr {
            Some(addr) => write!(f, "{addr}")?,
            None => f.write_str("-")?,
        }

        let user = match self.user.as_deref() {
            Some(user) if !user.is_empty() => user,
            _ => "-",
        };

        write!(
            f,
            " - {user} [{}] \"{} {} {}\" {} {} \"{}\" \"{}\"",
            self.time.format("%d/%b/%Y:%H:%M:%S %z"),
            self.method,
            self.uri,
            self.version,
            self.status,
            self.content_length,
            self.referer,
            self.user_agent,
        )?;

        if !self.annotations.is_empty() {
            write!(f, " \"{}\"", self.annotations.join(";"))?;
        }

        Ok(())
    }
}

type Line = (PathBuf, String);

#[derive(Debug)]
struct WorkerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Appends lines to log files from a background task.
#[derive(Debug)]
pub struct AccessLogWriter {
    queue: mpsc::UnboundedSender<Line>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl AccessLogWriter {
    /// Spawns the writer task on `runtime`.
    ///
    /// `close_after` and `flush_interval` are fixed for the lifetime of the writer.
    pub fn start(settings: &AccessLogConfig, runtime: &tokio::runtime::Handle) -> Self {
        let (queue, lines) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = runtime.spawn(run(
            settings.flush_interval,
            settings.close_after,
            lines,
            cancel.clone(),
        ));

        Self {
            queue,
            worker: Mutex::new(Some(WorkerHandle { cancel, task })),
        }
    }

    /// Queues `line` to be appended to the file at `path`.
    pub fn puts(&self, path: PathBuf, line: String) {
        if self.queue.send((path, line)).is_err() {
            tracing::warn!("Access log writer is not running, dropping line");
        }
    }

    /// Writes all queued lines, closes all files and stops the writer task.
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().unwrap().take();
        if let Some(WorkerHandle { cancel, task }) = worker {
            cancel.cancel();
            if let Err(error) = task.await {
                let error: &dyn std::error::Error = &error;
                tracing::error!(error, "Access log writer failed");
            }
        }
    }
}

impl Drop for AccessLogWriter {
    fn drop(&mut self) {
        if let Ok(Some(worker)) = self.worker.get_mut() {
            worker.cancel.cancel();
        }
    }
}

async fn run(
    flush_interval: Duration,
    close_after: Duration,
    mut lines: mpsc::UnboundedReceiver<Line>,
    cancel: CancellationToken,
) {
    let mut files = OpenFiles::default();
    let mut next_flush = Instant::now() + flush_interval;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(next_flush) => {
                files.flush().await;
                files.close_idle(close_after).await;
                next_flush = Instant::now() + flush_interval;
            }
            line = lines.recv() => match line {
                Some((path, line)) => files.write(path, &line).await,
                None => break,
            },
        }
    }

    while let Ok((path, line)) = lines.try_recv() {
        files.write(path, &line).await;
    }
    files.close_all().await;
}

#[derive(Debug)]
struct LogFile {
    /// `None` if the file could not be opened. Lines for it are dropped until it is closed.
    writer: Option<BufWriter<File>>,
    last_used: Instant,
}

#[derive(Debug, Default)]
struct OpenFiles {
    files: HashMap<PathBuf, LogFile>,
}

impl OpenFiles {
    async fn write(&mut self, path: PathBuf, line: &str) {
        let now = Instant::now();
        let file = match self.files.entry(path) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let writer = open(entry.key()).await;
                entry.insert(LogFile {
                    writer,
                    last_used: now,
                })
            }
        };

        let Some(writer) = file.writer.as_mut() else {
            return;
        };
        file.last_used = now;

        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await
        }
        .await;

        if let Err(error) = result {
            let error: &dyn std::error::Error = &error;
            tracing::warn!(error, "Failed to write access log line");
        }
    }

    async fn flush(&mut self) {
        for (path, file) in &mut self.files {
            if let Some(writer) = file.writer.as_mut() {
                if let Err(error) = writer.flush().await {
                    tracing::warn!(path = %path.display(), %error, "Failed to flush access log");
                }
            }
        }
    }

    /// Closes all files that received no line for `close_after`.
    async fn close_idle(&mut self, close_after: Duration) {
        let now = Instant::now();
        let idle: Vec<_> = self
            .files
            .iter()
            .filter(|(_, file)| now.saturating_duration_since(file.last_used) >= close_after)
            .map(|(path, _)| path.clone())
            .collect();

        for path in idle {
            if let Some(file) = self.files.remove(&path) {
                close(&path, file).await;
            }
        }
    }

    async fn close_all(&mut self) {
        for (path, file) in self.files.drain() {
            close(&path, file).await;
        }
    }

    fn len(&self) -> usize {
        self.files.len()
    }
}

async fn open(path: &Path) -> Option<BufWriter<File>> {
    if let Some(dir) = path.parent() {
        if let Err(error) = tokio::fs::create_dir_all(dir).await {
            tracing::warn!(path = %dir.display(), %error, "Failed to create access log directory");
            return None;
        }
    }

    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(BufWriter::new(file)),
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "Failed to open access log");
            None
        }
    }
}

async fn close(path: &Path, file: LogFile) {
    if let Some(mut writer) = file.writer {
        if let Err(error) = writer.shutdown().await {
            tracing::warn!(path = %path.display(), %error, "Failed to close access log");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::TimeZone;

    use super::*;

    fn line() -> LogLine {
        let offset = FixedOffset::east_opt(9 * 3600).unwrap();
        LogLine {
            remote_addr: Some("127.0.0.1".parse().unwrap()),
            user: None,
            time: offset.with_ymd_and_hms(2011, 5, 4, 13, 2, 1).unwrap(),
            method: "GET".to_owned(),
            uri: "/tf2/maps/a.bsp?x=1".to_owned(),
            version: "HTTP/1.1".to_owned(),
            status: 200,
            content_length: 1234,
            referer: String::new(),
            user_agent: "Valve/Steam HTTP Client 1.0".to_owned(),
            annotations: Vec::new(),
        }
    }

    #[test]
    fn test_combined_format() {
        assert_eq!(
            line().to_string(),
            "127.0.0.1 - - [04/May/2011:13:02:01 +0900] \"GET /tf2/maps/a.bsp?x=1 HTTP/1.1\" \
             200 1234 \"\" \"Valve/Steam HTTP Client 1.0\""
        );
    }

    #[test]
    fn test_user_and_annotations() {
        let line = LogLine {
            user: Some("admin".to_owned()),
            status: 302,
            content_length: 0,
            annotations: vec![
                "[WARN] cache error [cache full] (/a)".to_owned(),
                "[INFO] redirect to: http://foo.com/a".to_owned(),
            ],
            ..line()
        };
        let rendered = line.to_string();

        assert!(rendered.starts_with("127.0.0.1 - admin [04/May/2011"));
        assert!(rendered.ends_with(
            " 302 0 \"\" \"Valve/Steam HTTP Client 1.0\" \
             \"[WARN] cache error [cache full] (/a);[INFO] redirect to: http://foo.com/a\""
        ));
    }

    #[test]
    fn test_empty_user() {
        let line = LogLine {
            user: Some(String::new()),
            remote_addr: None,
            ..line()
        };
        assert!(line.to_string().starts_with("- - - ["));
    }

    #[tokio::test]
    async fn test_writer_appends_lines() {
        mirrorgate_test::setup();
        let dir = mirrorgate_test::tempdir();
        let first = dir.path().join("logs/first.log");
        let second = dir.path().join("logs/second.log");
        fs::create_dir_all(dir.path().join("logs")).unwrap();
        fs::write(&first, "existing\n").unwrap();

        let settings = AccessLogConfig {
            dir: dir.path().join("logs"),
            flush_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let writer = AccessLogWriter::start(&settings, &tokio::runtime::Handle::current());
        writer.puts(first.clone(), "one".to_owned());
        writer.puts(second.clone(), "two".to_owned());
        writer.puts(first.clone(), "three".to_owned());
        writer.shutdown().await;

        assert_eq!(fs::read_to_string(&first).unwrap(), "existing\none\nthree\n");
        assert_eq!(fs::read_to_string(&second).unwrap(), "two\n");

        // Lines queued after shutdown are dropped.
        writer.puts(first.clone(), "four".to_owned());
        assert_eq!(fs::read_to_string(&first).unwrap(), "existing\none\nthree\n");
    }

    #[tokio::test]
    async fn test_close_idle_files() {
        let dir = mirrorgate_test::tempdir();
        let path = dir.path().join("nested/dir/access.log");

        let mut files = OpenFiles::default();
        files.write(path.clone(), "line").await;
        assert_eq!(files.len(), 1);

        files.close_idle(Duration::from_secs(60)).await;
        assert_eq!(files.len(), 1);

        files.close_idle(Duration::ZERO).await;
        assert_eq!(files.len(), 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), "line\n");
    }

    #[tokio::test]
    async fn test_unopenable_file() {
        let dir = mirrorgate_test::tempdir();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();

        // A regular file cannot be used as a directory.
        let path = blocker.join("access.log");
        let mut files = OpenFiles::default();
        files.write(path.clone(), "dropped").await;
        files.write(path.clone(), "dropped").await;
        files.close_all().await;

        assert!(!path.exists());
        assert_eq!(files.len(), 0);
    }
}
