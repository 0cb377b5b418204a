use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::AccessLogConfig;

/// One line of the access log
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub client_ip: String,
    pub method: String,
    pub uri: String,
    pub status: u16,
    pub duration_ms: u64,
    pub class: &'static str,
    pub cache: Option<&'static str>,
    pub user_agent: Option<String>,
}

enum Sink {
    Stdout,
    File(Mutex<tokio::fs::File>),
}

/// Writes JSON access log lines to stdout or an append-mode file.
pub struct AccessLogger {
    sink: Option<Sink>,
    entries_written: AtomicU64,
    write_errors: AtomicU64,
}

impl AccessLogger {
    pub fn new(config: &AccessLogConfig) -> Result<Self> {
        let sink = if !config.enabled {
            None
        } else if config.output == "stdout" {
            Some(Sink::Stdout)
        } else {
            Some(Sink::File(Mutex::new(Self::create_log_writer(&config.output)?)))
        };

        Ok(Self {
            sink,
            entries_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        })
    }

    pub fn disabled() -> Self {
        Self {
            sink: None,
            entries_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        }
    }

    fn create_log_writer(output_path: &str) -> Result<tokio::fs::File> {
        let path = std::path::Path::new(output_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create access log directory for {}", output_path))?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open access log: {}", output_path))?;

        Ok(tokio::fs::File::from_std(file))
    }

    /// Record a completed request. Failures are counted, never returned.
    pub async fn log(&self, entry: &AccessLogEntry) {
        let Some(sink) = &self.sink else {
            return;
        };

        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize access log entry: {}", e);
                self.write_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match sink {
            Sink::Stdout => println!("{}", line),
            Sink::File(file) => {
                let mut file = file.lock().await;
                let result = async {
                    file.write_all(line.as_bytes()).await?;
                    file.write_all(b"\n").await?;
                    file.flush().await
                }
                .await;

                if let Err(e) = result {
                    warn!("Failed to write access log entry: {}", e);
                    self.write_errors.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }

        self.entries_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entries_written(&self) -> u64 {
        self.entries_written.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }
}
