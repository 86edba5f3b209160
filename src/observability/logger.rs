use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::config::ActivityLogConfig;
use crate::error::{ProxyError, Result as ProxyResult};
use crate::gate::VisitorIdentity;

/// Outcome of one proxy attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Success,
    Blocked,
    Error,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Success => "success",
            ActivityStatus::Blocked => "blocked",
            ActivityStatus::Error => "error",
        }
    }
}

/// One append-only record per proxy attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityLogEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub ip: String,
    pub fingerprint: Option<String>,
    pub url: String,
    pub status: ActivityStatus,
    pub response_status: Option<u16>,
    pub reason: Option<String>,
    pub duration_ms: u64,
}

/// Sink for proxy attempt outcomes.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn log_attempt(&self, entry: ActivityLogEntry) -> ProxyResult<()>;
}

/// Writes activity entries as JSON lines to stdout or an append-only file.
pub struct ActivityLogger {
    config: ActivityLogConfig,
    file_writer: Option<Arc<RwLock<tokio::fs::File>>>,
    statistics: Arc<RwLock<LoggerStatistics>>,
}

#[derive(Debug, Default)]
struct LoggerStatistics {
    total_entries: u64,
    success_entries: u64,
    blocked_entries: u64,
    error_entries: u64,
    write_errors: u64,
}

impl ActivityLogger {
    pub fn new(config: &ActivityLogConfig) -> Result<Self> {
        let file_writer = match (config.enabled, config.output.as_str(), &config.file_path) {
            (true, "file", Some(path)) => Some(Arc::new(RwLock::new(Self::create_log_writer(path)?))),
            _ => None,
        };

        Ok(Self {
            config: config.clone(),
            file_writer,
            statistics: Arc::new(RwLock::new(LoggerStatistics::default())),
        })
    }

    fn create_log_writer(output_path: &str) -> Result<tokio::fs::File> {
        let parent = std::path::Path::new(output_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(std::path::Path::new("."));
        std::fs::create_dir_all(parent)?;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(output_path)?;

        Ok(tokio::fs::File::from_std(file))
    }

    async fn write_line(&self, writer: &Arc<RwLock<tokio::fs::File>>, line: &str) -> ProxyResult<()> {
        let mut file = writer.write().await;
        // tokio buffers file writes, so failures often surface on flush.
        let written = match file.write_all(line.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.statistics.write().await.write_errors += 1;
            return Err(ProxyError::Io(e));
        }
        Ok(())
    }

    /// Get logger statistics
    pub async fn get_statistics(&self) -> Value {
        let stats = self.statistics.read().await;

        json!({
            "enabled": self.config.enabled,
            "output": self.config.output,
            "statistics": {
                "total_entries": stats.total_entries,
                "success_entries": stats.success_entries,
                "blocked_entries": stats.blocked_entries,
                "error_entries": stats.error_entries,
                "write_errors": stats.write_errors,
            },
        })
    }
}

#[async_trait]
impl ActivityLog for ActivityLogger {
    async fn log_attempt(&self, entry: ActivityLogEntry) -> ProxyResult<()> {
        if !self.config.enabled {
            return Ok(());
        }

        {
            let mut stats = self.statistics.write().await;
            stats.total_entries += 1;
            match entry.status {
                ActivityStatus::Success => stats.success_entries += 1,
                ActivityStatus::Blocked => stats.blocked_entries += 1,
                ActivityStatus::Error => stats.error_entries += 1,
            }
        }

        let line = format!("{}\n", serde_json::to_string(&entry)?);
        match &self.file_writer {
            Some(writer) => self.write_line(writer, &line).await,
            None => {
                print!("{}", line);
                Ok(())
            }
        }
    }
}

/// Holds the obligation to record exactly one outcome for a request.
///
/// If the request future is dropped before [`AttemptGuard::record`] runs
/// (the visitor disconnected), the attempt is logged as an error with reason
/// `cancelled` from a spawned task.
pub struct AttemptGuard {
    log: Arc<dyn ActivityLog>,
    pending: Option<ActivityLogEntry>,
    started: Instant,
}

impl AttemptGuard {
    pub fn new(
        log: Arc<dyn ActivityLog>,
        request_id: &str,
        identity: &VisitorIdentity,
        url: &str,
    ) -> Self {
        let pending = ActivityLogEntry {
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
            ip: identity.ip.to_string(),
            fingerprint: identity.fingerprint.clone(),
            url: url.to_string(),
            status: ActivityStatus::Error,
            response_status: None,
            reason: None,
            duration_ms: 0,
        };

        Self {
            log,
            pending: Some(pending),
            started: Instant::now(),
        }
    }

    pub async fn record(
        mut self,
        status: ActivityStatus,
        response_status: Option<u16>,
        reason: Option<String>,
    ) {
        let Some(mut entry) = self.pending.take() else {
            return;
        };
        entry.timestamp = Utc::now();
        entry.status = status;
        entry.response_status = response_status;
        entry.reason = reason;
        entry.duration_ms = self.started.elapsed().as_millis() as u64;

        debug!("Recording {} outcome for {}", status.as_str(), entry.url);
        if let Err(e) = self.log.log_attempt(entry).await {
            error!("Failed to write activity log entry: {}", e);
        }
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        let Some(mut entry) = self.pending.take() else {
            return;
        };
        entry.timestamp = Utc::now();
        entry.reason = Some("cancelled".to_string());
        entry.duration_ms = self.started.elapsed().as_millis() as u64;

        warn!("Request {} ended before an outcome was recorded", entry.request_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let log = self.log.clone();
                handle.spawn(async move {
                    if let Err(e) = log.log_attempt(entry).await {
                        error!("Failed to write activity log entry: {}", e);
                    }
                });
            }
            Err(_) => error!("No runtime available to record cancelled request"),
        }
    }
}

/// Collects entries in memory.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryActivityLog {
    entries: RwLock<Vec<ActivityLogEntry>>,
}

#[cfg(test)]
impl MemoryActivityLog {
    pub async fn entries(&self) -> Vec<ActivityLogEntry> {
        self.entries.read().await.clone()
    }
}

#[cfg(test)]
#[async_trait]
impl ActivityLog for MemoryActivityLog {
    async fn log_attempt(&self, entry: ActivityLogEntry) -> ProxyResult<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::time::Duration;

    fn visitor() -> VisitorIdentity {
        VisitorIdentity::new("192.0.2.10".parse::<IpAddr>().unwrap(), Some("fp".to_string()))
    }

    #[tokio::test]
    async fn test_file_output_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("activity.jsonl");
        let config = ActivityLogConfig {
            enabled: true,
            output: "file".to_string(),
            file_path: Some(path.to_string_lossy().into_owned()),
        };
        let logger: Arc<dyn ActivityLog> = Arc::new(ActivityLogger::new(&config).unwrap());

        AttemptGuard::new(logger.clone(), "req-1", &visitor(), "https://example.com/")
            .record(ActivityStatus::Success, Some(200), None)
            .await;
        AttemptGuard::new(logger.clone(), "req-2", &visitor(), "https://example.com/x")
            .record(ActivityStatus::Blocked, Some(403), None)
            .await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["status"], "success");
        assert_eq!(lines[0]["response_status"], 200);
        assert_eq!(lines[0]["fingerprint"], "fp");
        assert_eq!(lines[1]["status"], "blocked");
        assert_eq!(lines[1]["request_id"], "req-2");
    }

    #[tokio::test]
    async fn test_disabled_logger_counts_nothing() {
        let config = ActivityLogConfig {
            enabled: false,
            ..ActivityLogConfig::default()
        };
        let logger = ActivityLogger::new(&config).unwrap();
        let entry = ActivityLogEntry {
            timestamp: Utc::now(),
            request_id: "r".to_string(),
            ip: "192.0.2.1".to_string(),
            fingerprint: None,
            url: "https://example.com/".to_string(),
            status: ActivityStatus::Success,
            response_status: Some(200),
            reason: None,
            duration_ms: 1,
        };
        logger.log_attempt(entry).await.unwrap();
        assert_eq!(logger.get_statistics().await["statistics"]["total_entries"], 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_writes_are_counted() {
        let config = ActivityLogConfig {
            enabled: true,
            output: "file".to_string(),
            file_path: Some("/dev/full".to_string()),
        };
        let logger = ActivityLogger::new(&config).unwrap();
        let entry = ActivityLogEntry {
            timestamp: Utc::now(),
            request_id: "r".to_string(),
            ip: "192.0.2.1".to_string(),
            fingerprint: None,
            url: "https://example.com/".to_string(),
            status: ActivityStatus::Error,
            response_status: Some(500),
            reason: None,
            duration_ms: 1,
        };

        assert!(matches!(logger.log_attempt(entry).await, Err(ProxyError::Io(_))));
        let stats = logger.get_statistics().await;
        assert_eq!(stats["statistics"]["total_entries"], 1);
        assert_eq!(stats["statistics"]["write_errors"], 1);
    }

    #[tokio::test]
    async fn test_dropped_guard_logs_cancellation_once() {
        let memory = Arc::new(MemoryActivityLog::default());
        let guard = AttemptGuard::new(memory.clone(), "req-3", &visitor(), "https://example.com/");
        drop(guard);

        // The cancellation entry is written from a spawned task.
        for _ in 0..50 {
            if !memory.entries().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let entries = memory.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ActivityStatus::Error);
        assert_eq!(entries[0].reason.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_recorded_guard_does_not_log_again_on_drop() {
        let memory = Arc::new(MemoryActivityLog::default());
        AttemptGuard::new(memory.clone(), "req-4", &visitor(), "https://example.com/")
            .record(ActivityStatus::Error, Some(500), Some("timeout".to_string()))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let entries = memory.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason.as_deref(), Some("timeout"));
    }
}
