//! Durable session output.
//!
//! Every record is written to three overlapping targets:
//!
//! ```text
//! <root>/
//!   all-sessions.jsonl                 global stream, one record per line
//!   <YYYY>/<MM>/<DD>/<HH>h/
//!      session-<id>.json               pretty-printed, one file per session
//!      sessions-stream.jsonl           hour-scoped stream
//! ```
//!
//! Targets fail independently. A failure is logged and counted, the remaining
//! targets are still attempted and nothing is retried.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use rugs_common::SessionRecord;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::stats::CollectorStats;

/// Global stream file name.
pub const GLOBAL_STREAM_FILE: &str = "all-sessions.jsonl";

/// Hour-scoped stream file name.
pub const HOURLY_STREAM_FILE: &str = "sessions-stream.jsonl";

/// A storage target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    SessionFile,
    HourlyStream,
    GlobalStream,
}

impl WriteTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteTarget::SessionFile => "session_file",
            WriteTarget::HourlyStream => "hourly_stream",
            WriteTarget::GlobalStream => "global_stream",
        }
    }
}

impl std::fmt::Display for WriteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur while persisting a record.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("{target} write to {path:?} failed: {source}")]
    Io {
        target: WriteTarget,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of one [`PersistenceWriter::write`] call.
#[derive(Debug, Default)]
pub struct WriteReport {
    pub written: Vec<WriteTarget>,
    pub failed: Vec<PersistenceError>,
    pub bytes: u64,
}

impl WriteReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Writes session records under an output root.
pub struct PersistenceWriter {
    root: PathBuf,
    stats: Arc<CollectorStats>,
}

impl PersistenceWriter {
    pub fn new(root: impl Into<PathBuf>, stats: Arc<CollectorStats>) -> Self {
        Self {
            root: root.into(),
            stats,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hour bucket directory for wall-clock time `now`.
    pub fn hour_dir(&self, now: DateTime<Utc>) -> PathBuf {
        self.root.join(now.format("%Y/%m/%d/%Hh").to_string())
    }

    pub fn global_stream_path(&self) -> PathBuf {
        self.root.join(GLOBAL_STREAM_FILE)
    }

    /// Write `record` to all targets, bucketed by the current time.
    pub fn write(&self, record: &SessionRecord) -> WriteReport {
        self.write_at(record, Utc::now())
    }

    /// Write `record` to all targets, bucketed by `now`.
    pub fn write_at(&self, record: &SessionRecord, now: DateTime<Utc>) -> WriteReport {
        let mut report = WriteReport::default();

        let (pretty, line) = match serialize(record) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Session {}: {}", record.session_id, e);
                self.stats.persistence_errors.fetch_add(3, Ordering::Relaxed);
                report.failed.push(e);
                return report;
            }
        };

        let hour_dir = self.hour_dir(now);
        let session_path = hour_dir.join(session_file_name(&record.session_id));
        let hourly_path = hour_dir.join(HOURLY_STREAM_FILE);
        let global_path = self.global_stream_path();

        let attempts = [
            (WriteTarget::SessionFile, &session_path, write_file(&session_path, &pretty)),
            (WriteTarget::HourlyStream, &hourly_path, append_line(&hourly_path, &line)),
            (WriteTarget::GlobalStream, &global_path, append_line(&global_path, &line)),
        ];

        for (target, path, result) in attempts {
            match result {
                Ok(outcome) => {
                    if outcome.created {
                        self.stats.files_created.fetch_add(1, Ordering::Relaxed);
                    }
                    report.written.push(target);
                    report.bytes += outcome.bytes;
                }
                Err(source) => {
                    let err = PersistenceError::Io {
                        target,
                        path: path.clone(),
                        source,
                    };
                    warn!("Session {}: {}", record.session_id, err);
                    self.stats.persistence_errors.fetch_add(1, Ordering::Relaxed);
                    report.failed.push(err);
                }
            }
        }

        if !report.written.is_empty() {
            self.stats.records_written.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.bytes_written.fetch_add(report.bytes, Ordering::Relaxed);
        debug!(
            "Session {} persisted to {}/3 targets ({} bytes)",
            record.session_id,
            report.written.len(),
            report.bytes
        );

        report
    }
}

/// Bytes written and whether the file is new.
struct TargetWrite {
    bytes: u64,
    created: bool,
}

fn write_file(path: &Path, contents: &[u8]) -> std::io::Result<TargetWrite> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let created = !path.exists();
    fs::write(path, contents)?;
    Ok(TargetWrite {
        bytes: contents.len() as u64,
        created,
    })
}

fn append_line(path: &Path, line: &[u8]) -> std::io::Result<TargetWrite> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let created = !path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line)?;
    Ok(TargetWrite {
        bytes: line.len() as u64,
        created,
    })
}

/// Pretty document and newline-terminated stream line.
fn serialize(record: &SessionRecord) -> Result<(Vec<u8>, Vec<u8>), PersistenceError> {
    let pretty = serde_json::to_vec_pretty(record)?;
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok((pretty, line))
}

/// `session-<id>.json` with path-hostile characters replaced.
pub fn session_file_name(session_id: &str) -> String {
    let safe: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("session-{safe}.json")
}

/// Drain records into the writer in order until every sender is dropped.
///
/// Returns the number of records processed.
pub fn spawn_writer_task(
    writer: PersistenceWriter,
    mut records: mpsc::UnboundedReceiver<SessionRecord>,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut processed = 0u64;
        while let Some(record) = records.recv().await {
            writer.write(&record);
            processed += 1;
        }
        info!("Persistence writer drained ({} records)", processed);
        processed
    })
}
