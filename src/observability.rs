//! Observability
//!
//! Tracing subscriber setup and the query log: one JSON line per answered
//! question, plus a bounded in-memory ring of the most recent entries.

use crate::error::{BiError, ErrorKind, Result};
use crate::warehouse::WarehouseTarget;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const RECENT_CAPACITY: usize = 100;

/// Install the global fmt subscriber. `RUST_LOG` overrides `level`.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{},sqlx=warn,hyper=warn,reqwest=warn", level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // A second init (tests, embedding binaries) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
    pub question: String,
    pub warehouse: WarehouseTarget,
    pub sql: Option<String>,
    pub attempts: u32,
    pub degraded: bool,
    /// `None` when the question was answered
    pub error: Option<ErrorKind>,
    pub row_count: Option<usize>,
    pub elapsed_ms: u64,
}

pub struct QueryLog {
    path: Option<PathBuf>,
    recent: Mutex<VecDeque<QueryLogEntry>>,
    capacity: usize,
}

impl QueryLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
            capacity: RECENT_CAPACITY,
        }
    }

    pub fn in_memory(capacity: usize) -> Self {
        Self {
            path: None,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Keep the entry in memory and append it to the file, if any.
    ///
    /// A failed file write is logged, never surfaced to the caller.
    pub fn record(&self, entry: QueryLogEntry) {
        if let Some(path) = &self.path {
            if let Err(e) = append_line(path, &entry) {
                warn!("Failed to append to query log {}: {}", path.display(), e);
            }
        }

        let mut recent = self.recent.lock();
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(entry);
    }

    /// Most recent entries, newest last.
    pub fn recent(&self) -> Vec<QueryLogEntry> {
        self.recent.lock().iter().cloned().collect()
    }
}

fn append_line(path: &Path, entry: &QueryLogEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BiError::Execution(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
    }
    let line = serde_json::to_string(entry)
        .map_err(|e| BiError::Execution(format!("Failed to serialize query log entry: {}", e)))?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| BiError::Execution(format!("Failed to open {}: {}", path.display(), e)))?;
    writeln!(file, "{}", line).map_err(|e| BiError::Execution(format!("Failed to write {}: {}", path.display(), e)))
}
