//! Embedded Runner - single-file SQLite engine
//!
//! Connections are opened read-only and drawn from a bounded pool. Each
//! statement runs on the blocking thread pool. On timeout, or when the caller
//! drops the execution future, the statement is interrupted and its connection
//! goes back to the pool when the worker exits.

use crate::config::{EmbeddedConfig, PoolConfig};
use crate::error::{BiError, Result};
use crate::warehouse::pool::BoundedPool;
use crate::warehouse::redact::Redactor;
use crate::warehouse::{ExecutionRequest, ExecutionResult, WarehouseRunner, WarehouseTarget};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct EmbeddedRunner {
    path: PathBuf,
    pool: BoundedPool<Connection>,
    redactor: Redactor,
}

impl EmbeddedRunner {
    pub fn new(config: &EmbeddedConfig, pool: &PoolConfig, redactor: Redactor) -> Self {
        let path = config.path.clone();
        let open_path = path.clone();
        let pool = BoundedPool::new(pool.size, pool.acquire_timeout, move || open_read_only(&open_path));
        Self { path, pool, redactor }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Interrupts the running statement unless disarmed first.
struct InterruptOnDrop {
    handle: InterruptHandle,
    armed: bool,
}

impl InterruptOnDrop {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if self.armed {
            debug!("Interrupting abandoned embedded statement");
            self.handle.interrupt();
        }
    }
}

fn open_read_only(path: &Path) -> Result<Connection> {
    if !path.exists() {
        return Err(BiError::Connection(format!(
            "embedded database not found at {}",
            path.display()
        )));
    }
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
        | OpenFlags::SQLITE_OPEN_URI;
    Connection::open_with_flags(path, flags)
        .map_err(|e| BiError::Connection(format!("failed to open {}: {}", path.display(), e)))
}

/// Map a SQLite failure onto the runner error taxonomy.
fn classify_sqlite(err: rusqlite::Error, timeout: Duration) -> BiError {
    if let rusqlite::Error::SqliteFailure(code, _) = &err {
        match code.code {
            ErrorCode::OperationInterrupted => return BiError::QueryTimeout(timeout),
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked => return BiError::Connection(err.to_string()),
            _ => {}
        }
    }
    BiError::Execution(err.to_string())
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<blob {} bytes>", bytes.len())),
    }
}

/// Run `sql`, reading at most `fetch` rows.
fn run_query(
    conn: &Connection,
    sql: &str,
    fetch: u64,
    timeout: Duration,
) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
    let mut stmt = conn.prepare(sql).map_err(|e| classify_sqlite(e, timeout))?;
    if !stmt.readonly() {
        return Err(BiError::Execution(
            "statement would modify the database".to_string(),
        ));
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = stmt.query([]).map_err(|e| classify_sqlite(e, timeout))?;
    let mut values = Vec::new();
    while (values.len() as u64) < fetch {
        let row = match rows.next().map_err(|e| classify_sqlite(e, timeout))? {
            Some(row) => row,
            None => break,
        };
        let mut record = Vec::with_capacity(width);
        for idx in 0..width {
            let cell = row.get_ref(idx).map_err(|e| classify_sqlite(e, timeout))?;
            record.push(value_to_json(cell));
        }
        values.push(record);
    }

    Ok((columns, values))
}

#[async_trait]
impl WarehouseRunner for EmbeddedRunner {
    fn target(&self) -> WarehouseTarget {
        WarehouseTarget::Embedded
    }

    async fn connect(&self) -> Result<()> {
        let conn = self.pool.acquire().await?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| BiError::Connection(self.redactor.redact(&e.to_string())))?;
        info!("Connected to embedded database at {}", self.path.display());
        Ok(())
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let started = Instant::now();
        let mut conn = self.pool.acquire().await?;
        let interrupt = InterruptOnDrop {
            handle: conn.get_interrupt_handle(),
            armed: true,
        };

        let sql = request.sql.clone();
        let fetch = request.row_limit.saturating_add(1);
        let timeout = request.timeout;
        debug!("Embedded execute (fetch {}): {}", fetch, sql);

        let worker = tokio::task::spawn_blocking(move || {
            let outcome = run_query(&conn, &sql, fetch, timeout);
            if matches!(outcome, Err(BiError::Connection(_))) {
                conn.discard();
            }
            outcome
        });

        let finished = tokio::time::timeout(timeout, worker).await;
        if finished.is_ok() {
            interrupt.disarm();
        } else {
            warn!("Embedded query exceeded {:?}, interrupting", timeout);
            drop(interrupt);
        }

        let (columns, values) = match finished {
            Ok(Ok(outcome)) => outcome.map_err(|e| match e {
                BiError::Execution(msg) => BiError::Execution(self.redactor.redact(&msg)),
                BiError::Connection(msg) => BiError::Connection(self.redactor.redact(&msg)),
                other => other,
            })?,
            Ok(Err(join_err)) => {
                return Err(BiError::Execution(format!("embedded worker failed: {}", join_err)))
            }
            Err(_) => return Err(BiError::QueryTimeout(timeout)),
        };

        let mut result =
            ExecutionResult::from_values(WarehouseTarget::Embedded, columns, values, started.elapsed());
        result.enforce_limit(request.row_limit);
        Ok(result)
    }

    async fn disconnect(&self) -> Result<()> {
        let closed = self.pool.drain();
        debug!("Closed {} idle embedded connections", closed);
        Ok(())
    }
}
