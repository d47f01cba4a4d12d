//! Execution of compiled programs against a relational backend.
//!
//! Backend failures are classified before they leave this module; the raw backend message
//! is logged server-side and never reaches a client.

use crate::compiler::CompiledQuery;
use crate::dialect::dialect_for;
use crate::{LeafError, LeafResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, ToSql};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    Permission,
    Timeout,
    Syntax,
    Cancelled,
    Other,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionErrorKind::Permission => "permission denied",
            ExecutionErrorKind::Timeout => "timed out",
            ExecutionErrorKind::Syntax => "invalid SQL",
            ExecutionErrorKind::Cancelled => "cancelled",
            ExecutionErrorKind::Other => "backend error",
        };
        f.write_str(name)
    }
}

/// A classified backend failure. Carries no backend text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("query execution failed: {kind}")]
pub struct ExecutionError {
    kind: ExecutionErrorKind,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> ExecutionErrorKind {
        self.kind
    }
}

/// Runs a compiled program and returns the distinct qualifying patient ids.
#[async_trait]
pub trait CohortExecutor: Send + Sync {
    async fn execute(&self, query: &CompiledQuery) -> Result<HashSet<String>, ExecutionError>;
}

/// Log a failed execution with parameter values redacted.
pub fn log_execution_failure(query: &CompiledQuery, kind: ExecutionErrorKind, detail: &str) {
    let parameters: Vec<&str> = query.parameters().iter().map(|p| p.name.as_str()).collect();
    tracing::error!(
        dialect = %query.dialect(),
        kind = %kind,
        statements = query.statements().len() + 1,
        parameters = ?parameters,
        "cohort execution failed (parameter values redacted): {}",
        detail
    );
}

// ==================== SQLite ====================

/// Virtual machine steps between cancellation checks.
const PROGRESS_OPS: i32 = 1_000;

/// Embedded executor over a single SQLite connection.
///
/// Expects programs compiled for the SQLite dialect; the executor binds parameters by their
/// dialect marker.
pub struct SqliteExecutor {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteExecutor {
    pub fn open(path: &Path) -> LeafResult<Self> {
        let connection =
            Connection::open(path).map_err(|e| LeafError::Storage(e.to_string()))?;
        Ok(Self::from_connection(connection))
    }

    pub fn from_connection(connection: Connection) -> Self {
        Self {
            connection: Arc::new(Mutex::new(connection)),
        }
    }

    /// Run setup statements such as a fixture schema.
    pub fn execute_batch(&self, sql: &str) -> LeafResult<()> {
        self.connection
            .lock()
            .execute_batch(sql)
            .map_err(|e| LeafError::Storage(e.to_string()))
    }
}

/// Cancellation flag shared with the statement's progress handler.
#[derive(Default)]
struct RunState {
    cancelled: AtomicBool,
}

impl RunState {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Cancels the statement if the awaiting future is dropped before it completes.
///
/// The running statement polls the flag itself, so there is no window in which a
/// cancellation can land between the check and the start of execution.
struct CancelOnDrop {
    state: Arc<RunState>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.state.cancelled.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl CohortExecutor for SqliteExecutor {
    async fn execute(&self, query: &CompiledQuery) -> Result<HashSet<String>, ExecutionError> {
        let sql = query.sql();
        let dialect = dialect_for(query.dialect());
        let bound: Vec<(String, f64)> = query
            .parameters()
            .iter()
            .map(|p| (dialect.param_marker(&p.name), p.value))
            .collect();

        let state = Arc::new(RunState::default());
        let mut guard = CancelOnDrop {
            state: Arc::clone(&state),
            armed: true,
        };

        let connection = Arc::clone(&self.connection);
        let outcome = tokio::task::spawn_blocking(move || {
            let connection = connection.lock();
            if state.is_cancelled() {
                return Err(None);
            }
            run_sqlite(&connection, &state, &sql, &bound).map_err(Some)
        })
        .await;
        guard.armed = false;

        match outcome {
            Ok(Ok(ids)) => Ok(ids),
            Ok(Err(None)) => Err(ExecutionError::new(ExecutionErrorKind::Cancelled)),
            Ok(Err(Some(e))) => {
                let kind = classify_sqlite(&e);
                log_execution_failure(query, kind, &e.to_string());
                Err(ExecutionError::new(kind))
            }
            Err(join) => {
                log_execution_failure(query, ExecutionErrorKind::Other, &join.to_string());
                Err(ExecutionError::new(ExecutionErrorKind::Other))
            }
        }
    }
}

/// Run `sql` with a progress handler that aborts once `state` is cancelled.
fn run_sqlite(
    connection: &Connection,
    state: &Arc<RunState>,
    sql: &str,
    bound: &[(String, f64)],
) -> Result<HashSet<String>, rusqlite::Error> {
    let watched = Arc::clone(state);
    connection.progress_handler(PROGRESS_OPS, Some(move || watched.is_cancelled()));
    let result = query_ids(connection, sql, bound);
    connection.progress_handler(0, None::<fn() -> bool>);
    result
}

fn query_ids(
    connection: &Connection,
    sql: &str,
    bound: &[(String, f64)],
) -> Result<HashSet<String>, rusqlite::Error> {
    let mut statement = connection.prepare(sql)?;
    let named: Vec<(&str, &dyn ToSql)> = bound
        .iter()
        .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
        .collect();
    let rows = statement.query_map(named.as_slice(), |row| {
        Ok(match row.get_ref(0)? {
            ValueRef::Integer(i) => Some(i.to_string()),
            ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Real(r) => Some(r.to_string()),
            ValueRef::Null | ValueRef::Blob(_) => None,
        })
    })?;
    let mut ids = HashSet::new();
    for id in rows {
        if let Some(id) = id? {
            ids.insert(id);
        }
    }
    Ok(ids)
}

fn classify_sqlite(error: &rusqlite::Error) -> ExecutionErrorKind {
    match error {
        rusqlite::Error::SqliteFailure(failure, message) => {
            classify_failure(failure.code, message.as_deref())
        }
        // Prepare-time failures carry the parser message and offset.
        rusqlite::Error::SqlInputError { error, msg, .. } => {
            classify_failure(error.code, Some(msg.as_str()))
        }
        rusqlite::Error::InvalidParameterName(_) | rusqlite::Error::InvalidParameterCount(..) => {
            ExecutionErrorKind::Syntax
        }
        _ => ExecutionErrorKind::Other,
    }
}

fn classify_failure(code: ErrorCode, message: Option<&str>) -> ExecutionErrorKind {
    match code {
        ErrorCode::OperationInterrupted => ExecutionErrorKind::Cancelled,
        ErrorCode::PermissionDenied
        | ErrorCode::AuthorizationForStatementDenied
        | ErrorCode::ReadOnly => ExecutionErrorKind::Permission,
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => ExecutionErrorKind::Timeout,
        ErrorCode::Unknown
            if message.is_some_and(|m| m.contains("syntax error") || m.contains("no such")) =>
        {
            ExecutionErrorKind::Syntax
        }
        _ => ExecutionErrorKind::Other,
    }
}
