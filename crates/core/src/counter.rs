//! Cohort counting with privacy masking and a QueryId result cache.

use crate::compiler::PanelCompiler;
use crate::executor::{CohortExecutor, ExecutionError, ExecutionErrorKind};
use crate::model::{GlobalPanelFilter, PatientCount, QueryId, ResolvedQuery};
use crate::obfuscation::Obfuscator;
use crate::resolver::localise;
use crate::user::UserContext;
use crate::{hashing, wire, LeafResult};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

/// Raw outcome kept per QueryId. Masking is re-applied per request so that the cached
/// entry never depends on who asked first.
#[derive(Debug, Clone)]
struct CachedCount {
    fingerprint: String,
    raw: u64,
    sql_statements: Vec<String>,
}

pub struct CohortCounter {
    compiler: PanelCompiler,
    executor: Arc<dyn CohortExecutor>,
    obfuscator: Obfuscator,
    timeout: Duration,
    cache: Mutex<LruCache<QueryId, CachedCount>>,
}

impl CohortCounter {
    pub fn new(
        compiler: PanelCompiler,
        executor: Arc<dyn CohortExecutor>,
        obfuscator: Obfuscator,
        timeout: Duration,
        cache_capacity: NonZeroUsize,
    ) -> Self {
        Self {
            compiler,
            executor,
            obfuscator,
            timeout,
            cache: Mutex::new(LruCache::new(cache_capacity)),
        }
    }

    pub fn compiler(&self) -> &PanelCompiler {
        &self.compiler
    }

    pub fn obfuscator(&self) -> &Obfuscator {
        &self.obfuscator
    }

    /// Compile, execute and mask a resolved query.
    ///
    /// A query with a QueryId whose logic matches the cached entry is answered from the
    /// cache with `cached` set, without compiling or executing anything.
    ///
    /// # Errors
    ///
    /// Returns `LeafError::Validation`/`LeafError::Dialect` when the query cannot be
    /// compiled and `LeafError::Execution` when the backend fails or the timeout elapses.
    pub async fn count(
        &self,
        user: &UserContext,
        query: &ResolvedQuery,
        global_filters: &[GlobalPanelFilter],
    ) -> LeafResult<PatientCount> {
        let fingerprint = fingerprint(query, global_filters)?;

        if let Some(id) = query.query_id {
            let hit = self
                .cache
                .lock()
                .get(&id)
                .filter(|entry| entry.fingerprint == fingerprint)
                .cloned();
            if let Some(entry) = hit {
                tracing::debug!(query_id = %id, "count served from cache");
                return Ok(self.present(user, query, entry.raw, entry.sql_statements, true));
            }
        }

        let compiled = self.compiler.compile(query, global_filters)?;
        let patients = match tokio::time::timeout(self.timeout, self.executor.execute(&compiled)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::error!(
                    dialect = %compiled.dialect(),
                    timeout_secs = self.timeout.as_secs(),
                    "cohort execution timed out"
                );
                return Err(ExecutionError::new(ExecutionErrorKind::Timeout).into());
            }
        };
        let raw = u64::try_from(patients.len()).unwrap_or(u64::MAX);
        let sql_statements = compiled.statement_texts();

        if let Some(id) = query.query_id {
            self.cache.lock().put(
                id,
                CachedCount {
                    fingerprint,
                    raw,
                    sql_statements: sql_statements.clone(),
                },
            );
        }
        Ok(self.present(user, query, raw, sql_statements, false))
    }

    fn present(
        &self,
        user: &UserContext,
        query: &ResolvedQuery,
        raw: u64,
        sql_statements: Vec<String>,
        cached: bool,
    ) -> PatientCount {
        let concept_ids: Vec<_> = query.concepts().into_iter().map(|c| c.id).collect();
        let masked = self
            .obfuscator
            .obfuscate(raw, &concept_ids, user.sees_exact_counts());
        PatientCount {
            value: masked.value,
            plus_minus: masked.plus_minus,
            within_low_cell_threshold: masked.within_low_cell_threshold,
            sql_statements: if user.is_admin() {
                sql_statements
            } else {
                Vec::new()
            },
            cached,
        }
    }
}

/// Cache key material: the query's logic plus the global filters it ran with.
fn fingerprint(query: &ResolvedQuery, global_filters: &[GlobalPanelFilter]) -> LeafResult<String> {
    let definition = wire::v1::fingerprint(&localise(query))?;
    let mut filters: Vec<String> = global_filters.iter().map(|f| f.id.to_string()).collect();
    filters.sort();
    Ok(hashing::versioned_hash(
        std::iter::once(definition).chain(filters),
    ))
}
