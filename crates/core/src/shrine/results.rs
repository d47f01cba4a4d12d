use super::tags::ResultStatus;
use super::wire::{ResultProgressDto, UpdateQueryAtQepDto};
use crate::snapshot::Snapshot;
use std::collections::{BTreeMap, HashMap};

type ResultsByAdapter = BTreeMap<i64, ResultProgressDto>;

/// Latest result progress per SHRINE query and adapter node.
///
/// Results are stored as received, obfuscation parameters included.
#[derive(Default)]
pub struct ShrineResultCache {
    results: Snapshot<HashMap<i64, ResultsByAdapter>>,
    owners: Snapshot<HashMap<i64, String>>,
}

impl ShrineResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one adapter's progress, replacing any earlier report from the same adapter.
    pub fn put(&self, progress: ResultProgressDto) {
        tracing::debug!(
            query_id = progress.query_id,
            adapter = %progress.adapter_node_name,
            status = %progress.status.encoded_class,
            "SHRINE result progress"
        );
        self.results.rebuild(|current| {
            let mut next = current.clone();
            next.entry(progress.query_id)
                .or_default()
                .insert(progress.adapter_node_id, progress.clone());
            next
        });
    }

    pub fn apply_update(&self, update: UpdateQueryAtQepDto) {
        for progress in update.result_progresses {
            self.put(progress);
        }
    }

    pub fn get(&self, query_id: i64) -> Vec<ResultProgressDto> {
        self.results
            .load()
            .get(&query_id)
            .map(|by_adapter| by_adapter.values().cloned().collect())
            .unwrap_or_default()
    }

    /// True once every adapter heard from so far has reached a terminal status.
    pub fn is_settled(&self, query_id: i64) -> bool {
        let results = self.get(query_id);
        !results.is_empty()
            && results
                .iter()
                .all(|r| r.status.encoded_class.is_terminal())
    }

    /// Remember which user submitted `query_id` so only they can read its results.
    pub fn submitted(&self, query_id: i64, owner: impl Into<String>) {
        let owner = owner.into();
        self.owners.rebuild(|current| {
            let mut next = current.clone();
            next.insert(query_id, owner);
            next
        });
    }

    /// Results for a query submitted by `owner`.
    ///
    /// Returns `None` for unknown queries and for queries submitted by someone else.
    pub fn results_for(&self, query_id: i64, owner: &str) -> Option<Vec<ResultProgressDto>> {
        let owners = self.owners.load();
        match owners.get(&query_id) {
            Some(submitter) if submitter == owner => Some(self.get(query_id)),
            _ => None,
        }
    }

    pub fn remove(&self, query_id: i64) -> bool {
        self.owners.try_rebuild(|current| {
            let mut next = current.clone();
            next.remove(&query_id).map(|_| (next, ()))
        });
        self.results
            .try_rebuild(|current| {
                if !current.contains_key(&query_id) {
                    return None;
                }
                let mut next = current.clone();
                next.remove(&query_id);
                Some((next, ()))
            })
            .is_some()
    }
}

impl ResultProgressDto {
    pub fn status(&self) -> ResultStatus {
        self.status.encoded_class
    }
}
