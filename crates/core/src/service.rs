//! Request-level orchestration: resolve, compile, count and, for federated queries, fan out.

use crate::counter::CohortCounter;
use crate::federation::{merge_total, FederatedCount, FederatedDispatcher};
use crate::model::{CountResponse, QueryDefinition, QueryId};
use crate::resolver::{federate, PreflightReport, Resolution, Resolver};
use crate::shrine::query_from_shrine;
use crate::shrine::wire::ShrineQueryDto;
use crate::user::UserContext;
use crate::wire::v1::QueryDefinitionDto;
use crate::{LeafError, LeafResult};
use std::sync::Arc;

pub struct CohortService {
    resolver: Resolver,
    counter: Arc<CohortCounter>,
    dispatcher: Option<FederatedDispatcher>,
}

impl CohortService {
    /// # Arguments
    ///
    /// * `resolver` - Concept lookup and preflight
    /// * `counter` - Local compile, execute and mask
    /// * `dispatcher` - Peer fan-out; `None` when this node does not federate
    pub fn new(
        resolver: Resolver,
        counter: Arc<CohortCounter>,
        dispatcher: Option<FederatedDispatcher>,
    ) -> Self {
        Self {
            resolver,
            counter,
            dispatcher,
        }
    }

    pub fn counter(&self) -> &CohortCounter {
        &self.counter
    }

    pub fn federates(&self) -> bool {
        self.dispatcher.is_some()
    }

    /// Resolve and count `definition` locally.
    ///
    /// A definition without a QueryId is given one, so the response can be cached and
    /// replayed.
    ///
    /// # Errors
    ///
    /// Preflight failures are not errors: they come back with `result` unset. Errors are
    /// store failures, validation and dialect rejections and execution failures.
    pub async fn compile_and_count(
        &self,
        user: &UserContext,
        mut definition: QueryDefinition,
    ) -> LeafResult<CountResponse> {
        let query_id = *definition.query_id.get_or_insert_with(QueryId::new);

        match self.resolver.resolve(user, definition).await? {
            Resolution::Failed(preflight) => Ok(CountResponse {
                query_id,
                preflight,
                result: None,
            }),
            Resolution::Resolved {
                query,
                global_filters,
                preflight,
            } => {
                let count = self.counter.count(user, &query, &global_filters).await?;
                tracing::info!(
                    user = user.name(),
                    query_id = %query_id,
                    cached = count.cached,
                    masked = count.within_low_cell_threshold,
                    "cohort counted"
                );
                Ok(CountResponse {
                    query_id,
                    preflight,
                    result: Some(count),
                })
            }
        }
    }

    /// Count locally and at every responder peer concurrently, then merge.
    ///
    /// # Errors
    ///
    /// Returns `LeafError::NotFederatable` if any concept lacks a URN, and the validation
    /// or dialect errors the local compile raises. Execution failures of the local count
    /// are reported in `local_error` and peer failures per site, not as errors.
    pub async fn federated_count(
        &self,
        user: &UserContext,
        mut definition: QueryDefinition,
    ) -> LeafResult<FederatedCount> {
        let query_id = *definition.query_id.get_or_insert_with(QueryId::new);
        let obfuscator = self.counter.obfuscator();

        let (query, global_filters, preflight) =
            match self.resolver.resolve(user, definition).await? {
                Resolution::Failed(preflight) => {
                    return Ok(FederatedCount {
                        query_id,
                        preflight,
                        local: None,
                        local_error: None,
                        sites: Vec::new(),
                        total: obfuscator.mask(0),
                    })
                }
                Resolution::Resolved {
                    query,
                    global_filters,
                    preflight,
                } => (query, global_filters, preflight),
            };

        let outgoing = QueryDefinitionDto::from(&federate(&query)?);
        let local = self.counter.count(user, &query, &global_filters);
        let (local, sites) = match &self.dispatcher {
            Some(dispatcher) => tokio::join!(local, dispatcher.dispatch(outgoing)),
            None => (local.await, Vec::new()),
        };
        let (local, local_error) = match local {
            Ok(count) => (Some(count), None),
            Err(LeafError::Execution(e)) => {
                tracing::warn!(
                    query_id = %query_id,
                    kind = %e.kind(),
                    "local count failed, merging peer counts only"
                );
                (None, Some(e.kind()))
            }
            Err(e) => return Err(e),
        };

        let total = merge_total(local.as_ref(), &sites, obfuscator);
        tracing::info!(
            user = user.name(),
            query_id = %query_id,
            sites = sites.len(),
            local_failed = local_error.is_some(),
            "federated cohort counted"
        );
        Ok(FederatedCount {
            query_id,
            preflight,
            local,
            local_error,
            sites,
            total,
        })
    }

    /// Resolve `definition` and re-express it with URN references only, ready to leave
    /// this node. A failed preflight is returned in place of the query.
    ///
    /// # Errors
    ///
    /// Returns `LeafError::NotFederatable` if any concept lacks a URN.
    pub async fn portable(
        &self,
        user: &UserContext,
        definition: QueryDefinition,
    ) -> LeafResult<Result<QueryDefinition, PreflightReport>> {
        match self.resolver.resolve(user, definition).await? {
            Resolution::Failed(preflight) => Ok(Err(preflight)),
            Resolution::Resolved { query, .. } => Ok(Ok(federate(&query)?)),
        }
    }

    /// Count a query received from a SHRINE network.
    ///
    /// # Errors
    ///
    /// Returns `LeafError::Shrine` when the query cannot be expressed as a Leaf query.
    pub async fn count_shrine_query(
        &self,
        user: &UserContext,
        query: &ShrineQueryDto,
    ) -> LeafResult<CountResponse> {
        let definition = query_from_shrine(query)?;
        self.compile_and_count(user, definition).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::compiler::{CompilerOptions, PanelCompiler};
    use crate::dialect::{dialect_for, SqlDialectKind};
    use crate::compiler::CompiledQuery;
    use crate::executor::tests::{ed_concept, fixture_executor, vip_concept};
    use crate::executor::{CohortExecutor, ExecutionError, ExecutionErrorKind};
    use crate::federation::{FederationError, PeerClient, PeerCount, PeerReply, SiteStatus};
    use crate::model::{
        Concept, JoinSequence, Panel, PanelFilter, PanelItem, RecencyFilter, ResourceRef,
        SubPanel,
    };
    use crate::network::{EndpointCache, NetworkEndpoint, NetworkValidator};
    use crate::obfuscation::{DeidentificationConfig, Obfuscator};
    use std::collections::HashSet;
    use crate::resolver::InMemoryConceptStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use leaf_types::LeafUrn;
    use std::num::NonZeroUsize;
    use std::time::Duration;
    use uuid::Uuid;

    pub(crate) fn with_urn(concept: Arc<Concept>, urn: &str) -> Concept {
        let mut concept = (*concept).clone();
        concept.urn = Some(LeafUrn::parse(urn).expect("should parse urn"));
        concept
    }

    pub(crate) struct Fixture {
        pub service: CohortService,
        pub ed: Concept,
        pub vip: Concept,
    }

    pub(crate) fn fixture(dispatcher: Option<FederatedDispatcher>) -> Fixture {
        fixture_over(Arc::new(fixture_executor()), dispatcher)
    }

    pub(crate) fn fixture_over(
        executor: Arc<dyn CohortExecutor>,
        dispatcher: Option<FederatedDispatcher>,
    ) -> Fixture {
        let ed = with_urn(ed_concept(), "urn:leaf:concept:visit:ed");
        let vip = with_urn(vip_concept(), "urn:leaf:concept:demographics:vip");
        let store = Arc::new(InMemoryConceptStore::new(
            vec![ed.clone(), vip.clone()],
            Vec::new(),
        ));
        let counter = CohortCounter::new(
            PanelCompiler::new(
                dialect_for(SqlDialectKind::Sqlite),
                CompilerOptions::default(),
            ),
            executor,
            Obfuscator::new(DeidentificationConfig::new(5, true, -3, 3).expect("valid config")),
            Duration::from_secs(5),
            NonZeroUsize::new(8).expect("non-zero"),
        );
        Fixture {
            service: CohortService::new(Resolver::new(store), Arc::new(counter), dispatcher),
            ed,
            vip,
        }
    }

    pub(crate) fn ed_minus_vip_by(ed: ResourceRef, vip: ResourceRef) -> QueryDefinition {
        QueryDefinition {
            query_id: None,
            panels: vec![Panel {
                include: true,
                date_boundary: None,
                sub_panels: vec![SubPanel {
                    include: true,
                    minimum_count: 1,
                    join_sequence: JoinSequence::Encounter,
                    items: vec![PanelItem {
                        concept: ed,
                        numeric_filter: None,
                        recency: RecencyFilter::None,
                    }],
                }],
            }],
            panel_filters: vec![PanelFilter {
                concept: vip,
                is_inclusion: false,
                is_active: true,
            }],
        }
    }

    fn researcher() -> UserContext {
        UserContext::builder("researcher", "leaf.uw.edu")
            .identified(true, true)
            .build()
    }

    #[tokio::test]
    async fn test_compile_and_count_ed_minus_vip_is_nine() {
        let fixture = fixture(None);
        let definition = ed_minus_vip_by(
            ResourceRef::by_id(fixture.ed.id),
            ResourceRef::by_id(fixture.vip.id),
        );

        let response = fixture
            .service
            .compile_and_count(&researcher(), definition)
            .await
            .expect("should count");

        assert!(response.preflight.ok());
        let result = response.result.expect("should carry a result");
        assert_eq!(result.value, 9);
        assert!(!result.within_low_cell_threshold);
        assert!(!result.cached);
    }

    #[tokio::test]
    async fn test_assigned_query_id_makes_repeat_cached() {
        let fixture = fixture(None);
        let definition = ed_minus_vip_by(
            ResourceRef::by_id(fixture.ed.id),
            ResourceRef::by_id(fixture.vip.id),
        );

        let first = fixture
            .service
            .compile_and_count(&researcher(), definition.clone())
            .await
            .expect("should count");
        let mut repeat = definition;
        repeat.query_id = Some(first.query_id);
        let second = fixture
            .service
            .compile_and_count(&researcher(), repeat)
            .await
            .expect("should count again");

        assert!(second.cached());
        assert_eq!(second.query_id, first.query_id);
        assert_eq!(
            second.result.map(|r| r.value),
            first.result.map(|r| r.value)
        );
    }

    #[tokio::test]
    async fn test_unresolved_concept_fails_preflight_without_counting() {
        let fixture = fixture(None);
        let definition = ed_minus_vip_by(
            ResourceRef::by_id(fixture.ed.id),
            ResourceRef::by_id(Uuid::new_v4()),
        );

        let response = fixture
            .service
            .compile_and_count(&researcher(), definition)
            .await
            .expect("preflight failure is not an error");
        assert!(!response.preflight.ok());
        assert!(response.result.is_none());
    }

    struct FixedPeer {
        value: u64,
    }

    #[async_trait]
    impl PeerClient for FixedPeer {
        async fn count(
            &self,
            endpoint: &NetworkEndpoint,
            definition: &QueryDefinitionDto,
        ) -> Result<PeerReply, FederationError> {
            let ids: Vec<&str> = definition
                .panels
                .iter()
                .flat_map(|p| p.sub_panels.iter())
                .flat_map(|s| s.panel_items.iter())
                .map(|i| i.resource.as_str())
                .collect();
            if ids.iter().any(|r| !r.starts_with("urn:leaf:")) {
                return Err(FederationError::Rejected("local id leaked".into()));
            }
            Ok(PeerReply {
                count: PeerCount {
                    value: self.value,
                    within_low_cell_threshold: false,
                },
                issuer: Some(endpoint.issuer.as_str().to_owned()),
            })
        }
    }

    struct TimedOutExecutor;

    #[async_trait]
    impl CohortExecutor for TimedOutExecutor {
        async fn execute(&self, _query: &CompiledQuery) -> Result<HashSet<String>, ExecutionError> {
            Err(ExecutionError::new(ExecutionErrorKind::Timeout))
        }
    }

    fn south_dispatcher(value: u64) -> FederatedDispatcher {
        let draft = crate::network::test_draft("South", "urn:leaf:iss:south");
        let endpoint = NetworkValidator::new(true)
            .validate(Uuid::new_v4(), &draft, Utc::now())
            .expect("should validate");
        let cache = Arc::new(EndpointCache::default());
        cache.overwrite(vec![endpoint]);
        FederatedDispatcher::new(Arc::new(FixedPeer { value }), cache, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_federated_count_merges_local_and_peer() {
        let fixture = fixture(Some(south_dispatcher(40)));
        let definition = ed_minus_vip_by(
            ResourceRef::by_id(fixture.ed.id),
            ResourceRef::by_id(fixture.vip.id),
        );

        let federated = fixture
            .service
            .federated_count(&researcher(), definition)
            .await
            .expect("should count");

        assert_eq!(federated.sites.len(), 1);
        assert_eq!(federated.sites[0].status, SiteStatus::Completed);
        assert_eq!(federated.local.map(|l| l.value), Some(9));
        assert_eq!(federated.local_error, None);
        assert_eq!(federated.total.value, 49);
    }

    #[tokio::test]
    async fn test_failed_local_count_keeps_peer_counts() {
        let fixture = fixture_over(Arc::new(TimedOutExecutor), Some(south_dispatcher(40)));
        let definition = ed_minus_vip_by(
            ResourceRef::by_id(fixture.ed.id),
            ResourceRef::by_id(fixture.vip.id),
        );

        let federated = fixture
            .service
            .federated_count(&researcher(), definition)
            .await
            .expect("a local execution failure should not fail the request");

        assert!(federated.local.is_none());
        assert_eq!(federated.local_error, Some(ExecutionErrorKind::Timeout));
        assert_eq!(federated.sites[0].status, SiteStatus::Completed);
        assert_eq!(federated.total.value, 40);

        let dto = crate::wire::v1::FederatedCountDto::from(&federated);
        assert_eq!(dto.local_error.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn test_failed_preflight_dispatches_nothing() {
        let fixture = fixture(Some(south_dispatcher(40)));
        let definition = ed_minus_vip_by(
            ResourceRef::by_id(fixture.ed.id),
            ResourceRef::by_id(Uuid::new_v4()),
        );

        let federated = fixture
            .service
            .federated_count(&researcher(), definition)
            .await
            .expect("preflight failure is not an error");

        assert!(!federated.preflight.ok());
        assert!(federated.sites.is_empty());
        assert!(federated.local.is_none());
        assert_eq!(federated.local_error, None);
        assert!(federated.total.within_low_cell_threshold);
        assert_eq!(federated.total.value, 5);
    }

    #[tokio::test]
    async fn test_portable_query_references_urns_only() {
        let fixture = fixture(None);
        let definition = ed_minus_vip_by(
            ResourceRef::by_id(fixture.ed.id),
            ResourceRef::by_id(fixture.vip.id),
        );

        let portable = fixture
            .service
            .portable(&researcher(), definition)
            .await
            .expect("should resolve")
            .expect("preflight should pass");
        let item = &portable.panels[0].sub_panels[0].items[0].concept;
        assert_eq!(item.id, None);
        assert_eq!(item.urn, fixture.ed.urn);
        assert_eq!(portable.panel_filters[0].concept.urn, fixture.vip.urn);
    }

    #[tokio::test]
    async fn test_federated_count_without_urns_is_rejected() {
        let fixture = fixture(None);
        let local_only = (*ed_concept()).clone();
        let store = Arc::new(InMemoryConceptStore::new(vec![local_only.clone()], Vec::new()));
        let service = CohortService::new(
            Resolver::new(store),
            Arc::clone(&fixture.service.counter),
            None,
        );
        let mut definition = ed_minus_vip_by(
            ResourceRef::by_id(local_only.id),
            ResourceRef::by_id(local_only.id),
        );
        definition.panel_filters.clear();

        let outcome = service.federated_count(&researcher(), definition).await;
        assert!(matches!(outcome, Err(crate::LeafError::NotFederatable(_))));
    }
}
