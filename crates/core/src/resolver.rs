//! Concept resolution and preflight checks.
//!
//! A query only reaches the compiler once every reference in it resolves to a concept the
//! user may use. URNs take precedence over local ids; requests relayed by peers must use
//! URNs because local ids mean nothing across instances.

use crate::model::{Concept, GlobalPanelFilter, QueryDefinition, ResolvedQuery, ResourceRef};
use crate::snapshot::Snapshot;
use crate::user::UserContext;
use crate::{LeafError, LeafResult};
use async_trait::async_trait;
use leaf_types::LeafUrn;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// Persistence for concepts and global panel filters.
#[async_trait]
pub trait ConceptStore: Send + Sync {
    async fn concepts_by_id(&self, ids: &[Uuid]) -> LeafResult<Vec<Arc<Concept>>>;
    async fn concepts_by_urn(&self, urns: &[LeafUrn]) -> LeafResult<Vec<Arc<Concept>>>;
    async fn global_panel_filters(&self) -> LeafResult<Vec<GlobalPanelFilter>>;
}

#[derive(Debug, Default)]
struct ConceptIndex {
    by_id: HashMap<Uuid, Arc<Concept>>,
    by_urn: HashMap<LeafUrn, Arc<Concept>>,
    global_filters: Vec<GlobalPanelFilter>,
}

/// Concept store held in memory, replaceable as a whole when the catalog is reloaded.
#[derive(Debug, Default)]
pub struct InMemoryConceptStore {
    index: Snapshot<ConceptIndex>,
}

impl InMemoryConceptStore {
    pub fn new(concepts: Vec<Concept>, global_filters: Vec<GlobalPanelFilter>) -> Self {
        let store = Self::default();
        store.replace(concepts, global_filters);
        store
    }

    pub fn replace(&self, concepts: Vec<Concept>, global_filters: Vec<GlobalPanelFilter>) {
        let mut index = ConceptIndex {
            global_filters,
            ..ConceptIndex::default()
        };
        for concept in concepts {
            let concept = Arc::new(concept);
            if let Some(urn) = &concept.urn {
                index.by_urn.insert(urn.clone(), Arc::clone(&concept));
            }
            index.by_id.insert(concept.id, concept);
        }
        self.index.store(index);
    }
}

#[async_trait]
impl ConceptStore for InMemoryConceptStore {
    async fn concepts_by_id(&self, ids: &[Uuid]) -> LeafResult<Vec<Arc<Concept>>> {
        let index = self.index.load();
        Ok(ids
            .iter()
            .filter_map(|id| index.by_id.get(id).cloned())
            .collect())
    }

    async fn concepts_by_urn(&self, urns: &[LeafUrn]) -> LeafResult<Vec<Arc<Concept>>> {
        let index = self.index.load();
        Ok(urns
            .iter()
            .filter_map(|urn| index.by_urn.get(urn).cloned())
            .collect())
    }

    async fn global_panel_filters(&self) -> LeafResult<Vec<GlobalPanelFilter>> {
        Ok(self.index.load().global_filters.clone())
    }
}

/// Per-reference outcome of a preflight check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightCheck {
    pub reference: ResourceRef,
    pub is_present: bool,
    pub is_authorized: bool,
}

impl PreflightCheck {
    pub fn ok(&self) -> bool {
        self.is_present && self.is_authorized
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    pub checks: Vec<PreflightCheck>,
}

impl PreflightReport {
    pub fn ok(&self) -> bool {
        self.checks.iter().all(PreflightCheck::ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = &PreflightCheck> {
        self.checks.iter().filter(|c| !c.ok())
    }
}

#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved {
        query: ResolvedQuery,
        global_filters: Vec<GlobalPanelFilter>,
        preflight: PreflightReport,
    },
    Failed(PreflightReport),
}

#[derive(Clone)]
pub struct Resolver {
    store: Arc<dyn ConceptStore>,
}

impl Resolver {
    pub fn new(store: Arc<dyn ConceptStore>) -> Self {
        Self { store }
    }

    /// Check every reference and return the concepts that resolved.
    ///
    /// # Errors
    ///
    /// Returns an error only when the store itself fails; unresolved references are reported
    /// in the `PreflightReport`.
    pub async fn preflight(
        &self,
        user: &UserContext,
        references: &[ResourceRef],
    ) -> LeafResult<(PreflightReport, HashMap<ResourceRef, Arc<Concept>>)> {
        let distinct: BTreeSet<&ResourceRef> = references.iter().collect();

        let urns: Vec<LeafUrn> = distinct.iter().filter_map(|r| r.urn.clone()).collect();
        let ids: Vec<Uuid> = if user.is_federated() {
            Vec::new()
        } else {
            distinct
                .iter()
                .filter(|r| r.urn.is_none())
                .filter_map(|r| r.id)
                .collect()
        };

        let by_urn: HashMap<LeafUrn, Arc<Concept>> = if urns.is_empty() {
            HashMap::new()
        } else {
            self.store
                .concepts_by_urn(&urns)
                .await?
                .into_iter()
                .filter_map(|c| c.urn.clone().map(|urn| (urn, c)))
                .collect()
        };
        let by_id: HashMap<Uuid, Arc<Concept>> = if ids.is_empty() {
            HashMap::new()
        } else {
            self.store
                .concepts_by_id(&ids)
                .await?
                .into_iter()
                .map(|c| (c.id, c))
                .collect()
        };

        let mut report = PreflightReport::default();
        let mut resolved = HashMap::new();
        for reference in distinct {
            let found = match (&reference.urn, reference.id) {
                (Some(urn), _) => by_urn.get(urn),
                (None, Some(id)) => by_id.get(&id),
                (None, None) => None,
            };
            let is_authorized = found.is_some_and(|c| c.is_authorized_for(user));
            if let Some(concept) = found {
                if is_authorized {
                    resolved.insert(reference.clone(), Arc::clone(concept));
                }
            }
            report.checks.push(PreflightCheck {
                reference: reference.clone(),
                is_present: found.is_some(),
                is_authorized,
            });
        }

        if !report.ok() {
            tracing::info!(
                user = user.name(),
                failures = report.failures().count(),
                "preflight check failed"
            );
        }
        Ok((report, resolved))
    }

    /// Resolve every concept slot of `definition`.
    pub async fn resolve(
        &self,
        user: &UserContext,
        definition: QueryDefinition,
    ) -> LeafResult<Resolution> {
        let references: Vec<ResourceRef> = definition.concepts().into_iter().cloned().collect();
        let (preflight, resolved) = self.preflight(user, &references).await?;
        if !preflight.ok() {
            return Ok(Resolution::Failed(preflight));
        }

        let query = definition.try_map_concepts(&mut |reference: ResourceRef| {
            resolved.get(&reference).cloned().ok_or_else(|| {
                LeafError::Validation(format!("dangling concept reference {}", reference))
            })
        })?;

        let global_filters = self.applicable_global_filters(user).await?;

        Ok(Resolution::Resolved {
            query,
            global_filters,
            preflight,
        })
    }

    /// Global panel filters for the user's session type.
    ///
    /// Requests relayed by peers get none: the originating node applies its own.
    pub async fn applicable_global_filters(
        &self,
        user: &UserContext,
    ) -> LeafResult<Vec<GlobalPanelFilter>> {
        if user.is_federated() {
            return Ok(Vec::new());
        }
        Ok(self
            .store
            .global_panel_filters()
            .await?
            .into_iter()
            .filter(|f| f.applies_to(user.session_type()))
            .collect())
    }
}

/// Rewrite every reference to the local id of its concept.
pub fn localise(query: &ResolvedQuery) -> QueryDefinition {
    let rewritten: Result<QueryDefinition, std::convert::Infallible> = query
        .clone()
        .try_map_concepts(&mut |concept| Ok(ResourceRef::by_id(concept.id)));
    match rewritten {
        Ok(definition) => definition,
        Err(never) => match never {},
    }
}

/// Rewrite every reference to its URN so that peers can resolve it.
///
/// # Errors
///
/// Returns `LeafError::NotFederatable` naming the first concept without a URN.
pub fn federate(query: &ResolvedQuery) -> LeafResult<QueryDefinition> {
    query.clone().try_map_concepts(&mut |concept| {
        concept
            .urn
            .clone()
            .map(ResourceRef::by_urn)
            .ok_or_else(|| LeafError::NotFederatable(concept.display_name.clone()))
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{Panel, PanelFilter, PanelItem, RecencyFilter, SubPanel, JoinSequence};
    use crate::user::SessionType;

    pub(crate) fn concept(name: &str, urn: Option<&str>) -> Concept {
        Concept {
            id: Uuid::new_v4(),
            urn: urn.map(|u| LeafUrn::parse(u).expect("valid urn")),
            display_name: name.into(),
            is_encounter_based: true,
            sql_set_from: "dbo.Encounter".into(),
            sql_set_where: Some(format!("@.Type = '{}'", name)),
            sql_field_date: Some("@.AdmitDate".into()),
            sql_field_numeric: None,
            numeric_unit: None,
            allowed_roles: vec![],
        }
    }

    pub(crate) fn single_item_query(reference: ResourceRef) -> QueryDefinition {
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
                        concept: reference,
                        numeric_filter: None,
                        recency: RecencyFilter::None,
                    }],
                }],
            }],
            panel_filters: vec![],
        }
    }

    fn user() -> UserContext {
        UserContext::builder("alice", "leaf.uw.edu").build()
    }

    #[tokio::test]
    async fn test_resolve_by_id_and_urn() {
        let ed = concept("ED", Some("urn:leaf:concept:enc:ed"));
        let vip = concept("VIP", None);
        let store = Arc::new(InMemoryConceptStore::new(
            vec![ed.clone(), vip.clone()],
            vec![],
        ));
        let resolver = Resolver::new(store);

        let mut definition =
            single_item_query(ResourceRef::by_urn(ed.urn.clone().expect("has urn")));
        definition.panel_filters.push(PanelFilter {
            concept: ResourceRef::by_id(vip.id),
            is_inclusion: false,
            is_active: true,
        });

        match resolver
            .resolve(&user(), definition)
            .await
            .expect("resolution should not error")
        {
            Resolution::Resolved { query, preflight, .. } => {
                assert!(preflight.ok());
                assert_eq!(query.panels[0].sub_panels[0].items[0].concept.id, ed.id);
                assert_eq!(query.panel_filters[0].concept.id, vip.id);
            }
            Resolution::Failed(report) => panic!("unexpected preflight failure: {:?}", report),
        }
    }

    #[tokio::test]
    async fn test_urn_takes_precedence_over_id() {
        let ed = concept("ED", Some("urn:leaf:concept:enc:ed"));
        let other = concept("Other", None);
        let resolver = Resolver::new(Arc::new(InMemoryConceptStore::new(
            vec![ed.clone(), other.clone()],
            vec![],
        )));
        let reference = ResourceRef {
            id: Some(other.id),
            urn: ed.urn.clone(),
        };
        let (report, resolved) = resolver
            .preflight(&user(), &[reference.clone()])
            .await
            .expect("preflight should run");
        assert!(report.ok());
        assert_eq!(resolved[&reference].id, ed.id);
    }

    #[tokio::test]
    async fn test_missing_and_unauthorized_fail_preflight() {
        let mut restricted = concept("HIV", Some("urn:leaf:concept:labs:hiv"));
        restricted.allowed_roles = vec!["sensitive".into()];
        let resolver = Resolver::new(Arc::new(InMemoryConceptStore::new(
            vec![restricted.clone()],
            vec![],
        )));

        let mut definition = single_item_query(ResourceRef::by_id(restricted.id));
        definition.panel_filters.push(PanelFilter {
            concept: ResourceRef::by_id(Uuid::new_v4()),
            is_inclusion: true,
            is_active: true,
        });

        let resolution = resolver
            .resolve(&user(), definition)
            .await
            .expect("resolution should not error");
        let Resolution::Failed(report) = resolution else {
            panic!("expected preflight failure");
        };
        assert!(!report.ok());
        assert_eq!(report.failures().count(), 2);
        assert!(report
            .checks
            .iter()
            .any(|c| c.is_present && !c.is_authorized));
        assert!(report.checks.iter().any(|c| !c.is_present));
    }

    #[tokio::test]
    async fn test_federated_users_cannot_resolve_local_ids() {
        let ed = concept("ED", Some("urn:leaf:concept:enc:ed"));
        let resolver = Resolver::new(Arc::new(InMemoryConceptStore::new(
            vec![ed.clone()],
            vec![],
        )));
        let peer = UserContext::builder("peer", "leaf.other.edu")
            .federated(true)
            .build();
        let (report, _) = resolver
            .preflight(&peer, &[ResourceRef::by_id(ed.id)])
            .await
            .expect("preflight should run");
        assert!(!report.ok());
    }

    #[tokio::test]
    async fn test_global_filters_follow_session_type() {
        let research_only = GlobalPanelFilter {
            id: Uuid::new_v4(),
            session_type: Some(SessionType::Research),
            is_inclusion: false,
            concept: Arc::new(concept("OptOut", None)),
        };
        let everyone = GlobalPanelFilter {
            id: Uuid::new_v4(),
            session_type: None,
            is_inclusion: true,
            concept: Arc::new(concept("Adult", None)),
        };
        let resolver = Resolver::new(Arc::new(InMemoryConceptStore::new(
            vec![],
            vec![research_only.clone(), everyone.clone()],
        )));

        let qi = UserContext::builder("qi", "leaf.uw.edu")
            .session_type(SessionType::QualityImprovement)
            .build();
        let filters = resolver
            .applicable_global_filters(&qi)
            .await
            .expect("filters should load");
        assert_eq!(filters, vec![everyone.clone()]);

        let research = resolver
            .applicable_global_filters(&user())
            .await
            .expect("filters should load");
        assert_eq!(research.len(), 2);
    }

    #[test]
    fn test_localise_and_federate() {
        let with_urn = Arc::new(concept("ED", Some("urn:leaf:concept:enc:ed")));
        let query: ResolvedQuery = single_item_query(ResourceRef::by_id(with_urn.id))
            .try_map_concepts(&mut |_| Ok::<_, ()>(Arc::clone(&with_urn)))
            .expect("should map");

        let local = localise(&query);
        assert_eq!(
            local.panels[0].sub_panels[0].items[0].concept,
            ResourceRef::by_id(with_urn.id)
        );

        let federated = federate(&query).expect("should federate");
        assert_eq!(
            federated.panels[0].sub_panels[0].items[0].concept,
            ResourceRef::by_urn(with_urn.urn.clone().expect("has urn"))
        );

        let without_urn = Arc::new(concept("Local", None));
        let local_only: ResolvedQuery = single_item_query(ResourceRef::by_id(without_urn.id))
            .try_map_concepts(&mut |_| Ok::<_, ()>(Arc::clone(&without_urn)))
            .expect("should map");
        assert!(matches!(
            federate(&local_only),
            Err(LeafError::NotFederatable(name)) if name == "Local"
        ));
    }
}
