//! Mapping between Leaf query definitions and SHRINE expressions.
//!
//! A single-sub-panel panel becomes a concept group; a panel with later sub-panels becomes a
//! timeline whose subsequent events carry the join sequence. Only `WithinFollowing` and
//! `AnytimeFollowing` joins, specific (or open-ended) date boundaries and included
//! sub-panels can be expressed in a timeline. Everything else is rejected rather than
//! silently widened.

use super::tags::{
    ConjunctionComparison, ConstraintOperator, Occurrence, QueryOutput, QueryStatus, QueryType,
};
use super::wire::{
    ConceptConjunctionDto, ConceptDto, ConceptGroupDto, ConjunctionDto, ConstraintDto, Encoded,
    PossibilityDto, QueryDefinitionDto, ShrineQueryDto, SubsequentEventDto, TimeConstraintDto,
    TimelineDto, VersionInfoDto,
};
use super::ShrineError;
use crate::constants::{
    SHRINE_CONCEPT_URN_PREFIX, SHRINE_ITEM_VERSION, SHRINE_PROTOCOL_VERSION, SHRINE_VERSION,
};
use crate::model::{
    DateBound, DateBoundary, JoinSequence, NumericFilter, NumericFilterType, Panel, PanelItem,
    QueryDefinition, QueryId, RecencyFilter, ResourceRef, SubPanel,
};
use chrono::{DateTime, TimeZone, Utc};
use leaf_types::LeafUrn;
use rand::Rng;

/// Earliest date assumed when a SHRINE group only carries an end date.
const OPEN_START_YEAR: i32 = 1900;

// ==== Leaf to SHRINE ====

/// Builds outgoing SHRINE queries on behalf of this node.
#[derive(Debug, Clone)]
pub struct ShrineQueryConverter {
    node_of_origin_id: i64,
    researcher_id: i64,
}

impl ShrineQueryConverter {
    pub fn new(node_of_origin_id: i64, researcher_id: i64) -> Self {
        Self {
            node_of_origin_id,
            researcher_id,
        }
    }

    /// Wrap a Leaf query in a SHRINE query envelope with a fresh random id.
    ///
    /// # Errors
    ///
    /// Returns `ShrineError::NotRepresentable` when a panel cannot be expressed in SHRINE.
    pub fn to_shrine_query(
        &self,
        query: &QueryDefinition,
        now: DateTime<Utc>,
    ) -> Result<ShrineQueryDto, ShrineError> {
        let expression = expression_from_query(query)?;
        let stamp = now.timestamp_millis();
        Ok(ShrineQueryDto {
            id: rand::thread_rng().gen_range(1..i64::MAX),
            version_info: VersionInfoDto {
                protocol_version: SHRINE_PROTOCOL_VERSION,
                shrine_version: SHRINE_VERSION.to_owned(),
                item_version: SHRINE_ITEM_VERSION,
                create_date: stamp,
                change_date: stamp,
            },
            query_definition: QueryDefinitionDto { expression },
            output: Encoded::new(QueryOutput::Count),
            status: Encoded::new(QueryStatus::SentToHub),
            query_name: "Query".to_owned(),
            node_of_origin_id: self.node_of_origin_id,
            researcher_id: self.researcher_id,
            topic_id: 0,
            project_name: String::new(),
            flagged: false,
            flagged_message: None,
            encoded_class: QueryType::Query,
        })
    }
}

/// Convert every panel into a member of one all-must-hold conjunction.
///
/// # Errors
///
/// Returns `ShrineError::NotRepresentable` for active panel filters, id-only resources,
/// relative date boundaries, unsupported join sequences, exclusion sub-panels and `Max`
/// recency filters.
pub fn expression_from_query(query: &QueryDefinition) -> Result<ConjunctionDto, ShrineError> {
    if query.panel_filters.iter().any(|f| f.is_active) {
        return Err(ShrineError::NotRepresentable(
            "panel filters have no SHRINE equivalent".into(),
        ));
    }
    let possibilities = query
        .panels
        .iter()
        .enumerate()
        .map(|(p, panel)| possibility_from_panel(p, panel))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ConjunctionDto {
        n_must_be_true: required_count(possibilities.len())?,
        compare: Encoded::new(ConjunctionComparison::AtLeast),
        possibilities,
    })
}

/// SHRINE carries the number of required members as a 32-bit count.
fn required_count(members: usize) -> Result<u32, ShrineError> {
    u32::try_from(members).map_err(|_| {
        ShrineError::NotRepresentable(format!("{} panels exceed the SHRINE member count", members))
    })
}

fn possibility_from_panel(
    p: usize,
    panel: &Panel<ResourceRef>,
) -> Result<PossibilityDto, ShrineError> {
    let (start_date, end_date) = boundary_to_millis(p, panel.date_boundary.as_ref())?;
    match panel.sub_panels.as_slice() {
        [] => Err(ShrineError::NotRepresentable(format!(
            "panel {} has no sub-panels",
            p
        ))),
        [only] => {
            if !only.include {
                return Err(ShrineError::NotRepresentable(format!(
                    "panel {} sub-panel is an exclusion",
                    p
                )));
            }
            if occurrence_of(p, only)? != Occurrence::Any {
                return Err(ShrineError::NotRepresentable(format!(
                    "panel {} recency filters need a timeline",
                    p
                )));
            }
            let mut group = concept_group(panel.include, only)?;
            group.start_date = start_date;
            group.end_date = end_date;
            Ok(PossibilityDto::ConceptGroup(group))
        }
        [first, rest @ ..] => {
            if panel.sub_panels.iter().any(|s| !s.include) {
                return Err(ShrineError::NotRepresentable(format!(
                    "panel {} has an exclusion sub-panel inside a sequence",
                    p
                )));
            }
            let previous_occurrence = occurrence_of(p, first)?;
            let subsequent = rest
                .iter()
                .map(|sub| {
                    let time_constraint = match sub.join_sequence {
                        JoinSequence::WithinFollowing { increment, unit } => {
                            Some(TimeConstraintDto {
                                operator: ConstraintOperator::LessThanOrEqual,
                                value: increment,
                                time_unit: unit.into(),
                            })
                        }
                        JoinSequence::AnytimeFollowing => None,
                        other => {
                            return Err(ShrineError::NotRepresentable(format!(
                                "panel {} join sequence {:?} has no SHRINE equivalent",
                                p, other
                            )))
                        }
                    };
                    Ok(SubsequentEventDto {
                        concept_group: concept_group(panel.include, sub)?,
                        previous_occurrence,
                        this_occurrence: occurrence_of(p, sub)?,
                        time_constraint,
                    })
                })
                .collect::<Result<Vec<_>, ShrineError>>()?;
            Ok(PossibilityDto::Timeline(TimelineDto {
                start_date,
                end_date,
                first: concept_group(panel.include, first)?,
                subsequent,
            }))
        }
    }
}

fn concept_group(include: bool, sub: &SubPanel<ResourceRef>) -> Result<ConceptGroupDto, ShrineError> {
    let possibilities = sub
        .items
        .iter()
        .map(concept_from_item)
        .collect::<Result<Vec<_>, _>>()?;
    let (n_must_be_true, compare) = if include {
        (1, ConjunctionComparison::AtLeast)
    } else {
        (0, ConjunctionComparison::AtMost)
    };
    Ok(ConceptGroupDto {
        start_date: None,
        end_date: None,
        occurs_at_least: sub.minimum_count,
        concepts: ConceptConjunctionDto {
            n_must_be_true,
            compare: Encoded::new(compare),
            possibilities,
        },
    })
}

fn concept_from_item(item: &PanelItem<ResourceRef>) -> Result<ConceptDto, ShrineError> {
    let urn = item.concept.urn.as_ref().ok_or_else(|| {
        ShrineError::NotRepresentable("SHRINE concepts must be referenced by URN".into())
    })?;
    let term_path = term_path_of(urn);
    Ok(ConceptDto {
        display_name: term_path.clone(),
        term_path,
        constraint: item.numeric_filter.as_ref().map(constraint_from_filter),
    })
}

/// SHRINE-derived URNs shed their prefix; any other URN travels whole.
fn term_path_of(urn: &LeafUrn) -> String {
    let full = urn.to_string();
    let prefix_len = SHRINE_CONCEPT_URN_PREFIX.len();
    match (full.get(..prefix_len), full.get(prefix_len..)) {
        (Some(prefix), Some(rest)) if prefix.eq_ignore_ascii_case(SHRINE_CONCEPT_URN_PREFIX) => {
            rest.to_owned()
        }
        _ => full,
    }
}

fn constraint_from_filter(filter: &NumericFilter) -> ConstraintDto {
    let bounds = filter.bounds();
    let mut constraint = ConstraintDto {
        operator: filter.filter_type().into(),
        value: None,
        value1: None,
        value2: None,
        unit: None,
    };
    if filter.filter_type() == NumericFilterType::Between {
        constraint.value1 = bounds.first().copied();
        constraint.value2 = bounds.get(1).copied();
    } else {
        constraint.value = bounds.first().copied();
    }
    constraint
}

fn occurrence_of(p: usize, sub: &SubPanel<ResourceRef>) -> Result<Occurrence, ShrineError> {
    if sub.items.iter().all(|i| i.recency == RecencyFilter::None) {
        Ok(Occurrence::Any)
    } else if sub.items.iter().all(|i| i.recency == RecencyFilter::Min) {
        Ok(Occurrence::First)
    } else {
        Err(ShrineError::NotRepresentable(format!(
            "panel {} recency filters must all be earliest-occurrence",
            p
        )))
    }
}

fn boundary_to_millis(
    p: usize,
    boundary: Option<&DateBoundary>,
) -> Result<(Option<i64>, Option<i64>), ShrineError> {
    let Some(boundary) = boundary else {
        return Ok((None, None));
    };
    let start = match boundary.start {
        DateBound::Specific(date) => date.timestamp_millis(),
        _ => {
            return Err(ShrineError::NotRepresentable(format!(
                "panel {} start date must be a specific date",
                p
            )))
        }
    };
    let end = match boundary.end {
        DateBound::Specific(date) => Some(date.timestamp_millis()),
        DateBound::Now => None,
        DateBound::Relative { .. } => {
            return Err(ShrineError::NotRepresentable(format!(
                "panel {} end date is relative",
                p
            )))
        }
    };
    Ok((Some(start), end))
}

// ==== SHRINE to Leaf ====

/// Convert an incoming SHRINE query into an unresolved Leaf query with a fresh `QueryId`.
///
/// # Errors
///
/// Returns `ShrineError::NotRepresentable` for disjunctions and unsupported time constraints,
/// and `ShrineError::Malformed` for out-of-range dates, bad constraints or bad term paths.
pub fn query_from_shrine(query: &ShrineQueryDto) -> Result<QueryDefinition, ShrineError> {
    let expression = &query.query_definition.expression;
    let all_required = match expression.compare.encoded_class {
        ConjunctionComparison::AtLeast | ConjunctionComparison::Exactly => {
            usize::try_from(expression.n_must_be_true).ok()
                == Some(expression.possibilities.len())
        }
        ConjunctionComparison::AtMost => false,
    };
    if !all_required {
        return Err(ShrineError::NotRepresentable(
            "only conjunctions where every member must hold are supported".into(),
        ));
    }

    let panels = expression
        .possibilities
        .iter()
        .map(panel_from_possibility)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(QueryDefinition {
        query_id: Some(QueryId::new()),
        panels,
        panel_filters: Vec::new(),
    })
}

fn panel_from_possibility(possibility: &PossibilityDto) -> Result<Panel<ResourceRef>, ShrineError> {
    match possibility {
        PossibilityDto::ConceptGroup(group) => Ok(Panel {
            include: group.concepts.n_must_be_true > 0,
            date_boundary: boundary_from_millis(group.start_date, group.end_date)?,
            sub_panels: vec![sub_panel_from_group(
                group,
                JoinSequence::Encounter,
                RecencyFilter::None,
            )?],
        }),
        PossibilityDto::Timeline(timeline) => {
            let anchor_recency = match timeline.subsequent.first() {
                Some(event) if event.previous_occurrence == Occurrence::First => RecencyFilter::Min,
                _ => RecencyFilter::None,
            };
            let mut sub_panels = vec![sub_panel_from_group(
                &timeline.first,
                JoinSequence::Encounter,
                anchor_recency,
            )?];
            for event in &timeline.subsequent {
                let join = match event.time_constraint {
                    None => JoinSequence::AnytimeFollowing,
                    Some(TimeConstraintDto {
                        operator: ConstraintOperator::LessThanOrEqual,
                        value,
                        time_unit,
                    }) => JoinSequence::WithinFollowing {
                        increment: value,
                        unit: time_unit.into(),
                    },
                    Some(other) => {
                        return Err(ShrineError::NotRepresentable(format!(
                            "time constraint operator {} is not supported",
                            other.operator
                        )))
                    }
                };
                let recency = match event.this_occurrence {
                    Occurrence::First => RecencyFilter::Min,
                    Occurrence::Any => RecencyFilter::None,
                };
                sub_panels.push(sub_panel_from_group(&event.concept_group, join, recency)?);
            }
            Ok(Panel {
                include: timeline.first.concepts.n_must_be_true > 0,
                date_boundary: boundary_from_millis(timeline.start_date, timeline.end_date)?,
                sub_panels,
            })
        }
    }
}

fn sub_panel_from_group(
    group: &ConceptGroupDto,
    join_sequence: JoinSequence,
    recency: RecencyFilter,
) -> Result<SubPanel<ResourceRef>, ShrineError> {
    let items = group
        .concepts
        .possibilities
        .iter()
        .map(|concept| {
            Ok(PanelItem {
                concept: resource_from_term_path(&concept.term_path)?,
                numeric_filter: concept
                    .constraint
                    .as_ref()
                    .map(filter_from_constraint)
                    .transpose()?,
                recency,
            })
        })
        .collect::<Result<Vec<_>, ShrineError>>()?;
    Ok(SubPanel {
        include: true,
        minimum_count: group.occurs_at_least.max(1),
        join_sequence,
        items,
    })
}

fn resource_from_term_path(term_path: &str) -> Result<ResourceRef, ShrineError> {
    let urn = match LeafUrn::parse(term_path) {
        Ok(urn) => urn,
        Err(_) => LeafUrn::parse(format!("{}{}", SHRINE_CONCEPT_URN_PREFIX, term_path))
            .map_err(|e| ShrineError::Malformed(format!("term path '{}': {}", term_path, e)))?,
    };
    Ok(ResourceRef::by_urn(urn))
}

fn filter_from_constraint(constraint: &ConstraintDto) -> Result<NumericFilter, ShrineError> {
    let filter_type = NumericFilterType::from(constraint.operator);
    let bounds = if filter_type == NumericFilterType::Between {
        vec![constraint.value1, constraint.value2]
    } else {
        vec![constraint.value]
    };
    NumericFilter::new(filter_type, &bounds)
        .map_err(|e| ShrineError::Malformed(format!("constraint {}: {}", constraint.operator, e)))
}

fn boundary_from_millis(
    start: Option<i64>,
    end: Option<i64>,
) -> Result<Option<DateBoundary>, ShrineError> {
    if start.is_none() && end.is_none() {
        return Ok(None);
    }
    let start = match start {
        Some(ms) => from_millis(ms)?,
        None => Utc
            .with_ymd_and_hms(OPEN_START_YEAR, 1, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| ShrineError::Malformed("open start date".into()))?,
    };
    let end = match end {
        Some(ms) => DateBound::Specific(from_millis(ms)?),
        None => DateBound::Now,
    };
    Ok(Some(DateBoundary {
        start: DateBound::Specific(start),
        end,
    }))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, ShrineError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| ShrineError::Malformed(format!("date {} ms is out of range", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DateUnit, PanelFilter};

    fn item(term: &str) -> PanelItem<ResourceRef> {
        PanelItem {
            concept: ResourceRef::by_urn(
                LeafUrn::parse(format!("{}{}", SHRINE_CONCEPT_URN_PREFIX, term))
                    .expect("should build urn"),
            ),
            numeric_filter: None,
            recency: RecencyFilter::None,
        }
    }

    fn sub(join_sequence: JoinSequence, items: Vec<PanelItem<ResourceRef>>) -> SubPanel<ResourceRef> {
        SubPanel {
            include: true,
            minimum_count: 1,
            join_sequence,
            items,
        }
    }

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).expect("should build date")
    }

    fn sample_query() -> QueryDefinition {
        let mut lab = item("\\i2b2\\Labs\\A1c\\");
        lab.numeric_filter = Some(
            NumericFilter::new(NumericFilterType::Between, &[Some(6.5), Some(9.25)])
                .expect("should build filter"),
        );
        let mut ed = item("\\i2b2\\Visits\\ED\\");
        ed.recency = RecencyFilter::Min;
        let mut admit = item("\\i2b2\\Visits\\Inpatient\\");
        admit.recency = RecencyFilter::Min;

        QueryDefinition {
            query_id: None,
            panels: vec![
                Panel {
                    include: true,
                    date_boundary: Some(DateBoundary {
                        start: DateBound::Specific(at(1_262_304_000_123)),
                        end: DateBound::Specific(at(1_577_836_800_456)),
                    }),
                    sub_panels: vec![SubPanel {
                        minimum_count: 2,
                        ..sub(JoinSequence::Encounter, vec![lab])
                    }],
                },
                Panel {
                    include: true,
                    date_boundary: None,
                    sub_panels: vec![
                        sub(JoinSequence::Encounter, vec![ed]),
                        sub(
                            JoinSequence::WithinFollowing {
                                increment: 3,
                                unit: DateUnit::Day,
                            },
                            vec![admit],
                        ),
                        sub(JoinSequence::AnytimeFollowing, vec![item("\\i2b2\\Death\\")]),
                    ],
                },
                Panel {
                    include: false,
                    date_boundary: None,
                    sub_panels: vec![sub(
                        JoinSequence::Encounter,
                        vec![item("\\i2b2\\Demographics\\VIP\\")],
                    )],
                },
            ],
            panel_filters: Vec::new(),
        }
    }

    #[test]
    fn test_round_trip_preserves_structure() {
        let query = sample_query();
        let shrine = ShrineQueryConverter::new(7, 11)
            .to_shrine_query(&query, Utc::now())
            .expect("should convert to SHRINE");

        let json = serde_json::to_string(&shrine).expect("should serialise");
        let decoded: ShrineQueryDto = serde_json::from_str(&json).expect("should deserialise");
        let back = query_from_shrine(&decoded).expect("should convert back");

        assert!(back.query_id.is_some());
        assert_eq!(back.panels, query.panels);
    }

    #[test]
    fn test_panels_become_groups_and_timelines() {
        let expression = expression_from_query(&sample_query()).expect("should convert");
        assert_eq!(expression.n_must_be_true, 3);
        assert!(matches!(expression.possibilities[0], PossibilityDto::ConceptGroup(_)));
        let PossibilityDto::Timeline(timeline) = &expression.possibilities[1] else {
            panic!("second panel should be a timeline");
        };
        assert_eq!(timeline.subsequent.len(), 2);
        assert_eq!(timeline.subsequent[0].previous_occurrence, Occurrence::First);
        let within = timeline.subsequent[0]
            .time_constraint
            .expect("within-following should carry a constraint");
        assert_eq!(within.operator, ConstraintOperator::LessThanOrEqual);
        assert_eq!(within.value, 3);
        assert!(timeline.subsequent[1].time_constraint.is_none());

        let PossibilityDto::ConceptGroup(excluded) = &expression.possibilities[2] else {
            panic!("third panel should be a concept group");
        };
        assert_eq!(excluded.concepts.n_must_be_true, 0);
        assert_eq!(
            excluded.concepts.compare.encoded_class,
            ConjunctionComparison::AtMost
        );
        assert_eq!(excluded.concepts.possibilities[0].term_path, "\\i2b2\\Demographics\\VIP\\");
    }

    #[test]
    fn test_dates_transit_as_epoch_millis() {
        let expression = expression_from_query(&sample_query()).expect("should convert");
        let PossibilityDto::ConceptGroup(group) = &expression.possibilities[0] else {
            panic!("first panel should be a concept group");
        };
        assert_eq!(group.start_date, Some(1_262_304_000_123));
        assert_eq!(group.end_date, Some(1_577_836_800_456));
    }

    #[test]
    fn test_unrepresentable_sequences_are_rejected() {
        for join in [
            JoinSequence::Event,
            JoinSequence::PlusMinus {
                increment: 1,
                unit: DateUnit::Day,
            },
        ] {
            let mut query = sample_query();
            query.panels[1].sub_panels[1].join_sequence = join;
            assert!(matches!(
                expression_from_query(&query),
                Err(ShrineError::NotRepresentable(_))
            ));
        }

        let mut query = sample_query();
        query.panels[1].sub_panels[2].include = false;
        assert!(matches!(
            expression_from_query(&query),
            Err(ShrineError::NotRepresentable(_))
        ));
    }

    #[test]
    fn test_relative_boundaries_and_filters_are_rejected() {
        let mut query = sample_query();
        query.panels[0].date_boundary = Some(DateBoundary {
            start: DateBound::Relative {
                unit: DateUnit::Year,
                increment: -1,
            },
            end: DateBound::Now,
        });
        assert!(matches!(
            expression_from_query(&query),
            Err(ShrineError::NotRepresentable(_))
        ));

        let mut query = sample_query();
        query.panel_filters.push(PanelFilter {
            concept: item("\\i2b2\\VIP\\").concept,
            is_inclusion: false,
            is_active: true,
        });
        assert!(matches!(
            expression_from_query(&query),
            Err(ShrineError::NotRepresentable(_))
        ));
    }

    #[test]
    fn test_open_end_date_maps_to_now() {
        let mut query = sample_query();
        query.panels[0].date_boundary = Some(DateBoundary {
            start: DateBound::Specific(at(1_000)),
            end: DateBound::Now,
        });
        let shrine = ShrineQueryConverter::new(1, 1)
            .to_shrine_query(&query, Utc::now())
            .expect("should convert");
        let back = query_from_shrine(&shrine).expect("should convert back");
        assert_eq!(back.panels[0].date_boundary, query.panels[0].date_boundary);
    }

    #[test]
    fn test_disjunction_is_rejected() {
        let mut shrine = ShrineQueryConverter::new(1, 1)
            .to_shrine_query(&sample_query(), Utc::now())
            .expect("should convert");
        shrine.query_definition.expression.n_must_be_true = 1;
        assert!(matches!(
            query_from_shrine(&shrine),
            Err(ShrineError::NotRepresentable(_))
        ));
    }

    #[test]
    fn test_non_shrine_urns_travel_whole() {
        let urn = LeafUrn::parse("urn:leaf:concept:diag:codeset=ICD10+code=E11")
            .expect("should parse");
        assert_eq!(term_path_of(&urn), urn.to_string());
        let back = resource_from_term_path(&urn.to_string()).expect("should parse back");
        assert_eq!(back.urn, Some(urn));
    }

    #[test]
    fn test_id_only_resource_is_rejected() {
        let mut query = sample_query();
        query.panels[0].sub_panels[0].items[0].concept = ResourceRef::by_id(uuid::Uuid::new_v4());
        assert!(matches!(
            expression_from_query(&query),
            Err(ShrineError::NotRepresentable(_))
        ));
    }

    #[test]
    fn test_member_count_must_fit_shrine() {
        assert_eq!(required_count(3).expect("should fit"), 3);
        assert_eq!(
            required_count(u32::MAX as usize).expect("should fit"),
            u32::MAX
        );
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_member_count_beyond_u32_is_rejected() {
        assert!(matches!(
            required_count(u32::MAX as usize + 1),
            Err(ShrineError::NotRepresentable(msg)) if msg.contains("4294967296")
        ));
    }
}
