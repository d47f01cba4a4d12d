use crate::model::concept::{Concept, ResourceRef};
use crate::user::SessionType;
use crate::{LeafError, LeafResult};
use chrono::{DateTime, Duration, Months, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Identity of a submitted query, used as the count cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(Uuid);

impl QueryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Units for date arithmetic in boundaries and join sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl DateUnit {
    pub const ALL: [DateUnit; 6] = [
        DateUnit::Minute,
        DateUnit::Hour,
        DateUnit::Day,
        DateUnit::Week,
        DateUnit::Month,
        DateUnit::Year,
    ];

    /// Upper-case SQL keyword for the unit.
    pub fn keyword(self) -> &'static str {
        match self {
            DateUnit::Minute => "MINUTE",
            DateUnit::Hour => "HOUR",
            DateUnit::Day => "DAY",
            DateUnit::Week => "WEEK",
            DateUnit::Month => "MONTH",
            DateUnit::Year => "YEAR",
        }
    }

    /// Shift `from` by `increment` units. Month arithmetic clamps to the end of month.
    pub fn shift(self, from: DateTime<Utc>, increment: i32) -> Option<DateTime<Utc>> {
        let n = i64::from(increment);
        match self {
            DateUnit::Minute => from.checked_add_signed(Duration::minutes(n)),
            DateUnit::Hour => from.checked_add_signed(Duration::hours(n)),
            DateUnit::Day => from.checked_add_signed(Duration::days(n)),
            DateUnit::Week => from.checked_add_signed(Duration::weeks(n)),
            DateUnit::Month => shift_months(from, n),
            DateUnit::Year => shift_months(from, n.checked_mul(12)?),
        }
    }
}

fn shift_months(from: DateTime<Utc>, months: i64) -> Option<DateTime<Utc>> {
    let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
    if months >= 0 {
        from.checked_add_months(magnitude)
    } else {
        from.checked_sub_months(magnitude)
    }
}

/// One side of a panel date boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DateBound {
    Now,
    Specific(DateTime<Utc>),
    /// `increment` units away from now (negative is the past).
    Relative { unit: DateUnit, increment: i32 },
}

impl DateBound {
    pub fn resolve(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            DateBound::Now => Some(now),
            DateBound::Specific(at) => Some(*at),
            DateBound::Relative { unit, increment } => unit.shift(now, *increment),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DateBoundary {
    pub start: DateBound,
    pub end: DateBound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericFilterType {
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    EqualTo,
    Between,
}

impl NumericFilterType {
    pub fn arity(self) -> usize {
        match self {
            NumericFilterType::Between => 2,
            _ => 1,
        }
    }

    /// SQL comparison operator for single-bound filters.
    pub fn symbol(self) -> Option<&'static str> {
        match self {
            NumericFilterType::GreaterThan => Some(">"),
            NumericFilterType::GreaterThanOrEqual => Some(">="),
            NumericFilterType::LessThan => Some("<"),
            NumericFilterType::LessThanOrEqual => Some("<="),
            NumericFilterType::EqualTo => Some("="),
            NumericFilterType::Between => None,
        }
    }
}

/// Numeric constraint on a panel item. The bound count always matches the filter type.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericFilter {
    filter_type: NumericFilterType,
    bounds: Vec<f64>,
}

impl NumericFilter {
    /// Build a filter from submitted bounds.
    ///
    /// # Errors
    ///
    /// Returns `LeafError::Validation` when a bound is missing or non-finite, or when more
    /// bounds are supplied than the filter type takes.
    pub fn new(filter_type: NumericFilterType, bounds: &[Option<f64>]) -> LeafResult<Self> {
        let present: Vec<f64> = bounds.iter().flatten().copied().collect();
        if present.len() < filter_type.arity() {
            return Err(LeafError::Validation("missing numeric arguments".into()));
        }
        if bounds.len() > filter_type.arity() {
            return Err(LeafError::Validation("excessive numeric arguments".into()));
        }
        if present.iter().any(|b| !b.is_finite()) {
            return Err(LeafError::Validation("numeric arguments must be finite".into()));
        }
        Ok(Self {
            filter_type,
            bounds: present,
        })
    }

    pub fn filter_type(&self) -> NumericFilterType {
        self.filter_type
    }

    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RecencyFilter {
    #[default]
    None,
    /// Earliest occurrence per patient.
    Min,
    /// Latest occurrence per patient.
    Max,
}

/// Relation of a sub-panel to the anchor (first) sub-panel of its panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinSequence {
    Encounter,
    Event,
    PlusMinus { increment: u32, unit: DateUnit },
    WithinFollowing { increment: u32, unit: DateUnit },
    AnytimeFollowing,
}

impl JoinSequence {
    /// True when the relation compares matched dates.
    pub fn needs_dates(&self) -> bool {
        matches!(
            self,
            JoinSequence::PlusMinus { .. }
                | JoinSequence::WithinFollowing { .. }
                | JoinSequence::AnytimeFollowing
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PanelItem<C> {
    pub concept: C,
    pub numeric_filter: Option<NumericFilter>,
    pub recency: RecencyFilter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubPanel<C> {
    pub include: bool,
    pub minimum_count: u32,
    pub join_sequence: JoinSequence,
    pub items: Vec<PanelItem<C>>,
}

impl<C> SubPanel<C> {
    pub fn has_count_filter(&self) -> bool {
        self.minimum_count > 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Panel<C> {
    pub include: bool,
    pub date_boundary: Option<DateBoundary>,
    pub sub_panels: Vec<SubPanel<C>>,
}

impl<C> Panel<C> {
    pub fn item_count(&self) -> usize {
        self.sub_panels.iter().map(|s| s.items.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PanelFilter<C> {
    pub concept: C,
    pub is_inclusion: bool,
    pub is_active: bool,
}

/// Administrator-defined filter applied to every query of a session type.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalPanelFilter {
    pub id: Uuid,
    /// `None` applies to every session.
    pub session_type: Option<SessionType>,
    pub is_inclusion: bool,
    pub concept: Arc<Concept>,
}

impl GlobalPanelFilter {
    pub fn applies_to(&self, session_type: SessionType) -> bool {
        self.session_type.map_or(true, |t| t == session_type)
    }
}

/// A submitted query. `C` is [`ResourceRef`] before resolution and `Arc<Concept>` after.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDefinition<C = ResourceRef> {
    pub query_id: Option<QueryId>,
    pub panels: Vec<Panel<C>>,
    pub panel_filters: Vec<PanelFilter<C>>,
}

pub type ResolvedQuery = QueryDefinition<Arc<Concept>>;

impl<C> QueryDefinition<C> {
    /// Every concept slot, panel items first then filters.
    pub fn concepts(&self) -> Vec<&C> {
        self.panels
            .iter()
            .flat_map(|p| p.sub_panels.iter())
            .flat_map(|s| s.items.iter())
            .map(|i| &i.concept)
            .chain(self.panel_filters.iter().map(|f| &f.concept))
            .collect()
    }

    /// Rebuild the definition with each concept slot mapped through `f`.
    pub fn try_map_concepts<D, E>(
        self,
        f: &mut impl FnMut(C) -> Result<D, E>,
    ) -> Result<QueryDefinition<D>, E> {
        let panels = self
            .panels
            .into_iter()
            .map(|panel| {
                let sub_panels = panel
                    .sub_panels
                    .into_iter()
                    .map(|sub| {
                        let items = sub
                            .items
                            .into_iter()
                            .map(|item| {
                                Ok(PanelItem {
                                    concept: f(item.concept)?,
                                    numeric_filter: item.numeric_filter,
                                    recency: item.recency,
                                })
                            })
                            .collect::<Result<Vec<_>, E>>()?;
                        Ok(SubPanel {
                            include: sub.include,
                            minimum_count: sub.minimum_count,
                            join_sequence: sub.join_sequence,
                            items,
                        })
                    })
                    .collect::<Result<Vec<_>, E>>()?;
                Ok(Panel {
                    include: panel.include,
                    date_boundary: panel.date_boundary,
                    sub_panels,
                })
            })
            .collect::<Result<Vec<_>, E>>()?;

        let panel_filters = self
            .panel_filters
            .into_iter()
            .map(|filter| {
                Ok(PanelFilter {
                    concept: f(filter.concept)?,
                    is_inclusion: filter.is_inclusion,
                    is_active: filter.is_active,
                })
            })
            .collect::<Result<Vec<_>, E>>()?;

        Ok(QueryDefinition {
            query_id: self.query_id,
            panels,
            panel_filters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_numeric_filter_argument_counts() {
        let ok = NumericFilter::new(NumericFilterType::Between, &[Some(1.0), Some(5.0)])
            .expect("should accept two bounds");
        assert_eq!(ok.bounds(), &[1.0, 5.0]);

        let missing = NumericFilter::new(NumericFilterType::Between, &[Some(1.0), None]);
        assert!(
            matches!(missing, Err(LeafError::Validation(msg)) if msg == "missing numeric arguments")
        );

        let excessive =
            NumericFilter::new(NumericFilterType::GreaterThan, &[Some(1.0), Some(2.0)]);
        assert!(
            matches!(excessive, Err(LeafError::Validation(msg)) if msg == "excessive numeric arguments")
        );

        let nan = NumericFilter::new(NumericFilterType::EqualTo, &[Some(f64::NAN)]);
        assert!(nan.is_err());
    }

    #[test]
    fn test_relative_bound_resolution() {
        let now = Utc
            .with_ymd_and_hms(2024, 3, 31, 12, 0, 0)
            .single()
            .expect("valid date");
        let back = DateBound::Relative {
            unit: DateUnit::Month,
            increment: -1,
        };
        assert_eq!(
            back.resolve(now),
            Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).single()
        );
        let year = DateBound::Relative {
            unit: DateUnit::Year,
            increment: 1,
        };
        assert_eq!(
            year.resolve(now),
            Utc.with_ymd_and_hms(2025, 3, 31, 12, 0, 0).single()
        );
        assert_eq!(DateBound::Now.resolve(now), Some(now));
    }

    #[test]
    fn test_try_map_concepts_preserves_structure() {
        let definition: QueryDefinition<u32> = QueryDefinition {
            query_id: None,
            panels: vec![Panel {
                include: true,
                date_boundary: None,
                sub_panels: vec![SubPanel {
                    include: true,
                    minimum_count: 2,
                    join_sequence: JoinSequence::Encounter,
                    items: vec![
                        PanelItem {
                            concept: 1,
                            numeric_filter: None,
                            recency: RecencyFilter::Max,
                        },
                        PanelItem {
                            concept: 2,
                            numeric_filter: None,
                            recency: RecencyFilter::None,
                        },
                    ],
                }],
            }],
            panel_filters: vec![PanelFilter {
                concept: 3,
                is_inclusion: false,
                is_active: true,
            }],
        };

        let mapped: QueryDefinition<String> = definition
            .try_map_concepts(&mut |c| Ok::<_, ()>(format!("c{}", c)))
            .expect("mapping should succeed");
        let names: Vec<&String> = mapped.concepts();
        assert_eq!(names, vec!["c1", "c2", "c3"]);
        assert_eq!(mapped.panels[0].sub_panels[0].minimum_count, 2);
        assert_eq!(
            mapped.panels[0].sub_panels[0].items[0].recency,
            RecencyFilter::Max
        );
    }
}
