//! Rendering of sub-panel statements and the aggregate root statement.

use crate::compiler::{CompiledStatement, CompilerOptions, PanelCombination, QueryParameter};
use crate::constants::{EVENT_DATE_COLUMN, SEQUENCE_LOOKBACK_MONTHS};
use crate::dialect::{ColumnType, SqlDialect};
use crate::model::{
    Concept, DateBound, DateBoundary, DateUnit, JoinSequence, NumericFilter, NumericFilterType,
    Panel, PanelItem, RecencyFilter, SubPanel,
};
use crate::LeafResult;
use chrono::{DateTime, NaiveTime, Utc};
use std::sync::Arc;

/// A set of patients feeding the root statement: a panel or a single-concept filter.
pub(crate) enum RootInput {
    Panel { index: usize, include: bool },
    Filter { statement: String, include: bool },
}

pub(crate) struct ProgramBuilder<'a> {
    dialect: &'a dyn SqlDialect,
    options: &'a CompilerOptions,
    pub(crate) statements: Vec<CompiledStatement>,
    pub(crate) parameters: Vec<QueryParameter>,
}

impl<'a> ProgramBuilder<'a> {
    pub(crate) fn new(dialect: &'a dyn SqlDialect, options: &'a CompilerOptions) -> Self {
        Self {
            dialect,
            options,
            statements: Vec::new(),
            parameters: Vec::new(),
        }
    }

    // ==================== Sub-panels ====================

    /// Emit one statement per sub-panel of `panel` and return their names in order.
    pub(crate) fn add_panel(
        &mut self,
        p: usize,
        panel: &Panel<Arc<Concept>>,
    ) -> LeafResult<Vec<String>> {
        let mut names = Vec::with_capacity(panel.sub_panels.len());
        for (s, sub) in panel.sub_panels.iter().enumerate() {
            let name = format!("P{}_S{}", p, s);
            let sql = self.sub_panel_sql(p, s, sub, panel.date_boundary.as_ref())?;
            self.statements.push(CompiledStatement {
                name: name.clone(),
                sql,
            });
            names.push(name);
        }
        Ok(names)
    }

    /// Emit a single-item statement for a panel filter and return its name.
    pub(crate) fn add_filter(&mut self, name: String, concept: &Arc<Concept>) -> String {
        let item = PanelItem {
            concept: Arc::clone(concept),
            numeric_filter: None,
            recency: RecencyFilter::None,
        };
        let alias = format!("{}_0", name);
        let sql = self.item_sql(&alias, &item, &DateScope::None);
        self.statements.push(CompiledStatement {
            name: name.clone(),
            sql,
        });
        name
    }

    fn sub_panel_sql(
        &mut self,
        p: usize,
        s: usize,
        sub: &SubPanel<Arc<Concept>>,
        boundary: Option<&DateBoundary>,
    ) -> LeafResult<String> {
        if sub.items.is_empty() {
            return Ok(self.empty_set_sql());
        }
        let scope = match boundary {
            None => DateScope::None,
            Some(b) if s == 0 => DateScope::Within(*b),
            Some(b) => DateScope::LookBack(b.start),
        };
        let items: Vec<String> = sub
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| self.item_sql(&format!("S{}_{}_{}", p, s, i), item, &scope))
            .collect();
        Ok(items.join("\nUNION ALL\n"))
    }

    fn empty_set_sql(&self) -> String {
        let from = self
            .dialect
            .dual_table()
            .map(|t| format!(" FROM {}", t))
            .unwrap_or_default();
        format!(
            "SELECT NULL AS {}, NULL AS {}, NULL AS {}{} WHERE 1 = 0",
            self.options.field_person_id,
            self.options.field_encounter_id,
            EVENT_DATE_COLUMN,
            from
        )
    }

    fn item_sql(&mut self, alias: &str, item: &PanelItem<Arc<Concept>>, scope: &DateScope) -> String {
        let concept = &item.concept;
        let person = format!("{}.{}", alias, self.options.field_person_id);
        let encounter = if concept.is_encounter_based {
            format!("{}.{}", alias, self.options.field_encounter_id)
        } else {
            "NULL".to_string()
        };
        let date = if concept.is_encounter_based {
            concept
                .sql_field_date
                .as_deref()
                .map(|field| self.fragment(field, alias))
        } else {
            None
        };

        let mut conditions = Vec::new();
        if let Some(predicate) = &concept.sql_set_where {
            conditions.push(format!("({})", self.fragment(predicate, alias)));
        }
        if let Some(date) = &date {
            if let Some(condition) = self.date_condition(date, scope) {
                conditions.push(condition);
            }
        }
        if let (Some(filter), Some(field)) = (&item.numeric_filter, &concept.sql_field_numeric) {
            let field = self.fragment(field, alias);
            conditions.push(self.numeric_condition(&field, filter));
        }

        let date_column = date.clone().unwrap_or_else(|| "NULL".to_string());
        let mut select = format!(
            "SELECT {} AS {}, {} AS {}, {} AS {}",
            person,
            self.options.field_person_id,
            encounter,
            self.options.field_encounter_id,
            date_column,
            EVENT_DATE_COLUMN
        );

        let ranked = match (item.recency, &date) {
            (RecencyFilter::Min, Some(date)) => Some(format!("{} ASC", date)),
            (RecencyFilter::Max, Some(date)) => Some(format!("{} DESC", date)),
            _ => None,
        };
        if let Some(order) = &ranked {
            select.push_str(&format!(
                ", ROW_NUMBER() OVER (PARTITION BY {} ORDER BY {}) AS RecencyRank",
                person, order
            ));
        }

        let mut sql = format!(
            "{} FROM {} {}",
            select,
            self.fragment(&concept.sql_set_from, alias),
            alias
        );
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        if ranked.is_some() {
            let outer = format!("R{}", alias);
            sql = format!(
                "SELECT {o}.{}, {o}.{}, {o}.{} FROM ({}) {o} WHERE {o}.RecencyRank = 1",
                self.options.field_person_id,
                self.options.field_encounter_id,
                EVENT_DATE_COLUMN,
                sql,
                o = outer
            );
        }
        sql
    }

    fn fragment(&self, text: &str, alias: &str) -> String {
        text.replace(&format!("{}.", self.options.alias_marker), &format!("{}.", alias))
    }

    fn date_condition(&self, date: &str, scope: &DateScope) -> Option<String> {
        match scope {
            DateScope::None => None,
            DateScope::Within(boundary) => Some(format!(
                "{} BETWEEN {} AND {}",
                date,
                self.bound_expr(&boundary.start, BoundSide::Start),
                self.bound_expr(&boundary.end, BoundSide::End)
            )),
            DateScope::LookBack(start) => Some(format!(
                "{} >= {}",
                date,
                self.dialect.date_add(
                    DateUnit::Month,
                    SEQUENCE_LOOKBACK_MONTHS,
                    &self.bound_expr(start, BoundSide::Start)
                )
            )),
        }
    }

    fn bound_expr(&self, bound: &DateBound, side: BoundSide) -> String {
        match bound {
            DateBound::Now => self.dialect.now().to_string(),
            DateBound::Relative { unit, increment } => {
                self.dialect.date_add(*unit, *increment, self.dialect.now())
            }
            DateBound::Specific(at) => self
                .dialect
                .convert(ColumnType::Date, &format!("'{}'", day_edge(*at, side))),
        }
    }

    fn numeric_condition(&mut self, field: &str, filter: &NumericFilter) -> String {
        let markers: Vec<String> = filter
            .bounds()
            .iter()
            .map(|value| {
                let name = format!("p{}", self.parameters.len());
                let marker = self.dialect.param_marker(&name);
                self.parameters.push(QueryParameter {
                    name,
                    column_type: ColumnType::Decimal,
                    value: *value,
                });
                self.dialect.convert(ColumnType::Decimal, &marker)
            })
            .collect();
        match (filter.filter_type(), markers.as_slice()) {
            (NumericFilterType::Between, [low, high]) => {
                format!("{} BETWEEN {} AND {}", field, low, high)
            }
            (filter_type, [value, ..]) => format!(
                "{} {} {}",
                field,
                filter_type.symbol().unwrap_or("="),
                value
            ),
            (_, []) => "1 = 0".to_string(),
        }
    }

    // ==================== Panels and root ====================

    /// Patient set of one panel, relating later sub-panels to the anchor.
    pub(crate) fn panel_sql(
        &self,
        p: usize,
        panel: &Panel<Arc<Concept>>,
        names: &[String],
    ) -> String {
        let person = &self.options.field_person_id;
        let anchor = format!("A{}", p);
        let mut sql = format!(
            "SELECT {a}.{person} FROM {} {a}",
            names[0],
            a = anchor,
            person = person
        );

        let mut conditions = Vec::new();
        for (s, sub) in panel.sub_panels.iter().enumerate().skip(1) {
            let alias = format!("B{}_{}", p, s);
            let mut correlated = vec![format!(
                "{b}.{person} = {a}.{person}",
                b = alias,
                a = anchor,
                person = person
            )];
            if let Some(join) = self.join_condition(&alias, &anchor, &sub.join_sequence) {
                correlated.push(join);
            }
            let mut exists = format!(
                "SELECT 1 FROM {} {} WHERE {}",
                names[s],
                alias,
                correlated.join(" AND ")
            );
            if sub.has_count_filter() {
                exists.push_str(&format!(
                    " GROUP BY {b}.{person} HAVING COUNT(DISTINCT {b}.{date}) >= {n}",
                    b = alias,
                    person = person,
                    date = EVENT_DATE_COLUMN,
                    n = sub.minimum_count
                ));
            }
            let keyword = if sub.include { "EXISTS" } else { "NOT EXISTS" };
            conditions.push(format!("{} ({})", keyword, exists));
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        sql.push_str(&format!(" GROUP BY {}.{}", anchor, person));
        if let Some(first) = panel.sub_panels.first() {
            if first.has_count_filter() {
                sql.push_str(&format!(
                    " HAVING COUNT(DISTINCT {}.{}) >= {}",
                    anchor, EVENT_DATE_COLUMN, first.minimum_count
                ));
            }
        }
        sql
    }

    fn join_condition(&self, later: &str, anchor: &str, join: &JoinSequence) -> Option<String> {
        let later_date = format!("{}.{}", later, EVENT_DATE_COLUMN);
        let anchor_date = format!("{}.{}", anchor, EVENT_DATE_COLUMN);
        match join {
            JoinSequence::Encounter => Some(format!(
                "{l}.{e} = {a}.{e}",
                l = later,
                a = anchor,
                e = self.options.field_encounter_id
            )),
            JoinSequence::Event => None,
            JoinSequence::PlusMinus { increment, unit } => {
                let n = clamp_increment(*increment);
                Some(format!(
                    "{} BETWEEN {} AND {}",
                    later_date,
                    self.dialect.date_add(*unit, -n, &anchor_date),
                    self.dialect.date_add(*unit, n, &anchor_date)
                ))
            }
            JoinSequence::WithinFollowing { increment, unit } => Some(format!(
                "{l} > {a} AND {l} <= {}",
                self.dialect
                    .date_add(*unit, clamp_increment(*increment), &anchor_date),
                l = later_date,
                a = anchor_date
            )),
            JoinSequence::AnytimeFollowing => Some(format!("{} > {}", later_date, anchor_date)),
        }
    }

    /// The root statement returning the distinct qualifying patients.
    pub(crate) fn root_sql(
        &self,
        panels: &[String],
        inputs: &[RootInput],
        combination: PanelCombination,
    ) -> LeafResult<String> {
        let person = &self.options.field_person_id;
        let source = |input: &RootInput| match input {
            RootInput::Panel { index, .. } => format!("({})", panels[*index]),
            RootInput::Filter { statement, .. } => statement.clone(),
        };
        let included = |input: &RootInput| match input {
            RootInput::Panel { include, .. } | RootInput::Filter { include, .. } => *include,
        };

        let (driver_pos, driver) = inputs
            .iter()
            .enumerate()
            .find(|(_, input)| matches!(input, RootInput::Panel { include: true, .. }))
            .ok_or_else(|| {
                crate::LeafError::Validation("query requires at least one inclusion panel".into())
            })?;

        match combination {
            PanelCombination::Exists => {
                let mut sql = format!(
                    "SELECT DISTINCT Q{i}.{person} FROM {} Q{i}",
                    source(driver),
                    i = driver_pos,
                    person = person
                );
                let conditions: Vec<String> = inputs
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != driver_pos)
                    .map(|(i, input)| {
                        format!(
                            "{} (SELECT 1 FROM {} Q{i} WHERE Q{i}.{person} = Q{d}.{person})",
                            if included(input) { "EXISTS" } else { "NOT EXISTS" },
                            source(input),
                            i = i,
                            d = driver_pos,
                            person = person
                        )
                    })
                    .collect();
                if !conditions.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&conditions.join(" AND "));
                }
                Ok(sql)
            }
            PanelCombination::SetOperations => {
                let select = |i: usize, input: &RootInput| {
                    format!("SELECT Q{i}.{person} FROM {} Q{i}", source(input), i = i, person = person)
                };
                let mut sql = select(driver_pos, driver);
                for (i, input) in inputs.iter().enumerate() {
                    if i != driver_pos && included(input) {
                        sql.push_str(&format!("\n{}\n{}", self.dialect.intersect()?, select(i, input)));
                    }
                }
                for (i, input) in inputs.iter().enumerate() {
                    if !included(input) {
                        sql.push_str(&format!("\n{}\n{}", self.dialect.except()?, select(i, input)));
                    }
                }
                Ok(sql)
            }
        }
    }
}

enum DateScope {
    None,
    Within(DateBoundary),
    LookBack(DateBound),
}

#[derive(Clone, Copy)]
enum BoundSide {
    Start,
    End,
}

/// Start bounds begin at midnight, end bounds close at 23:59:59 of their day.
fn day_edge(at: DateTime<Utc>, side: BoundSide) -> String {
    let time = match side {
        BoundSide::Start => NaiveTime::MIN,
        BoundSide::End => NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN),
    };
    at.date_naive()
        .and_time(time)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn clamp_increment(increment: u32) -> i32 {
    i32::try_from(increment).unwrap_or(i32::MAX)
}
