//! Panel compiler.
//!
//! Turns a resolved query into a CTE program: one named statement per sub-panel (panel
//! filters and global filters count as single-item sub-panels) and one aggregate statement
//! returning the distinct qualifying patient ids. Numeric bounds only ever reach SQL as
//! dialect parameters.

mod sql;
pub mod validation;

use crate::constants::{DEFAULT_ALIAS_MARKER, DEFAULT_FIELD_ENCOUNTER_ID, DEFAULT_FIELD_PERSON_ID};
use crate::dialect::{ColumnType, SqlDialect, SqlDialectKind};
use crate::model::{GlobalPanelFilter, ResolvedQuery};
use crate::LeafResult;
use chrono::{DateTime, Utc};
use sql::{ProgramBuilder, RootInput};
use std::sync::Arc;

/// How panels are combined in the aggregate statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanelCombination {
    /// Correlated `EXISTS` / `NOT EXISTS` against the first inclusion panel.
    #[default]
    Exists,
    /// `INTERSECT` / `EXCEPT` between panel result sets.
    SetOperations,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerOptions {
    pub field_person_id: String,
    pub field_encounter_id: String,
    pub alias_marker: String,
    pub combination: PanelCombination,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            field_person_id: DEFAULT_FIELD_PERSON_ID.into(),
            field_encounter_id: DEFAULT_FIELD_ENCOUNTER_ID.into(),
            alias_marker: DEFAULT_ALIAS_MARKER.into(),
            combination: PanelCombination::Exists,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    pub name: String,
    pub sql: String,
}

/// A bound parameter. Values are logged only by name.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParameter {
    pub name: String,
    pub column_type: ColumnType,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    dialect: SqlDialectKind,
    statements: Vec<CompiledStatement>,
    aggregate: String,
    parameters: Vec<QueryParameter>,
    declarations: Vec<String>,
}

impl CompiledQuery {
    pub fn dialect(&self) -> SqlDialectKind {
        self.dialect
    }

    /// Sub-panel statements in dependency order.
    pub fn statements(&self) -> &[CompiledStatement] {
        &self.statements
    }

    pub fn aggregate(&self) -> &str {
        &self.aggregate
    }

    pub fn parameters(&self) -> &[QueryParameter] {
        &self.parameters
    }

    /// Each sub-panel statement followed by the aggregate statement.
    pub fn statement_texts(&self) -> Vec<String> {
        self.statements
            .iter()
            .map(|s| format!("{} AS ({})", s.name, s.sql))
            .chain(std::iter::once(self.aggregate.clone()))
            .collect()
    }

    /// The executable program with parameter markers left for binding.
    pub fn sql(&self) -> String {
        if self.statements.is_empty() {
            return self.aggregate.clone();
        }
        let ctes: Vec<String> = self
            .statements
            .iter()
            .map(|s| format!("{} AS (\n{}\n)", s.name, s.sql))
            .collect();
        format!("WITH {}\n{}", ctes.join(",\n"), self.aggregate)
    }

    /// The program preceded by parameter declarations, for script-based backends and audit.
    pub fn script(&self) -> String {
        if self.declarations.is_empty() {
            return self.sql();
        }
        format!("{}\n{}", self.declarations.join("\n"), self.sql())
    }
}

#[derive(Debug, Clone)]
pub struct PanelCompiler {
    dialect: Arc<dyn SqlDialect>,
    options: CompilerOptions,
}

impl PanelCompiler {
    pub fn new(dialect: Arc<dyn SqlDialect>, options: CompilerOptions) -> Self {
        Self { dialect, options }
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    /// Compile a resolved query.
    ///
    /// # Arguments
    /// * `query` - Query with every concept resolved
    /// * `global_filters` - Global panel filters already selected for the session
    ///
    /// # Errors
    /// Returns `LeafError::Validation` for malformed graphs and `LeafError::Dialect` when the
    /// dialect lacks a capability the query needs. Nothing is rendered in either case.
    pub fn compile(
        &self,
        query: &ResolvedQuery,
        global_filters: &[GlobalPanelFilter],
    ) -> LeafResult<CompiledQuery> {
        self.compile_at(query, global_filters, Utc::now())
    }

    /// As [`PanelCompiler::compile`], validating relative date boundaries against `now`.
    pub fn compile_at(
        &self,
        query: &ResolvedQuery,
        global_filters: &[GlobalPanelFilter],
        now: DateTime<Utc>,
    ) -> LeafResult<CompiledQuery> {
        let dialect = self.dialect.as_ref();
        validation::validate_query(query, global_filters, dialect, &self.options, now)?;

        let mut builder = ProgramBuilder::new(dialect, &self.options);
        let mut panels = Vec::with_capacity(query.panels.len());
        let mut inputs = Vec::new();

        for (p, panel) in query.panels.iter().enumerate() {
            let names = builder.add_panel(p, panel)?;
            panels.push(builder.panel_sql(p, panel, &names));
            inputs.push(RootInput::Panel {
                index: p,
                include: panel.include,
            });
        }

        let active_filters = query.panel_filters.iter().filter(|f| f.is_active);
        for (k, filter) in active_filters.enumerate() {
            let statement = builder.add_filter(format!("F{}", k), &filter.concept);
            inputs.push(RootInput::Filter {
                statement,
                include: filter.is_inclusion,
            });
        }
        for (k, filter) in global_filters.iter().enumerate() {
            let statement = builder.add_filter(format!("G{}", k), &filter.concept);
            inputs.push(RootInput::Filter {
                statement,
                include: filter.is_inclusion,
            });
        }

        let aggregate = builder.root_sql(&panels, &inputs, self.options.combination)?;

        let mut declarations = Vec::with_capacity(builder.parameters.len());
        for parameter in &builder.parameters {
            declarations.push(dialect.declare_param(
                &parameter.name,
                parameter.column_type,
                &parameter.value.to_string(),
            )?);
        }

        Ok(CompiledQuery {
            dialect: dialect.kind(),
            statements: builder.statements,
            aggregate,
            parameters: builder.parameters,
            declarations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{dialect_for, DialectError, DialectFeature};
    use crate::model::{
        Concept, DateBound, DateBoundary, DateUnit, JoinSequence, NumericFilter,
        NumericFilterType, Panel, PanelFilter, PanelItem, QueryDefinition, RecencyFilter,
        SubPanel,
    };
    use crate::LeafError;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn encounter_concept(name: &str) -> Arc<Concept> {
        Arc::new(Concept {
            id: Uuid::new_v4(),
            urn: None,
            display_name: name.into(),
            is_encounter_based: true,
            sql_set_from: "dbo.Encounter".into(),
            sql_set_where: Some(format!("@.Type = '{}'", name)),
            sql_field_date: Some("@.AdmitDate".into()),
            sql_field_numeric: None,
            numeric_unit: None,
            allowed_roles: vec![],
        })
    }

    fn lab_concept() -> Arc<Concept> {
        Arc::new(Concept {
            id: Uuid::new_v4(),
            urn: None,
            display_name: "Hemoglobin A1c".into(),
            is_encounter_based: true,
            sql_set_from: "dbo.Labs".into(),
            sql_set_where: Some("@.Loinc = '4548-4'".into()),
            sql_field_date: Some("@.ResultDate".into()),
            sql_field_numeric: Some("@.Value".into()),
            numeric_unit: Some("%".into()),
            allowed_roles: vec![],
        })
    }

    fn person_concept(name: &str) -> Arc<Concept> {
        Arc::new(Concept {
            id: Uuid::new_v4(),
            urn: None,
            display_name: name.into(),
            is_encounter_based: false,
            sql_set_from: "dbo.Person".into(),
            sql_set_where: Some("@.IsVip = 1".into()),
            sql_field_date: None,
            sql_field_numeric: None,
            numeric_unit: None,
            allowed_roles: vec![],
        })
    }

    fn item(concept: Arc<Concept>) -> PanelItem<Arc<Concept>> {
        PanelItem {
            concept,
            numeric_filter: None,
            recency: RecencyFilter::None,
        }
    }

    fn sub_panel(
        join_sequence: JoinSequence,
        items: Vec<PanelItem<Arc<Concept>>>,
    ) -> SubPanel<Arc<Concept>> {
        SubPanel {
            include: true,
            minimum_count: 1,
            join_sequence,
            items,
        }
    }

    fn panel(sub_panels: Vec<SubPanel<Arc<Concept>>>) -> Panel<Arc<Concept>> {
        Panel {
            include: true,
            date_boundary: None,
            sub_panels,
        }
    }

    fn query(panels: Vec<Panel<Arc<Concept>>>) -> ResolvedQuery {
        QueryDefinition {
            query_id: None,
            panels,
            panel_filters: vec![],
        }
    }

    fn compiler(kind: SqlDialectKind) -> PanelCompiler {
        PanelCompiler::new(dialect_for(kind), CompilerOptions::default())
    }

    #[test]
    fn test_one_statement_per_sub_panel_plus_aggregate() {
        let q = query(vec![
            panel(vec![
                sub_panel(JoinSequence::Encounter, vec![item(encounter_concept("ED"))]),
                sub_panel(
                    JoinSequence::AnytimeFollowing,
                    vec![item(encounter_concept("Inpatient")), item(lab_concept())],
                ),
            ]),
            Panel {
                include: false,
                ..panel(vec![sub_panel(
                    JoinSequence::Encounter,
                    vec![item(encounter_concept("Hospice"))],
                )])
            },
        ]);
        for kind in SqlDialectKind::ALL {
            let compiled = compiler(kind).compile(&q, &[]).expect("should compile");
            assert_eq!(compiled.statements().len(), 3, "{}", kind);
            assert_eq!(compiled.statement_texts().len(), 4, "{}", kind);
            assert!(compiled.aggregate().contains("NOT EXISTS"), "{}", kind);
        }
    }

    #[test]
    fn test_numeric_bounds_are_always_parameters() {
        let mut gt = item(lab_concept());
        gt.numeric_filter = Some(
            NumericFilter::new(NumericFilterType::GreaterThan, &[Some(6.55)])
                .expect("valid filter"),
        );
        let mut between = item(lab_concept());
        between.numeric_filter = Some(
            NumericFilter::new(NumericFilterType::Between, &[Some(10.25), Some(20.75)])
                .expect("valid filter"),
        );
        let q = query(vec![panel(vec![sub_panel(
            JoinSequence::Encounter,
            vec![gt, between],
        )])]);

        let compiled = compiler(SqlDialectKind::TSql)
            .compile(&q, &[])
            .expect("should compile");
        let sql = compiled.sql();
        for literal in ["6.55", "10.25", "20.75"] {
            assert!(!sql.contains(literal), "bound {} interpolated into SQL", literal);
        }
        assert!(sql.contains("S0_0_0.Value > CONVERT(DECIMAL(18,3), @p0)"));
        assert!(sql.contains(
            "S0_0_1.Value BETWEEN CONVERT(DECIMAL(18,3), @p1) AND CONVERT(DECIMAL(18,3), @p2)"
        ));
        let values: Vec<f64> = compiled.parameters().iter().map(|p| p.value).collect();
        assert_eq!(values, vec![6.55, 10.25, 20.75]);
        assert!(compiled
            .script()
            .starts_with("DECLARE @p0 DECIMAL(18,3) = 6.55;"));
    }

    #[test]
    fn test_bigquery_rejects_parameters_at_compile_time() {
        let mut filtered = item(lab_concept());
        filtered.numeric_filter = Some(
            NumericFilter::new(NumericFilterType::EqualTo, &[Some(7.0)]).expect("valid filter"),
        );
        let q = query(vec![panel(vec![sub_panel(
            JoinSequence::Encounter,
            vec![filtered],
        )])]);
        let result = compiler(SqlDialectKind::BigQuery).compile(&q, &[]);
        assert!(matches!(
            result,
            Err(LeafError::Dialect(DialectError::Unsupported {
                feature: DialectFeature::DeclareParam,
                ..
            }))
        ));
    }

    #[test]
    fn test_set_operations_consult_capabilities() {
        let mut q = query(vec![panel(vec![sub_panel(
            JoinSequence::Encounter,
            vec![item(encounter_concept("ED"))],
        )])]);
        q.panel_filters.push(PanelFilter {
            concept: person_concept("VIP"),
            is_inclusion: false,
            is_active: true,
        });
        let options = CompilerOptions {
            combination: PanelCombination::SetOperations,
            ..CompilerOptions::default()
        };

        let mysql = PanelCompiler::new(dialect_for(SqlDialectKind::MySql), options.clone());
        assert!(matches!(
            mysql.compile(&q, &[]),
            Err(LeafError::Dialect(DialectError::Unsupported {
                feature: DialectFeature::Except,
                ..
            }))
        ));

        let oracle = PanelCompiler::new(dialect_for(SqlDialectKind::PlSql), options);
        let compiled = oracle.compile(&q, &[]).expect("PL/SQL supports MINUS");
        assert!(compiled.aggregate().contains("\nMINUS\nSELECT Q1.PersonId FROM F0 Q1"));

        let exists = compiler(SqlDialectKind::MySql)
            .compile(&q, &[])
            .expect("EXISTS combination needs no set operators");
        assert!(exists.aggregate().contains("NOT EXISTS (SELECT 1 FROM F0 Q1"));
    }

    #[test]
    fn test_structural_validation_failures() {
        let empty = query(vec![]);
        assert!(matches!(
            compiler(SqlDialectKind::TSql).compile(&empty, &[]),
            Err(LeafError::Validation(msg)) if msg == "query has no panels"
        ));

        let only_exclusions = query(vec![Panel {
            include: false,
            ..panel(vec![sub_panel(
                JoinSequence::Encounter,
                vec![item(encounter_concept("ED"))],
            )])
        }]);
        assert!(matches!(
            compiler(SqlDialectKind::TSql).compile(&only_exclusions, &[]),
            Err(LeafError::Validation(_))
        ));

        let empty_anchor = query(vec![panel(vec![sub_panel(JoinSequence::Encounter, vec![])])]);
        assert!(matches!(
            compiler(SqlDialectKind::TSql).compile(&empty_anchor, &[]),
            Err(LeafError::Validation(msg)) if msg.contains("anchor sub-panel is empty")
        ));

        let mut no_numeric_field = item(encounter_concept("ED"));
        no_numeric_field.numeric_filter = Some(
            NumericFilter::new(NumericFilterType::LessThan, &[Some(1.0)]).expect("valid filter"),
        );
        let q = query(vec![panel(vec![sub_panel(
            JoinSequence::Encounter,
            vec![no_numeric_field],
        )])]);
        assert!(matches!(
            compiler(SqlDialectKind::TSql).compile(&q, &[]),
            Err(LeafError::Validation(msg)) if msg.contains("no numeric field")
        ));

        let sequence_without_dates = query(vec![panel(vec![
            sub_panel(JoinSequence::Encounter, vec![item(person_concept("VIP"))]),
            sub_panel(
                JoinSequence::AnytimeFollowing,
                vec![item(encounter_concept("ED"))],
            ),
        ])]);
        assert!(compiler(SqlDialectKind::TSql)
            .compile(&sequence_without_dates, &[])
            .is_err());
    }

    #[test]
    fn test_empty_included_sub_panel_excludes_everyone() {
        let q = query(vec![panel(vec![
            sub_panel(JoinSequence::Encounter, vec![item(encounter_concept("ED"))]),
            sub_panel(JoinSequence::Event, vec![]),
        ])]);
        let compiled = compiler(SqlDialectKind::PlSql)
            .compile(&q, &[])
            .expect("should compile");
        assert_eq!(
            compiled.statements()[1].sql,
            "SELECT NULL AS PersonId, NULL AS EncounterId, NULL AS EventDate FROM DUAL WHERE 1 = 0"
        );
        assert!(compiled
            .aggregate()
            .contains("EXISTS (SELECT 1 FROM P0_S1 B0_1 WHERE B0_1.PersonId = A0.PersonId)"));
    }

    #[test]
    fn test_join_sequences_render_against_anchor() {
        let q = query(vec![panel(vec![
            sub_panel(JoinSequence::Encounter, vec![item(encounter_concept("ED"))]),
            sub_panel(
                JoinSequence::PlusMinus {
                    increment: 3,
                    unit: DateUnit::Day,
                },
                vec![item(encounter_concept("Imaging"))],
            ),
            sub_panel(
                JoinSequence::WithinFollowing {
                    increment: 2,
                    unit: DateUnit::Week,
                },
                vec![item(encounter_concept("Inpatient"))],
            ),
            SubPanel {
                include: false,
                minimum_count: 2,
                ..sub_panel(
                    JoinSequence::Encounter,
                    vec![item(encounter_concept("Discharge"))],
                )
            },
        ])]);
        let compiled = compiler(SqlDialectKind::TSql)
            .compile(&q, &[])
            .expect("should compile");
        let root = compiled.aggregate();
        assert!(root.contains(
            "B0_1.EventDate BETWEEN DATEADD(DAY, -3, A0.EventDate) AND DATEADD(DAY, 3, A0.EventDate)"
        ));
        assert!(root.contains(
            "B0_2.EventDate > A0.EventDate AND B0_2.EventDate <= DATEADD(WEEK, 2, A0.EventDate)"
        ));
        assert!(root.contains(
            "NOT EXISTS (SELECT 1 FROM P0_S3 B0_3 WHERE B0_3.PersonId = A0.PersonId AND B0_3.EncounterId = A0.EncounterId GROUP BY B0_3.PersonId HAVING COUNT(DISTINCT B0_3.EventDate) >= 2)"
        ));
    }

    #[test]
    fn test_date_boundary_and_lookback() {
        let start = Utc
            .with_ymd_and_hms(2023, 1, 15, 8, 30, 0)
            .single()
            .expect("valid date");
        let end = Utc
            .with_ymd_and_hms(2023, 6, 30, 8, 30, 0)
            .single()
            .expect("valid date");
        let mut dated = panel(vec![
            sub_panel(JoinSequence::Encounter, vec![item(encounter_concept("ED"))]),
            sub_panel(
                JoinSequence::AnytimeFollowing,
                vec![item(encounter_concept("Inpatient"))],
            ),
        ]);
        dated.date_boundary = Some(DateBoundary {
            start: DateBound::Specific(start),
            end: DateBound::Specific(end),
        });
        let compiled = compiler(SqlDialectKind::TSql)
            .compile(&query(vec![dated.clone()]), &[])
            .expect("should compile");
        assert!(compiled.statements()[0].sql.contains(
            "S0_0_0.AdmitDate BETWEEN CONVERT(DATETIME, '2023-01-15 00:00:00') AND CONVERT(DATETIME, '2023-06-30 23:59:59')"
        ));
        assert!(compiled.statements()[1].sql.contains(
            "S0_1_0.AdmitDate >= DATEADD(MONTH, -6, CONVERT(DATETIME, '2023-01-15 00:00:00'))"
        ));

        dated.date_boundary = Some(DateBoundary {
            start: DateBound::Specific(end),
            end: DateBound::Specific(start),
        });
        assert!(matches!(
            compiler(SqlDialectKind::TSql).compile(&query(vec![dated]), &[]),
            Err(LeafError::Validation(msg)) if msg.contains("starts after it ends")
        ));
    }

    #[test]
    fn test_relative_boundaries_use_dialect_now() {
        let mut recent = panel(vec![sub_panel(
            JoinSequence::Encounter,
            vec![item(encounter_concept("ED"))],
        )]);
        recent.date_boundary = Some(DateBoundary {
            start: DateBound::Relative {
                unit: DateUnit::Year,
                increment: -1,
            },
            end: DateBound::Now,
        });
        let compiled = compiler(SqlDialectKind::BigQuery)
            .compile(&query(vec![recent]), &[])
            .expect("should compile");
        assert!(compiled.statements()[0].sql.contains(
            "S0_0_0.AdmitDate BETWEEN DATETIME_SUB(CURRENT_DATETIME(), INTERVAL 1 YEAR) AND CURRENT_DATETIME()"
        ));
    }

    #[test]
    fn test_recency_filter_ranks_dates() {
        let mut latest = item(encounter_concept("ED"));
        latest.recency = RecencyFilter::Max;
        let compiled = compiler(SqlDialectKind::PostgreSql)
            .compile(
                &query(vec![panel(vec![sub_panel(JoinSequence::Encounter, vec![latest])])]),
                &[],
            )
            .expect("should compile");
        let sql = &compiled.statements()[0].sql;
        assert!(sql.contains(
            "ROW_NUMBER() OVER (PARTITION BY S0_0_0.PersonId ORDER BY S0_0_0.AdmitDate DESC) AS RecencyRank"
        ));
        assert!(sql.ends_with("WHERE RS0_0_0.RecencyRank = 1"));
    }

    #[test]
    fn test_illegal_fragments_are_rejected() {
        let mut concept = (*encounter_concept("ED")).clone();
        concept.sql_set_where = Some("@.Type = 'ED'; DROP TABLE dbo.Person".into());
        let q = query(vec![panel(vec![sub_panel(
            JoinSequence::Encounter,
            vec![item(Arc::new(concept.clone()))],
        )])]);
        assert!(compiler(SqlDialectKind::TSql).compile(&q, &[]).is_err());

        concept.sql_set_where = Some("@.Type IN (SELECT x FROM y) OR 1 = (DELETE)".into());
        let q = query(vec![panel(vec![sub_panel(
            JoinSequence::Encounter,
            vec![item(Arc::new(concept))],
        )])]);
        assert!(matches!(
            compiler(SqlDialectKind::TSql).compile(&q, &[]),
            Err(LeafError::Validation(msg)) if msg.contains("illegal command DELETE")
        ));
    }

    #[test]
    fn test_global_filters_become_statements() {
        let q = query(vec![panel(vec![sub_panel(
            JoinSequence::Encounter,
            vec![item(encounter_concept("ED"))],
        )])]);
        let global = GlobalPanelFilter {
            id: Uuid::new_v4(),
            session_type: None,
            is_inclusion: false,
            concept: person_concept("Opt-out"),
        };
        let compiled = compiler(SqlDialectKind::TSql)
            .compile(&q, &[global])
            .expect("should compile");
        assert_eq!(compiled.statements().len(), 2);
        assert_eq!(compiled.statements()[1].name, "G0");
        assert!(compiled
            .aggregate()
            .contains("NOT EXISTS (SELECT 1 FROM G0 Q1 WHERE Q1.PersonId = Q0.PersonId)"));
    }
}
