//! Structural validation of resolved queries.
//!
//! Everything that would otherwise surface as a backend SQL failure is rejected here,
//! before any statement is rendered.

use crate::compiler::{CompilerOptions, PanelCombination};
use crate::constants::ILLEGAL_SQL_COMMANDS;
use crate::dialect::{require, DialectFeature, SqlDialect};
use crate::model::{Concept, GlobalPanelFilter, Panel, ResolvedQuery};
use crate::{LeafError, LeafResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub fn validate_query(
    query: &ResolvedQuery,
    global_filters: &[GlobalPanelFilter],
    dialect: &dyn SqlDialect,
    options: &CompilerOptions,
    now: DateTime<Utc>,
) -> LeafResult<()> {
    if query.panels.is_empty() {
        return Err(LeafError::Validation("query has no panels".into()));
    }
    if !query.panels.iter().any(|p| p.include) {
        return Err(LeafError::Validation(
            "query requires at least one inclusion panel".into(),
        ));
    }

    for (p, panel) in query.panels.iter().enumerate() {
        validate_panel(p, panel, now)?;
    }

    let filter_concepts = query
        .panel_filters
        .iter()
        .filter(|f| f.is_active)
        .map(|f| &f.concept)
        .chain(global_filters.iter().map(|f| &f.concept));
    for concept in query.concepts().into_iter().chain(filter_concepts) {
        validate_fragments(concept)?;
    }

    validate_capabilities(query, global_filters, dialect, options)
}

fn validate_panel(p: usize, panel: &Panel<Arc<Concept>>, now: DateTime<Utc>) -> LeafResult<()> {
    let anchor = panel
        .sub_panels
        .first()
        .ok_or_else(|| LeafError::Validation(format!("panel {} has no sub-panels", p)))?;
    if anchor.items.is_empty() {
        return Err(LeafError::Validation(format!(
            "panel {} anchor sub-panel is empty",
            p
        )));
    }
    if !anchor.include {
        return Err(LeafError::Validation(format!(
            "panel {} anchor sub-panel must be an inclusion",
            p
        )));
    }

    if let Some(boundary) = &panel.date_boundary {
        let start = boundary.start.resolve(now);
        let end = boundary.end.resolve(now);
        match (start, end) {
            (Some(start), Some(end)) if start.date_naive() > end.date_naive() => {
                return Err(LeafError::Validation(format!(
                    "panel {} date boundary starts after it ends",
                    p
                )));
            }
            (Some(_), Some(_)) => {}
            _ => {
                return Err(LeafError::Validation(format!(
                    "panel {} date boundary is out of range",
                    p
                )));
            }
        }
    }

    let anchor_has_dates = anchor.items.iter().all(|i| i.concept.has_dates());
    let anchor_has_encounters = anchor.items.iter().all(|i| i.concept.is_encounter_based);

    for (s, sub) in panel.sub_panels.iter().enumerate() {
        let has_dates = sub.items.iter().all(|i| i.concept.has_dates());

        if s > 0 {
            if sub.join_sequence.needs_dates() && !(anchor_has_dates && has_dates) {
                return Err(LeafError::Validation(format!(
                    "panel {} sub-panel {} sequence requires dated, encounter-based concepts",
                    p, s
                )));
            }
            if sub.join_sequence == crate::model::JoinSequence::Encounter
                && !(anchor_has_encounters
                    && sub.items.iter().all(|i| i.concept.is_encounter_based))
            {
                return Err(LeafError::Validation(format!(
                    "panel {} sub-panel {} same-encounter join requires encounter-based concepts",
                    p, s
                )));
            }
        }

        if sub.has_count_filter() && !has_dates {
            return Err(LeafError::Validation(format!(
                "panel {} sub-panel {} count filter requires dated, encounter-based concepts",
                p, s
            )));
        }

        for (i, item) in sub.items.iter().enumerate() {
            if item.numeric_filter.is_some() && item.concept.sql_field_numeric.is_none() {
                return Err(LeafError::Validation(format!(
                    "panel {} sub-panel {} item {}: concept '{}' has no numeric field",
                    p, s, i, item.concept.display_name
                )));
            }
            if item.recency != crate::model::RecencyFilter::None && !item.concept.has_dates() {
                return Err(LeafError::Validation(format!(
                    "panel {} sub-panel {} item {}: recency filter requires a dated concept",
                    p, s, i
                )));
            }
        }
    }
    Ok(())
}

/// Reject concept fragments carrying statements other than a query.
pub fn validate_fragments(concept: &Concept) -> LeafResult<()> {
    let fragments = [
        Some(concept.sql_set_from.as_str()),
        concept.sql_set_where.as_deref(),
        concept.sql_field_date.as_deref(),
        concept.sql_field_numeric.as_deref(),
    ];
    for fragment in fragments.into_iter().flatten() {
        if fragment.contains(';') {
            return Err(LeafError::Validation(format!(
                "concept '{}' SQL contains a statement separator",
                concept.display_name
            )));
        }
        let upper = fragment.to_ascii_uppercase();
        let illegal = upper
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .find(|word| ILLEGAL_SQL_COMMANDS.contains(word));
        if let Some(word) = illegal {
            return Err(LeafError::Validation(format!(
                "concept '{}' SQL contains illegal command {}",
                concept.display_name, word
            )));
        }
    }
    Ok(())
}

fn validate_capabilities(
    query: &ResolvedQuery,
    global_filters: &[GlobalPanelFilter],
    dialect: &dyn SqlDialect,
    options: &CompilerOptions,
) -> LeafResult<()> {
    let has_numeric = query
        .panels
        .iter()
        .flat_map(|p| p.sub_panels.iter())
        .flat_map(|s| s.items.iter())
        .any(|i| i.numeric_filter.is_some());
    if has_numeric {
        require(dialect, DialectFeature::DeclareParam)?;
    }

    if options.combination == PanelCombination::SetOperations {
        let active_filters = query.panel_filters.iter().filter(|f| f.is_active);
        let inclusions = query.panels.iter().filter(|p| p.include).count()
            + active_filters.clone().filter(|f| f.is_inclusion).count()
            + global_filters.iter().filter(|f| f.is_inclusion).count();
        let exclusions = query.panels.iter().filter(|p| !p.include).count()
            + active_filters.filter(|f| !f.is_inclusion).count()
            + global_filters.iter().filter(|f| !f.is_inclusion).count();
        if inclusions > 1 {
            require(dialect, DialectFeature::Intersect)?;
        }
        if exclusions > 0 {
            require(dialect, DialectFeature::Except)?;
        }
    }
    Ok(())
}
