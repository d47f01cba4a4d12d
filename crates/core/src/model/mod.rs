//! Domain model for cohort queries.
//!
//! These types carry no wire-format concerns. JSON shapes live in [`crate::wire`] and SHRINE
//! shapes in [`crate::shrine`]; both convert into this model explicitly.

pub mod concept;
pub mod count;
pub mod panel;

pub use concept::{Concept, ResourceRef};
pub use count::{CountResponse, PatientCount};
pub use panel::{
    DateBound, DateBoundary, DateUnit, GlobalPanelFilter, JoinSequence, NumericFilter,
    NumericFilterType, Panel, PanelFilter, PanelItem, QueryDefinition, QueryId, RecencyFilter,
    ResolvedQuery, SubPanel,
};
