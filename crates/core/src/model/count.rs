use crate::model::panel::QueryId;
use crate::resolver::PreflightReport;

/// Result of counting a cohort.
///
/// `value` is never an exact count below the low-cell threshold: such results carry the
/// threshold itself with `within_low_cell_threshold` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientCount {
    pub value: u64,
    pub plus_minus: u64,
    pub within_low_cell_threshold: bool,
    pub sql_statements: Vec<String>,
    pub cached: bool,
}

/// Outcome of `CompileAndCount`. `result` is `None` when preflight failed.
#[derive(Debug, Clone, PartialEq)]
pub struct CountResponse {
    pub query_id: QueryId,
    pub preflight: PreflightReport,
    pub result: Option<PatientCount>,
}

impl CountResponse {
    pub fn cached(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.cached)
    }
}
