//! SQL dialect adapters.
//!
//! Every backend implements the same [`SqlDialect`] contract. Operations a backend cannot
//! express return [`DialectError::Unsupported`]; the compiler consults
//! [`SqlDialect::supports`] first so that a missing capability is a compile-time rejection.

use crate::model::DateUnit;
use crate::{LeafError, LeafResult};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlDialectKind {
    TSql,
    MySql,
    MariaDb,
    PlSql,
    PostgreSql,
    BigQuery,
    Sqlite,
}

impl SqlDialectKind {
    pub const ALL: [SqlDialectKind; 7] = [
        SqlDialectKind::TSql,
        SqlDialectKind::MySql,
        SqlDialectKind::MariaDb,
        SqlDialectKind::PlSql,
        SqlDialectKind::PostgreSql,
        SqlDialectKind::BigQuery,
        SqlDialectKind::Sqlite,
    ];
}

impl fmt::Display for SqlDialectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlDialectKind::TSql => "T-SQL",
            SqlDialectKind::MySql => "MySQL",
            SqlDialectKind::MariaDb => "MariaDB",
            SqlDialectKind::PlSql => "PL/SQL",
            SqlDialectKind::PostgreSql => "PostgreSQL",
            SqlDialectKind::BigQuery => "BigQuery",
            SqlDialectKind::Sqlite => "SQLite",
        };
        f.write_str(name)
    }
}

impl FromStr for SqlDialectKind {
    type Err = LeafError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalised.as_str() {
            "tsql" | "mssql" | "sqlserver" => Ok(SqlDialectKind::TSql),
            "mysql" => Ok(SqlDialectKind::MySql),
            "mariadb" => Ok(SqlDialectKind::MariaDb),
            "plsql" | "oracle" => Ok(SqlDialectKind::PlSql),
            "postgresql" | "postgres" | "pgsql" => Ok(SqlDialectKind::PostgreSql),
            "bigquery" => Ok(SqlDialectKind::BigQuery),
            "sqlite" | "sqlite3" => Ok(SqlDialectKind::Sqlite),
            _ => Err(LeafError::InvalidInput(format!("unknown SQL dialect: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    String,
    Integer,
    Decimal,
    Date,
    Boolean,
    Guid,
}

impl ColumnType {
    pub const ALL: [ColumnType; 6] = [
        ColumnType::String,
        ColumnType::Integer,
        ColumnType::Decimal,
        ColumnType::Date,
        ColumnType::Boolean,
        ColumnType::Guid,
    ];
}

/// Optional capabilities that not every backend provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialectFeature {
    Intersect,
    Except,
    DeclareParam,
}

impl fmt::Display for DialectFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DialectFeature::Intersect => "INTERSECT",
            DialectFeature::Except => "EXCEPT",
            DialectFeature::DeclareParam => "parameter declaration",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DialectError {
    #[error("{dialect} does not support {feature}")]
    Unsupported {
        dialect: SqlDialectKind,
        feature: DialectFeature,
    },
}

pub type DialectResult<T> = std::result::Result<T, DialectError>;

pub trait SqlDialect: Send + Sync + fmt::Debug {
    fn kind(&self) -> SqlDialectKind;

    fn supports(&self, feature: DialectFeature) -> bool;

    /// Expression for the current date and time.
    fn now(&self) -> &'static str;

    fn intersect(&self) -> DialectResult<&'static str>;

    fn except(&self) -> DialectResult<&'static str>;

    /// `date_expr` shifted by `increment` units.
    fn date_add(&self, unit: DateUnit, increment: i32, date_expr: &str) -> String;

    fn sql_type(&self, column_type: ColumnType) -> &'static str;

    fn convert(&self, column_type: ColumnType, value: &str) -> String;

    /// Placeholder that binds parameter `name` in a statement.
    fn param_marker(&self, name: &str) -> String;

    /// Script line declaring parameter `name` with `value`.
    fn declare_param(&self, name: &str, column_type: ColumnType, value: &str)
        -> DialectResult<String>;

    /// Table to select from when a statement needs no source, if the backend requires one.
    fn dual_table(&self) -> Option<&'static str> {
        None
    }

    fn unsupported(&self, feature: DialectFeature) -> DialectError {
        DialectError::Unsupported {
            dialect: self.kind(),
            feature,
        }
    }
}

/// Check a capability, producing the rejection the compiler reports.
pub fn require(dialect: &dyn SqlDialect, feature: DialectFeature) -> LeafResult<()> {
    if dialect.supports(feature) {
        Ok(())
    } else {
        Err(dialect.unsupported(feature).into())
    }
}

pub fn dialect_for(kind: SqlDialectKind) -> Arc<dyn SqlDialect> {
    match kind {
        SqlDialectKind::TSql => Arc::new(TSqlDialect),
        SqlDialectKind::MySql => Arc::new(MySqlDialect),
        SqlDialectKind::MariaDb => Arc::new(MariaDbDialect),
        SqlDialectKind::PlSql => Arc::new(PlSqlDialect),
        SqlDialectKind::PostgreSql => Arc::new(PostgreSqlDialect),
        SqlDialectKind::BigQuery => Arc::new(BigQueryDialect),
        SqlDialectKind::Sqlite => Arc::new(SqliteDialect),
    }
}

// ==================== T-SQL ====================

#[derive(Debug, Clone, Copy, Default)]
pub struct TSqlDialect;

impl SqlDialect for TSqlDialect {
    fn kind(&self) -> SqlDialectKind {
        SqlDialectKind::TSql
    }

    fn supports(&self, _feature: DialectFeature) -> bool {
        true
    }

    fn now(&self) -> &'static str {
        "GETDATE()"
    }

    fn intersect(&self) -> DialectResult<&'static str> {
        Ok("INTERSECT")
    }

    fn except(&self) -> DialectResult<&'static str> {
        Ok("EXCEPT")
    }

    fn date_add(&self, unit: DateUnit, increment: i32, date_expr: &str) -> String {
        format!("DATEADD({}, {}, {})", unit.keyword(), increment, date_expr)
    }

    fn sql_type(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::String => "NVARCHAR(100)",
            ColumnType::Integer => "INT",
            ColumnType::Decimal => "DECIMAL(18,3)",
            ColumnType::Date => "DATETIME",
            ColumnType::Boolean => "BIT",
            ColumnType::Guid => "UNIQUEIDENTIFIER",
        }
    }

    fn convert(&self, column_type: ColumnType, value: &str) -> String {
        format!("CONVERT({}, {})", self.sql_type(column_type), value)
    }

    fn param_marker(&self, name: &str) -> String {
        format!("@{}", name)
    }

    fn declare_param(
        &self,
        name: &str,
        column_type: ColumnType,
        value: &str,
    ) -> DialectResult<String> {
        Ok(format!(
            "DECLARE @{} {} = {};",
            name,
            self.sql_type(column_type),
            value
        ))
    }
}

// ==================== MySQL / MariaDB ====================

fn mysql_sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::String => "VARCHAR(100)",
        ColumnType::Integer => "MEDIUMINT",
        ColumnType::Decimal => "FLOAT",
        ColumnType::Date => "DATETIME",
        ColumnType::Boolean => "MEDIUMINT",
        ColumnType::Guid => "CHAR(36)",
    }
}

fn mysql_date_add(unit: DateUnit, increment: i32, date_expr: &str) -> String {
    format!(
        "DATE_ADD({}, INTERVAL {} {})",
        date_expr,
        increment,
        unit.keyword()
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn kind(&self) -> SqlDialectKind {
        SqlDialectKind::MySql
    }

    fn supports(&self, feature: DialectFeature) -> bool {
        !matches!(feature, DialectFeature::Except)
    }

    fn now(&self) -> &'static str {
        "NOW()"
    }

    fn intersect(&self) -> DialectResult<&'static str> {
        Ok("INTERSECT")
    }

    fn except(&self) -> DialectResult<&'static str> {
        Err(self.unsupported(DialectFeature::Except))
    }

    fn date_add(&self, unit: DateUnit, increment: i32, date_expr: &str) -> String {
        mysql_date_add(unit, increment, date_expr)
    }

    fn sql_type(&self, column_type: ColumnType) -> &'static str {
        mysql_sql_type(column_type)
    }

    fn convert(&self, column_type: ColumnType, value: &str) -> String {
        format!("CONVERT({}, {})", value, self.sql_type(column_type))
    }

    fn param_marker(&self, name: &str) -> String {
        format!("@{}", name)
    }

    fn declare_param(
        &self,
        name: &str,
        _column_type: ColumnType,
        value: &str,
    ) -> DialectResult<String> {
        Ok(format!("SET @{} := {};", name, value))
    }

    fn dual_table(&self) -> Option<&'static str> {
        Some("DUAL")
    }
}

/// MariaDB shares MySQL syntax but has supported `EXCEPT` since 10.3.
#[derive(Debug, Clone, Copy, Default)]
pub struct MariaDbDialect;

impl SqlDialect for MariaDbDialect {
    fn kind(&self) -> SqlDialectKind {
        SqlDialectKind::MariaDb
    }

    fn supports(&self, _feature: DialectFeature) -> bool {
        true
    }

    fn now(&self) -> &'static str {
        "NOW()"
    }

    fn intersect(&self) -> DialectResult<&'static str> {
        Ok("INTERSECT")
    }

    fn except(&self) -> DialectResult<&'static str> {
        Ok("EXCEPT")
    }

    fn date_add(&self, unit: DateUnit, increment: i32, date_expr: &str) -> String {
        mysql_date_add(unit, increment, date_expr)
    }

    fn sql_type(&self, column_type: ColumnType) -> &'static str {
        mysql_sql_type(column_type)
    }

    fn convert(&self, column_type: ColumnType, value: &str) -> String {
        format!("CONVERT({}, {})", value, self.sql_type(column_type))
    }

    fn param_marker(&self, name: &str) -> String {
        format!("@{}", name)
    }

    fn declare_param(
        &self,
        name: &str,
        _column_type: ColumnType,
        value: &str,
    ) -> DialectResult<String> {
        Ok(format!("SET @{} := {};", name, value))
    }

    fn dual_table(&self) -> Option<&'static str> {
        Some("DUAL")
    }
}

// ==================== PL/SQL ====================

#[derive(Debug, Clone, Copy, Default)]
pub struct PlSqlDialect;

impl SqlDialect for PlSqlDialect {
    fn kind(&self) -> SqlDialectKind {
        SqlDialectKind::PlSql
    }

    fn supports(&self, _feature: DialectFeature) -> bool {
        true
    }

    fn now(&self) -> &'static str {
        "SYSDATE"
    }

    fn intersect(&self) -> DialectResult<&'static str> {
        Ok("INTERSECT")
    }

    fn except(&self) -> DialectResult<&'static str> {
        Ok("MINUS")
    }

    fn date_add(&self, unit: DateUnit, increment: i32, date_expr: &str) -> String {
        // Oracle day-second intervals have no WEEK field and month arithmetic needs ADD_MONTHS
        let n = i64::from(increment);
        match unit {
            DateUnit::Minute | DateUnit::Hour | DateUnit::Day => format!(
                "({} + NUMTODSINTERVAL({}, '{}'))",
                date_expr,
                n,
                unit.keyword()
            ),
            DateUnit::Week => format!("({} + NUMTODSINTERVAL({}, 'DAY'))", date_expr, n * 7),
            DateUnit::Month => format!("ADD_MONTHS({}, {})", date_expr, n),
            DateUnit::Year => format!("ADD_MONTHS({}, {})", date_expr, n * 12),
        }
    }

    fn sql_type(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::String => "NVARCHAR2(100)",
            ColumnType::Integer => "INTEGER",
            ColumnType::Decimal => "FLOAT",
            ColumnType::Date => "DATE",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Guid => "CHAR(36)",
        }
    }

    fn convert(&self, column_type: ColumnType, value: &str) -> String {
        format!("CAST({} AS {})", value, self.sql_type(column_type))
    }

    fn param_marker(&self, name: &str) -> String {
        format!(":{}", name)
    }

    fn declare_param(
        &self,
        name: &str,
        column_type: ColumnType,
        value: &str,
    ) -> DialectResult<String> {
        Ok(format!(
            "{} {} := {};",
            name,
            self.sql_type(column_type),
            value
        ))
    }

    fn dual_table(&self) -> Option<&'static str> {
        Some("DUAL")
    }
}

// ==================== PostgreSQL ====================

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgreSqlDialect;

impl SqlDialect for PostgreSqlDialect {
    fn kind(&self) -> SqlDialectKind {
        SqlDialectKind::PostgreSql
    }

    fn supports(&self, _feature: DialectFeature) -> bool {
        true
    }

    fn now(&self) -> &'static str {
        "NOW()"
    }

    fn intersect(&self) -> DialectResult<&'static str> {
        Ok("INTERSECT")
    }

    fn except(&self) -> DialectResult<&'static str> {
        Ok("EXCEPT")
    }

    fn date_add(&self, unit: DateUnit, increment: i32, date_expr: &str) -> String {
        format!(
            "({} + INTERVAL '{} {}')",
            date_expr,
            increment,
            unit.keyword()
        )
    }

    fn sql_type(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::String => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Decimal => "NUMERIC(18,3)",
            ColumnType::Date => "TIMESTAMP",
            ColumnType::Boolean => "BIT",
            ColumnType::Guid => "UUID",
        }
    }

    fn convert(&self, column_type: ColumnType, value: &str) -> String {
        format!("CAST({} AS {})", value, self.sql_type(column_type))
    }

    fn param_marker(&self, name: &str) -> String {
        format!(":{}", name)
    }

    fn declare_param(
        &self,
        name: &str,
        column_type: ColumnType,
        value: &str,
    ) -> DialectResult<String> {
        Ok(format!(
            "DECLARE {} {} = {};",
            name,
            self.sql_type(column_type),
            value
        ))
    }
}

// ==================== BigQuery ====================

#[derive(Debug, Clone, Copy, Default)]
pub struct BigQueryDialect;

impl SqlDialect for BigQueryDialect {
    fn kind(&self) -> SqlDialectKind {
        SqlDialectKind::BigQuery
    }

    fn supports(&self, _feature: DialectFeature) -> bool {
        false
    }

    fn now(&self) -> &'static str {
        "CURRENT_DATETIME()"
    }

    fn intersect(&self) -> DialectResult<&'static str> {
        Err(self.unsupported(DialectFeature::Intersect))
    }

    fn except(&self) -> DialectResult<&'static str> {
        Err(self.unsupported(DialectFeature::Except))
    }

    fn date_add(&self, unit: DateUnit, increment: i32, date_expr: &str) -> String {
        if increment < 0 {
            format!(
                "DATETIME_SUB({}, INTERVAL {} {})",
                date_expr,
                i64::from(increment).abs(),
                unit.keyword()
            )
        } else {
            format!(
                "DATETIME_ADD({}, INTERVAL {} {})",
                date_expr,
                increment,
                unit.keyword()
            )
        }
    }

    fn sql_type(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::String => "STRING",
            ColumnType::Integer => "INT64",
            ColumnType::Decimal => "FLOAT64",
            ColumnType::Date => "DATETIME",
            ColumnType::Boolean => "BOOL",
            ColumnType::Guid => "STRING",
        }
    }

    fn convert(&self, column_type: ColumnType, value: &str) -> String {
        format!("CAST({} AS {})", value, self.sql_type(column_type))
    }

    fn param_marker(&self, name: &str) -> String {
        format!("@{}", name)
    }

    fn declare_param(
        &self,
        _name: &str,
        _column_type: ColumnType,
        _value: &str,
    ) -> DialectResult<String> {
        Err(self.unsupported(DialectFeature::DeclareParam))
    }
}

// ==================== SQLite ====================

/// The embedded clinical database. Dates are stored as `YYYY-MM-DD HH:MM:SS` text, so
/// conversions and arithmetic go through `DATETIME` to keep comparisons lexical.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn kind(&self) -> SqlDialectKind {
        SqlDialectKind::Sqlite
    }

    fn supports(&self, _feature: DialectFeature) -> bool {
        true
    }

    fn now(&self) -> &'static str {
        "DATETIME('now')"
    }

    fn intersect(&self) -> DialectResult<&'static str> {
        Ok("INTERSECT")
    }

    fn except(&self) -> DialectResult<&'static str> {
        Ok("EXCEPT")
    }

    fn date_add(&self, unit: DateUnit, increment: i32, date_expr: &str) -> String {
        let n = i64::from(increment);
        let (amount, modifier) = match unit {
            DateUnit::Minute => (n, "minutes"),
            DateUnit::Hour => (n, "hours"),
            DateUnit::Day => (n, "days"),
            DateUnit::Week => (n * 7, "days"),
            DateUnit::Month => (n, "months"),
            DateUnit::Year => (n, "years"),
        };
        format!("DATETIME({}, '{:+} {}')", date_expr, amount, modifier)
    }

    fn sql_type(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::String => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Decimal => "REAL",
            ColumnType::Date => "TEXT",
            ColumnType::Boolean => "INTEGER",
            ColumnType::Guid => "TEXT",
        }
    }

    fn convert(&self, column_type: ColumnType, value: &str) -> String {
        match column_type {
            ColumnType::Date => format!("DATETIME({})", value),
            _ => format!("CAST({} AS {})", value, self.sql_type(column_type)),
        }
    }

    fn param_marker(&self, name: &str) -> String {
        format!(":{}", name)
    }

    /// SQLite has no script variables; values are bound to the markers, so the
    /// declaration is recorded as a comment.
    fn declare_param(
        &self,
        name: &str,
        column_type: ColumnType,
        value: &str,
    ) -> DialectResult<String> {
        Ok(format!(
            "-- {} {} = {}",
            self.param_marker(name),
            self.sql_type(column_type),
            value
        ))
    }
}
