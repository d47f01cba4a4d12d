//! Core runtime configuration.
//!
//! This module defines configuration that should be resolved once at process startup and then
//! passed into core services. The intent is to avoid reading process-wide environment variables
//! during request handling, which can lead to inconsistent behaviour in multi-threaded runtimes
//! and test harnesses.

use crate::compiler::{CompilerOptions, PanelCombination};
use crate::constants::{
    DEFAULT_BLACKLIST_SYNC_SECS, DEFAULT_CERTIFICATE_SYNC_SECS, DEFAULT_COUNT_CACHE_CAPACITY,
    DEFAULT_FEDERATION_TIMEOUT_SECS, DEFAULT_LOW_CELL_THRESHOLD, DEFAULT_NOISE_LOWER_BOUND,
    DEFAULT_NOISE_UPPER_BOUND, DEFAULT_QUERY_TIMEOUT_SECS,
};
use crate::dialect::SqlDialectKind;
use crate::obfuscation::DeidentificationConfig;
use crate::{LeafError, LeafResult};
use reqwest::Url;
use std::num::NonZeroUsize;
use std::time::Duration;

/// Connection details for a SHRINE hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShrineSettings {
    pub hub: Url,
    pub node_name: String,
    pub node_id: i64,
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    sql_dialect: SqlDialectKind,
    compiler: CompilerOptions,
    deidentification: DeidentificationConfig,
    cache_capacity: NonZeroUsize,
    query_timeout: Duration,
    federation_timeout: Duration,
    blacklist_sync_interval: Duration,
    endpoint_sync_interval: Duration,
    ensure_https: bool,
    issuer: String,
    key_id: String,
    peer_token: Option<String>,
    shrine: Option<ShrineSettings>,
}

impl CoreConfig {
    /// Create a `CoreConfig` with default privacy, cache and timeout settings.
    ///
    /// # Errors
    ///
    /// Returns `LeafError::InvalidInput` if `issuer` or `key_id` is blank.
    pub fn new(
        sql_dialect: SqlDialectKind,
        issuer: impl Into<String>,
        key_id: impl Into<String>,
    ) -> LeafResult<Self> {
        let issuer = issuer.into();
        let key_id = key_id.into();
        if issuer.trim().is_empty() {
            return Err(LeafError::InvalidInput("issuer cannot be empty".into()));
        }
        if key_id.trim().is_empty() {
            return Err(LeafError::InvalidInput("key_id cannot be empty".into()));
        }

        Ok(Self {
            sql_dialect,
            compiler: CompilerOptions::default(),
            deidentification: DeidentificationConfig::default(),
            cache_capacity: NonZeroUsize::new(DEFAULT_COUNT_CACHE_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            federation_timeout: Duration::from_secs(DEFAULT_FEDERATION_TIMEOUT_SECS),
            blacklist_sync_interval: Duration::from_secs(DEFAULT_BLACKLIST_SYNC_SECS),
            endpoint_sync_interval: Duration::from_secs(DEFAULT_CERTIFICATE_SYNC_SECS),
            ensure_https: true,
            issuer: issuer.trim().to_owned(),
            key_id: key_id.trim().to_owned(),
            peer_token: None,
            shrine: None,
        })
    }

    /// Resolve every setting through `lookup`, typically `|k| std::env::var(k).ok()`.
    ///
    /// Unset or blank values fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns `LeafError::InvalidInput` for any value that is set but cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LeafResult<Self> {
        let sql_dialect = sql_dialect_from_env_value(lookup("LEAF_SQL_DIALECT"))?;
        let issuer = non_empty(lookup("LEAF_ISSUER")).unwrap_or_else(|| "urn:leaf:iss:local".into());
        let key_id = non_empty(lookup("LEAF_KEY_ID")).unwrap_or_else(|| "local".into());
        let mut config = Self::new(sql_dialect, issuer, key_id)?;

        config.compiler.combination =
            panel_combination_from_env_value(lookup("LEAF_PANEL_COMBINATION"))?;
        config.deidentification = DeidentificationConfig::new(
            u64_from_env_value(
                "LEAF_LOW_CELL_THRESHOLD",
                lookup("LEAF_LOW_CELL_THRESHOLD"),
                DEFAULT_LOW_CELL_THRESHOLD,
            )?,
            bool_from_env_value("LEAF_NOISE_ENABLED", lookup("LEAF_NOISE_ENABLED"), true)?,
            i64_from_env_value(
                "LEAF_NOISE_LOWER",
                lookup("LEAF_NOISE_LOWER"),
                DEFAULT_NOISE_LOWER_BOUND,
            )?,
            i64_from_env_value(
                "LEAF_NOISE_UPPER",
                lookup("LEAF_NOISE_UPPER"),
                DEFAULT_NOISE_UPPER_BOUND,
            )?,
        )?;
        let capacity = u64_from_env_value(
            "LEAF_CACHE_CAPACITY",
            lookup("LEAF_CACHE_CAPACITY"),
            DEFAULT_COUNT_CACHE_CAPACITY as u64,
        )?;
        config.cache_capacity = usize::try_from(capacity)
            .ok()
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| {
                LeafError::InvalidInput("LEAF_CACHE_CAPACITY must be a positive integer".into())
            })?;
        config.query_timeout = secs_from_env_value(
            "LEAF_QUERY_TIMEOUT_SECS",
            lookup("LEAF_QUERY_TIMEOUT_SECS"),
            DEFAULT_QUERY_TIMEOUT_SECS,
        )?;
        config.federation_timeout = secs_from_env_value(
            "LEAF_FEDERATION_TIMEOUT_SECS",
            lookup("LEAF_FEDERATION_TIMEOUT_SECS"),
            DEFAULT_FEDERATION_TIMEOUT_SECS,
        )?;
        config.blacklist_sync_interval = secs_from_env_value(
            "LEAF_BLACKLIST_SYNC_SECS",
            lookup("LEAF_BLACKLIST_SYNC_SECS"),
            DEFAULT_BLACKLIST_SYNC_SECS,
        )?;
        config.endpoint_sync_interval = secs_from_env_value(
            "LEAF_ENDPOINT_SYNC_SECS",
            lookup("LEAF_ENDPOINT_SYNC_SECS"),
            DEFAULT_CERTIFICATE_SYNC_SECS,
        )?;
        config.ensure_https =
            bool_from_env_value("LEAF_ENSURE_HTTPS", lookup("LEAF_ENSURE_HTTPS"), true)?;
        config.peer_token = non_empty(lookup("LEAF_PEER_TOKEN"));
        config.shrine = shrine_from_env_values(
            lookup("LEAF_SHRINE_HUB_URL"),
            lookup("LEAF_SHRINE_NODE_NAME"),
            lookup("LEAF_SHRINE_NODE_ID"),
        )?;
        Ok(config)
    }

    pub fn with_compiler_options(mut self, compiler: CompilerOptions) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_deidentification(mut self, deidentification: DeidentificationConfig) -> Self {
        self.deidentification = deidentification;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_federation_timeout(mut self, timeout: Duration) -> Self {
        self.federation_timeout = timeout;
        self
    }

    pub fn with_ensure_https(mut self, ensure_https: bool) -> Self {
        self.ensure_https = ensure_https;
        self
    }

    pub fn with_peer_token(mut self, token: impl Into<String>) -> Self {
        self.peer_token = non_empty(Some(token.into()));
        self
    }

    pub fn sql_dialect(&self) -> SqlDialectKind {
        self.sql_dialect
    }

    pub fn compiler_options(&self) -> &CompilerOptions {
        &self.compiler
    }

    pub fn deidentification(&self) -> DeidentificationConfig {
        self.deidentification
    }

    pub fn cache_capacity(&self) -> NonZeroUsize {
        self.cache_capacity
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    pub fn federation_timeout(&self) -> Duration {
        self.federation_timeout
    }

    pub fn blacklist_sync_interval(&self) -> Duration {
        self.blacklist_sync_interval
    }

    pub fn endpoint_sync_interval(&self) -> Duration {
        self.endpoint_sync_interval
    }

    pub fn ensure_https(&self) -> bool {
        self.ensure_https
    }

    /// Token issuer this node presents to peers.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Bearer token for outgoing federated calls. Federation is disabled without one.
    pub fn peer_token(&self) -> Option<&str> {
        self.peer_token.as_deref()
    }

    pub fn shrine(&self) -> Option<&ShrineSettings> {
        self.shrine.as_ref()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse the SQL dialect from an optional string value.
///
/// If `value` is `None` or empty/whitespace, returns T-SQL.
pub fn sql_dialect_from_env_value(value: Option<String>) -> LeafResult<SqlDialectKind> {
    let parsed = non_empty(value)
        .map(|v| v.parse::<SqlDialectKind>())
        .transpose()?;
    Ok(parsed.unwrap_or(SqlDialectKind::TSql))
}

/// Parse how panels are combined: `exists` (default) or `set-operations`.
pub fn panel_combination_from_env_value(value: Option<String>) -> LeafResult<PanelCombination> {
    let Some(value) = non_empty(value) else {
        return Ok(PanelCombination::default());
    };
    let normalised: String = value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    match normalised.as_str() {
        "exists" => Ok(PanelCombination::Exists),
        "setoperations" | "sets" => Ok(PanelCombination::SetOperations),
        _ => Err(LeafError::InvalidInput(format!(
            "LEAF_PANEL_COMBINATION must be 'exists' or 'set-operations', got '{}'",
            value
        ))),
    }
}

pub fn u64_from_env_value(name: &str, value: Option<String>, default: u64) -> LeafResult<u64> {
    non_empty(value)
        .map(|v| {
            v.parse::<u64>().map_err(|_| {
                LeafError::InvalidInput(format!("{} must be a non-negative integer, got '{}'", name, v))
            })
        })
        .transpose()
        .map(|parsed| parsed.unwrap_or(default))
}

pub fn i64_from_env_value(name: &str, value: Option<String>, default: i64) -> LeafResult<i64> {
    non_empty(value)
        .map(|v| {
            v.parse::<i64>()
                .map_err(|_| LeafError::InvalidInput(format!("{} must be an integer, got '{}'", name, v)))
        })
        .transpose()
        .map(|parsed| parsed.unwrap_or(default))
}

/// Parse a positive number of seconds.
pub fn secs_from_env_value(name: &str, value: Option<String>, default: u64) -> LeafResult<Duration> {
    let secs = u64_from_env_value(name, value, default)?;
    if secs == 0 {
        return Err(LeafError::InvalidInput(format!("{} must be greater than zero", name)));
    }
    Ok(Duration::from_secs(secs))
}

/// Accepts `true/false`, `yes/no`, `on/off` and `1/0`, ignoring case.
pub fn bool_from_env_value(name: &str, value: Option<String>, default: bool) -> LeafResult<bool> {
    let Some(value) = non_empty(value) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(LeafError::InvalidInput(format!(
            "{} must be a boolean, got '{}'",
            name, value
        ))),
    }
}

/// SHRINE is enabled only when a hub URL is given; the node name is then required.
pub fn shrine_from_env_values(
    hub: Option<String>,
    node_name: Option<String>,
    node_id: Option<String>,
) -> LeafResult<Option<ShrineSettings>> {
    let Some(hub) = non_empty(hub) else {
        return Ok(None);
    };
    let hub = Url::parse(&hub)
        .map_err(|e| LeafError::InvalidInput(format!("LEAF_SHRINE_HUB_URL '{}': {}", hub, e)))?;
    let node_name = non_empty(node_name).ok_or_else(|| {
        LeafError::InvalidInput("LEAF_SHRINE_NODE_NAME is required with LEAF_SHRINE_HUB_URL".into())
    })?;
    let node_id = i64_from_env_value("LEAF_SHRINE_NODE_ID", node_id, 0)?;
    Ok(Some(ShrineSettings {
        hub,
        node_name,
        node_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let config = CoreConfig::from_lookup(lookup(&[])).expect("should resolve defaults");
        assert_eq!(config.sql_dialect(), SqlDialectKind::TSql);
        assert_eq!(config.deidentification().low_cell_threshold(), 10);
        assert_eq!(config.deidentification().noise_bounds(), (-3, 3));
        assert_eq!(config.cache_capacity().get(), DEFAULT_COUNT_CACHE_CAPACITY);
        assert_eq!(config.query_timeout(), Duration::from_secs(120));
        assert!(config.ensure_https());
        assert!(config.peer_token().is_none());
        assert!(config.shrine().is_none());
        assert_eq!(config.compiler_options().combination, PanelCombination::Exists);
    }

    #[test]
    fn test_values_override_defaults() {
        let config = CoreConfig::from_lookup(lookup(&[
            ("LEAF_SQL_DIALECT", "postgres"),
            ("LEAF_LOW_CELL_THRESHOLD", "5"),
            ("LEAF_NOISE_LOWER", "-2"),
            ("LEAF_NOISE_UPPER", " 4 "),
            ("LEAF_ENSURE_HTTPS", "off"),
            ("LEAF_PEER_TOKEN", "secret"),
            ("LEAF_ISSUER", "urn:leaf:iss:north"),
            ("LEAF_PANEL_COMBINATION", "set-operations"),
            ("LEAF_SHRINE_HUB_URL", "https://hub.example.org/"),
            ("LEAF_SHRINE_NODE_NAME", "north"),
        ]))
        .expect("should resolve");
        assert_eq!(config.sql_dialect(), SqlDialectKind::PostgreSql);
        assert_eq!(config.deidentification().low_cell_threshold(), 5);
        assert_eq!(config.deidentification().noise_bounds(), (-2, 4));
        assert!(!config.ensure_https());
        assert_eq!(config.peer_token(), Some("secret"));
        assert_eq!(config.issuer(), "urn:leaf:iss:north");
        assert_eq!(
            config.compiler_options().combination,
            PanelCombination::SetOperations
        );
        assert_eq!(
            config.shrine().map(|s| s.node_name.as_str()),
            Some("north")
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(CoreConfig::from_lookup(lookup(&[("LEAF_SQL_DIALECT", "access")])).is_err());
        assert!(CoreConfig::from_lookup(lookup(&[("LEAF_CACHE_CAPACITY", "0")])).is_err());
        assert!(CoreConfig::from_lookup(lookup(&[("LEAF_QUERY_TIMEOUT_SECS", "soon")])).is_err());
        assert!(CoreConfig::from_lookup(lookup(&[
            ("LEAF_NOISE_LOWER", "5"),
            ("LEAF_NOISE_UPPER", "1"),
        ]))
        .is_err());
        assert!(
            CoreConfig::from_lookup(lookup(&[("LEAF_SHRINE_HUB_URL", "https://hub/")])).is_err()
        );
    }

    #[test]
    fn test_env_value_helpers_treat_blank_as_unset() {
        assert_eq!(
            sql_dialect_from_env_value(Some("   ".into())).expect("should default"),
            SqlDialectKind::TSql
        );
        assert!(bool_from_env_value("X", Some("".into()), true).expect("should default"));
        assert!(bool_from_env_value("X", Some("maybe".into()), true).is_err());
        assert_eq!(u64_from_env_value("X", None, 7).expect("should default"), 7);
        assert!(secs_from_env_value("X", Some("0".into()), 5).is_err());
    }

    #[test]
    fn test_new_rejects_blank_issuer() {
        assert!(CoreConfig::new(SqlDialectKind::MySql, " ", "k").is_err());
        assert!(CoreConfig::new(SqlDialectKind::MySql, "iss", "").is_err());
    }
}
