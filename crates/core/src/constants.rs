//! Constants used throughout the Leaf core crate.
//!
//! Compiler field names, privacy defaults and protocol constants live here so that the
//! compiler, counter and adapters agree on them.

/// Column every concept source set exposes for the patient identifier.
pub const DEFAULT_FIELD_PERSON_ID: &str = "PersonId";

/// Column every encounter-based concept source set exposes for the encounter identifier.
pub const DEFAULT_FIELD_ENCOUNTER_ID: &str = "EncounterId";

/// Marker in concept SQL fragments that is replaced by the source set alias.
pub const DEFAULT_ALIAS_MARKER: &str = "@";

/// Column name given to matched dates in compiled sub-panel statements.
pub const EVENT_DATE_COLUMN: &str = "EventDate";

/// Words that may never appear in a concept SQL fragment.
pub const ILLEGAL_SQL_COMMANDS: [&str; 9] = [
    "UPDATE", "TRUNCATE", "EXEC", "DROP", "INSERT", "CREATE", "DELETE", "MERGE", "SET",
];

/// Later sub-panels in a sequence look back this many months before the panel start date.
pub const SEQUENCE_LOOKBACK_MONTHS: i32 = -6;

/// Default low-cell-count threshold.
pub const DEFAULT_LOW_CELL_THRESHOLD: u64 = 10;

/// Default noise bounds applied to de-identified counts.
pub const DEFAULT_NOISE_LOWER_BOUND: i64 = -3;
pub const DEFAULT_NOISE_UPPER_BOUND: i64 = 3;

/// Default capacity of the QueryId count cache.
pub const DEFAULT_COUNT_CACHE_CAPACITY: usize = 512;

/// Default timeouts, in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_FEDERATION_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_BLACKLIST_SYNC_SECS: u64 = 60;
pub const DEFAULT_CERTIFICATE_SYNC_SECS: u64 = 10;

/// Path peers expose for federated counts.
pub const FEDERATED_COUNT_PATH: &str = "/api/cohort/count";

/// Header carrying the requesting node's token issuer on federated calls.
pub const ISSUER_HEADER: &str = "x-leaf-issuer";

/// Prefix of URNs for concepts mapped from SHRINE term paths.
pub const SHRINE_CONCEPT_URN_PREFIX: &str = "urn:leaf:concept:shrine:";

/// SHRINE protocol constants.
pub const SHRINE_PROTOCOL_VERSION: i32 = 2;
pub const SHRINE_VERSION: &str = "4.1.0-SNAPSHOT";
pub const SHRINE_ITEM_VERSION: i32 = 2;
pub const SHRINE_RECEIVE_TIMEOUT_SECS: u64 = 50;
