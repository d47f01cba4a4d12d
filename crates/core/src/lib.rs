//! # Leaf Core
//!
//! Cohort query compilation and federation for the Leaf clinical data explorer.
//!
//! This crate contains the query engine and the state it needs:
//! - Resolution of concept references and preflight authorisation
//! - Compilation of panel queries into one of six SQL dialects
//! - Execution, low-cell masking, obfuscation and a per-query result cache
//! - The network endpoint registry and federated count dispatch
//! - SHRINE hub interop and the revoked-session blacklist
//!
//! **No API concerns**: HTTP routing, authentication headers and process wiring belong in
//! `api-rest` and the `leaf` binaries.

pub mod blacklist;
pub mod catalog;
pub mod compiler;
pub mod config;
pub mod constants;
pub mod counter;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod federation;
pub mod hashing;
pub mod model;
pub mod network;
pub mod obfuscation;
pub mod resolver;
pub mod service;
pub mod shrine;
pub mod snapshot;
pub mod sync;
pub mod user;
pub mod wire;

pub use blacklist::{BlacklistedToken, TokenBlacklistCache, TokenBlacklistSource};
pub use catalog::Catalog;
pub use compiler::{CompiledQuery, CompilerOptions, PanelCombination, PanelCompiler};
pub use config::{CoreConfig, ShrineSettings};
pub use counter::CohortCounter;
pub use dialect::{dialect_for, SqlDialect, SqlDialectKind};
pub use error::{LeafError, LeafResult};
pub use executor::{CohortExecutor, ExecutionError, ExecutionErrorKind, SqliteExecutor};
pub use federation::{FederatedCount, FederatedDispatcher, HttpPeerClient, PeerClient};
pub use network::{
    EndpointCache, NetworkEndpoint, NetworkEndpointDraft, NetworkIdentity, NetworkRegistry,
    NetworkValidator,
};
pub use obfuscation::{DeidentificationConfig, MaskedCount, Obfuscator};
pub use resolver::{ConceptStore, InMemoryConceptStore, PreflightReport, Resolution, Resolver};
pub use service::CohortService;
pub use user::{SessionType, UserContext};
