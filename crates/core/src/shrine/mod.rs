//! SHRINE network interop.
//!
//! - [`tags`]: closed `encodedClass` vocabularies
//! - [`wire`]: SHRINE JSON shapes
//! - [`convert`]: panel model to and from SHRINE expressions
//! - [`broker`]: hub message-broker client
//! - [`results`]: received result progress
//! - [`poll`]: hub long-poll loop and query responder

pub mod broker;
pub mod convert;
pub mod poll;
pub mod results;
pub mod tags;
pub mod wire;

pub use broker::{HubMessage, ShrineHubClient};
pub use convert::{expression_from_query, query_from_shrine, ShrineQueryConverter};
pub use poll::{spawn_poller, ShrineResponder};
pub use results::ShrineResultCache;

#[derive(Debug, thiserror::Error)]
pub enum ShrineError {
    #[error("unknown {kind} tag '{tag}'")]
    UnknownTag { kind: &'static str, tag: String },
    #[error("not representable in SHRINE: {0}")]
    NotRepresentable(String),
    #[error("malformed SHRINE message: {0}")]
    Malformed(String),
    #[error("SHRINE JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SHRINE hub: {0}")]
    Hub(String),
}
