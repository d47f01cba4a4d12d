//! # API REST
//!
//! REST API for a Leaf node.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - Header authentication, API keys and the revoked-session check
//! - Assembly of the node's services and background tasks from configuration
//!
//! Query semantics live in `leaf-core`; this crate only maps HTTP onto it.

#![warn(rust_2018_idioms)]

mod auth;
mod node;
mod routes;

pub use auth::{
    API_KEY_HEADER, IDENTIFIED_HEADER, PHI_HEADER, ROLES_HEADER, SESSION_HEADER,
    SESSION_TYPE_HEADER, USER_HEADER,
};
pub use node::Node;
pub use routes::{router, ApiDoc, AppState, HealthRes, ShrineState, ShrineSubmissionRes};
