//! Fan-out of federated counts to peer nodes.

mod client;
mod dispatcher;

pub use client::{FederationError, HttpPeerClient, PeerClient, PeerCount, PeerReply};
pub use dispatcher::{merge_total, FederatedCount, FederatedDispatcher, SiteResult, SiteStatus};
