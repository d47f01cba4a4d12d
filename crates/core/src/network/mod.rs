//! Administration of federated peers and the identity of this node.

mod endpoint;
mod registry;
mod store;
mod validator;

pub use endpoint::{NetworkEndpoint, NetworkEndpointDraft, NetworkIdentity, UpdateResult};
pub use registry::{EndpointCache, NetworkRegistry};
pub use store::{InMemoryNetworkStore, NetworkStore};
pub use validator::{parse_certificate, CertificateInfo, NetworkValidator};

#[cfg(test)]
pub(crate) use validator::tests::draft as test_draft;
