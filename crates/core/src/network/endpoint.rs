use chrono::{DateTime, Utc};
use leaf_types::NonEmptyText;
use reqwest::Url;
use std::time::Duration;
use uuid::Uuid;

/// A federated peer that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEndpoint {
    pub id: Uuid,
    pub name: NonEmptyText,
    pub address: Url,
    pub issuer: NonEmptyText,
    pub key_id: NonEmptyText,
    /// PEM or base64 DER, as submitted.
    pub certificate: NonEmptyText,
    /// This node sends queries to the peer.
    pub is_responder: bool,
    /// The peer may send queries to this node.
    pub is_interrogator: bool,
    pub timeout: Option<Duration>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl NetworkEndpoint {
    pub fn is_enabled(&self) -> bool {
        self.is_responder || self.is_interrogator
    }

    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }
}

/// Unvalidated endpoint fields from an administrative request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkEndpointDraft {
    pub name: String,
    pub address: String,
    pub issuer: String,
    pub key_id: String,
    pub certificate: String,
    pub is_responder: bool,
    pub is_interrogator: bool,
    pub timeout_secs: Option<u64>,
}

impl From<&NetworkEndpoint> for NetworkEndpointDraft {
    fn from(endpoint: &NetworkEndpoint) -> Self {
        Self {
            name: endpoint.name.to_string(),
            address: endpoint.address.to_string(),
            issuer: endpoint.issuer.to_string(),
            key_id: endpoint.key_id.to_string(),
            certificate: endpoint.certificate.to_string(),
            is_responder: endpoint.is_responder,
            is_interrogator: endpoint.is_interrogator,
            timeout_secs: endpoint.timeout.map(|t| t.as_secs()),
        }
    }
}

/// How this node presents itself to the network.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkIdentity {
    pub name: NonEmptyText,
    pub abbreviation: Option<String>,
    pub description: Option<String>,
    pub total_patients: Option<u64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub primary_color: Option<String>,
    pub secondary_color: Option<String>,
}

impl NetworkIdentity {
    pub fn named(name: NonEmptyText) -> Self {
        Self {
            name,
            abbreviation: None,
            description: None,
            total_patients: None,
            latitude: None,
            longitude: None,
            primary_color: None,
            secondary_color: None,
        }
    }
}

/// The record before and after an update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult<T> {
    pub old: T,
    pub new: T,
}
