//! Concurrent dispatch of a federated query to every responder peer.
//!
//! Each peer call runs as a task owned by a `JoinSet` with its own timeout. One peer's
//! failure is recorded against that peer only. Dropping the dispatch future drops the set,
//! which aborts every call still in flight.

use crate::executor::ExecutionErrorKind;
use crate::federation::{FederationError, PeerClient, PeerCount, PeerReply};
use crate::model::{PatientCount, QueryId};
use crate::network::{parse_certificate, EndpointCache, NetworkEndpoint};
use crate::obfuscation::{MaskedCount, Obfuscator};
use crate::resolver::PreflightReport;
use crate::wire::v1::QueryDefinitionDto;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteStatus {
    Completed,
    TimedOut,
    Rejected,
    CertificateInvalid,
    CertificateMismatch,
    Unreachable,
    MalformedResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteResult {
    pub endpoint_id: Uuid,
    pub name: String,
    pub status: SiteStatus,
    pub count: Option<PeerCount>,
    /// Failure detail for logs and administrators.
    pub detail: Option<String>,
}

impl SiteResult {
    fn from_outcome(endpoint: &NetworkEndpoint, outcome: Result<PeerCount, FederationError>) -> Self {
        match outcome {
            Ok(count) => Self {
                endpoint_id: endpoint.id,
                name: endpoint.name.to_string(),
                status: SiteStatus::Completed,
                count: Some(count),
                detail: None,
            },
            Err(error) => {
                tracing::warn!(
                    endpoint = %endpoint.id,
                    name = %endpoint.name,
                    status = ?error.status(),
                    "federated count failed: {}",
                    error
                );
                Self {
                    endpoint_id: endpoint.id,
                    name: endpoint.name.to_string(),
                    status: error.status(),
                    count: None,
                    detail: Some(error.to_string()),
                }
            }
        }
    }
}

/// Result of a federated count at the originating node.
#[derive(Debug, Clone, PartialEq)]
pub struct FederatedCount {
    pub query_id: QueryId,
    pub preflight: PreflightReport,
    pub local: Option<PatientCount>,
    /// Set when the local count failed to execute. Completed peers still make up the total.
    pub local_error: Option<ExecutionErrorKind>,
    pub sites: Vec<SiteResult>,
    pub total: MaskedCount,
}

pub struct FederatedDispatcher {
    client: Arc<dyn PeerClient>,
    endpoints: Arc<EndpointCache>,
    default_timeout: Duration,
}

impl FederatedDispatcher {
    pub fn new(
        client: Arc<dyn PeerClient>,
        endpoints: Arc<EndpointCache>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoints,
            default_timeout,
        }
    }

    /// Send `definition` to every responder and wait for each to succeed or fail.
    ///
    /// The wait is bounded by the largest per-endpoint timeout. Results are ordered by
    /// endpoint name.
    pub async fn dispatch(&self, definition: QueryDefinitionDto) -> Vec<SiteResult> {
        let definition = Arc::new(definition);
        let now = Utc::now();
        let mut results = Vec::new();
        let mut calls = JoinSet::new();

        for endpoint in self.endpoints.responders() {
            if let Err(error) = check_trust(&endpoint, now) {
                results.push(SiteResult::from_outcome(&endpoint, Err(error)));
                continue;
            }
            let client = Arc::clone(&self.client);
            let definition = Arc::clone(&definition);
            let wait = endpoint.timeout_or(self.default_timeout);
            calls.spawn(async move {
                let outcome =
                    match tokio::time::timeout(wait, client.count(&endpoint, &definition)).await {
                        Ok(Ok(reply)) => verify_reply(&endpoint, reply),
                        Ok(Err(error)) => Err(error),
                        Err(_) => Err(FederationError::TimedOut),
                    };
                SiteResult::from_outcome(&endpoint, outcome)
            });
        }

        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(site) => results.push(site),
                Err(e) => tracing::error!("federated call task failed: {}", e),
            }
        }
        results.sort_by(|a, b| a.name.cmp(&b.name));
        results
    }
}

/// Sum the local count and every completed site, then re-apply low-cell masking.
pub fn merge_total(
    local: Option<&PatientCount>,
    sites: &[SiteResult],
    obfuscator: &Obfuscator,
) -> MaskedCount {
    let remote = sites
        .iter()
        .filter(|s| s.status == SiteStatus::Completed)
        .filter_map(|s| s.count)
        .fold(0u64, |sum, c| sum.saturating_add(c.value));
    let total = remote.saturating_add(local.map_or(0, |c| c.value));
    obfuscator.mask(total)
}

fn check_trust(endpoint: &NetworkEndpoint, now: DateTime<Utc>) -> Result<(), FederationError> {
    let info = parse_certificate(endpoint.certificate.as_str())
        .map_err(|e| FederationError::CertificateInvalid(e.to_string()))?;
    if !info.is_current(now) {
        return Err(FederationError::CertificateInvalid(format!(
            "valid {} to {}",
            info.not_before, info.not_after
        )));
    }
    if !info.names_node(endpoint.issuer.as_str(), endpoint.key_id.as_str()) {
        return Err(FederationError::CertificateMismatch(format!(
            "certificate does not name {}/{}",
            endpoint.issuer, endpoint.key_id
        )));
    }
    Ok(())
}

fn verify_reply(endpoint: &NetworkEndpoint, reply: PeerReply) -> Result<PeerCount, FederationError> {
    match reply.issuer {
        Some(issuer) if issuer != endpoint.issuer.as_str() => {
            Err(FederationError::CertificateMismatch(format!(
                "peer answered as {}, expected {}",
                issuer, endpoint.issuer
            )))
        }
        _ => Ok(reply.count),
    }
}
