use crate::constants::{FEDERATED_COUNT_PATH, ISSUER_HEADER};
use crate::federation::SiteStatus;
use crate::network::NetworkEndpoint;
use crate::wire::v1::{CountResponseDto, QueryDefinitionDto};
use crate::{LeafError, LeafResult};
use async_trait::async_trait;
use reqwest::StatusCode;

/// Why a peer produced no count. Each maps to a distinct per-site status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FederationError {
    #[error("peer did not answer in time")]
    TimedOut,
    #[error("peer rejected the query: {0}")]
    Rejected(String),
    #[error("peer certificate is invalid: {0}")]
    CertificateInvalid(String),
    #[error("peer identity does not match its trust material: {0}")]
    CertificateMismatch(String),
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("malformed peer response: {0}")]
    MalformedResponse(String),
}

impl FederationError {
    pub fn status(&self) -> SiteStatus {
        match self {
            FederationError::TimedOut => SiteStatus::TimedOut,
            FederationError::Rejected(_) => SiteStatus::Rejected,
            FederationError::CertificateInvalid(_) => SiteStatus::CertificateInvalid,
            FederationError::CertificateMismatch(_) => SiteStatus::CertificateMismatch,
            FederationError::Unreachable(_) => SiteStatus::Unreachable,
            FederationError::MalformedResponse(_) => SiteStatus::MalformedResponse,
        }
    }
}

/// A peer's de-identified count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCount {
    pub value: u64,
    pub within_low_cell_threshold: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerReply {
    pub count: PeerCount,
    /// Issuer the peer identified itself with, when it sent one.
    pub issuer: Option<String>,
}

/// Transport to one peer.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn count(
        &self,
        endpoint: &NetworkEndpoint,
        definition: &QueryDefinitionDto,
    ) -> Result<PeerReply, FederationError>;
}

/// HTTPS transport authenticated with a bearer token and this node's issuer.
pub struct HttpPeerClient {
    http: reqwest::Client,
    issuer: String,
    token: String,
}

impl HttpPeerClient {
    pub fn new(issuer: impl Into<String>, token: impl Into<String>) -> LeafResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| LeafError::InvalidInput(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            issuer: issuer.into(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn count(
        &self,
        endpoint: &NetworkEndpoint,
        definition: &QueryDefinitionDto,
    ) -> Result<PeerReply, FederationError> {
        let url = endpoint
            .address
            .join(FEDERATED_COUNT_PATH)
            .map_err(|e| FederationError::Unreachable(e.to_string()))?;

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header(ISSUER_HEADER, &self.issuer)
            .json(definition)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FederationError::TimedOut
                } else {
                    FederationError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
            return Err(FederationError::TimedOut);
        }
        if !status.is_success() {
            return Err(FederationError::Rejected(status.to_string()));
        }

        let issuer = response
            .headers()
            .get(ISSUER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body: CountResponseDto = response
            .json()
            .await
            .map_err(|e| FederationError::MalformedResponse(e.to_string()))?;
        let result = body
            .result
            .ok_or_else(|| FederationError::Rejected("peer preflight failed".into()))?;

        Ok(PeerReply {
            count: PeerCount {
                value: result.value,
                within_low_cell_threshold: result.within_low_cell_threshold,
            },
            issuer,
        })
    }
}
