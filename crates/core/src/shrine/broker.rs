use super::tags::ContentsType;
use super::wire::{
    DeliveryAttemptDto, DeliveryContentsDto, ResultProgressDto, RunQueryForResultDto,
    UpdateQueryAtQepDto,
};
use super::ShrineError;
use crate::constants::SHRINE_RECEIVE_TIMEOUT_SECS;
use crate::{LeafError, LeafResult};
use reqwest::Url;
use std::time::Duration;

/// Extra allowance on top of the hub's long-poll window before the client gives up.
const RECEIVE_GRACE_SECS: u64 = 10;

/// A decoded delivery from the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    UpdateQueryAtQep(UpdateQueryAtQepDto),
    RunQueryForResult(RunQueryForResultDto),
    Result(ResultProgressDto),
}

impl HubMessage {
    pub fn contents_type(&self) -> ContentsType {
        match self {
            HubMessage::UpdateQueryAtQep(_) => ContentsType::UpdateQueryAtQep,
            HubMessage::RunQueryForResult(_) => ContentsType::RunQueryForResult,
            HubMessage::Result(_) => ContentsType::Result,
        }
    }

    /// Decode the inner JSON of an envelope according to its `contentsType`.
    ///
    /// # Errors
    ///
    /// Returns `ShrineError::Json` when the contents do not match the declared type.
    pub fn decode(envelope: &DeliveryContentsDto) -> Result<Self, ShrineError> {
        let contents = envelope.contents.as_str();
        Ok(match envelope.contents_type {
            ContentsType::UpdateQueryAtQep => {
                HubMessage::UpdateQueryAtQep(serde_json::from_str(contents)?)
            }
            ContentsType::RunQueryForResult => {
                HubMessage::RunQueryForResult(serde_json::from_str(contents)?)
            }
            ContentsType::Result => HubMessage::Result(serde_json::from_str(contents)?),
        })
    }

    pub fn encode(&self) -> Result<DeliveryContentsDto, ShrineError> {
        let contents = match self {
            HubMessage::UpdateQueryAtQep(update) => serde_json::to_string(update)?,
            HubMessage::RunQueryForResult(run) => serde_json::to_string(run)?,
            HubMessage::Result(progress) => serde_json::to_string(progress)?,
        };
        Ok(DeliveryContentsDto {
            contents,
            contents_type: self.contents_type(),
        })
    }
}

/// Message-broker client for a SHRINE hub.
pub struct ShrineHubClient {
    http: reqwest::Client,
    hub: Url,
    node_name: String,
}

impl ShrineHubClient {
    /// # Errors
    ///
    /// Returns `LeafError::InvalidInput` if the node name is blank or the HTTP client cannot
    /// be built.
    pub fn new(hub: Url, node_name: impl Into<String>) -> LeafResult<Self> {
        let node_name = node_name.into();
        if node_name.trim().is_empty() {
            return Err(LeafError::InvalidInput("SHRINE node name is empty".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(
                SHRINE_RECEIVE_TIMEOUT_SECS + RECEIVE_GRACE_SECS,
            ))
            .build()
            .map_err(|e| LeafError::InvalidInput(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            hub,
            node_name,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ShrineError> {
        self.hub
            .join(path)
            .map_err(|e| ShrineError::Hub(format!("bad hub path '{}': {}", path, e)))
    }

    /// Long-poll the hub for one message and acknowledge it.
    ///
    /// Returns `Ok(None)` when the poll window closes without a delivery.
    ///
    /// # Errors
    ///
    /// Returns `ShrineError::Hub` on transport failures and decode errors for bad payloads.
    /// A payload that fails to decode has still been acknowledged.
    pub async fn receive_and_acknowledge(&self) -> Result<Option<HubMessage>, ShrineError> {
        let mut url = self.endpoint(&format!(
            "shrine-api/mom/receiveMessage/{}",
            self.node_name
        ))?;
        url.query_pairs_mut()
            .append_pair("timeOutSeconds", &SHRINE_RECEIVE_TIMEOUT_SECS.to_string());

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ShrineError::Hub(e.to_string()))?;
        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "no SHRINE delivery");
            return Ok(None);
        }
        let body = response
            .text()
            .await
            .map_err(|e| ShrineError::Hub(e.to_string()))?;
        if body.trim().is_empty() {
            return Ok(None);
        }

        let attempt: DeliveryAttemptDto = serde_json::from_str(&body)?;
        let ack = self.endpoint(&format!(
            "shrine-api/mom/acknowledge/{}",
            attempt.delivery_attempt_id.underlying
        ))?;
        self.http
            .put(ack)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ShrineError::Hub(format!("acknowledge failed: {}", e)))?;

        let envelope: DeliveryContentsDto = serde_json::from_str(&attempt.contents)?;
        let message = HubMessage::decode(&envelope)?;
        tracing::info!(contents_type = %message.contents_type(), "received SHRINE message");
        Ok(Some(message))
    }

    /// # Errors
    ///
    /// Returns `ShrineError::Hub` when the hub refuses the message or cannot be reached.
    pub async fn send(&self, message: &HubMessage) -> Result<(), ShrineError> {
        let envelope = message.encode()?;
        let url = self.endpoint("shrine-api/mom/sendMessage/hub")?;
        self.http
            .put(url)
            .json(&envelope)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ShrineError::Hub(e.to_string()))?;
        Ok(())
    }
}
