//! Long-poll loop against the SHRINE hub.
//!
//! Each delivery is handled on its own task so a slow count never holds up the next poll.
//! Hub transport failures pause the loop; payloads that fail to decode are logged and
//! skipped.

use super::broker::{HubMessage, ShrineHubClient};
use super::results::ShrineResultCache;
use super::tags::ResultStatus;
use super::wire::{
    Encoded, ObfuscatingParametersDto, ResultProgressDto, RunQueryForResultDto, VersionInfoDto,
};
use super::ShrineError;
use crate::constants::{SHRINE_ITEM_VERSION, SHRINE_PROTOCOL_VERSION, SHRINE_VERSION};
use crate::service::CohortService;
use crate::user::UserContext;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Pause after a hub transport failure.
pub const ERROR_PAUSE: Duration = Duration::from_secs(30);

/// Turns hub deliveries into cache updates and count replies.
pub struct ShrineResponder {
    service: Arc<CohortService>,
    results: Arc<ShrineResultCache>,
    node_id: i64,
    node_name: String,
    issuer: String,
}

impl ShrineResponder {
    pub fn new(
        service: Arc<CohortService>,
        results: Arc<ShrineResultCache>,
        node_id: i64,
        node_name: impl Into<String>,
        issuer: impl Into<String>,
    ) -> Self {
        Self {
            service,
            results,
            node_id,
            node_name: node_name.into(),
            issuer: issuer.into(),
        }
    }

    pub fn results(&self) -> &ShrineResultCache {
        &self.results
    }

    /// Apply `message`, returning the reply to send back to the hub, if any.
    pub async fn handle(&self, message: HubMessage) -> Option<HubMessage> {
        match message {
            HubMessage::UpdateQueryAtQep(update) => {
                tracing::debug!(
                    query_id = update.query_id,
                    results = update.result_progresses.len(),
                    "SHRINE query update"
                );
                self.results.apply_update(update);
                None
            }
            HubMessage::Result(progress) => {
                self.results.put(progress);
                None
            }
            HubMessage::RunQueryForResult(run) => Some(HubMessage::Result(self.run(run).await)),
        }
    }

    async fn run(&self, run: RunQueryForResultDto) -> ResultProgressDto {
        let query = run.query;
        let user = UserContext::builder(format!("shrine:{}", query.researcher_id), &self.issuer)
            .federated(true)
            .build();

        let (status, message, count) = match self.service.count_shrine_query(&user, &query).await
        {
            Ok(response) => match response.result {
                Some(count) => (
                    ResultStatus::ResultFromCrc,
                    "FINISHED".to_owned(),
                    Some(i64::try_from(count.value).unwrap_or(i64::MAX)),
                ),
                None => {
                    let failed: Vec<String> = response
                        .preflight
                        .failures()
                        .map(|check| check.reference.to_string())
                        .collect();
                    (
                        ResultStatus::ErrorFromCrc,
                        format!("preflight failed: {}", failed.join(", ")),
                        None,
                    )
                }
            },
            Err(e) => {
                tracing::error!(query_id = query.id, "SHRINE query failed: {}", e);
                (ResultStatus::ErrorFromCrc, e.to_string(), None)
            }
        };

        tracing::info!(query_id = query.id, status = %status, "answering SHRINE query");
        let now = Utc::now().timestamp_millis();
        let config = self.service.counter().obfuscator().config();
        let (_, noise_upper) = config.noise_bounds();
        ResultProgressDto {
            id: rand::thread_rng().gen_range(1..i64::MAX),
            version_info: VersionInfoDto {
                protocol_version: SHRINE_PROTOCOL_VERSION,
                shrine_version: SHRINE_VERSION.to_owned(),
                item_version: SHRINE_ITEM_VERSION,
                create_date: now,
                change_date: now,
            },
            query_id: query.id,
            adapter_node_id: self.node_id,
            adapter_node_name: self.node_name.clone(),
            status: Encoded::new(status),
            status_message: Some(message),
            crc_query_instance_id: None,
            count,
            obfuscating_parameters: count.map(|_| ObfuscatingParametersDto {
                bin_size: 1,
                std_dev: 0.0,
                noise_clamp: i32::try_from(noise_upper).unwrap_or(i32::MAX),
                low_limit: i32::try_from(config.low_cell_threshold()).unwrap_or(i32::MAX),
            }),
        }
    }
}

/// Poll `client` until `shutdown` turns true or its sender is dropped.
pub fn spawn_poller(
    client: Arc<ShrineHubClient>,
    responder: Arc<ShrineResponder>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("SHRINE poller started");
        loop {
            let received = tokio::select! {
                received = client.receive_and_acknowledge() => received,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match received {
                Ok(None) => {}
                Ok(Some(message)) => {
                    let client = Arc::clone(&client);
                    let responder = Arc::clone(&responder);
                    tokio::spawn(async move {
                        if let Some(reply) = responder.handle(message).await {
                            if let Err(e) = client.send(&reply).await {
                                tracing::error!("failed to send SHRINE reply: {}", e);
                            }
                        }
                    });
                }
                Err(ShrineError::Hub(e)) => {
                    tracing::error!(
                        pause_secs = ERROR_PAUSE.as_secs(),
                        "SHRINE hub unavailable: {}",
                        e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(ERROR_PAUSE) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => tracing::error!("failed to parse SHRINE message: {}", e),
            }
        }
        tracing::info!("SHRINE poller stopped");
    })
}
