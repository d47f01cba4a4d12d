//! Assembly of a running node from configuration, catalog and executor.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use leaf_core::blacklist::TokenBlacklistSource;
use leaf_core::shrine::{spawn_poller, ShrineHubClient, ShrineResponder, ShrineResultCache};
use leaf_core::sync::{spawn_interval, BlacklistSynchroniser, EndpointSynchroniser, Synchroniser};
use leaf_core::{
    dialect_for, Catalog, CohortCounter, CohortExecutor, CohortService, CoreConfig,
    FederatedDispatcher, HttpPeerClient, LeafResult, NetworkRegistry, NetworkValidator,
    Obfuscator, PanelCompiler, Resolver, TokenBlacklistCache,
};

use crate::routes::{AppState, ShrineState};

/// Everything a node serves requests with, plus what its background tasks refresh.
pub struct Node {
    state: AppState,
    blacklist_source: Arc<dyn TokenBlacklistSource>,
    shrine_responder: Option<Arc<ShrineResponder>>,
}

impl Node {
    /// Build a node.
    ///
    /// Federation is enabled when a peer token is configured; SHRINE when hub settings are.
    ///
    /// # Errors
    ///
    /// Returns `LeafError::Storage` if the endpoint store cannot be read and
    /// `LeafError::InvalidInput` if an HTTP client cannot be built.
    pub async fn build(
        config: Arc<CoreConfig>,
        catalog: &Catalog,
        executor: Arc<dyn CohortExecutor>,
        api_key: Option<String>,
    ) -> LeafResult<Self> {
        let validator = NetworkValidator::new(config.ensure_https());
        let network_store = Arc::new(catalog.network_store(&validator));
        let registry = Arc::new(NetworkRegistry::load(network_store, validator).await?);

        let counter = Arc::new(CohortCounter::new(
            PanelCompiler::new(
                dialect_for(config.sql_dialect()),
                config.compiler_options().clone(),
            ),
            executor,
            Obfuscator::new(config.deidentification()),
            config.query_timeout(),
            config.cache_capacity(),
        ));

        let dispatcher = match config.peer_token() {
            Some(token) => Some(FederatedDispatcher::new(
                Arc::new(HttpPeerClient::new(config.issuer(), token)?),
                registry.cache(),
                config.federation_timeout(),
            )),
            None => {
                tracing::info!("no peer token configured, federation disabled");
                None
            }
        };

        let resolver = Resolver::new(Arc::new(catalog.concept_store()));
        let service = Arc::new(CohortService::new(resolver, counter, dispatcher));

        let (shrine, shrine_responder) = match config.shrine() {
            Some(settings) => {
                let hub = Arc::new(ShrineHubClient::new(
                    settings.hub.clone(),
                    &settings.node_name,
                )?);
                let results = Arc::new(ShrineResultCache::new());
                let responder = Arc::new(ShrineResponder::new(
                    Arc::clone(&service),
                    Arc::clone(&results),
                    settings.node_id,
                    &settings.node_name,
                    config.issuer(),
                ));
                tracing::info!(hub = %settings.hub, node = %settings.node_name, "SHRINE enabled");
                (
                    Some(ShrineState {
                        hub,
                        results,
                        node_id: settings.node_id,
                    }),
                    Some(responder),
                )
            }
            None => (None, None),
        };

        let blacklist = Arc::new(TokenBlacklistCache::new());
        let state = AppState {
            config,
            service,
            registry,
            blacklist,
            shrine,
            api_key: api_key.filter(|k| !k.trim().is_empty()).map(Arc::from),
        };

        Ok(Self {
            state,
            blacklist_source: Arc::new(catalog.blacklist_source()),
            shrine_responder,
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Start the cache synchronisers and, when enabled, the SHRINE poller.
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let config = &self.state.config;
        let blacklist: Arc<dyn Synchroniser> = Arc::new(BlacklistSynchroniser::new(
            Arc::clone(&self.blacklist_source),
            Arc::clone(&self.state.blacklist),
        ));
        let endpoints: Arc<dyn Synchroniser> =
            Arc::new(EndpointSynchroniser::new(Arc::clone(&self.state.registry)));

        let mut handles = vec![
            spawn_interval(blacklist, config.blacklist_sync_interval(), shutdown.clone()),
            spawn_interval(endpoints, config.endpoint_sync_interval(), shutdown.clone()),
        ];
        if let (Some(shrine), Some(responder)) = (&self.state.shrine, &self.shrine_responder) {
            handles.push(spawn_poller(
                Arc::clone(&shrine.hub),
                Arc::clone(responder),
                shutdown,
            ));
        }
        handles
    }
}
