//! Network endpoint registry and the dispatch-side endpoint cache.

use crate::network::{
    NetworkEndpoint, NetworkEndpointDraft, NetworkIdentity, NetworkStore, NetworkValidator,
    UpdateResult,
};
use crate::snapshot::Snapshot;
use crate::LeafResult;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

type EndpointSet = BTreeMap<Uuid, Arc<NetworkEndpoint>>;

/// Enabled, valid endpoints as of the last swap.
#[derive(Debug, Default)]
pub struct EndpointCache {
    endpoints: Snapshot<EndpointSet>,
}

impl EndpointCache {
    /// Replace the whole set. Concurrent readers see either the prior or the new set.
    pub fn overwrite(&self, endpoints: impl IntoIterator<Item = NetworkEndpoint>) {
        let next: EndpointSet = endpoints
            .into_iter()
            .filter(NetworkEndpoint::is_enabled)
            .map(|e| (e.id, Arc::new(e)))
            .collect();
        self.endpoints.store(next);
    }

    pub fn all(&self) -> Vec<Arc<NetworkEndpoint>> {
        self.endpoints.load().values().cloned().collect()
    }

    /// Peers this node sends queries to.
    pub fn responders(&self) -> Vec<Arc<NetworkEndpoint>> {
        self.endpoints
            .load()
            .values()
            .filter(|e| e.is_responder)
            .cloned()
            .collect()
    }

    /// The peer allowed to query this node under `issuer`, if any.
    pub fn interrogator(&self, issuer: &str) -> Option<Arc<NetworkEndpoint>> {
        self.endpoints
            .load()
            .values()
            .find(|e| e.is_interrogator && e.issuer.as_str() == issuer)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.endpoints.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn put(&self, endpoint: &NetworkEndpoint) {
        self.endpoints.rebuild(|current| {
            let mut next = current.clone();
            if endpoint.is_enabled() {
                next.insert(endpoint.id, Arc::new(endpoint.clone()));
            } else {
                next.remove(&endpoint.id);
            }
            next
        });
    }

    fn remove(&self, id: Uuid) {
        self.endpoints.try_rebuild(|current| {
            if !current.contains_key(&id) {
                return None;
            }
            let mut next = current.clone();
            next.remove(&id);
            Some((next, ()))
        });
    }
}

/// Validated CRUD over endpoints and identity, keeping the cache in step with the store.
pub struct NetworkRegistry {
    store: Arc<dyn NetworkStore>,
    validator: NetworkValidator,
    cache: Arc<EndpointCache>,
    identity: Snapshot<NetworkIdentity>,
}

impl NetworkRegistry {
    /// Load identity and endpoints from `store` and populate the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read. Invalid stored endpoints are logged and
    /// left out of the cache rather than failing the load.
    pub async fn load(store: Arc<dyn NetworkStore>, validator: NetworkValidator) -> LeafResult<Self> {
        let identity = store.identity().await?;
        let registry = Self {
            store,
            validator,
            cache: Arc::new(EndpointCache::default()),
            identity: Snapshot::new(identity),
        };
        registry.refresh().await?;
        Ok(registry)
    }

    pub fn cache(&self) -> Arc<EndpointCache> {
        Arc::clone(&self.cache)
    }

    /// Rebuild the cache from the store. Returns the number of cached endpoints.
    pub async fn refresh(&self) -> LeafResult<usize> {
        let endpoints = self.store.endpoints().await?;
        let usable: Vec<NetworkEndpoint> = endpoints
            .into_iter()
            .filter(NetworkEndpoint::is_enabled)
            .filter(|endpoint| match self.validator.check(endpoint) {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(
                        endpoint = %endpoint.id,
                        name = %endpoint.name,
                        "dropping invalid network endpoint: {}",
                        e
                    );
                    false
                }
            })
            .collect();
        let count = usable.len();
        self.cache.overwrite(usable);
        Ok(count)
    }

    pub async fn endpoints(&self) -> LeafResult<Vec<NetworkEndpoint>> {
        self.store.endpoints().await
    }

    pub async fn create(&self, draft: &NetworkEndpointDraft) -> LeafResult<NetworkEndpoint> {
        let endpoint = self.validator.validate(Uuid::new_v4(), draft, Utc::now())?;
        let created = self.store.create(endpoint).await?;
        self.cache.put(&created);
        tracing::info!(endpoint = %created.id, name = %created.name, "created network endpoint");
        Ok(created)
    }

    /// Update an endpoint. Returns `None` when no endpoint has `id`.
    pub async fn update(
        &self,
        id: Uuid,
        draft: &NetworkEndpointDraft,
    ) -> LeafResult<Option<UpdateResult<NetworkEndpoint>>> {
        let Some(existing) = self.store.endpoint(id).await? else {
            return Ok(None);
        };
        let endpoint = self.validator.validate(id, draft, existing.created)?;
        let updated = self.store.update(endpoint).await?;
        if let Some(result) = &updated {
            self.cache.put(&result.new);
            tracing::info!(endpoint = %id, name = %result.new.name, "updated network endpoint");
        }
        Ok(updated)
    }

    /// Delete an endpoint. Deleting an unknown id is not an error.
    pub async fn delete(&self, id: Uuid) -> LeafResult<Option<NetworkEndpoint>> {
        let deleted = self.store.delete(id).await?;
        match &deleted {
            Some(endpoint) => {
                self.cache.remove(id);
                tracing::info!(endpoint = %id, name = %endpoint.name, "deleted network endpoint");
            }
            None => tracing::warn!(endpoint = %id, "delete of unknown network endpoint"),
        }
        Ok(deleted)
    }

    pub fn identity(&self) -> Arc<NetworkIdentity> {
        self.identity.load()
    }

    pub async fn update_identity(
        &self,
        identity: NetworkIdentity,
    ) -> LeafResult<UpdateResult<NetworkIdentity>> {
        let result = self.store.update_identity(identity).await?;
        self.identity.store(result.new.clone());
        tracing::info!(name = %result.new.name, "updated network identity");
        Ok(result)
    }
}
