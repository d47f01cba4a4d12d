use crate::network::{NetworkEndpoint, NetworkIdentity, UpdateResult};
use crate::LeafResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Persistence for endpoint and identity records.
#[async_trait]
pub trait NetworkStore: Send + Sync {
    async fn endpoints(&self) -> LeafResult<Vec<NetworkEndpoint>>;
    async fn endpoint(&self, id: Uuid) -> LeafResult<Option<NetworkEndpoint>>;
    async fn create(&self, endpoint: NetworkEndpoint) -> LeafResult<NetworkEndpoint>;
    /// Returns `None` when no record has the endpoint's id.
    async fn update(
        &self,
        endpoint: NetworkEndpoint,
    ) -> LeafResult<Option<UpdateResult<NetworkEndpoint>>>;
    /// Returns the deleted record, or `None` when it did not exist.
    async fn delete(&self, id: Uuid) -> LeafResult<Option<NetworkEndpoint>>;
    async fn identity(&self) -> LeafResult<NetworkIdentity>;
    async fn update_identity(
        &self,
        identity: NetworkIdentity,
    ) -> LeafResult<UpdateResult<NetworkIdentity>>;
}

struct NetworkState {
    endpoints: BTreeMap<Uuid, NetworkEndpoint>,
    identity: NetworkIdentity,
}

/// Store held in memory, seeded from the catalog at startup.
pub struct InMemoryNetworkStore {
    state: Mutex<NetworkState>,
}

impl InMemoryNetworkStore {
    pub fn new(identity: NetworkIdentity, endpoints: Vec<NetworkEndpoint>) -> Self {
        Self {
            state: Mutex::new(NetworkState {
                endpoints: endpoints.into_iter().map(|e| (e.id, e)).collect(),
                identity,
            }),
        }
    }
}

#[async_trait]
impl NetworkStore for InMemoryNetworkStore {
    async fn endpoints(&self) -> LeafResult<Vec<NetworkEndpoint>> {
        Ok(self.state.lock().endpoints.values().cloned().collect())
    }

    async fn endpoint(&self, id: Uuid) -> LeafResult<Option<NetworkEndpoint>> {
        Ok(self.state.lock().endpoints.get(&id).cloned())
    }

    async fn create(&self, endpoint: NetworkEndpoint) -> LeafResult<NetworkEndpoint> {
        self.state
            .lock()
            .endpoints
            .insert(endpoint.id, endpoint.clone());
        Ok(endpoint)
    }

    async fn update(
        &self,
        endpoint: NetworkEndpoint,
    ) -> LeafResult<Option<UpdateResult<NetworkEndpoint>>> {
        let mut state = self.state.lock();
        let Some(slot) = state.endpoints.get_mut(&endpoint.id) else {
            return Ok(None);
        };
        let old = std::mem::replace(slot, endpoint.clone());
        Ok(Some(UpdateResult { old, new: endpoint }))
    }

    async fn delete(&self, id: Uuid) -> LeafResult<Option<NetworkEndpoint>> {
        Ok(self.state.lock().endpoints.remove(&id))
    }

    async fn identity(&self) -> LeafResult<NetworkIdentity> {
        Ok(self.state.lock().identity.clone())
    }

    async fn update_identity(
        &self,
        identity: NetworkIdentity,
    ) -> LeafResult<UpdateResult<NetworkIdentity>> {
        let mut state = self.state.lock();
        let old = std::mem::replace(&mut state.identity, identity.clone());
        Ok(UpdateResult { old, new: identity })
    }
}
