//! Endpoint manager
//!
//! Finds or creates the HNS endpoint backing each service backend and keeps
//! the reference count that decides when an endpoint may be deleted. The
//! control-plane client is passed to every operation; the manager itself
//! only owns the cache and the counts.

use std::net::IpAddr;
use std::sync::Arc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;
use crate::cache::{self, EndpointKey, ResourceCache, ResourceKey, ResourceKind};
use crate::hns::{EndpointDraft, EndpointInfo, HnsClient, NetworkInfo};
use crate::policy::{self, PolicyInfo};
use crate::{Error, Result};

/// What a backend needs from HNS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRequest {
    pub ip: IpAddr,
    pub network: String,
    pub is_local: bool,
    pub provider_address: Option<IpAddr>,
    pub mac_address: Option<String>,
}

impl EndpointRequest {
    fn draft(&self) -> EndpointDraft {
        let mut policies = Vec::new();
        if !self.is_local {
            if let Some(pa) = self.provider_address {
                policies.push(PolicyInfo::provider_address(pa));
            }
        }
        EndpointDraft {
            ip: self.ip,
            mac_address: self.mac_address.clone(),
            is_local: self.is_local,
            provider_address: self.provider_address,
            policies,
        }
    }
}

#[derive(Debug, Clone)]
struct Refs {
    count: usize,
    /// Created by us, or remote: removed once unreferenced.
    /// Local endpoints found in HNS belong to the container runtime.
    deletable: bool,
    identity: EndpointKey,
}

pub struct EndpointManager {
    cache: Arc<ResourceCache>,
    refs: DashMap<Uuid, Refs>,
    /// Serializes find-or-create, retain and delete per endpoint identity
    locks: DashMap<EndpointKey, Arc<Mutex<()>>>,
}

impl EndpointManager {
    pub fn new(cache: Arc<ResourceCache>, shards: usize) -> Self {
        Self {
            cache,
            refs: cache::sharded(shards),
            locks: cache::sharded(shards),
        }
    }

    /// Resolve a network by name, consulting the cache first
    pub async fn network(&self, client: &dyn HnsClient, name: &str) -> Result<Arc<NetworkInfo>> {
        if let Some(network) = self.cache.network(name) {
            return Ok(network);
        }
        let network = client.get_network_by_name(name).await?;
        tracing::debug!(network = %name, id = %network.id, "Resolved HNS network");
        Ok(self.cache.store_network(network))
    }

    /// Find the endpoint for `request.ip` on `request.network`, creating it if absent.
    ///
    /// No reference is taken; use [`EndpointManager::acquire_endpoint`] when the
    /// endpoint is about to be bound to a load balancer.
    pub async fn ensure_endpoint(
        &self,
        client: &dyn HnsClient,
        request: &EndpointRequest,
    ) -> Result<EndpointInfo> {
        self.ensure(client, request, false).await
    }

    /// [`EndpointManager::ensure_endpoint`] plus one reference, taken before
    /// any concurrent release can delete the endpoint
    pub async fn acquire_endpoint(
        &self,
        client: &dyn HnsClient,
        request: &EndpointRequest,
    ) -> Result<EndpointInfo> {
        self.ensure(client, request, true).await
    }

    async fn ensure(
        &self,
        client: &dyn HnsClient,
        request: &EndpointRequest,
        retain: bool,
    ) -> Result<EndpointInfo> {
        let identity = EndpointKey::new(&request.network, request.ip);
        let lock = self.identity_lock(&identity);
        let guard = lock.lock().await;

        let result = self.find_or_create(client, request, identity.clone()).await;
        if let (true, Ok(endpoint)) = (retain, &result) {
            let mut refs = self.refs.entry(endpoint.id).or_insert_with(|| Refs {
                count: 0,
                deletable: false,
                identity: identity.clone(),
            });
            refs.count += 1;
        }

        drop(guard);
        self.prune_lock(&identity, &lock);
        result
    }

    fn identity_lock(&self, identity: &EndpointKey) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(identity.clone()).or_default())
    }

    /// Drop the lock entry unless another caller is waiting on it
    fn prune_lock(&self, identity: &EndpointKey, lock: &Arc<Mutex<()>>) {
        self.locks.remove_if(identity, |_, current| {
            Arc::ptr_eq(current, lock) && Arc::strong_count(current) <= 2
        });
    }

    async fn find_or_create(
        &self,
        client: &dyn HnsClient,
        request: &EndpointRequest,
        identity: EndpointKey,
    ) -> Result<EndpointInfo> {
        let key = ResourceKey::Endpoint(identity.clone());

        if let Some(id) = self.cache.lookup(&key) {
            match client.get_endpoint_by_id(id).await {
                Ok(endpoint) => {
                    tracing::debug!(ip = %request.ip, endpoint = %id, "Endpoint cache hit");
                    if let Some(endpoint) = self.converge(client, request, endpoint).await? {
                        return Ok(endpoint);
                    }
                }
                Err(e) if e.is_not_found() => {
                    tracing::info!(ip = %request.ip, endpoint = %id, "Cached endpoint vanished");
                    self.cache.invalidate(&key);
                }
                Err(e) => return Err(e),
            }
        }

        // A cached network can be stale if it was recreated; one refresh is allowed.
        let mut refreshed = false;
        loop {
            let network = self
                .network(client, &request.network)
                .await
                .map_err(|e| endpoint_error(request, network_error(&request.network, e)))?;

            if let Some(found) = find_endpoint(client, request.ip, network.id).await? {
                if let Some(endpoint) = self.converge(client, request, found).await? {
                    tracing::debug!(ip = %request.ip, endpoint = %endpoint.id, "Adopted existing endpoint");
                    self.track(&endpoint, &identity, false);
                    self.cache.store(key, endpoint.id);
                    return Ok(endpoint);
                }
            }

            let draft = request.draft();
            let created = if request.is_local {
                client.create_endpoint(&network, &draft).await
            } else {
                client.create_remote_endpoint(&network, &draft).await
            };

            match created {
                Ok(mut endpoint) => {
                    if endpoint.provider_address.is_none() {
                        endpoint.provider_address = request.provider_address;
                    }
                    tracing::info!(
                        ip = %request.ip,
                        endpoint = %endpoint.id,
                        local = request.is_local,
                        "Created HNS endpoint"
                    );
                    self.track(&endpoint, &identity, true);
                    self.cache.store(key, endpoint.id);
                    return Ok(endpoint);
                }
                Err(e) if e.is_not_found() && !refreshed => {
                    refreshed = true;
                    self.cache.invalidate_network(&request.network);
                }
                Err(e) => return Err(endpoint_error(request, e)),
            }
        }
    }

    /// Bring a found endpoint in line with `request`. Returns `None` once an
    /// endpoint of the wrong locality has been deleted and must be recreated.
    async fn converge(
        &self,
        client: &dyn HnsClient,
        request: &EndpointRequest,
        mut endpoint: EndpointInfo,
    ) -> Result<Option<EndpointInfo>> {
        if endpoint.is_local != request.is_local {
            let owned = !endpoint.is_local || self.refs.get(&endpoint.id).map_or(false, |r| r.deletable);
            if !owned {
                return Err(Error::Config(format!(
                    "{} is declared remote but has a local endpoint owned by the container runtime",
                    request.ip
                )));
            }
            tracing::info!(
                ip = %request.ip,
                endpoint = %endpoint.id,
                local = request.is_local,
                "Endpoint locality changed, recreating"
            );
            self.delete_endpoint(client, endpoint.id).await?;
            return Ok(None);
        }

        if let (false, Some(pa)) = (request.is_local, request.provider_address) {
            if endpoint.provider_address != Some(pa) {
                let policy = PolicyInfo::provider_address(pa);
                self.attach_policy(client, endpoint.id, &policy).await?;
                tracing::info!(
                    endpoint = %endpoint.id,
                    from = ?endpoint.provider_address,
                    to = %pa,
                    "Moved remote endpoint to a new provider address"
                );
                endpoint.policies.retain(|p| !p.is_type(policy::PROVIDER_ADDRESS));
                endpoint.policies.push(policy);
                endpoint.provider_address = Some(pa);
            }
        }
        Ok(Some(endpoint))
    }

    /// Fetch an endpoint by handle. Not-found means it was removed externally.
    pub async fn get_endpoint(&self, client: &dyn HnsClient, id: Uuid) -> Result<EndpointInfo> {
        client.get_endpoint_by_id(id).await
    }

    /// Add `policy` to a live endpoint unless an identical one is attached
    pub async fn attach_policy(
        &self,
        client: &dyn HnsClient,
        id: Uuid,
        policy: &PolicyInfo,
    ) -> Result<()> {
        let endpoint = client.get_endpoint_by_id(id).await?;
        if policy::contains_policy(&endpoint.policies, policy) {
            return Ok(());
        }
        client.update_endpoint_policy(id, policy).await?;
        tracing::info!(endpoint = %id, policy = %policy.policy_type, "Attached endpoint policy");
        Ok(())
    }

    /// Delete an endpoint. An endpoint that is already gone counts as deleted.
    pub async fn delete_endpoint(&self, client: &dyn HnsClient, id: Uuid) -> Result<()> {
        self.cache.invalidate_handle(ResourceKind::Endpoint, id);
        match client.delete_endpoint(id).await {
            Ok(()) => {
                tracing::info!(endpoint = %id, "Deleted HNS endpoint");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(endpoint = %id, "Endpoint already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Drop one reference to `id`, deleting the endpoint when none remain.
    /// Returns whether HNS was asked to delete it.
    ///
    /// If the delete fails the endpoint stays recorded as unreferenced and
    /// [`EndpointManager::collect`] can retry it.
    pub async fn release(&self, client: &dyn HnsClient, id: Uuid) -> Result<bool> {
        let remaining = self.refs.get_mut(&id).and_then(|mut refs| {
            if refs.count == 0 {
                return None;
            }
            refs.count -= 1;
            Some(refs.count)
        });

        match remaining {
            Some(0) => self.collect(client, id).await,
            Some(count) => {
                tracing::debug!(endpoint = %id, refs = count, "Endpoint still referenced");
                Ok(false)
            }
            None => {
                tracing::warn!(endpoint = %id, "Released endpoint that was not retained");
                Ok(false)
            }
        }
    }

    /// Delete `id` if it is unreferenced and ours to delete. Runs under the
    /// endpoint's identity lock, so nobody can acquire it mid-delete.
    pub async fn collect(&self, client: &dyn HnsClient, id: Uuid) -> Result<bool> {
        let Some(identity) = self.refs.get(&id).map(|r| r.identity.clone()) else {
            return Ok(false);
        };
        let lock = self.identity_lock(&identity);
        let guard = lock.lock().await;

        let result = self.collect_locked(client, id).await;

        drop(guard);
        self.prune_lock(&identity, &lock);
        result
    }

    async fn collect_locked(&self, client: &dyn HnsClient, id: Uuid) -> Result<bool> {
        let deletable = match self.refs.get(&id).map(|r| (r.count, r.deletable)) {
            Some((0, deletable)) => deletable,
            _ => return Ok(false),
        };

        if !deletable {
            self.refs.remove_if(&id, |_, r| r.count == 0);
            tracing::debug!(endpoint = %id, "Leaving unreferenced endpoint owned by the runtime");
            return Ok(false);
        }

        self.delete_endpoint(client, id).await?;
        self.refs.remove_if(&id, |_, r| r.count == 0);
        Ok(true)
    }

    pub fn ref_count(&self, id: Uuid) -> usize {
        self.refs.get(&id).map_or(0, |r| r.count)
    }

    fn track(&self, endpoint: &EndpointInfo, identity: &EndpointKey, created: bool) {
        let deletable = created || !endpoint.is_local;
        self.refs
            .entry(endpoint.id)
            .and_modify(|r| r.deletable |= deletable)
            .or_insert_with(|| Refs {
                count: 0,
                deletable,
                identity: identity.clone(),
            });
    }
}

/// Linear scan for an endpoint with `ip` on network `network_id`
async fn find_endpoint(
    client: &dyn HnsClient,
    ip: IpAddr,
    network_id: Uuid,
) -> Result<Option<EndpointInfo>> {
    Ok(client
        .list_endpoints()
        .await?
        .into_iter()
        .find(|e| e.ip == ip && e.network_id == network_id))
}

fn network_error(name: &str, e: Error) -> Error {
    if e.is_not_found() {
        Error::Config(format!("HNS network {} does not exist", name))
    } else {
        e
    }
}

fn endpoint_error(request: &EndpointRequest, source: Error) -> Error {
    Error::EndpointCreate {
        ip: request.ip,
        network: request.network.clone(),
        source: Box::new(source),
    }
}
