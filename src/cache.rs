//! Resource cache
//!
//! Maps the logical identity of a resource (endpoint IP on a network, or the
//! defining tuple of a load balancer) to the HNS handle last seen for it.
//! Entries can go stale when something else deletes the resource, so a hit
//! is only a hint: consumers confirm it and [`ResourceCache::invalidate`] on
//! a not-found.
//!
//! The maps are sharded so that workers reconciling unrelated services never
//! contend on one lock.

use std::collections::BTreeSet;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Arc;
use dashmap::DashMap;
use uuid::Uuid;
use crate::hns::{NetworkInfo, Protocol};

/// A `DashMap` with at least `shards` lock shards
pub fn sharded<K: Hash + Eq, V>(shards: usize) -> DashMap<K, V> {
    DashMap::with_shard_amount(shard_amount(shards))
}

// DashMap panics unless the shard count is a power of two above one
fn shard_amount(shards: usize) -> usize {
    shards.max(2).next_power_of_two()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Endpoint,
    LoadBalancer,
}

/// Endpoint identity: its IP within a named network
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    network: String,
    ip: IpAddr,
}

impl EndpointKey {
    pub fn new(network: &str, ip: IpAddr) -> Self {
        Self {
            network: network.to_ascii_lowercase(),
            ip,
        }
    }
}

/// Load balancer identity: every field of its defining tuple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadBalancerKey {
    pub endpoints: BTreeSet<Uuid>,
    pub protocol: Protocol,
    pub internal_port: u16,
    pub external_port: u16,
    pub vip: Option<IpAddr>,
    pub ilb: bool,
    pub dsr: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    Endpoint(EndpointKey),
    LoadBalancer(LoadBalancerKey),
}

impl ResourceKey {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceKey::Endpoint(_) => ResourceKind::Endpoint,
            ResourceKey::LoadBalancer(_) => ResourceKind::LoadBalancer,
        }
    }
}

/// Last-known HNS handles and network metadata
pub struct ResourceCache {
    handles: DashMap<ResourceKey, Uuid>,
    networks: DashMap<String, Arc<NetworkInfo>>,
}

impl ResourceCache {
    pub fn new(shards: usize) -> Self {
        Self {
            handles: sharded(shards),
            networks: sharded(shards),
        }
    }

    pub fn lookup(&self, key: &ResourceKey) -> Option<Uuid> {
        self.handles.get(key).map(|entry| *entry)
    }

    pub fn store(&self, key: ResourceKey, handle: Uuid) {
        tracing::debug!(kind = ?key.kind(), handle = %handle, "Cached resource handle");
        self.handles.insert(key, handle);
    }

    pub fn invalidate(&self, key: &ResourceKey) {
        if let Some((_, handle)) = self.handles.remove(key) {
            tracing::debug!(kind = ?key.kind(), handle = %handle, "Invalidated resource handle");
        }
    }

    /// Forget every key that points at `handle`
    pub fn invalidate_handle(&self, kind: ResourceKind, handle: Uuid) {
        self.handles.retain(|key, cached| !(key.kind() == kind && *cached == handle));
    }

    pub fn network(&self, name: &str) -> Option<Arc<NetworkInfo>> {
        self.networks
            .get(&name.to_ascii_lowercase())
            .map(|entry| Arc::clone(&entry))
    }

    pub fn store_network(&self, network: NetworkInfo) -> Arc<NetworkInfo> {
        let network = Arc::new(network);
        self.networks
            .insert(network.name.to_ascii_lowercase(), Arc::clone(&network));
        network
    }

    pub fn invalidate_network(&self, name: &str) {
        self.networks.remove(&name.to_ascii_lowercase());
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new(16)
    }
}
