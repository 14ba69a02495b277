//! In-memory HNS control plane
//!
//! Behaves like HNS for the operations [`HnsClient`] exposes: endpoints and
//! load balancers live in tables keyed by generated ids, deletes of missing
//! resources report not-found, and load balancers may only reference
//! endpoints that exist. Used by tests and by the CLI on hosts without HNS.
//! Faults and latency can be injected per operation.

use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;
use super::{
    EndpointDraft, EndpointInfo, HnsClient, LoadBalancerDraft, LoadBalancerInfo, NetworkInfo,
    RemoteSubnetRoute, LOAD_BALANCER_FLAG_DSR,
};
use crate::error::ErrorKind;
use crate::policy::{self, PolicyInfo};
use crate::{Error, Result};

#[derive(Default)]
struct State {
    networks: HashMap<String, NetworkInfo>,
    endpoints: HashMap<Uuid, EndpointInfo>,
    load_balancers: HashMap<Uuid, LoadBalancerInfo>,
    calls: HashMap<&'static str, usize>,
    faults: HashMap<&'static str, Vec<ErrorKind>>,
    latency: Duration,
}

/// HNS stand-in holding all state in process memory
#[derive(Default)]
pub struct MemoryHns {
    state: Mutex<State>,
}

impl MemoryHns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a network and return its id
    pub fn add_network(&self, name: &str, network_type: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().networks.insert(
            name.to_ascii_lowercase(),
            NetworkInfo {
                id,
                name: name.to_string(),
                network_type: network_type.to_string(),
                remote_subnets: Vec::new(),
            },
        );
        id
    }

    pub fn add_remote_subnet(&self, network: &str, route: RemoteSubnetRoute) {
        if let Some(net) = self.state.lock().networks.get_mut(&network.to_ascii_lowercase()) {
            net.remote_subnets.push(route);
        }
    }

    /// Insert an endpoint as if another component had created it
    pub fn insert_endpoint(&self, endpoint: EndpointInfo) {
        self.state.lock().endpoints.insert(endpoint.id, endpoint);
    }

    /// Remove an endpoint behind the reconciler's back
    pub fn remove_endpoint(&self, id: Uuid) -> bool {
        self.state.lock().endpoints.remove(&id).is_some()
    }

    /// Remove a load balancer behind the reconciler's back
    pub fn remove_load_balancer(&self, id: Uuid) -> bool {
        self.state.lock().load_balancers.remove(&id).is_some()
    }

    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        self.state.lock().endpoints.values().cloned().collect()
    }

    pub fn load_balancers(&self) -> Vec<LoadBalancerInfo> {
        self.state.lock().load_balancers.values().cloned().collect()
    }

    /// Number of times `operation` was invoked, including failed calls
    pub fn calls(&self, operation: &str) -> usize {
        self.state.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// Make the next call to `operation` fail with an error of `kind`.
    /// Repeated injections queue up in order.
    pub fn inject_fault(&self, operation: &'static str, kind: ErrorKind) {
        self.state
            .lock()
            .faults
            .entry(operation)
            .or_default()
            .push(kind);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    async fn enter(&self, operation: &'static str) -> Result<()> {
        let (latency, fault) = {
            let mut state = self.state.lock();
            *state.calls.entry(operation).or_insert(0) += 1;
            let fault = state.faults.get_mut(operation).and_then(|queue| {
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.remove(0))
                }
            });
            (state.latency, fault)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match fault {
            None => Ok(()),
            Some(kind) => Err(fault_error(operation, kind)),
        }
    }

    fn create(&self, network: &NetworkInfo, draft: &EndpointDraft, remote: bool) -> Result<EndpointInfo> {
        let mut state = self.state.lock();
        if !state.networks.values().any(|n| n.id == network.id) {
            return Err(Error::not_found("network", network.id));
        }
        if state
            .endpoints
            .values()
            .any(|e| e.ip == draft.ip && e.network_id == network.id)
        {
            return Err(Error::rejected(
                "create_endpoint",
                format!("address {} already in use", draft.ip),
            ));
        }

        let endpoint = EndpointInfo {
            id: Uuid::new_v4(),
            ip: draft.ip,
            mac_address: draft.mac_address.clone(),
            is_local: !remote,
            network_id: network.id,
            provider_address: draft.provider_address,
            policies: draft.policies.clone(),
        };
        state.endpoints.insert(endpoint.id, endpoint.clone());
        Ok(endpoint)
    }
}

fn fault_error(operation: &'static str, kind: ErrorKind) -> Error {
    match kind {
        ErrorKind::NotFoundTransient => Error::not_found("resource", operation),
        ErrorKind::ConfigInvalid => Error::Config(format!("injected fault in {}", operation)),
        ErrorKind::ControlPlaneUnavailable => {
            Error::Unavailable(format!("injected fault in {}", operation))
        }
        ErrorKind::ReferentialIntegrityViolation => Error::EndpointResolution(Uuid::nil()),
        ErrorKind::Rejected => Error::rejected(operation, "injected fault"),
    }
}

#[async_trait]
impl HnsClient for MemoryHns {
    async fn get_network_by_name(&self, name: &str) -> Result<NetworkInfo> {
        self.enter("get_network_by_name").await?;
        self.state
            .lock()
            .networks
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::not_found("network", name))
    }

    async fn get_endpoint_by_id(&self, id: Uuid) -> Result<EndpointInfo> {
        self.enter("get_endpoint_by_id").await?;
        self.state
            .lock()
            .endpoints
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("endpoint", id))
    }

    async fn list_endpoints(&self) -> Result<Vec<EndpointInfo>> {
        self.enter("list_endpoints").await?;
        Ok(self.endpoints())
    }

    async fn create_endpoint(
        &self,
        network: &NetworkInfo,
        draft: &EndpointDraft,
    ) -> Result<EndpointInfo> {
        self.enter("create_endpoint").await?;
        self.create(network, draft, false)
    }

    async fn create_remote_endpoint(
        &self,
        network: &NetworkInfo,
        draft: &EndpointDraft,
    ) -> Result<EndpointInfo> {
        self.enter("create_remote_endpoint").await?;
        self.create(network, draft, true)
    }

    async fn update_endpoint_policy(&self, id: Uuid, policy: &PolicyInfo) -> Result<()> {
        self.enter("update_endpoint_policy").await?;
        let mut state = self.state.lock();
        let endpoint = state
            .endpoints
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("endpoint", id))?;
        if policy.is_type(policy::PROVIDER_ADDRESS) {
            endpoint.policies.retain(|p| !p.is_type(policy::PROVIDER_ADDRESS));
            endpoint.provider_address = policy
                .settings
                .get("ProviderAddress")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok());
        }
        if !policy::contains_policy(&endpoint.policies, policy) {
            endpoint.policies.push(policy.clone());
        }
        Ok(())
    }

    async fn delete_endpoint(&self, id: Uuid) -> Result<()> {
        self.enter("delete_endpoint").await?;
        self.state
            .lock()
            .endpoints
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("endpoint", id))
    }

    async fn list_load_balancers(&self) -> Result<Vec<LoadBalancerInfo>> {
        self.enter("list_load_balancers").await?;
        Ok(self.load_balancers())
    }

    async fn get_load_balancer_by_id(&self, id: Uuid) -> Result<LoadBalancerInfo> {
        self.enter("get_load_balancer_by_id").await?;
        self.state
            .lock()
            .load_balancers
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("load balancer", id))
    }

    async fn create_load_balancer(&self, draft: &LoadBalancerDraft) -> Result<LoadBalancerInfo> {
        self.enter("create_load_balancer").await?;
        let mut state = self.state.lock();
        if let Some(missing) = draft
            .endpoint_ids
            .iter()
            .find(|id| !state.endpoints.contains_key(id))
        {
            return Err(Error::not_found("endpoint", missing));
        }

        let lb = LoadBalancerInfo {
            id: Uuid::new_v4(),
            endpoint_ids: draft.endpoint_ids.clone(),
            source_vip: draft.source_vip,
            frontend_vips: draft.frontend_vips.clone(),
            port_mappings: vec![draft.port_mapping],
            flags: if draft.dsr { LOAD_BALANCER_FLAG_DSR } else { 0 },
        };
        state.load_balancers.insert(lb.id, lb.clone());
        Ok(lb)
    }

    async fn delete_load_balancer(&self, id: Uuid) -> Result<()> {
        self.enter("delete_load_balancer").await?;
        self.state
            .lock()
            .load_balancers
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("load balancer", id))
    }
}
