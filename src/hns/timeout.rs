//! Per-call deadline for HNS operations

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use uuid::Uuid;
use super::{EndpointDraft, EndpointInfo, HnsClient, LoadBalancerDraft, LoadBalancerInfo, NetworkInfo};
use crate::policy::PolicyInfo;
use crate::{Error, Result};

/// Wraps a client so that no call waits longer than `timeout`.
///
/// An expired call surfaces as [`Error::Timeout`]; the underlying request
/// may still complete on the HNS side, which the next pass picks up.
pub struct TimeoutClient {
    inner: Arc<dyn HnsClient>,
    timeout: Duration,
}

impl TimeoutClient {
    pub fn new(inner: Arc<dyn HnsClient>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn guard<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation, timeout_ms = self.timeout.as_millis() as u64, "HNS call timed out");
                Err(Error::Timeout {
                    operation,
                    after: self.timeout,
                })
            }
        }
    }
}

#[async_trait]
impl HnsClient for TimeoutClient {
    async fn get_network_by_name(&self, name: &str) -> Result<NetworkInfo> {
        self.guard("get_network_by_name", self.inner.get_network_by_name(name))
            .await
    }

    async fn get_endpoint_by_id(&self, id: Uuid) -> Result<EndpointInfo> {
        self.guard("get_endpoint_by_id", self.inner.get_endpoint_by_id(id))
            .await
    }

    async fn list_endpoints(&self) -> Result<Vec<EndpointInfo>> {
        self.guard("list_endpoints", self.inner.list_endpoints()).await
    }

    async fn create_endpoint(
        &self,
        network: &NetworkInfo,
        draft: &EndpointDraft,
    ) -> Result<EndpointInfo> {
        self.guard("create_endpoint", self.inner.create_endpoint(network, draft))
            .await
    }

    async fn create_remote_endpoint(
        &self,
        network: &NetworkInfo,
        draft: &EndpointDraft,
    ) -> Result<EndpointInfo> {
        self.guard(
            "create_remote_endpoint",
            self.inner.create_remote_endpoint(network, draft),
        )
        .await
    }

    async fn update_endpoint_policy(&self, id: Uuid, policy: &PolicyInfo) -> Result<()> {
        self.guard(
            "update_endpoint_policy",
            self.inner.update_endpoint_policy(id, policy),
        )
        .await
    }

    async fn delete_endpoint(&self, id: Uuid) -> Result<()> {
        self.guard("delete_endpoint", self.inner.delete_endpoint(id)).await
    }

    async fn list_load_balancers(&self) -> Result<Vec<LoadBalancerInfo>> {
        self.guard("list_load_balancers", self.inner.list_load_balancers())
            .await
    }

    async fn get_load_balancer_by_id(&self, id: Uuid) -> Result<LoadBalancerInfo> {
        self.guard("get_load_balancer_by_id", self.inner.get_load_balancer_by_id(id))
            .await
    }

    async fn create_load_balancer(&self, draft: &LoadBalancerDraft) -> Result<LoadBalancerInfo> {
        self.guard("create_load_balancer", self.inner.create_load_balancer(draft))
            .await
    }

    async fn delete_load_balancer(&self, id: Uuid) -> Result<()> {
        self.guard("delete_load_balancer", self.inner.delete_load_balancer(id))
            .await
    }
}
