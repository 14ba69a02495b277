//! Load balancer manager
//!
//! Find-or-create for HNS load balancers. HNS keeps no name for a load
//! balancer, so identity is the defining tuple: member endpoints, protocol,
//! ports, ILB and DSR flags, and the VIP when one is requested. Only the
//! first port mapping and the first frontend VIP of an existing load
//! balancer are compared; a multi-port service is one load balancer per port.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;
use crate::cache::{LoadBalancerKey, ResourceCache, ResourceKey, ResourceKind};
use crate::hns::{
    EndpointInfo, HnsClient, LoadBalancerDraft, LoadBalancerInfo, PortMapping, Protocol,
    PORT_MAPPING_FLAG_ILB,
};
use crate::{Error, Result};

/// Everything about a load balancer except its members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerSpec {
    pub protocol: Protocol,
    pub internal_port: u16,
    pub external_port: u16,
    pub vip: Option<IpAddr>,
    pub source_vip: Option<IpAddr>,
    pub ilb: bool,
    pub dsr: bool,
}

impl LoadBalancerSpec {
    fn port_mapping(&self) -> PortMapping {
        PortMapping {
            protocol: self.protocol.number(),
            internal_port: self.internal_port,
            external_port: self.external_port,
            flags: if self.ilb { PORT_MAPPING_FLAG_ILB } else { 0 },
        }
    }

    fn key(&self, endpoint_ids: &[Uuid]) -> ResourceKey {
        ResourceKey::LoadBalancer(LoadBalancerKey {
            endpoints: endpoint_ids.iter().copied().collect(),
            protocol: self.protocol,
            internal_port: self.internal_port,
            external_port: self.external_port,
            vip: self.vip,
            ilb: self.ilb,
            dsr: self.dsr,
        })
    }
}

/// Whether `lb` already realizes `spec` over `endpoint_ids`
pub fn matches(lb: &LoadBalancerInfo, endpoint_ids: &[Uuid], spec: &LoadBalancerSpec) -> bool {
    if lb.endpoint_ids.len() != endpoint_ids.len() {
        return false;
    }
    let wanted: BTreeSet<&Uuid> = endpoint_ids.iter().collect();
    if !lb.endpoint_ids.iter().all(|id| wanted.contains(id)) {
        return false;
    }

    let Some(mapping) = lb.port_mappings.first() else {
        return false;
    };
    if mapping.protocol != spec.protocol.number()
        || mapping.internal_port != spec.internal_port
        || mapping.external_port != spec.external_port
        || mapping.is_ilb() != spec.ilb
    {
        return false;
    }
    if lb.is_dsr() != spec.dsr {
        return false;
    }

    match spec.vip {
        Some(vip) => lb.frontend_vips.first() == Some(&vip),
        None => true,
    }
}

pub struct LoadBalancerManager {
    cache: Arc<ResourceCache>,
}

impl LoadBalancerManager {
    pub fn new(cache: Arc<ResourceCache>) -> Self {
        Self { cache }
    }

    /// Return the load balancer for `spec` over `endpoints`, creating it only
    /// when no existing one matches
    pub async fn ensure_load_balancer(
        &self,
        client: &dyn HnsClient,
        endpoints: &[EndpointInfo],
        spec: &LoadBalancerSpec,
    ) -> Result<LoadBalancerInfo> {
        let endpoint_ids: Vec<Uuid> = endpoints.iter().map(|e| e.id).collect();
        let key = spec.key(&endpoint_ids);

        if let Some(id) = self.cache.lookup(&key) {
            match client.get_load_balancer_by_id(id).await {
                Ok(lb) => {
                    tracing::debug!(load_balancer = %id, "Load balancer cache hit");
                    return Ok(lb);
                }
                Err(e) if e.is_not_found() => {
                    tracing::info!(load_balancer = %id, "Cached load balancer vanished");
                    self.cache.invalidate(&key);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(lb) = client
            .list_load_balancers()
            .await?
            .into_iter()
            .find(|lb| matches(lb, &endpoint_ids, spec))
        {
            tracing::debug!(load_balancer = %lb.id, "Found existing load balancer");
            self.cache.store(key, lb.id);
            return Ok(lb);
        }

        // Resolve every member before creating so that no partial load balancer is made
        let mut resolved = Vec::with_capacity(endpoint_ids.len());
        for id in &endpoint_ids {
            match client.get_endpoint_by_id(*id).await {
                Ok(endpoint) => resolved.push(endpoint.id),
                Err(e) if e.is_not_found() => return Err(Error::EndpointResolution(*id)),
                Err(e) => return Err(e),
            }
        }

        let draft = LoadBalancerDraft {
            endpoint_ids: resolved,
            source_vip: spec.source_vip,
            frontend_vips: spec.vip.into_iter().collect(),
            port_mapping: spec.port_mapping(),
            dsr: spec.dsr,
        };
        let lb = client.create_load_balancer(&draft).await?;
        tracing::info!(
            load_balancer = %lb.id,
            vip = ?spec.vip,
            protocol = %spec.protocol,
            port = spec.external_port,
            endpoints = endpoint_ids.len(),
            "Created HNS load balancer"
        );
        self.cache.store(key, lb.id);
        Ok(lb)
    }

    /// Delete a load balancer. One that is already gone counts as deleted.
    pub async fn delete_load_balancer(&self, client: &dyn HnsClient, id: Uuid) -> Result<()> {
        self.cache.invalidate_handle(ResourceKind::LoadBalancer, id);
        match client.delete_load_balancer(id).await {
            Ok(()) => {
                tracing::info!(load_balancer = %id, "Deleted HNS load balancer");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(load_balancer = %id, "Load balancer already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{EndpointManager, EndpointRequest};
    use crate::error::ErrorKind;
    use crate::hns::{MemoryHns, MockHnsClient};

    struct Fixture {
        hns: MemoryHns,
        endpoints: EndpointManager,
        lbs: LoadBalancerManager,
    }

    fn fixture() -> Fixture {
        let hns = MemoryHns::new();
        hns.add_network("vxlan0", "Overlay");
        let cache = Arc::new(ResourceCache::new(4));
        Fixture {
            hns,
            endpoints: EndpointManager::new(Arc::clone(&cache), 4),
            lbs: LoadBalancerManager::new(cache),
        }
    }

    impl Fixture {
        async fn endpoint(&self, ip: &str) -> EndpointInfo {
            let request = EndpointRequest {
                ip: ip.parse().unwrap(),
                network: "vxlan0".into(),
                is_local: true,
                provider_address: None,
                mac_address: None,
            };
            self.endpoints.ensure_endpoint(&self.hns, &request).await.unwrap()
        }
    }

    fn http() -> LoadBalancerSpec {
        LoadBalancerSpec {
            protocol: Protocol::Tcp,
            internal_port: 80,
            external_port: 80,
            vip: Some("10.0.0.1".parse().unwrap()),
            source_vip: None,
            ilb: false,
            dsr: false,
        }
    }

    fn existing(endpoint_ids: Vec<Uuid>, spec: &LoadBalancerSpec) -> LoadBalancerInfo {
        LoadBalancerInfo {
            id: Uuid::new_v4(),
            endpoint_ids,
            source_vip: None,
            frontend_vips: spec.vip.into_iter().collect(),
            port_mappings: vec![spec.port_mapping()],
            flags: 0,
        }
    }

    #[test]
    fn test_matches_each_field() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let spec = http();
        let lb = existing(ids.clone(), &spec);
        assert!(matches(&lb, &ids, &spec));

        let reversed: Vec<Uuid> = ids.iter().rev().copied().collect();
        assert!(matches(&lb, &reversed, &spec));

        assert!(!matches(&lb, &ids[..1], &spec));
        assert!(!matches(&lb, &[ids[0], Uuid::new_v4()], &spec));
        assert!(!matches(&lb, &ids, &LoadBalancerSpec { protocol: Protocol::Udp, ..spec.clone() }));
        assert!(!matches(&lb, &ids, &LoadBalancerSpec { internal_port: 8080, ..spec.clone() }));
        assert!(!matches(&lb, &ids, &LoadBalancerSpec { external_port: 443, ..spec.clone() }));
        assert!(!matches(&lb, &ids, &LoadBalancerSpec { ilb: true, ..spec.clone() }));
        assert!(!matches(&lb, &ids, &LoadBalancerSpec { dsr: true, ..spec.clone() }));
        assert!(!matches(
            &lb,
            &ids,
            &LoadBalancerSpec { vip: Some("10.0.0.2".parse().unwrap()), ..spec.clone() }
        ));
    }

    #[test]
    fn test_matches_without_vip_ignores_frontend() {
        let ids = vec![Uuid::new_v4()];
        let lb = existing(ids.clone(), &http());
        assert!(matches(&lb, &ids, &LoadBalancerSpec { vip: None, ..http() }));
    }

    #[test]
    fn test_matches_only_first_port_mapping() {
        let ids = vec![Uuid::new_v4()];
        let mut lb = existing(ids.clone(), &http());
        lb.port_mappings.insert(
            0,
            PortMapping {
                protocol: 17,
                internal_port: 53,
                external_port: 53,
                flags: 0,
            },
        );
        assert!(!matches(&lb, &ids, &http()));
    }

    #[tokio::test]
    async fn test_ensure_twice_creates_once() {
        let f = fixture();
        let ep = f.endpoint("10.244.1.5").await;

        let first = f.lbs.ensure_load_balancer(&f.hns, &[ep.clone()], &http()).await.unwrap();
        let second = f.lbs.ensure_load_balancer(&f.hns, &[ep], &http()).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(f.hns.calls("create_load_balancer"), 1);
        assert_eq!(first.frontend_vips, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(first.port_mappings[0].protocol, 6);
        assert!(!first.port_mappings[0].is_ilb());
    }

    #[tokio::test]
    async fn test_adopts_matching_load_balancer_without_cache() {
        let f = fixture();
        let ep = f.endpoint("10.244.1.5").await;
        let lb = f.lbs.ensure_load_balancer(&f.hns, &[ep.clone()], &http()).await.unwrap();

        let fresh = LoadBalancerManager::new(Arc::new(ResourceCache::new(4)));
        let found = fresh.ensure_load_balancer(&f.hns, &[ep], &http()).await.unwrap();
        assert_eq!(found.id, lb.id);
        assert_eq!(f.hns.calls("create_load_balancer"), 1);
    }

    #[tokio::test]
    async fn test_different_members_never_share() {
        let f = fixture();
        let a = f.endpoint("10.244.1.5").await;
        let b = f.endpoint("10.244.1.6").await;
        let c = f.endpoint("10.244.1.7").await;

        let one = f.lbs.ensure_load_balancer(&f.hns, &[a.clone()], &http()).await.unwrap();
        let two = f.lbs.ensure_load_balancer(&f.hns, &[a.clone(), b.clone()], &http()).await.unwrap();
        let other = f.lbs.ensure_load_balancer(&f.hns, &[a, c], &http()).await.unwrap();

        assert_ne!(one.id, two.id);
        assert_ne!(two.id, other.id);
        assert_eq!(f.hns.calls("create_load_balancer"), 3);
    }

    #[tokio::test]
    async fn test_without_vip_creates_empty_frontend() {
        let f = fixture();
        let ep = f.endpoint("10.244.1.5").await;
        let spec = LoadBalancerSpec {
            vip: None,
            source_vip: Some("10.244.1.2".parse().unwrap()),
            ilb: true,
            ..http()
        };

        let lb = f.lbs.ensure_load_balancer(&f.hns, &[ep], &spec).await.unwrap();
        assert!(lb.frontend_vips.is_empty());
        assert_eq!(lb.source_vip, spec.source_vip);
        assert!(lb.port_mappings[0].is_ilb());
    }

    #[tokio::test]
    async fn test_vanished_load_balancer_is_recreated() {
        let f = fixture();
        let ep = f.endpoint("10.244.1.5").await;
        let first = f.lbs.ensure_load_balancer(&f.hns, &[ep.clone()], &http()).await.unwrap();
        assert!(f.hns.remove_load_balancer(first.id));

        let second = f.lbs.ensure_load_balancer(&f.hns, &[ep], &http()).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(f.hns.calls("create_load_balancer"), 2);
    }

    #[tokio::test]
    async fn test_missing_endpoint_blocks_creation() {
        let f = fixture();
        let ep = f.endpoint("10.244.1.5").await;
        let gone = f.endpoint("10.244.1.6").await;
        f.hns.remove_endpoint(gone.id);

        let err = f
            .lbs
            .ensure_load_balancer(&f.hns, &[ep, gone.clone()], &http())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EndpointResolution(id) if id == gone.id));
        assert_eq!(err.kind(), ErrorKind::ReferentialIntegrityViolation);
        assert_eq!(f.hns.calls("create_load_balancer"), 0);
        assert!(f.hns.load_balancers().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_load_balancer_succeeds() {
        let f = fixture();
        f.lbs.delete_load_balancer(&f.hns, Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_failure_is_surfaced() {
        let mut mock = MockHnsClient::new();
        mock.expect_list_load_balancers()
            .times(1)
            .returning(|| Err(Error::Unavailable("pipe closed".into())));
        mock.expect_create_load_balancer().never();
        let lbs = LoadBalancerManager::new(Arc::new(ResourceCache::new(4)));

        let err = lbs.ensure_load_balancer(&mock, &[], &http()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ControlPlaneUnavailable);
    }
}
