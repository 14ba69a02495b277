//! Reconciliation loop
//!
//! Each service key gets its own worker task. A worker owns what it has
//! applied to HNS for its key (the load balancer and the endpoints it holds a
//! reference on) and drives the managers until that matches the newest
//! desired state it has been handed. Keys never wait on each other; within a
//! key every control-plane call is sequential.
//!
//! Desired state reaches a worker through a `watch` channel, so a burst of
//! updates collapses to the latest one. A pass checks for newer state between
//! steps and starts over instead of finishing stale work. Calls already in
//! flight are allowed to complete; whatever they created is picked up by the
//! next pass through the caches.

mod backoff;
mod state;

pub use backoff::ExponentialBackoff;
pub use state::{
    Backend, DesiredService, DesiredState, DesiredUpdate, ServiceKey, ServiceState, ServiceStatus,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;
use crate::cache::{self, ResourceCache};
use crate::config::ProxyConfig;
use crate::endpoint::{EndpointManager, EndpointRequest};
use crate::hns::{EndpointInfo, HnsClient, LoadBalancerInfo, TimeoutClient};
use crate::load_balancer::{self, LoadBalancerManager};
use crate::{Error, Result};

type Desired = Option<Arc<DesiredService>>;

struct Worker {
    desired: watch::Sender<Desired>,
    handle: JoinHandle<()>,
}

/// What a worker has realized in HNS for its key
#[derive(Default)]
struct Applied {
    load_balancer: Option<LoadBalancerInfo>,
    /// Endpoints this key holds one reference on
    endpoints: HashSet<Uuid>,
    /// Released endpoints whose delete failed
    releasing: HashSet<Uuid>,
}

enum Pass {
    Synced,
    Superseded,
    Removed,
}

struct Shared {
    client: TimeoutClient,
    endpoints: EndpointManager,
    load_balancers: LoadBalancerManager,
    config: ProxyConfig,
    statuses: DashMap<ServiceKey, ServiceStatus>,
    workers: Mutex<HashMap<ServiceKey, Worker>>,
}

/// Drives HNS towards the desired service state
///
/// Must be used from within a tokio runtime; workers are spawned on it.
pub struct Reconciler {
    shared: Arc<Shared>,
}

impl Reconciler {
    pub fn new(client: Arc<dyn HnsClient>, config: ProxyConfig) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(ResourceCache::new(config.cache_shards));
        Ok(Self {
            shared: Arc::new(Shared {
                client: TimeoutClient::new(client, config.call_timeout),
                endpoints: EndpointManager::new(Arc::clone(&cache), config.cache_shards),
                load_balancers: LoadBalancerManager::new(cache),
                statuses: cache::sharded(config.cache_shards),
                workers: Mutex::new(HashMap::new()),
                config,
            }),
        })
    }

    /// Apply one incremental change.
    ///
    /// An invalid service that has no worker yet is reported `Degraded`
    /// without touching HNS. A live worker is handed the invalid state and
    /// degrades on its next pass, leaving what it applied in place.
    pub fn apply(&self, update: DesiredUpdate) {
        let mut workers = self.shared.workers.lock();
        match update {
            DesiredUpdate::Upsert(service) => {
                let key = service.key.clone();
                let service = Arc::new(service);
                let live = workers.get(&key).filter(|w| !w.handle.is_finished());
                if live.is_none() {
                    if let Err(e) = service.validate() {
                        self.shared.degrade(&key, &e);
                        return;
                    }
                }
                match live {
                    Some(worker) => {
                        let changed = worker.desired.send_if_modified(|current| {
                            if current.as_deref() == Some(&*service) {
                                false
                            } else {
                                *current = Some(service);
                                true
                            }
                        });
                        if changed {
                            tracing::debug!(service = %key, "Desired state changed");
                        }
                    }
                    None => {
                        tracing::info!(service = %key, "Tracking new service");
                        let (tx, rx) = watch::channel(Some(service));
                        self.shared.statuses.insert(
                            key.clone(),
                            ServiceStatus {
                                state: ServiceState::Pending,
                                ..ServiceStatus::default()
                            },
                        );
                        let handle = tokio::spawn(run_worker(
                            Arc::clone(&self.shared),
                            key.clone(),
                            rx,
                        ));
                        workers.insert(key, Worker { desired: tx, handle });
                    }
                }
            }
            DesiredUpdate::Remove(key) => match workers.get(&key) {
                Some(worker) => {
                    if worker.desired.send_if_modified(|current| current.take().is_some()) {
                        tracing::info!(service = %key, "Service removed from desired state");
                    }
                }
                None => {
                    // Only a rejected, never-applied service can be left here
                    self.shared.statuses.remove(&key);
                }
            },
        }
    }

    /// Replace the whole desired state. Keys missing from `state` are torn down.
    pub fn apply_snapshot(&self, state: DesiredState) {
        let wanted: HashSet<ServiceKey> = state.services.iter().map(|s| s.key.clone()).collect();
        let mut stale: HashSet<ServiceKey> = self
            .shared
            .workers
            .lock()
            .keys()
            .filter(|key| !wanted.contains(*key))
            .cloned()
            .collect();
        stale.extend(
            self.shared
                .statuses
                .iter()
                .map(|entry| entry.key().clone())
                .filter(|key| !wanted.contains(key)),
        );

        for key in stale {
            self.apply(DesiredUpdate::Remove(key));
        }
        for service in state.services {
            self.apply(DesiredUpdate::Upsert(service));
        }
    }

    /// Run a pass for every key even if its desired state is unchanged,
    /// repairing drift such as resources deleted outside the reconciler
    pub fn resync(&self) {
        for worker in self.shared.workers.lock().values() {
            worker.desired.send_modify(|_| {});
        }
    }

    /// Status of `key`; untracked keys are `Absent`
    pub fn status(&self, key: &ServiceKey) -> ServiceStatus {
        self.shared
            .statuses
            .get(key)
            .map(|status| status.clone())
            .unwrap_or_default()
    }

    pub fn statuses(&self) -> Vec<(ServiceKey, ServiceStatus)> {
        let mut statuses: Vec<(ServiceKey, ServiceStatus)> = self
            .shared
            .statuses
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    /// Number of keys with a live worker
    pub fn tracked(&self) -> usize {
        self.shared.workers.lock().len()
    }

    /// Stop every worker once its current pass ends. Nothing is torn down in HNS.
    pub async fn shutdown(&self) {
        let workers: Vec<Worker> = self.shared.workers.lock().drain().map(|(_, w)| w).collect();
        for worker in workers {
            drop(worker.desired);
            if let Err(e) = worker.handle.await {
                tracing::error!(error = %e, "Reconcile worker panicked");
            }
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        // Closing the channels ends the workers
        self.shared.workers.lock().clear();
    }
}

async fn run_worker(shared: Arc<Shared>, key: ServiceKey, mut desired: watch::Receiver<Desired>) {
    let mut applied = Applied::default();
    let mut backoff = ExponentialBackoff::new(&shared.config.backoff);

    loop {
        let target = desired.borrow_and_update().clone();
        let result = match &target {
            Some(service) => shared.sync(&key, service, &mut applied, &desired).await,
            None => shared.teardown(&key, &mut applied).await,
        };

        match result {
            Ok(Pass::Superseded) => {
                tracing::debug!(service = %key, "Pass superseded by newer desired state");
            }
            Ok(Pass::Synced) => {
                backoff.reset();
                if desired.changed().await.is_err() {
                    return;
                }
            }
            Ok(Pass::Removed) => {
                backoff.reset();
                if shared.retire(&key, &desired) {
                    tracing::info!(service = %key, "Service torn down");
                    return;
                }
            }
            Err(e) => {
                shared.degrade(&key, &e);
                if e.is_retryable() {
                    let delay = backoff.next_backoff();
                    tracing::debug!(service = %key, delay_ms = delay.as_millis() as u64, "Retrying after backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = desired.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                } else if desired.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

fn superseded(desired: &watch::Receiver<Desired>) -> bool {
    desired.has_changed().unwrap_or(false)
}

impl Shared {
    async fn sync(
        &self,
        key: &ServiceKey,
        service: &DesiredService,
        applied: &mut Applied,
        desired: &watch::Receiver<Desired>,
    ) -> Result<Pass> {
        self.update_status(key, |status| {
            if status.state != ServiceState::Degraded {
                status.state = ServiceState::Pending;
            }
        });
        service.validate()?;

        if service.backends.is_empty() {
            self.remove_load_balancer(applied).await?;
            self.release_endpoints(applied, &HashSet::new()).await?;
            self.mark_synced(key, applied);
            return Ok(Pass::Synced);
        }

        let mut members: Vec<EndpointInfo> = Vec::with_capacity(service.backends.len());
        for backend in &service.backends {
            let request = self.endpoint_request(backend).await?;
            let endpoint = self
                .endpoints
                .acquire_endpoint(&self.client, &request)
                .await?;
            if !applied.endpoints.insert(endpoint.id) {
                // Held since an earlier pass; the count stays above zero
                self.endpoints.release(&self.client, endpoint.id).await?;
            }
            if !members.iter().any(|m| m.id == endpoint.id) {
                members.push(endpoint);
            }
            if superseded(desired) {
                return Ok(Pass::Superseded);
            }
        }

        let ids: Vec<Uuid> = members.iter().map(|m| m.id).collect();
        let spec = service.load_balancer_spec();
        if let Some(current) = &applied.load_balancer {
            if !load_balancer::matches(current, &ids, &spec) {
                tracing::info!(service = %key, load_balancer = %current.id, "Replacing load balancer");
                self.remove_load_balancer(applied).await?;
            }
        }

        let lb = self
            .load_balancers
            .ensure_load_balancer(&self.client, &members, &spec)
            .await?;
        applied.load_balancer = Some(lb);

        let current: HashSet<Uuid> = ids.into_iter().collect();
        self.release_endpoints(applied, &current).await?;

        self.mark_synced(key, applied);
        Ok(Pass::Synced)
    }

    async fn teardown(&self, key: &ServiceKey, applied: &mut Applied) -> Result<Pass> {
        tracing::debug!(service = %key, "Tearing down service");
        self.remove_load_balancer(applied).await?;
        self.release_endpoints(applied, &HashSet::new()).await?;
        Ok(Pass::Removed)
    }

    async fn endpoint_request(&self, backend: &Backend) -> Result<EndpointRequest> {
        let mut provider_address = backend.provider_address;
        if backend.remote && provider_address.is_none() {
            let network = self
                .endpoints
                .network(&self.client, &self.config.network_name)
                .await?;
            provider_address = network.provider_address_for(backend.ip);
        }
        Ok(EndpointRequest {
            ip: backend.ip,
            network: self.config.network_name.clone(),
            is_local: !backend.remote,
            provider_address,
            mac_address: backend.mac_address.clone(),
        })
    }

    async fn remove_load_balancer(&self, applied: &mut Applied) -> Result<()> {
        if let Some(lb) = &applied.load_balancer {
            self.load_balancers
                .delete_load_balancer(&self.client, lb.id)
                .await?;
            applied.load_balancer = None;
        }
        Ok(())
    }

    /// Drop the references held on endpoints outside `keep`, then retry
    /// deletes that failed earlier. The first failure is returned after
    /// every endpoint has been attempted.
    async fn release_endpoints(&self, applied: &mut Applied, keep: &HashSet<Uuid>) -> Result<()> {
        let mut first_error: Option<Error> = None;

        let stale: Vec<Uuid> = applied.endpoints.difference(keep).copied().collect();
        for id in stale {
            applied.endpoints.remove(&id);
            if let Err(e) = self.endpoints.release(&self.client, id).await {
                tracing::warn!(endpoint = %id, error = %e, "Failed to delete released endpoint");
                applied.releasing.insert(id);
                first_error.get_or_insert(e);
            }
        }

        let pending: Vec<Uuid> = applied
            .releasing
            .iter()
            .filter(|id| !keep.contains(*id))
            .copied()
            .collect();
        for id in pending {
            match self.endpoints.collect(&self.client, id).await {
                Ok(_) => {
                    applied.releasing.remove(&id);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn update_status(&self, key: &ServiceKey, f: impl FnOnce(&mut ServiceStatus)) {
        f(&mut self.statuses.entry(key.clone()).or_default());
    }

    fn mark_synced(&self, key: &ServiceKey, applied: &Applied) {
        let load_balancer = applied.load_balancer.as_ref().map(|lb| lb.id);
        let mut endpoints: Vec<Uuid> = applied.endpoints.iter().copied().collect();
        endpoints.sort();
        self.update_status(key, |status| {
            if status.state != ServiceState::Synced {
                tracing::info!(service = %key, load_balancer = ?load_balancer, "Service synced");
            }
            *status = ServiceStatus {
                state: ServiceState::Synced,
                load_balancer,
                endpoints,
                ..ServiceStatus::default()
            };
        });
    }

    fn degrade(&self, key: &ServiceKey, error: &Error) {
        self.update_status(key, |status| {
            status.state = ServiceState::Degraded;
            status.failures += 1;
            status.last_error = Some(error.to_string());
            status.error_kind = Some(error.kind());
            tracing::warn!(
                service = %key,
                error = %error,
                kind = %error.kind(),
                failures = status.failures,
                "Service degraded"
            );
        });
    }

    /// Forget a torn-down key unless it was re-declared meanwhile. Holding the
    /// workers lock keeps `apply` from handing state to a worker that is exiting.
    fn retire(&self, key: &ServiceKey, desired: &watch::Receiver<Desired>) -> bool {
        let mut workers = self.workers.lock();
        if superseded(desired) {
            return false;
        }
        workers.remove(key);
        self.statuses.remove(key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::time::Duration;
    use crate::error::ErrorKind;
    use crate::hns::{MemoryHns, Protocol, RemoteSubnetRoute};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn setup() -> (Arc<MemoryHns>, Reconciler) {
        let hns = Arc::new(MemoryHns::new());
        hns.add_network("vxlan0", "Overlay");
        let config = ProxyConfig::new("vxlan0")
            .call_timeout(Duration::from_secs(5))
            .backoff(Duration::from_millis(100), Duration::from_secs(2))
            .cache_shards(4);
        let reconciler = Reconciler::new(hns.clone(), config).unwrap();
        (hns, reconciler)
    }

    fn service(name: &str, backends: &[&str]) -> DesiredService {
        DesiredService {
            key: ServiceKey::new("default", name, "http"),
            vip: Some(ip("10.0.0.1")),
            source_vip: None,
            protocol: Protocol::Tcp,
            port: 80,
            target_port: 80,
            backends: backends.iter().map(|b| Backend::local(ip(b))).collect(),
            internal: false,
            direct_server_return: false,
        }
    }

    /// Let workers run until `key` reaches `state`, or panic after a while
    async fn wait_for(reconciler: &Reconciler, key: &ServiceKey, state: ServiceState) -> ServiceStatus {
        for _ in 0..2000 {
            let status = reconciler.status(key);
            if status.state == state {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached {}: {:?}", key, state, reconciler.status(key));
    }

    /// Wait until the worker for `key` has exited
    async fn wait_retired(reconciler: &Reconciler) {
        for _ in 0..2000 {
            if reconciler.tracked() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workers never exited");
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_backend_service() {
        let (hns, reconciler) = setup();
        let svc = service("a", &["10.244.1.5"]);

        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        let status = wait_for(&reconciler, &svc.key, ServiceState::Synced).await;

        let endpoints = hns.endpoints();
        assert_eq!(endpoints.len(), 1);
        assert!(endpoints[0].is_local);
        assert_eq!(endpoints[0].ip, ip("10.244.1.5"));

        let lbs = hns.load_balancers();
        assert_eq!(lbs.len(), 1);
        assert_eq!(lbs[0].frontend_vips, vec![ip("10.0.0.1")]);
        assert_eq!(lbs[0].port_mappings[0].external_port, 80);
        assert_eq!(lbs[0].port_mappings[0].protocol, 6);
        assert!(!lbs[0].port_mappings[0].is_ilb());
        assert_eq!(status.load_balancer, Some(lbs[0].id));
        assert_eq!(status.endpoints, vec![endpoints[0].id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_redeclaration_is_noop() {
        let (hns, reconciler) = setup();
        let svc = service("a", &["10.244.1.5"]);

        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        wait_for(&reconciler, &svc.key, ServiceState::Synced).await;

        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        reconciler.apply_snapshot(DesiredState { services: vec![svc.clone()] });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(reconciler.status(&svc.key).state, ServiceState::Synced);
        assert_eq!(hns.calls("create_endpoint"), 1);
        assert_eq!(hns.calls("create_load_balancer"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_deletes_everything() {
        let (hns, reconciler) = setup();
        let svc = service("a", &["10.244.1.5"]);

        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        wait_for(&reconciler, &svc.key, ServiceState::Synced).await;

        reconciler.apply(DesiredUpdate::Remove(svc.key.clone()));
        wait_retired(&reconciler).await;

        assert_eq!(reconciler.status(&svc.key).state, ServiceState::Absent);
        assert_eq!(hns.calls("delete_load_balancer"), 1);
        assert_eq!(hns.calls("delete_endpoint"), 1);
        assert!(hns.load_balancers().is_empty());
        assert!(hns.endpoints().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_growing_backends_replaces_load_balancer() {
        let (hns, reconciler) = setup();
        let svc = service("a", &["10.244.1.5"]);

        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        let before = wait_for(&reconciler, &svc.key, ServiceState::Synced).await;

        reconciler.apply(DesiredUpdate::Upsert(service("a", &["10.244.1.5", "10.244.1.6"])));
        let mut after = before.clone();
        for _ in 0..100 {
            after = reconciler.status(&svc.key);
            if after.state == ServiceState::Synced && after.load_balancer != before.load_balancer {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let lbs = hns.load_balancers();
        assert_eq!(lbs.len(), 1);
        assert_ne!(Some(lbs[0].id), before.load_balancer);
        assert_eq!(after.load_balancer, Some(lbs[0].id));
        assert_eq!(lbs[0].endpoint_ids.len(), 2);
        assert_eq!(hns.calls("delete_load_balancer"), 1);
        assert_eq!(hns.endpoints().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrinking_backends_releases_endpoint() {
        let (hns, reconciler) = setup();
        let svc = service("a", &["10.244.1.5", "10.244.1.6"]);
        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        wait_for(&reconciler, &svc.key, ServiceState::Synced).await;

        reconciler.apply(DesiredUpdate::Upsert(service("a", &["10.244.1.5"])));
        for _ in 0..100 {
            if hns.endpoints().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let endpoints = hns.endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].ip, ip("10.244.1.5"));
        assert_eq!(hns.load_balancers()[0].endpoint_ids, vec![endpoints[0].id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_endpoint_survives_first_teardown() {
        let (hns, reconciler) = setup();
        let a = service("a", &["10.244.1.5"]);
        let b = DesiredService {
            vip: Some(ip("10.0.0.2")),
            ..service("b", &["10.244.1.5"])
        };

        reconciler.apply_snapshot(DesiredState { services: vec![a.clone(), b.clone()] });
        wait_for(&reconciler, &a.key, ServiceState::Synced).await;
        wait_for(&reconciler, &b.key, ServiceState::Synced).await;
        assert_eq!(hns.endpoints().len(), 1);
        assert_eq!(hns.load_balancers().len(), 2);

        reconciler.apply_snapshot(DesiredState { services: vec![b.clone()] });
        for _ in 0..100 {
            if reconciler.tracked() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hns.load_balancers().len(), 1);
        assert_eq!(hns.endpoints().len(), 1);
        assert_eq!(hns.calls("delete_endpoint"), 0);

        reconciler.apply_snapshot(DesiredState::default());
        wait_retired(&reconciler).await;
        assert!(hns.load_balancers().is_empty());
        assert!(hns.endpoints().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_backend_uses_subnet_provider_address() {
        let (hns, reconciler) = setup();
        hns.add_remote_subnet(
            "vxlan0",
            RemoteSubnetRoute {
                destination_prefix: "10.244.2.0/24".parse().unwrap(),
                isolation_id: 4096,
                provider_address: ip("192.168.1.12"),
                dr_mac_address: "02-11-0a-f4-02-01".into(),
            },
        );
        let mut svc = service("a", &[]);
        svc.backends.push(Backend::remote(ip("10.244.2.7"), None));

        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        wait_for(&reconciler, &svc.key, ServiceState::Synced).await;

        let endpoints = hns.endpoints();
        assert_eq!(endpoints.len(), 1);
        assert!(!endpoints[0].is_local);
        assert_eq!(endpoints[0].provider_address, Some(ip("192.168.1.12")));
        assert_eq!(hns.calls("create_remote_endpoint"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_address_change_moves_remote_backend() {
        let (hns, reconciler) = setup();
        let mut svc = service("a", &[]);
        svc.backends.push(Backend::remote(ip("10.244.2.7"), Some(ip("192.168.1.12"))));
        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        let before = wait_for(&reconciler, &svc.key, ServiceState::Synced).await;

        let mut moved = svc.clone();
        moved.backends[0].provider_address = Some(ip("192.168.1.99"));
        reconciler.apply(DesiredUpdate::Upsert(moved));
        for _ in 0..100 {
            if hns.calls("update_endpoint_policy") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let after = wait_for(&reconciler, &svc.key, ServiceState::Synced).await;

        let endpoints = hns.endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].provider_address, Some(ip("192.168.1.99")));
        assert_eq!(hns.calls("create_remote_endpoint"), 1);
        assert_eq!(hns.calls("create_load_balancer"), 1);
        assert_eq!(after.load_balancer, before.load_balancer);
        assert_eq!(after.endpoints, before.endpoints);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_service_is_degraded_without_worker() {
        let (hns, reconciler) = setup();
        let invalid = DesiredService {
            port: 0,
            ..service("a", &["10.244.1.5"])
        };

        reconciler.apply(DesiredUpdate::Upsert(invalid.clone()));
        let status = reconciler.status(&invalid.key);
        assert_eq!(status.state, ServiceState::Degraded);
        assert_eq!(status.error_kind, Some(ErrorKind::ConfigInvalid));
        assert_eq!(reconciler.tracked(), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(hns.calls("list_endpoints"), 0);
        assert!(hns.endpoints().is_empty());

        reconciler.apply_snapshot(DesiredState::default());
        assert_eq!(reconciler.status(&invalid.key).state, ServiceState::Absent);
        assert!(reconciler.statuses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_update_keeps_applied_state() {
        let (hns, reconciler) = setup();
        let svc = service("a", &["10.244.1.5"]);
        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        wait_for(&reconciler, &svc.key, ServiceState::Synced).await;

        reconciler.apply(DesiredUpdate::Upsert(DesiredService {
            target_port: 0,
            ..svc.clone()
        }));
        let status = wait_for(&reconciler, &svc.key, ServiceState::Degraded).await;
        assert_eq!(status.error_kind, Some(ErrorKind::ConfigInvalid));
        assert_eq!(hns.load_balancers().len(), 1);
        assert_eq!(hns.endpoints().len(), 1);

        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        wait_for(&reconciler, &svc.key, ServiceState::Synced).await;
        assert_eq!(hns.calls("create_load_balancer"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_degrades_then_recovers() {
        let (hns, reconciler) = setup();
        hns.inject_fault("create_load_balancer", ErrorKind::ControlPlaneUnavailable);
        hns.inject_fault("create_load_balancer", ErrorKind::ControlPlaneUnavailable);
        let svc = service("a", &["10.244.1.5"]);

        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        let degraded = wait_for(&reconciler, &svc.key, ServiceState::Degraded).await;
        assert_eq!(degraded.error_kind, Some(ErrorKind::ControlPlaneUnavailable));
        assert!(degraded.last_error.is_some());

        let synced = wait_for(&reconciler, &svc.key, ServiceState::Synced).await;
        assert_eq!(synced.failures, 0);
        assert_eq!(hns.calls("create_load_balancer"), 3);
        assert_eq!(hns.calls("create_endpoint"), 1);
        assert_eq!(hns.load_balancers().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() {
        let (hns, reconciler) = setup();
        hns.set_latency(Duration::from_secs(10));
        let svc = service("a", &["10.244.1.5"]);

        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        let degraded = wait_for(&reconciler, &svc.key, ServiceState::Degraded).await;
        assert_eq!(degraded.error_kind, Some(ErrorKind::ControlPlaneUnavailable));

        hns.set_latency(Duration::ZERO);
        wait_for(&reconciler, &svc.key, ServiceState::Synced).await;
        assert_eq!(hns.load_balancers().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_network_waits_for_change() {
        let (hns, reconciler) = setup();
        drop(reconciler);
        let reconciler = Reconciler::new(hns.clone(), ProxyConfig::new("missing")).unwrap();
        let svc = service("a", &["10.244.1.5"]);

        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        let degraded = wait_for(&reconciler, &svc.key, ServiceState::Degraded).await;
        assert_eq!(degraded.error_kind, Some(ErrorKind::ConfigInvalid));

        tokio::time::sleep(Duration::from_secs(60)).await;
        let status = reconciler.status(&svc.key);
        assert_eq!(status.state, ServiceState::Degraded);
        assert_eq!(status.failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_retried() {
        let (hns, reconciler) = setup();
        hns.inject_fault("create_load_balancer", ErrorKind::NotFoundTransient);
        let svc = service("a", &["10.244.1.5"]);

        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        wait_for(&reconciler, &svc.key, ServiceState::Degraded).await;
        let synced = wait_for(&reconciler, &svc.key, ServiceState::Synced).await;

        assert_eq!(hns.load_balancers().len(), 1);
        assert_eq!(synced.endpoints.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_backends_has_no_load_balancer() {
        let (hns, reconciler) = setup();
        let svc = service("a", &["10.244.1.5"]);
        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        wait_for(&reconciler, &svc.key, ServiceState::Synced).await;

        reconciler.apply(DesiredUpdate::Upsert(service("a", &[])));
        for _ in 0..100 {
            if hns.load_balancers().is_empty() && hns.endpoints().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = wait_for(&reconciler, &svc.key, ServiceState::Synced).await;
        assert!(hns.load_balancers().is_empty());
        assert!(hns.endpoints().is_empty());
        assert_eq!(status.load_balancer, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_state_wins_over_slow_pass() {
        let (hns, reconciler) = setup();
        hns.set_latency(Duration::from_millis(200));
        let first = service("a", &["10.244.1.5"]);
        let second = service("a", &["10.244.1.6"]);

        reconciler.apply(DesiredUpdate::Upsert(first.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        reconciler.apply(DesiredUpdate::Upsert(second.clone()));

        let status = wait_for(&reconciler, &first.key, ServiceState::Synced).await;
        let lbs = hns.load_balancers();
        assert_eq!(lbs.len(), 1);
        assert_eq!(Some(lbs[0].id), status.load_balancer);

        let endpoints = hns.endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].ip, ip("10.244.1.6"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readded_during_teardown_is_synced() {
        let (hns, reconciler) = setup();
        let svc = service("a", &["10.244.1.5"]);
        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        wait_for(&reconciler, &svc.key, ServiceState::Synced).await;

        hns.set_latency(Duration::from_millis(100));
        reconciler.apply(DesiredUpdate::Remove(svc.key.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));

        for _ in 0..200 {
            if hns.calls("create_load_balancer") == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = wait_for(&reconciler, &svc.key, ServiceState::Synced).await;
        assert_eq!(hns.calls("delete_load_balancer"), 1);
        assert_eq!(reconciler.tracked(), 1);
        assert_eq!(status.load_balancer, Some(hns.load_balancers()[0].id));
        assert_eq!(hns.load_balancers().len(), 1);
        assert_eq!(hns.endpoints().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_repairs_external_delete() {
        let (hns, reconciler) = setup();
        let svc = service("a", &["10.244.1.5"]);
        reconciler.apply(DesiredUpdate::Upsert(svc.clone()));
        let before = wait_for(&reconciler, &svc.key, ServiceState::Synced).await;
        let Some(lb) = before.load_balancer else {
            panic!("no load balancer recorded");
        };
        assert!(hns.remove_load_balancer(lb));

        reconciler.resync();
        for _ in 0..100 {
            if hns.load_balancers().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hns.load_balancers().len(), 1);
        assert_eq!(hns.calls("create_load_balancer"), 2);
        assert_eq!(hns.calls("create_endpoint"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_statuses_sorted() {
        let (_hns, reconciler) = setup();
        reconciler.apply(DesiredUpdate::Upsert(service("b", &["10.244.1.6"])));
        reconciler.apply(DesiredUpdate::Upsert(service("a", &["10.244.1.5"])));
        let names: Vec<String> = reconciler
            .statuses()
            .into_iter()
            .map(|(key, _)| key.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        reconciler.shutdown().await;
        assert_eq!(reconciler.tracked(), 0);
    }
}
