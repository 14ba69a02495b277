//! HCN bindings
//!
//! Every HCN call blocks, so each operation runs on the blocking pool.
//! Documents go in and come out as schema 2.0 JSON; HRESULTs are classified
//! by [`Error::from_hresult`].

use std::ffi::c_void;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use uuid::Uuid;
use windows::core::{GUID, HSTRING, PCWSTR, PWSTR};
use windows::Win32::System::Com::CoTaskMemFree;
use windows::Win32::System::HostComputeNetwork::*;
use super::schema::{
    self, HostComputeEndpoint, HostComputeLoadBalancer, HostComputeNetwork, HostComputeQuery,
    ModifyEndpointSettingRequest,
};
use super::{
    EndpointDraft, EndpointInfo, HnsClient, LoadBalancerDraft, LoadBalancerInfo, NetworkInfo,
    ENDPOINT_FLAG_REMOTE,
};
use crate::policy::PolicyInfo;
use crate::{Error, Result};

/// Take ownership of a string allocated by HCN
unsafe fn take_string(value: PWSTR) -> String {
    if value.is_null() {
        return String::new();
    }
    let s = value.to_string().unwrap_or_default();
    CoTaskMemFree(Some(value.as_ptr() as *const c_void));
    s
}

/// Run one HCN call, turning a failed HRESULT into a crate error
fn hcn<F>(operation: &'static str, id: &str, call: F) -> Result<()>
where
    F: FnOnce(*mut PWSTR) -> windows::core::Result<()>,
{
    let mut record = PWSTR::null();
    let result = call(std::ptr::addr_of_mut!(record));
    let record = unsafe { take_string(record) };
    result.map_err(|e| {
        if !record.is_empty() {
            tracing::debug!(operation, id, error_record = %record, "HCN error record");
        }
        Error::from_hresult(e.code().0, operation, id)
    })
}

fn guid(id: Uuid) -> GUID {
    GUID::from_u128(id.as_u128())
}

fn document<T: serde::Serialize>(value: &T) -> Result<HSTRING> {
    Ok(HSTRING::from(serde_json::to_string(value)?))
}

/// Open HCN object, closed on drop
struct Handle {
    raw: *mut c_void,
    close: unsafe fn(*const c_void) -> windows::core::Result<()>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            unsafe {
                let _ = (self.close)(self.raw);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Resource {
    Network,
    Endpoint,
    LoadBalancer,
}

impl Resource {
    fn name(self) -> &'static str {
        match self {
            Resource::Network => "network",
            Resource::Endpoint => "endpoint",
            Resource::LoadBalancer => "load balancer",
        }
    }

    fn close_fn(self) -> unsafe fn(*const c_void) -> windows::core::Result<()> {
        match self {
            Resource::Network => HcnCloseNetwork,
            Resource::Endpoint => HcnCloseEndpoint,
            Resource::LoadBalancer => HcnCloseLoadBalancer,
        }
    }

    fn enumerate(self, query: &HostComputeQuery) -> Result<Vec<Uuid>> {
        let query = document(query)?;
        let mut ids = PWSTR::null();
        hcn("enumerate", self.name(), |record| unsafe {
            let query = PCWSTR(query.as_ptr());
            match self {
                Resource::Network => HcnEnumerateNetworks(query, &mut ids, Some(record)),
                Resource::Endpoint => HcnEnumerateEndpoints(query, &mut ids, Some(record)),
                Resource::LoadBalancer => HcnEnumerateLoadBalancers(query, &mut ids, Some(record)),
            }
        })?;

        let ids = unsafe { take_string(ids) };
        if ids.trim().is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = serde_json::from_str(&ids)?;
        ids.iter().map(|id| schema::parse_id(self.name(), id)).collect()
    }

    fn open(self, id: Uuid) -> Result<Handle> {
        let guid = guid(id);
        let mut raw: *mut c_void = std::ptr::null_mut();
        hcn(self.name(), &id.to_string(), |record| unsafe {
            match self {
                Resource::Network => HcnOpenNetwork(&guid, &mut raw, Some(record)),
                Resource::Endpoint => HcnOpenEndpoint(&guid, &mut raw, Some(record)),
                Resource::LoadBalancer => HcnOpenLoadBalancer(&guid, &mut raw, Some(record)),
            }
        })?;
        Ok(Handle {
            raw,
            close: self.close_fn(),
        })
    }

    fn query<T: DeserializeOwned>(self, handle: &Handle, id: &str) -> Result<T> {
        let query = document(&HostComputeQuery::all())?;
        let mut properties = PWSTR::null();
        hcn(self.name(), id, |record| unsafe {
            let query = PCWSTR(query.as_ptr());
            match self {
                Resource::Network => {
                    HcnQueryNetworkProperties(handle.raw, query, &mut properties, Some(record))
                }
                Resource::Endpoint => {
                    HcnQueryEndpointProperties(handle.raw, query, &mut properties, Some(record))
                }
                Resource::LoadBalancer => {
                    HcnQueryLoadBalancerProperties(handle.raw, query, &mut properties, Some(record))
                }
            }
        })?;
        let properties = unsafe { take_string(properties) };
        Ok(serde_json::from_str(&properties)?)
    }

    fn properties<T: DeserializeOwned>(self, id: Uuid) -> Result<T> {
        let handle = self.open(id)?;
        self.query(&handle, &id.to_string())
    }
}

fn endpoint(id: Uuid) -> Result<EndpointInfo> {
    Resource::Endpoint
        .properties::<HostComputeEndpoint>(id)?
        .try_into()
}

fn create_endpoint(network: &NetworkInfo, doc: &HostComputeEndpoint) -> Result<EndpointInfo> {
    let settings = document(doc)?;
    let network_handle = Resource::Network.open(network.id)?;
    let id = Uuid::new_v4();
    let guid = guid(id);
    let mut raw: *mut c_void = std::ptr::null_mut();
    hcn("create_endpoint", &network.name, |record| unsafe {
        HcnCreateEndpoint(
            network_handle.raw,
            &guid,
            PCWSTR(settings.as_ptr()),
            &mut raw,
            Some(record),
        )
    })?;
    let handle = Handle {
        raw,
        close: Resource::Endpoint.close_fn(),
    };
    Resource::Endpoint
        .query::<HostComputeEndpoint>(&handle, &id.to_string())?
        .try_into()
}

async fn blocking<T, F>(call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| Error::Unavailable(format!("HCN call aborted: {}", e)))?
}

/// [`HnsClient`] backed by the host's HCN service
#[derive(Debug, Default, Clone, Copy)]
pub struct HcnClient;

impl HcnClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HnsClient for HcnClient {
    async fn get_network_by_name(&self, name: &str) -> Result<NetworkInfo> {
        let name = name.to_string();
        blocking(move || {
            let id = Resource::Network
                .enumerate(&HostComputeQuery::by_name(&name))?
                .into_iter()
                .next()
                .ok_or_else(|| Error::not_found("network", &name))?;
            Resource::Network
                .properties::<HostComputeNetwork>(id)?
                .try_into()
        })
        .await
    }

    async fn get_endpoint_by_id(&self, id: Uuid) -> Result<EndpointInfo> {
        blocking(move || endpoint(id)).await
    }

    async fn list_endpoints(&self) -> Result<Vec<EndpointInfo>> {
        blocking(|| {
            let mut endpoints = Vec::new();
            for id in Resource::Endpoint.enumerate(&HostComputeQuery::all())? {
                match endpoint(id) {
                    Ok(ep) => endpoints.push(ep),
                    // Deleted between enumerate and open
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(endpoints)
        })
        .await
    }

    async fn create_endpoint(
        &self,
        network: &NetworkInfo,
        draft: &EndpointDraft,
    ) -> Result<EndpointInfo> {
        let network = network.clone();
        let doc = HostComputeEndpoint::from_draft(draft, &network);
        blocking(move || create_endpoint(&network, &doc)).await
    }

    async fn create_remote_endpoint(
        &self,
        network: &NetworkInfo,
        draft: &EndpointDraft,
    ) -> Result<EndpointInfo> {
        let network = network.clone();
        let mut doc = HostComputeEndpoint::from_draft(draft, &network);
        doc.flags |= ENDPOINT_FLAG_REMOTE;
        blocking(move || create_endpoint(&network, &doc)).await
    }

    async fn update_endpoint_policy(&self, id: Uuid, policy: &PolicyInfo) -> Result<()> {
        let request = serde_json::to_string(&ModifyEndpointSettingRequest::apply_policy(policy))?;
        blocking(move || {
            let handle = Resource::Endpoint.open(id)?;
            let request = HSTRING::from(request);
            hcn("update_endpoint_policy", &id.to_string(), |record| unsafe {
                HcnModifyEndpoint(handle.raw, PCWSTR(request.as_ptr()), Some(record))
            })
        })
        .await
    }

    async fn delete_endpoint(&self, id: Uuid) -> Result<()> {
        blocking(move || {
            let guid = guid(id);
            hcn("delete_endpoint", &id.to_string(), |record| unsafe {
                HcnDeleteEndpoint(&guid, Some(record))
            })
        })
        .await
    }

    async fn list_load_balancers(&self) -> Result<Vec<LoadBalancerInfo>> {
        blocking(|| {
            let mut lbs = Vec::new();
            for id in Resource::LoadBalancer.enumerate(&HostComputeQuery::all())? {
                match Resource::LoadBalancer.properties::<HostComputeLoadBalancer>(id) {
                    Ok(lb) => lbs.push(lb.try_into()?),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(lbs)
        })
        .await
    }

    async fn get_load_balancer_by_id(&self, id: Uuid) -> Result<LoadBalancerInfo> {
        blocking(move || {
            Resource::LoadBalancer
                .properties::<HostComputeLoadBalancer>(id)?
                .try_into()
        })
        .await
    }

    async fn create_load_balancer(&self, draft: &LoadBalancerDraft) -> Result<LoadBalancerInfo> {
        let doc = HostComputeLoadBalancer::from(draft);
        blocking(move || {
            let settings = document(&doc)?;
            let id = Uuid::new_v4();
            let guid = guid(id);
            let mut raw: *mut c_void = std::ptr::null_mut();
            hcn("create_load_balancer", &id.to_string(), |record| unsafe {
                HcnCreateLoadBalancer(&guid, PCWSTR(settings.as_ptr()), &mut raw, Some(record))
            })?;
            let handle = Handle {
                raw,
                close: Resource::LoadBalancer.close_fn(),
            };
            Resource::LoadBalancer
                .query::<HostComputeLoadBalancer>(&handle, &id.to_string())?
                .try_into()
        })
        .await
    }

    async fn delete_load_balancer(&self, id: Uuid) -> Result<()> {
        blocking(move || {
            let guid = guid(id);
            hcn("delete_load_balancer", &id.to_string(), |record| unsafe {
                HcnDeleteLoadBalancer(&guid, Some(record))
            })
        })
        .await
    }
}
