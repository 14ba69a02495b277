//! HCN JSON documents (schema version 2.0)
//!
//! These mirror the documents the HCN API exchanges. Conversion into the
//! crate's info types happens here so the managers never see raw JSON.

use std::net::IpAddr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use super::{
    EndpointDraft, EndpointInfo, LoadBalancerDraft, LoadBalancerInfo, NetworkInfo, PortMapping,
    ENDPOINT_FLAG_REMOTE, LOAD_BALANCER_FLAG_DSR,
};
use crate::policy::{self, PolicyInfo, PROVIDER_ADDRESS};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self { major: 2, minor: 0 }
    }
}

/// Query document accepted by the HCN enumerate calls
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostComputeQuery {
    pub schema_version: SchemaVersion,
    pub flags: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub filter: String,
}

impl HostComputeQuery {
    pub fn all() -> Self {
        Self {
            schema_version: SchemaVersion::default(),
            flags: 0,
            filter: String::new(),
        }
    }

    /// Query matching a single resource by name
    pub fn by_name(name: &str) -> Self {
        Self {
            filter: serde_json::json!({ "Name": name }).to_string(),
            ..Self::all()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostComputeNetwork {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "Type", default)]
    pub network_type: String,
    #[serde(default)]
    pub policies: Vec<PolicyInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpConfig {
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_length: Option<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostComputeEndpoint {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_compute_network: String,
    #[serde(default)]
    pub ip_configurations: Vec<IpConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub policies: Vec<PolicyInfo>,
    #[serde(default)]
    pub schema_version: SchemaVersion,
}

/// Request body for `HcnModifyEndpoint`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifyEndpointSettingRequest {
    pub resource_type: String,
    pub request_type: String,
    pub settings: serde_json::Value,
}

impl ModifyEndpointSettingRequest {
    /// Apply one policy to a live endpoint. An endpoint has a single
    /// provider address, so that policy is updated in place.
    pub fn apply_policy(policy: &PolicyInfo) -> Self {
        let request_type = if policy.is_type(PROVIDER_ADDRESS) { "Update" } else { "Add" };
        Self {
            resource_type: "Policy".to_string(),
            request_type: request_type.to_string(),
            settings: serde_json::json!({ "Policies": [policy] }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoadBalancerPortMapping {
    pub protocol: u32,
    pub internal_port: u16,
    pub external_port: u16,
    #[serde(default)]
    pub flags: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostComputeLoadBalancer {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub host_compute_endpoints: Vec<String>,
    #[serde(rename = "SourceVIP", default, skip_serializing_if = "String::is_empty")]
    pub source_vip: String,
    #[serde(rename = "FrontendVIPs", default)]
    pub frontend_vips: Vec<String>,
    #[serde(default)]
    pub port_mappings: Vec<LoadBalancerPortMapping>,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub schema_version: SchemaVersion,
}

pub(super) fn parse_id(resource: &'static str, id: &str) -> Result<Uuid> {
    Uuid::parse_str(id.trim_matches(|c| c == '{' || c == '}'))
        .map_err(|e| Error::rejected(resource, format!("invalid id {}: {}", id, e)))
}

fn parse_ip(what: &str, value: &str) -> Result<IpAddr> {
    value
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {} {}: {}", what, value, e)))
}

impl TryFrom<HostComputeNetwork> for NetworkInfo {
    type Error = Error;

    fn try_from(network: HostComputeNetwork) -> Result<Self> {
        Ok(NetworkInfo {
            id: parse_id("network", &network.id)?,
            remote_subnets: policy::remote_subnet_routes(&network.policies)?,
            name: network.name,
            network_type: network.network_type,
        })
    }
}

impl TryFrom<HostComputeEndpoint> for EndpointInfo {
    type Error = Error;

    fn try_from(endpoint: HostComputeEndpoint) -> Result<Self> {
        let ip = endpoint
            .ip_configurations
            .first()
            .ok_or_else(|| Error::rejected("endpoint", format!("{} has no IP configuration", endpoint.id)))
            .and_then(|config| parse_ip("endpoint address", &config.ip_address))?;

        let provider_address = endpoint
            .policies
            .iter()
            .find(|p| p.is_type(PROVIDER_ADDRESS))
            .and_then(|p| p.settings.get("ProviderAddress"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());

        Ok(EndpointInfo {
            id: parse_id("endpoint", &endpoint.id)?,
            ip,
            mac_address: endpoint.mac_address.filter(|m| !m.is_empty()),
            is_local: endpoint.flags & ENDPOINT_FLAG_REMOTE == 0,
            network_id: parse_id("network", &endpoint.host_compute_network)?,
            provider_address,
            policies: endpoint.policies,
        })
    }
}

impl TryFrom<HostComputeLoadBalancer> for LoadBalancerInfo {
    type Error = Error;

    fn try_from(lb: HostComputeLoadBalancer) -> Result<Self> {
        let endpoint_ids = lb
            .host_compute_endpoints
            .iter()
            .map(|id| parse_id("endpoint", id))
            .collect::<Result<Vec<_>>>()?;
        let frontend_vips = lb
            .frontend_vips
            .iter()
            .map(|vip| parse_ip("frontend VIP", vip))
            .collect::<Result<Vec<_>>>()?;
        let source_vip = if lb.source_vip.is_empty() {
            None
        } else {
            Some(parse_ip("source VIP", &lb.source_vip)?)
        };

        Ok(LoadBalancerInfo {
            id: parse_id("load balancer", &lb.id)?,
            endpoint_ids,
            source_vip,
            frontend_vips,
            port_mappings: lb
                .port_mappings
                .iter()
                .map(|m| PortMapping {
                    protocol: m.protocol,
                    internal_port: m.internal_port,
                    external_port: m.external_port,
                    flags: m.flags,
                })
                .collect(),
            flags: lb.flags,
        })
    }
}

impl HostComputeEndpoint {
    /// Build the create document for a draft on the given network
    pub fn from_draft(draft: &EndpointDraft, network: &NetworkInfo) -> Self {
        Self {
            id: String::new(),
            host_compute_network: network.id.to_string(),
            ip_configurations: vec![IpConfig {
                ip_address: draft.ip.to_string(),
                prefix_length: None,
            }],
            mac_address: draft.mac_address.clone(),
            flags: if draft.is_local { 0 } else { ENDPOINT_FLAG_REMOTE },
            policies: draft.policies.clone(),
            schema_version: SchemaVersion::default(),
        }
    }
}

impl From<&LoadBalancerDraft> for HostComputeLoadBalancer {
    fn from(draft: &LoadBalancerDraft) -> Self {
        Self {
            id: String::new(),
            host_compute_endpoints: draft.endpoint_ids.iter().map(Uuid::to_string).collect(),
            source_vip: draft.source_vip.map(|ip| ip.to_string()).unwrap_or_default(),
            frontend_vips: draft.frontend_vips.iter().map(IpAddr::to_string).collect(),
            port_mappings: vec![LoadBalancerPortMapping {
                protocol: draft.port_mapping.protocol,
                internal_port: draft.port_mapping.internal_port,
                external_port: draft.port_mapping.external_port,
                flags: draft.port_mapping.flags,
            }],
            flags: if draft.dsr { LOAD_BALANCER_FLAG_DSR } else { 0 },
            schema_version: SchemaVersion::default(),
        }
    }
}
