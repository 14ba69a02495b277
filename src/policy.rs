//! HNS policy documents
//!
//! Policy settings are carried as opaque JSON. The only settings this crate
//! decodes are remote subnet routes (network metadata for overlay routing)
//! and the provider-address policy it builds for remote endpoints.

use std::net::IpAddr;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use crate::hns::RemoteSubnetRoute;
use crate::{Error, Result};

/// Endpoint policy type carrying the host address used for encapsulation
pub const PROVIDER_ADDRESS: &str = "ProviderAddress";

/// Network policy type describing a subnet reachable through another host
pub const REMOTE_SUBNET_ROUTE: &str = "RemoteSubnetRoute";

/// A typed policy attached to an endpoint or network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyInfo {
    #[serde(rename = "Type")]
    pub policy_type: String,
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl PolicyInfo {
    pub fn new(policy_type: impl Into<String>, settings: serde_json::Value) -> Self {
        Self {
            policy_type: policy_type.into(),
            settings,
        }
    }

    /// Provider-address policy for a remote endpoint
    pub fn provider_address(address: IpAddr) -> Self {
        Self::new(
            PROVIDER_ADDRESS,
            serde_json::json!({ "ProviderAddress": address.to_string() }),
        )
    }

    pub fn is_type(&self, policy_type: &str) -> bool {
        self.policy_type.eq_ignore_ascii_case(policy_type)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RemoteSubnetRouteSettings {
    destination_prefix: String,
    #[serde(default)]
    isolation_id: u16,
    provider_address: String,
    #[serde(default)]
    distributed_router_mac_address: String,
}

/// Decode every remote subnet route policy in a network's policy list.
/// Other policy types are skipped untouched.
pub fn remote_subnet_routes(policies: &[PolicyInfo]) -> Result<Vec<RemoteSubnetRoute>> {
    policies
        .iter()
        .filter(|p| p.is_type(REMOTE_SUBNET_ROUTE))
        .map(|p| {
            let settings: RemoteSubnetRouteSettings = serde_json::from_value(p.settings.clone())
                .map_err(|e| {
                    Error::Config(format!("Failed to decode remote subnet policy settings: {}", e))
                })?;
            let destination_prefix: IpNetwork = settings.destination_prefix.parse().map_err(|e| {
                Error::Config(format!(
                    "Invalid remote subnet prefix {}: {}",
                    settings.destination_prefix, e
                ))
            })?;
            let provider_address: IpAddr = settings.provider_address.parse().map_err(|e| {
                Error::Config(format!(
                    "Invalid provider address {}: {}",
                    settings.provider_address, e
                ))
            })?;
            Ok(RemoteSubnetRoute {
                destination_prefix,
                isolation_id: settings.isolation_id,
                provider_address,
                dr_mac_address: settings.distributed_router_mac_address,
            })
        })
        .collect()
}

/// Whether `policy` is already present in `policies` with identical settings
pub fn contains_policy(policies: &[PolicyInfo], policy: &PolicyInfo) -> bool {
    policies
        .iter()
        .any(|p| p.is_type(&policy.policy_type) && p.settings == policy.settings)
}
