//! Host Networking Service control plane
//!
//! [`HnsClient`] is the capability set the managers drive. Implementations:
//! the Windows HCN bindings, an in-memory control plane, and a wrapper that
//! bounds every call with a timeout.

pub mod memory;
pub mod schema;
pub mod timeout;
#[cfg(windows)]
pub mod windows;

use std::net::IpAddr;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::policy::PolicyInfo;
use crate::Result;

pub use memory::MemoryHns;
pub use timeout::TimeoutClient;

/// Endpoint flag marking an endpoint that lives on another host
pub const ENDPOINT_FLAG_REMOTE: u32 = 1;
/// Port mapping flag marking an internal (cluster-only) load balancer
pub const PORT_MAPPING_FLAG_ILB: u32 = 1;
/// Load balancer flag enabling direct server return
pub const LOAD_BALANCER_FLAG_DSR: u32 = 1;

/// A subnet reachable through another host's provider address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSubnetRoute {
    pub destination_prefix: IpNetwork,
    pub isolation_id: u16,
    pub provider_address: IpAddr,
    pub dr_mac_address: String,
}

/// An HNS network and its overlay routes
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInfo {
    pub id: Uuid,
    pub name: String,
    pub network_type: String,
    pub remote_subnets: Vec<RemoteSubnetRoute>,
}

impl NetworkInfo {
    /// Provider address of the most specific remote subnet containing `ip`
    pub fn provider_address_for(&self, ip: IpAddr) -> Option<IpAddr> {
        self.remote_subnets
            .iter()
            .filter(|route| route.destination_prefix.contains(ip))
            .max_by_key(|route| route.destination_prefix.prefix())
            .map(|route| route.provider_address)
    }
}

/// An endpoint as observed in HNS
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointInfo {
    pub id: Uuid,
    pub ip: IpAddr,
    pub mac_address: Option<String>,
    pub is_local: bool,
    pub network_id: Uuid,
    pub provider_address: Option<IpAddr>,
    pub policies: Vec<PolicyInfo>,
}

/// Endpoint settings handed to a create call
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointDraft {
    pub ip: IpAddr,
    pub mac_address: Option<String>,
    pub is_local: bool,
    pub provider_address: Option<IpAddr>,
    pub policies: Vec<PolicyInfo>,
}

/// Transport protocol of a service port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    /// IANA protocol number as HNS stores it
    pub fn number(self) -> u32 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Sctp => 132,
        }
    }

    pub fn from_number(number: u32) -> Option<Self> {
        match number {
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            132 => Some(Protocol::Sctp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Sctp => write!(f, "SCTP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub protocol: u32,
    pub internal_port: u16,
    pub external_port: u16,
    pub flags: u32,
}

impl PortMapping {
    pub fn is_ilb(&self) -> bool {
        self.flags & PORT_MAPPING_FLAG_ILB != 0
    }
}

/// A load balancer as observed in HNS
#[derive(Debug, Clone, PartialEq)]
pub struct LoadBalancerInfo {
    pub id: Uuid,
    pub endpoint_ids: Vec<Uuid>,
    pub source_vip: Option<IpAddr>,
    pub frontend_vips: Vec<IpAddr>,
    pub port_mappings: Vec<PortMapping>,
    pub flags: u32,
}

impl LoadBalancerInfo {
    pub fn is_dsr(&self) -> bool {
        self.flags & LOAD_BALANCER_FLAG_DSR != 0
    }
}

/// Load balancer settings handed to a create call
#[derive(Debug, Clone, PartialEq)]
pub struct LoadBalancerDraft {
    pub endpoint_ids: Vec<Uuid>,
    pub source_vip: Option<IpAddr>,
    pub frontend_vips: Vec<IpAddr>,
    pub port_mapping: PortMapping,
    pub dsr: bool,
}

/// Operations the reconciler needs from the host networking control plane.
///
/// Every call may be slow and may fail. Deletes report a missing resource as
/// [`crate::Error::NotFound`]; the managers decide whether that is success.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HnsClient: Send + Sync {
    async fn get_network_by_name(&self, name: &str) -> Result<NetworkInfo>;

    async fn get_endpoint_by_id(&self, id: Uuid) -> Result<EndpointInfo>;

    async fn list_endpoints(&self) -> Result<Vec<EndpointInfo>>;

    /// Create an endpoint attached to this host
    async fn create_endpoint(
        &self,
        network: &NetworkInfo,
        draft: &EndpointDraft,
    ) -> Result<EndpointInfo>;

    /// Create an endpoint standing in for a backend on another host
    async fn create_remote_endpoint(
        &self,
        network: &NetworkInfo,
        draft: &EndpointDraft,
    ) -> Result<EndpointInfo>;

    /// Add `policy` to a live endpoint; a provider-address policy replaces the current one
    async fn update_endpoint_policy(&self, id: Uuid, policy: &PolicyInfo) -> Result<()>;

    async fn delete_endpoint(&self, id: Uuid) -> Result<()>;

    async fn list_load_balancers(&self) -> Result<Vec<LoadBalancerInfo>>;

    async fn get_load_balancer_by_id(&self, id: Uuid) -> Result<LoadBalancerInfo>;

    async fn create_load_balancer(&self, draft: &LoadBalancerDraft) -> Result<LoadBalancerInfo>;

    async fn delete_load_balancer(&self, id: Uuid) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(prefix: &str, pa: &str) -> RemoteSubnetRoute {
        RemoteSubnetRoute {
            destination_prefix: prefix.parse().unwrap(),
            isolation_id: 4096,
            provider_address: pa.parse().unwrap(),
            dr_mac_address: String::new(),
        }
    }

    #[test]
    fn test_provider_address_longest_prefix() {
        let network = NetworkInfo {
            id: Uuid::new_v4(),
            name: "overlay".into(),
            network_type: "Overlay".into(),
            remote_subnets: vec![
                route("10.244.0.0/16", "192.168.1.10"),
                route("10.244.2.0/24", "192.168.1.12"),
            ],
        };

        assert_eq!(
            network.provider_address_for("10.244.2.7".parse().unwrap()),
            Some("192.168.1.12".parse().unwrap())
        );
        assert_eq!(
            network.provider_address_for("10.244.9.7".parse().unwrap()),
            Some("192.168.1.10".parse().unwrap())
        );
        assert_eq!(network.provider_address_for("10.96.0.1".parse().unwrap()), None);
    }

    #[test]
    fn test_protocol_numbers() {
        assert_eq!(Protocol::Tcp.number(), 6);
        assert_eq!(Protocol::from_number(17), Some(Protocol::Udp));
        assert_eq!(Protocol::from_number(1), None);
        assert_eq!(
            serde_json::from_str::<Protocol>("\"SCTP\"").unwrap(),
            Protocol::Sctp
        );
    }

    #[test]
    fn test_flags() {
        let mapping = PortMapping {
            protocol: 6,
            internal_port: 8080,
            external_port: 80,
            flags: PORT_MAPPING_FLAG_ILB,
        };
        assert!(mapping.is_ilb());
        assert!(!PortMapping { flags: 2, ..mapping }.is_ilb());
    }
}
