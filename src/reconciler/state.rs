//! Desired-state input and per-service status

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::error::ErrorKind;
use crate::hns::Protocol;
use crate::load_balancer::LoadBalancerSpec;
use crate::{Error, Result};

/// One port of one service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
    pub port: String,
}

impl ServiceKey {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            port: port.into(),
        }
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub ip: IpAddr,
    /// Host address to encapsulate towards; looked up from the network's
    /// remote subnets when a remote backend leaves it out
    #[serde(default)]
    pub provider_address: Option<IpAddr>,
    #[serde(default)]
    pub mac_address: Option<String>,
    /// Backend runs on another host
    #[serde(default)]
    pub remote: bool,
}

impl Backend {
    pub fn local(ip: IpAddr) -> Self {
        Self {
            ip,
            provider_address: None,
            mac_address: None,
            remote: false,
        }
    }

    pub fn remote(ip: IpAddr, provider_address: Option<IpAddr>) -> Self {
        Self {
            ip,
            provider_address,
            mac_address: None,
            remote: true,
        }
    }
}

/// What should exist for one service port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredService {
    pub key: ServiceKey,
    #[serde(default)]
    pub vip: Option<IpAddr>,
    #[serde(default)]
    pub source_vip: Option<IpAddr>,
    pub protocol: Protocol,
    /// Port clients connect to
    pub port: u16,
    /// Port the backends listen on
    pub target_port: u16,
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub direct_server_return: bool,
}

impl DesiredService {
    pub fn load_balancer_spec(&self) -> LoadBalancerSpec {
        LoadBalancerSpec {
            protocol: self.protocol,
            internal_port: self.target_port,
            external_port: self.port,
            vip: self.vip,
            source_vip: self.source_vip,
            ilb: self.internal,
            dsr: self.direct_server_return,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 || self.target_port == 0 {
            return Err(Error::Config(format!("{}: ports must be non-zero", self.key)));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.backends.iter().find(|b| !seen.insert(b.ip)) {
            return Err(Error::Config(format!(
                "{}: backend {} listed twice",
                self.key, dup.ip
            )));
        }
        Ok(())
    }
}

/// A full desired-state snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    pub services: Vec<DesiredService>,
}

impl DesiredState {
    /// Load a JSON snapshot file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;
        state.validate()?;
        Ok(state)
    }

    pub fn validate(&self) -> Result<()> {
        let mut keys = HashSet::new();
        for service in &self.services {
            if !keys.insert(&service.key) {
                return Err(Error::Config(format!("service {} declared twice", service.key)));
            }
            service.validate()?;
        }
        Ok(())
    }
}

/// An incremental change to desired state
#[derive(Debug, Clone)]
pub enum DesiredUpdate {
    Upsert(DesiredService),
    Remove(ServiceKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceState {
    #[default]
    Absent,
    Pending,
    Synced,
    Degraded,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Absent => write!(f, "Absent"),
            ServiceState::Pending => write!(f, "Pending"),
            ServiceState::Synced => write!(f, "Synced"),
            ServiceState::Degraded => write!(f, "Degraded"),
        }
    }
}

/// Observed reconciliation state of a service key
#[derive(Debug, Clone, Default)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub load_balancer: Option<Uuid>,
    pub endpoints: Vec<Uuid>,
    pub last_error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Consecutive failed passes
    pub failures: u32,
}
