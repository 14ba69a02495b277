//! HNS Proxy
//!
//! Load-balancer reconciler for the Windows Host Networking Service (HNS).
//! Declarative service state goes in; HNS endpoints and load balancers come
//! out, created once, shared where possible and removed when unreferenced.
//!
//! # Components
//!
//! - **Control plane** - [`hns::HnsClient`], backed by HCN on Windows or
//!   [`hns::MemoryHns`] anywhere else
//! - **Resource cache** - last-known handles by logical identity
//! - **Endpoint manager** - find-or-create endpoints, reference counted
//! - **Load balancer manager** - find-or-create load balancers by their
//!   defining tuple
//! - **Reconciler** - one worker per service key with retry and backoff
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hns_proxy::hns::MemoryHns;
//! use hns_proxy::reconciler::{Backend, DesiredService, DesiredUpdate, ServiceKey};
//! use hns_proxy::{ProxyConfig, Reconciler};
//!
//! # async fn run() -> hns_proxy::Result<()> {
//! let hns = Arc::new(MemoryHns::new());
//! hns.add_network("vxlan0", "Overlay");
//!
//! let reconciler = Reconciler::new(hns, ProxyConfig::new("vxlan0"))?;
//! reconciler.apply(DesiredUpdate::Upsert(DesiredService {
//!     key: ServiceKey::new("default", "web", "http"),
//!     vip: Some("10.0.0.1".parse().unwrap()),
//!     source_vip: None,
//!     protocol: hns_proxy::hns::Protocol::Tcp,
//!     port: 80,
//!     target_port: 8080,
//!     backends: vec![Backend::local("10.244.1.5".parse().unwrap())],
//!     internal: false,
//!     direct_server_return: false,
//! }));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod hns;
pub mod load_balancer;
pub mod policy;
pub mod reconciler;

pub use config::{BackoffConfig, ProxyConfig};
pub use error::{Error, ErrorKind, Result};
pub use reconciler::{Reconciler, ServiceKey, ServiceState, ServiceStatus};
