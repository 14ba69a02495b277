//! Error types for the HNS proxy

use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Failure classes the reconciler uses to pick between retrying and surfacing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Resource missing, most likely racing an external delete
    NotFoundTransient,
    /// Malformed settings or an unresolvable network name
    ConfigInvalid,
    /// Timeout or connection failure talking to HNS
    ControlPlaneUnavailable,
    /// Load balancer requested against endpoints that cannot be resolved
    ReferentialIntegrityViolation,
    /// HNS refused a create or update
    Rejected,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFoundTransient => write!(f, "NotFoundTransient"),
            ErrorKind::ConfigInvalid => write!(f, "ConfigInvalid"),
            ErrorKind::ControlPlaneUnavailable => write!(f, "ControlPlaneUnavailable"),
            ErrorKind::ReferentialIntegrityViolation => write!(f, "ReferentialIntegrityViolation"),
            ErrorKind::Rejected => write!(f, "Rejected"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HNS unavailable: {0}")]
    Unavailable(String),

    #[error("HNS call {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("HNS rejected {operation}: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    #[error("Failed to create endpoint {ip} on network {network}: {source}")]
    EndpointCreate {
        ip: IpAddr,
        network: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Endpoint {0} cannot be resolved for load balancer creation")]
    EndpointResolution(Uuid),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    Windows(#[from] windows::core::Error),

    #[error("Insufficient privileges - run as Administrator")]
    InsufficientPrivileges,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn rejected(operation: &'static str, reason: impl Into<String>) -> Self {
        Error::Rejected {
            operation,
            reason: reason.into(),
        }
    }

    /// Map to the taxonomy the reconciler acts on
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFoundTransient,
            Error::Config(_) | Error::Json(_) | Error::InsufficientPrivileges => {
                ErrorKind::ConfigInvalid
            }
            Error::Unavailable(_) | Error::Timeout { .. } | Error::Io(_) => {
                ErrorKind::ControlPlaneUnavailable
            }
            #[cfg(windows)]
            Error::Windows(_) => ErrorKind::ControlPlaneUnavailable,
            Error::Rejected { .. } => ErrorKind::Rejected,
            Error::EndpointCreate { source, .. } => source.kind(),
            Error::EndpointResolution(_) => ErrorKind::ReferentialIntegrityViolation,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFoundTransient
    }

    /// Whether a later pass with the same desired state can succeed.
    /// Configuration errors wait for the desired state to change.
    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::ConfigInvalid
    }

    /// Create from an HCN HRESULT, keeping not-found and privilege errors distinct
    pub fn from_hresult(hr: i32, context: &'static str, id: &str) -> Self {
        match hr as u32 {
            // HCN_E_NETWORK_NOT_FOUND .. HCN_E_POLICY_NOT_FOUND, ERROR_NOT_FOUND, ERROR_FILE_NOT_FOUND
            0x803B_0001..=0x803B_0008 | 0x8007_0490 | 0x8007_0002 => Error::not_found(context, id),
            // E_ACCESSDENIED
            0x8007_0005 => Error::InsufficientPrivileges,
            // RPC_S_SERVER_UNAVAILABLE, HNS service not running
            0x8007_06BA | 0x8007_0426 => {
                Error::Unavailable(format!("{}: HRESULT 0x{:08X}", context, hr))
            }
            _ => Error::rejected(context, format!("HRESULT 0x{:08X}", hr)),
        }
    }
}
