//! Gateway error taxonomy and propagation policy.
//!
//! Three families with distinct handling:
//!
//! - **Client errors** surface immediately without retry: the request or the
//!   portal configuration is wrong and retrying cannot fix it.
//! - **Upstream errors** are recovered locally by exclusion-and-retry and
//!   only surface as [`GatewayError::Exhausted`] once every attempt and the
//!   fallback have failed.
//! - **Internal errors** (cache, metrics sink) are logged and swallowed
//!   elsewhere; they appear here only when they prevent resolving the
//!   application itself.
//!
//! Sync/chain probe failures never surface to clients at all.

use crate::registry::RegistryError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The request body is not parseable JSON-RPC.
    #[error("malformed JSON-RPC body")]
    MalformedBody,

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("unknown blockchain {0:?}")]
    UnknownBlockchain(String),

    #[error("application {0} not found")]
    UnknownApplication(String),

    #[error("load balancer {0} not found")]
    UnknownLoadBalancer(String),

    /// The load balancer exists but references no resolvable applications.
    #[error("load balancer {0} has no resolvable applications")]
    EmptyLoadBalancer(String),

    #[error("invalid application secret key")]
    SecretKeyMismatch,

    /// No candidate node survived filtering and exclusion.
    #[error("no healthy nodes available")]
    NoHealthyNodes,

    /// Every relay attempt failed and the fallback was unavailable or also
    /// failed. `timed_out` distinguishes 504 from 500 at the HTTP layer.
    #[error("all relay attempts failed: {last_error}")]
    Exhausted { last_error: String, timed_out: bool },

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status this error maps to at the ingress layer.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::MalformedBody | Self::PayloadTooLarge { .. } | Self::UnknownBlockchain(_) => 400,
            Self::UnknownApplication(_) |
            Self::UnknownLoadBalancer(_) |
            Self::EmptyLoadBalancer(_) |
            Self::SecretKeyMismatch => 403,
            Self::Exhausted { timed_out: true, .. } => 504,
            Self::NoHealthyNodes | Self::Exhausted { .. } | Self::Internal(_) => 500,
        }
    }
}

impl From<RegistryError> for GatewayError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownApplication(id) => Self::UnknownApplication(id),
            RegistryError::UnknownLoadBalancer(id) => Self::UnknownLoadBalancer(id),
            RegistryError::EmptyLoadBalancer(id) => Self::EmptyLoadBalancer(id),
            RegistryError::UnknownBlockchain(key) => Self::UnknownBlockchain(key),
            RegistryError::Repository(message) => Self::Internal(message),
        }
    }
}
