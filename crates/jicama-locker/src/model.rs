//! Service-discovery model types
//!
//! Lock-coordinated members advertise themselves as service instances so
//! peers can discover each other. These types are backend-agnostic; each
//! locker implementation maps them onto its backend's wire format.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A member's own service advertisement.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceRegistration {
    /// Unique instance ID within the service.
    pub id: String,
    /// Service name shared by all members of the fleet.
    pub name: String,
    /// Host or IP the instance is reachable at.
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    /// TTL for the instance health check. When set, the implementation
    /// keeps the check passing until the instance is deregistered.
    #[serde(with = "crate::config::duration", default)]
    pub ttl: Option<Duration>,
}

/// A discovered peer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    /// "host:port" of the instance.
    pub address: String,
    #[serde(default)]
    pub tags: Vec<String>,
}
