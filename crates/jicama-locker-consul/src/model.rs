// Consul API data models
// These models match the subset of the Consul HTTP API the locker uses

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use jicama_locker::ServiceRegistration;
use jicama_locker::config::format_duration;
use serde::{Deserialize, Serialize};

// ============================================================================
// Session Models
// ============================================================================

/// PUT /v1/session/create request body
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionCreateRequest {
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,

    #[serde(rename = "LockDelay", skip_serializing_if = "Option::is_none")]
    pub lock_delay: Option<String>,

    /// "release" or "delete"
    #[serde(rename = "Behavior", skip_serializing_if = "Option::is_none")]
    pub behavior: Option<String>,
}

/// PUT /v1/session/create response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreateResponse {
    #[serde(rename = "ID")]
    pub id: String,
}

// ============================================================================
// KV Models
// ============================================================================

/// Consul KV Pair as returned by GET /v1/kv/...
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KVPair {
    #[serde(rename = "Key")]
    pub key: String,

    #[serde(rename = "CreateIndex", default)]
    pub create_index: u64,

    #[serde(rename = "ModifyIndex", default)]
    pub modify_index: u64,

    #[serde(rename = "LockIndex", default)]
    pub lock_index: u64,

    #[serde(rename = "Flags", default)]
    pub flags: u64,

    /// Base64 encoded payload
    #[serde(rename = "Value", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Session currently holding the key, if any
    #[serde(rename = "Session", skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl KVPair {
    /// Decode the base64 value to a string
    pub fn decoded_value(&self) -> Option<String> {
        self.value.as_ref().and_then(|v| {
            BASE64
                .decode(v)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }

    /// Raw bytes of the value
    pub fn raw_value(&self) -> Option<Vec<u8>> {
        self.value.as_ref().and_then(|v| BASE64.decode(v).ok())
    }
}

// ============================================================================
// Agent / Health Models
// ============================================================================

/// PUT /v1/agent/service/register request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentServiceRegistration {
    #[serde(rename = "ID", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Tags", skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,

    #[serde(rename = "Address", skip_serializing_if = "String::is_empty", default)]
    pub address: String,

    #[serde(rename = "Port", skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(rename = "Check", skip_serializing_if = "Option::is_none")]
    pub check: Option<AgentServiceCheck>,
}

/// Health check definition attached to a service registration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentServiceCheck {
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,

    #[serde(
        rename = "DeregisterCriticalServiceAfter",
        skip_serializing_if = "Option::is_none"
    )]
    pub deregister_critical_service_after: Option<String>,
}

impl From<&ServiceRegistration> for AgentServiceRegistration {
    fn from(reg: &ServiceRegistration) -> Self {
        Self {
            id: Some(reg.id.clone()),
            name: reg.name.clone(),
            tags: reg.tags.clone(),
            address: reg.address.clone(),
            port: Some(reg.port),
            check: reg.ttl.map(|ttl| AgentServiceCheck {
                ttl: Some(format_duration(ttl)),
                deregister_critical_service_after: Some(format_duration(ttl * 3)),
            }),
        }
    }
}

/// One entry of GET /v1/health/service/{name}
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    #[serde(rename = "Service")]
    pub service: AgentService,
}

/// Service block within a health service entry
#[derive(Debug, Clone, Deserialize)]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Service")]
    pub service: String,

    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,

    #[serde(rename = "Address", default)]
    pub address: String,

    #[serde(rename = "Port", default)]
    pub port: u16,
}
