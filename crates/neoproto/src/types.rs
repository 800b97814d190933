//! Shared types exchanged between peers, the hub, and the discovery layer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness status of a registered service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Unknown => "unknown",
        }
    }
}

/// A registered service instance as it appears on the discovery wire.
///
/// Timestamps are RFC3339 UTC (`...Z`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub status: ServiceStatus,
    pub expire_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceInfo {
    /// Build a fresh instance record with a lease of `ttl`.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        metadata: BTreeMap<String, String>,
        ttl: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            port,
            metadata,
            status: ServiceStatus::Healthy,
            expire_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30)),
            updated_at: now,
        }
    }

    /// Push the lease and update stamp forward.
    pub fn renew(&mut self, ttl: std::time::Duration) {
        let now = Utc::now();
        self.expire_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30));
        self.updated_at = now;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at <= now
    }
}

/// Payload of a framing A `Register` frame: `{"name": ..., "metadata": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Hub acknowledgement for a registration: `{"id": ...}` or `{"error": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Stable error codes carried under the `x-neo-error-code` metadata key.
pub mod error_code {
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
    pub const SUPERSEDED: &str = "SUPERSEDED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const UNSUPPORTED_COMPRESSION: &str = "UNSUPPORTED_COMPRESSION";
    pub const INVALID_REGISTRATION: &str = "INVALID_REGISTRATION";
    pub const DUPLICATE_CORRELATION: &str = "DUPLICATE_CORRELATION";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn service_info_roundtrip_uses_rfc3339() {
        let info = ServiceInfo::new(
            "i-42",
            "math",
            "127.0.0.1",
            9091,
            BTreeMap::from([("language".to_string(), "rust".to_string())]),
            Duration::from_secs(30),
        );
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("expire_at"));
        let parsed: ServiceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn lease_expiry() {
        let mut info = ServiceInfo::new(
            "i-1",
            "math",
            "localhost",
            9091,
            BTreeMap::new(),
            Duration::from_secs(2),
        );
        let later = Utc::now() + chrono::Duration::seconds(5);
        assert!(info.is_expired(later));
        info.renew(Duration::from_secs(30));
        assert!(!info.is_expired(later));
    }

    #[test]
    fn register_ack_shapes() {
        let ok: RegisterAck = serde_json::from_str(r#"{"id":"i-7"}"#).unwrap();
        assert_eq!(ok.id.as_deref(), Some("i-7"));
        assert!(ok.error.is_none());

        let err: RegisterAck = serde_json::from_str(r#"{"error":"boom"}"#).unwrap();
        assert!(err.id.is_none());
        assert_eq!(err.error.as_deref(), Some("boom"));
    }
}
