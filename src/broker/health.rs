//! Health check value objects

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of a health check, serialised as a flat record for monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub message: String,
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: BTreeMap::new(),
            latency_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn healthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Healthy, message)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Degraded, message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy, message)
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = latency.as_millis() as u64;
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"status":"{}","message":"unserialisable"}}"#, self.status)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_flat_record_shape() {
        let result = HealthCheckResult::degraded("circuit open")
            .with_detail("circuit_state", "open")
            .with_detail("pending", 3)
            .with_latency(Duration::from_millis(12));

        let json: Value = serde_json::from_str(&result.to_json()).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["message"], "circuit open");
        assert_eq!(json["details"]["pending"], 3);
        assert_eq!(json["latency_ms"], 12);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_status_ordering_and_parsing() {
        assert!(HealthStatus::Healthy < HealthStatus::Degraded);
        assert!(HealthStatus::Degraded < HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::from_str("unhealthy").unwrap(), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::Healthy.to_string(), "healthy");
    }
}
