//! Engine configuration: remote services, bundle sources, discovery and
//! status reporting.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoveryConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub bundles: BTreeMap<String, BundleSourceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_logs: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusConfig>,
    /// Per-plugin configuration for custom plugins, keyed by plugin name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub plugins: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_decision: Option<String>,
}

impl EngineConfig {
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }

    /// Name of the service a source refers to; a single configured service
    /// is used when the source names none.
    pub fn resolve_service<'a>(&'a self, name: Option<&'a str>) -> Option<(&'a str, &'a ServiceConfig)> {
        match name {
            Some(n) => self.services.get_key_value(n).map(|(k, v)| (k.as_str(), v)),
            None if self.services.len() == 1 => {
                self.services.iter().next().map(|(k, v)| (k.as_str(), v))
            }
            None => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_header_timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl ServiceConfig {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(
            self.response_header_timeout_seconds
                .unwrap_or(Self::DEFAULT_TIMEOUT_SECS),
        )
    }

    /// `Authorization` header value, when bearer credentials are set.
    pub fn authorization(&self) -> Option<String> {
        let bearer = self.credentials.as_ref()?.bearer.as_ref()?;
        let scheme = bearer.scheme.as_deref().unwrap_or("Bearer");
        Some(format!("{scheme} {}", bearer.token))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer: Option<BearerCredentials>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BearerCredentials {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_min_delay")]
    pub min_delay_seconds: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: u64,
}

fn default_min_delay() -> u64 {
    60
}

fn default_max_delay() -> u64 {
    120
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_delay_seconds: default_min_delay(),
            max_delay_seconds: default_max_delay(),
        }
    }
}

impl PollingConfig {
    /// Delay before the next poll. Polls back off from the minimum towards
    /// the maximum after consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let min = self.min_delay_seconds.min(self.max_delay_seconds);
        let backoff = min.saturating_mul(1u64 << failures.min(16));
        Duration::from_secs(backoff.clamp(min, self.max_delay_seconds.max(min)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleSourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Path appended to the service URL; defaults to `bundles/<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default)]
    pub polling: PollingConfig,
}

impl BundleSourceConfig {
    pub fn resource_for(&self, name: &str) -> String {
        self.resource
            .clone()
            .unwrap_or_else(|| format!("bundles/{name}"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub polling: PollingConfig,
}

impl DiscoveryConfig {
    pub fn bundle_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "discovery".to_string())
    }

    pub fn as_source(&self) -> BundleSourceConfig {
        BundleSourceConfig {
            service: self.service.clone(),
            resource: Some(
                self.resource
                    .clone()
                    .unwrap_or_else(|| format!("bundles/{}", self.bundle_name())),
            ),
            polling: self.polling,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Log status reports instead of (or as well as) posting them.
    #[serde(default)]
    pub console: bool,
    #[serde(default = "default_status_interval")]
    pub interval_seconds: u64,
}

fn default_status_interval() -> u64 {
    30
}
