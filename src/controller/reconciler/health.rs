//! # Workload Health Probe
//!
//! Queries the running server through its cluster-internal Service:
//! `/v1/health`, `/v1/providers` and `/v1/version`. Probe failures never fail
//! a reconcile; they only degrade the HealthCheck condition and the provider
//! and version fields of the status.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::constants::{HEALTH_PATH, PROVIDERS_PATH, VERSION_PATH};
use crate::crd::{ProviderHealthStatus, ProviderInfo};
use crate::observability::metrics;

#[derive(Debug, Error)]
pub enum HealthProbeError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("{url} returned an unexpected body: {reason}")]
    Decode { url: String, reason: String },
}

/// What one probe round observed
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    /// `Err` carries the failure message
    pub health: Result<(), String>,
    /// `None` when the providers endpoint failed
    pub providers: Option<Vec<ProviderInfo>>,
    /// `None` when the version endpoint failed
    pub version: Option<String>,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn health(&self, base_url: &str) -> Result<(), HealthProbeError>;
    async fn providers(&self, base_url: &str) -> Result<Vec<ProviderInfo>, HealthProbeError>;
    async fn version(&self, base_url: &str) -> Result<String, HealthProbeError>;
}

/// Run every endpoint and collect the results
pub async fn probe_workload(probe: &dyn HealthProbe, base_url: &str) -> ProbeReport {
    let health = probe.health(base_url).await.map_err(|e| {
        metrics::increment_health_probe_failures("health");
        e.to_string()
    });
    let providers = match probe.providers(base_url).await {
        Ok(providers) => Some(providers),
        Err(e) => {
            debug!(url = base_url, error = %e, "Provider probe failed");
            metrics::increment_health_probe_failures("providers");
            None
        }
    };
    let version = match probe.version(base_url).await {
        Ok(version) => Some(version),
        Err(e) => {
            debug!(url = base_url, error = %e, "Version probe failed");
            metrics::increment_health_probe_failures("version");
            None
        }
    };
    ProbeReport {
        health,
        providers,
        version,
    }
}

#[derive(Debug, Deserialize)]
struct ProvidersResponse {
    #[serde(default)]
    data: Vec<ProviderRecord>,
}

#[derive(Debug, Deserialize)]
struct ProviderRecord {
    #[serde(default)]
    api: String,
    #[serde(alias = "id", alias = "providerId")]
    provider_id: String,
    #[serde(alias = "type", alias = "providerType", default)]
    provider_type: String,
    #[serde(default)]
    config: Option<serde_json::Value>,
    #[serde(default)]
    health: Option<ProviderHealthRecord>,
}

#[derive(Debug, Deserialize)]
struct ProviderHealthRecord {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

impl From<ProviderRecord> for ProviderInfo {
    fn from(record: ProviderRecord) -> Self {
        ProviderInfo {
            api: record.api,
            provider_id: record.provider_id,
            provider_type: record.provider_type,
            config: record.config,
            health: record.health.map(|h| ProviderHealthStatus {
                status: h.status,
                message: h.message,
            }),
        }
    }
}

/// [`HealthProbe`] over HTTP with a per-request timeout
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        base_url: &str,
        path: &str,
    ) -> Result<T, HealthProbeError> {
        let url = format!("{}{path}", base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| HealthProbeError::Request {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(HealthProbeError::Status {
                url,
                status: status.as_u16(),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| HealthProbeError::Decode {
                url,
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn health(&self, base_url: &str) -> Result<(), HealthProbeError> {
        let url = format!("{}{HEALTH_PATH}", base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| HealthProbeError::Request {
                url: url.clone(),
                source,
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(HealthProbeError::Status {
                url,
                status: response.status().as_u16(),
            })
        }
    }

    async fn providers(&self, base_url: &str) -> Result<Vec<ProviderInfo>, HealthProbeError> {
        let response: ProvidersResponse = self.get(base_url, PROVIDERS_PATH).await?;
        Ok(response.data.into_iter().map(ProviderInfo::from).collect())
    }

    async fn version(&self, base_url: &str) -> Result<String, HealthProbeError> {
        let response: VersionResponse = self.get(base_url, VERSION_PATH).await?;
        Ok(response.version)
    }
}
