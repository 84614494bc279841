use std::fmt;
use std::time::Duration;

use tracing::{error, info};

use crate::error::StartupError;
use crate::store::StoreDialer;

pub const METADATA_PATH: &str = "/metadata";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckTarget {
    Store,
    DownstreamApi,
}

impl fmt::Display for HealthCheckTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthCheckTarget::Store => write!(f, "store"),
            HealthCheckTarget::DownstreamApi => write!(f, "downstream_api"),
        }
    }
}

/// Outcome of a single reachability check. Consumed right away by `Run`.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub target: HealthCheckTarget,
    pub reachable: bool,
    pub detail: String,
}

impl HealthCheckResult {
    fn record(&self) {
        let outcome = if self.reachable {
            "reachable"
        } else {
            "unreachable"
        };
        let labels = [
            ("target", self.target.to_string()),
            ("outcome", outcome.to_string()),
        ];
        metrics::counter!("ptmerge_dependency_checks_total", &labels).increment(1);
    }
}

/// Build the capability-statement URL probed on the downstream API.
pub fn metadata_url(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), METADATA_PATH)
}

/// Single-attempt reachability checks run once at startup.
///
/// The store dial is bounded by `store_dial_timeout`. The API probe keeps the
/// HTTP client's default, which has no overall timeout.
pub struct DependencyHealthGate {
    http: reqwest::Client,
    store_dial_timeout: Duration,
}

impl DependencyHealthGate {
    pub fn new(store_dial_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            store_dial_timeout,
        }
    }

    /// Dial the store. On success the opened pool is handed back so that it can
    /// become the process' single pool handle.
    pub async fn check_store<D: StoreDialer>(
        &self,
        dialer: &D,
        address: &str,
    ) -> Result<D::Pool, StartupError> {
        info!("Connecting to mongodb...");

        match dialer.dial(address, self.store_dial_timeout).await {
            Ok(pool) => {
                let result = HealthCheckResult {
                    target: HealthCheckTarget::Store,
                    reachable: true,
                    detail: format!("Connected to mongodb at {}", address),
                };
                result.record();
                info!("{}", result.detail);
                Ok(pool)
            }
            Err(e) => {
                let result = HealthCheckResult {
                    target: HealthCheckTarget::Store,
                    reachable: false,
                    detail: e.to_string(),
                };
                result.record();
                error!(error = %result.detail, "Failed to connect to mongodb at {}", address);
                Err(StartupError::store_unreachable(address))
            }
        }
    }

    /// Probe `<base_url>/metadata`. Any response counts, whatever its status code.
    pub async fn check_downstream_api(
        &self,
        base_url: &str,
    ) -> Result<HealthCheckResult, StartupError> {
        info!("Connecting to host FHIR server...");

        let result = match self.http.get(metadata_url(base_url)).send().await {
            Ok(response) => HealthCheckResult {
                target: HealthCheckTarget::DownstreamApi,
                reachable: true,
                detail: format!("metadata responded with {}", response.status()),
            },
            Err(e) => HealthCheckResult {
                target: HealthCheckTarget::DownstreamApi,
                reachable: false,
                detail: e.to_string(),
            },
        };
        result.record();

        if result.reachable {
            info!(detail = %result.detail, "Connected to host FHIR server at {}", base_url);
            Ok(result)
        } else {
            error!(
                error = %result.detail,
                "Host FHIR server unavailable. Could not reach {}", base_url
            );
            Err(StartupError::api_unreachable(base_url))
        }
    }
}
