use std::net::SocketAddr;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

/// Environment-facing configuration, loaded once by the binary.
#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "http://localhost:3001")]
    pub fhir_host: String,

    #[envconfig(default = "localhost:27017")]
    pub database_host: String,

    #[envconfig(default = "ptmerge")]
    pub database_name: String,

    #[envconfig(default = "false")]
    pub debug: bool,

    #[envconfig(default = "0.0.0.0:5000")]
    pub address: SocketAddr,

    #[envconfig(default = "60000")] // 1 minute
    pub store_dial_timeout_ms: EnvMsDuration,

    #[envconfig(default = "false")]
    pub enable_metrics: bool,
}

impl Config {
    pub fn to_service_config(&self) -> ServiceConfig {
        ServiceConfig {
            downstream_api_address: self.fhir_host.clone(),
            store_address: self.database_host.clone(),
            store_name: self.database_name.clone(),
            debug_mode: self.debug,
            listen_address: self.address,
            store_dial_timeout: self.store_dial_timeout_ms.0,
        }
    }
}

/// The immutable set of addresses and names a `ServiceInstance` is built from.
/// Nothing here is validated: bad addresses surface when the health gate runs.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub downstream_api_address: String,
    pub store_address: String,
    pub store_name: String,
    pub debug_mode: bool,
    pub listen_address: SocketAddr,
    pub store_dial_timeout: time::Duration,
}

pub const DEFAULT_LISTEN_PORT: u16 = 5000;
pub const DEFAULT_STORE_DIAL_TIMEOUT: time::Duration = time::Duration::from_secs(60);

impl ServiceConfig {
    pub fn new(
        downstream_api_address: impl Into<String>,
        store_address: impl Into<String>,
        store_name: impl Into<String>,
        debug_mode: bool,
    ) -> Self {
        ServiceConfig {
            downstream_api_address: downstream_api_address.into(),
            store_address: store_address.into(),
            store_name: store_name.into(),
            debug_mode,
            listen_address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
            store_dial_timeout: DEFAULT_STORE_DIAL_TIMEOUT,
        }
    }

    pub fn listen_on(mut self, address: SocketAddr) -> Self {
        self.listen_address = address;
        self
    }

    pub fn store_dial_timeout(mut self, timeout: time::Duration) -> Self {
        self.store_dial_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
