use std::fmt;

use thiserror::Error;

/// What kind of dependency, or local resource, stopped the service from starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupErrorKind {
    StoreUnreachable,
    ApiUnreachable,
    ListenerFailed,
}

impl fmt::Display for StartupErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupErrorKind::StoreUnreachable => write!(f, "store unreachable"),
            StartupErrorKind::ApiUnreachable => write!(f, "downstream api unreachable"),
            StartupErrorKind::ListenerFailed => write!(f, "listener failed"),
        }
    }
}

/// A fatal startup condition. `Run` returns it instead of exiting so that the
/// binary decides how the process terminates.
#[derive(Error, Debug)]
#[error("{kind}: {target}")]
pub struct StartupError {
    pub kind: StartupErrorKind,
    pub target: String,
}

impl StartupError {
    pub fn store_unreachable(target: impl Into<String>) -> Self {
        StartupError {
            kind: StartupErrorKind::StoreUnreachable,
            target: target.into(),
        }
    }

    pub fn api_unreachable(target: impl Into<String>) -> Self {
        StartupError {
            kind: StartupErrorKind::ApiUnreachable,
            target: target.into(),
        }
    }

    pub fn listener_failed(target: impl Into<String>) -> Self {
        StartupError {
            kind: StartupErrorKind::ListenerFailed,
            target: target.into(),
        }
    }

    /// Every startup failure maps to the same non-zero status.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Errors for operations against the document store.
/// These are per-request failures once the service is serving.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid store address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("store at {address} is unreachable: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("could not start a store session: {0}")]
    Session(String),
    #[error("the store connection pool has been released")]
    PoolClosed,
}
