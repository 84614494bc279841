use std::fmt;
use std::future::{ready, Future};

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::error::StartupError;
use crate::health_gate::DependencyHealthGate;
use crate::metrics::setup_metrics_recorder;
use crate::middleware::{FrameworkMode, MiddlewareConfig, MiddlewarePipeline};
use crate::pool::ConnectionPoolManager;
use crate::registrar::RouteRegistrar;
use crate::store::StoreDialer;

/// Where `run` is in its startup sequence. `Failed` is terminal and is entered
/// from any gate that returns a `StartupError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Uninitialized,
    StoreChecking,
    ApiChecking,
    PoolReady,
    Registering,
    Serving,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Uninitialized => "uninitialized",
            RunPhase::StoreChecking => "store_checking",
            RunPhase::ApiChecking => "api_checking",
            RunPhase::PoolReady => "pool_ready",
            RunPhase::Registering => "registering",
            RunPhase::Serving => "serving",
            RunPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

fn enter(phase: &watch::Sender<RunPhase>, next: RunPhase) {
    let from = phase.send_replace(next);
    debug!(from = %from, to = %next, "startup phase change");
}

/// The ptmerge service: router, configuration and the store dialer, with no
/// live connection until `run` gets past the health gate.
///
/// The pool handle is never stored on the instance. It only exists inside the
/// scope opened by `run`, which is also where it gets released.
pub struct ServiceInstance<D: StoreDialer> {
    router: Router,
    config: ServiceConfig,
    pipeline: MiddlewarePipeline,
    phase: watch::Sender<RunPhase>,
    dialer: D,
}

impl<D: StoreDialer> ServiceInstance<D> {
    pub fn new(config: ServiceConfig, dialer: D) -> Self {
        Self::with_middleware(config, MiddlewareConfig::default(), dialer)
    }

    pub fn with_middleware(
        config: ServiceConfig,
        middleware: MiddlewareConfig,
        dialer: D,
    ) -> Self {
        let mode = FrameworkMode::from_debug_flag(config.debug_mode);
        debug!(?mode, "selected framework logging mode");

        let (phase, _) = watch::channel(RunPhase::Uninitialized);

        ServiceInstance {
            router: Router::new(),
            pipeline: MiddlewarePipeline::new(mode, middleware),
            phase,
            config,
            dialer,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn framework_mode(&self) -> FrameworkMode {
        self.pipeline.mode()
    }

    /// Follow the startup phase. The receiver keeps the last phase after
    /// `run` returns, so a failed start reads as `RunPhase::Failed`.
    pub fn phases(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    /// Gate on both dependencies, register routes and serve forever.
    pub async fn run<R>(self, registrar: R) -> Result<(), StartupError>
    where
        R: RouteRegistrar<D::Pool>,
    {
        self.run_until(registrar, std::future::pending()).await
    }

    /// Like `run`, but stops serving once `shutdown` resolves.
    pub async fn run_until<R, F>(self, registrar: R, shutdown: F) -> Result<(), StartupError>
    where
        R: RouteRegistrar<D::Pool>,
        F: Future<Output = ()> + Send + 'static,
    {
        let ServiceInstance {
            router,
            config,
            pipeline,
            phase,
            dialer,
        } = self;

        info!("Starting ptmerge service...");
        let gate = DependencyHealthGate::new(config.store_dial_timeout);

        enter(&phase, RunPhase::StoreChecking);
        let pool = match gate.check_store(&dialer, &config.store_address).await {
            Ok(pool) => pool,
            Err(e) => {
                enter(&phase, RunPhase::Failed);
                return Err(e);
            }
        };

        // The release scope opens as soon as the pool exists, so a failing API
        // probe below still closes it.
        ConnectionPoolManager::scoped(pool, |sessions| async move {
            enter(&phase, RunPhase::ApiChecking);
            if let Err(e) = gate
                .check_downstream_api(&config.downstream_api_address)
                .await
            {
                enter(&phase, RunPhase::Failed);
                return Err(e);
            }
            enter(&phase, RunPhase::PoolReady);

            enter(&phase, RunPhase::Registering);
            let router = registrar.register(
                router,
                sessions,
                &config.store_name,
                &config.downstream_api_address,
            );

            // Registered before the pipeline goes on, so scrapes get the same
            // logging, recovery and CORS handling as every other route.
            let router = if pipeline.metrics_enabled() {
                match setup_metrics_recorder() {
                    Ok(recorder_handle) => router
                        .route("/metrics", get(move || ready(recorder_handle.render()))),
                    Err(e) => {
                        warn!(error = %e, "failed to install metrics recorder");
                        router
                    }
                }
            } else {
                router
            };
            let app = pipeline.attach(router);

            let listener = match TcpListener::bind(config.listen_address).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(error = %e, "could not bind {}", config.listen_address);
                    enter(&phase, RunPhase::Failed);
                    return Err(StartupError::listener_failed(
                        config.listen_address.to_string(),
                    ));
                }
            };

            enter(&phase, RunPhase::Serving);
            info!("Started ptmerge service!");
            info!("listening on {}", config.listen_address);

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
                .map_err(|e| {
                    error!(error = %e, "ptmerge http server failed");
                    StartupError::listener_failed(config.listen_address.to_string())
                })
        })
        .await
    }
}
