use envconfig::Envconfig;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use ptmerge::config::Config;
use ptmerge::middleware::MiddlewareConfig;
use ptmerge::registrar::StatusRoutes;
use ptmerge::server::ServiceInstance;
use ptmerge::store::MongoDialer;

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("Invalid configuration:");

    // RUST_LOG wins, otherwise the debug flag picks the verbosity.
    let default_directive = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_filter(filter);
    tracing_subscriber::registry().with(fmt_layer).init();

    let middleware = MiddlewareConfig {
        enable_metrics: config.enable_metrics,
        ..Default::default()
    };
    let service =
        ServiceInstance::with_middleware(config.to_service_config(), middleware, MongoDialer);

    if let Err(e) = service.run(StatusRoutes).await {
        tracing::error!(error = %e, "ptmerge service failed to start");
        std::process::exit(e.exit_code());
    }
    unreachable!("Server exited unexpectedly");
}
