use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, warn, Level};

use crate::metrics::track_metrics;

const IF_NONE_EXIST: HeaderName = HeaderName::from_static("if-none-exist");

/// Framework logging verbosity, picked from the debug flag at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameworkMode {
    Debug,
    Release,
}

impl FrameworkMode {
    pub fn from_debug_flag(debug: bool) -> Self {
        if debug {
            FrameworkMode::Debug
        } else {
            FrameworkMode::Release
        }
    }

    /// Level of the per-request "started" event. The request span and the
    /// response event stay at INFO in both modes.
    fn on_request_level(&self) -> Level {
        match self {
            FrameworkMode::Debug => Level::INFO,
            FrameworkMode::Release => Level::DEBUG,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<String>),
}

/// Cross-origin policy applied to every route.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub origins: AllowedOrigins,
    pub methods: Vec<Method>,
    pub request_headers: Vec<HeaderName>,
    pub exposed_headers: Vec<HeaderName>,
    pub max_age: Duration,
    pub credentials: bool,
    /// Reject preflights asking for headers outside `request_headers`.
    pub validate_headers: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        CorsConfig {
            origins: AllowedOrigins::Any,
            methods: vec![Method::GET, Method::PUT, Method::POST, Method::DELETE],
            request_headers: vec![
                header::ORIGIN,
                header::AUTHORIZATION,
                header::CONTENT_TYPE,
                header::IF_MATCH,
                IF_NONE_EXIST,
            ],
            exposed_headers: vec![header::LOCATION, header::ETAG, header::LAST_MODIFIED],
            max_age: Duration::from_secs(86400), // Preflight expires after 1 day
            credentials: true,
            validate_headers: false,
        }
    }
}

impl CorsConfig {
    pub fn to_layer(&self) -> CorsLayer {
        let origin = match &self.origins {
            // A literal `*` is not allowed together with credentials, echo the caller instead.
            AllowedOrigins::Any if self.credentials => AllowOrigin::mirror_request(),
            AllowedOrigins::Any => AllowOrigin::any(),
            AllowedOrigins::List(origins) => {
                AllowOrigin::list(origins.iter().filter_map(|origin| {
                    match HeaderValue::from_str(origin) {
                        Ok(value) => Some(value),
                        Err(_) => {
                            warn!("ignoring invalid CORS origin {}", origin);
                            None
                        }
                    }
                }))
            }
        };

        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(self.methods.clone())
            .allow_headers(self.request_headers.clone())
            .expose_headers(self.exposed_headers.clone())
            .max_age(self.max_age)
            .allow_credentials(self.credentials)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MiddlewareConfig {
    pub cors: CorsConfig,
    pub enable_metrics: bool,
}

/// The interceptor chain, composed at construction and attached once the
/// routes are registered. From the outside in: access logging, request
/// metrics (optional), panic recovery, header validation (optional),
/// cross-origin policy, panic recovery again.
///
/// The inner recovery turns a handler panic into a 500 before it unwinds
/// through the CORS layer, so the error still carries the CORS headers.
pub struct MiddlewarePipeline {
    mode: FrameworkMode,
    cors: CorsConfig,
    enable_metrics: bool,
}

impl MiddlewarePipeline {
    pub fn new(mode: FrameworkMode, config: MiddlewareConfig) -> Self {
        Self {
            mode,
            cors: config.cors,
            enable_metrics: config.enable_metrics,
        }
    }

    pub fn mode(&self) -> FrameworkMode {
        self.mode
    }

    pub fn metrics_enabled(&self) -> bool {
        self.enable_metrics
    }

    /// Wrap every route currently on `router`. Consumes the pipeline so it can
    /// only be installed once.
    pub fn attach(self, router: Router) -> Router {
        let trace = TraceLayer::new_for_http()
            .make_span_with(
                DefaultMakeSpan::new()
                    .level(Level::INFO)
                    .include_headers(self.mode == FrameworkMode::Debug),
            )
            .on_request(DefaultOnRequest::new().level(self.mode.on_request_level()))
            .on_response(DefaultOnResponse::new().level(Level::INFO));

        let router = router
            .layer(CatchPanicLayer::custom(recover_from_panic))
            .layer(self.cors.to_layer());

        let router = if self.cors.validate_headers {
            let allowed = Arc::new(self.cors.request_headers.clone());
            router.layer(axum::middleware::from_fn_with_state(
                allowed,
                validate_request_headers,
            ))
        } else {
            router
        };

        let router = router.layer(CatchPanicLayer::custom(recover_from_panic));

        let router = if self.enable_metrics {
            router.layer(axum::middleware::from_fn(track_metrics))
        } else {
            router
        };

        router.layer(trace)
    }
}

fn recover_from_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!(panic = %detail, "recovered from panic while handling request");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal server error" })),
    )
        .into_response()
}

async fn validate_request_headers(
    State(allowed): State<Arc<Vec<HeaderName>>>,
    req: Request,
    next: Next,
) -> Response {
    let rejected = if req.method() == Method::OPTIONS {
        req.headers()
            .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
            .and_then(|requested| requested.to_str().ok())
            .map(|requested| {
                requested
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .filter(|name| {
                        !allowed
                            .iter()
                            .any(|allowed| allowed.as_str().eq_ignore_ascii_case(name))
                    })
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    if rejected.is_empty() {
        next.run(req).await
    } else {
        warn!(headers = ?rejected, "rejecting preflight with disallowed headers");
        (
            StatusCode::FORBIDDEN,
            format!("headers not allowed: {}", rejected.join(", ")),
        )
            .into_response()
    }
}
