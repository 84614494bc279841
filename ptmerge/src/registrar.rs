use std::future::ready;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::info;

use crate::pool::SessionBorrower;
use crate::store::SessionPool;

/// Attaches the domain routes once both dependencies are confirmed reachable.
///
/// Implementors get the session borrower rather than a session: every handler
/// must borrow its own session per request and drop it when the request ends.
pub trait RouteRegistrar<P: SessionPool>: Send {
    fn register(
        self,
        router: Router,
        sessions: SessionBorrower<P>,
        database_name: &str,
        downstream_api_address: &str,
    ) -> Router;
}

impl<P, F> RouteRegistrar<P> for F
where
    P: SessionPool,
    F: FnOnce(Router, SessionBorrower<P>, &str, &str) -> Router + Send,
{
    fn register(
        self,
        router: Router,
        sessions: SessionBorrower<P>,
        database_name: &str,
        downstream_api_address: &str,
    ) -> Router {
        self(router, sessions, database_name, downstream_api_address)
    }
}

/// Index, liveness and readiness routes.
pub struct StatusRoutes;

impl<P: SessionPool> RouteRegistrar<P> for StatusRoutes {
    fn register(
        self,
        router: Router,
        sessions: SessionBorrower<P>,
        database_name: &str,
        downstream_api_address: &str,
    ) -> Router {
        info!(
            database = database_name,
            fhir_host = downstream_api_address,
            "registering status routes"
        );

        let status_router = Router::new()
            .route("/", get(index))
            .route("/_liveness", get(|| ready(StatusCode::OK)))
            .route("/_readiness", get(readiness::<P>))
            .with_state(sessions);

        router.merge(status_router)
    }
}

async fn index() -> &'static str {
    "ptmerge"
}

/// Ready when a session can be borrowed from the pool right now.
async fn readiness<P: SessionPool>(State(sessions): State<SessionBorrower<P>>) -> Response {
    match sessions.borrow().await {
        Ok(_session) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}
