use std::time::Duration;

use anyhow::Result;
use axum::{routing::get, Router};
use httpmock::prelude::*;
use ptmerge::error::StartupErrorKind;
use ptmerge::pool::SessionBorrower;
use ptmerge::registrar::{RouteRegistrar, StatusRoutes};
use ptmerge::server::ServiceInstance;
use ptmerge::test_utils::{CapturedLogs, MockPool, MockStoreDialer};

use crate::helpers::*;

pub mod helpers;

fn metadata_mock(server: &MockServer) -> httpmock::Mock<'_> {
    server.mock(|when, then| {
        when.method(GET).path("/metadata");
        then.status(200)
            .header("content-type", "application/fhir+json")
            .body("{\"resourceType\":\"CapabilityStatement\"}");
    })
}

async fn explode() -> &'static str {
    panic!("merge handler exploded")
}

/// Status routes plus a route whose handler panics.
fn registrar_with_panicking_route(
    router: Router,
    sessions: SessionBorrower<MockPool>,
    database_name: &str,
    downstream_api_address: &str,
) -> Router {
    StatusRoutes
        .register(router, sessions, database_name, downstream_api_address)
        .route("/explode", get(explode))
}

#[tokio::test]
async fn should_serve_with_cors_headers_when_dependencies_are_reachable() -> Result<()> {
    let logs = CapturedLogs::new();
    let _guard = logs.install();
    let fhir = MockServer::start();
    let metadata = metadata_mock(&fhir);
    let pool = MockPool::new();

    let server = ServerHandle::start(&fhir.base_url(), pool.clone(), StatusRoutes).await;
    let client = reqwest::Client::new();

    let response = client
        .get(server.url("/_readiness"))
        .header("Origin", "https://ui.example.com")
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "https://ui.example.com"
    );
    assert_eq!(
        response.headers()["access-control-allow-credentials"],
        "true"
    );
    assert!(response
        .headers()
        .contains_key("access-control-expose-headers"));
    metadata.assert_hits(1);
    assert_eq!(pool.sessions_copied(), 1);
    assert_eq!(logs.lines_containing("Started ptmerge service!").len(), 1);
    let contents = logs.contents();
    let connected = contents.find("Connected to mongodb at localhost:27017");
    let started = contents.find("Started ptmerge service!");
    assert!(connected.is_some() && connected < started);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn should_answer_preflight_requests() -> Result<()> {
    let fhir = MockServer::start();
    let _metadata = metadata_mock(&fhir);

    let server = ServerHandle::start(&fhir.base_url(), MockPool::new(), StatusRoutes).await;
    let client = reqwest::Client::new();

    let response = client
        .request(reqwest::Method::OPTIONS, server.url("/_liveness"))
        .header("Origin", "https://ui.example.com")
        .header("Access-Control-Request-Method", "DELETE")
        .header("Access-Control-Request-Headers", "If-None-Exist")
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["access-control-max-age"], "86400");

    Ok(())
}

#[tokio::test]
async fn should_not_check_api_when_store_is_unreachable() -> Result<()> {
    let logs = CapturedLogs::new();
    let _guard = logs.install();
    let fhir = MockServer::start();
    let metadata = metadata_mock(&fhir);
    let listen = free_addr();

    let service = ServiceInstance::new(
        service_config(&fhir.base_url(), listen),
        MockStoreDialer::unreachable(),
    );
    let err = service.run(StatusRoutes).await.unwrap_err();

    assert_eq!(err.kind, StartupErrorKind::StoreUnreachable);
    assert_eq!(err.target, "localhost:27017");
    assert_eq!(err.exit_code(), 1);
    metadata.assert_hits(0);
    assert!(!accepts_connections(listen));
    assert_eq!(
        logs.lines_containing("Failed to connect to mongodb at localhost:27017")
            .len(),
        1
    );
    assert!(logs.lines_containing("Host FHIR server").is_empty());
    assert!(logs.lines_containing("Started ptmerge service!").is_empty());

    Ok(())
}

#[tokio::test]
async fn should_fail_and_release_pool_when_api_is_unreachable() -> Result<()> {
    let logs = CapturedLogs::new();
    let _guard = logs.install();
    let pool = MockPool::new();
    let listen = free_addr();
    let fhir_host = format!("http://{}", free_addr());

    let service = ServiceInstance::new(
        service_config(&fhir_host, listen),
        MockStoreDialer::reachable(pool.clone()),
    );
    let err = service.run(StatusRoutes).await.unwrap_err();

    assert_eq!(err.kind, StartupErrorKind::ApiUnreachable);
    assert_eq!(err.target, fhir_host);
    assert_eq!(err.exit_code(), 1);
    assert_eq!(pool.close_count(), 1);
    assert_eq!(pool.sessions_copied(), 0);
    assert!(!accepts_connections(listen));
    assert_eq!(
        logs.lines_containing("Connected to mongodb at localhost:27017")
            .len(),
        1
    );
    let unavailable = format!("Host FHIR server unavailable. Could not reach {}", fhir_host);
    assert_eq!(logs.lines_containing(&unavailable).len(), 1);
    assert!(logs.lines_containing("Started ptmerge service!").is_empty());

    Ok(())
}

#[tokio::test]
async fn should_release_pool_once_when_serving_stops() -> Result<()> {
    let fhir = MockServer::start();
    let _metadata = metadata_mock(&fhir);
    let pool = MockPool::new();

    let server = ServerHandle::start(&fhir.base_url(), pool.clone(), StatusRoutes).await;
    assert_eq!(pool.close_count(), 0);

    server.stop().await?;

    assert_eq!(pool.close_count(), 1);
    Ok(())
}

#[tokio::test]
async fn should_borrow_one_session_per_concurrent_request() -> Result<()> {
    setup_tracing();
    let fhir = MockServer::start();
    let _metadata = metadata_mock(&fhir);
    let pool = MockPool::new();

    let server = ServerHandle::start(&fhir.base_url(), pool.clone(), StatusRoutes).await;
    let client = reqwest::Client::new();

    let requests: Vec<_> = (0..10)
        .map(|_| {
            let client = client.clone();
            let url = server.url("/_readiness");
            tokio::spawn(async move { client.get(url).send().await })
        })
        .collect();
    for request in requests {
        assert_eq!(request.await??.status(), 200);
    }

    assert_eq!(pool.sessions_copied(), 10);
    Ok(())
}

#[tokio::test]
async fn should_recover_from_panicking_handler() -> Result<()> {
    let logs = CapturedLogs::new();
    let _guard = logs.install();
    let fhir = MockServer::start();
    let _metadata = metadata_mock(&fhir);

    let server = ServerHandle::start(
        &fhir.base_url(),
        MockPool::new(),
        registrar_with_panicking_route,
    )
    .await;
    let client = reqwest::Client::new();

    let response = client
        .get(server.url("/explode"))
        .header("Origin", "https://ui.example.com")
        .send()
        .await?;
    assert_eq!(response.status(), 500);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "https://ui.example.com"
    );
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["error"], "internal server error");
    let recovered = logs.lines_containing("recovered from panic while handling request");
    assert_eq!(recovered.len(), 1);
    assert!(recovered[0].contains("merge handler exploded"));

    // The process keeps serving after the panic.
    let response = client.get(server.url("/_liveness")).send().await?;
    assert_eq!(response.status(), 200);

    Ok(())
}

#[tokio::test]
async fn should_fail_when_listen_address_is_taken() -> Result<()> {
    setup_tracing();
    let fhir = MockServer::start();
    let _metadata = metadata_mock(&fhir);
    let pool = MockPool::new();
    let taken = std::net::TcpListener::bind("127.0.0.1:0")?;

    let service = ServiceInstance::new(
        service_config(&fhir.base_url(), taken.local_addr()?),
        MockStoreDialer::reachable(pool.clone()),
    );
    let err = tokio::time::timeout(Duration::from_secs(5), service.run(StatusRoutes))
        .await?
        .unwrap_err();

    assert_eq!(err.kind, StartupErrorKind::ListenerFailed);
    assert_eq!(pool.close_count(), 1);
    Ok(())
}
