use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Once};
use std::time::Duration;

use ptmerge::config::ServiceConfig;
use ptmerge::error::StartupError;
use ptmerge::registrar::RouteRegistrar;
use ptmerge::server::ServiceInstance;
use ptmerge::test_utils::{MockPool, MockStoreDialer};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

/// Reserve a local port that nothing is listening on.
pub fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub fn accepts_connections(addr: SocketAddr) -> bool {
    TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok()
}

pub fn service_config(fhir_host: &str, listen: SocketAddr) -> ServiceConfig {
    ServiceConfig::new(fhir_host, "localhost:27017", "ptmerge_test", false)
        .listen_on(listen)
        .store_dial_timeout(Duration::from_secs(1))
}

pub struct ServerHandle {
    pub addr: SocketAddr,
    pub shutdown: Arc<Notify>,
    pub task: Option<JoinHandle<Result<(), StartupError>>>,
}

impl ServerHandle {
    /// Run a service against a reachable mock store and wait for it to accept connections.
    pub async fn start<R>(fhir_host: &str, pool: MockPool, registrar: R) -> Self
    where
        R: RouteRegistrar<MockPool> + 'static,
    {
        let addr = free_addr();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        let service = ServiceInstance::new(
            service_config(fhir_host, addr),
            MockStoreDialer::reachable(pool),
        );
        let task = tokio::spawn(async move {
            service
                .run_until(registrar, async move { notify.notified().await })
                .await
        });

        for _ in 0..100 {
            if accepts_connections(addr) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Self {
            addr,
            shutdown,
            task: Some(task),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Stop serving and return what `run_until` returned.
    pub async fn stop(mut self) -> Result<(), StartupError> {
        self.shutdown.notify_one();
        match self.task.take() {
            Some(task) => task.await.unwrap(),
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}
