pub mod config;
pub mod error;
pub mod health_gate;
pub mod metrics;
pub mod middleware;
pub mod pool;
pub mod registrar;
pub mod server;
pub mod store;
pub mod test_utils;
