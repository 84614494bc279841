use std::time::Duration;

use async_trait::async_trait;
use mongodb::{bson::doc, options::ClientOptions, Client, ClientSession, Database};
use tokio::time::timeout;

use crate::error::StoreError;

const MONGODB_SCHEMES: [&str; 2] = ["mongodb://", "mongodb+srv://"];
const APP_NAME: &str = "ptmerge";

/// Opens the single long-lived connection to the document store.
#[async_trait]
pub trait StoreDialer: Send + Sync {
    type Pool: SessionPool;

    async fn dial(&self, address: &str, timeout: Duration) -> Result<Self::Pool, StoreError>;
}

/// The long-lived pool handle. It is never used for request work directly:
/// every request copies a session out of it.
#[async_trait]
pub trait SessionPool: Send + Sync + 'static {
    type Session: Send + 'static;

    /// Derive a new, independent session. Must not mutate the pool.
    async fn copy_session(&self) -> Result<Self::Session, StoreError>;

    async fn close(&self);
}

/// Accepts both full connection strings and bare `host[:port]` lists.
pub fn normalize_store_address(address: &str) -> String {
    let address = address.trim();
    if MONGODB_SCHEMES
        .iter()
        .any(|scheme| address.starts_with(scheme))
    {
        address.to_owned()
    } else {
        format!("mongodb://{}", address)
    }
}

pub struct MongoDialer;

#[async_trait]
impl StoreDialer for MongoDialer {
    type Pool = MongoPool;

    async fn dial(
        &self,
        address: &str,
        dial_timeout: Duration,
    ) -> Result<MongoPool, StoreError> {
        let uri = normalize_store_address(address);

        let mut options = ClientOptions::parse(&uri)
            .await
            .map_err(|e| StoreError::InvalidAddress {
                address: address.to_owned(),
                reason: e.to_string(),
            })?;
        options.app_name = Some(APP_NAME.to_owned());
        options.connect_timeout = Some(dial_timeout);
        options.server_selection_timeout = Some(dial_timeout);

        let client = Client::with_options(options).map_err(|e| StoreError::InvalidAddress {
            address: address.to_owned(),
            reason: e.to_string(),
        })?;

        // The driver connects lazily, so force a round trip to find out if the store is there.
        let admin = client.database("admin");
        let ping = admin.run_command(doc! { "ping": 1 }, None);
        match timeout(dial_timeout, ping).await {
            Ok(Ok(_)) => Ok(MongoPool { client }),
            Ok(Err(e)) => Err(StoreError::Unreachable {
                address: address.to_owned(),
                reason: e.to_string(),
            }),
            Err(_) => Err(StoreError::Unreachable {
                address: address.to_owned(),
                reason: format!("no response within {:?}", dial_timeout),
            }),
        }
    }
}

pub struct MongoPool {
    client: Client,
}

#[async_trait]
impl SessionPool for MongoPool {
    type Session = MongoSession;

    async fn copy_session(&self) -> Result<MongoSession, StoreError> {
        let session = self
            .client
            .start_session(None)
            .await
            .map_err(|e| StoreError::Session(e.to_string()))?;

        Ok(MongoSession {
            client: self.client.clone(),
            session,
        })
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

/// A request-scoped session. Ending or dropping it leaves every other session untouched.
pub struct MongoSession {
    client: Client,
    session: ClientSession,
}

impl MongoSession {
    pub fn database(&self, name: &str) -> Database {
        self.client.database(name)
    }

    pub fn session_mut(&mut self) -> &mut ClientSession {
        &mut self.session
    }
}
