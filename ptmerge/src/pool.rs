use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::store::SessionPool;

/// The handle request handlers hold on to: they can borrow sessions, nothing more.
pub type SessionBorrower<P> = Arc<ConnectionPoolManager<P>>;

/// Owns the one long-lived store pool of the process.
///
/// The pool itself is only ever read from: each request calls `borrow` to get
/// its own session, so a slow or broken request cannot poison the connection
/// state seen by the others. No lock is held, the only mutable state is the
/// released flag.
pub struct ConnectionPoolManager<P: SessionPool> {
    pool: P,
    released: AtomicBool,
}

impl<P: SessionPool> ConnectionPoolManager<P> {
    pub fn new(pool: P) -> Self {
        Self {
            pool,
            released: AtomicBool::new(false),
        }
    }

    /// Copy a fresh session out of the pool for one request.
    /// A failure here is the caller's per-request failure.
    pub async fn borrow(&self) -> Result<P::Session, StoreError> {
        if self.is_released() {
            metrics::counter!("ptmerge_store_session_borrow_failures_total").increment(1);
            return Err(StoreError::PoolClosed);
        }

        match self.pool.copy_session().await {
            Ok(session) => {
                metrics::counter!("ptmerge_store_sessions_borrowed_total").increment(1);
                Ok(session)
            }
            Err(e) => {
                metrics::counter!("ptmerge_store_session_borrow_failures_total").increment(1);
                warn!(error = %e, "failed to borrow a store session");
                Err(e)
            }
        }
    }

    /// Close the underlying pool. Only the first call does anything.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing mongodb connection pool");
        self.pool.close().await;
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Acquire, run, always release.
    ///
    /// `body` gets a shared handle to the manager. Whether it returns normally,
    /// returns an error or panics, the pool is released before control leaves
    /// this function. Panics are resumed after the release.
    pub async fn scoped<F, Fut, T>(pool: P, body: F) -> T
    where
        F: FnOnce(SessionBorrower<P>) -> Fut,
        Fut: Future<Output = T>,
    {
        let manager = Arc::new(Self::new(pool));

        let outcome = AssertUnwindSafe(body(manager.clone()))
            .catch_unwind()
            .await;

        manager.release().await;

        match outcome {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
