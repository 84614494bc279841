//! In-memory stand-ins for the document store and the log output, used by
//! unit and integration tests.
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::subscriber::DefaultGuard;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

use crate::error::StoreError;
use crate::store::{SessionPool, StoreDialer};

#[derive(Default)]
struct MockPoolState {
    next_session_id: AtomicUsize,
    sessions_copied: AtomicUsize,
    closes: AtomicUsize,
    fail_copies: AtomicBool,
}

/// A pool that hands out numbered sessions and counts how often it is closed.
/// Clones share their counters.
#[derive(Clone, Default)]
pub struct MockPool {
    state: Arc<MockPoolState>,
}

impl MockPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_copies(&self, fail: bool) {
        self.state.fail_copies.store(fail, Ordering::SeqCst);
    }

    pub fn sessions_copied(&self) -> usize {
        self.state.sessions_copied.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionPool for MockPool {
    type Session = MockSession;

    async fn copy_session(&self) -> Result<MockSession, StoreError> {
        if self.state.fail_copies.load(Ordering::SeqCst) {
            return Err(StoreError::Session("connection dropped".to_string()));
        }
        self.state.sessions_copied.fetch_add(1, Ordering::SeqCst);

        Ok(MockSession {
            id: self.state.next_session_id.fetch_add(1, Ordering::SeqCst),
            closed: false,
        })
    }

    async fn close(&self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockSession {
    id: usize,
    closed: bool,
}

impl MockSession {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_usable(&self) -> bool {
        !self.closed
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Session(format!("session {} is closed", self.id)))
        } else {
            Ok(())
        }
    }
}

/// A dialer that either yields its `MockPool` or reports the store as unreachable.
#[derive(Clone)]
pub struct MockStoreDialer {
    reachable: bool,
    pool: MockPool,
    dial_attempts: Arc<AtomicUsize>,
}

impl MockStoreDialer {
    pub fn reachable(pool: MockPool) -> Self {
        Self {
            reachable: true,
            pool,
            dial_attempts: Default::default(),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            pool: MockPool::new(),
            dial_attempts: Default::default(),
        }
    }

    pub fn dial_attempts(&self) -> usize {
        self.dial_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreDialer for MockStoreDialer {
    type Pool = MockPool;

    async fn dial(&self, address: &str, _timeout: Duration) -> Result<MockPool, StoreError> {
        self.dial_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reachable {
            Ok(self.pool.clone())
        } else {
            Err(StoreError::Unreachable {
                address: address.to_owned(),
                reason: "connection refused".to_string(),
            })
        }
    }
}

/// Formatted log lines kept in memory. Clones share the buffer.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route INFO and above on the current thread into this buffer until the
    /// guard is dropped.
    pub fn install(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(Level::INFO)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().expect("log buffer poisoned");
        String::from_utf8_lossy(&buffer).into_owned()
    }

    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.contains(needle))
            .map(str::to_owned)
            .collect()
    }
}

pub struct CapturedLogsWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for CapturedLogsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| io::Error::other("log buffer poisoned"))?;
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogsWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CapturedLogsWriter {
            buffer: self.buffer.clone(),
        }
    }
}
