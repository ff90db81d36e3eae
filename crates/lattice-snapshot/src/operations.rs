//! Named background operations with per-name exponential backoff
//!
//! Reconcile passes never wait on the driver. They hand the slow part
//! (create, delete, status check) to [`OperationRegistry::run`] under a name
//! derived from the object identity. At most one operation per name runs at
//! a time, and a name that just failed is refused until its backoff window
//! has passed; a later watch event or resync retries it.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use lattice_common::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Backoff after the first failure of a name
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
/// Ceiling of the per-name backoff
pub const MAX_BACKOFF: Duration = Duration::from_secs(122);

/// Result of asking the registry to run an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// The operation was spawned
    Started,
    /// An operation with this name is in flight; nothing was spawned
    AlreadyRunning,
    /// The last run of this name failed recently; nothing was spawned
    Backoff {
        /// Time left in the backoff window
        retry_after: Duration,
    },
}

#[derive(Debug, Default)]
struct OperationState {
    running: bool,
    last_backoff: Option<Duration>,
    retry_at: Option<Instant>,
}

struct Inner {
    ops: Mutex<HashMap<String, OperationState>>,
    idle: Notify,
    initial_backoff: Duration,
    max_backoff: Duration,
}

/// Registry of in-flight operations; clones share state
#[derive(Clone)]
pub struct OperationRegistry {
    inner: Arc<Inner>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationRegistry {
    /// Registry with the default backoff bounds
    pub fn new() -> Self {
        Self::with_backoff(INITIAL_BACKOFF, MAX_BACKOFF)
    }

    /// Registry with custom backoff bounds
    pub fn with_backoff(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                ops: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                initial_backoff,
                max_backoff,
            }),
        }
    }

    /// Spawn `op` under `name` unless that name is running or backing off
    pub fn run<F>(&self, name: impl Into<String>, op: F) -> ScheduleOutcome
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        {
            let mut ops = self.inner.ops.lock();
            let state = ops.entry(name.clone()).or_default();
            if state.running {
                debug!(operation = %name, "operation is already running, skipping");
                return ScheduleOutcome::AlreadyRunning;
            }
            if let Some(retry_at) = state.retry_at {
                let now = Instant::now();
                if retry_at > now {
                    let retry_after = retry_at - now;
                    debug!(
                        operation = %name,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "operation postponed due to exponential backoff"
                    );
                    return ScheduleOutcome::Backoff { retry_after };
                }
            }
            state.running = true;
        }

        let registry = self.clone();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(op).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(Error::internal_with_context(
                    "operation",
                    format!("operation {} panicked", name),
                )),
            };
            registry.finish(&name, result);
        });
        ScheduleOutcome::Started
    }

    fn finish(&self, name: &str, result: Result<()>) {
        let mut ops = self.inner.ops.lock();
        match result {
            Ok(()) => {
                ops.remove(name);
                debug!(operation = %name, "operation completed");
            }
            Err(e) => {
                let state = ops.entry(name.to_string()).or_default();
                let backoff = match state.last_backoff {
                    None => self.inner.initial_backoff,
                    Some(prev) => prev.saturating_mul(2).min(self.inner.max_backoff),
                };
                state.running = false;
                state.last_backoff = Some(backoff);
                state.retry_at = Some(Instant::now() + backoff);
                error!(
                    operation = %name,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "operation failed"
                );
            }
        }
        let any_running = ops.values().any(|s| s.running);
        drop(ops);
        if !any_running {
            self.inner.idle.notify_waiters();
        }
    }

    /// Whether an operation named `name` is in flight
    pub fn is_running(&self, name: &str) -> bool {
        self.inner
            .ops
            .lock()
            .get(name)
            .is_some_and(|s| s.running)
    }

    /// Number of operations in flight
    pub fn running_count(&self) -> usize {
        self.inner.ops.lock().values().filter(|s| s.running).count()
    }

    /// Resolve once no operation is in flight
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.running_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait for in-flight operations to finish, up to `timeout`
    pub async fn drain(&self, timeout: Duration) {
        if tokio::time::timeout(timeout, self.wait_for_idle())
            .await
            .is_err()
        {
            info!(
                running = self.running_count(),
                "shutdown timeout reached with operations still running"
            );
        }
    }
}
