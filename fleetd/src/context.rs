//! The process-wide [`AppContext`] (spec §9, design note "Global mutable
//! state"): built once at startup and threaded into every component
//! constructor instead of relying on package-level globals. Components take
//! narrow capability interfaces (`Storage`, `Clock`) carved out of it rather
//! than the whole context, so unit tests can swap in fakes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::db::Storage;

/// Narrow time capability so tests can control "now" instead of depending on
/// the wall clock (used by traffic aggregation window math and task
/// timeouts).
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real, wall-clock-backed implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Process-wide cancellation: derived once at boot (component J). Every
/// background loop selects on `cancelled()` and exits cleanly; force-stop of
/// an individual task uses a finer-grained per-task flag, not this token.
#[derive(Clone)]
pub struct ShutdownContext {
    token: CancellationToken,
}

impl ShutdownContext {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signals every component holding a child token. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Default for ShutdownContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The top-level application context. Cheaply `Clone`-able (everything
/// inside is an `Arc` or a `Clone`-able handle).
#[derive(Clone)]
pub struct AppContext {
    pub storage: Arc<dyn Storage>,
    pub clock: Arc<dyn Clock>,
    pub shutdown: ShutdownContext,
}

impl AppContext {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            shutdown: ShutdownContext::new(),
        }
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn for_testing(storage: Arc<dyn Storage>) -> Self {
        Self::new(storage, Arc::new(SystemClock))
    }
}
