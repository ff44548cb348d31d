//! Shared daemon state.
//!
//! Provides thread-safe shared state for the daemon.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use warden_core::config::WardenConfig;
use warden_core::lifecycle::LifecycleController;

/// Shared daemon state protected by `Arc<DaemonStateHandle>`.
pub type SharedState = Arc<DaemonStateHandle>;

/// Handle to daemon state with interior mutability.
pub struct DaemonStateHandle {
    /// The inner mutable state.
    inner: RwLock<DaemonState>,
    /// Shutdown flag (atomic for lock-free checking).
    shutdown: AtomicBool,
    /// Time when the daemon started.
    started_at: DateTime<Utc>,
}

impl DaemonStateHandle {
    /// Create a new daemon state handle.
    #[must_use]
    pub fn new(controller: Arc<LifecycleController>, config: WardenConfig) -> Self {
        Self {
            inner: RwLock::new(DaemonState { controller, config }),
            shutdown: AtomicBool::new(false),
            started_at: Utc::now(),
        }
    }

    /// Get read access to the inner state.
    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, DaemonState> {
        self.inner.read().await
    }

    /// Get write access to the inner state.
    pub async fn write(&self) -> tokio::sync::RwLockWriteGuard<'_, DaemonState> {
        self.inner.write().await
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Get the daemon start time.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Get daemon uptime in seconds.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // max(0) ensures non-negative
    pub fn uptime_secs(&self) -> u64 {
        let now = Utc::now();
        (now - self.started_at).num_seconds().max(0) as u64
    }
}

/// Inner daemon state (mutable part).
pub struct DaemonState {
    /// The lifecycle controller driving every domain.
    pub controller: Arc<LifecycleController>,
    /// Current configuration.
    pub config: WardenConfig,
}

impl DaemonState {
    /// Get the controller.
    #[must_use]
    pub fn controller(&self) -> Arc<LifecycleController> {
        Arc::clone(&self.controller)
    }
}
