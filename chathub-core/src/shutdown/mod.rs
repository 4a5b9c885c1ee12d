//! Graceful shutdown coordinator
//!
//! Shutdown broadcasts a signal to subscribers, then waits for every
//! registered audit emitter to drain, bounded by the configured timeout.

use crate::core_channel::AuditEmitter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

/// Shutdown signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

/// Shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// Graceful shutdown coordinator
pub struct ShutdownCoordinator {
    state: Arc<RwLock<ShutdownState>>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    emitters: RwLock<Vec<AuditEmitter>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator that waits at most `timeout` for
    /// pending audit events
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            state: Arc::new(RwLock::new(ShutdownState::Running)),
            shutdown_tx,
            emitters: RwLock::new(Vec::new()),
            timeout,
        }
    }

    /// Drain `emitter` as part of shutdown
    pub async fn register(&self, emitter: AuditEmitter) {
        self.emitters.write().await.push(emitter);
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    ///
    /// Returns whether every registered emitter drained within the timeout.
    pub async fn shutdown(&self) -> bool {
        info!("Initiating graceful shutdown");

        {
            let mut state = self.state.write().await;
            if *state != ShutdownState::Running {
                warn!("Shutdown already in progress");
                return false;
            }
            *state = ShutdownState::ShuttingDown;
        }

        // no receivers is not an error here
        let _ = self.shutdown_tx.send(ShutdownSignal::Graceful);

        let emitters = self.emitters.read().await.clone();
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut drained = true;
        for emitter in &emitters {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if !emitter.drain_timeout(remaining).await {
                error!(in_flight = emitter.in_flight(), "Audit events still pending at shutdown");
                drained = false;
            }
        }

        *self.state.write().await = ShutdownState::Shutdown;
        info!(drained, "Shutdown complete");
        drained
    }

    /// Initiate immediate shutdown without waiting for audit events
    pub async fn shutdown_immediately(&self) {
        warn!("Initiating immediate shutdown");

        *self.state.write().await = ShutdownState::Shutdown;
        let _ = self.shutdown_tx.send(ShutdownSignal::Immediate);
    }

    /// Check if shutdown is in progress
    pub async fn is_shutting_down(&self) -> bool {
        *self.state.read().await != ShutdownState::Running
    }

    /// Get current state
    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }

    /// Wait for shutdown signal
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe();
        let _ = rx.recv().await;
    }
}
