//! Asynchronous audit trail emission
//!
//! Events are recorded after a mutation has already been committed, so the
//! audit trail is advisory: a failed write is logged and counted, never
//! reported to the caller. Every emission holds a slot in a shared
//! [`Backlog`] until it finishes, so shutdown can wait for it to empty, and a
//! [`Semaphore`] caps how many store writes run at once.

use super::channel::ChannelEvent;
use super::storage::ChannelStore;
use crate::config::AuditConfig;
use metrics::{counter, gauge};
use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

/// Count of unfinished emissions, with a wakeup for waiters when it hits zero
///
/// Waiting never changes shared state, so any number of drains (bounded or
/// not) may overlap.
#[derive(Default)]
struct Backlog {
    pending: AtomicUsize,
    idle: Notify,
}

impl Backlog {
    fn enter(self: &Arc<Self>) -> InFlight {
        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        gauge!("audit.in_flight").set(pending as f64);
        InFlight(Arc::clone(self))
    }

    fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // register before checking so a release in between is not missed
            notified.as_mut().enable();
            if self.len() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Slot held by one emission; released when the task finishes or is dropped
struct InFlight(Arc<Backlog>);

impl Drop for InFlight {
    fn drop(&mut self) {
        let remaining = self.0.pending.fetch_sub(1, Ordering::AcqRel) - 1;
        gauge!("audit.in_flight").set(remaining as f64);
        if remaining == 0 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Fire-and-forget writer of [`ChannelEvent`]s
#[derive(Clone)]
pub struct AuditEmitter {
    store: Arc<dyn ChannelStore>,
    backlog: Arc<Backlog>,
    permits: Arc<Semaphore>,
    runtime: Handle,
}

impl AuditEmitter {
    /// Create an emitter that spawns onto `runtime`
    pub fn new(store: Arc<dyn ChannelStore>, config: &AuditConfig, runtime: Handle) -> Self {
        Self {
            store,
            backlog: Arc::new(Backlog::default()),
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            runtime,
        }
    }

    /// Schedule `event` for recording and return immediately
    ///
    /// Safe to call from synchronous code on any thread.
    pub fn emit(&self, event: ChannelEvent) {
        let store = Arc::clone(&self.store);
        let permits = Arc::clone(&self.permits);
        let slot = self.backlog.enter();

        self.runtime.spawn(async move {
            let _slot = slot;
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => return report_failure(&event, &e),
            };

            let record = event.clone();
            let result =
                tokio::task::spawn_blocking(move || store.record_channel_event(&record)).await;

            match result {
                Ok(Ok(())) => {
                    counter!("audit.emitted").increment(1);
                    debug!(
                        channel_id = %event.channel_id,
                        kind = %event.kind,
                        "Recorded channel event"
                    );
                }
                Ok(Err(e)) => report_failure(&event, &e),
                Err(e) => report_failure(&event, &e),
            }
        });
    }

    /// Number of emissions not yet finished
    pub fn in_flight(&self) -> usize {
        self.backlog.len()
    }

    /// Wait until every emission scheduled so far, and any scheduled while
    /// waiting, has finished. New emissions are never blocked.
    pub async fn drain(&self) {
        self.backlog.wait_idle().await;
    }

    /// [`drain`](Self::drain) bounded by `timeout`; returns whether the
    /// backlog was fully drained
    pub async fn drain_timeout(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, self.backlog.wait_idle())
            .await
            .is_ok();

        if !drained {
            warn!(
                in_flight = self.backlog.len(),
                timeout = ?timeout,
                "Audit drain timed out"
            );
        }
        drained
    }
}

fn report_failure(event: &ChannelEvent, error: &dyn Display) {
    counter!("audit.failed").increment(1);
    warn!(
        channel_id = %event.channel_id,
        kind = %event.kind,
        detail = %serde_json::Value::Object(event.detail.clone()),
        timestamp = event.timestamp.as_millis(),
        error = %error,
        "Failed to record channel event"
    );
}
