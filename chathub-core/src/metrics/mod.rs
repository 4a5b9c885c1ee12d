//! Metric names and descriptions for the channel hierarchy
//!
//! Call sites use the `metrics` macros directly; installing a recorder is up
//! to the embedding application.

use metrics::{describe_counter, describe_gauge, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Initialize metrics with descriptions
pub fn init_metrics() {
    // Hierarchy mutations
    describe_counter!("channel.created", "Public channels created");
    describe_counter!("channel.updated", "Channel updates applied");
    describe_counter!(
        "channel.mutation.rejected",
        "Mutations rejected by validation, labelled by operation"
    );
    describe_counter!("channel.dm.created", "Direct message channels created");
    describe_histogram!(
        "channel.mutation.duration_ms",
        Unit::Milliseconds,
        "Time a mutation held the channel tree write lock, rejected or not"
    );

    // Audit trail
    describe_counter!("audit.emitted", "Channel events recorded");
    describe_counter!("audit.failed", "Channel events dropped after a failed write");
    describe_gauge!("audit.in_flight", "Channel events scheduled but not yet finished");
}

/// Timer for measuring operation duration
///
/// Records when stopped or dropped, so early returns are measured too.
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    /// Start a timer recording into histogram `name`
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration in milliseconds
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        histogram!(self.name).record(self.start.elapsed().as_secs_f64() * 1000.0);
    }
}
