//! Graceful shutdown coordination.
//!
//! Counts in-flight dispatches so a stopping node can drain them before it
//! writes its final snapshot.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

pub struct ShutdownCoordinator {
    in_flight: Arc<AtomicUsize>,
    max_drain_time: Duration,
    shutdown_requested: AtomicBool,
}

/// Held for the lifetime of one dispatch.
#[derive(Debug)]
pub struct InFlight {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let count = self.counter.fetch_sub(1, Ordering::Relaxed) - 1;
        trace!(in_flight = count, "Dispatch completed");
    }
}

impl ShutdownCoordinator {
    pub fn new(max_drain_time: Duration) -> Self {
        debug!(
            max_drain_time_secs = max_drain_time.as_secs(),
            "Creating shutdown coordinator"
        );
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_drain_time,
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn track(&self) -> InFlight {
        let count = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(in_flight = count, "Dispatch started");
        InFlight {
            counter: self.in_flight.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Wait for in-flight dispatches to finish.
    ///
    /// Returns `false` if the drain time ran out first.
    pub async fn wait_for_drain(&self) -> bool {
        let start = Instant::now();
        let initial = self.in_flight();

        info!(
            in_flight = initial,
            max_drain_time_secs = self.max_drain_time.as_secs(),
            "Starting dispatch drain"
        );

        let mut last_logged = initial;
        while self.in_flight() > 0 {
            if start.elapsed() > self.max_drain_time {
                warn!(
                    remaining = self.in_flight(),
                    elapsed_secs = start.elapsed().as_secs(),
                    "Drain timeout reached, dispatches still active"
                );
                return false;
            }

            let current = self.in_flight();
            if current != last_logged {
                debug!(
                    remaining = current,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Draining dispatches"
                );
                last_logged = current;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!(
            elapsed_ms = start.elapsed().as_millis(),
            initial, "All dispatches drained"
        );
        true
    }

    pub fn request_shutdown(&self) {
        info!(in_flight = self.in_flight(), "Shutdown requested");
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
