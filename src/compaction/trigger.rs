//! Bounded re-evaluation queue fed by merge completions, and the handle of the
//! background worker draining it.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use flume::{Receiver, Sender, TrySendError};
use futures_util::future::AbortHandle;

use crate::{
    compaction::metrics::CompactionMetrics,
    logging::{fluid_log, LogContext},
};

/// Work posted to the re-evaluation queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CompactionEvent {
    /// Run the policy again for a column family.
    Reevaluate { column_family: String },
}

/// Cloneable producer side of the queue.
///
/// Also counts outstanding requests: posted ones that were not yet reported as
/// handled, whether still queued or already taken by a consumer.
#[derive(Clone)]
pub(crate) struct CompactionTrigger {
    tx: Sender<CompactionEvent>,
    outstanding: Arc<AtomicUsize>,
    metrics: Arc<CompactionMetrics>,
}

impl CompactionTrigger {
    pub(crate) fn bounded(
        capacity: usize,
        metrics: Arc<CompactionMetrics>,
    ) -> (Self, Receiver<CompactionEvent>) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        let trigger = Self {
            tx,
            outstanding: Arc::new(AtomicUsize::new(0)),
            metrics,
        };
        (trigger, rx)
    }

    /// Requests posted and not yet handled.
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Report one received request as handled.
    pub(crate) fn handled(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Count one extra outstanding request until the guard is dropped.
    pub(crate) fn hold(&self) -> TriggerHold {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        TriggerHold {
            outstanding: Arc::clone(&self.outstanding),
        }
    }

    /// Best-effort request to re-run the policy for `column_family`.
    ///
    /// Never blocks. A full queue already holds a request that re-reads the whole
    /// column family, so dropping is harmless beyond the counter.
    pub(crate) fn reevaluate(&self, column_family: &str) -> bool {
        let event = CompactionEvent::Reevaluate {
            column_family: column_family.to_string(),
        };
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let result = self.tx.try_send(event);
        if result.is_err() {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
        match result {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.metrics.record_queue_drop();
                fluid_log!(
                    log::Level::Debug,
                    ctx: LogContext::column_family(column_family),
                    "trigger_dropped",
                    "reason=full capacity={}",
                    self.tx.capacity().unwrap_or_default()
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.metrics.record_queue_drop();
                fluid_log!(
                    log::Level::Debug,
                    ctx: LogContext::column_family(column_family),
                    "trigger_dropped",
                    "reason=closed"
                );
                false
            }
        }
    }
}

/// Outstanding-request reservation taken with [`CompactionTrigger::hold`].
pub(crate) struct TriggerHold {
    outstanding: Arc<AtomicUsize>,
}

impl Drop for TriggerHold {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to a background worker draining the re-evaluation queue.
///
/// The worker is aborted when the handle is dropped.
#[derive(Debug)]
pub struct CompactionWorker {
    abort: AbortHandle,
}

impl CompactionWorker {
    pub(crate) fn new(abort: AbortHandle) -> Self {
        Self { abort }
    }

    /// Stop the worker now instead of at drop.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// `true` once the worker has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }
}

impl Drop for CompactionWorker {
    fn drop(&mut self) {
        self.abort.abort();
    }
}
