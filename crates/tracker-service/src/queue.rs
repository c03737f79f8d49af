//! Hand-off between event-source threads and the dispatch loop.
//!
//! Unbounded: producers never block. Depth and rejection counters
//! make growth observable instead. Records are only refused once the queue
//! has been closed for shutdown.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracker_core::record::TelemetryRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub rejected: u64,
    pub depth: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    rejected: AtomicU64,
    closed: AtomicBool,
}

impl Counters {
    fn stats(&self) -> QueueStats {
        let enqueued = self.enqueued.load(Ordering::Acquire);
        let dequeued = self.dequeued.load(Ordering::Acquire);
        QueueStats {
            enqueued,
            dequeued,
            rejected: self.rejected.load(Ordering::Relaxed),
            depth: enqueued.saturating_sub(dequeued),
        }
    }
}

pub struct EventQueue;

impl EventQueue {
    pub fn new() -> (QueueProducer, QueueConsumer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        (
            QueueProducer {
                tx,
                counters: counters.clone(),
            },
            QueueConsumer { rx, counters },
        )
    }
}

#[derive(Clone)]
pub struct QueueProducer {
    tx: mpsc::UnboundedSender<TelemetryRecord>,
    counters: Arc<Counters>,
}

impl QueueProducer {
    /// Never blocks. Hands the record back if the queue is closed.
    pub fn push(&self, record: TelemetryRecord) -> Result<(), TelemetryRecord> {
        if self.counters.closed.load(Ordering::Acquire) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(record);
        }
        self.counters.enqueued.fetch_add(1, Ordering::AcqRel);
        self.tx.send(record).map_err(|err| {
            self.counters.enqueued.fetch_sub(1, Ordering::AcqRel);
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            err.0
        })
    }

    /// Refuses every later push. Already queued records stay put.
    pub fn close(&self) {
        self.counters.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.counters.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.stats()
    }
}

pub struct QueueConsumer {
    rx: mpsc::UnboundedReceiver<TelemetryRecord>,
    counters: Arc<Counters>,
}

impl QueueConsumer {
    /// Waits for the next record. Returns `None` as soon as `shutdown` flips
    /// to `true` (or its sender goes away), or when every producer is gone.
    pub async fn take(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<TelemetryRecord> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                record = self.rx.recv() => {
                    let record = record?;
                    self.counters.dequeued.fetch_add(1, Ordering::AcqRel);
                    return Some(record);
                }
            }
        }
    }

    pub fn try_take(&mut self) -> Option<TelemetryRecord> {
        let record = self.rx.try_recv().ok()?;
        self.counters.dequeued.fetch_add(1, Ordering::AcqRel);
        Some(record)
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.stats()
    }
}
