//! Event sources and the ingest step that normalizes what they deliver.
//!
//! A source pushes [`RawFileEvent`]s into a callback from whatever thread the
//! OS gives it. The callback is an [`Ingest`], which scrubs each event into a
//! [`TelemetryRecord`] and queues it. Downstream code never knows which
//! source variant is running.

pub mod kernel;
pub mod watcher;

use anyhow::Result;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace, warn};
use tracker_core::identity::DeviceIdentity;
use tracker_core::record::{RawFileEvent, TelemetryRecord};
use tracker_core::scrub::FileProbe;
use tracker_core::settings::{SourceKind, TrackerSettings};
use tracker_core::telemetry::{panic_error, TelemetrySink};
use tracker_core::TrackerError;

use crate::queue::QueueProducer;
use kernel::{KernelTraceFeed, TraceSessionFactory};
use watcher::DirectoryWatchFeed;

pub type EventCallback = Arc<dyn Fn(RawFileEvent) + Send + Sync>;

/// Cumulative count of events the source itself had to drop.
pub type LossProbe = Arc<dyn Fn() -> u64 + Send + Sync>;

pub trait EventSource: Send {
    fn name(&self) -> &'static str;

    /// Begins delivering events to `callback` until [`EventSource::stop`].
    fn start(&mut self, callback: EventCallback) -> Result<()>;

    /// Ends delivery. Safe to call repeatedly, and before `start`.
    fn stop(&mut self);

    fn loss_probe(&self) -> LossProbe;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub accepted: u64,
    pub without_path: u64,
    pub rejected: u64,
    pub faults: u64,
}

#[derive(Debug, Default)]
struct IngestCounters {
    accepted: AtomicU64,
    without_path: AtomicU64,
    rejected: AtomicU64,
    faults: AtomicU64,
}

pub struct Ingest {
    identity: Arc<DeviceIdentity>,
    probe: Arc<dyn FileProbe>,
    producer: QueueProducer,
    sink: Arc<dyn TelemetrySink>,
    counters: IngestCounters,
}

impl Ingest {
    pub fn new(
        identity: Arc<DeviceIdentity>,
        probe: Arc<dyn FileProbe>,
        producer: QueueProducer,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            identity,
            probe,
            producer,
            sink,
            counters: IngestCounters::default(),
        }
    }

    /// Scrubs and queues one event. Returns whether a record was queued.
    /// A fault while building the record is reported and swallowed so the
    /// calling source keeps streaming.
    pub fn accept(&self, raw: RawFileEvent) -> bool {
        let built = catch_unwind(AssertUnwindSafe(|| {
            TelemetryRecord::from_raw(raw, &self.identity, self.probe.as_ref())
        }));
        match built {
            Ok(Some(record)) => match self.producer.push(record) {
                Ok(()) => {
                    self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(_) => {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    trace!("queue closed; dropping event");
                    false
                }
            },
            Ok(None) => {
                self.counters.without_path.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(payload) => {
                self.counters.faults.fetch_add(1, Ordering::Relaxed);
                let err = panic_error("event callback", payload);
                error!(error = %err, "failed to normalize file event");
                self.sink.send_exception(&err);
                false
            }
        }
    }

    pub fn callback(self: &Arc<Self>) -> EventCallback {
        let ingest = self.clone();
        Arc::new(move |raw| {
            ingest.accept(raw);
        })
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            without_path: self.counters.without_path.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            faults: self.counters.faults.load(Ordering::Relaxed),
        }
    }
}

/// Picks the event source named by the settings. `kernel` is the platform's
/// kernel trace provider, if this build has one. An explicit `kernel` source
/// without a working session is fatal; `auto` falls back to directory watch.
pub fn build_source(
    settings: &TrackerSettings,
    kernel: Option<&dyn TraceSessionFactory>,
) -> Result<Box<dyn EventSource>> {
    let open_kernel = || -> Result<KernelTraceFeed, TrackerError> {
        let factory = kernel.ok_or(TrackerError::KernelTraceUnavailable)?;
        let session = factory.open(&settings.kernel)?;
        Ok(KernelTraceFeed::new(session))
    };
    match settings.source {
        SourceKind::Kernel => Ok(Box::new(open_kernel()?)),
        SourceKind::Watch => Ok(Box::new(DirectoryWatchFeed::for_mounted_volumes(
            settings.exclusion()?,
        )?)),
        SourceKind::Auto => match open_kernel() {
            Ok(feed) => Ok(Box::new(feed)),
            Err(err) => {
                warn!(error = %err, "kernel trace unavailable, falling back to directory watch");
                Ok(Box::new(DirectoryWatchFeed::for_mounted_volumes(
                    settings.exclusion()?,
                )?))
            }
        },
    }
}

/// Sums the loss counters of several sources.
pub fn combined_loss_probe(sources: &[Box<dyn EventSource>]) -> LossProbe {
    let probes: Vec<LossProbe> = sources.iter().map(|s| s.loss_probe()).collect();
    Arc::new(move || probes.iter().map(|p| p()).sum())
}
