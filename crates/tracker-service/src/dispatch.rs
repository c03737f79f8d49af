//! The single consumer of the event queue.
//!
//! Takes one record at a time, logs it, and sends it as a `FileAccess` event.
//! The events-lost metric is checked inline with each record, so metric
//! reports and record sends from this loop never race. On shutdown the
//! records already accepted into the queue are still sent.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use tracker_core::record::{TelemetryRecord, EVENTS_LOST_METRIC, FILE_ACCESS_EVENT};
use tracker_core::telemetry::{panic_error, TelemetrySink};

use crate::queue::QueueConsumer;
use crate::source::LossProbe;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub dispatched: u64,
    pub metric_reports: u64,
    pub faults: u64,
    /// Part of `dispatched` that was sent after shutdown was signalled.
    pub drained: u64,
}

/// Spawn the dispatch loop. It runs until `shutdown` flips to `true`, then
/// sends whatever is still queued and returns what it did. Close the
/// producer side before signalling shutdown so the backlog is bounded.
pub fn spawn_dispatch_loop(
    mut consumer: QueueConsumer,
    sink: Arc<dyn TelemetrySink>,
    loss_probe: LossProbe,
    metrics_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<DispatchReport> {
    tokio::spawn(async move {
        info!(
            metrics_interval_secs = metrics_interval.as_secs(),
            "dispatch loop started"
        );
        let mut report = DispatchReport::default();
        let mut last_metric_report = Instant::now();

        while let Some(record) = consumer.take(&mut shutdown).await {
            if last_metric_report.elapsed() >= metrics_interval {
                let lost = loss_probe();
                if guarded(&sink, "metric report", |s| {
                    s.send_metric(EVENTS_LOST_METRIC, lost as f64)
                }) {
                    report.metric_reports += 1;
                } else {
                    report.faults += 1;
                }
                last_metric_report = Instant::now();
            }
            send_record(&sink, &record, &mut report);
        }

        while let Some(record) = consumer.try_take() {
            send_record(&sink, &record, &mut report);
            report.drained += 1;
        }
        info!(
            dispatched = report.dispatched,
            drained = report.drained,
            faults = report.faults,
            "dispatch loop stopped"
        );
        report
    })
}

fn send_record(sink: &Arc<dyn TelemetrySink>, record: &TelemetryRecord, report: &mut DispatchReport) {
    debug!("{}", record);
    let properties = record.to_properties();
    if guarded(sink, "telemetry send", |s| {
        s.send_event(FILE_ACCESS_EVENT, &properties)
    }) {
        report.dispatched += 1;
    } else {
        report.faults += 1;
    }
}

/// Runs one sink call, turning a panic into an exception report so the loop
/// moves on to the next record.
fn guarded<F>(sink: &Arc<dyn TelemetrySink>, what: &str, call: F) -> bool
where
    F: FnOnce(&dyn TelemetrySink),
{
    match catch_unwind(AssertUnwindSafe(|| call(sink.as_ref()))) {
        Ok(()) => true,
        Err(payload) => {
            let err = panic_error(what, payload);
            error!(error = %err, "dispatch step failed");
            let _ = catch_unwind(AssertUnwindSafe(|| sink.send_exception(&err)));
            false
        }
    }
}
