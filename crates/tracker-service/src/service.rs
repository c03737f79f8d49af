//! Start/stop lifecycle for the whole pipeline.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracker_core::identity::DeviceIdentity;
use tracker_core::scrub::FileProbe;
use tracker_core::telemetry::TelemetrySink;
use tracker_core::TrackerError;

use crate::dispatch::{spawn_dispatch_loop, DispatchReport};
use crate::queue::{EventQueue, QueueProducer, QueueStats};
use crate::snapshot::{spawn_snapshot, SnapshotBaseliner, SnapshotOutcome};
use crate::source::{combined_loss_probe, EventSource, Ingest, IngestStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
        }
    }
}

/// Everything the pipeline needs, built once at process start.
#[derive(Clone)]
pub struct ServiceContext {
    pub identity: Arc<DeviceIdentity>,
    pub sink: Arc<dyn TelemetrySink>,
    pub probe: Arc<dyn FileProbe>,
    pub state_dir: PathBuf,
    pub metrics_interval: Duration,
    pub snapshot_enabled: bool,
    pub snapshot_roots: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    pub dispatch: Option<DispatchReport>,
    pub snapshot: Option<SnapshotOutcome>,
    pub queue: QueueStats,
    pub ingest: IngestStats,
}

struct Running {
    ingest: Arc<Ingest>,
    shutdown_tx: watch::Sender<bool>,
    dispatch: JoinHandle<DispatchReport>,
    snapshot: Option<JoinHandle<Option<SnapshotOutcome>>>,
}

pub struct TrackerService {
    ctx: ServiceContext,
    sources: Vec<Box<dyn EventSource>>,
    state: ServiceState,
    running: Option<Running>,
    /// Kept after stop so late pushes still show up as rejections.
    producer: Option<QueueProducer>,
}

impl TrackerService {
    pub fn new(ctx: ServiceContext, sources: Vec<Box<dyn EventSource>>) -> Self {
        Self {
            ctx,
            sources,
            state: ServiceState::Stopped,
            running: None,
            producer: None,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.producer
            .as_ref()
            .map(QueueProducer::stats)
            .unwrap_or_default()
    }

    /// Starts every source, then the dispatch loop and the snapshot task.
    /// Must be called from inside a tokio runtime. If any source fails to
    /// start, the ones already started are stopped again and the service
    /// stays `Stopped`.
    pub fn start(&mut self) -> Result<()> {
        if self.state != ServiceState::Stopped {
            return Err(TrackerError::NotStopped(self.state.as_str()).into());
        }
        self.state = ServiceState::Starting;
        info!(
            device_id = %self.ctx.identity.device_id(),
            build_version = %self.ctx.identity.build_version(),
            sources = self.sources.len(),
            "service starting"
        );

        let (producer, consumer) = EventQueue::new();
        self.producer = Some(producer.clone());
        let ingest = Arc::new(Ingest::new(
            self.ctx.identity.clone(),
            self.ctx.probe.clone(),
            producer.clone(),
            self.ctx.sink.clone(),
        ));

        for idx in 0..self.sources.len() {
            let name = self.sources[idx].name();
            if let Err(err) = self.sources[idx].start(ingest.callback()) {
                error!(source = name, error = %err, "event source failed to start");
                for started in self.sources[..idx].iter_mut() {
                    started.stop();
                }
                producer.close();
                self.state = ServiceState::Stopped;
                return Err(err).with_context(|| format!("starting event source {name}"));
            }
            info!(source = name, "event source started");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatch = spawn_dispatch_loop(
            consumer,
            self.ctx.sink.clone(),
            combined_loss_probe(&self.sources),
            self.ctx.metrics_interval,
            shutdown_rx.clone(),
        );
        let snapshot = if self.ctx.snapshot_enabled {
            let baseliner = Arc::new(SnapshotBaseliner::new(
                self.ctx.state_dir.clone(),
                self.ctx.snapshot_roots.clone(),
                self.ctx.identity.clone(),
                self.ctx.sink.clone(),
                self.ctx.probe.clone(),
            ));
            Some(spawn_snapshot(baseliner, shutdown_rx))
        } else {
            None
        };

        self.running = Some(Running {
            ingest,
            shutdown_tx,
            dispatch,
            snapshot,
        });
        self.state = ServiceState::Running;
        info!("service running");
        Ok(())
    }

    /// Closes the queue, signals shutdown, stops every source, then waits for
    /// the background tasks. Records accepted before the queue closed are
    /// still sent. Calling this while already stopped is a no-op.
    pub async fn stop(&mut self) -> Result<StopReport> {
        let Some(running) = self.running.take() else {
            self.stop_sources().await;
            self.state = ServiceState::Stopped;
            return Ok(StopReport {
                queue: self.queue_stats(),
                ..StopReport::default()
            });
        };
        self.state = ServiceState::Stopping;
        info!("service stopping");

        if let Some(producer) = &self.producer {
            producer.close();
        }
        let _ = running.shutdown_tx.send(true);
        self.stop_sources().await;

        let dispatch = match running.dispatch.await {
            Ok(report) => Some(report),
            Err(err) => {
                let err = anyhow::anyhow!("dispatch loop ended abnormally: {err}");
                error!(error = %err, "dispatch loop failed");
                self.ctx.sink.send_exception(&err);
                None
            }
        };
        let snapshot = match running.snapshot {
            Some(task) => match task.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(error = %err, "snapshot task did not finish");
                    None
                }
            },
            None => None,
        };

        self.ctx.sink.flush();
        self.state = ServiceState::Stopped;
        let report = StopReport {
            dispatch,
            snapshot,
            queue: self.queue_stats(),
            ingest: running.ingest.stats(),
        };
        info!(
            enqueued = report.queue.enqueued,
            rejected = report.queue.rejected,
            "service stopped"
        );
        Ok(report)
    }

    /// Stopping a source can join its drain thread, so it runs on the
    /// blocking pool.
    async fn stop_sources(&mut self) {
        let mut sources = std::mem::take(&mut self.sources);
        let joined = tokio::task::spawn_blocking(move || {
            for source in sources.iter_mut() {
                source.stop();
            }
            sources
        })
        .await;
        match joined {
            Ok(sources) => self.sources = sources,
            Err(err) => {
                let err = anyhow::anyhow!("stopping event sources failed: {err}");
                error!(error = %err, "event sources lost during stop");
                self.ctx.sink.send_exception(&err);
            }
        }
    }
}
