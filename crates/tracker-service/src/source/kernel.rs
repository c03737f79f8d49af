//! Kernel file-I/O trace feed.
//!
//! The trace session itself is a platform collaborator behind
//! [`TraceSession`]: it delivers already-decoded [`TraceEvent`]s on a channel
//! and keeps the kernel's own lost-event counter. This feed drains that
//! channel on a dedicated thread, keeps the categories it handles, pulls the
//! path out of each payload and forwards a [`RawFileEvent`].

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};
use tracker_core::record::{OperationKind, RawFileEvent};
use tracker_core::settings::KernelSettings;
use tracker_core::TrackerResult;

use super::{EventCallback, EventSource, LossProbe};

/// Kernel provider keyword mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceKeywords(u32);

impl TraceKeywords {
    pub const DISK_FILE_IO: TraceKeywords = TraceKeywords(0x0000_0200);
    pub const FILE_IO_INIT: TraceKeywords = TraceKeywords(0x0400_0000);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: TraceKeywords) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TraceKeywords {
    type Output = TraceKeywords;

    fn bitor(self, rhs: Self) -> Self::Output {
        TraceKeywords(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceCategory {
    FileCreate,
    Delete,
    Rename,
    Read,
    Write,
    Flush,
    Cleanup,
    Close,
    SetInfo,
    QueryInfo,
    DirEnum,
    OperationEnd,
}

impl TraceCategory {
    /// Operation reported for this category, `None` for categories the feed
    /// does not subscribe a handler to.
    pub fn operation(&self) -> Option<OperationKind> {
        match self {
            TraceCategory::FileCreate => Some(OperationKind::Create),
            TraceCategory::Delete => Some(OperationKind::Delete),
            TraceCategory::Rename => Some(OperationKind::Rename),
            TraceCategory::Read => Some(OperationKind::Read),
            TraceCategory::Write => Some(OperationKind::Write),
            TraceCategory::Flush => Some(OperationKind::Flush),
            TraceCategory::Cleanup
            | TraceCategory::Close
            | TraceCategory::SetInfo
            | TraceCategory::QueryInfo
            | TraceCategory::DirEnum
            | TraceCategory::OperationEnd => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePayload {
    pub file_name: String,
    pub create_options: u32,
    pub share_access: u32,
}

/// Delete, rename and the set/query info family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoPayload {
    pub file_name: String,
    pub info_class: u32,
}

/// Flush, cleanup and close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleOpPayload {
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadWritePayload {
    pub file_name: String,
    pub offset: u64,
    pub io_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEnumPayload {
    pub directory_name: String,
    pub file_pattern: String,
}

/// Completion notice; carries no path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationEndPayload {
    pub irp: u64,
    pub nt_status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TracePayload {
    Create(CreatePayload),
    Info(InfoPayload),
    SimpleOp(SimpleOpPayload),
    ReadWrite(ReadWritePayload),
    DirEnum(DirEnumPayload),
    OperationEnd(OperationEndPayload),
}

/// The path a payload refers to, if it carries a non-empty one.
pub fn extract_path(payload: &TracePayload) -> Option<&str> {
    let path = match payload {
        TracePayload::Create(p) => p.file_name.as_str(),
        TracePayload::Info(p) => p.file_name.as_str(),
        TracePayload::SimpleOp(p) => p.file_name.as_str(),
        TracePayload::ReadWrite(p) => p.file_name.as_str(),
        TracePayload::DirEnum(p) => p.directory_name.as_str(),
        TracePayload::OperationEnd(_) => return None,
    };
    (!path.trim().is_empty()).then_some(path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub category: TraceCategory,
    pub process_name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: TracePayload,
}

/// A running kernel trace session.
pub trait TraceSession: Send + Sync {
    /// Enables the provider for `keywords` and returns the decoded stream.
    /// The stream ends (the sender is dropped) once [`TraceSession::stop`]
    /// has been called.
    fn subscribe(&self, keywords: TraceKeywords) -> TrackerResult<mpsc::Receiver<TraceEvent>>;

    fn stop(&self);

    /// Events the kernel ring buffer discarded because nobody kept up.
    fn lost_count(&self) -> u64;
}

/// Opens sessions for the platform's kernel tracing subsystem. Opening is
/// where privilege failures surface.
pub trait TraceSessionFactory: Send + Sync {
    fn open(&self, settings: &KernelSettings) -> TrackerResult<Arc<dyn TraceSession>>;
}

#[derive(Debug, Default)]
struct FeedCounters {
    delivered: AtomicU64,
    without_path: AtomicU64,
    unhandled: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelFeedStats {
    pub delivered: u64,
    pub without_path: u64,
    pub unhandled: u64,
}

pub struct KernelTraceFeed {
    session: Arc<dyn TraceSession>,
    thread: Option<JoinHandle<()>>,
    counters: Arc<FeedCounters>,
}

impl KernelTraceFeed {
    pub fn new(session: Arc<dyn TraceSession>) -> Self {
        Self {
            session,
            thread: None,
            counters: Arc::new(FeedCounters::default()),
        }
    }

    pub fn stats(&self) -> KernelFeedStats {
        KernelFeedStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            without_path: self.counters.without_path.load(Ordering::Relaxed),
            unhandled: self.counters.unhandled.load(Ordering::Relaxed),
        }
    }
}

fn handle_trace_event(event: TraceEvent, callback: &EventCallback, counters: &FeedCounters) {
    let Some(operation) = event.category.operation() else {
        counters.unhandled.fetch_add(1, Ordering::Relaxed);
        return;
    };
    let Some(path) = extract_path(&event.payload) else {
        counters.without_path.fetch_add(1, Ordering::Relaxed);
        return;
    };
    let raw = RawFileEvent {
        path: path.to_string(),
        operation,
        process_name: event.process_name,
        timestamp: event.timestamp,
    };
    callback(raw);
    counters.delivered.fetch_add(1, Ordering::Relaxed);
}

impl EventSource for KernelTraceFeed {
    fn name(&self) -> &'static str {
        "kernel-trace"
    }

    fn start(&mut self, callback: EventCallback) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let stream = self
            .session
            .subscribe(TraceKeywords::DISK_FILE_IO | TraceKeywords::FILE_IO_INIT)?;
        let counters = self.counters.clone();
        let thread = std::thread::Builder::new()
            .name("kernel-trace".into())
            .spawn(move || {
                for event in stream {
                    handle_trace_event(event, &callback, &counters);
                }
                debug!("kernel trace stream ended");
            })
            .context("spawning kernel trace thread")?;
        self.thread = Some(thread);
        info!("kernel trace feed started");
        Ok(())
    }

    fn stop(&mut self) {
        self.session.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("kernel trace thread panicked");
            }
            let stats = self.stats();
            info!(
                delivered = stats.delivered,
                without_path = stats.without_path,
                lost = self.session.lost_count(),
                "kernel trace feed stopped"
            );
        }
    }

    fn loss_probe(&self) -> LossProbe {
        let session = self.session.clone();
        Arc::new(move || session.lost_count())
    }
}

impl Drop for KernelTraceFeed {
    fn drop(&mut self) {
        self.stop();
    }
}
