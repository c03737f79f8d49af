//! Outbound telemetry seam.
//!
//! Every record leaves the process through a [`TelemetrySink`]. Calls are
//! synchronous and must not block on the network; transports buffer
//! internally.

use std::any::Any;
use std::collections::BTreeMap;
use tracing::{error, info};

pub trait TelemetrySink: Send + Sync {
    fn send_event(&self, name: &str, properties: &BTreeMap<String, String>);
    fn send_exception(&self, error: &anyhow::Error);
    fn send_metric(&self, name: &str, value: f64);
    /// Pushes anything buffered towards the collector.
    fn flush(&self) {}
}

/// Sink that only writes to the log. Used when no collector is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn send_event(&self, name: &str, properties: &BTreeMap<String, String>) {
        info!(event = name, properties = ?properties, "telemetry event");
    }

    fn send_exception(&self, err: &anyhow::Error) {
        error!(error = %err, "telemetry exception");
    }

    fn send_metric(&self, name: &str, value: f64) {
        info!(metric = name, value, "telemetry metric");
    }
}

/// Turns a caught panic payload into an error suitable for `send_exception`.
pub fn panic_error(context: &str, payload: Box<dyn Any + Send>) -> anyhow::Error {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    anyhow::anyhow!("{context} panicked: {message}")
}
