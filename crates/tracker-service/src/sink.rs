//! HTTP telemetry sink.
//!
//! `send_*` calls only enqueue an envelope; a background task batches them
//! and posts JSON arrays to the collector. Delivery is best-effort: a failed
//! post is logged and its batch dropped.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracker_core::identity::DeviceIdentity;
use tracker_core::scrub::scrub_message;
use tracker_core::settings::TelemetrySettings;
use tracker_core::telemetry::TelemetrySink;

pub const SCRUBBED_ROLE: &str = "<scrubbed>";
pub const SCRUBBED_IP: &str = "0.0.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Event,
    Exception,
    Metric,
}

/// Context attached to every envelope. Host-identifying fields are blanked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextTags {
    pub user_id: String,
    pub component_version: String,
    pub role_name: String,
    pub role_instance: String,
    pub client_ip: String,
}

impl ContextTags {
    pub fn scrubbed(identity: &DeviceIdentity) -> Self {
        Self {
            user_id: identity.device_id().to_string(),
            component_version: identity.build_version().to_string(),
            role_name: SCRUBBED_ROLE.to_string(),
            role_instance: SCRUBBED_ROLE.to_string(),
            client_ip: SCRUBBED_IP.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub name: String,
    pub time: DateTime<Utc>,
    pub properties: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub tags: ContextTags,
}

pub struct HttpSink {
    tx: mpsc::UnboundedSender<Envelope>,
    tags: ContextTags,
    stop_tx: watch::Sender<bool>,
    dropped: AtomicU64,
}

impl HttpSink {
    /// Starts the flush task. Call [`HttpSink::shutdown`] and await the
    /// returned handle to push out the final batch.
    pub fn spawn(
        endpoint: String,
        settings: &TelemetrySettings,
        identity: &DeviceIdentity,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("file-access-tracker/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("building telemetry client: {e}"))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let poster = Poster {
            client,
            endpoint,
            api_key: settings.api_key.clone(),
        };
        let handle = tokio::spawn(flush_loop(
            poster,
            rx,
            stop_rx,
            settings.batch_size,
            Duration::from_secs(settings.flush_interval_secs),
        ));
        let sink = Arc::new(Self {
            tx,
            tags: ContextTags::scrubbed(identity),
            stop_tx,
            dropped: AtomicU64::new(0),
        });
        Ok((sink, handle))
    }

    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Envelopes refused because the flush task had already exited.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn enqueue(&self, kind: EnvelopeKind, name: &str, properties: BTreeMap<String, String>, value: Option<f64>) {
        let envelope = Envelope {
            kind,
            name: name.to_string(),
            time: Utc::now(),
            properties,
            value,
            tags: self.tags.clone(),
        };
        if self.tx.send(envelope).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl TelemetrySink for HttpSink {
    fn send_event(&self, name: &str, properties: &BTreeMap<String, String>) {
        self.enqueue(EnvelopeKind::Event, name, properties.clone(), None);
    }

    fn send_exception(&self, error: &anyhow::Error) {
        self.enqueue(EnvelopeKind::Exception, "Exception", exception_properties(error), None);
    }

    fn send_metric(&self, name: &str, value: f64) {
        self.enqueue(EnvelopeKind::Metric, name, BTreeMap::new(), Some(value));
    }
}

/// Messages can embed paths, so they are scrubbed like everything else.
pub fn exception_properties(error: &anyhow::Error) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    props.insert("message".into(), scrub_message(&error.to_string()));
    props.insert("detail".into(), scrub_message(&format!("{error:#}")));
    props
}

struct Poster {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl Poster {
    async fn post(&self, batch: &mut Vec<Envelope>) {
        if batch.is_empty() {
            return;
        }
        let mut req = self.client.post(&self.endpoint).json(&*batch);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        match req.send().await {
            Ok(res) if res.status().is_success() => {
                debug!(count = batch.len(), "telemetry batch sent");
            }
            Ok(res) => {
                warn!(status = %res.status(), count = batch.len(), "collector rejected telemetry batch");
            }
            Err(err) => {
                warn!(error = %err, count = batch.len(), "telemetry batch failed");
            }
        }
        batch.clear();
    }
}

async fn flush_loop(
    poster: Poster,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    mut stop_rx: watch::Receiver<bool>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut batch = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    loop {
        tokio::select! {
            biased;
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            envelope = rx.recv() => {
                match envelope {
                    Some(envelope) => {
                        batch.push(envelope);
                        if batch.len() >= batch_size {
                            poster.post(&mut batch).await;
                        }
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                poster.post(&mut batch).await;
            }
        }
    }

    rx.close();
    while let Ok(envelope) = rx.try_recv() {
        batch.push(envelope);
        if batch.len() >= batch_size {
            poster.post(&mut batch).await;
        }
    }
    poster.post(&mut batch).await;
    info!("telemetry sink flushed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_tags_hide_host() {
        let identity = DeviceIdentity::from_parts("sys", "2.0.0");
        let tags = ContextTags::scrubbed(&identity);
        let json = serde_json::to_value(&tags).unwrap();
        assert_eq!(json["roleName"], "<scrubbed>");
        assert_eq!(json["roleInstance"], "<scrubbed>");
        assert_eq!(json["clientIp"], "0.0.0.0");
        assert_eq!(json["componentVersion"], "2.0.0");
        assert_eq!(json["userId"], identity.device_id());
    }

    #[test]
    fn envelopes_serialize_flat_string_properties() {
        let identity = DeviceIdentity::from_parts("sys", "2.0.0");
        let mut props = BTreeMap::new();
        props.insert("fileSize".to_string(), "2048".to_string());
        let env = Envelope {
            kind: EnvelopeKind::Event,
            name: "FileAccess".into(),
            time: Utc::now(),
            properties: props,
            value: None,
            tags: ContextTags::scrubbed(&identity),
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["kind"], "event");
        assert_eq!(json["properties"]["fileSize"], "2048");
        assert!(json.get("value").is_none());
    }

    #[test]
    fn exception_messages_are_scrubbed() {
        let err = anyhow!("open failed").context(r"writing C:\Users\carol\AppData\Local\x");
        let props = exception_properties(&err);
        assert!(!props["message"].contains("carol"));
        assert!(!props["detail"].contains("carol"));
        assert!(props["detail"].contains("open failed"));
    }

    #[tokio::test]
    async fn shutdown_ends_flush_task() {
        let identity = DeviceIdentity::from_parts("sys", "2.0.0");
        let settings = TelemetrySettings {
            endpoint: None,
            api_key: None,
            batch_size: 8,
            flush_interval_secs: 60,
        };
        // Nothing listens here; the empty final batch is never posted.
        let (sink, handle) =
            HttpSink::spawn("http://127.0.0.1:9/ingest".into(), &settings, &identity).unwrap();
        sink.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        sink.send_metric("EventsLost", 1.0);
        assert_eq!(sink.dropped(), 1);
    }
}
