//! Upstream batch reporter
//!
//! Close events are buffered per collection and posted as one batch per
//! interval to the Keen events endpoint. Producers never block: the queue
//! is bounded and drops the oldest event on overflow. A failed post is
//! logged and the batch discarded; the tunnel data plane is never coupled
//! to analytics availability.

use chrono::{DateTime, Utc};
use outpost_router::TunnelInfo;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::Metrics;

const QUEUE_CAPACITY: usize = 1000;
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);
const KEEN_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

struct QueuedEvent {
    collection: &'static str,
    event: serde_json::Value,
}

/// Keen per-event envelope carrying the event timestamp
#[derive(Serialize)]
struct KeenEnvelope {
    timestamp: String,
}

impl KeenEnvelope {
    fn at(when: DateTime<Utc>) -> Self {
        Self {
            timestamp: when.format(KEEN_TIMESTAMP_FORMAT).to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CloseConnectionEvent {
    #[serde(rename = "keen")]
    keen: KeenEnvelope,
    #[serde(rename = "OS")]
    os: String,
    client_id: String,
    protocol: String,
    url: String,
    user: String,
    version: String,
    http_auth: bool,
    subdomain: bool,
    tunnel_duration: f64,
    connection_duration: f64,
    bytes_in: u64,
    bytes_out: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CloseTunnelEvent {
    #[serde(rename = "keen")]
    keen: KeenEnvelope,
    #[serde(rename = "OS")]
    os: String,
    client_id: String,
    protocol: String,
    url: String,
    user: String,
    version: String,
    duration: f64,
    http_auth: bool,
    subdomain: bool,
}

/// Batched upstream metrics
pub struct KeenMetrics {
    api_key: String,
    project_token: String,
    batch_interval: Duration,
    queue: Mutex<VecDeque<QueuedEvent>>,
}

impl KeenMetrics {
    pub fn new(api_key: String, project_token: String, batch_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            api_key,
            project_token,
            batch_interval,
            queue: Mutex::new(VecDeque::new()),
        })
    }

    /// Start the background batch poster
    pub fn spawn_reporter(self: &Arc<Self>) {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let client = match reqwest::Client::builder().timeout(UPSTREAM_TIMEOUT).build() {
                Ok(client) => client,
                Err(e) => {
                    error!("failed to build upstream metrics client: {}", e);
                    return;
                }
            };

            loop {
                tokio::time::sleep(metrics.batch_interval).await;

                let batch = metrics.drain();
                if batch.is_empty() {
                    continue;
                }

                for (collection, events) in &batch {
                    debug!("reporting {} metrics for {}", events.len(), collection);
                }

                let url = format!(
                    "https://api.keen.io/3.0/projects/{}/events",
                    metrics.project_token
                );
                match client
                    .post(&url)
                    .header(reqwest::header::AUTHORIZATION, &metrics.api_key)
                    .json(&batch)
                    .send()
                    .await
                {
                    Ok(response) if !response.status().is_success() => {
                        error!(
                            "upstream metrics endpoint returned {}",
                            response.status()
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("failed to post metrics batch: {}", e),
                }
            }
        });
    }

    fn enqueue(&self, collection: &'static str, event: serde_json::Value) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() == QUEUE_CAPACITY {
            queue.pop_front();
            warn!("upstream metrics queue full, dropping oldest event");
        }
        queue.push_back(QueuedEvent { collection, event });
    }

    fn drain(&self) -> HashMap<&'static str, Vec<serde_json::Value>> {
        let drained: Vec<QueuedEvent> = {
            let mut queue = self.queue.lock().unwrap();
            queue.drain(..).collect()
        };

        let mut batch: HashMap<&'static str, Vec<serde_json::Value>> = HashMap::new();
        for queued in drained {
            batch.entry(queued.collection).or_default().push(queued.event);
        }
        batch
    }

    /// Number of events waiting for the next batch
    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl Metrics for KeenMetrics {
    fn open_tunnel(&self, _tunnel: &TunnelInfo) {}

    fn close_tunnel(&self, tunnel: &TunnelInfo) {
        let event = CloseTunnelEvent {
            keen: KeenEnvelope::at(tunnel.started_at),
            os: tunnel.os.clone(),
            client_id: tunnel.client_id.clone(),
            protocol: tunnel.protocol.to_string(),
            url: tunnel.url.clone(),
            user: tunnel.user.clone(),
            version: tunnel.client_version.clone(),
            duration: seconds_since(tunnel.started_at),
            http_auth: !tunnel.http_auth.is_empty(),
            subdomain: tunnel.named_subdomain,
        };
        match serde_json::to_value(event) {
            Ok(value) => self.enqueue("CloseTunnel", value),
            Err(e) => warn!("failed to serialize CloseTunnel event: {}", e),
        }
    }

    fn open_connection(&self, _tunnel: &TunnelInfo) {}

    fn close_connection(
        &self,
        tunnel: &TunnelInfo,
        start: DateTime<Utc>,
        bytes_in: u64,
        bytes_out: u64,
    ) {
        let event = CloseConnectionEvent {
            keen: KeenEnvelope::at(start),
            os: tunnel.os.clone(),
            client_id: tunnel.client_id.clone(),
            protocol: tunnel.protocol.to_string(),
            url: tunnel.url.clone(),
            user: tunnel.user.clone(),
            version: tunnel.client_version.clone(),
            http_auth: !tunnel.http_auth.is_empty(),
            subdomain: tunnel.named_subdomain,
            tunnel_duration: seconds_since(tunnel.started_at),
            connection_duration: seconds_since(start),
            bytes_in,
            bytes_out,
        };
        match serde_json::to_value(event) {
            Ok(value) => self.enqueue("CloseConnection", value),
            Err(e) => warn!("failed to serialize CloseConnection event: {}", e),
        }
    }

    fn lost_heartbeat(&self) {}
}

fn seconds_since(start: DateTime<Utc>) -> f64 {
    (Utc::now() - start).num_milliseconds() as f64 / 1000.0
}
