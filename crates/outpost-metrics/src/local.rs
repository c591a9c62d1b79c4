//! Local metrics: atomic counters, live gauges, periodic log snapshot
//!
//! Every dimension keeps a {total, current} pair: the total only ever
//! grows, the current gauge goes up on open and down on close. The
//! background reporter serializes the whole snapshot to JSON and logs it.

use chrono::{DateTime, Utc};
use outpost_proto::Protocol;
use outpost_router::TunnelInfo;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::Metrics;

/// Upper bound on the remembered "all URLs ever" history
const URL_HISTORY_CAP: usize = 1024;

#[derive(Default)]
struct Dimension {
    total: AtomicU64,
    current: AtomicI64,
}

impl Dimension {
    fn open(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    fn close(&self) {
        self.current.fetch_sub(1, Ordering::Relaxed);
    }

    fn pair(&self) -> CounterPair {
        CounterPair {
            total: self.total.load(Ordering::Relaxed),
            current: self.current.load(Ordering::Relaxed),
        }
    }
}

/// A {cumulative, live} reading of one dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterPair {
    pub total: u64,
    pub current: i64,
}

#[derive(Default)]
struct UrlHistory {
    recent: VecDeque<String>,
    live: Vec<String>,
}

/// Full snapshot the reporter logs
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub windows: CounterPair,
    pub linux: CounterPair,
    pub darwin: CounterPair,
    pub other_os: CounterPair,
    pub tcp_tunnels: CounterPair,
    pub http_tunnels: CounterPair,
    pub https_tunnels: CounterPair,
    pub udp_tunnels: CounterPair,
    pub tunnels: CounterPair,
    pub connections: CounterPair,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub lost_heartbeats: u64,
    pub live_urls: Vec<String>,
    pub recent_urls: Vec<String>,
}

/// In-process metrics implementation
pub struct LocalMetrics {
    windows: Dimension,
    linux: Dimension,
    darwin: Dimension,
    other_os: Dimension,

    tcp_tunnels: Dimension,
    http_tunnels: Dimension,
    https_tunnels: Dimension,
    udp_tunnels: Dimension,

    tunnels: Dimension,
    connections: Dimension,

    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    lost_heartbeats: AtomicU64,

    urls: Mutex<UrlHistory>,
    report_interval: Duration,
}

impl LocalMetrics {
    pub fn new(report_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            windows: Dimension::default(),
            linux: Dimension::default(),
            darwin: Dimension::default(),
            other_os: Dimension::default(),
            tcp_tunnels: Dimension::default(),
            http_tunnels: Dimension::default(),
            https_tunnels: Dimension::default(),
            udp_tunnels: Dimension::default(),
            tunnels: Dimension::default(),
            connections: Dimension::default(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            lost_heartbeats: AtomicU64::new(0),
            urls: Mutex::new(UrlHistory::default()),
            report_interval,
        })
    }

    /// Start the background snapshot logger
    pub fn spawn_reporter(self: &Arc<Self>) {
        let metrics = Arc::clone(self);
        info!(
            "metrics reporter logging every {} seconds",
            metrics.report_interval.as_secs()
        );
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(metrics.report_interval).await;
                match serde_json::to_string(&metrics.snapshot()) {
                    Ok(report) => info!(target: "outpost::metrics", %report, "metrics snapshot"),
                    Err(e) => warn!("failed to serialize metrics snapshot: {}", e),
                }
            }
        });
    }

    fn os_dimension(&self, os: &str) -> &Dimension {
        match os {
            "windows" => &self.windows,
            "linux" => &self.linux,
            "darwin" => &self.darwin,
            _ => &self.other_os,
        }
    }

    fn protocol_dimension(&self, protocol: Protocol) -> &Dimension {
        match protocol {
            Protocol::Tcp => &self.tcp_tunnels,
            Protocol::Http => &self.http_tunnels,
            Protocol::Https => &self.https_tunnels,
            Protocol::Udp => &self.udp_tunnels,
        }
    }

    /// Consistent point-in-time reading of every dimension
    pub fn snapshot(&self) -> MetricsSnapshot {
        let urls = self.urls.lock().unwrap();
        MetricsSnapshot {
            windows: self.windows.pair(),
            linux: self.linux.pair(),
            darwin: self.darwin.pair(),
            other_os: self.other_os.pair(),
            tcp_tunnels: self.tcp_tunnels.pair(),
            http_tunnels: self.http_tunnels.pair(),
            https_tunnels: self.https_tunnels.pair(),
            udp_tunnels: self.udp_tunnels.pair(),
            tunnels: self.tunnels.pair(),
            connections: self.connections.pair(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            lost_heartbeats: self.lost_heartbeats.load(Ordering::Relaxed),
            live_urls: urls.live.clone(),
            recent_urls: urls.recent.iter().cloned().collect(),
        }
    }
}

impl Metrics for LocalMetrics {
    fn open_tunnel(&self, tunnel: &TunnelInfo) {
        self.tunnels.open();
        self.os_dimension(&tunnel.os).open();
        self.protocol_dimension(tunnel.protocol).open();

        let mut urls = self.urls.lock().unwrap();
        if urls.recent.len() == URL_HISTORY_CAP {
            let dropped = urls.recent.pop_front();
            debug!("url history full, dropping {:?}", dropped);
        }
        urls.recent.push_back(tunnel.url.clone());
        urls.live.push(tunnel.url.clone());
    }

    fn close_tunnel(&self, tunnel: &TunnelInfo) {
        self.tunnels.close();
        self.os_dimension(&tunnel.os).close();
        self.protocol_dimension(tunnel.protocol).close();

        let mut urls = self.urls.lock().unwrap();
        if let Some(idx) = urls.live.iter().position(|u| u == &tunnel.url) {
            urls.live.swap_remove(idx);
        }
    }

    fn open_connection(&self, _tunnel: &TunnelInfo) {
        self.connections.open();
    }

    fn close_connection(
        &self,
        _tunnel: &TunnelInfo,
        _start: DateTime<Utc>,
        bytes_in: u64,
        bytes_out: u64,
    ) {
        self.connections.close();
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    fn lost_heartbeat(&self) {
        self.lost_heartbeats.fetch_add(1, Ordering::Relaxed);
    }
}
