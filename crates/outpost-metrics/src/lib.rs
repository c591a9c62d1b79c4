//! Metrics plane
//!
//! Components report four lifecycle events (tunnel open/close, connection
//! open/close) plus lost heartbeats. Two interchangeable implementations
//! satisfy the contract: an in-process counter/gauge set with a periodic
//! log reporter, and an upstream batcher that posts events to an analytics
//! endpoint. Startup code picks one and injects it into the control plane
//! and listeners; there is no process-wide global.

pub mod local;
pub mod upstream;

pub use local::{CounterPair, LocalMetrics, MetricsSnapshot};
pub use upstream::KeenMetrics;

use chrono::{DateTime, Utc};
use outpost_router::TunnelInfo;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Lifecycle events every metrics implementation consumes
///
/// Implementations must be cheap and non-blocking: these are called from
/// session teardown and splice completion paths.
pub trait Metrics: Send + Sync {
    fn open_tunnel(&self, tunnel: &TunnelInfo);
    fn close_tunnel(&self, tunnel: &TunnelInfo);
    fn open_connection(&self, tunnel: &TunnelInfo);
    fn close_connection(
        &self,
        tunnel: &TunnelInfo,
        start: DateTime<Utc>,
        bytes_in: u64,
        bytes_out: u64,
    );
    fn lost_heartbeat(&self);
}

/// Which implementation the environment selects
#[derive(Debug, PartialEq, Eq)]
enum Selection {
    Local,
    Upstream { api_key: String, project_token: String },
}

fn select(api_key: Option<String>, project_token: Option<String>) -> Selection {
    match (
        api_key.filter(|k| !k.is_empty()),
        project_token.filter(|t| !t.is_empty()),
    ) {
        (Some(api_key), Some(project_token)) => Selection::Upstream {
            api_key,
            project_token,
        },
        // Missing credentials at boot: the upstream reporter is never selected
        _ => Selection::Local,
    }
}

/// Construct the metrics plane from the environment.
///
/// `KEEN_API_KEY` and `KEEN_PROJECT_TOKEN` together enable the upstream
/// batch reporter; otherwise the local implementation is used. Spawns the
/// implementation's background reporter, so this must run inside a runtime.
pub fn from_env(report_interval: Duration, batch_interval: Duration) -> Arc<dyn Metrics> {
    match select(
        std::env::var("KEEN_API_KEY").ok(),
        std::env::var("KEEN_PROJECT_TOKEN").ok(),
    ) {
        Selection::Upstream {
            api_key,
            project_token,
        } => {
            info!("metrics: reporting upstream every {:?}", batch_interval);
            let metrics = KeenMetrics::new(api_key, project_token, batch_interval);
            metrics.spawn_reporter();
            metrics
        }
        Selection::Local => {
            info!("metrics: local, logging every {:?}", report_interval);
            let metrics = LocalMetrics::new(report_interval);
            metrics.spawn_reporter();
            metrics
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selects_local_without_credentials() {
        assert_eq!(select(None, None), Selection::Local);
        assert_eq!(select(Some("key".to_string()), None), Selection::Local);
        assert_eq!(select(None, Some("token".to_string())), Selection::Local);
    }

    #[test]
    fn test_empty_credentials_do_not_select_upstream() {
        assert_eq!(
            select(Some(String::new()), Some("token".to_string())),
            Selection::Local
        );
    }

    #[test]
    fn test_selects_upstream_with_both_credentials() {
        let selection = select(Some("key".to_string()), Some("token".to_string()));
        assert_eq!(
            selection,
            Selection::Upstream {
                api_key: "key".to_string(),
                project_token: "token".to_string(),
            }
        );
    }
}
