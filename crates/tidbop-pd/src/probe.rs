//! SQL tier status probe.
//!
//! A TiDB server answers `GET /status` on its status port once it accepts
//! connections.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::http_client;

/// Result of a single status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint returned 2xx.
    Healthy,
    /// The endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(self) -> bool {
        self == ProbeResult::Healthy
    }
}

#[async_trait]
pub trait StatusProbe: Send + Sync {
    /// Probe the status endpoint at `address` (`host:port`).
    async fn probe(&self, address: &str) -> ProbeResult;
}

/// hyper-backed [`StatusProbe`].
#[derive(Debug, Clone)]
pub struct HttpStatusProbe {
    path: String,
    timeout: Duration,
}

impl Default for HttpStatusProbe {
    fn default() -> Self {
        Self {
            path: "/status".to_string(),
            timeout: Duration::from_secs(3),
        }
    }
}

impl HttpStatusProbe {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl StatusProbe for HttpStatusProbe {
    async fn probe(&self, address: &str) -> ProbeResult {
        match http_client::send(http::Method::GET, address, &self.path, self.timeout).await {
            Ok(resp) if resp.status.is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status, %address, "status probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %address, "status probe failed");
                ProbeResult::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_of_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let probe = HttpStatusProbe::default().with_timeout(Duration::from_millis(300));
        assert_eq!(probe.probe(&addr).await, ProbeResult::Failed);
    }

    #[test]
    fn only_healthy_counts() {
        assert!(ProbeResult::Healthy.is_healthy());
        assert!(!ProbeResult::Unhealthy.is_healthy());
        assert!(!ProbeResult::Failed.is_healthy());
    }
}
