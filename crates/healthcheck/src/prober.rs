//! Backend reachability probes.

use crate::types::ProbeOutcome;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Reachability probe trait
#[async_trait]
pub trait Prober: Send + Sync {
    /// Attempt to reach `host:port` within `timeout_duration`
    async fn probe(&self, host: &str, port: u16, timeout_duration: Duration) -> ProbeOutcome;

    /// Get the name of this prober
    fn name(&self) -> &str;
}

/// TCP connect prober.
///
/// Opens a connection and closes it immediately; the backend's own health
/// endpoint is never requested.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

impl TcpProber {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, host: &str, port: u16, timeout_duration: Duration) -> ProbeOutcome {
        let start = Instant::now();

        match timeout(timeout_duration, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                let elapsed = start.elapsed();
                drop(stream);
                debug!(host, port, elapsed_ms = elapsed.as_millis(), "TCP probe connected");
                ProbeOutcome::Reachable(elapsed)
            }
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                debug!(host, port, "TCP probe refused");
                ProbeOutcome::Unreachable("connection refused".to_string())
            }
            Ok(Err(e)) => {
                debug!(host, port, error = %e, "TCP probe failed");
                ProbeOutcome::Unreachable(format!("connection failed: {}", e))
            }
            Err(_) => {
                debug!(host, port, "TCP probe timed out");
                ProbeOutcome::timeout()
            }
        }
    }

    fn name(&self) -> &str {
        "tcp"
    }
}
