//! SOCKS5 health probes with two-phase failure confirmation.
//!
//! Each probe opens the target's local port, performs a SOCKS5 CONNECT to a
//! fixed well-known host, sends an HTTP HEAD through the tunnel, and passes
//! only if the first received chunk contains `"HTTP/1.1 200 OK"`. A closed
//! stream before any data, a handshake refusal, and every socket error fail
//! the probe. Probes carry their own hard timeout so one hanging target
//! never blocks the rest of the round.

use std::time::Duration;

use anyhow::{bail, Result};
use futures::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::balancer::Target;
use crate::metrics;

/// Default host the probe asks the upstream to CONNECT to.
pub const DEFAULT_PROBE_HOST: &str = "www.google.com";
/// Default port on the probe host.
pub const DEFAULT_PROBE_PORT: u16 = 80;
/// The marker the first response chunk must contain for a probe to pass.
const PROBE_PASS_MARKER: &str = "HTTP/1.1 200 OK";

/// Result of probing a single target.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub target: Target,
    pub passed: bool,
    pub failure_reason: Option<String>,
}

/// Performs SOCKS5 CONNECT probes against gateway targets.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    probe_host: String,
    probe_port: u16,
    /// Budget for the TCP connect to the target's local port
    connect_timeout: Duration,
    /// Budget for the whole handshake + tunneled request
    probe_timeout: Duration,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(
            DEFAULT_PROBE_HOST.to_string(),
            DEFAULT_PROBE_PORT,
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
    }
}

impl HealthChecker {
    pub fn new(
        probe_host: String,
        probe_port: u16,
        connect_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            probe_host,
            probe_port,
            connect_timeout,
            probe_timeout,
        }
    }

    /// Run one full health-check round with two-phase confirmation.
    ///
    /// Every target is probed concurrently; targets that fail are probed a
    /// second time, and only targets failing both rounds are returned. A
    /// single transient failure therefore never surfaces.
    pub async fn run_round(&self, targets: &[Target]) -> Vec<Target> {
        let first_failed = self.probe_failed(targets).await;
        if first_failed.is_empty() {
            return Vec::new();
        }
        tracing::debug!(
            failed = first_failed.len(),
            "First probe round had failures, re-probing"
        );
        self.probe_failed(&first_failed).await
    }

    /// Probe every target concurrently and return the ones that failed.
    async fn probe_failed(&self, targets: &[Target]) -> Vec<Target> {
        let results = join_all(targets.iter().map(|t| self.probe(t))).await;
        results
            .into_iter()
            .filter_map(|result| {
                metrics::record_probe(result.target.id, result.passed);
                if result.passed {
                    None
                } else {
                    tracing::debug!(
                        port = result.target.id,
                        conf_id = %result.target.conf_id,
                        reason = ?result.failure_reason,
                        "Health probe failed"
                    );
                    Some(result.target)
                }
            })
            .collect()
    }

    /// Probe one target. Never hangs: the whole exchange runs under
    /// `probe_timeout` and resolves failure instead of erroring out.
    pub async fn probe(&self, target: &Target) -> ProbeResult {
        match timeout(self.probe_timeout, self.probe_inner(target.id)).await {
            Ok(Ok(())) => ProbeResult {
                target: target.clone(),
                passed: true,
                failure_reason: None,
            },
            Ok(Err(e)) => ProbeResult {
                target: target.clone(),
                passed: false,
                failure_reason: Some(e.to_string()),
            },
            Err(_) => ProbeResult {
                target: target.clone(),
                passed: false,
                failure_reason: Some(format!(
                    "Probe timeout after {}ms",
                    self.probe_timeout.as_millis()
                )),
            },
        }
    }

    async fn probe_inner(&self, port: u16) -> Result<()> {
        let mut stream = timeout(
            self.connect_timeout,
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Connect timeout on port {port}"))??;

        // SOCKS5 greeting, no-auth only
        stream.write_all(&[0x05, 0x01, 0x00]).await?;
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply != [0x05, 0x00] {
            bail!("SOCKS5 method selection rejected: {:02x?}", reply);
        }

        // CONNECT request with domain addressing
        let host = self.probe_host.as_bytes();
        if host.len() > u8::MAX as usize {
            bail!("Probe host name too long");
        }
        let mut request = Vec::with_capacity(7 + host.len());
        request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host.len() as u8]);
        request.extend_from_slice(host);
        request.extend_from_slice(&self.probe_port.to_be_bytes());
        stream.write_all(&request).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[1] != 0x00 {
            bail!("SOCKS5 CONNECT refused with code {:#04x}", head[1]);
        }
        // Drain the bound address the reply carries
        match head[3] {
            0x01 => {
                let mut rest = [0u8; 6];
                stream.read_exact(&mut rest).await?;
            }
            0x04 => {
                let mut rest = [0u8; 18];
                stream.read_exact(&mut rest).await?;
            }
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut rest = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut rest).await?;
            }
            other => bail!("SOCKS5 reply with unknown address type {other:#04x}"),
        }

        // HEAD through the tunnel; the first chunk decides
        let head_request = format!(
            "HEAD / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.probe_host
        );
        stream.write_all(head_request.as_bytes()).await?;

        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            bail!("Tunnel closed before any response data");
        }
        let chunk = String::from_utf8_lossy(&buf[..n]);
        if chunk.contains(PROBE_PASS_MARKER) {
            Ok(())
        } else {
            let first_line = chunk.lines().next().unwrap_or_default();
            bail!("Unexpected probe response: {first_line}");
        }
    }
}
