//! Gateway: the TCP listener that splices inbound connections onto
//! balancer-picked upstream ports, and the owner of the health-check timer.
//!
//! The data plane is a transparent byte-for-byte relay with no framing.
//! Every socket-level failure is republished as a typed [`Event`] rather
//! than thrown, so the accept loop never dies from a bad connection.
//!
//! The health-check timer follows a graduated heartbeat schedule: the
//! configured delays are consumed one by one, and once the list is
//! exhausted the last value repeats as the steady-state interval.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::balancer::{LoadBalancer, Target};
use crate::error::GatewayError;
use crate::health::HealthChecker;
use crate::metrics;

/// Default graduated heartbeat delays in milliseconds: frequent checks while
/// the cluster settles, then a steady five-minute cadence.
pub const DEFAULT_HEARTBEAT_MS: [u64; 6] = [10_000, 15_000, 30_000, 60_000, 180_000, 300_000];

/// Events published by the gateway. Consumers subscribe with
/// [`Gateway::subscribe`] and must drop the receiver before tearing the
/// gateway down to avoid reacting to shutdown noise.
#[derive(Debug, Clone)]
pub enum Event {
    /// Targets that failed both probe rounds of one health check
    HealthCheckFailed(Vec<Target>),
    /// The balancer had no target for an inbound connection
    LoadBalancerError { message: String },
    /// Listener-side socket failure
    LocalSocketError { port: u16, message: String },
    /// Upstream connect failure for a picked target
    RemoteSocketError { port: u16, message: String },
    /// Relay failure after both legs were established
    TransferError { port: u16, message: String },
}

/// Graduated-then-steady sequence of health-check delays.
///
/// Delays are consumed destructively; after the last one is popped it
/// becomes the fixed repeating interval.
#[derive(Debug, Clone)]
pub struct HeartbeatSchedule {
    pending: VecDeque<u64>,
    steady: u64,
}

impl HeartbeatSchedule {
    pub fn new(delays_ms: Vec<u64>) -> Self {
        let delays = if delays_ms.is_empty() {
            DEFAULT_HEARTBEAT_MS.to_vec()
        } else {
            delays_ms
        };
        let steady = *delays.last().unwrap_or(&DEFAULT_HEARTBEAT_MS[5]);
        Self {
            pending: delays.into(),
            steady,
        }
    }

    /// The next delay to wait before a check round.
    pub fn next_delay(&mut self) -> Duration {
        let ms = match self.pending.pop_front() {
            Some(ms) => {
                self.steady = ms;
                ms
            }
            None => self.steady,
        };
        Duration::from_millis(ms)
    }
}

/// Check if an accept() error is transient and should be retried.
fn is_transient_accept_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    if matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    ) {
        return true;
    }

    // Raw OS codes without stable ErrorKind mappings (Linux)
    matches!(
        e.raw_os_error(),
        Some(23)    // ENFILE
            | Some(24)  // EMFILE
            | Some(103) // ECONNABORTED
            | Some(105) // ENOBUFS
            | Some(12) // ENOMEM
    )
}

/// Manages exponential backoff for accept loop errors
struct AcceptBackoff {
    current_ms: u64,
    min_ms: u64,
    max_ms: u64,
    consecutive_errors: u32,
}

impl AcceptBackoff {
    fn new() -> Self {
        Self {
            current_ms: 10,
            min_ms: 10,
            max_ms: 5000,
            consecutive_errors: 0,
        }
    }

    fn record_error(&mut self) -> Duration {
        self.consecutive_errors += 1;
        let backoff = Duration::from_millis(self.current_ms);
        self.current_ms = (self.current_ms * 2).min(self.max_ms);
        backoff
    }

    fn record_success(&mut self) {
        self.current_ms = self.min_ms;
        self.consecutive_errors = 0;
    }
}

/// Decrements the balancer's connection count when a relay session ends.
struct ConnectionGuard {
    balancer: Arc<LoadBalancer>,
    port: u16,
}

impl ConnectionGuard {
    fn new(balancer: Arc<LoadBalancer>, port: u16) -> Self {
        balancer.connection_opened(port);
        metrics::connection_started(port);
        Self { balancer, port }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.balancer.connection_closed(self.port);
        metrics::connection_ended(self.port);
    }
}

struct Runtime {
    heartbeat_ms: Vec<u64>,
    local_addr: Option<SocketAddr>,
    accept_shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
    timer_shutdown: Option<watch::Sender<bool>>,
    timer_task: Option<JoinHandle<()>>,
}

/// The socket-transfer gateway.
///
/// Lifecycle: `stopped → listening → stopped`. Binding the listener starts
/// the health-check timer; [`stop`](Gateway::stop) clears the timer before
/// the listener so no check round fires against a half-torn-down registry.
pub struct Gateway {
    host: String,
    balancer: Arc<LoadBalancer>,
    checker: HealthChecker,
    events: broadcast::Sender<Event>,
    bytes_transfer: Arc<AtomicU64>,
    runtime: Mutex<Runtime>,
}

impl Gateway {
    pub fn new(
        host: impl Into<String>,
        balancer: Arc<LoadBalancer>,
        checker: HealthChecker,
        heartbeat_ms: Vec<u64>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            host: host.into(),
            balancer,
            checker,
            events,
            bytes_transfer: Arc::new(AtomicU64::new(0)),
            runtime: Mutex::new(Runtime {
                heartbeat_ms,
                local_addr: None,
                accept_shutdown: None,
                accept_task: None,
                timer_shutdown: None,
                timer_task: None,
            }),
        }
    }

    /// Subscribe to gateway events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// The balancer this gateway picks targets from.
    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// Total bytes relayed across finished sessions (client-side read +
    /// written; the upstream leg's own counters are not merged).
    pub fn bytes_transfer(&self) -> u64 {
        self.bytes_transfer.load(Ordering::Relaxed)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().unwrap().local_addr
    }

    /// Bind the listener and start the health-check timer. Port 0 binds an
    /// ephemeral port; the bound address is returned either way.
    pub async fn listen(&self, port: u16) -> Result<SocketAddr, GatewayError> {
        {
            let runtime = self.runtime.lock().unwrap();
            if let Some(addr) = runtime.local_addr {
                return Err(GatewayError::AlreadyListening {
                    addr: addr.to_string(),
                });
            }
        }

        let addr = format!("{}:{}", self.host, port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                GatewayError::PortInUse { port }
            } else {
                GatewayError::BindFailed { addr, source: e }
            }
        })?;
        let local_addr = listener.local_addr().map_err(|e| GatewayError::BindFailed {
            addr: format!("{}:{}", self.host, port),
            source: e,
        })?;
        tracing::info!(addr = %local_addr, "Gateway listening");

        let (accept_tx, accept_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.balancer.clone(),
            self.events.clone(),
            self.bytes_transfer.clone(),
            accept_rx,
        ));

        let mut runtime = self.runtime.lock().unwrap();
        runtime.local_addr = Some(local_addr);
        runtime.accept_shutdown = Some(accept_tx);
        runtime.accept_task = Some(accept_task);
        self.start_timer(&mut runtime);
        Ok(local_addr)
    }

    /// Replace the heartbeat schedule. A running timer is torn down and
    /// restarted from the new schedule's head.
    pub async fn set_heartbeat(&self, heartbeat_ms: Vec<u64>) {
        let (old_tx, old_task, restart) = {
            let mut runtime = self.runtime.lock().unwrap();
            runtime.heartbeat_ms = heartbeat_ms;
            (
                runtime.timer_shutdown.take(),
                runtime.timer_task.take(),
                runtime.local_addr.is_some(),
            )
        };
        if let Some(tx) = old_tx {
            let _ = tx.send(true);
        }
        if let Some(task) = old_task {
            let _ = task.await;
        }
        if restart {
            let mut runtime = self.runtime.lock().unwrap();
            self.start_timer(&mut runtime);
        }
    }

    /// Stop the gateway: health timer first, then the listener.
    pub async fn stop(&self) {
        let (timer_tx, timer_task, accept_tx, accept_task) = {
            let mut runtime = self.runtime.lock().unwrap();
            runtime.local_addr = None;
            (
                runtime.timer_shutdown.take(),
                runtime.timer_task.take(),
                runtime.accept_shutdown.take(),
                runtime.accept_task.take(),
            )
        };
        if let Some(tx) = timer_tx {
            let _ = tx.send(true);
        }
        if let Some(task) = timer_task {
            let _ = task.await;
        }
        if let Some(tx) = accept_tx {
            let _ = tx.send(true);
        }
        if let Some(task) = accept_task {
            let _ = task.await;
        }
        tracing::info!("Gateway stopped");
    }

    fn start_timer(&self, runtime: &mut Runtime) {
        let schedule = HeartbeatSchedule::new(runtime.heartbeat_ms.clone());
        let (timer_tx, timer_rx) = watch::channel(false);
        let timer_task = tokio::spawn(health_loop(
            schedule,
            self.balancer.clone(),
            self.checker.clone(),
            self.events.clone(),
            timer_rx,
        ));
        runtime.timer_shutdown = Some(timer_tx);
        runtime.timer_task = Some(timer_task);
    }
}

async fn accept_loop(
    listener: TcpListener,
    balancer: Arc<LoadBalancer>,
    events: broadcast::Sender<Event>,
    bytes_transfer: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let listen_port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
    let mut backoff = AcceptBackoff::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                tracing::debug!("Accept loop shutting down");
                break;
            }
            result = listener.accept() => match result {
                Ok((client, peer)) => {
                    backoff.record_success();
                    let balancer = balancer.clone();
                    let events = events.clone();
                    let bytes_transfer = bytes_transfer.clone();
                    tokio::spawn(async move {
                        handle_connection(client, peer, balancer, events, bytes_transfer).await;
                    });
                }
                Err(e) if is_transient_accept_error(&e) => {
                    let delay = backoff.record_error();
                    tracing::warn!(
                        error = %e,
                        consecutive_errors = backoff.consecutive_errors,
                        backoff_ms = delay.as_millis(),
                        "Accept error (transient, will retry)"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Accept error (fatal, listener closing)");
                    let _ = events.send(Event::LocalSocketError {
                        port: listen_port,
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    balancer: Arc<LoadBalancer>,
    events: broadcast::Sender<Event>,
    bytes_transfer: Arc<AtomicU64>,
) {
    let Some(target) = balancer.pick_one() else {
        tracing::warn!(client = %peer, "No target available, closing inbound connection");
        let _ = events.send(Event::LoadBalancerError {
            message: "no upstream target available".to_string(),
        });
        let _ = client
            .write_all(b"proxy_gate: no upstream target available\r\n")
            .await;
        let _ = client.shutdown().await;
        return;
    };

    let mut upstream = match TcpStream::connect(("127.0.0.1", target.id)).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(port = target.id, error = %e, "Upstream connect failed");
            let _ = events.send(Event::RemoteSocketError {
                port: target.id,
                message: e.to_string(),
            });
            let _ = client.shutdown().await;
            return;
        }
    };

    tracing::debug!(client = %peer, port = target.id, "Relay session opened");
    let _guard = ConnectionGuard::new(balancer, target.id);

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            bytes_transfer.fetch_add(to_upstream + to_client, Ordering::Relaxed);
            metrics::record_bytes(target.id, to_upstream, to_client);
            tracing::debug!(
                client = %peer,
                port = target.id,
                sent = to_upstream,
                received = to_client,
                "Relay session closed"
            );
        }
        Err(e) => {
            let _ = events.send(Event::TransferError {
                port: target.id,
                message: e.to_string(),
            });
        }
    }
}

async fn health_loop(
    mut schedule: HeartbeatSchedule,
    balancer: Arc<LoadBalancer>,
    checker: HealthChecker,
    events: broadcast::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delay = schedule.next_delay();
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                tracing::debug!("Health check timer shutting down");
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        // One round settles fully, including the re-probe phase, before the
        // next delay starts counting.
        let targets = balancer.targets();
        if targets.is_empty() {
            continue;
        }
        let failed = checker.run_round(&targets).await;
        if !failed.is_empty() {
            tracing::warn!(
                failed = failed.len(),
                ports = ?failed.iter().map(|t| t.id).collect::<Vec<_>>(),
                "Health check confirmed failures"
            );
            let _ = events.send(Event::HealthCheckFailed(failed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::Algorithm;

    #[test]
    fn heartbeat_schedule_consumes_then_settles() {
        let mut schedule = HeartbeatSchedule::new(vec![10, 15, 30]);
        assert_eq!(schedule.next_delay(), Duration::from_millis(10));
        assert_eq!(schedule.next_delay(), Duration::from_millis(15));
        assert_eq!(schedule.next_delay(), Duration::from_millis(30));
        // Exhausted: the last value repeats forever.
        assert_eq!(schedule.next_delay(), Duration::from_millis(30));
        assert_eq!(schedule.next_delay(), Duration::from_millis(30));
    }

    #[test]
    fn heartbeat_schedule_empty_falls_back_to_default() {
        let mut schedule = HeartbeatSchedule::new(vec![]);
        assert_eq!(
            schedule.next_delay(),
            Duration::from_millis(DEFAULT_HEARTBEAT_MS[0])
        );
    }

    #[test]
    fn heartbeat_schedule_single_value_is_steady() {
        let mut schedule = HeartbeatSchedule::new(vec![500]);
        for _ in 0..3 {
            assert_eq!(schedule.next_delay(), Duration::from_millis(500));
        }
    }

    #[test]
    fn transient_errors_are_classified() {
        use std::io::{Error, ErrorKind};
        assert!(is_transient_accept_error(&Error::new(
            ErrorKind::ConnectionReset,
            "test"
        )));
        assert!(is_transient_accept_error(&Error::from_raw_os_error(24))); // EMFILE
        assert!(!is_transient_accept_error(&Error::new(
            ErrorKind::AddrInUse,
            "test"
        )));
        assert!(!is_transient_accept_error(&Error::new(
            ErrorKind::PermissionDenied,
            "test"
        )));
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let mut backoff = AcceptBackoff::new();
        let expected = [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5000, 5000];
        for (i, ms) in expected.iter().enumerate() {
            assert_eq!(
                backoff.record_error().as_millis(),
                *ms as u128,
                "mismatch at iteration {i}"
            );
        }
        backoff.record_success();
        assert_eq!(backoff.record_error().as_millis(), 10);
    }

    fn test_gateway() -> Gateway {
        let balancer = Arc::new(LoadBalancer::new(Algorithm::Polling, vec![]));
        Gateway::new(
            "127.0.0.1",
            balancer,
            HealthChecker::default(),
            vec![60_000],
        )
    }

    #[tokio::test]
    async fn listen_reports_port_in_use() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let gateway = test_gateway();
        let err = gateway.listen(port).await.unwrap_err();
        assert!(matches!(err, GatewayError::PortInUse { port: p } if p == port));
    }

    #[tokio::test]
    async fn listen_twice_is_rejected() {
        let gateway = test_gateway();
        gateway.listen(0).await.unwrap();
        assert!(matches!(
            gateway.listen(0).await,
            Err(GatewayError::AlreadyListening { .. })
        ));
        gateway.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let gateway = test_gateway();
        gateway.listen(0).await.unwrap();
        gateway.stop().await;
        gateway.stop().await;
        assert!(gateway.local_addr().is_none());
    }
}
