//! Shared mocks for integration tests.
//!
//! [`MockUpstream`] is a minimal SOCKS5-speaking server standing in for an
//! upstream proxy client process: it accepts the handshake, tunnels nothing,
//! and answers the probe's HTTP request according to its configured
//! [`ProbeAnswer`]. [`ManagedClient`]/[`ManagedFactory`] wrap it behind the
//! `UpstreamClient` seam for cluster tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use proxy_gate::upstream::{ClientConfig, ClientFactory, ClientStatus, UpstreamClient};

/// How the mock answers the probe's tunneled HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeAnswer {
    /// Healthy: first chunk carries `HTTP/1.1 200 OK`
    Ok200,
    /// Reachable but broken
    Bad502,
    /// Close the connection before any data
    CloseEarly,
}

/// SOCKS5 mock upstream bound to an ephemeral port.
pub struct MockUpstream {
    pub port: u16,
    answer: Arc<Mutex<ProbeAnswer>>,
    fail_next: Arc<AtomicU32>,
    handle: JoinHandle<()>,
}

impl MockUpstream {
    pub async fn spawn(answer: ProbeAnswer) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let answer = Arc::new(Mutex::new(answer));
        let fail_next = Arc::new(AtomicU32::new(0));

        let answer_ref = answer.clone();
        let fail_ref = fail_next.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let mut current = *answer_ref.lock().unwrap();
                if current == ProbeAnswer::Ok200
                    && fail_ref
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                {
                    current = ProbeAnswer::Bad502;
                }
                tokio::spawn(answer_probe(stream, current));
            }
        });

        Self {
            port,
            answer,
            fail_next,
            handle,
        }
    }

    /// Change the standing answer for future probes.
    pub fn set_answer(&self, answer: ProbeAnswer) {
        *self.answer.lock().unwrap() = answer;
    }

    /// Fail the next `n` probes, then return to the standing answer.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn answer_probe(mut stream: TcpStream, answer: ProbeAnswer) {
    if answer == ProbeAnswer::CloseEarly {
        return;
    }

    // Method selection: VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    if stream.read_exact(&mut head).await.is_err() {
        return;
    }
    let mut methods = vec![0u8; head[1] as usize];
    if stream.read_exact(&mut methods).await.is_err() {
        return;
    }
    if stream.write_all(&[0x05, 0x00]).await.is_err() {
        return;
    }

    // CONNECT request; only domain addressing is exercised by the probe.
    let mut request = [0u8; 4];
    if stream.read_exact(&mut request).await.is_err() {
        return;
    }
    match request[3] {
        0x03 => {
            let mut len = [0u8; 1];
            if stream.read_exact(&mut len).await.is_err() {
                return;
            }
            let mut rest = vec![0u8; len[0] as usize + 2];
            if stream.read_exact(&mut rest).await.is_err() {
                return;
            }
        }
        0x01 => {
            let mut rest = [0u8; 6];
            if stream.read_exact(&mut rest).await.is_err() {
                return;
            }
        }
        _ => return,
    }
    if stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .is_err()
    {
        return;
    }

    // The tunneled HTTP request; the first reply chunk decides the probe.
    let mut buf = [0u8; 512];
    if stream.read(&mut buf).await.is_err() {
        return;
    }
    let body: &[u8] = match answer {
        ProbeAnswer::Ok200 => b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        ProbeAnswer::Bad502 => b"HTTP/1.1 502 Bad Gateway\r\n\r\n",
        ProbeAnswer::CloseEarly => unreachable!(),
    };
    let _ = stream.write_all(body).await;
}

/// Plain TCP server for relay tests: reads `expect` bytes from each
/// connection, writes `reply` back, and closes.
pub async fn spawn_sink_server(expect: usize, reply: Vec<u8>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let reply = reply.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; expect];
                if stream.read_exact(&mut buf).await.is_err() {
                    return;
                }
                let _ = stream.write_all(&reply).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    port
}

/// Upstream client whose connect spawns a real [`MockUpstream`].
pub struct ManagedClient {
    conf_id: String,
    connected: AtomicBool,
    port: AtomicU16,
    fail_connect: AtomicBool,
    fail_disconnect: AtomicBool,
    upstream: Mutex<Option<MockUpstream>>,
}

impl ManagedClient {
    pub fn new(conf_id: String) -> Self {
        Self {
            conf_id,
            connected: AtomicBool::new(false),
            port: AtomicU16::new(0),
            fail_connect: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            upstream: Mutex::new(None),
        }
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    /// Make the running upstream answer probes as broken.
    pub fn break_upstream(&self) {
        if let Some(upstream) = self.upstream.lock().unwrap().as_ref() {
            upstream.set_answer(ProbeAnswer::Bad502);
        }
    }

    /// Fail the next `n` probes only.
    pub fn flake_upstream(&self, n: u32) {
        if let Some(upstream) = self.upstream.lock().unwrap().as_ref() {
            upstream.fail_next(n);
        }
    }
}

#[async_trait]
impl UpstreamClient for ManagedClient {
    fn conf_id(&self) -> &str {
        &self.conf_id
    }

    fn local_port(&self) -> Option<u16> {
        self.connected
            .load(Ordering::SeqCst)
            .then(|| self.port.load(Ordering::SeqCst))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> ClientStatus {
        if self.fail_connect.load(Ordering::SeqCst) {
            return ClientStatus::failed("mock connect refused");
        }
        let upstream = MockUpstream::spawn(ProbeAnswer::Ok200).await;
        let port = upstream.port;
        self.port.store(port, Ordering::SeqCst);
        *self.upstream.lock().unwrap() = Some(upstream);
        self.connected.store(true, Ordering::SeqCst);
        ClientStatus::connected(port)
    }

    async fn disconnect(&self) -> ClientStatus {
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return ClientStatus::failed("mock disconnect stuck");
        }
        if let Some(upstream) = self.upstream.lock().unwrap().take() {
            upstream.stop();
        }
        self.connected.store(false, Ordering::SeqCst);
        ClientStatus::done()
    }
}

/// Factory that records every client it creates, keyed by conf id, so tests
/// can reach into running members.
#[derive(Default)]
pub struct ManagedFactory {
    pub created: Mutex<HashMap<String, Arc<ManagedClient>>>,
    fail_connect_ids: Mutex<std::collections::HashSet<String>>,
}

impl ManagedFactory {
    pub fn client(&self, conf_id: &str) -> Option<Arc<ManagedClient>> {
        self.created.lock().unwrap().get(conf_id).cloned()
    }

    /// Clients created for this conf id refuse to connect until allowed.
    pub fn fail_connects_for(&self, conf_id: &str) {
        self.fail_connect_ids
            .lock()
            .unwrap()
            .insert(conf_id.to_string());
    }

    pub fn allow_connects_for(&self, conf_id: &str) {
        self.fail_connect_ids.lock().unwrap().remove(conf_id);
        if let Some(client) = self.client(conf_id) {
            client.set_fail_connect(false);
        }
    }
}

impl ClientFactory for ManagedFactory {
    fn create(&self, config: &ClientConfig) -> Arc<dyn UpstreamClient> {
        let client = Arc::new(ManagedClient::new(config.id.clone()));
        if self.fail_connect_ids.lock().unwrap().contains(&config.id) {
            client.set_fail_connect(true);
        }
        self.created
            .lock()
            .unwrap()
            .insert(config.id.clone(), client.clone());
        client
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: std::time::Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    predicate()
}
