//! Cluster manager: keeps the gateway's advertised targets converged with a
//! pool of healthy upstream clients, replacing members that fail health
//! checks from a larger candidate config list.
//!
//! The manager is an explicit instance with injected dependencies (client
//! factory, system proxy toggle, gateway) so embedders and tests can run
//! several independent clusters. Start-up is an ordered pipeline of named
//! steps; the first failing step short-circuits the rest.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::balancer::Target;
use crate::error::ClusterError;
use crate::gateway::{Event, Gateway};
use crate::metrics;
use crate::upstream::{ClientConfig, ClientFactory, SystemProxy, UpstreamClient};
use crate::util;

/// Operating mode of the manager.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One upstream client, no gateway in front
    #[default]
    Single,
    /// N upstream clients behind the balancing gateway
    Cluster,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Cluster => write!(f, "cluster"),
        }
    }
}

/// Named steps of the start pipeline, in execution order. A failure carries
/// the step it happened at; everything after is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStep {
    CheckPort,
    EnableProxy,
    Spawn,
    Connect,
    RegisterHealthCheck,
}

impl fmt::Display for StartStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckPort => write!(f, "check_port"),
            Self::EnableProxy => write!(f, "enable_proxy"),
            Self::Spawn => write!(f, "spawn"),
            Self::Connect => write!(f, "connect"),
            Self::RegisterHealthCheck => write!(f, "register_health_check"),
        }
    }
}

/// Options for starting cluster mode.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// How many members to spawn from the candidate list
    pub size: usize,
    /// Local port the gateway listens on
    pub port: u16,
}

struct ManagerState {
    mode: Mode,
    connected: bool,
    pool: Vec<Arc<dyn UpstreamClient>>,
    single: Option<Arc<dyn UpstreamClient>>,
    cluster_config: Vec<ClientConfig>,
    /// Consecutive-failure count per conf id. Monotonic: incremented on
    /// every confirmed failure, cleared only by a full stop, and read for
    /// observability alone; no eviction threshold is enforced on it.
    dead_map: HashMap<String, u32>,
    heal_shutdown: Option<watch::Sender<bool>>,
    heal_task: Option<JoinHandle<()>>,
}

/// Orchestrates the pool, the gateway registry, and the heal workflow.
pub struct ClusterManager {
    factory: Arc<dyn ClientFactory>,
    system_proxy: Arc<dyn SystemProxy>,
    gateway: Arc<Gateway>,
    state: Mutex<ManagerState>,
}

impl ClusterManager {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        system_proxy: Arc<dyn SystemProxy>,
        gateway: Arc<Gateway>,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            system_proxy,
            gateway,
            state: Mutex::new(ManagerState {
                mode: Mode::default(),
                connected: false,
                pool: Vec::new(),
                single: None,
                cluster_config: Vec::new(),
                dead_map: HashMap::new(),
                heal_shutdown: None,
                heal_task: None,
            }),
        })
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub async fn mode(&self) -> Mode {
        self.state.lock().await.mode
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn pool_conf_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .pool
            .iter()
            .map(|c| c.conf_id().to_string())
            .collect()
    }

    pub async fn pool_len(&self) -> usize {
        self.state.lock().await.pool.len()
    }

    /// Snapshot of the dead-node counters.
    pub async fn dead_map(&self) -> HashMap<String, u32> {
        self.state.lock().await.dead_map.clone()
    }

    /// Start cluster mode: spawn `size` members sampled from `configs`,
    /// register their ports, bind the gateway, and hook healing to the
    /// health-check events.
    pub async fn start_cluster(
        self: &Arc<Self>,
        configs: Vec<ClientConfig>,
        options: ClusterOptions,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        if state.connected {
            return Err(ClusterError::AlreadyRunning);
        }
        state.mode = Mode::Cluster;

        // check_port
        if !util::port_available("127.0.0.1", options.port).await {
            return Err(fail(StartStep::CheckPort, format!(
                "port {} is already bound",
                options.port
            )));
        }

        // enable_proxy
        if let Err(e) = self.system_proxy.enable(options.port) {
            return Err(fail(StartStep::EnableProxy, e.to_string()));
        }

        // spawn
        let size = options.size.min(configs.len());
        if size == 0 {
            let _ = self.system_proxy.disable();
            return Err(fail(
                StartStep::Spawn,
                "no candidate configs to spawn from".to_string(),
            ));
        }
        let picked: Vec<ClientConfig> = {
            let mut rng = rand::thread_rng();
            configs.choose_multiple(&mut rng, size).cloned().collect()
        };
        let clients: Vec<Arc<dyn UpstreamClient>> =
            picked.iter().map(|cfg| self.factory.create(cfg)).collect();

        // connect
        let statuses = join_all(clients.iter().map(|c| c.connect())).await;
        let mut targets = Vec::new();
        let mut pool = Vec::new();
        for ((client, config), status) in clients.into_iter().zip(&picked).zip(statuses) {
            match (status.ok, status.port.or(client.local_port())) {
                (true, Some(port)) => {
                    targets.push(Target::with_weight(port, config.id.clone(), config.weight));
                    pool.push(client);
                }
                _ => {
                    tracing::warn!(
                        conf_id = %config.id,
                        message = ?status.message,
                        "Upstream client failed to connect at start"
                    );
                    // Kept unconnected; a later heal cycle retries it.
                    pool.push(client);
                }
            }
        }
        if targets.is_empty() {
            join_all(pool.iter().map(|c| c.disconnect())).await;
            let _ = self.system_proxy.disable();
            return Err(fail(
                StartStep::Connect,
                "no upstream client connected".to_string(),
            ));
        }
        self.gateway.balancer().set_targets(targets);

        // register_health_check
        if let Err(e) = self.gateway.listen(options.port).await {
            join_all(pool.iter().map(|c| c.disconnect())).await;
            self.gateway.balancer().wipe();
            let _ = self.system_proxy.disable();
            return Err(fail(StartStep::RegisterHealthCheck, e.to_string()));
        }
        let (heal_tx, heal_task) = self.spawn_heal_task();
        state.heal_shutdown = Some(heal_tx);
        state.heal_task = Some(heal_task);

        state.pool = pool;
        state.cluster_config = configs;
        state.connected = true;
        tracing::info!(
            members = state.pool.len(),
            port = options.port,
            "Cluster started"
        );
        Ok(())
    }

    /// Start single mode: one client, no gateway in front. The config must
    /// declare the local port it will bind so the pre-flight check can run.
    pub async fn start_single(
        self: &Arc<Self>,
        config: ClientConfig,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        if state.connected {
            return Err(ClusterError::AlreadyRunning);
        }
        state.mode = Mode::Single;

        // check_port
        let Some(port) = config.local_port else {
            return Err(fail(
                StartStep::CheckPort,
                format!("config '{}' declares no local_port", config.id),
            ));
        };
        if !util::port_available("127.0.0.1", port).await {
            return Err(fail(
                StartStep::CheckPort,
                format!("port {port} is already bound"),
            ));
        }

        // enable_proxy
        if let Err(e) = self.system_proxy.enable(port) {
            return Err(fail(StartStep::EnableProxy, e.to_string()));
        }

        // spawn + connect
        let client = self.factory.create(&config);
        let status = client.connect().await;
        if !status.ok {
            let _ = self.system_proxy.disable();
            return Err(fail(
                StartStep::Connect,
                status
                    .message
                    .unwrap_or_else(|| "upstream client failed to connect".to_string()),
            ));
        }

        state.single = Some(client);
        state.connected = true;
        tracing::info!(conf_id = %config.id, port, "Single client started");
        Ok(())
    }

    /// Replace unhealthy members with fresh ones from the candidate list.
    ///
    /// Healthy traffic keeps flowing while this runs: the gateway registry
    /// is cut down to the surviving members first, and every later step
    /// tolerates partial failure without desynchronizing registry and pool.
    pub async fn heal_cluster(&self, failed: Vec<Target>) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        if !state.connected || state.mode != Mode::Cluster {
            return Err(ClusterError::NotRunning);
        }

        // Dead-node bookkeeping, before anything can fail.
        for target in &failed {
            let count = state.dead_map.entry(target.conf_id.clone()).or_insert(0);
            *count += 1;
            tracing::warn!(
                conf_id = %target.conf_id,
                port = target.id,
                failures = *count,
                "Cluster member confirmed unhealthy"
            );
        }

        // Partition: abnormal = confirmed failed or already disconnected.
        let failed_ids: HashSet<u16> = failed.iter().map(|t| t.id).collect();
        let mut normal = Vec::new();
        let mut abnormal = Vec::new();
        for client in state.pool.drain(..) {
            let healthy = client.is_connected()
                && client.local_port().is_some_and(|p| !failed_ids.contains(&p));
            if healthy {
                normal.push(client);
            } else {
                abnormal.push(client);
            }
        }

        // Surviving members serve immediately while healing proceeds.
        let normal_targets: Vec<Target> = normal
            .iter()
            .filter_map(|c| target_for(c, &state.cluster_config))
            .collect();
        self.gateway.balancer().set_targets(normal_targets);
        state.pool = normal;

        // Disconnect the abnormal members concurrently; a failed disconnect
        // keeps the member rather than losing it.
        let outcomes = join_all(abnormal.iter().map(|c| c.disconnect())).await;
        let mut cleanly_down = Vec::new();
        for (client, status) in abnormal.into_iter().zip(outcomes) {
            if status.ok {
                cleanly_down.push(client);
            } else {
                tracing::warn!(
                    conf_id = %client.conf_id(),
                    message = ?status.message,
                    "Disconnect failed, keeping member in pool"
                );
                if let Some(target) = target_for(&client, &state.cluster_config) {
                    self.gateway.balancer().add(target);
                }
                state.pool.push(client);
            }
        }

        // Pick replacement configs, excluding everything already in use:
        // pool members and the members this cycle is replacing, so the same
        // upstream server is never connected twice.
        let need = cleanly_down.len();
        let picked: Vec<ClientConfig> = {
            let in_use: HashSet<&str> = state
                .pool
                .iter()
                .map(|c| c.conf_id())
                .chain(cleanly_down.iter().map(|c| c.conf_id()))
                .collect();
            let candidates: Vec<&ClientConfig> = state
                .cluster_config
                .iter()
                .filter(|c| !in_use.contains(c.id.as_str()))
                .collect();
            let mut rng = rand::thread_rng();
            candidates
                .choose_multiple(&mut rng, need)
                .map(|c| (*c).clone())
                .collect()
        };
        if picked.len() < need {
            tracing::warn!(
                needed = need,
                available = picked.len(),
                "Config pool cannot replace every lost member"
            );
        }

        // Spawn and connect replacements concurrently; failures stay in the
        // pool unconnected so a later heal cycle retries them.
        let clients: Vec<Arc<dyn UpstreamClient>> =
            picked.iter().map(|cfg| self.factory.create(cfg)).collect();
        let statuses = join_all(clients.iter().map(|c| c.connect())).await;
        let mut replaced = 0usize;
        for ((client, config), status) in clients.into_iter().zip(&picked).zip(statuses) {
            match (status.ok, status.port.or(client.local_port())) {
                (true, Some(port)) => {
                    self.gateway.balancer().add(Target::with_weight(
                        port,
                        config.id.clone(),
                        config.weight,
                    ));
                    state.pool.push(client);
                    replaced += 1;
                }
                _ => {
                    tracing::warn!(
                        conf_id = %config.id,
                        message = ?status.message,
                        "Replacement failed to connect, will retry next cycle"
                    );
                    state.pool.push(client);
                }
            }
        }

        metrics::record_heal(failed.len(), replaced);

        if state.pool.is_empty() {
            state.connected = false;
            tracing::error!("Heal left the pool empty, cluster is down");
            return Err(ClusterError::PoolEmpty);
        }
        if replaced == 0 && need > 0 {
            tracing::warn!(
                members = state.pool.len(),
                "No replacement connected, cluster continues degraded"
            );
        } else if replaced > 0 {
            tracing::info!(replaced, members = state.pool.len(), "Cluster healed");
        }
        Ok(())
    }

    /// Tear down whatever mode is active, disable the system proxy, and
    /// switch to the requested mode.
    pub async fn change_mode(self: &Arc<Self>, mode: Mode) -> anyhow::Result<()> {
        if self.mode().await == mode {
            return Ok(());
        }
        self.stop().await;
        let mut state = self.state.lock().await;
        state.mode = mode;
        tracing::info!(%mode, "Mode changed");
        Ok(())
    }

    /// Full stop. The heal listener is detached before any member is
    /// disconnected so the shutdown's own failures never trigger a heal,
    /// and the gateway timer goes down before its listener.
    pub async fn stop(self: &Arc<Self>) {
        let (heal_tx, heal_task) = {
            let mut state = self.state.lock().await;
            (state.heal_shutdown.take(), state.heal_task.take())
        };
        if let Some(tx) = heal_tx {
            let _ = tx.send(true);
        }
        if let Some(task) = heal_task {
            let _ = task.await;
        }

        self.gateway.stop().await;

        let mut state = self.state.lock().await;
        let pool = std::mem::take(&mut state.pool);
        join_all(pool.iter().map(|c| c.disconnect())).await;
        if let Some(single) = state.single.take() {
            let _ = single.disconnect().await;
        }
        self.gateway.balancer().wipe();
        state.dead_map.clear();
        state.connected = false;
        if let Err(e) = self.system_proxy.disable() {
            tracing::warn!(error = %e, "Failed to disable system proxy");
        }
        tracing::info!("Cluster manager stopped");
    }

    fn spawn_heal_task(self: &Arc<Self>) -> (watch::Sender<bool>, JoinHandle<()>) {
        let mut events = self.gateway.subscribe();
        let (tx, mut rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = rx.changed() => break,
                    event = events.recv() => match event {
                        Ok(Event::HealthCheckFailed(failed)) => {
                            if let Err(e) = manager.heal_cluster(failed).await {
                                tracing::error!(error = %e, "Cluster heal failed");
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Heal listener lagged behind events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
        (tx, task)
    }
}

fn fail(step: StartStep, message: String) -> ClusterError {
    tracing::error!(step = %step, message = %message, "Start pipeline failed");
    ClusterError::StartFailed { step, message }
}

fn target_for(client: &Arc<dyn UpstreamClient>, configs: &[ClientConfig]) -> Option<Target> {
    let port = client.local_port()?;
    let weight = configs
        .iter()
        .find(|c| c.id == client.conf_id())
        .map(|c| c.weight)
        .unwrap_or(0);
    Some(Target::with_weight(port, client.conf_id().to_string(), weight))
}
