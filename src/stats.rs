//! Persisted runtime statistics.
//!
//! Byte volumes and probe history per target, saved as JSON under the
//! platform state dir so they survive restarts. Separate from config (user
//! intent) and from the balancer's live counters (selection state).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

use crate::config::state_dir;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TargetStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_active: Option<DateTime<Utc>>,
    /// Probes failed across the target's lifetime
    #[serde(default)]
    pub probes_failed: u64,
    #[serde(default)]
    pub last_probe_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Stats {
    /// Keyed by conf id so stats survive port changes across reconnects
    pub targets: HashMap<String, TargetStats>,
    #[serde(default)]
    pub total_bytes: u64,
}

impl Stats {
    pub fn load(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed reading stats {}", path.display()))?;
        let stats: Stats = serde_json::from_str(&content)
            .with_context(|| format!("Failed parsing stats {}", path.display()))?;
        Ok(stats)
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating stats dir {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed writing stats {}", path.display()))?;
        Ok(())
    }
}

pub fn stats_path() -> Result<PathBuf> {
    Ok(state_dir()?.join("stats.json"))
}

/// Thread-safe handle over [`Stats`] with periodic persistence.
#[derive(Clone)]
pub struct StatsStore {
    inner: Arc<RwLock<Stats>>,
    path: PathBuf,
}

impl StatsStore {
    pub fn load() -> Result<Self> {
        let path = stats_path()?;
        let stats = Stats::load(&path)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(stats)),
            path,
        })
    }

    /// In-memory store for tests, no file behind it until flushed.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        let stats = Stats::load(&path)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(stats)),
            path,
        })
    }

    pub async fn record_traffic(&self, conf_id: &str, sent: u64, received: u64) {
        let now = Utc::now();
        let mut stats = self.inner.write().await;
        let entry = stats.targets.entry(conf_id.to_string()).or_default();
        entry.bytes_sent = entry.bytes_sent.saturating_add(sent);
        entry.bytes_received = entry.bytes_received.saturating_add(received);
        entry.last_active = Some(now);
        stats.total_bytes = stats.total_bytes.saturating_add(sent + received);
    }

    pub async fn record_probe(&self, conf_id: &str, passed: bool, failure_reason: Option<String>) {
        let now = Utc::now();
        let mut stats = self.inner.write().await;
        let entry = stats.targets.entry(conf_id.to_string()).or_default();
        entry.last_probe_at = Some(now);
        if passed {
            entry.last_failure_reason = None;
        } else {
            entry.probes_failed = entry.probes_failed.saturating_add(1);
            entry.last_failure_reason = failure_reason;
        }
    }

    pub async fn total_bytes(&self) -> u64 {
        self.inner.read().await.total_bytes
    }

    pub async fn snapshot(&self) -> Stats {
        self.inner.read().await.clone()
    }

    pub async fn flush(&self) -> Result<()> {
        let stats = self.inner.read().await;
        stats.save(&self.path)
    }

    /// Persist on a fixed cadence in the background.
    pub fn start_flush_loop(self, interval: Duration) {
        tokio::spawn(async move {
            let mut next = Instant::now() + interval;
            loop {
                tokio::time::sleep_until(next).await;
                if let Err(err) = self.flush().await {
                    tracing::warn!("Stats flush failed: {err}");
                }
                next += interval;
            }
        });
    }
}
