//! Load balancer: the target registry and its memoized selection state.
//!
//! The balancer exclusively owns the registry. The gateway and the cluster
//! manager mutate it only through the public methods here, which keep the
//! derived state consistent: `weight_total` is recomputed on every mutation,
//! per-target map entries are cleaned when a target leaves, and the
//! round-robin cursor is clamped so the next eligible target is never
//! skipped.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::algorithms::Algorithm;
use crate::error::BalanceError;
use crate::scheduler::Scheduler;

/// A proxyable endpoint: a local port bound to an upstream client process.
///
/// `id` is the listening port and is unique within a registry. `conf_id`
/// links the target back to the configuration that produced it, so healing
/// can avoid re-picking a configuration that is already in use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub id: u16,
    pub conf_id: String,
    #[serde(default)]
    pub weight: u32,
}

impl Target {
    pub fn new(id: u16, conf_id: String) -> Self {
        Self {
            id,
            conf_id,
            weight: 0,
        }
    }

    pub fn with_weight(id: u16, conf_id: String, weight: u32) -> Self {
        Self {
            id,
            conf_id,
            weight,
        }
    }
}

/// Mutable parameter state shared by the algorithms.
///
/// Invariants, maintained by [`LoadBalancer`]:
/// - `weight_total` equals the sum of all current targets' weights
/// - `current_index` stays within `0..max(1, targets.len())`
#[derive(Debug, Clone, Default)]
pub struct BalancerParams {
    /// Round-robin cursor
    pub current_index: usize,
    /// Weighted round-robin cursor
    pub weight_index: u32,
    /// Sum of all target weights
    pub weight_total: u32,
    /// Active connection count per target port
    pub connections: HashMap<u16, u32>,
    /// External CPU telemetry per target port
    pub cpu_occupancy: HashMap<u16, f64>,
    /// External memory telemetry per target port
    pub memory_occupancy: HashMap<u16, f64>,
    /// Port requested by the `specify` algorithm
    pub specified_port: Option<u16>,
}

/// Partial parameter update, shallow-merged by [`LoadBalancer::update_params`].
///
/// Feeds external telemetry and the specify port without going through
/// `add`/`del`.
#[derive(Debug, Clone, Default)]
pub struct ParamsUpdate {
    pub cpu_occupancy: Option<HashMap<u16, f64>>,
    pub memory_occupancy: Option<HashMap<u16, f64>>,
    pub specified_port: Option<u16>,
}

struct Inner {
    targets: Vec<Target>,
    params: BalancerParams,
    scheduler: Scheduler,
}

/// Facade over the target registry and the scheduler.
///
/// Thread-safe; every operation is short and synchronous, so a plain mutex
/// keeps registry mutations atomic with respect to concurrent pickers.
pub struct LoadBalancer {
    inner: Mutex<Inner>,
}

impl LoadBalancer {
    pub fn new(algorithm: Algorithm, targets: Vec<Target>) -> Self {
        let mut params = BalancerParams::default();
        params.weight_total = targets.iter().map(|t| t.weight).sum();
        Self {
            inner: Mutex::new(Inner {
                targets,
                params,
                scheduler: Scheduler::new(algorithm),
            }),
        }
    }

    /// Pick one target with the active algorithm, or `None` when the
    /// registry is empty (or `specify` finds no match).
    pub fn pick_one(&self) -> Option<Target> {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            targets,
            params,
            scheduler,
        } = &mut *inner;
        let picked = scheduler.calculate(targets, params).cloned();
        if picked.is_some() {
            crate::metrics::record_pick(scheduler.algorithm().as_str());
        }
        picked
    }

    /// Pick `count` targets by calling [`pick_one`](Self::pick_one) that many
    /// times. Stateless algorithms (random, weights) can return duplicates;
    /// that is intentional.
    pub fn pick_multi(&self, count: usize) -> Vec<Target> {
        (0..count).filter_map(|_| self.pick_one()).collect()
    }

    /// Append a target. A target with the same port already present makes
    /// this a no-op with a warning, not an error.
    pub fn add(&self, target: Target) {
        let mut inner = self.inner.lock().unwrap();
        if inner.targets.iter().any(|t| t.id == target.id) {
            tracing::warn!(port = target.id, "Target already registered, ignoring add");
            return;
        }
        inner.targets.push(target);
        Self::recompute_weight_total(&mut inner);
    }

    /// Remove a target by port. Cleans the per-port map entries, clamps the
    /// round-robin cursor, and recomputes the weight total. A missing port
    /// is logged, not an error.
    pub fn del(&self, id: u16) {
        let mut inner = self.inner.lock().unwrap();
        let Some(idx) = inner.targets.iter().position(|t| t.id == id) else {
            tracing::debug!(port = id, "Target not found, ignoring del");
            return;
        };
        inner.targets.remove(idx);
        Self::cleanup_target(&mut inner, id);
        // Removing at or before the cursor shifts the next eligible target
        // down by one; decrement rather than wrap so it is not skipped.
        if idx <= inner.params.current_index {
            inner.params.current_index = inner.params.current_index.saturating_sub(1);
        }
        Self::clamp_cursor(&mut inner);
        Self::recompute_weight_total(&mut inner);
    }

    /// Clear the registry and every derived map.
    pub fn wipe(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.targets.clear();
        inner.params.connections.clear();
        inner.params.cpu_occupancy.clear();
        inner.params.memory_occupancy.clear();
        inner.params.current_index = 0;
        inner.params.weight_index = 0;
        inner.params.weight_total = 0;
    }

    /// Replace the registry wholesale. Ports tracked before but absent from
    /// the new set get the same cleanup as [`del`](Self::del).
    pub fn set_targets(&self, new_targets: Vec<Target>) {
        let mut inner = self.inner.lock().unwrap();
        let kept: HashSet<u16> = new_targets.iter().map(|t| t.id).collect();
        let removed: Vec<u16> = inner
            .targets
            .iter()
            .map(|t| t.id)
            .filter(|id| !kept.contains(id))
            .collect();
        for id in removed {
            Self::cleanup_target(&mut inner, id);
        }
        inner.targets = new_targets;
        Self::clamp_cursor(&mut inner);
        Self::recompute_weight_total(&mut inner);
    }

    /// Switch the active algorithm. Weighted round-robin progress is
    /// discarded on every switch since weight semantics differ across
    /// algorithms.
    pub fn set_algorithm(&self, algorithm: Algorithm) {
        let mut inner = self.inner.lock().unwrap();
        inner.scheduler.set_algorithm(algorithm);
        inner.params.weight_index = 0;
    }

    /// Validate and switch the algorithm by identifier string.
    pub fn set_algorithm_str(&self, name: &str) -> Result<(), BalanceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.scheduler.set_algorithm_str(name)?;
        inner.params.weight_index = 0;
        Ok(())
    }

    pub fn algorithm(&self) -> Algorithm {
        self.inner.lock().unwrap().scheduler.algorithm()
    }

    /// Shallow-merge recognized keys into the parameter state.
    pub fn update_params(&self, update: ParamsUpdate) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cpu) = update.cpu_occupancy {
            inner.params.cpu_occupancy.extend(cpu);
        }
        if let Some(memory) = update.memory_occupancy {
            inner.params.memory_occupancy.extend(memory);
        }
        if let Some(port) = update.specified_port {
            inner.params.specified_port = Some(port);
        }
    }

    /// Record a relay session opening against a target port.
    pub fn connection_opened(&self, id: u16) {
        let mut inner = self.inner.lock().unwrap();
        *inner.params.connections.entry(id).or_insert(0) += 1;
    }

    /// Record a relay session closing.
    pub fn connection_closed(&self, id: u16) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(count) = inner.params.connections.get_mut(&id) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn targets(&self) -> Vec<Target> {
        self.inner.lock().unwrap().targets.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current weight total, for diagnostics and tests.
    pub fn weight_total(&self) -> u32 {
        self.inner.lock().unwrap().params.weight_total
    }

    /// Snapshot of the active connection counts.
    pub fn connections(&self) -> HashMap<u16, u32> {
        self.inner.lock().unwrap().params.connections.clone()
    }

    fn cleanup_target(inner: &mut Inner, id: u16) {
        inner.params.connections.remove(&id);
        inner.params.cpu_occupancy.remove(&id);
        inner.params.memory_occupancy.remove(&id);
    }

    fn clamp_cursor(inner: &mut Inner) {
        let bound = inner.targets.len().max(1);
        if inner.params.current_index >= bound {
            inner.params.current_index = 0;
        }
    }

    fn recompute_weight_total(inner: &mut Inner) {
        inner.params.weight_total = inner.targets.iter().map(|t| t.weight).sum();
    }
}
