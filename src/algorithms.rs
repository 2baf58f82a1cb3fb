//! Selection algorithms for distributing connections across targets.
//!
//! Every algorithm takes the live target slice (never mutated) plus whatever
//! cursor state it needs from [`BalancerParams`], and returns a borrowed
//! target, or `None` when the slice is empty. Side effects on cursors are
//! confined to the explicit `&mut BalancerParams` argument so they are
//! visible in the signature.
//!
//! # Algorithms
//!
//! - **Random**: uniform pick
//! - **Polling**: round-robin over the registry order
//! - **Specify**: exact match on a requested port
//! - **Weights**: randomized score, highest wins (ties favor the later entry)
//! - **WeightsRandom**: single weighted draw without replacement
//! - **WeightsPolling**: weight-proportional round-robin over a full cycle
//! - **MinimumConnection**: fewest active connections (ties favor the earlier entry)
//! - **WeightsMinimumConnection**: weighted score penalized by connection share

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::balancer::{BalancerParams, Target};
use crate::error::BalanceError;

/// The set of selection algorithms the scheduler can dispatch to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Cycle through targets in registry order
    #[default]
    Polling,
    /// Uniform random pick
    Random,
    /// Pick the target with a requested port
    Specify,
    /// Randomized weighted score, maximum wins
    Weights,
    /// Single weighted draw
    WeightsRandom,
    /// Weight-proportional round-robin
    WeightsPolling,
    /// Fewest active connections
    MinimumConnection,
    /// Weighted score penalized by connection share
    WeightsMinimumConnection,
}

impl Algorithm {
    /// All algorithms, in the order their identifiers are documented.
    pub const ALL: [Algorithm; 8] = [
        Algorithm::Polling,
        Algorithm::Random,
        Algorithm::Specify,
        Algorithm::Weights,
        Algorithm::WeightsRandom,
        Algorithm::WeightsPolling,
        Algorithm::MinimumConnection,
        Algorithm::WeightsMinimumConnection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Polling => "polling",
            Algorithm::Random => "random",
            Algorithm::Specify => "specify",
            Algorithm::Weights => "weights",
            Algorithm::WeightsRandom => "weights_random",
            Algorithm::WeightsPolling => "weights_polling",
            Algorithm::MinimumConnection => "minimum_connection",
            Algorithm::WeightsMinimumConnection => "weights_minimum_connection",
        }
    }

    /// The valid identifier strings, for error messages and CLI listings.
    pub fn identifiers() -> Vec<&'static str> {
        Self::ALL.iter().map(|a| a.as_str()).collect()
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = BalanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|a| a.as_str() == s)
            .copied()
            .ok_or_else(|| BalanceError::InvalidAlgorithm {
                given: s.to_string(),
            })
    }
}

/// Uniform random pick.
pub fn random(targets: &[Target]) -> Option<&Target> {
    if targets.len() < 2 {
        return targets.first();
    }
    let idx = rand::thread_rng().gen_range(0..targets.len());
    targets.get(idx)
}

/// Round-robin over the registry order.
///
/// Returns the target under the cursor and advances the cursor
/// unconditionally, even if the returned target turns out unusable
/// downstream; callers re-pick in that case.
pub fn polling<'a>(targets: &'a [Target], params: &mut BalancerParams) -> Option<&'a Target> {
    if targets.is_empty() {
        return None;
    }
    if targets.len() == 1 {
        return targets.first();
    }
    let idx = params.current_index.min(targets.len() - 1);
    params.current_index = (idx + 1) % targets.len();
    targets.get(idx)
}

/// Linear scan for the target with the requested port.
pub fn specify<'a>(targets: &'a [Target], port: Option<u16>) -> Option<&'a Target> {
    let port = port?;
    targets.iter().find(|t| t.id == port)
}

/// Randomized weighted score, maximum wins.
///
/// Each target scores `weight + random() * weight_total`; the comparison is
/// `>=`, so equal scores favor the later-scanned element. That asymmetry is
/// deliberate and differs from [`minimum_connection`].
pub fn weights<'a>(targets: &'a [Target], weight_total: u32) -> Option<&'a Target> {
    if targets.len() < 2 {
        return targets.first();
    }
    let mut rng = rand::thread_rng();
    let mut best: Option<(&Target, f64)> = None;
    for target in targets {
        let score = target.weight as f64 + rng.gen::<f64>() * weight_total as f64;
        match best {
            Some((_, top)) if score < top => {}
            _ => best = Some((target, score)),
        }
    }
    best.map(|(t, _)| t)
}

/// Single weighted draw: pull `r` in `0..=weight_total`, walk targets
/// subtracting weights, return the first target that drives `r` to zero or
/// below.
pub fn weights_random<'a>(targets: &'a [Target], weight_total: u32) -> Option<&'a Target> {
    if targets.len() < 2 {
        return targets.first();
    }
    let mut r = (rand::thread_rng().gen::<f64>() * weight_total as f64).ceil() as i64;
    for target in targets {
        r -= target.weight as i64;
        if r <= 0 {
            return Some(target);
        }
    }
    targets.last()
}

/// Weight-proportional round-robin.
///
/// The cursor advances monotonically and wraps modulo `weight_total + 1`;
/// each pick walks the targets accumulating weight until the running sum
/// exceeds the cursor. The one slot per cycle past every cumulative sum
/// resolves to the last target so a healthy registry never yields nothing.
pub fn weights_polling<'a>(
    targets: &'a [Target],
    params: &mut BalancerParams,
) -> Option<&'a Target> {
    if targets.is_empty() {
        return None;
    }
    if targets.len() == 1 {
        return targets.first();
    }
    let cursor = params.weight_index;
    params.weight_index = (params.weight_index + 1) % (params.weight_total + 1);
    let mut acc = 0u32;
    for target in targets {
        acc += target.weight;
        if acc > cursor {
            return Some(target);
        }
    }
    targets.last()
}

/// Fewest active connections wins; missing entries count as zero.
///
/// The incumbent is kept on ties, so the earlier-scanned element wins, the
/// opposite tie-break of [`weights`]. Both are preserved as found.
pub fn minimum_connection<'a>(
    targets: &'a [Target],
    connections: &HashMap<u16, u32>,
) -> Option<&'a Target> {
    if targets.len() < 2 {
        return targets.first();
    }
    let mut best: Option<(&Target, u32)> = None;
    for target in targets {
        let count = connections.get(&target.id).copied().unwrap_or(0);
        match best {
            Some((_, low)) if low <= count => {}
            _ => best = Some((target, count)),
        }
    }
    best.map(|(t, _)| t)
}

/// Weighted score penalized by each target's share of active connections;
/// the minimum score wins.
pub fn weights_minimum_connection<'a>(
    targets: &'a [Target],
    params: &BalancerParams,
) -> Option<&'a Target> {
    if targets.len() < 2 {
        return targets.first();
    }
    let total_connections: u32 = params.connections.values().sum();
    let weight_total = params.weight_total as f64;
    let mut rng = rand::thread_rng();
    let mut best: Option<(&Target, f64)> = None;
    for target in targets {
        let count = params.connections.get(&target.id).copied().unwrap_or(0) as f64;
        let penalty = if total_connections == 0 {
            0.0
        } else {
            count * weight_total / total_connections as f64
        };
        let score = target.weight as f64 + rng.gen::<f64>() * weight_total + penalty;
        match best {
            Some((_, low)) if low <= score => {}
            _ => best = Some((target, score)),
        }
    }
    best.map(|(t, _)| t)
}
