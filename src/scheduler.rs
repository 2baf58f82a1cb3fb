//! Dispatch from the configured algorithm to its selection function.

use std::str::FromStr;

use crate::algorithms::{self, Algorithm};
use crate::balancer::{BalancerParams, Target};
use crate::error::BalanceError;

/// Holds the active algorithm and forwards selection to it.
///
/// The dispatch is an exhaustive match, so adding or removing an algorithm
/// is a compile-time-checked change.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler {
    algorithm: Algorithm,
}

impl Scheduler {
    pub fn new(algorithm: Algorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn set_algorithm(&mut self, algorithm: Algorithm) {
        self.algorithm = algorithm;
    }

    /// Validate and set an algorithm by identifier string. The error message
    /// enumerates the valid identifiers.
    pub fn set_algorithm_str(&mut self, name: &str) -> Result<(), BalanceError> {
        self.algorithm = Algorithm::from_str(name)?;
        Ok(())
    }

    /// Pick one target from the slice, resolving the parameter tuple the
    /// active algorithm needs from `params`. Cursor side effects (polling
    /// and weighted-polling) land back in `params`.
    pub fn calculate<'a>(
        &self,
        targets: &'a [Target],
        params: &mut BalancerParams,
    ) -> Option<&'a Target> {
        match self.algorithm {
            Algorithm::Polling => algorithms::polling(targets, params),
            Algorithm::Random => algorithms::random(targets),
            Algorithm::Specify => algorithms::specify(targets, params.specified_port),
            Algorithm::Weights => algorithms::weights(targets, params.weight_total),
            Algorithm::WeightsRandom => algorithms::weights_random(targets, params.weight_total),
            Algorithm::WeightsPolling => algorithms::weights_polling(targets, params),
            Algorithm::MinimumConnection => {
                algorithms::minimum_connection(targets, &params.connections)
            }
            Algorithm::WeightsMinimumConnection => {
                algorithms::weights_minimum_connection(targets, params)
            }
        }
    }
}
