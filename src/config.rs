//! Launch-time configuration read from the environment.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::world::MAX_PROCS;
use crate::{MPIError, Result};

pub const PROCS_ENV: &str = "VECSUM_PROCS";
pub const SEED_ENV: &str = "VECSUM_SEED";
pub const REDUCTION_ENV: &str = "VECSUM_REDUCTION";

const DEFAULT_PROCS: usize = 4;

/// How each rank's contribution to the grand total is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Reduction {
    /// Every rank contributes the sum of its own result chunk.
    #[default]
    PartialSums,
    /// The coordinator contributes the total of the assembled result and workers contribute
    /// zero, so the reduction only forwards a value the coordinator already holds.
    CoordinatorTotal,
}

impl FromStr for Reduction {
    type Err = MPIError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "partial" | "partial-sums" => Ok(Reduction::PartialSums),
            "coordinator" | "coordinator-total" => Ok(Reduction::CoordinatorTotal),
            other => Err(MPIError::ConfigError(format!(
                "{} must be `partial` or `coordinator`, got {:?}",
                REDUCTION_ENV, other
            ))),
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reduction::PartialSums => write!(f, "partial"),
            Reduction::CoordinatorTotal => write!(f, "coordinator"),
        }
    }
}

/// Settings fixed when the group is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    /// Number of processes in the group.
    pub procs: usize,
    /// Seed for operand generation; `None` seeds from the wall clock.
    pub seed: Option<u64>,
    pub reduction: Reduction,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self { procs: DEFAULT_PROCS, seed: None, reduction: Reduction::default() }
    }
}

impl GroupConfig {
    /// Read `VECSUM_PROCS`, `VECSUM_SEED` and `VECSUM_REDUCTION`, falling back to defaults for
    /// unset variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(procs) = lookup(PROCS_ENV) {
            config.procs = procs
                .trim()
                .parse()
                .map_err(|_| MPIError::ConfigError(format!("{} must be an integer, got {:?}", PROCS_ENV, procs)))?;
        }
        if config.procs == 0 || config.procs > MAX_PROCS {
            return Err(MPIError::ConfigError(format!(
                "{} must be in 1..={}, got {}",
                PROCS_ENV, MAX_PROCS, config.procs
            )));
        }

        if let Some(seed) = lookup(SEED_ENV) {
            let seed = seed
                .trim()
                .parse()
                .map_err(|_| MPIError::ConfigError(format!("{} must be a u64, got {:?}", SEED_ENV, seed)))?;
            config.seed = Some(seed);
        }

        if let Some(reduction) = lookup(REDUCTION_ENV) {
            config.reduction = reduction.parse()?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = GroupConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, GroupConfig::default());
        assert_eq!(config.procs, 4);
        assert_eq!(config.reduction, Reduction::PartialSums);
    }

    #[test]
    fn test_reads_all_variables() {
        let config = GroupConfig::from_lookup(lookup(&[
            (PROCS_ENV, "8"),
            (SEED_ENV, " 42 "),
            (REDUCTION_ENV, "Coordinator"),
        ]))
        .unwrap();
        assert_eq!(config.procs, 8);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.reduction, Reduction::CoordinatorTotal);
    }

    #[test]
    fn test_rejects_out_of_range_procs() {
        for procs in ["0", "33", "-1", "four"] {
            let result = GroupConfig::from_lookup(lookup(&[(PROCS_ENV, procs)]));
            assert!(matches!(result, Err(MPIError::ConfigError(_))), "{}", procs);
        }
    }

    #[test]
    fn test_rejects_bad_seed_and_reduction() {
        assert!(GroupConfig::from_lookup(lookup(&[(SEED_ENV, "x")])).is_err());
        assert!(GroupConfig::from_lookup(lookup(&[(REDUCTION_ENV, "max")])).is_err());
    }

    #[test]
    fn test_reduction_display_parses_back() {
        for reduction in [Reduction::PartialSums, Reduction::CoordinatorTotal] {
            assert_eq!(reduction.to_string().parse::<Reduction>().unwrap(), reduction);
        }
    }
}
