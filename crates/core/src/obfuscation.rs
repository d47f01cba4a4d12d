//! Low-cell masking and deterministic display noise for cohort counts.

use crate::constants::{
    DEFAULT_LOW_CELL_THRESHOLD, DEFAULT_NOISE_LOWER_BOUND, DEFAULT_NOISE_UPPER_BOUND,
};
use crate::hashing;
use crate::{LeafError, LeafResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

/// Privacy settings applied to every count leaving this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeidentificationConfig {
    low_cell_threshold: u64,
    noise_enabled: bool,
    noise_lower: i64,
    noise_upper: i64,
}

impl DeidentificationConfig {
    /// # Errors
    /// Returns `LeafError::InvalidInput` if `noise_lower` exceeds `noise_upper`.
    pub fn new(
        low_cell_threshold: u64,
        noise_enabled: bool,
        noise_lower: i64,
        noise_upper: i64,
    ) -> LeafResult<Self> {
        if noise_lower > noise_upper {
            return Err(LeafError::InvalidInput(format!(
                "noise lower bound {} exceeds upper bound {}",
                noise_lower, noise_upper
            )));
        }
        Ok(Self {
            low_cell_threshold,
            noise_enabled,
            noise_lower,
            noise_upper,
        })
    }

    pub fn low_cell_threshold(&self) -> u64 {
        self.low_cell_threshold
    }

    pub fn noise_enabled(&self) -> bool {
        self.noise_enabled
    }

    pub fn noise_bounds(&self) -> (i64, i64) {
        (self.noise_lower, self.noise_upper)
    }
}

impl Default for DeidentificationConfig {
    fn default() -> Self {
        Self {
            low_cell_threshold: DEFAULT_LOW_CELL_THRESHOLD,
            noise_enabled: true,
            noise_lower: DEFAULT_NOISE_LOWER_BOUND,
            noise_upper: DEFAULT_NOISE_UPPER_BOUND,
        }
    }
}

/// A count after masking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskedCount {
    pub value: u64,
    pub plus_minus: u64,
    pub within_low_cell_threshold: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Obfuscator {
    config: DeidentificationConfig,
}

impl Obfuscator {
    pub fn new(config: DeidentificationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DeidentificationConfig {
        &self.config
    }

    /// Mask `raw` for display.
    ///
    /// Counts below the threshold report the threshold itself. Otherwise, unless `exact` is
    /// set, a shift seeded from the sorted `concept_ids` is added, so the same logical query
    /// always receives the same shift regardless of panel or item order. A shifted value is
    /// never reported below the threshold.
    pub fn obfuscate(&self, raw: u64, concept_ids: &[Uuid], exact: bool) -> MaskedCount {
        let threshold = self.config.low_cell_threshold;
        if raw < threshold {
            return self.within_threshold();
        }
        if exact || !self.config.noise_enabled {
            return MaskedCount {
                value: raw,
                plus_minus: 0,
                within_low_cell_threshold: false,
            };
        }

        let shift = self.shift_for(concept_ids);
        let shifted = i128::from(raw) + i128::from(shift);
        let value = u64::try_from(shifted.max(0))
            .unwrap_or(u64::MAX)
            .max(threshold);
        MaskedCount {
            value,
            plus_minus: self.plus_minus(),
            within_low_cell_threshold: false,
        }
    }

    /// Apply low-cell masking only, as for merged federated totals.
    pub fn mask(&self, total: u64) -> MaskedCount {
        if total < self.config.low_cell_threshold {
            return self.within_threshold();
        }
        MaskedCount {
            value: total,
            plus_minus: 0,
            within_low_cell_threshold: false,
        }
    }

    fn within_threshold(&self) -> MaskedCount {
        MaskedCount {
            value: self.config.low_cell_threshold,
            plus_minus: 0,
            within_low_cell_threshold: true,
        }
    }

    fn plus_minus(&self) -> u64 {
        self.config
            .noise_lower
            .unsigned_abs()
            .max(self.config.noise_upper.unsigned_abs())
    }

    fn shift_for(&self, concept_ids: &[Uuid]) -> i64 {
        let mut sorted: Vec<String> = concept_ids.iter().map(Uuid::to_string).collect();
        sorted.sort();
        sorted.dedup();
        let seed = hashing::digest(
            std::iter::once("obfuscation".to_string()).chain(sorted),
        );
        let mut rng = StdRng::from_seed(seed);
        rng.gen_range(self.config.noise_lower..=self.config.noise_upper)
    }
}
