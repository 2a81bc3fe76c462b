//! Simulator configuration.
//!
//! Defaults approximate a real pump (minutes-long phases); `accelerated()`
//! compresses the cycle to sub-second phases for CI.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Deterministic RNG seed for the bounded temperature noise.
    pub seed: u64,
    /// Ambient temperature in Kelvin.
    pub ambient_k: f64,
    /// Cold-head targets while cooling.
    pub first_stage_target_k: f64,
    pub second_stage_target_k: f64,
    /// Warmup target for regen.
    pub warmup_target_k: f64,
    /// Time constant of cooldown (seconds to ~63% of the step).
    pub cooldown_tau_s: f64,
    /// Time constant of warmup with heaters on.
    pub warmup_tau_s: f64,
    /// Warming phase aborts with error `B` after this long.
    pub warming_timeout_s: f64,
    /// Extended-purge phase duration.
    pub purge_duration_s: f64,
    /// Roughing must reach `rough_target_microns` within this long (else `G`).
    pub roughing_timeout_s: f64,
    /// Roughing pressure decay time constant.
    pub roughing_tau_s: f64,
    /// Base pressure the roughing pump must reach, in microns.
    pub rough_target_microns: f64,
    /// Rate-of-rise measurement interval.
    pub ror_interval_s: f64,
    /// Maximum acceptable pressure rise over one interval, microns.
    pub ror_limit_microns: f64,
    /// Pressure rise rate during rate-of-rise, microns per second.
    pub ror_rise_rate: f64,
    /// Retries (back to extended purge) before aborting with `E`.
    pub max_ror_retries: u32,
    /// During regen cooling, hand back to operational cooling once the
    /// second stage drops below this.
    pub cooldown_handoff_k: f64,
    /// Starting chamber pressure when regen begins, microns.
    pub initial_pressure_microns: f64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        PumpConfig {
            seed: 1,
            ambient_k: 295.0,
            first_stage_target_k: 32.0,
            second_stage_target_k: 11.0,
            warmup_target_k: 310.0,
            cooldown_tau_s: 900.0,
            warmup_tau_s: 600.0,
            warming_timeout_s: 3600.0,
            purge_duration_s: 900.0,
            roughing_timeout_s: 1800.0,
            roughing_tau_s: 120.0,
            rough_target_microns: 50.0,
            ror_interval_s: 60.0,
            ror_limit_microns: 10.0,
            ror_rise_rate: 0.05,
            max_ror_retries: 3,
            cooldown_handoff_k: 200.0,
            initial_pressure_microns: 5000.0,
        }
    }
}

impl PumpConfig {
    /// Compressed phase timing for tests: a full regen completes in a few
    /// hundred simulated seconds.
    pub fn accelerated() -> Self {
        PumpConfig {
            cooldown_tau_s: 5.0,
            warmup_tau_s: 4.0,
            warming_timeout_s: 120.0,
            purge_duration_s: 10.0,
            roughing_timeout_s: 60.0,
            roughing_tau_s: 3.0,
            ror_interval_s: 5.0,
            ..Default::default()
        }
    }
}
