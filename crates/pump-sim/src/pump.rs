//! The pump state machine and thermal model.
//!
//! Primary states: off -> cooling -> cold, with a regen cycle reachable
//! from cold.  Regen phases run warming -> extended_purge -> roughing ->
//! rate_of_rise -> cooling, with bounded retries from rate_of_rise back to
//! extended_purge and abort codes on timeouts.
//!
//! Invariants:
//! - temperatures clamp to [4 K, 320 K];
//! - heaters are on during warming/purge/roughing/rate_of_rise and off
//!   during regen cooling;
//! - a regen that reaches rate_of_rise retries at most `max_ror_retries`
//!   times before aborting with error `E`.

use thiserror::Error;
use tracing::debug;

use crate::config::PumpConfig;
use crate::{
    REGEN_ERR_ABORTED, REGEN_ERR_ROR_RETRIES, REGEN_ERR_ROUGHING_TIMEOUT,
    REGEN_ERR_WARMING_TIMEOUT, REGEN_OK,
};

const MIN_TEMP_K: f64 = 4.0;
const MAX_TEMP_K: f64 = 320.0;
/// Bounded noise amplitude on each temperature step, Kelvin.
const NOISE_K: f64 = 0.05;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationalState {
    Off,
    Cooling,
    Cold,
    Regen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegenPhase {
    None,
    Warming,
    ExtendedPurge,
    Roughing,
    RateOfRise,
    Cooling,
}

impl RegenPhase {
    /// The `get_regen_step` readout digit.
    pub fn step(self) -> u8 {
        match self {
            RegenPhase::None => 0,
            RegenPhase::Warming => 1,
            RegenPhase::ExtendedPurge => 2,
            RegenPhase::Roughing => 3,
            RegenPhase::RateOfRise => 4,
            RegenPhase::Cooling => 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Command errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown pump command '{0}'")]
    Unknown(String),
    #[error("command '{0}' rejected: {1}")]
    Rejected(&'static str, &'static str),
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PumpSimulator {
    cfg: PumpConfig,
    state: OperationalState,
    phase: RegenPhase,
    regen_error: char,
    retries: u32,
    heaters_on: bool,
    rough_valve_open: bool,
    purge_valve_open: bool,
    first_stage_k: f64,
    second_stage_k: f64,
    pressure_microns: f64,
    /// Seconds spent in the current regen phase.
    phase_elapsed_s: f64,
    /// Pressure at the start of the current rate-of-rise interval.
    ror_start_microns: f64,
    operating_seconds: f64,
    rng_state: u64,
}

impl PumpSimulator {
    pub fn new(cfg: PumpConfig) -> Self {
        let ambient = cfg.ambient_k;
        let seed = cfg.seed;
        PumpSimulator {
            cfg,
            state: OperationalState::Off,
            phase: RegenPhase::None,
            regen_error: REGEN_OK,
            retries: 0,
            heaters_on: false,
            rough_valve_open: false,
            purge_valve_open: false,
            first_stage_k: ambient,
            second_stage_k: ambient,
            pressure_microns: 760_000.0,
            phase_elapsed_s: 0.0,
            ror_start_microns: 0.0,
            operating_seconds: 0.0,
            rng_state: seed.wrapping_mul(0x9E3779B97F4A7C15).max(1),
        }
    }

    /// Start a simulator already at base temperature in the `cold` state.
    pub fn cold(cfg: PumpConfig) -> Self {
        let mut sim = PumpSimulator::new(cfg);
        sim.state = OperationalState::Cold;
        sim.first_stage_k = sim.cfg.first_stage_target_k;
        sim.second_stage_k = sim.cfg.second_stage_target_k;
        sim.pressure_microns = 0.1;
        sim
    }

    // -----------------------------------------------------------------------
    // Readouts
    // -----------------------------------------------------------------------

    pub fn state(&self) -> OperationalState {
        self.state
    }

    pub fn phase(&self) -> RegenPhase {
        self.phase
    }

    pub fn regen_error(&self) -> char {
        self.regen_error
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn first_stage_k(&self) -> f64 {
        self.first_stage_k
    }

    pub fn second_stage_k(&self) -> f64 {
        self.second_stage_k
    }

    pub fn pressure_microns(&self) -> f64 {
        self.pressure_microns
    }

    pub fn operating_hours(&self) -> u64 {
        (self.operating_seconds / 3600.0) as u64
    }

    pub fn heaters_on(&self) -> bool {
        self.heaters_on
    }

    /// Status byte 1: pump on, rough valve, purge valve, cryo thermocouple,
    /// power — one bit each, low to high.
    pub fn status_byte_1(&self) -> u8 {
        let pump_on = self.state != OperationalState::Off;
        let cryo_tc = self.second_stage_k < 30.0;
        let mut byte = 0u8;
        if pump_on {
            byte |= 0x01;
        }
        if self.rough_valve_open {
            byte |= 0x02;
        }
        if self.purge_valve_open {
            byte |= 0x04;
        }
        if cryo_tc {
            byte |= 0x08;
        }
        byte |= 0x10; // power present
        byte
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Execute one pump command; returns the device's response text.
    pub fn handle_command(&mut self, command: &str) -> Result<String, CommandError> {
        match command {
            "pump_on" => {
                if self.state == OperationalState::Off {
                    self.state = OperationalState::Cooling;
                    self.regen_error = REGEN_OK;
                    debug!("pump on, cooling");
                }
                Ok("OK".to_owned())
            }
            "pump_off" => {
                if self.state == OperationalState::Regen {
                    self.abort_regen(REGEN_ERR_ABORTED);
                }
                self.state = OperationalState::Off;
                self.heaters_on = false;
                self.rough_valve_open = false;
                self.purge_valve_open = false;
                debug!("pump off");
                Ok("OK".to_owned())
            }
            "pump_status" => Ok(if self.state == OperationalState::Off {
                "0".to_owned()
            } else {
                "1".to_owned()
            }),
            "start_regen" => {
                if self.state != OperationalState::Cold {
                    return Err(CommandError::Rejected(
                        "start_regen",
                        "pump must be cold to start regeneration",
                    ));
                }
                self.state = OperationalState::Regen;
                self.enter_phase(RegenPhase::Warming);
                self.regen_error = REGEN_OK;
                self.retries = 0;
                self.pressure_microns = self.cfg.initial_pressure_microns;
                debug!("regen started");
                Ok("OK".to_owned())
            }
            "abort_regen" => {
                if self.state == OperationalState::Regen {
                    self.abort_regen(REGEN_ERR_ABORTED);
                }
                Ok("OK".to_owned())
            }
            "get_regen_step" => Ok(self.phase.step().to_string()),
            "regen_error" => Ok(self.regen_error.to_string()),
            "get_first_stage_temp" => Ok(format!("{:.0}", self.first_stage_k)),
            "get_second_stage_temp" => Ok(format!("{:.0}", self.second_stage_k)),
            "get_pressure" => Ok(format!("{:.1}", self.pressure_microns)),
            "status_byte_1" => Ok(self.status_byte_1().to_string()),
            "operating_hours" => Ok(self.operating_hours().to_string()),
            other => Err(CommandError::Unknown(other.to_owned())),
        }
    }

    // -----------------------------------------------------------------------
    // Time evolution
    // -----------------------------------------------------------------------

    /// Advance the model by `dt` seconds.
    pub fn tick(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        if self.state != OperationalState::Off {
            self.operating_seconds += dt;
        }
        if self.phase != RegenPhase::None {
            self.phase_elapsed_s += dt;
        }

        self.step_temperatures(dt);
        self.step_pressure(dt);
        self.step_machine();
    }

    fn step_temperatures(&mut self, dt: f64) {
        let (first_target, second_target) = match (self.state, self.phase) {
            (OperationalState::Off, _) => (self.cfg.ambient_k, self.cfg.ambient_k),
            (OperationalState::Cooling, _) | (OperationalState::Cold, _) => (
                self.cfg.first_stage_target_k,
                self.cfg.second_stage_target_k,
            ),
            (OperationalState::Regen, RegenPhase::Cooling) => (
                self.cfg.first_stage_target_k,
                self.cfg.second_stage_target_k,
            ),
            // Heaters drive both stages toward the warmup target.
            (OperationalState::Regen, _) => (self.cfg.warmup_target_k, self.cfg.warmup_target_k),
        };
        let tau = if self.heaters_on {
            self.cfg.warmup_tau_s
        } else {
            self.cfg.cooldown_tau_s
        };
        let alpha = 1.0 - (-dt / tau).exp();
        self.first_stage_k += (first_target - self.first_stage_k) * alpha + self.noise();
        self.second_stage_k += (second_target - self.second_stage_k) * alpha + self.noise();
        self.first_stage_k = self.first_stage_k.clamp(MIN_TEMP_K, MAX_TEMP_K);
        self.second_stage_k = self.second_stage_k.clamp(MIN_TEMP_K, MAX_TEMP_K);
    }

    fn step_pressure(&mut self, dt: f64) {
        match self.phase {
            RegenPhase::Roughing => {
                // Roughing pump pulls the chamber down exponentially.
                self.pressure_microns *= (-dt / self.cfg.roughing_tau_s).exp();
            }
            RegenPhase::RateOfRise => {
                // Valves closed; outgassing raises pressure linearly.
                self.pressure_microns += self.cfg.ror_rise_rate * dt;
            }
            _ => {}
        }
    }

    fn step_machine(&mut self) {
        match (self.state, self.phase) {
            (OperationalState::Cooling, _) => {
                if self.first_stage_k < 70.0 && self.second_stage_k < 20.0 {
                    self.state = OperationalState::Cold;
                    debug!("cold");
                }
            }
            (OperationalState::Regen, RegenPhase::Warming) => {
                if (self.second_stage_k - self.cfg.warmup_target_k).abs() <= 1.0 {
                    self.enter_phase(RegenPhase::ExtendedPurge);
                } else if self.phase_elapsed_s >= self.cfg.warming_timeout_s {
                    self.abort_regen(REGEN_ERR_WARMING_TIMEOUT);
                }
            }
            (OperationalState::Regen, RegenPhase::ExtendedPurge) => {
                if self.phase_elapsed_s >= self.cfg.purge_duration_s {
                    self.enter_phase(RegenPhase::Roughing);
                }
            }
            (OperationalState::Regen, RegenPhase::Roughing) => {
                if self.pressure_microns <= self.cfg.rough_target_microns {
                    self.enter_phase(RegenPhase::RateOfRise);
                } else if self.phase_elapsed_s >= self.cfg.roughing_timeout_s {
                    self.abort_regen(REGEN_ERR_ROUGHING_TIMEOUT);
                }
            }
            (OperationalState::Regen, RegenPhase::RateOfRise) => {
                if self.phase_elapsed_s >= self.cfg.ror_interval_s {
                    let rise = self.pressure_microns - self.ror_start_microns;
                    if rise <= self.cfg.ror_limit_microns {
                        self.enter_phase(RegenPhase::Cooling);
                    } else if self.retries < self.cfg.max_ror_retries {
                        self.retries += 1;
                        debug!(retries = self.retries, rise, "rate of rise exceeded, retrying");
                        self.enter_phase(RegenPhase::ExtendedPurge);
                    } else {
                        self.abort_regen(REGEN_ERR_ROR_RETRIES);
                    }
                }
            }
            (OperationalState::Regen, RegenPhase::Cooling) => {
                if self.second_stage_k < self.cfg.cooldown_handoff_k {
                    self.phase = RegenPhase::None;
                    self.state = OperationalState::Cooling;
                    debug!("regen complete, cooling");
                }
            }
            _ => {}
        }
    }

    fn enter_phase(&mut self, phase: RegenPhase) {
        self.phase = phase;
        self.phase_elapsed_s = 0.0;
        match phase {
            RegenPhase::Warming => {
                self.heaters_on = true;
                self.rough_valve_open = false;
                self.purge_valve_open = false;
            }
            RegenPhase::ExtendedPurge => {
                self.heaters_on = true;
                self.rough_valve_open = false;
                self.purge_valve_open = true;
            }
            RegenPhase::Roughing => {
                self.heaters_on = true;
                self.rough_valve_open = true;
                self.purge_valve_open = false;
            }
            RegenPhase::RateOfRise => {
                self.heaters_on = true;
                self.rough_valve_open = false;
                self.purge_valve_open = false;
                self.ror_start_microns = self.pressure_microns;
            }
            RegenPhase::Cooling => {
                self.heaters_on = false;
                self.rough_valve_open = false;
                self.purge_valve_open = false;
            }
            RegenPhase::None => {
                self.heaters_on = false;
                self.rough_valve_open = false;
                self.purge_valve_open = false;
            }
        }
        debug!(step = phase.step(), "regen phase");
    }

    fn abort_regen(&mut self, code: char) {
        self.regen_error = code;
        self.phase = RegenPhase::None;
        self.heaters_on = false;
        self.rough_valve_open = false;
        self.purge_valve_open = false;
        // The pump stays on after an abort; it heads back toward cold.
        if self.state == OperationalState::Regen {
            self.state = OperationalState::Cooling;
        }
        debug!(code = %code, "regen aborted");
    }

    /// Bounded noise in [-NOISE_K, +NOISE_K], from a seeded LCG.
    fn noise(&mut self) -> f64 {
        // LCG constants from Numerical Recipes.
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let unit = (self.rng_state >> 11) as f64 / (1u64 << 53) as f64;
        (unit * 2.0 - 1.0) * NOISE_K
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
