#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::cast_possible_truncation)]

//! Cavity auto-tuning: rough search for the resonance with the stepper motor, followed by a
//! hill-climbing fine tune on the diode voltage.

mod servo;

use std::time::Duration;

use chrono::{DateTime, Local};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use servo::FineTuneServo;

use crate::geometry::{CavityGeometry, ModeError};
use crate::hardware::{CavitySynth, EdgeFlag, HardwareFault, MotorPort, SweepPeak, SweepResponse};

#[derive(Debug, Error)]
pub enum TunerError {
    #[error("hardware fault while tuning: {0}")]
    Hardware(#[from] HardwareFault),
    #[error(transparent)]
    Geometry(#[from] ModeError),
    #[error("the cavity has not been tuned yet")]
    NotTuned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunePhase {
    #[default]
    Idle,
    RoughTuning,
    FineTuning,
    Done {
        success: bool,
    },
}

/// What the tuner remembers about the last successful tune.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CavityState {
    pub last_freq_mhz: f64,
    pub last_mode: u32,
    pub last_attenuation_db: f64,
    pub last_peak_mv: i32,
    pub last_width_ticks: i32,
    pub last_tuned: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuneOutcome {
    pub success: bool,
    pub voltage_mv: i32,
    pub mode: u32,
    pub can_tune_up: bool,
    pub can_tune_down: bool,
}

#[derive(Debug, Clone)]
pub struct TunerConfig {
    pub skip_rough_mhz: f64,
    pub skip_fine_mhz: f64,
    pub skip_voltage_fraction: f64,

    pub rough_start_offset_ticks: i32,
    pub lower_edge_shift_ticks: i32,
    pub upper_edge_shift_ticks: i32,
    pub max_edge_shifts: u32,
    pub blind_step_ticks: i32,
    pub max_rough_attempts: u32,
    pub max_rough_attempts_high_freq: u32,

    pub high_freq_mhz: f64,
    pub relaxed_threshold_mhz: f64,
    pub kick_ticks: i32,

    pub cal_freq_mhz: f64,
    pub cal_mode: u32,
    /// Centre of the calibration blind search; the reference mode guess when unset.
    pub cal_search_center_ticks: Option<i32>,
    pub cal_search_offsets: u32,
    pub home_timeout: Duration,
}

impl Default for TunerConfig {
    fn default() -> Self {
        TunerConfig {
            skip_rough_mhz: 0.5,
            skip_fine_mhz: 0.1,
            skip_voltage_fraction: 0.9,
            rough_start_offset_ticks: 500,
            lower_edge_shift_ticks: -1333,
            upper_edge_shift_ticks: -667,
            max_edge_shifts: 5,
            blind_step_ticks: 1000,
            max_rough_attempts: 10,
            max_rough_attempts_high_freq: 2,
            high_freq_mhz: 40_000.0,
            relaxed_threshold_mhz: 41_000.0,
            kick_ticks: 50,
            cal_freq_mhz: 10_030.0,
            cal_mode: 33,
            cal_search_center_ticks: None,
            cal_search_offsets: 40,
            home_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FineTuneResult {
    converged: bool,
    voltage_mv: i32,
}

/// Tuner for the Fabry-Perot cavity. Not re-entrant: one tune or calibration runs at a time, and
/// the hardware handle is lent for the duration of the call.
pub struct CavityTuner {
    geometry: CavityGeometry,
    config: TunerConfig,
    servo: FineTuneServo,
    state: Option<CavityState>,
    phase: TunePhase,
    rng: StdRng,
}

impl CavityTuner {
    #[must_use]
    pub fn new(geometry: CavityGeometry, config: TunerConfig, servo: FineTuneServo) -> Self {
        CavityTuner {
            geometry,
            config,
            servo,
            state: None,
            phase: TunePhase::Idle,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a fixed seed for the random kicks.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    #[inline]
    #[must_use]
    pub fn geometry(&self) -> &CavityGeometry {
        &self.geometry
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> Option<&CavityState> {
        self.state.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn phase(&self) -> TunePhase {
        self.phase
    }

    /// Forget the last tune so the next one starts with a full rough tune.
    pub fn invalidate(&mut self) {
        self.state = None;
    }

    /// Tune the cavity to `freq_mhz`.
    ///
    /// Convergence failures come back as `Ok` with `success == false`.
    ///
    /// # Errors
    /// Hardware faults abort immediately; an unreachable frequency/mode is a geometry error.
    pub fn tune<H: MotorPort + CavitySynth>(
        &mut self,
        hw: &mut H,
        freq_mhz: f64,
        attenuation_db: f64,
        mode: Option<u32>,
    ) -> Result<TuneOutcome, TunerError> {
        let (guess, mode) = self.geometry.rough_tune_guess(freq_mhz, mode)?;
        let mut outcome = TuneOutcome {
            success: false,
            voltage_mv: 0,
            mode,
            can_tune_up: self.geometry.is_mode_valid(freq_mhz, mode + 1),
            can_tune_down: self.geometry.is_mode_valid(freq_mhz, mode - 1),
        };
        debug!(freq_mhz, mode, guess, "tune requested");

        hw.set_cavity_frequency(freq_mhz)
            .and_then(|()| hw.go_to_cavity_delta_frequency(0.0))
            .map_err(|e| self.fail(e))?;

        match self.tune_at(hw, freq_mhz, attenuation_db, guess, mode) {
            Ok(Some((voltage_mv, width_ticks))) => {
                outcome.success = true;
                outcome.voltage_mv = voltage_mv;
                self.remember(freq_mhz, mode, attenuation_db, voltage_mv, width_ticks);
                info!("cavity tuned to {freq_mhz:.3} MHz (mode {mode}), {voltage_mv} mV");
            }
            Ok(None) => {
                outcome.voltage_mv = read_voltage(hw).map_err(|e| self.fail(e))?;
                warn!("could not tune cavity to {freq_mhz:.3} MHz (mode {mode})");
            }
            Err(e) => return Err(self.fail(e)),
        }
        self.phase = TunePhase::Done {
            success: outcome.success,
        };
        Ok(outcome)
    }

    /// Re-tune the last frequency one mode higher.
    /// # Errors
    /// `NotTuned` without a previous tune, otherwise as [`CavityTuner::tune`].
    pub fn tune_up<H: MotorPort + CavitySynth>(
        &mut self,
        hw: &mut H,
        attenuation_db: f64,
    ) -> Result<TuneOutcome, TunerError> {
        let last = self.state.ok_or(TunerError::NotTuned)?;
        self.tune(hw, last.last_freq_mhz, attenuation_db, Some(last.last_mode + 1))
    }

    /// Re-tune the last frequency one mode lower.
    /// # Errors
    /// `NotTuned` without a previous tune, otherwise as [`CavityTuner::tune`].
    pub fn tune_down<H: MotorPort + CavitySynth>(
        &mut self,
        hw: &mut H,
        attenuation_db: f64,
    ) -> Result<TuneOutcome, TunerError> {
        let last = self.state.ok_or(TunerError::NotTuned)?;
        let mode = last.last_mode.checked_sub(1).ok_or(ModeError::InvalidMode)?;
        self.tune(hw, last.last_freq_mhz, attenuation_db, Some(mode))
    }

    /// Home the mirror, then find and peak up the reference mode.
    ///
    /// # Errors
    /// Hardware faults, including failure to reach the home switch in time.
    pub fn calibrate<H: MotorPort + CavitySynth>(
        &mut self,
        hw: &mut H,
        attenuation_db: f64,
    ) -> Result<TuneOutcome, TunerError> {
        let freq_mhz = self.config.cal_freq_mhz;
        let (guess, mode) = self
            .geometry
            .rough_tune_guess(freq_mhz, Some(self.config.cal_mode))?;
        let mut outcome = TuneOutcome {
            success: false,
            voltage_mv: 0,
            mode,
            can_tune_up: self.geometry.is_mode_valid(freq_mhz, mode + 1),
            can_tune_down: self.geometry.is_mode_valid(freq_mhz, mode - 1),
        };
        info!("calibrating cavity on mode {mode} at {freq_mhz:.3} MHz");

        match self.calibrate_at(hw, freq_mhz, attenuation_db, guess, mode) {
            Ok(Some((voltage_mv, width_ticks))) => {
                outcome.success = true;
                outcome.voltage_mv = voltage_mv;
                self.remember(freq_mhz, mode, attenuation_db, voltage_mv, width_ticks);
                info!("calibration complete, {voltage_mv} mV");
            }
            Ok(None) => {
                warn!("calibration failed: reference mode {mode} not found");
            }
            Err(e) => return Err(self.fail(e)),
        }
        self.phase = TunePhase::Done {
            success: outcome.success,
        };
        Ok(outcome)
    }

    fn fail<E: Into<TunerError>>(&mut self, e: E) -> TunerError {
        self.phase = TunePhase::Done { success: false };
        e.into()
    }

    fn remember(
        &mut self,
        freq_mhz: f64,
        mode: u32,
        attenuation_db: f64,
        peak_mv: i32,
        width_ticks: i32,
    ) {
        self.state = Some(CavityState {
            last_freq_mhz: freq_mhz,
            last_mode: mode,
            last_attenuation_db: attenuation_db,
            last_peak_mv: peak_mv,
            last_width_ticks: width_ticks,
            last_tuned: Local::now(),
        });
    }

    /// Returns the peak voltage and width on success.
    fn tune_at<H: MotorPort + CavitySynth>(
        &mut self,
        hw: &mut H,
        freq_mhz: f64,
        attenuation_db: f64,
        guess: i32,
        mode: u32,
    ) -> Result<Option<(i32, i32)>, TunerError> {
        let nearby = self.state.filter(|s| {
            s.last_mode == mode && (freq_mhz - s.last_freq_mhz).abs() < self.config.skip_rough_mhz
        });

        if let Some(last) = nearby {
            self.phase = TunePhase::FineTuning;
            if (freq_mhz - last.last_freq_mhz).abs() < self.config.skip_fine_mhz
                && (attenuation_db - last.last_attenuation_db).abs() < f64::EPSILON
            {
                let voltage_mv = read_voltage(hw)?;
                if f64::from(voltage_mv)
                    >= self.config.skip_voltage_fraction * f64::from(last.last_peak_mv)
                {
                    debug!("skipping tune, {voltage_mv} mV still on peak");
                    return Ok(Some((voltage_mv, last.last_width_ticks)));
                }
            }

            let target = rescale_for_attenuation(
                last.last_peak_mv,
                last.last_attenuation_db,
                attenuation_db,
            );
            let fine = self.fine_tune(
                hw,
                freq_mhz,
                mode,
                target,
                last.last_width_ticks,
                attenuation_db,
            )?;
            if fine.converged {
                return Ok(Some((fine.voltage_mv, last.last_width_ticks)));
            }
            let kick = self.random_kick();
            debug!("fine tune did not settle, kicking mirror {kick} ticks");
            hw.step_relative(kick)?;
            let fine = self.fine_tune(
                hw,
                freq_mhz,
                mode,
                target,
                last.last_width_ticks,
                attenuation_db,
            )?;
            if fine.converged {
                return Ok(Some((fine.voltage_mv, last.last_width_ticks)));
            }
            debug!("falling back to a full rough tune");
        }

        let Some(peak) = self.rough_tune(hw, freq_mhz, guess)? else {
            warn!("no cavity mode found near {freq_mhz:.3} MHz; the cavity may need recalibration");
            return Ok(None);
        };
        self.peak_up(hw, freq_mhz, mode, &peak, attenuation_db)
    }

    fn calibrate_at<H: MotorPort + CavitySynth>(
        &mut self,
        hw: &mut H,
        freq_mhz: f64,
        attenuation_db: f64,
        guess: i32,
        mode: u32,
    ) -> Result<Option<(i32, i32)>, TunerError> {
        self.phase = TunePhase::RoughTuning;
        hw.find_home(self.config.home_timeout)?;
        hw.set_cavity_frequency(freq_mhz)?;
        hw.go_to_cavity_delta_frequency(0.0)?;

        hw.move_to_absolute(guess - self.config.rough_start_offset_ticks)?;
        let mut found = self.sweep_window(hw)?;
        if found.is_none() {
            let center = self.config.cal_search_center_ticks.unwrap_or(guess);
            debug!("reference mode not at {guess}, searching around {center}");
            for attempt in 1..=self.config.cal_search_offsets {
                let start = center - self.config.rough_start_offset_ticks
                    + blind_offset(attempt, self.config.blind_step_ticks);
                hw.move_to_absolute(start)?;
                found = self.sweep_window(hw)?;
                if found.is_some() {
                    break;
                }
            }
        }
        let Some(peak) = found else {
            return Ok(None);
        };
        hw.move_to_absolute(peak.location_ticks)?;
        self.peak_up(hw, freq_mhz, mode, &peak, attenuation_db)
    }

    /// Fine tune from a rough-tune peak, retrying once from the peak location.
    fn peak_up<H: MotorPort + CavitySynth>(
        &mut self,
        hw: &mut H,
        freq_mhz: f64,
        mode: u32,
        peak: &SweepPeak,
        attenuation_db: f64,
    ) -> Result<Option<(i32, i32)>, TunerError> {
        let target = f64::from(peak.max_voltage_mv);
        for attempt in 0..2 {
            if attempt > 0 {
                debug!("returning to rough tune peak at {}", peak.location_ticks);
                hw.move_to_absolute(peak.location_ticks)?;
            }
            let fine = self.fine_tune(
                hw,
                freq_mhz,
                mode,
                target,
                peak.width_ticks,
                attenuation_db,
            )?;
            if fine.converged {
                return Ok(Some((fine.voltage_mv, peak.width_ticks)));
            }
        }
        Ok(None)
    }

    /// Search for the resonance near `guess`, widening the search window if the first sweep
    /// finds nothing. On success the mirror is left on the peak.
    fn rough_tune<H: MotorPort + CavitySynth>(
        &mut self,
        hw: &mut H,
        freq_mhz: f64,
        guess: i32,
    ) -> Result<Option<SweepPeak>, TunerError> {
        self.phase = TunePhase::RoughTuning;
        let max_attempts = if freq_mhz > self.config.high_freq_mhz {
            self.config.max_rough_attempts_high_freq
        } else {
            self.config.max_rough_attempts
        };
        let start = guess - self.config.rough_start_offset_ticks;

        for attempt in 0..=max_attempts {
            let offset = blind_offset(attempt, self.config.blind_step_ticks);
            hw.move_to_absolute(start + offset)?;
            if let Some(peak) = self.sweep_window(hw)? {
                debug!(
                    "rough tune found {} mV peak at {} (attempt {attempt})",
                    peak.max_voltage_mv, peak.location_ticks
                );
                hw.move_to_absolute(peak.location_ticks)?;
                let settled = hw.read_encoder_position()?;
                if settled != peak.location_ticks {
                    warn!(
                        "mirror settled at {settled}, {} ticks from the rough tune peak",
                        settled - peak.location_ticks
                    );
                }
                return Ok(Some(peak));
            }
        }
        Ok(None)
    }

    /// Sweep from the current position, sliding the window while the peak sits on an edge.
    fn sweep_window<H: MotorPort>(&mut self, hw: &mut H) -> Result<Option<SweepPeak>, TunerError> {
        for _ in 0..=self.config.max_edge_shifts {
            let response: SweepResponse = hw.intermediate_tune_sweep()?.parse()?;
            let peak = match response {
                SweepResponse::Found(peak) if peak.max_voltage_mv > 0 => peak,
                SweepResponse::Found(_) | SweepResponse::NotFound => return Ok(None),
            };
            match peak.edge {
                EdgeFlag::Centered => return Ok(Some(peak)),
                EdgeFlag::NearLowerEdge => {
                    hw.step_relative(self.config.lower_edge_shift_ticks)?;
                }
                EdgeFlag::NearUpperEdge => {
                    hw.step_relative(self.config.upper_edge_shift_ticks)?;
                }
            }
        }
        Ok(None)
    }

    fn fine_tune<H: MotorPort + CavitySynth>(
        &mut self,
        hw: &mut H,
        freq_mhz: f64,
        mode: u32,
        target_mv: f64,
        width_ticks: i32,
        attenuation_db: f64,
    ) -> Result<FineTuneResult, TunerError> {
        self.phase = TunePhase::FineTuning;
        let half_width_mhz =
            0.5 * self
                .geometry
                .frequency_span_of_ticks(freq_mhz, mode, width_ticks.max(1))?;
        let fraction = if freq_mhz > self.config.relaxed_threshold_mhz {
            self.servo.relaxed_voltage_fraction
        } else {
            self.servo.voltage_fraction
        };
        let max_steps = self
            .servo
            .max_steps_for(freq_mhz > self.config.high_freq_mhz);
        self.servo.reset(width_ticks);

        let mut converged = false;
        let mut voltage_mv = 0;
        for step in 0..max_steps {
            hw.go_to_cavity_delta_frequency(-half_width_mhz)?;
            let minus = read_voltage(hw)?;
            hw.go_to_cavity_delta_frequency(half_width_mhz)?;
            let plus = read_voltage(hw)?;
            hw.go_to_cavity_delta_frequency(0.0)?;
            let center = read_voltage(hw)?;
            self.servo.observe(center);
            voltage_mv = center;
            debug!(step, minus, center, plus, "fine tune");

            if self
                .servo
                .is_converged(center, minus, plus, target_mv, fraction)
            {
                converged = true;
                break;
            }
            let ticks = self.servo.next_step(minus, plus);
            hw.step_relative(ticks)?;
        }
        if !converged {
            voltage_mv = read_voltage(hw)?;
        }

        if converged && attenuation_db > 0.0 && voltage_mv < self.servo.attenuated_floor_mv {
            debug!("{voltage_mv} mV is below the attenuated floor, not converged");
            converged = false;
        }
        Ok(FineTuneResult {
            converged,
            voltage_mv,
        })
    }

    fn random_kick(&mut self) -> i32 {
        let magnitude = self.config.kick_ticks.max(2);
        let ticks = self.rng.gen_range(magnitude / 2..=magnitude);
        if self.rng.gen_bool(0.5) {
            ticks
        } else {
            -ticks
        }
    }
}

/// Offset of the `attempt`-th blind search window: 0, +1, -1, +2, -2, ... steps.
fn blind_offset(attempt: u32, step_ticks: i32) -> i32 {
    if attempt == 0 {
        return 0;
    }
    let direction = if attempt % 2 == 1 { 1 } else { -1 };
    let distance = i32::try_from(attempt.div_ceil(2)).unwrap_or(i32::MAX / step_ticks.max(1));
    step_ticks * direction * distance
}

/// Expected peak voltage after the attenuation changed, for a square-law detector.
fn rescale_for_attenuation(peak_mv: i32, last_db: f64, now_db: f64) -> f64 {
    f64::from(peak_mv) * 10f64.powf((last_db - now_db) / 10.0)
}

fn read_voltage<H: MotorPort>(hw: &mut H) -> Result<i32, HardwareFault> {
    let voltage = hw.read_analog_voltage()?;
    if voltage < 0 {
        return Err(HardwareFault::InvalidReading(voltage));
    }
    Ok(voltage)
}
