#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]

//! Software stand-ins for the spectrometer hardware: a cavity with a Lorentzian response on
//! every longitudinal mode, and a scan executor that tunes it and reports line intensities.

use std::f64::consts::PI;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::batch::{MeasurementResult, ScanDescriptor, ScanExecutor, ScanStatus};
use crate::geometry::{CavityGeometry, SPEED_OF_LIGHT};
use crate::hardware::{CavitySynth, HardwareFault, MotorPort};
use crate::tuner::{CavityTuner, TunerError};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub peak_mv: f64,
    pub half_width_mhz: f64,
    pub encoder_error_ticks: i32,
    /// Encoder error left over after homing.
    pub home_error_ticks: i32,
    pub seed: u64,
    pub line_tolerance_mhz: f64,
    /// Fraction of the signal left when a linked line is pumped.
    pub depletion: f64,
    pub lines: Vec<SimLine>,
    pub links: Vec<(f64, f64)>,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            peak_mv: 2000.0,
            half_width_mhz: 0.5,
            encoder_error_ticks: 0,
            home_error_ticks: 0,
            seed: 1,
            line_tolerance_mhz: 0.5,
            depletion: 0.2,
            lines: Vec::new(),
            links: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SimLine {
    pub freq_mhz: f64,
    pub intensity: f64,
}

/// Mirror, diode and cavity synthesizer.
#[derive(Debug, Clone)]
pub struct SimulatedCavity {
    geometry: CavityGeometry,
    pub position_ticks: i32,
    /// Physical position minus encoder reading.
    pub encoder_error_ticks: i32,
    pub home_error_ticks: i32,
    pub peak_mv: f64,
    pub half_width_mhz: f64,
    pub attenuation_db: f64,
    pub sweep_span_ticks: i32,
    pub sweep_sample_ticks: i32,
    /// Sweeps report "not found" below this fraction of the on-resonance voltage.
    pub detection_fraction: f64,
    pub home_reachable: bool,
    /// Every port call after this many fails with no response.
    pub fail_after: Option<usize>,
    cavity_freq_mhz: f64,
    delta_mhz: f64,
    pub calls: usize,
    pub sweeps: usize,
    pub steps: usize,
}

impl SimulatedCavity {
    #[must_use]
    pub fn new(geometry: CavityGeometry) -> Self {
        SimulatedCavity {
            geometry,
            position_ticks: 0,
            encoder_error_ticks: 0,
            home_error_ticks: 0,
            peak_mv: 2000.0,
            half_width_mhz: 0.5,
            attenuation_db: 0.0,
            sweep_span_ticks: 1000,
            sweep_sample_ticks: 4,
            detection_fraction: 0.05,
            home_reachable: true,
            fail_after: None,
            cavity_freq_mhz: 0.0,
            delta_mhz: 0.0,
            calls: 0,
            sweeps: 0,
            steps: 0,
        }
    }

    #[must_use]
    pub fn from_config(geometry: CavityGeometry, cfg: &SimConfig) -> Self {
        let mut out = SimulatedCavity::new(geometry);
        out.peak_mv = cfg.peak_mv;
        out.half_width_mhz = cfg.half_width_mhz;
        out.encoder_error_ticks = cfg.encoder_error_ticks;
        out.home_error_ticks = cfg.home_error_ticks;
        out
    }

    fn on_resonance_mv(&self) -> f64 {
        self.peak_mv * 10f64.powf(-self.attenuation_db / 10.0)
    }

    /// Diode voltage with the mirror at encoder position `ticks` and the synthesizer at `freq_mhz`.
    #[must_use]
    pub fn response_mv(&self, ticks: i32, freq_mhz: f64) -> f64 {
        let length = self
            .geometry
            .ticks_to_length(ticks.saturating_add(self.encoder_error_ticks));
        let g = 1.0 - length / self.geometry.mirror_radius_cm;
        if length <= 0.0 || !(-1.0..=1.0).contains(&g) || freq_mhz <= 0.0 {
            return 0.0;
        }
        let nearest = freq_mhz * 2.0 * length / SPEED_OF_LIGHT - g.acos() / PI;
        let lowest = (nearest.floor() as i64 - 1).max(1) as u32;
        let best = (lowest..=lowest + 3)
            .map(|q| {
                let detuning =
                    (freq_mhz - self.geometry.mode_frequency(length, q)) / self.half_width_mhz;
                1.0 / (1.0 + detuning * detuning)
            })
            .fold(0.0, f64::max);
        self.on_resonance_mv() * best
    }

    fn voltage_now(&self) -> f64 {
        self.response_mv(self.position_ticks, self.cavity_freq_mhz + self.delta_mhz)
    }

    fn call(&mut self, port: &'static str) -> Result<(), HardwareFault> {
        self.calls += 1;
        match self.fail_after {
            Some(n) if self.calls > n => Err(HardwareFault::NoResponse(port)),
            _ => Ok(()),
        }
    }
}

impl MotorPort for SimulatedCavity {
    fn move_to_absolute(&mut self, ticks: i32) -> Result<(), HardwareFault> {
        self.call("motor")?;
        self.position_ticks = ticks;
        Ok(())
    }

    fn step_relative(&mut self, ticks: i32) -> Result<(), HardwareFault> {
        self.call("motor")?;
        self.position_ticks = self.position_ticks.saturating_add(ticks);
        self.steps += 1;
        Ok(())
    }

    fn read_encoder_position(&mut self) -> Result<i32, HardwareFault> {
        self.call("motor")?;
        Ok(self.position_ticks)
    }

    fn read_analog_voltage(&mut self) -> Result<i32, HardwareFault> {
        self.call("motor")?;
        Ok(self.voltage_now().round() as i32)
    }

    fn intermediate_tune_sweep(&mut self) -> Result<String, HardwareFault> {
        self.call("motor")?;
        self.sweeps += 1;
        let start = self.position_ticks;
        let span = self.sweep_span_ticks;
        let sample = self.sweep_sample_ticks.max(1);
        let freq = self.cavity_freq_mhz + self.delta_mhz;

        let readings: Vec<f64> = (0..=span / sample)
            .map(|k| self.response_mv(start + k * sample, freq))
            .collect();
        self.position_ticks = start + span;

        let (index, max) = readings
            .iter()
            .copied()
            .enumerate()
            .fold((0, 0.0), |best, (k, v)| if v > best.1 { (k, v) } else { best });
        let max_mv = max.round() as i32;
        if max < self.detection_fraction * self.on_resonance_mv() {
            return Ok(format!("{max_mv},0,0,0,0?"));
        }

        let above = readings.iter().filter(|&&v| v >= 0.5 * max).count() as i32;
        let location = start + index as i32 * sample;
        let margin = span / 10;
        let edge = if location - start < margin {
            -1
        } else if start + span - location < margin {
            1
        } else {
            0
        };
        Ok(format!(
            "{max_mv},{},{location},{index},{edge}",
            above * sample
        ))
    }

    fn find_home(&mut self, timeout: Duration) -> Result<(), HardwareFault> {
        self.call("motor")?;
        if !self.home_reachable {
            return Err(HardwareFault::Timeout("home switch search", timeout));
        }
        self.position_ticks = 0;
        self.encoder_error_ticks = self.home_error_ticks;
        Ok(())
    }
}

impl CavitySynth for SimulatedCavity {
    fn set_cavity_frequency(&mut self, freq_mhz: f64) -> Result<(), HardwareFault> {
        self.call("synthesizer")?;
        self.cavity_freq_mhz = freq_mhz;
        self.delta_mhz = 0.0;
        Ok(())
    }

    fn go_to_cavity_delta_frequency(&mut self, delta_mhz: f64) -> Result<(), HardwareFault> {
        self.call("synthesizer")?;
        self.delta_mhz = delta_mhz;
        Ok(())
    }
}

/// Scan executor backed by a [`SimulatedCavity`] and a table of molecular lines.
pub struct SimulatedSpectrometer {
    pub cavity: SimulatedCavity,
    tuner: CavityTuner,
    lines: Vec<SimLine>,
    links: Vec<(f64, f64)>,
    line_tolerance_mhz: f64,
    depletion: f64,
    scan_number: u64,
}

impl SimulatedSpectrometer {
    #[must_use]
    pub fn new(cavity: SimulatedCavity, tuner: CavityTuner, cfg: &SimConfig) -> Self {
        SimulatedSpectrometer {
            cavity,
            tuner,
            lines: cfg.lines.clone(),
            links: cfg.links.clone(),
            line_tolerance_mhz: cfg.line_tolerance_mhz,
            depletion: cfg.depletion,
            scan_number: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn tuner(&self) -> &CavityTuner {
        &self.tuner
    }

    fn near(&self, a: f64, b: f64) -> bool {
        (a - b).abs() < self.line_tolerance_mhz
    }

    fn linked(&self, a: f64, b: f64) -> bool {
        self.links.iter().any(|&(x, y)| {
            (self.near(x, a) && self.near(y, b)) || (self.near(x, b) && self.near(y, a))
        })
    }

    /// Integrated intensity of the line under `scan`, or -1 when nothing is there.
    fn intensity(&self, scan: &ScanDescriptor) -> f64 {
        let Some(line) = self
            .lines
            .iter()
            .find(|l| self.near(l.freq_mhz, scan.ft_freq_mhz))
        else {
            return -1.0;
        };
        if scan.dr_enabled() && self.linked(line.freq_mhz, scan.dr_freq_mhz) {
            line.intensity * self.depletion
        } else {
            line.intensity
        }
    }
}

impl ScanExecutor for SimulatedSpectrometer {
    fn execute(&mut self, scan: &ScanDescriptor) -> Result<MeasurementResult, HardwareFault> {
        self.scan_number += 1;
        self.cavity.attenuation_db = scan.attenuation_db;

        let tuned = if scan.calibration {
            Some(self.tuner.calibrate(&mut self.cavity, scan.attenuation_db))
        } else if scan.skip_tune {
            None
        } else {
            Some(
                self.tuner
                    .tune(&mut self.cavity, scan.ft_freq_mhz, scan.attenuation_db, None),
            )
        };

        let (tuning_voltage_mv, bad_tune) = match tuned {
            None => (self.cavity.read_analog_voltage()?, false),
            Some(Ok(outcome)) => (outcome.voltage_mv, !outcome.success),
            Some(Err(TunerError::Hardware(fault))) => return Err(fault),
            Some(Err(e)) => {
                warn!("scan {}: {e}", self.scan_number);
                (0, true)
            }
        };

        let intensity = if scan.calibration {
            1.0
        } else {
            self.intensity(scan)
        };
        debug!(
            "scan {}: ft {:.3} MHz, dr {}, intensity {intensity:.3}",
            self.scan_number,
            scan.ft_freq_mhz,
            if scan.dr_enabled() {
                format!("{:.3} MHz", scan.dr_freq_mhz)
            } else {
                "off".to_string()
            }
        );
        Ok(MeasurementResult {
            scan_number: self.scan_number,
            tuning_voltage_mv,
            bad_tune,
            intensity,
            status: ScanStatus::Completed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::{FineTuneServo, TunerConfig};

    fn spectrometer() -> SimulatedSpectrometer {
        let geometry = CavityGeometry::ftm1();
        let cfg = SimConfig {
            lines: vec![
                SimLine {
                    freq_mhz: 10_000.0,
                    intensity: 5.0,
                },
                SimLine {
                    freq_mhz: 11_000.0,
                    intensity: 2.0,
                },
            ],
            links: vec![(10_000.0, 11_000.0)],
            ..SimConfig::default()
        };
        let tuner = CavityTuner::new(geometry, TunerConfig::default(), FineTuneServo::new())
            .with_seed(7);
        SimulatedSpectrometer::new(SimulatedCavity::from_config(geometry, &cfg), tuner, &cfg)
    }

    #[test]
    fn resonance_at_rough_guess() {
        let geo = CavityGeometry::ftm1();
        let cavity = SimulatedCavity::new(geo);
        let (ticks, _) = geo.rough_tune_guess(10_000.0, None).unwrap();
        assert!(cavity.response_mv(ticks, 10_000.0) > 1900.0);
        assert!(cavity.response_mv(ticks + 200, 10_000.0) < 200.0);
    }

    #[test]
    fn sweep_reports_and_advances() {
        let geo = CavityGeometry::ftm1();
        let mut cavity = SimulatedCavity::new(geo);
        let (ticks, _) = geo.rough_tune_guess(10_000.0, None).unwrap();
        cavity.set_cavity_frequency(10_000.0).unwrap();
        cavity.move_to_absolute(ticks - 500).unwrap();
        let reply = cavity.intermediate_tune_sweep().unwrap();
        assert!(!reply.ends_with('?'), "{reply}");
        assert_eq!(cavity.position_ticks, ticks + 500);

        cavity.move_to_absolute(ticks + 5000).unwrap();
        assert!(cavity.intermediate_tune_sweep().unwrap().ends_with('?'));
    }

    #[test]
    fn executes_reference_and_depleted_scans() {
        let mut spec = spectrometer();
        let reference = ScanDescriptor::default().with_ft_freq(10_000.0);
        let first = spec.execute(&reference).unwrap();
        assert_eq!(first.scan_number, 1);
        assert!(!first.bad_tune);
        assert_eq!(first.intensity, 5.0);

        let dr = reference.clone().with_dr(11_000.0).with_skip_tune(true);
        let second = spec.execute(&dr).unwrap();
        assert_eq!(second.scan_number, 2);
        assert!((second.intensity - 1.0).abs() < 1e-12);
        assert!(second.tuning_voltage_mv > 1500);

        let empty = ScanDescriptor::default().with_ft_freq(10_500.0);
        assert!(spec.execute(&empty).unwrap().intensity < 0.0);
    }

    #[test]
    fn port_fault_surfaces_from_executor() {
        let mut spec = spectrometer();
        spec.cavity.fail_after = Some(0);
        let err = spec
            .execute(&ScanDescriptor::default().with_ft_freq(10_000.0))
            .unwrap_err();
        assert_eq!(err, HardwareFault::NoResponse("synthesizer"));
    }
}
