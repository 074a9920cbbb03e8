#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation, clippy::cast_lossless)]

//! Resonance condition of the confocal Fabry-Perot cavity.
//!
//! All frequencies are in MHz and all lengths in cm. Mirror position is expressed in motor
//! encoder ticks measured from the length `l0_cm`.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Speed of light in cm * MHz.
pub const SPEED_OF_LIGHT: f64 = 29_979.245_8;

/// Bisection stops once the frequency is within this many MHz of the target.
pub const POSITION_TOLERANCE_MHZ: f64 = 0.01;
const MAX_BISECTION_STEPS: u32 = 100;

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum ModeError {
    /// The frequency is below what the mode reaches at maximum length.
    #[error("mode {mode} is too high to reach {freq_mhz} MHz")]
    ModeTooHigh { freq_mhz: f64, mode: u32 },
    /// The frequency is above what the mode reaches at minimum length.
    #[error("mode {mode} is too low to reach {freq_mhz} MHz")]
    ModeTooLow { freq_mhz: f64, mode: u32 },
    #[error("mode numbers start at 1")]
    InvalidMode,
    #[error("no cavity mode can reach {0} MHz")]
    NoValidMode(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CavityGeometry {
    pub mirror_radius_cm: f64,
    pub min_length_cm: f64,
    pub max_length_cm: f64,
    /// Cavity length corresponding to encoder position 0.
    pub l0_cm: f64,
    pub ticks_per_cm: f64,
}

impl CavityGeometry {
    #[must_use]
    pub fn ftm1() -> Self {
        CavityGeometry {
            mirror_radius_cm: 83.0,
            min_length_cm: 30.0,
            max_length_cm: 70.0,
            l0_cm: 30.0,
            ticks_per_cm: 20_000.0,
        }
    }

    #[must_use]
    pub fn ftm2() -> Self {
        CavityGeometry {
            mirror_radius_cm: 36.0,
            min_length_cm: 15.0,
            max_length_cm: 45.0,
            l0_cm: 15.0,
            ticks_per_cm: 20_000.0,
        }
    }

    #[must_use]
    pub fn for_spectrometer(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ftm1" => Some(Self::ftm1()),
            "ftm2" => Some(Self::ftm2()),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn center_length_cm(&self) -> f64 {
        0.5 * (self.min_length_cm + self.max_length_cm)
    }

    /// Frequency of mode `mode` at cavity length `length_cm`. Returns 0 for unphysical input.
    #[must_use]
    pub fn mode_frequency(&self, length_cm: f64, mode: u32) -> f64 {
        if length_cm <= 0.0 || mode == 0 || self.mirror_radius_cm <= 0.0 {
            return 0.0;
        }
        let arg = 1.0 - length_cm / self.mirror_radius_cm;
        if !(-1.0..=1.0).contains(&arg) {
            return 0.0;
        }
        SPEED_OF_LIGHT / (2.0 * length_cm) * (mode as f64 + arg.acos() / PI)
    }

    /// Cavity length at which `mode` resonates at `freq_mhz`.
    ///
    /// # Errors
    /// `ModeTooHigh` if the frequency lies below the maximum-length frequency of this mode,
    /// `ModeTooLow` if it lies above the minimum-length frequency.
    pub fn mode_position(&self, freq_mhz: f64, mode: u32) -> Result<f64, ModeError> {
        if mode == 0 {
            return Err(ModeError::InvalidMode);
        }
        if freq_mhz < self.mode_frequency(self.max_length_cm, mode) {
            return Err(ModeError::ModeTooHigh { freq_mhz, mode });
        }
        if freq_mhz > self.mode_frequency(self.min_length_cm, mode) {
            return Err(ModeError::ModeTooLow { freq_mhz, mode });
        }

        // frequency decreases monotonically with length for a fixed mode
        let mut lo = self.min_length_cm;
        let mut hi = self.max_length_cm;
        let mut mid = 0.5 * (lo + hi);
        for _ in 0..MAX_BISECTION_STEPS {
            mid = 0.5 * (lo + hi);
            let f = self.mode_frequency(mid, mode);
            if (f - freq_mhz).abs() < POSITION_TOLERANCE_MHZ {
                break;
            }
            if f > freq_mhz {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Ok(mid)
    }

    #[must_use]
    pub fn is_mode_valid(&self, freq_mhz: f64, mode: u32) -> bool {
        mode >= 1
            && freq_mhz > self.mode_frequency(self.max_length_cm, mode)
            && freq_mhz < self.mode_frequency(self.min_length_cm, mode)
    }

    #[inline]
    #[must_use]
    pub fn length_to_ticks(&self, length_cm: f64) -> i32 {
        ((length_cm - self.l0_cm) * self.ticks_per_cm).round() as i32
    }

    #[inline]
    #[must_use]
    pub fn ticks_to_length(&self, ticks: i32) -> f64 {
        self.l0_cm + f64::from(ticks) / self.ticks_per_cm
    }

    /// Encoder position and mode number to start a rough tune at `freq_mhz`.
    ///
    /// With no mode given, every mode that can reach the frequency is considered and the one
    /// closest to the middle of the mirror travel wins; the lowest such mode wins a tie.
    ///
    /// # Errors
    /// Returns the reason the requested mode cannot reach the frequency, or `NoValidMode` when no
    /// mode can.
    pub fn rough_tune_guess(
        &self,
        freq_mhz: f64,
        mode: Option<u32>,
    ) -> Result<(i32, u32), ModeError> {
        if let Some(mode) = mode {
            let length = self.mode_position(freq_mhz, mode)?;
            return Ok((self.length_to_ticks(length), mode));
        }
        if freq_mhz <= 0.0 {
            return Err(ModeError::NoValidMode(freq_mhz));
        }

        let mut mode = 1;
        while self.mode_frequency(self.min_length_cm, mode) <= freq_mhz {
            mode += 1;
            if mode > 10_000 {
                return Err(ModeError::NoValidMode(freq_mhz));
            }
        }

        let center = self.center_length_cm();
        let mut best: Option<(f64, u32)> = None;
        while self.mode_frequency(self.max_length_cm, mode) < freq_mhz {
            if let Ok(length) = self.mode_position(freq_mhz, mode) {
                let better = match best {
                    Some((best_length, _)) => {
                        (length - center).abs() < (best_length - center).abs()
                    }
                    None => true,
                };
                if better {
                    best = Some((length, mode));
                }
            }
            mode += 1;
        }

        best.map(|(length, mode)| (self.length_to_ticks(length), mode))
            .ok_or(ModeError::NoValidMode(freq_mhz))
    }

    /// Magnitude of the frequency shift produced by moving the mirror `ticks` away from the
    /// resonance of `mode` at `freq_mhz`.
    ///
    /// # Errors
    /// Propagates `mode_position` failures.
    pub fn frequency_span_of_ticks(
        &self,
        freq_mhz: f64,
        mode: u32,
        ticks: i32,
    ) -> Result<f64, ModeError> {
        let length = self.mode_position(freq_mhz, mode)?;
        let moved = length + f64::from(ticks) / self.ticks_per_cm;
        Ok((self.mode_frequency(length, mode) - self.mode_frequency(moved, mode)).abs())
    }
}

impl Default for CavityGeometry {
    fn default() -> Self {
        Self::ftm1()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::Rng;

    #[test]
    fn unphysical_input_has_zero_frequency() {
        let geo = CavityGeometry::ftm1();
        assert_eq!(geo.mode_frequency(0.0, 20), 0.0);
        assert_eq!(geo.mode_frequency(-3.0, 20), 0.0);
        assert_eq!(geo.mode_frequency(50.0, 0), 0.0);
        assert_eq!(geo.mode_frequency(3.0 * geo.mirror_radius_cm, 20), 0.0);
    }

    #[test]
    fn round_trip() {
        let mut rng = rand::thread_rng();
        for geo in [CavityGeometry::ftm1(), CavityGeometry::ftm2()] {
            for _ in 0..500 {
                let mode = rng.gen_range(10..80);
                let length = rng.gen_range(geo.min_length_cm..geo.max_length_cm);
                let f = geo.mode_frequency(length, mode);
                let found = geo.mode_position(f, mode).expect("frequency is reachable");
                assert!((geo.mode_frequency(found, mode) - f).abs() < POSITION_TOLERANCE_MHZ);
                assert_abs_diff_eq!(found, length, epsilon = 5.0e-4);
            }
        }
    }

    #[test]
    fn monotonic_in_length() {
        let geo = CavityGeometry::ftm1();
        for mode in [1, 5, 30, 90] {
            let mut last = f64::INFINITY;
            for i in 0..=400 {
                let length = geo.min_length_cm
                    + (geo.max_length_cm - geo.min_length_cm) * f64::from(i) / 400.0;
                let f = geo.mode_frequency(length, mode);
                assert!(f < last);
                last = f;
            }
        }
    }

    #[test]
    fn validity_is_one_interval() {
        let geo = CavityGeometry::ftm1();
        let mode = 40;
        let f_lo = geo.mode_frequency(geo.max_length_cm, mode);
        let f_hi = geo.mode_frequency(geo.min_length_cm, mode);
        let mut transitions = 0;
        let mut last = false;
        let mut f = f_lo - 500.0;
        while f < f_hi + 500.0 {
            let valid = geo.is_mode_valid(f, mode);
            if valid != last {
                transitions += 1;
                last = valid;
            }
            assert_eq!(valid, f > f_lo && f < f_hi);
            f += 7.3;
        }
        assert_eq!(transitions, 2);
        assert!(!geo.is_mode_valid(0.5 * (f_lo + f_hi), 0));
    }

    #[test]
    fn out_of_range_errors_are_distinct() {
        let geo = CavityGeometry::ftm1();
        let mode = 40;
        let below = geo.mode_frequency(geo.max_length_cm, mode) - 10.0;
        let above = geo.mode_frequency(geo.min_length_cm, mode) + 10.0;
        assert!(matches!(
            geo.mode_position(below, mode),
            Err(ModeError::ModeTooHigh { .. })
        ));
        assert!(matches!(
            geo.mode_position(above, mode),
            Err(ModeError::ModeTooLow { .. })
        ));
        assert_eq!(geo.mode_position(10_000.0, 0), Err(ModeError::InvalidMode));
    }

    #[test]
    fn rough_guess_picks_mode_nearest_center() {
        let geo = CavityGeometry::ftm1();
        for freq in [6_000.0, 10_000.0, 18_123.4, 26_000.0] {
            let (ticks, mode) = geo.rough_tune_guess(freq, None).expect("reachable");
            let chosen = geo.mode_position(freq, mode).unwrap();
            let center = geo.center_length_cm();
            let candidates: Vec<u32> = (1..400).filter(|&q| geo.is_mode_valid(freq, q)).collect();
            assert!(candidates.len() > 1);
            for q in candidates {
                let length = geo.mode_position(freq, q).unwrap();
                assert!((chosen - center).abs() <= (length - center).abs());
            }
            assert_eq!(ticks, geo.length_to_ticks(chosen));
        }
    }

    #[test]
    fn rough_guess_with_explicit_mode() {
        let geo = CavityGeometry::ftm1();
        let (_, auto_mode) = geo.rough_tune_guess(10_000.0, None).unwrap();
        let (ticks, mode) = geo.rough_tune_guess(10_000.0, Some(auto_mode + 1)).unwrap();
        assert_eq!(mode, auto_mode + 1);
        let length = geo.ticks_to_length(ticks);
        assert!((geo.mode_frequency(length, mode) - 10_000.0).abs() < 0.1);

        assert!(matches!(
            geo.rough_tune_guess(10_000.0, Some(1)),
            Err(ModeError::ModeTooLow { .. })
        ));
        assert!(matches!(
            geo.rough_tune_guess(10_000.0, Some(500)),
            Err(ModeError::ModeTooHigh { .. })
        ));
        assert!(geo.rough_tune_guess(-5.0, None).is_err());
    }

    #[test]
    fn tick_conversion() {
        let geo = CavityGeometry::ftm1();
        assert_eq!(geo.length_to_ticks(geo.l0_cm), 0);
        assert_eq!(geo.length_to_ticks(geo.l0_cm + 1.0), 20_000);
        assert_abs_diff_eq!(geo.ticks_to_length(40_000), geo.l0_cm + 2.0);
        let span = geo.frequency_span_of_ticks(10_000.0, 33, 100).unwrap();
        assert!(span > 0.1 && span < 10.0);
    }

    #[test]
    fn variants_by_name() {
        assert_eq!(
            CavityGeometry::for_spectrometer("FTM2"),
            Some(CavityGeometry::ftm2())
        );
        assert!(CavityGeometry::for_spectrometer("ftm9").is_none());
    }
}
