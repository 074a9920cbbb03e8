#![warn(clippy::pedantic)]

use serde::{Deserialize, Serialize};

/// Discrete hill-climbing servo used by the fine tune.
///
/// Each iteration the tuner probes the diode voltage below, above and at the cavity frequency.
/// The servo decides whether the mirror sits on the peak and otherwise how far to step it.
#[derive(Debug, Clone)]
pub struct FineTuneServo {
    pub max_steps: u32,
    // used above the tuner's high frequency threshold
    pub max_steps_high_freq: u32,
    pub voltage_fraction: f64,
    pub relaxed_voltage_fraction: f64,
    pub running_max_fraction: f64,
    pub min_step_ticks: i32,
    // initial step is the peak width divided by this
    pub width_divisor: i32,
    pub attenuated_floor_mv: i32,

    step_ticks: i32,
    last_direction: i32,
    running_max_mv: i32,
}

impl Default for FineTuneServo {
    fn default() -> Self {
        FineTuneServo {
            max_steps: 30,
            max_steps_high_freq: 6,
            voltage_fraction: 0.9,
            relaxed_voltage_fraction: 0.86,
            running_max_fraction: 0.9,
            min_step_ticks: 1,
            width_divisor: 4,
            attenuated_floor_mv: 300,
            step_ticks: 1,
            last_direction: 0,
            running_max_mv: 0,
        }
    }
}

impl FineTuneServo {
    #[must_use]
    pub fn new() -> Self {
        FineTuneServo {
            ..Default::default()
        }
    }

    /// Clear the loop state before a new fine tune across a peak `width_ticks` wide.
    pub fn reset(&mut self, width_ticks: i32) {
        self.step_ticks = (width_ticks / self.width_divisor.max(1)).max(self.min_step_ticks);
        self.last_direction = 0;
        self.running_max_mv = 0;
    }

    #[inline]
    pub fn observe(&mut self, center_mv: i32) {
        self.running_max_mv = self.running_max_mv.max(center_mv);
    }

    #[must_use]
    pub fn is_converged(
        &self,
        center_mv: i32,
        minus_mv: i32,
        plus_mv: i32,
        target_mv: f64,
        fraction: f64,
    ) -> bool {
        let center = f64::from(center_mv);
        center >= fraction * target_mv
            && center_mv >= minus_mv
            && center_mv >= plus_mv
            && center >= self.running_max_fraction * f64::from(self.running_max_mv)
    }

    /// Signed mirror step toward the side with the higher reading.
    ///
    /// A higher reading above the cavity frequency means the resonance sits above it, so the
    /// cavity is lengthened (positive ticks).
    pub fn next_step(&mut self, minus_mv: i32, plus_mv: i32) -> i32 {
        let direction = if plus_mv > minus_mv { 1 } else { -1 };
        if self.last_direction != 0 && direction != self.last_direction {
            if self.step_ticks > self.min_step_ticks {
                self.step_ticks = (self.step_ticks / 2).max(self.min_step_ticks);
            } else {
                // stuck oscillating around a local maximum at the smallest step
                self.step_ticks *= 2;
            }
        }
        self.last_direction = direction;
        direction * self.step_ticks
    }

    #[inline]
    #[must_use]
    pub fn step_ticks(&self) -> i32 {
        self.step_ticks
    }

    #[inline]
    #[must_use]
    pub fn running_max_mv(&self) -> i32 {
        self.running_max_mv
    }

    #[must_use]
    pub fn max_steps_for(&self, high_freq: bool) -> u32 {
        if high_freq {
            self.max_steps_high_freq
        } else {
            self.max_steps
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct FineTuneSerialize {
    max_steps: u32,
    max_steps_high_freq: u32,
    voltage_fraction: f64,
    relaxed_voltage_fraction: f64,
    running_max_fraction: f64,
    min_step_ticks: i32,
    width_divisor: i32,
    attenuated_floor_mv: i32,
}

impl Default for FineTuneSerialize {
    fn default() -> Self {
        FineTuneSerialize::from_servo(&FineTuneServo::default())
    }
}

impl FineTuneSerialize {
    fn into_servo(self) -> FineTuneServo {
        let mut out = FineTuneServo::new();
        out.max_steps = self.max_steps;
        out.max_steps_high_freq = self.max_steps_high_freq;
        out.voltage_fraction = self.voltage_fraction.clamp(0.0, 1.0);
        out.relaxed_voltage_fraction = self.relaxed_voltage_fraction.clamp(0.0, 1.0);
        out.running_max_fraction = self.running_max_fraction.clamp(0.0, 1.0);
        out.min_step_ticks = self.min_step_ticks.max(1);
        out.width_divisor = self.width_divisor.max(1);
        out.attenuated_floor_mv = self.attenuated_floor_mv;
        out
    }

    fn from_servo(servo: &FineTuneServo) -> Self {
        FineTuneSerialize {
            max_steps: servo.max_steps,
            max_steps_high_freq: servo.max_steps_high_freq,
            voltage_fraction: servo.voltage_fraction,
            relaxed_voltage_fraction: servo.relaxed_voltage_fraction,
            running_max_fraction: servo.running_max_fraction,
            min_step_ticks: servo.min_step_ticks,
            width_divisor: servo.width_divisor,
            attenuated_floor_mv: servo.attenuated_floor_mv,
        }
    }
}

impl<'de> Deserialize<'de> for FineTuneServo {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(FineTuneSerialize::deserialize(d)?.into_servo())
    }
}

impl Serialize for FineTuneServo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        FineTuneSerialize::from_servo(self).serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_halves_on_reversal() {
        let mut servo = FineTuneServo::new();
        servo.reset(100);
        assert_eq!(servo.step_ticks(), 25);
        assert_eq!(servo.next_step(10, 20), 25);
        assert_eq!(servo.next_step(10, 20), 25);
        assert_eq!(servo.next_step(20, 10), -12);
        assert_eq!(servo.next_step(10, 20), 6);
    }

    #[test]
    fn step_doubles_at_floor() {
        let mut servo = FineTuneServo::new();
        servo.min_step_ticks = 2;
        servo.reset(4);
        assert_eq!(servo.step_ticks(), 2);
        assert_eq!(servo.next_step(1, 5), 2);
        assert_eq!(servo.next_step(5, 1), -4);
        assert_eq!(servo.next_step(1, 5), 2);
    }

    #[test]
    fn convergence_needs_all_conditions() {
        let mut servo = FineTuneServo::new();
        servo.reset(100);
        servo.observe(950);
        assert!(servo.is_converged(950, 500, 600, 1000.0, 0.9));
        // below the target fraction
        assert!(!servo.is_converged(850, 500, 600, 1000.0, 0.9));
        assert!(servo.is_converged(870, 500, 600, 1000.0, 0.86));
        // a side reading is higher
        assert!(!servo.is_converged(950, 960, 600, 1000.0, 0.9));
        // well below the best reading seen so far
        servo.observe(2000);
        assert!(!servo.is_converged(950, 500, 600, 1000.0, 0.9));
    }

    #[test]
    fn deserialize_settings_only() {
        let servo: FineTuneServo = toml::from_str("max_steps = 12\nmin_step_ticks = 0\n").unwrap();
        assert_eq!(servo.max_steps, 12);
        assert_eq!(servo.min_step_ticks, 1);
        assert_eq!(servo.max_steps_high_freq, 6);
        assert_eq!(servo.running_max_mv(), 0);
    }
}
