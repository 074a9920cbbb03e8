#![warn(clippy::pedantic)]

//! Collaborator interfaces for the instrument hardware that drives the cavity.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// A communication failure on one of the instrument ports.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HardwareFault {
    #[error("no response from {0}")]
    NoResponse(&'static str),
    #[error("malformed response from {port}: <{response}>")]
    Malformed {
        port: &'static str,
        response: String,
    },
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
    #[error("invalid diode reading {0} mV")]
    InvalidReading(i32),
    #[error("{0}")]
    Other(String),
}

/// Stepper motor that positions the movable cavity mirror, together with the rectified diode
/// that monitors the power coupled through the cavity.
pub trait MotorPort {
    /// # Errors
    /// Any communication failure.
    fn move_to_absolute(&mut self, ticks: i32) -> Result<(), HardwareFault>;
    /// # Errors
    /// Any communication failure.
    fn step_relative(&mut self, ticks: i32) -> Result<(), HardwareFault>;
    /// # Errors
    /// Any communication failure.
    fn read_encoder_position(&mut self) -> Result<i32, HardwareFault>;
    /// Diode voltage in mV.
    /// # Errors
    /// Any communication failure.
    fn read_analog_voltage(&mut self) -> Result<i32, HardwareFault>;
    /// Sweep the mirror over the intermediate tuning window and return the raw controller
    /// response (see [`SweepResponse`]).
    /// # Errors
    /// Any communication failure.
    fn intermediate_tune_sweep(&mut self) -> Result<String, HardwareFault>;
    /// Drive the mirror onto its home switch.
    /// # Errors
    /// Communication failure, or `Timeout` if the switch was not found within `timeout`.
    fn find_home(&mut self, timeout: Duration) -> Result<(), HardwareFault>;
}

/// Synthesizer feeding the cavity. The tuner sets the nominal frequency once per tune and then
/// offsets from it without retuning.
pub trait CavitySynth {
    /// # Errors
    /// Any communication failure.
    fn set_cavity_frequency(&mut self, freq_mhz: f64) -> Result<(), HardwareFault>;
    /// # Errors
    /// Any communication failure.
    fn go_to_cavity_delta_frequency(&mut self, delta_mhz: f64) -> Result<(), HardwareFault>;
}

/// Where the sweep found the peak relative to its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeFlag {
    Centered,
    NearLowerEdge,
    NearUpperEdge,
}

impl From<i32> for EdgeFlag {
    fn from(flag: i32) -> Self {
        match flag {
            0 => EdgeFlag::Centered,
            -1 => EdgeFlag::NearLowerEdge,
            _ => EdgeFlag::NearUpperEdge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPeak {
    pub max_voltage_mv: i32,
    pub width_ticks: i32,
    pub location_ticks: i32,
    pub index: i32,
    pub edge: EdgeFlag,
}

/// Parsed reply to an intermediate tune sweep: `max_mv,width,location,index,edge`, with a trailing
/// `?` when the controller did not find a peak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepResponse {
    Found(SweepPeak),
    NotFound,
}

impl FromStr for SweepResponse {
    type Err = HardwareFault;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let malformed = || HardwareFault::Malformed {
            port: "motor",
            response: s.to_string(),
        };
        if s.is_empty() {
            return Err(HardwareFault::NoResponse("motor"));
        }
        if s.ends_with('?') {
            return Ok(SweepResponse::NotFound);
        }
        let fields = s
            .split(',')
            .map(|x| x.trim().parse::<i32>())
            .collect::<Result<Vec<i32>, _>>()
            .map_err(|_| malformed())?;
        match fields[..] {
            [max_voltage_mv, width_ticks, location_ticks, index, edge] => {
                Ok(SweepResponse::Found(SweepPeak {
                    max_voltage_mv,
                    width_ticks,
                    location_ticks,
                    index,
                    edge: edge.into(),
                }))
            }
            _ => Err(malformed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_found_peak() {
        let resp: SweepResponse = "1520,96,40123,311,0\n".parse().unwrap();
        assert_eq!(
            resp,
            SweepResponse::Found(SweepPeak {
                max_voltage_mv: 1520,
                width_ticks: 96,
                location_ticks: 40123,
                index: 311,
                edge: EdgeFlag::Centered,
            })
        );
    }

    #[test]
    fn edge_flags() {
        let edge = |s: &str| match s.parse::<SweepResponse>().unwrap() {
            SweepResponse::Found(p) => p.edge,
            SweepResponse::NotFound => panic!("expected a peak"),
        };
        assert_eq!(edge("1,2,3,4,-1"), EdgeFlag::NearLowerEdge);
        assert_eq!(edge("1,2,3,4,1"), EdgeFlag::NearUpperEdge);
        assert_eq!(edge("1,2,3,4,7"), EdgeFlag::NearUpperEdge);
    }

    #[test]
    fn not_found_and_faults() {
        assert_eq!(
            "12,0,0,0,0?".parse::<SweepResponse>(),
            Ok(SweepResponse::NotFound)
        );
        assert_eq!("?".parse::<SweepResponse>(), Ok(SweepResponse::NotFound));
        assert_eq!(
            "  ".parse::<SweepResponse>(),
            Err(HardwareFault::NoResponse("motor"))
        );
        assert!(matches!(
            "1,2,three,4,0".parse::<SweepResponse>(),
            Err(HardwareFault::Malformed { .. })
        ));
        assert!(matches!(
            "1,2,3".parse::<SweepResponse>(),
            Err(HardwareFault::Malformed { .. })
        ));
    }
}
