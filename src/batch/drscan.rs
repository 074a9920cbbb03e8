#![warn(clippy::pedantic)]

use serde::Deserialize;

use super::report::{BatchReport, ScanRecord};
use super::{BatchPlan, MeasurementResult, ScanDescriptor};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DrScanConfig {
    pub start_mhz: f64,
    pub stop_mhz: f64,
    pub step_mhz: f64,
}

impl Default for DrScanConfig {
    fn default() -> Self {
        DrScanConfig {
            start_mhz: 60_000.0,
            stop_mhz: 60_010.0,
            step_mhz: 0.5,
        }
    }
}

/// Holds the FT frequency fixed and steps the DR pump across a band.
///
/// The cavity only needs tuning once, so every point after the first skips the tune.
#[derive(Debug)]
pub struct DrScan {
    config: DrScanConfig,
    template: ScanDescriptor,
    points: usize,
    next_point: usize,
    last_scan: Option<ScanDescriptor>,
    records: Vec<ScanRecord>,
}

impl DrScan {
    #[must_use]
    pub fn new(config: DrScanConfig, template: ScanDescriptor) -> Self {
        let points = if config.step_mhz > 0.0 && config.stop_mhz >= config.start_mhz {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let n =
                ((config.stop_mhz - config.start_mhz) / config.step_mhz + 1e-9).floor() as usize;
            n + 1
        } else {
            1
        };
        DrScan {
            config,
            template,
            points,
            next_point: 0,
            last_scan: None,
            records: Vec::new(),
        }
    }

    /// DR frequency and intensity of every point measured so far.
    #[must_use]
    pub fn spectrum(&self) -> Vec<(f64, f64)> {
        self.records
            .iter()
            .map(|r| (r.dr_freq_mhz, r.intensity))
            .collect()
    }
}

impl BatchPlan for DrScan {
    fn kind(&self) -> &'static str {
        "drscan"
    }

    #[allow(clippy::cast_precision_loss)]
    fn prepare_next_scan(&mut self) -> ScanDescriptor {
        let dr = self.config.start_mhz + self.config.step_mhz * self.next_point as f64;
        let scan = self
            .template
            .clone()
            .with_dr(dr)
            .with_skip_tune(self.next_point > 0 || self.template.skip_tune);
        self.last_scan = Some(scan.clone());
        scan
    }

    fn advance(&mut self, _result: &MeasurementResult) {
        self.next_point += 1;
    }

    fn process_result(&mut self, result: &MeasurementResult) {
        if let Some(scan) = &self.last_scan {
            self.records.push(ScanRecord::new("dr", scan, result));
        }
    }

    fn is_complete(&self) -> bool {
        self.next_point >= self.points
    }

    #[allow(clippy::cast_precision_loss)]
    fn progress(&self) -> f64 {
        (self.next_point as f64 / self.points as f64).min(1.0)
    }

    fn report(&self) -> BatchReport {
        let mut report = BatchReport::new(self.kind(), self.is_complete())
            .with_header("ft_freq_mhz", self.template.ft_freq_mhz)
            .with_header("dr_start_mhz", self.config.start_mhz)
            .with_header("dr_stop_mhz", self.config.stop_mhz)
            .with_header("dr_step_mhz", self.config.step_mhz);
        report.scans.clone_from(&self.records);
        report
    }
}
