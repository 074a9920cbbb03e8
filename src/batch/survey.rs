#![warn(clippy::pedantic)]

use serde::Deserialize;

use super::report::{BatchReport, ScanRecord};
use super::{BatchPlan, MeasurementResult, ScanDescriptor};

/// Settings for a survey: the FT frequency is stepped from `start_mhz` to `stop_mhz`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SurveyConfig {
    pub start_mhz: f64,
    pub stop_mhz: f64,
    pub step_mhz: f64,
    /// Calibration scan every this many survey points; 0 disables the periodic scans.
    pub cal_interval: usize,
}

impl Default for SurveyConfig {
    fn default() -> Self {
        SurveyConfig {
            start_mhz: 10_000.0,
            stop_mhz: 10_010.0,
            step_mhz: 0.5,
            cal_interval: 0,
        }
    }
}

/// Steps the FT frequency across a band. With a calibration template the survey opens and
/// closes with a calibration scan and inserts one every `cal_interval` points.
#[derive(Debug)]
pub struct Survey {
    config: SurveyConfig,
    template: ScanDescriptor,
    cal_template: Option<ScanDescriptor>,
    points: usize,
    next_point: usize,
    since_cal: usize,
    cal_pending: bool,
    last_scan: Option<ScanDescriptor>,
    records: Vec<ScanRecord>,
}

impl Survey {
    #[must_use]
    pub fn new(
        config: SurveyConfig,
        template: ScanDescriptor,
        cal_template: Option<ScanDescriptor>,
    ) -> Self {
        let points = if config.step_mhz > 0.0 && config.stop_mhz >= config.start_mhz {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let n =
                ((config.stop_mhz - config.start_mhz) / config.step_mhz + 1e-9).floor() as usize;
            n + 1
        } else {
            1
        };
        let cal_pending = cal_template.is_some();
        Survey {
            config,
            template,
            cal_template: cal_template.map(ScanDescriptor::as_calibration),
            points,
            next_point: 0,
            since_cal: 0,
            cal_pending,
            last_scan: None,
            records: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn points(&self) -> usize {
        self.points
    }

    #[allow(clippy::cast_precision_loss)]
    fn point_frequency(&self, point: usize) -> f64 {
        self.config.start_mhz + self.config.step_mhz * point as f64
    }
}

impl BatchPlan for Survey {
    fn kind(&self) -> &'static str {
        "survey"
    }

    fn prepare_next_scan(&mut self) -> ScanDescriptor {
        let scan = match (&self.cal_template, self.cal_pending) {
            (Some(cal), true) => cal.clone(),
            _ => self
                .template
                .clone()
                .with_ft_freq(self.point_frequency(self.next_point)),
        };
        self.last_scan = Some(scan.clone());
        scan
    }

    fn advance(&mut self, _result: &MeasurementResult) {
        let Some(scan) = &self.last_scan else {
            return;
        };
        if scan.calibration {
            self.cal_pending = false;
            self.since_cal = 0;
            return;
        }
        self.next_point += 1;
        self.since_cal += 1;
        if self.cal_template.is_some() {
            let periodic =
                self.config.cal_interval > 0 && self.since_cal >= self.config.cal_interval;
            let last = self.next_point >= self.points;
            self.cal_pending = periodic || last;
        }
    }

    fn process_result(&mut self, result: &MeasurementResult) {
        if let Some(scan) = &self.last_scan {
            let label = if scan.calibration { "cal" } else { "survey" };
            self.records.push(ScanRecord::new(label, scan, result));
        }
    }

    fn is_complete(&self) -> bool {
        self.next_point >= self.points && !self.cal_pending
    }

    #[allow(clippy::cast_precision_loss)]
    fn progress(&self) -> f64 {
        if self.is_complete() {
            1.0
        } else {
            self.next_point as f64 / self.points as f64
        }
    }

    fn report(&self) -> BatchReport {
        let mut report = BatchReport::new(self.kind(), self.is_complete())
            .with_header("start_mhz", self.config.start_mhz)
            .with_header("stop_mhz", self.config.stop_mhz)
            .with_header("step_mhz", self.config.step_mhz)
            .with_header("cal_interval", self.config.cal_interval);
        report.scans.clone_from(&self.records);
        report
    }
}
