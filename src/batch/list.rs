#![warn(clippy::pedantic)]

use super::report::{BatchReport, ScanRecord};
use super::{BatchPlan, MeasurementResult, ScanDescriptor};

/// A fixed sequence of scans run in order, optionally followed each time by a calibration scan.
/// Records are labelled `scan <k>` with `k` the position in the list, counted from 0.
#[derive(Debug)]
pub struct ScanList {
    scans: Vec<ScanDescriptor>,
    cal_template: Option<ScanDescriptor>,
    next: usize,
    cal_pending: bool,
    last_scan: Option<ScanDescriptor>,
    last_index: usize,
    records: Vec<ScanRecord>,
}

impl ScanList {
    #[must_use]
    pub fn new(scans: Vec<ScanDescriptor>, cal_template: Option<ScanDescriptor>) -> Self {
        ScanList {
            scans,
            cal_template: cal_template.map(ScanDescriptor::as_calibration),
            next: 0,
            cal_pending: false,
            last_scan: None,
            last_index: 0,
            records: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.scans.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }

    #[must_use]
    pub fn scans(&self) -> &[ScanDescriptor] {
        &self.scans
    }
}

impl BatchPlan for ScanList {
    fn kind(&self) -> &'static str {
        "batch"
    }

    fn prepare_next_scan(&mut self) -> ScanDescriptor {
        let scan = match (&self.cal_template, self.cal_pending) {
            (Some(cal), true) => cal.clone(),
            _ => {
                self.last_index = self.next;
                self.scans.get(self.next).cloned().unwrap_or_default()
            }
        };
        self.last_scan = Some(scan.clone());
        scan
    }

    fn advance(&mut self, _result: &MeasurementResult) {
        let Some(scan) = &self.last_scan else {
            return;
        };
        if scan.calibration && self.cal_pending {
            self.cal_pending = false;
        } else {
            self.next += 1;
            self.cal_pending = self.cal_template.is_some();
        }
    }

    fn process_result(&mut self, result: &MeasurementResult) {
        if let Some(scan) = &self.last_scan {
            let label = if scan.calibration {
                "cal".to_string()
            } else {
                format!("scan {}", self.last_index)
            };
            self.records.push(ScanRecord::new(label, scan, result));
        }
    }

    fn is_complete(&self) -> bool {
        self.next >= self.scans.len() && !self.cal_pending
    }

    #[allow(clippy::cast_precision_loss)]
    fn progress(&self) -> f64 {
        if self.scans.is_empty() {
            1.0
        } else {
            (self.next as f64 / self.scans.len() as f64).min(1.0)
        }
    }

    fn report(&self) -> BatchReport {
        let mut report = BatchReport::new(self.kind(), self.is_complete())
            .with_header("scans", self.scans.len())
            .with_header("calibrate", self.cal_template.is_some());
        report.scans.clone_from(&self.records);
        report
    }
}
