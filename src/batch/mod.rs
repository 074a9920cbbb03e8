#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Multi-scan acquisition sequences.
//!
//! A [`BatchPlan`] decides which scan to acquire next and digests the results; the
//! [`BatchManager`] drives one plan against a [`ScanExecutor`] with exactly one scan in flight.

pub mod drscan;
pub mod list;
pub mod report;
pub mod survey;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::amdor::AmdorBatch;
use crate::hardware::HardwareFault;

pub use drscan::DrScan;
pub use list::ScanList;
pub use report::{BatchReport, ReportWriter, ScanRecord};
pub use survey::Survey;

pub const NUM_PULSE_CHANNELS: usize = 4;
/// Pulse channel that gates the double-resonance source.
pub const DR_CHANNEL: usize = 3;

/// One hardware acquisition to perform. Never mutated once issued; the `with_*` methods return a
/// modified copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanDescriptor {
    pub ft_freq_mhz: f64,
    pub attenuation_db: f64,
    pub dr_freq_mhz: f64,
    pub dr_power_dbm: f64,
    pub pulse_enabled: [bool; NUM_PULSE_CHANNELS],
    pub skip_tune: bool,
    pub calibration: bool,
    pub target_shots: u32,
}

impl Default for ScanDescriptor {
    fn default() -> Self {
        ScanDescriptor {
            ft_freq_mhz: 10_000.0,
            attenuation_db: 0.0,
            dr_freq_mhz: 0.0,
            dr_power_dbm: 17.0,
            pulse_enabled: [true, true, true, false],
            skip_tune: false,
            calibration: false,
            target_shots: 10,
        }
    }
}

impl ScanDescriptor {
    #[must_use]
    pub fn with_ft_freq(mut self, freq_mhz: f64) -> Self {
        self.ft_freq_mhz = freq_mhz;
        self
    }

    /// Pump at `freq_mhz` with the DR channel enabled.
    #[must_use]
    pub fn with_dr(mut self, freq_mhz: f64) -> Self {
        self.dr_freq_mhz = freq_mhz;
        self.pulse_enabled[DR_CHANNEL] = true;
        self
    }

    #[must_use]
    pub fn without_dr(mut self) -> Self {
        self.pulse_enabled[DR_CHANNEL] = false;
        self
    }

    #[must_use]
    pub fn with_skip_tune(mut self, skip: bool) -> Self {
        self.skip_tune = skip;
        self
    }

    #[must_use]
    pub fn as_calibration(mut self) -> Self {
        self.calibration = true;
        self.pulse_enabled[DR_CHANNEL] = false;
        self
    }

    #[inline]
    #[must_use]
    pub fn dr_enabled(&self) -> bool {
        self.pulse_enabled[DR_CHANNEL]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStatus {
    Completed,
    Aborted,
    HardwareFault,
}

/// What the executor hands back for one descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementResult {
    pub scan_number: u64,
    pub tuning_voltage_mv: i32,
    pub bad_tune: bool,
    /// Integrated line intensity; negative when no line could be detected.
    pub intensity: f64,
    pub status: ScanStatus,
}

impl MeasurementResult {
    #[inline]
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.status == ScanStatus::Completed
    }
}

/// Performs one acquisition at a time.
pub trait ScanExecutor {
    /// # Errors
    /// A hardware fault that prevented the scan from producing any result.
    fn execute(&mut self, scan: &ScanDescriptor) -> Result<MeasurementResult, HardwareFault>;
}

pub trait BatchPlan {
    fn kind(&self) -> &'static str;
    /// Descriptor for the next scan. Only called while the plan is not complete.
    fn prepare_next_scan(&mut self) -> ScanDescriptor;
    /// Update the plan with the result of the last prepared scan.
    fn advance(&mut self, result: &MeasurementResult);
    /// Bookkeeping for the result; runs after `advance`.
    fn process_result(&mut self, result: &MeasurementResult);
    fn is_complete(&self) -> bool;
    /// Fraction of the plan done, in `[0, 1]`.
    fn progress(&self) -> f64;
    fn report(&self) -> BatchReport;
}

/// The concrete batch types.
#[derive(Debug)]
pub enum BatchKind {
    Survey(Survey),
    DrScan(DrScan),
    List(ScanList),
    Amdor(AmdorBatch),
}

macro_rules! dispatch {
    ($self:ident, $plan:ident => $e:expr) => {
        match $self {
            BatchKind::Survey($plan) => $e,
            BatchKind::DrScan($plan) => $e,
            BatchKind::List($plan) => $e,
            BatchKind::Amdor($plan) => $e,
        }
    };
}

impl BatchPlan for BatchKind {
    fn kind(&self) -> &'static str {
        dispatch!(self, p => p.kind())
    }
    fn prepare_next_scan(&mut self) -> ScanDescriptor {
        dispatch!(self, p => p.prepare_next_scan())
    }
    fn advance(&mut self, result: &MeasurementResult) {
        dispatch!(self, p => p.advance(result));
    }
    fn process_result(&mut self, result: &MeasurementResult) {
        dispatch!(self, p => p.process_result(result));
    }
    fn is_complete(&self) -> bool {
        dispatch!(self, p => p.is_complete())
    }
    fn progress(&self) -> f64 {
        dispatch!(self, p => p.progress())
    }
    fn report(&self) -> BatchReport {
        dispatch!(self, p => p.report())
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("hardware fault during batch: {0}")]
    Hardware(#[from] HardwareFault),
    #[error("scan {got} arrived out of order (expected a number after {last})")]
    OutOfOrder { last: u64, got: u64 },
    #[error("no scan is outstanding")]
    NothingOutstanding,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub scans: usize,
    pub aborted: bool,
    pub report_path: Option<PathBuf>,
}

/// Drives a plan one scan at a time.
#[derive(Debug)]
pub struct BatchManager<P: BatchPlan> {
    plan: P,
    outstanding: bool,
    last_scan_number: Option<u64>,
    scans: usize,
    aborted: bool,
}

impl<P: BatchPlan> BatchManager<P> {
    #[must_use]
    pub fn new(plan: P) -> Self {
        BatchManager {
            plan,
            outstanding: false,
            last_scan_number: None,
            scans: 0,
            aborted: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn plan(&self) -> &P {
        &self.plan
    }

    #[inline]
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.aborted || self.plan.is_complete()
    }

    /// The next scan to run, or `None` when the batch is over or a scan is still outstanding.
    pub fn next_scan(&mut self) -> Option<ScanDescriptor> {
        if self.outstanding || self.is_finished() {
            return None;
        }
        self.outstanding = true;
        Some(self.plan.prepare_next_scan())
    }

    /// Feed back the result of the outstanding scan.
    ///
    /// # Errors
    /// `NothingOutstanding` if no scan was issued, `OutOfOrder` if scan numbers went backwards.
    pub fn submit(&mut self, result: &MeasurementResult) -> Result<(), BatchError> {
        if !self.outstanding {
            return Err(BatchError::NothingOutstanding);
        }
        if let Some(last) = self.last_scan_number {
            if result.scan_number <= last {
                return Err(BatchError::OutOfOrder {
                    last,
                    got: result.scan_number,
                });
            }
        }
        self.outstanding = false;
        self.last_scan_number = Some(result.scan_number);

        if !result.is_usable() {
            warn!(
                "scan {} ended with {:?}; stopping {} batch",
                result.scan_number,
                result.status,
                self.plan.kind()
            );
            self.aborted = true;
            return Ok(());
        }

        self.plan.advance(result);
        self.plan.process_result(result);
        self.scans += 1;
        debug!(
            "{} batch: scan {} done, {:.0}%",
            self.plan.kind(),
            result.scan_number,
            100.0 * self.plan.progress()
        );
        Ok(())
    }

    /// Hand whatever results exist to `writer`. An empty batch and write failures are logged,
    /// never returned.
    pub fn write_report<W: ReportWriter>(&mut self, writer: &mut W) -> Option<PathBuf> {
        let report = self.plan.report();
        if report.scans.is_empty() {
            warn!("{} batch produced no scans; no report written", self.plan.kind());
            return None;
        }
        match writer.write(&report) {
            Ok(path) => {
                info!("wrote {} batch report to {}", self.plan.kind(), path.display());
                Some(path)
            }
            Err(e) => {
                error!("could not write {} batch report: {e}", self.plan.kind());
                None
            }
        }
    }

    /// Run the plan to completion (or abort) and write the report.
    ///
    /// # Errors
    /// A hardware fault from the executor ends the batch; the partial report is still written
    /// before the fault is returned.
    pub fn run<E: ScanExecutor, W: ReportWriter>(
        &mut self,
        executor: &mut E,
        writer: &mut W,
    ) -> Result<BatchSummary, BatchError> {
        info!("starting {} batch", self.plan.kind());
        while let Some(scan) = self.next_scan() {
            match executor.execute(&scan) {
                Ok(result) => self.submit(&result)?,
                Err(fault) => {
                    error!("hardware fault, aborting {} batch: {fault}", self.plan.kind());
                    self.outstanding = false;
                    self.aborted = true;
                    self.write_report(writer);
                    return Err(fault.into());
                }
            }
        }
        let report_path = self.write_report(writer);
        info!(
            "{} batch {} after {} scans",
            self.plan.kind(),
            if self.aborted { "aborted" } else { "complete" },
            self.scans
        );
        Ok(BatchSummary {
            scans: self.scans,
            aborted: self.aborted,
            report_path,
        })
    }

    #[must_use]
    pub fn into_plan(self) -> P {
        self.plan
    }
}
