#![warn(clippy::pedantic)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;

use super::{MeasurementResult, ScanDescriptor};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not serialize report: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// One line of a batch log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanRecord {
    pub scan_number: u64,
    pub label: String,
    pub ft_freq_mhz: f64,
    pub dr_freq_mhz: f64,
    pub dr_enabled: bool,
    pub calibration: bool,
    pub tuning_voltage_mv: i32,
    pub bad_tune: bool,
    pub intensity: f64,
}

impl ScanRecord {
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        scan: &ScanDescriptor,
        result: &MeasurementResult,
    ) -> Self {
        ScanRecord {
            scan_number: result.scan_number,
            label: label.into(),
            ft_freq_mhz: scan.ft_freq_mhz,
            dr_freq_mhz: scan.dr_freq_mhz,
            dr_enabled: scan.dr_enabled(),
            calibration: scan.calibration,
            tuning_voltage_mv: result.tuning_voltage_mv,
            bad_tune: result.bad_tune,
            intensity: result.intensity,
        }
    }
}

/// A pair of lines found to share an energy level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkRecord {
    pub ft_index: usize,
    pub dr_index: usize,
    pub ft_freq_mhz: f64,
    pub dr_freq_mhz: f64,
    pub reference_intensity: f64,
    pub dr_intensity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub kind: String,
    pub date: DateTime<Local>,
    pub complete: bool,
    /// Line indices of each finished linkage tree, depth first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trees: Vec<Vec<usize>>,
    pub header: BTreeMap<String, String>,
    pub scans: Vec<ScanRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<LinkRecord>,
}

impl BatchReport {
    #[must_use]
    pub fn new(kind: &str, complete: bool) -> Self {
        BatchReport {
            kind: kind.to_string(),
            date: Local::now(),
            complete,
            header: BTreeMap::new(),
            scans: Vec::new(),
            links: Vec::new(),
            trees: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, key: &str, value: impl ToString) -> Self {
        self.header.insert(key.to_string(), value.to_string());
        self
    }
}

pub trait ReportWriter {
    /// Persist `report` and return where it went.
    /// # Errors
    /// Any failure to create or write the destination.
    fn write(&mut self, report: &BatchReport) -> Result<PathBuf, ReportError>;
}

/// Writes each report to `<dir>/<kind>/<n>.toml`, picking the first unused `n`.
#[derive(Debug, Clone)]
pub struct TomlReportWriter {
    dir: PathBuf,
}

impl TomlReportWriter {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        TomlReportWriter { dir: dir.into() }
    }

    fn next_path(dir: &Path) -> PathBuf {
        let mut n = 1;
        loop {
            let candidate = dir.join(format!("{n}.toml"));
            if !candidate.exists() {
                return candidate;
            }
            n += 1;
        }
    }
}

impl ReportWriter for TomlReportWriter {
    fn write(&mut self, report: &BatchReport) -> Result<PathBuf, ReportError> {
        let dir = self.dir.join(&report.kind);
        fs::create_dir_all(&dir)?;
        let text = toml::to_string(report)?;
        let path = Self::next_path(&dir);
        fs::write(&path, text)?;
        Ok(path)
    }
}

/// Keeps reports in memory.
#[derive(Debug, Default)]
pub struct MemoryReportWriter {
    pub reports: Vec<BatchReport>,
}

impl ReportWriter for MemoryReportWriter {
    fn write(&mut self, report: &BatchReport) -> Result<PathBuf, ReportError> {
        self.reports.push(report.clone());
        Ok(PathBuf::from(format!("memory/{}", self.reports.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ScanStatus;

    fn sample_report() -> BatchReport {
        let scan = ScanDescriptor::default().with_dr(12_000.0);
        let result = MeasurementResult {
            scan_number: 12,
            tuning_voltage_mv: 1400,
            bad_tune: false,
            intensity: 3.5,
            status: ScanStatus::Completed,
        };
        let mut report = BatchReport::new("amdor", true).with_header("threshold", 0.5);
        report.scans.push(ScanRecord::new("dr 0-1", &scan, &result));
        report
    }

    #[test]
    fn toml_writer_numbers_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = TomlReportWriter::new(dir.path());
        let first = writer.write(&sample_report()).unwrap();
        let second = writer.write(&sample_report()).unwrap();
        assert_eq!(first, dir.path().join("amdor").join("1.toml"));
        assert_eq!(second, dir.path().join("amdor").join("2.toml"));

        let text = fs::read_to_string(first).unwrap();
        let parsed: toml::Value = toml::from_str(&text).unwrap();
        assert_eq!(parsed["kind"].as_str(), Some("amdor"));
        assert_eq!(parsed["header"]["threshold"].as_str(), Some("0.5"));
        assert_eq!(parsed["scans"][0]["scan_number"].as_integer(), Some(12));
    }

    #[test]
    fn toml_writer_reports_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "not a directory").unwrap();
        let mut writer = TomlReportWriter::new(&blocker);
        assert!(matches!(
            writer.write(&sample_report()),
            Err(ReportError::Io(_))
        ));
    }
}
