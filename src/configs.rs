#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::missing_errors_doc
)]

use std::path::PathBuf;
use std::time::Duration;

use gethostname::gethostname;

use crate::amdor::{AmdorBatch, AmdorConfig, AmdorLine};
use crate::batch::drscan::DrScanConfig;
use crate::batch::survey::SurveyConfig;
use crate::batch::{BatchKind, DrScan, ScanDescriptor, ScanList, Survey};
use crate::geometry::CavityGeometry;
use crate::sim::SimConfig;
use crate::tuner::{FineTuneServo, TunerConfig};
use crate::util::{tomlget, tomlget_opt, tomlget_or};

fn hostname() -> Result<String, String> {
    gethostname()
        .into_string()
        .map_err(|_| "failed to get hostname".to_string())
}

/// Spectrometer variant: `general.spectrometer`, unless a section named after this host
/// overrides it.
pub fn spectrometer_name(cfg: &toml::Value) -> Result<String, String> {
    let hostname = hostname()?;
    let hostname = hostname.as_str();
    if let Some(name) = tomlget_opt!(cfg, hostname, "spectrometer", as_str) {
        return Ok(name.to_string());
    }
    Ok(tomlget_or!(cfg, "general", "spectrometer", as_str, "ftm1").to_string())
}

/// Built-in geometry for the configured spectrometer, with any keys from its own section
/// (`[ftm1]` or `[ftm2]`) applied on top.
pub fn geometry_from_config(cfg: &toml::Value) -> Result<CavityGeometry, String> {
    let name = spectrometer_name(cfg)?;
    let mut out = CavityGeometry::for_spectrometer(&name)
        .ok_or_else(|| format!("unknown spectrometer {name}"))?;
    let sec = name.as_str();
    if let Some(r) = tomlget_opt!(cfg, sec, "mirror_radius_cm", as_float, f64) {
        out.mirror_radius_cm = r;
    }
    if let Some(l) = tomlget_opt!(cfg, sec, "min_length_cm", as_float, f64) {
        out.min_length_cm = l;
    }
    if let Some(l) = tomlget_opt!(cfg, sec, "max_length_cm", as_float, f64) {
        out.max_length_cm = l;
    }
    if let Some(l) = tomlget_opt!(cfg, sec, "l0_cm", as_float, f64) {
        out.l0_cm = l;
    }
    if let Some(t) = tomlget_opt!(cfg, sec, "ticks_per_cm", as_float, f64) {
        out.ticks_per_cm = t;
    }
    if out.min_length_cm >= out.max_length_cm {
        return Err(format!(
            "{name}: min_length_cm {} must be below max_length_cm {}",
            out.min_length_cm, out.max_length_cm
        ));
    }
    Ok(out)
}

pub fn tuner_config_from_config(cfg: &toml::Value) -> TunerConfig {
    let d = TunerConfig::default();
    TunerConfig {
        skip_rough_mhz: tomlget_or!(
            cfg,
            "tuner",
            "skip_rough_mhz",
            as_float,
            f64,
            d.skip_rough_mhz
        ),
        skip_fine_mhz: tomlget_or!(cfg, "tuner", "skip_fine_mhz", as_float, f64, d.skip_fine_mhz),
        skip_voltage_fraction: tomlget_or!(
            cfg,
            "tuner",
            "skip_voltage_fraction",
            as_float,
            f64,
            d.skip_voltage_fraction
        ),
        rough_start_offset_ticks: tomlget_or!(
            cfg,
            "tuner",
            "rough_start_offset_ticks",
            as_integer,
            i32,
            i64::from(d.rough_start_offset_ticks)
        ),
        lower_edge_shift_ticks: tomlget_or!(
            cfg,
            "tuner",
            "lower_edge_shift_ticks",
            as_integer,
            i32,
            i64::from(d.lower_edge_shift_ticks)
        ),
        upper_edge_shift_ticks: tomlget_or!(
            cfg,
            "tuner",
            "upper_edge_shift_ticks",
            as_integer,
            i32,
            i64::from(d.upper_edge_shift_ticks)
        ),
        max_edge_shifts: tomlget_or!(
            cfg,
            "tuner",
            "max_edge_shifts",
            as_integer,
            u32,
            i64::from(d.max_edge_shifts)
        ),
        blind_step_ticks: tomlget_or!(
            cfg,
            "tuner",
            "blind_step_ticks",
            as_integer,
            i32,
            i64::from(d.blind_step_ticks)
        ),
        max_rough_attempts: tomlget_or!(
            cfg,
            "tuner",
            "max_rough_attempts",
            as_integer,
            u32,
            i64::from(d.max_rough_attempts)
        ),
        max_rough_attempts_high_freq: tomlget_or!(
            cfg,
            "tuner",
            "max_rough_attempts_high_freq",
            as_integer,
            u32,
            i64::from(d.max_rough_attempts_high_freq)
        ),
        high_freq_mhz: tomlget_or!(cfg, "tuner", "high_freq_mhz", as_float, f64, d.high_freq_mhz),
        relaxed_threshold_mhz: tomlget_or!(
            cfg,
            "tuner",
            "relaxed_threshold_mhz",
            as_float,
            f64,
            d.relaxed_threshold_mhz
        ),
        kick_ticks: tomlget_or!(
            cfg,
            "tuner",
            "kick_ticks",
            as_integer,
            i32,
            i64::from(d.kick_ticks)
        ),
        cal_freq_mhz: tomlget_or!(cfg, "tuner", "cal_freq_mhz", as_float, f64, d.cal_freq_mhz),
        cal_mode: tomlget_or!(cfg, "tuner", "cal_mode", as_integer, u32, i64::from(d.cal_mode)),
        cal_search_center_ticks: tomlget_opt!(
            cfg,
            "tuner",
            "cal_search_center_ticks",
            as_integer,
            i32
        ),
        cal_search_offsets: tomlget_or!(
            cfg,
            "tuner",
            "cal_search_offsets",
            as_integer,
            u32,
            i64::from(d.cal_search_offsets)
        ),
        home_timeout: Duration::from_secs_f64(
            tomlget_or!(cfg, "tuner", "home_timeout_s", as_float, f64, 30.0).max(0.0),
        ),
    }
}

/// Fine-tune servo settings from the `[fine_tune]` table; missing keys take their defaults.
pub fn servo_from_config(cfg: &toml::Value) -> Result<FineTuneServo, String> {
    section(cfg, "fine_tune")
}

pub fn sim_from_config(cfg: &toml::Value) -> Result<SimConfig, String> {
    section(cfg, "sim")
}

#[must_use]
pub fn report_dir(cfg: &toml::Value) -> PathBuf {
    PathBuf::from(tomlget_or!(cfg, "general", "report_dir", as_str, "reports"))
}

#[must_use]
pub fn log_level(cfg: &toml::Value) -> tracing::Level {
    let level = cfg
        .get("general")
        .and_then(|sec| sec.get("log_level"))
        .and_then(toml::Value::as_str)
        .unwrap_or("info");
    level.parse().unwrap_or_else(|_| {
        eprintln!("unknown log level {level}; using info");
        tracing::Level::INFO
    })
}

pub fn amdor_config_from_config(cfg: &toml::Value) -> AmdorConfig {
    let d = AmdorConfig::default();
    AmdorConfig {
        threshold: tomlget_or!(cfg, "amdor", "threshold", as_float, f64, d.threshold),
        exclude_range_mhz: tomlget_or!(
            cfg,
            "amdor",
            "exclude_range_mhz",
            as_float,
            f64,
            d.exclude_range_mhz
        ),
        dr_min_mhz: tomlget_or!(cfg, "amdor", "dr_min_mhz", as_float, f64, d.dr_min_mhz),
        dr_max_mhz: tomlget_or!(cfg, "amdor", "dr_max_mhz", as_float, f64, d.dr_max_mhz),
        max_children: tomlget_or!(
            cfg,
            "amdor",
            "max_children",
            as_integer,
            usize,
            d.max_children as i64
        ),
        cal_interval: tomlget_or!(
            cfg,
            "amdor",
            "cal_interval",
            as_integer,
            usize,
            d.cal_interval as i64
        ),
    }
}

/// Build the AMDOR planner from `[amdor]` and its `[[amdor.lines]]` list. Malformed lines and
/// links are skipped with a warning, but at least one usable line is required. A calibration
/// template is made when `amdor.calibrate` is set.
pub fn amdor_from_config(cfg: &toml::Value) -> Result<AmdorBatch, String> {
    let config = amdor_config_from_config(cfg);
    let template = scan_template(cfg, "amdor");

    let mut lines = Vec::new();
    // config position -> position in `lines`, `None` for skipped entries
    let mut loaded = Vec::new();
    for (k, line) in tomlget!(cfg, "amdor", "lines", as_array).iter().enumerate() {
        let Some(freq_mhz) = line.get("freq_mhz").and_then(toml::Value::as_float) else {
            tracing::warn!("skipping amdor line {k}: no freq_mhz");
            loaded.push(None);
            continue;
        };
        loaded.push(Some(lines.len()));
        if line
            .get("dr_only")
            .and_then(toml::Value::as_bool)
            .unwrap_or(false)
        {
            lines.push(AmdorLine::dr_only(freq_mhz));
            continue;
        }
        let mut scan = template.clone();
        if let Some(atten) = line.get("attenuation_db").and_then(toml::Value::as_float) {
            scan.attenuation_db = atten;
        }
        lines.push(AmdorLine::new(freq_mhz, scan));
    }

    let mut links = Vec::new();
    if let Some(pairs) = cfg
        .get("amdor")
        .and_then(|sec| sec.get("links"))
        .and_then(toml::Value::as_array)
    {
        for pair in pairs {
            let Some([a, b]) = pair.as_array().map(Vec::as_slice) else {
                tracing::warn!("skipping malformed amdor link {pair}");
                continue;
            };
            let index = |v: &toml::Value| {
                v.as_integer()
                    .and_then(|k| usize::try_from(k).ok())
                    .and_then(|k| loaded.get(k).copied().flatten())
            };
            match (index(a), index(b)) {
                (Some(a), Some(b)) => links.push((a, b)),
                _ => tracing::warn!("skipping amdor link {pair}: no such loaded line"),
            }
        }
    }
    if lines.is_empty() {
        return Err("no usable amdor lines in config".to_string());
    }

    let cal_template = cal_template(cfg, "amdor", &template);
    Ok(AmdorBatch::new(config, lines, &links, cal_template))
}

/// Scan settings shared by every scan of a batch section.
/// Build a scan list from `[list]` and its `[[list.scans]]` entries. Each entry needs
/// `ft_freq_mhz` and may set `dr_freq_mhz`, `attenuation_db` and `shots`; malformed entries are
/// skipped with a warning.
pub fn scan_list_from_config(cfg: &toml::Value) -> Result<ScanList, String> {
    let template = scan_template(cfg, "list");
    let mut scans = Vec::new();
    for (k, entry) in tomlget!(cfg, "list", "scans", as_array).iter().enumerate() {
        let Some(ft_freq) = entry.get("ft_freq_mhz").and_then(toml::Value::as_float) else {
            tracing::warn!("skipping list scan {k}: no ft_freq_mhz");
            continue;
        };
        let mut scan = template.clone().with_ft_freq(ft_freq);
        if let Some(dr_freq) = entry.get("dr_freq_mhz").and_then(toml::Value::as_float) {
            scan = scan.with_dr(dr_freq);
        }
        if let Some(atten) = entry.get("attenuation_db").and_then(toml::Value::as_float) {
            scan.attenuation_db = atten;
        }
        if let Some(shots) = entry
            .get("shots")
            .and_then(toml::Value::as_integer)
            .and_then(|n| u32::try_from(n).ok())
        {
            scan.target_shots = shots;
        }
        scans.push(scan);
    }
    if scans.is_empty() {
        return Err("no usable scans in [list]".to_string());
    }
    let cal = cal_template(cfg, "list", &template);
    Ok(ScanList::new(scans, cal))
}

fn scan_template(cfg: &toml::Value, sec: &str) -> ScanDescriptor {
    ScanDescriptor {
        target_shots: tomlget_or!(cfg, sec, "shots", as_integer, u32, 10),
        attenuation_db: tomlget_or!(cfg, sec, "attenuation_db", as_float, f64, 0.0),
        dr_power_dbm: tomlget_or!(cfg, sec, "dr_power_dbm", as_float, f64, 17.0),
        ..ScanDescriptor::default()
    }
}

fn cal_template(
    cfg: &toml::Value,
    sec: &str,
    template: &ScanDescriptor,
) -> Option<ScanDescriptor> {
    if tomlget_or!(cfg, sec, "calibrate", as_bool, false) {
        let tuner = tuner_config_from_config(cfg);
        Some(template.clone().with_ft_freq(tuner.cal_freq_mhz))
    } else {
        None
    }
}

fn section<T: serde::de::DeserializeOwned + Default>(
    cfg: &toml::Value,
    sec: &str,
) -> Result<T, String> {
    match cfg.get(sec) {
        Some(val) => val
            .clone()
            .try_into()
            .map_err(|e| format!("failed to read [{sec}]: {e}")),
        None => Ok(T::default()),
    }
}

/// The batch named by `general.batch` (`amdor`, `survey`, `drscan`, or `list` for a fixed scan
/// list, also accepted as `batch`), built from its section.
pub fn batch_from_config(cfg: &toml::Value) -> Result<BatchKind, String> {
    match tomlget_or!(cfg, "general", "batch", as_str, "amdor") {
        "amdor" => Ok(BatchKind::Amdor(amdor_from_config(cfg)?)),
        "survey" => {
            let config: SurveyConfig = section(cfg, "survey")?;
            let template = scan_template(cfg, "survey");
            let cal = cal_template(cfg, "survey", &template);
            Ok(BatchKind::Survey(Survey::new(config, template, cal)))
        }
        "drscan" => {
            let config: DrScanConfig = section(cfg, "drscan")?;
            let ft_freq = tomlget!(cfg, "drscan", "ft_freq_mhz", as_float, f64);
            let template = scan_template(cfg, "drscan").with_ft_freq(ft_freq);
            Ok(BatchKind::DrScan(DrScan::new(config, template)))
        }
        "list" | "batch" => Ok(BatchKind::List(scan_list_from_config(cfg)?)),
        other => Err(format!("unknown batch type {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchPlan;

    fn parse(text: &str) -> toml::Value {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn defaults_without_sections() {
        let cfg = parse("[general]\n");
        assert_eq!(spectrometer_name(&cfg).unwrap(), "ftm1");
        assert_eq!(geometry_from_config(&cfg).unwrap(), CavityGeometry::ftm1());
        let tuner = tuner_config_from_config(&cfg);
        assert_eq!(tuner.max_rough_attempts, 10);
        assert_eq!(tuner.home_timeout, Duration::from_secs(30));
        assert_eq!(servo_from_config(&cfg).unwrap().max_steps, 30);
        assert_eq!(report_dir(&cfg), PathBuf::from("reports"));
        assert_eq!(log_level(&cfg), tracing::Level::INFO);
        assert!(amdor_from_config(&cfg).is_err());
    }

    #[test]
    fn host_section_selects_spectrometer() {
        let host = gethostname().into_string().unwrap();
        let cfg = parse(&format!(
            "[general]\nspectrometer = \"ftm1\"\n[\"{host}\"]\nspectrometer = \"ftm2\"\n\
             [ftm2]\nticks_per_cm = 10000.0\n"
        ));
        let geo = geometry_from_config(&cfg).unwrap();
        assert_eq!(geo.mirror_radius_cm, 36.0);
        assert_eq!(geo.ticks_per_cm, 10_000.0);
    }

    #[test]
    fn rejects_bad_geometry() {
        let cfg = parse("[general]\nspectrometer = \"ftm1\"\n[ftm1]\nmin_length_cm = 80.0\n");
        assert!(geometry_from_config(&cfg).is_err());
        let cfg = parse("[general]\nspectrometer = \"ftm9\"\n");
        assert!(geometry_from_config(&cfg).is_err());
    }

    #[test]
    fn reads_tuner_and_servo() {
        let cfg = parse(
            "[tuner]\nkick_ticks = 80\ncal_mode = 40\ncal_search_center_ticks = 12000\n\
             [fine_tune]\nmax_steps = 12\nvoltage_fraction = 0.8\n",
        );
        let tuner = tuner_config_from_config(&cfg);
        assert_eq!(tuner.kick_ticks, 80);
        assert_eq!(tuner.cal_mode, 40);
        assert_eq!(tuner.cal_search_center_ticks, Some(12_000));
        let servo = servo_from_config(&cfg).unwrap();
        assert_eq!(servo.max_steps, 12);
        assert_eq!(servo.voltage_fraction, 0.8);
    }

    #[test]
    fn builds_amdor_batch() {
        let cfg = parse(
            r#"
[amdor]
threshold = 0.4
max_children = 2
calibrate = true
links = [[0, 2]]

[[amdor.lines]]
freq_mhz = 10000.0

[[amdor.lines]]
freq_mhz = 11000.0
attenuation_db = 10.0

[[amdor.lines]]
freq_mhz = 12000.0

[[amdor.lines]]
freq_mhz = 60000.0
dr_only = true
"#,
        );
        let mut batch = amdor_from_config(&cfg).unwrap();
        assert_eq!(batch.lines().len(), 4);
        assert!(batch.lines()[3].dr_only);
        assert_eq!(batch.lines()[1].template.attenuation_db, 10.0);
        assert!(batch.matrix().get(0, 2));
        assert_eq!(batch.forest().completed().len(), 1);
        assert_eq!(batch.kind(), "amdor");
        let first = batch.prepare_next_scan();
        assert_eq!(first.ft_freq_mhz, 10_000.0);
        assert!(!first.dr_enabled());
    }

    #[test]
    fn selects_batch_type() {
        let cfg = parse(
            "[general]\nbatch = \"survey\"\n[survey]\nstart_mhz = 9000.0\nstop_mhz = 9001.0\n\
             step_mhz = 0.25\nshots = 50\n",
        );
        let BatchKind::Survey(survey) = batch_from_config(&cfg).unwrap() else {
            panic!("expected a survey");
        };
        assert_eq!(survey.points(), 5);

        let cfg = parse("[general]\nbatch = \"drscan\"\n[drscan]\nstart_mhz = 60000.0\n");
        assert!(batch_from_config(&cfg).is_err());
        let cfg = parse("[general]\nbatch = \"drscan\"\n[drscan]\nft_freq_mhz = 12000.0\n");
        assert_eq!(batch_from_config(&cfg).unwrap().kind(), "drscan");

        let cfg = parse("[general]\nbatch = \"categorize\"\n");
        assert!(batch_from_config(&cfg).is_err());
    }

    #[test]
    fn builds_scan_list() {
        let cfg = parse(
            "[general]\nbatch = \"list\"\n[list]\nshots = 20\ncalibrate = true\n\
             [[list.scans]]\nft_freq_mhz = 9000.0\n\
             [[list.scans]]\nft_freq_mhz = 9100.0\ndr_freq_mhz = 60000.0\nattenuation_db = 6.0\n\
             [[list.scans]]\nfreq_mhz = 9200.0\n\
             [[list.scans]]\nft_freq_mhz = 9300.0\nshots = 5\n",
        );
        let BatchKind::List(list) = batch_from_config(&cfg).unwrap() else {
            panic!("expected a scan list");
        };
        let freqs: Vec<f64> = list.scans().iter().map(|s| s.ft_freq_mhz).collect();
        assert_eq!(freqs, vec![9000.0, 9100.0, 9300.0]);
        assert_eq!(list.scans()[0].target_shots, 20);
        assert_eq!(list.scans()[0].dr_freq_mhz, 0.0);
        assert_eq!(list.scans()[1].dr_freq_mhz, 60_000.0);
        assert_eq!(list.scans()[1].attenuation_db, 6.0);
        assert_eq!(list.scans()[2].target_shots, 5);
        assert_eq!(list.report().header["calibrate"], "true");

        let cfg = parse("[general]\nbatch = \"batch\"\n[[list.scans]]\nft_freq_mhz = 9000.0\n");
        assert_eq!(batch_from_config(&cfg).unwrap().kind(), "batch");

        let cfg = parse("[general]\nbatch = \"list\"\n[[list.scans]]\nfreq_mhz = 9000.0\n");
        assert!(batch_from_config(&cfg).is_err());
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let cfg = parse(
            "[amdor]\nlinks = [[0, 1, 2], [0, -1], [0, 1]]\n\
             [[amdor.lines]]\nfreq_mhz = 10000.0\n\
             [[amdor.lines]]\nfrequency = 10100.0\n\
             [[amdor.lines]]\nfreq_mhz = 10200.0\n",
        );
        let batch = amdor_from_config(&cfg).unwrap();
        assert_eq!(batch.lines().len(), 2);
        // the only well-formed link names the skipped line
        assert!(!batch.matrix().get(0, 1));
        assert_eq!(batch.matrix().completed_pairs(), 0);
        assert!(batch.forest().completed().is_empty());

        let cfg = parse(
            "[amdor]\nlinks = [[1, 3], [0, 2]]\n\
             [[amdor.lines]]\nfreq_mhz = 10000.0\n\
             [[amdor.lines]]\nfreq_mhz = 10100.0\n\
             [[amdor.lines]]\nfreq_mhz = \"10200\"\n\
             [[amdor.lines]]\nfreq_mhz = 10300.0\n",
        );
        let batch = amdor_from_config(&cfg).unwrap();
        let freqs: Vec<f64> = batch.lines().iter().map(|l| l.freq_mhz).collect();
        assert_eq!(freqs, vec![10_000.0, 10_100.0, 10_300.0]);
        // [1, 3] follows the lines past the gap; [0, 2] is dropped
        assert!(batch.matrix().get(1, 2));
        assert!(!batch.matrix().get(0, 2));
        assert_eq!(batch.matrix().completed_pairs(), 1);

        let cfg = parse("[amdor]\nlines = [{ frequency = 1.0 }]\n");
        assert!(amdor_from_config(&cfg).is_err());
    }

    #[test]
    fn sim_section_deserializes() {
        let cfg = parse(
            "[sim]\npeak_mv = 1500.0\nlinks = [[10000.0, 11000.0]]\n\
             [[sim.lines]]\nfreq_mhz = 10000.0\nintensity = 3.0\n",
        );
        let sim = sim_from_config(&cfg).unwrap();
        assert_eq!(sim.peak_mv, 1500.0);
        assert_eq!(sim.lines.len(), 1);
        assert_eq!(sim.links, vec![(10_000.0, 11_000.0)]);
        assert_eq!(sim.half_width_mhz, 0.5);
    }
}
