#![warn(clippy::pedantic)]
#![warn(clippy::all)]

use std::env;
use std::fs::read_to_string;
use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info};

use ftmctl::batch::report::TomlReportWriter;
use ftmctl::batch::BatchManager;
use ftmctl::configs;
use ftmctl::sim::{SimulatedCavity, SimulatedSpectrometer};
use ftmctl::tuner::CavityTuner;

fn main() -> ExitCode {
    let cfg_name = env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let Some(cfg_path) = ftmctl::find_file(&PathBuf::from(&cfg_name)) else {
        eprintln!("Failed to find config file {cfg_name}");
        return ExitCode::FAILURE;
    };
    let cfg: toml::Value = match read_to_string(&cfg_path)
        .map_err(|e| e.to_string())
        .and_then(|text| toml::from_str(&text).map_err(|e| e.to_string()))
    {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to read config file {}: {e}", cfg_path.display());
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(configs::log_level(&cfg))
        .init();
    info!("Read config file {}", cfg_path.display());

    match run(&cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cfg: &toml::Value) -> Result<(), String> {
    let geometry = configs::geometry_from_config(cfg)?;
    info!(
        "Spectrometer {}: {:.1} to {:.1} cm",
        configs::spectrometer_name(cfg)?,
        geometry.min_length_cm,
        geometry.max_length_cm
    );
    let sim = configs::sim_from_config(cfg)?;
    let tuner = CavityTuner::new(
        geometry,
        configs::tuner_config_from_config(cfg),
        configs::servo_from_config(cfg)?,
    )
    .with_seed(sim.seed);
    let cavity = SimulatedCavity::from_config(geometry, &sim);
    let mut spectrometer = SimulatedSpectrometer::new(cavity, tuner, &sim);

    let mut manager = BatchManager::new(configs::batch_from_config(cfg)?);
    let mut writer = TomlReportWriter::new(configs::report_dir(cfg));
    let summary = manager
        .run(&mut spectrometer, &mut writer)
        .map_err(|e| e.to_string())?;

    match summary.report_path {
        Some(path) => info!("{} scans; report written to {}", summary.scans, path.display()),
        None => info!("{} scans; no report written", summary.scans),
    }
    if let Some(state) = spectrometer.tuner().state() {
        info!(
            "Cavity left on mode {} at {:.3} MHz ({} mV)",
            state.last_mode, state.last_freq_mhz, state.last_peak_mv
        );
    }
    Ok(())
}
