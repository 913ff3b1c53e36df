use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

use ecalcalib::calib_map::{CalibrationMap, TabulatedTopology};
use ecalcalib::config::{iteration_index, CalibrationConfig, PeakKind, SignalModel};
use ecalcalib::driver::{CalibrationError, RegionIterationDriver};
use ecalcalib::region::{CalibrationGranularity, RegionRange, SubdetectorSelection};
use ecalcalib::report;
use ecalcalib::store::{HistogramKind, Photon, RegionHistogramStore};
use ecalcalib::text;

/// Run one calibration iteration over a range of regions
#[derive(Parser, Debug)]
#[command(name = "ecalcalib")]
#[command(version)]
struct Cli {
    /// Region histograms, one per line as `name<TAB>x_min<TAB>x_max<TAB>counts`
    #[arg(long)]
    histograms: PathBuf,

    /// Cell table listing each cell's position and region indices
    #[arg(long)]
    cells: PathBuf,

    /// Where to write the updated calibration map
    #[arg(long, short = 'o', default_value = "calibMap.txt")]
    output: PathBuf,

    /// Zero-based iteration index
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    iteration: i64,

    /// The previous iteration's calibration map
    #[arg(long)]
    prior_map: Option<PathBuf>,

    /// The previous iteration's map for the second photon
    #[arg(long)]
    prior_map_g2: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    first_region: usize,

    #[arg(long)]
    last_region: Option<usize>,

    /// barrel, endcap or both
    #[arg(long, default_value = "both")]
    subdetectors: String,

    /// xtal, tt or etaring
    #[arg(long, default_value = "xtal")]
    granularity: String,

    /// pi0 or eta
    #[arg(long, default_value = "pi0")]
    particle: String,

    /// Number of Gaussian components in the mass peak model
    #[arg(long, default_value_t = 1)]
    gaussians: usize,

    /// Fit relative deviations with the simple-peak model instead of masses
    #[arg(long)]
    epsilon: bool,

    /// Fit reconstructed over true energy for each photon
    #[arg(long)]
    eover_etrue: bool,

    /// Write every fit attempt's model next to the map
    #[arg(long)]
    store_diagnostics: bool,

    #[arg(long, default_value_t = 11.0)]
    chi2_threshold: f64,

    #[arg(long, default_value_t = 3)]
    max_retries: usize,
}

impl Cli {
    fn config(&self) -> Result<CalibrationConfig, CalibrationError> {
        let mut config = CalibrationConfig::default()
            .iteration(iteration_index(self.iteration)?)
            .region_range(RegionRange::new(
                self.first_region,
                self.last_region.unwrap_or(usize::MAX),
            ))
            .subdetectors(self.subdetectors.parse::<SubdetectorSelection>()?)
            .granularity(self.granularity.parse::<CalibrationGranularity>()?)
            .hypothesis(self.particle.parse()?)
            .signal_model(SignalModel::from_components(self.gaussians)?)
            .peak_kind(if self.epsilon { PeakKind::Epsilon } else { PeakKind::Mass })
            .eover_etrue(self.eover_etrue)
            .store_diagnostics(self.store_diagnostics)
            .chi2_threshold(self.chi2_threshold)
            .max_retries(self.max_retries);
        if let Some(path) = &self.prior_map {
            config = config.prior_map(path);
        }
        if let Some(path) = &self.prior_map_g2 {
            config = config.prior_map_secondary(path);
        }
        config.validate()?;
        Ok(config)
    }
}

fn write_with<F>(path: &Path, f: F) -> Result<(), CalibrationError>
where
    F: FnOnce(&mut dyn Write) -> std::io::Result<()>,
{
    let mut writer = text::create(path)?;
    f(&mut writer)?;
    writer.flush()?;
    log::info!("Wrote {}", path.display());
    Ok(())
}

fn run(cli: Cli) -> Result<(), CalibrationError> {
    let config = cli.config()?;
    let topology = TabulatedTopology::load(&cli.cells, config.granularity)?;
    let store = RegionHistogramStore::load(&cli.histograms)?;

    let mut driver = RegionIterationDriver::new(config.clone(), store, topology)?;
    let primary = if config.eover_etrue {
        HistogramKind::EoverEtrue(Photon::First)
    } else {
        HistogramKind::Epsilon
    };
    if let Some(path) = &config.prior_map {
        driver = driver.with_prior_map(primary, CalibrationMap::load(path)?);
    }
    if config.eover_etrue {
        if let Some(path) = &config.prior_map_secondary {
            driver = driver.with_prior_map(
                HistogramKind::EoverEtrue(Photon::Second),
                CalibrationMap::load(path)?,
            );
        }
    }

    driver.run_pass(config.subdetectors)?;

    write_with(&report::diagnostics_path(&cli.output), |w| {
        report::write_diagnostics(w, driver.reports())
    })?;
    if config.store_diagnostics {
        write_with(&report::fit_results_path(&cli.output), |w| {
            report::write_snapshots(w, driver.reports())
        })?;
    }
    let kinds: Vec<HistogramKind> = driver.streams().collect();
    for kind in kinds.iter().copied() {
        if let Some(map) = driver.map(kind) {
            let path = report::stream_map_path(&cli.output, kind);
            let grids = report::coefficient_grids(map, driver.topology());
            write_with(&report::grid_path(&path), |w| {
                for grid in grids.iter() {
                    grid.write(w)?;
                }
                Ok(())
            })?;
        }
    }
    for (kind, map) in driver.into_maps() {
        let path = report::stream_map_path(&cli.output, kind);
        let header = report::map_header(&config, kind);
        write_with(&path, |w| text::write_calibration_map(w, &map, &header))?;
    }
    Ok(())
}

fn main() -> ExitCode {
    pretty_env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Calibration failed: {e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
