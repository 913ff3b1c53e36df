//! Run configuration for one calibration iteration.
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::fit::MinimizerConfig;
use crate::region::{CalibrationGranularity, RegionRange, SubdetectorSelection};

/// Nominal neutral pion mass in GeV
pub const PI0_MASS: f64 = 0.1349768;
/// Nominal eta meson mass in GeV
pub const ETA_MASS: f64 = 0.547862;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("the iteration index must be non-negative, got {0}")]
    NegativeIteration(i64),
    #[error("unknown calibration granularity {0:?}, expected one of xtal, tt or etaring")]
    UnknownGranularity(String),
    #[error("unknown sub-detector selection {0:?}")]
    UnknownSubdetector(String),
    #[error("unknown particle hypothesis {0:?}, expected pi0 or eta")]
    UnknownParticle(String),
    #[error("the signal model has one or two Gaussian components, got {0}")]
    InvalidSignalModel(usize),
    #[error("iteration {0} needs the calibration map of the previous iteration")]
    MissingPriorMap(u32),
    #[error("the region range [{start}, {end}] is empty")]
    InvalidRegionRange { start: usize, end: usize },
    #[error("{name} must be finite and non-negative, got {value}")]
    InvalidThreshold { name: &'static str, value: f64 },
}

/// The decaying particle whose mass peak is fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ParticleHypothesis {
    #[default]
    Pi0,
    Eta,
}

impl ParticleHypothesis {
    pub const fn nominal_mass(&self) -> f64 {
        match self {
            Self::Pi0 => PI0_MASS,
            Self::Eta => ETA_MASS,
        }
    }
}

impl Display for ParticleHypothesis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pi0 => f.write_str("pi0"),
            Self::Eta => f.write_str("eta"),
        }
    }
}

impl FromStr for ParticleHypothesis {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pi0" => Ok(Self::Pi0),
            "eta" => Ok(Self::Eta),
            _ => Err(ConfigError::UnknownParticle(s.to_string())),
        }
    }
}

/// The number of Gaussian components describing a mass peak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SignalModel {
    #[default]
    SingleGaussian,
    /// A narrow core and a wide tail Gaussian sharing one mean
    DoubleGaussian,
}

impl SignalModel {
    pub fn from_components(n: usize) -> Result<Self, ConfigError> {
        match n {
            1 => Ok(Self::SingleGaussian),
            2 => Ok(Self::DoubleGaussian),
            _ => Err(ConfigError::InvalidSignalModel(n)),
        }
    }
}

/// What the per-region distributions hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PeakKind {
    /// Invariant masses of photon pairs
    #[default]
    Mass,
    /// Relative deviations of the pair mass from its nominal value
    Epsilon,
}

/// Minimum entries a distribution must hold before it is fit
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StatisticsThresholds {
    pub simple_peak: f64,
    pub mass_barrel: f64,
    pub mass_endcap: f64,
    pub ratio: f64,
}

impl Default for StatisticsThresholds {
    fn default() -> Self {
        Self {
            simple_peak: 20.0,
            mass_barrel: 60.0,
            mass_endcap: 70.0,
            ratio: 100.0,
        }
    }
}

impl StatisticsThresholds {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("simple-peak threshold", self.simple_peak),
            ("barrel mass threshold", self.mass_barrel),
            ("endcap mass threshold", self.mass_endcap),
            ("ratio threshold", self.ratio),
        ] {
            check_non_negative(name, value)?;
        }
        Ok(())
    }
}

fn check_non_negative(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidThreshold { name, value })
    }
}

/// Convert a signed iteration index, rejecting negative values
pub fn iteration_index(value: i64) -> Result<u32, ConfigError> {
    u32::try_from(value).map_err(|_| ConfigError::NegativeIteration(value))
}

/// Everything that varies between calibration jobs
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// The zero-based index of this iteration
    pub iteration: u32,
    /// The regions this job processes, applied to each selected sub-detector
    pub region_range: RegionRange,
    pub subdetectors: SubdetectorSelection,
    pub granularity: CalibrationGranularity,
    pub hypothesis: ParticleHypothesis,
    pub signal_model: SignalModel,
    pub peak_kind: PeakKind,
    /// Fit reconstructed over true energy for each photon instead of the pair
    pub eover_etrue: bool,
    pub thresholds: StatisticsThresholds,
    /// The reduced chi-square above which a simple-peak fit is retried
    pub chi2_threshold: f64,
    /// How close a fitted mass must be to its upper limit to count as a runaway
    pub boundary_tolerance: f64,
    /// The maximum number of mass fit retries
    pub max_retries: usize,
    /// Keep the fitted model of every attempt for offline inspection
    pub store_diagnostics: bool,
    /// The calibration map written by the previous iteration
    pub prior_map: Option<PathBuf>,
    /// The previous iteration's map for the second photon in ratio mode
    pub prior_map_secondary: Option<PathBuf>,
    pub minimizer: MinimizerConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            iteration: 0,
            region_range: RegionRange::default(),
            subdetectors: SubdetectorSelection::Both,
            granularity: CalibrationGranularity::Crystal,
            hypothesis: ParticleHypothesis::Pi0,
            signal_model: SignalModel::SingleGaussian,
            peak_kind: PeakKind::Mass,
            eover_etrue: false,
            thresholds: StatisticsThresholds::default(),
            chi2_threshold: 11.0,
            boundary_tolerance: 1e-7,
            max_retries: 3,
            store_diagnostics: false,
            prior_map: None,
            prior_map_secondary: None,
            minimizer: MinimizerConfig::default(),
        }
    }
}

impl CalibrationConfig {
    pub fn iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn region_range(mut self, region_range: RegionRange) -> Self {
        self.region_range = region_range;
        self
    }

    pub fn subdetectors(mut self, subdetectors: SubdetectorSelection) -> Self {
        self.subdetectors = subdetectors;
        self
    }

    pub fn granularity(mut self, granularity: CalibrationGranularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn hypothesis(mut self, hypothesis: ParticleHypothesis) -> Self {
        self.hypothesis = hypothesis;
        self
    }

    pub fn signal_model(mut self, signal_model: SignalModel) -> Self {
        self.signal_model = signal_model;
        self
    }

    pub fn peak_kind(mut self, peak_kind: PeakKind) -> Self {
        self.peak_kind = peak_kind;
        self
    }

    pub fn eover_etrue(mut self, eover_etrue: bool) -> Self {
        self.eover_etrue = eover_etrue;
        self
    }

    pub fn thresholds(mut self, thresholds: StatisticsThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn chi2_threshold(mut self, chi2_threshold: f64) -> Self {
        self.chi2_threshold = chi2_threshold;
        self
    }

    pub fn boundary_tolerance(mut self, boundary_tolerance: f64) -> Self {
        self.boundary_tolerance = boundary_tolerance;
        self
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn store_diagnostics(mut self, store_diagnostics: bool) -> Self {
        self.store_diagnostics = store_diagnostics;
        self
    }

    pub fn prior_map(mut self, path: impl Into<PathBuf>) -> Self {
        self.prior_map = Some(path.into());
        self
    }

    pub fn prior_map_secondary(mut self, path: impl Into<PathBuf>) -> Self {
        self.prior_map_secondary = Some(path.into());
        self
    }

    pub fn minimizer(mut self, minimizer: MinimizerConfig) -> Self {
        self.minimizer = minimizer;
        self
    }

    /// Reject configurations that cannot describe a valid iteration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.region_range.validate()?;
        if self.iteration > 0 && self.prior_map.is_none() {
            return Err(ConfigError::MissingPriorMap(self.iteration));
        }
        if self.eover_etrue && self.iteration > 0 && self.prior_map_secondary.is_none() {
            return Err(ConfigError::MissingPriorMap(self.iteration));
        }
        self.thresholds.validate()?;
        check_non_negative("chi-square threshold", self.chi2_threshold)?;
        check_non_negative("boundary tolerance", self.boundary_tolerance)?;
        Ok(())
    }
}
