//! Peak fitting for a single region's distribution.
//!
//! Three fit families are provided, each resolved once from the
//! [`CalibrationConfig`](crate::config::CalibrationConfig) into a
//! [`FitStrategy`]:
//!
//! - [`simple_peak`], a Gaussian on a linear background fit by chi-square to a
//!   distribution of relative deviations,
//! - [`mass_peak`], a Gaussian (or core plus tail Gaussian) on a Chebyshev
//!   background fit by extended Poisson likelihood to an invariant-mass
//!   distribution, retried with richer backgrounds when the mass runs to its
//!   upper limit,
//! - [`ratio_peak`], a two-sided crystal ball fit to a reconstructed over true
//!   energy distribution.
//!
//! All of them produce a [`FitOutcome`] whose [`FitOutcome::deviation`] drives
//! the coefficient update.
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::histogram::Histogram;

pub mod engine;
pub mod mass_peak;
pub mod minimizer;
pub mod ratio_peak;
pub mod shapes;
pub mod simple_peak;

pub use engine::{FitStrategy, PeakFitEngine};
pub use mass_peak::MassPeakConfig;
pub use minimizer::{CostFunction, MinimizerConfig, MinimizerResult, ParameterSpec};
pub use ratio_peak::RatioPeakConfig;
pub use simple_peak::SimplePeakConfig;

/// Problems preparing a fit. These never escape the engine: a region whose fit
/// cannot be set up is reported as [`FitStatus::Degraded`] with no update.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("the fit window [{low}, {high}] contains no bins")]
    EmptyWindow { low: f64, high: f64 },
    #[error("the distribution has no bins")]
    EmptyHistogram,
    #[error("the background model of attempt {0} has no coefficients")]
    MissingBackground(usize),
}

/// The terminal classification of one region's fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FitStatus {
    /// The fit converged and its result drives the update
    Converged,
    /// The fit did not meet its quality criteria; the best available result is used
    Degraded,
    /// The distribution failed the statistics gate and no fit was attempted
    #[default]
    NullEffect,
}

impl FitStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::Degraded => "degraded",
            Self::NullEffect => "null-effect",
        }
    }
}

impl std::fmt::Display for FitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chi-square together with its degrees of freedom. Only constructed when
/// both are meaningful, so one is never reported without the other.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GoodnessOfFit {
    pub chi2: f64,
    pub ndof: usize,
}

impl GoodnessOfFit {
    pub fn new(chi2: f64, ndof: usize) -> Option<Self> {
        if ndof == 0 || !chi2.is_finite() {
            None
        } else {
            Some(Self { chi2, ndof })
        }
    }

    /// Build from the number of fitted bins and floating parameters
    pub fn from_counts(chi2: f64, n_bins: usize, n_params: usize) -> Option<Self> {
        Self::new(chi2, n_bins.saturating_sub(n_params))
    }

    pub fn reduced(&self) -> f64 {
        self.chi2 / self.ndof as f64
    }
}

/// Pearson chi-square of `model` against `observed`, skipping empty bins
pub fn pearson_chi2(observed: &[f64], model: &[f64]) -> f64 {
    observed
        .iter()
        .zip(model.iter())
        .filter(|(o, _)| **o > 0.0)
        .map(|(o, m)| (o - m).powi(2) / o)
        .sum()
}

/// The data and fitted model of one fit attempt, sampled at the fitted bins
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FitSnapshot {
    pub attempt: usize,
    pub bin_centers: Vec<f64>,
    pub observed: Vec<f64>,
    pub model: Vec<f64>,
    pub signal: Vec<f64>,
    pub background: Vec<f64>,
}

/// Everything learned from fitting one region's distribution
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FitOutcome {
    pub status: FitStatus,
    /// The relative peak displacement fed to the coefficient update, zero means no update
    pub deviation: f64,
    /// The fitted peak position in the distribution's own units
    pub mean: f64,
    pub mean_error: f64,
    pub sigma: f64,
    /// Signal yield within three widths of the peak
    pub signal: f64,
    /// Background yield within three widths of the peak
    pub background: f64,
    /// Fraction of the signal shape within three widths of the peak
    pub signal_norm: f64,
    /// Fraction of the background shape within three widths of the peak
    pub background_norm: f64,
    pub goodness: Option<GoodnessOfFit>,
    pub background_coefficients: Vec<f64>,
    /// The number of fits performed, zero when the statistics gate failed
    pub attempts: usize,
    pub snapshots: Vec<FitSnapshot>,
}

impl FitOutcome {
    /// The outcome of a region that failed its statistics gate
    pub fn null_effect() -> Self {
        Self::default()
    }

    /// A region whose fit could not be set up
    pub fn failed(attempts: usize) -> Self {
        Self {
            status: FitStatus::Degraded,
            attempts,
            ..Default::default()
        }
    }

    pub fn is_null_effect(&self) -> bool {
        self.status == FitStatus::NullEffect
    }

    pub fn signal_over_background(&self) -> Option<f64> {
        if self.background > 0.0 {
            Some(self.signal / self.background)
        } else {
            None
        }
    }

    pub fn chi2(&self) -> Option<f64> {
        self.goodness.map(|g| g.chi2)
    }

    pub fn ndof(&self) -> Option<usize> {
        self.goodness.map(|g| g.ndof)
    }
}

/// Collect bin centers and contents of the bins whose centers lie in `[low, high]`
pub(crate) fn window_data(
    hist: &Histogram,
    low: f64,
    high: f64,
) -> Result<(std::ops::RangeInclusive<usize>, Vec<f64>, Vec<f64>), FitError> {
    if hist.is_empty() {
        return Err(FitError::EmptyHistogram);
    }
    let bins = hist.bins_in_window(low, high);
    if bins.is_empty() {
        return Err(FitError::EmptyWindow { low, high });
    }
    let centers = bins.clone().map(|i| hist.bin_center(i)).collect();
    let observed = hist.bin_count[bins.clone()].to_vec();
    Ok((bins, centers, observed))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_goodness_joint_validity() {
        assert!(GoodnessOfFit::new(12.0, 0).is_none());
        assert!(GoodnessOfFit::new(f64::NAN, 4).is_none());
        let g = GoodnessOfFit::from_counts(12.0, 10, 4).unwrap();
        assert_eq!(g.ndof, 6);
        assert_eq!(g.reduced(), 2.0);
        assert!(GoodnessOfFit::from_counts(1.0, 3, 5).is_none());
    }

    #[test]
    fn test_null_effect_outcome() {
        let outcome = FitOutcome::null_effect();
        assert!(outcome.is_null_effect());
        assert_eq!(outcome.deviation, 0.0);
        assert_eq!(outcome.attempts, 0);
        assert!(outcome.chi2().is_none() && outcome.ndof().is_none());
        assert!(outcome.signal_over_background().is_none());
    }

    #[test]
    fn test_pearson_chi2_skips_empty() {
        let chi2 = pearson_chi2(&[4.0, 0.0, 9.0], &[2.0, 5.0, 9.0]);
        assert_eq!(chi2, 1.0);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_outcome_serialization() {
        let outcome = FitOutcome {
            status: FitStatus::Converged,
            mean: 0.135,
            goodness: GoodnessOfFit::new(20.0, 19),
            ..Default::default()
        };
        let text = serde_json::to_string(&outcome).unwrap();
        let back: FitOutcome = serde_json::from_str(&text).unwrap();
        assert_eq!(back, outcome);
    }
}
