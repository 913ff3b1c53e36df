//! Two-sided crystal ball fits of reconstructed over true energy distributions.
//!
//! A Gaussian fit around the mode seeds the peak position and width of the
//! crystal ball, which is then fit over two seed widths on either side.
use crate::histogram::Histogram;

use super::minimizer::{minimize, BinnedModel, CostFunction, MinimizerConfig, ParameterSpec};
use super::shapes::{DoubleSidedCrystalBall, GaussianCurve};
use super::{pearson_chi2, window_data, FitError, FitOutcome, FitSnapshot, FitStatus, GoodnessOfFit};

const MU: usize = 2;
const SIGMA: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct RatioPeakConfig {
    /// The ratio range whose content must exceed `min_entries`
    pub gate_window: (f64, f64),
    pub min_entries: f64,
    /// Half width of the seeding Gaussian fit around the mode
    pub seed_half_width: f64,
    /// Width assumed when the seeding fit fails
    pub seed_sigma: f64,
    /// Half width of the crystal ball window in units of the seed width
    pub window_widths: f64,
    pub alpha_low: ParameterSpec,
    pub n_low: ParameterSpec,
    pub alpha_high: ParameterSpec,
    pub n_high: ParameterSpec,
}

impl Default for RatioPeakConfig {
    fn default() -> Self {
        Self {
            gate_window: (0.6, 1.1),
            min_entries: 100.0,
            seed_half_width: 0.1,
            seed_sigma: 0.1,
            window_widths: 2.0,
            alpha_low: ParameterSpec::new(-1.4, -5.0, -0.1),
            n_low: ParameterSpec::new(5.0, 0.1, 15.0),
            alpha_high: ParameterSpec::new(1.4, 0.1, 5.0),
            n_high: ParameterSpec::new(5.0, 0.1, 15.0),
        }
    }
}

impl RatioPeakConfig {
    pub fn min_entries(mut self, min_entries: f64) -> Self {
        self.min_entries = min_entries;
        self
    }

    pub fn passes_gate(&self, hist: &Histogram) -> bool {
        hist.integral_range(self.gate_window.0, self.gate_window.1) > self.min_entries
    }

    /// Convert a fitted ratio peak to the relative deviation `(mu^2 - 1) / 2`
    pub fn ratio_to_deviation(&self, mu: f64) -> f64 {
        0.5 * (mu * mu - 1.0)
    }
}

struct GaussianModel<'a> {
    centers: &'a [f64],
}

impl BinnedModel for GaussianModel<'_> {
    fn n_params(&self) -> usize {
        3
    }

    fn n_bins(&self) -> usize {
        self.centers.len()
    }

    fn expected(&self, params: &[f64], out: &mut [f64]) {
        let curve = GaussianCurve::new(params[0], params[1], params[2]);
        for (o, x) in out.iter_mut().zip(self.centers) {
            *o = curve.density(*x);
        }
    }
}

struct CrystalBallModel<'a> {
    centers: &'a [f64],
}

impl BinnedModel for CrystalBallModel<'_> {
    fn n_params(&self) -> usize {
        7
    }

    fn n_bins(&self) -> usize {
        self.centers.len()
    }

    fn expected(&self, params: &[f64], out: &mut [f64]) {
        let shape = DoubleSidedCrystalBall::from_slice(params);
        for (o, x) in out.iter_mut().zip(self.centers) {
            *o = shape.density(*x);
        }
    }
}

/// Fit the mode of `hist` with a Gaussian to find the crystal ball's seeds
fn seed(
    hist: &Histogram,
    config: &RatioPeakConfig,
    minimizer: &MinimizerConfig,
    mode: usize,
) -> (f64, f64) {
    let height = hist.bin_count[mode];
    let center = hist.bin_center(mode);
    let fallback = (center, config.seed_sigma);
    let Ok((_, centers, observed)) = window_data(
        hist,
        center - config.seed_half_width,
        center + config.seed_half_width,
    ) else {
        return fallback;
    };
    let specs = [
        ParameterSpec::new(height, 0.0, f64::INFINITY),
        ParameterSpec::unbounded(center),
        ParameterSpec::new(config.seed_sigma, 1e-6, f64::INFINITY),
    ];
    let result = minimize(
        &GaussianModel { centers: &centers },
        &observed,
        CostFunction::PoissonLikelihood,
        &specs,
        minimizer,
    );
    if result.converged {
        (result.params[1], result.params[2])
    } else {
        log::warn!(
            "{}: seeding Gaussian fit failed (edm {:.3e}), seeding from the mode",
            hist.name,
            result.edm
        );
        fallback
    }
}

/// Fit the two-sided crystal ball model to `hist`
pub fn fit_ratio_peak(
    hist: &Histogram,
    config: &RatioPeakConfig,
    minimizer: &MinimizerConfig,
    keep_snapshots: bool,
) -> Result<FitOutcome, FitError> {
    if !config.passes_gate(hist) {
        return Ok(FitOutcome::null_effect());
    }
    let mode = hist.maximum_bin().ok_or(FitError::EmptyHistogram)?;
    let height = hist.bin_count[mode];
    let (mean, width) = seed(hist, config, minimizer, mode);

    let (_, centers, observed) = window_data(
        hist,
        mean - config.window_widths * width,
        mean + config.window_widths * width,
    )?;
    let model = CrystalBallModel { centers: &centers };
    let specs = [
        config.alpha_low,
        config.n_low,
        ParameterSpec::new(mean, mean - width, mean + width),
        ParameterSpec::new(width, 0.1 * width, 1.1 * width),
        ParameterSpec::new(height, 0.8 * height, 1.2 * height),
        config.alpha_high,
        config.n_high,
    ];
    let result = minimize(&model, &observed, CostFunction::PoissonLikelihood, &specs, minimizer);

    let mut expected = vec![0.0; centers.len()];
    model.expected(&result.params, &mut expected);
    let chi2 = pearson_chi2(&observed, &expected);
    let mu = result.params[MU];

    let status = if result.converged {
        FitStatus::Converged
    } else {
        log::warn!("{}: crystal ball fit did not converge (edm {:.3e})", hist.name, result.edm);
        FitStatus::Degraded
    };

    let snapshots = if keep_snapshots {
        let shape = DoubleSidedCrystalBall::from_slice(&result.params);
        let core = DoubleSidedCrystalBall {
            alpha_low: f64::INFINITY,
            alpha_high: f64::INFINITY,
            ..shape
        };
        vec![FitSnapshot {
            attempt: 0,
            bin_centers: centers.clone(),
            observed: observed.clone(),
            signal: centers.iter().map(|x| core.density(*x)).collect(),
            background: vec![0.0; centers.len()],
            model: expected,
        }]
    } else {
        Vec::new()
    };

    Ok(FitOutcome {
        status,
        deviation: config.ratio_to_deviation(mu),
        mean: mu,
        mean_error: result.errors[MU],
        sigma: result.params[SIGMA],
        goodness: GoodnessOfFit::from_counts(chi2, centers.len(), model.n_params()),
        attempts: 1,
        snapshots,
        ..Default::default()
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_data;

    #[test_log::test]
    fn test_crystal_ball_peak() {
        let hist = test_data::ratio_histogram(0.96, 0.05, 400.0);
        let config = RatioPeakConfig::default();
        let outcome =
            fit_ratio_peak(&hist, &config, &MinimizerConfig::default(), true).unwrap();
        assert!((outcome.mean - 0.96).abs() < 0.005, "{outcome:?}");
        assert!((outcome.sigma - 0.05).abs() < 0.01, "{outcome:?}");
        assert_eq!(outcome.deviation, 0.5 * (outcome.mean * outcome.mean - 1.0));
        assert!(outcome.deviation < 0.0);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.snapshots.len(), 1);
        assert!(outcome.goodness.is_some());
    }

    #[test]
    fn test_gate() {
        let config = RatioPeakConfig::default();
        let hist = test_data::ratio_histogram(1.0, 0.05, 0.5);
        assert!(!config.passes_gate(&hist));
        let outcome =
            fit_ratio_peak(&hist, &config, &MinimizerConfig::default(), false).unwrap();
        assert!(outcome.is_null_effect());
    }
}
