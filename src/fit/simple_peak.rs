//! Gaussian plus straight-line fits to distributions of relative deviations.
//!
//! The fit window straddles the mode of the distribution asymmetrically. Each
//! side starts from the widest offset of its ladder and moves to the next,
//! narrower offset while the window edge would land beyond a fixed distance
//! from zero. A fit whose reduced chi-square exceeds the threshold is repeated
//! with tighter limits on the Gaussian width.
use crate::histogram::Histogram;

use super::minimizer::{minimize, BinnedModel, CostFunction, MinimizerConfig, ParameterSpec};
use super::shapes::GaussianOnLine;
use super::{window_data, FitError, FitOutcome, FitSnapshot, FitStatus, GoodnessOfFit};

/// Parameterisation of the simple-peak fit for one sub-detector
#[derive(Debug, Clone, PartialEq)]
pub struct SimplePeakConfig {
    /// The minimum content between the first sixth and the middle of the axis
    pub min_entries: f64,
    /// Offsets of the lower window edge from the peak, widest first
    pub lower_offsets: Vec<f64>,
    /// The largest allowed distance of the lower window edge from zero
    pub lower_limit: f64,
    /// Offsets of the upper window edge from the peak, widest first
    pub upper_offsets: Vec<f64>,
    /// The largest allowed upper window edge
    pub upper_limit: f64,
    /// Allowed Gaussian width ranges, loosest first. Later ranges are only
    /// tried when the fit quality is poor.
    pub sigma_ladder: Vec<(f64, f64)>,
    pub sigma_init: f64,
    pub slope_limits: (f64, f64),
    /// When set, the amplitude is limited to `[0, factor * entries]`
    pub amplitude_ceiling: Option<f64>,
    pub chi2_threshold: f64,
}

impl SimplePeakConfig {
    pub fn barrel() -> Self {
        Self {
            min_entries: 20.0,
            lower_offsets: vec![-0.15, -0.10, -0.075, -0.03, -0.009],
            lower_limit: 0.24,
            upper_offsets: vec![0.25, 0.15, 0.10, 0.05, 0.01],
            upper_limit: 0.34,
            sigma_ladder: vec![(0.05, 0.22), (0.05, 0.15), (0.05, 0.10)],
            sigma_init: 0.1,
            slope_limits: (-500.0, 500.0),
            amplitude_ceiling: None,
            chi2_threshold: 11.0,
        }
    }

    pub fn endcap() -> Self {
        Self {
            min_entries: 20.0,
            lower_offsets: vec![-0.35, -0.30, -0.25, -0.20, -0.15, -0.10, -0.05],
            lower_limit: 0.38,
            upper_offsets: vec![0.35, 0.30, 0.20, 0.15, 0.10],
            upper_limit: 0.48,
            sigma_ladder: vec![(0.05, 0.30), (0.05, 0.20), (0.05, 0.15)],
            sigma_init: 0.1,
            slope_limits: (-500.0, 500.0),
            amplitude_ceiling: Some(1.1),
            chi2_threshold: 11.0,
        }
    }

    pub fn min_entries(mut self, min_entries: f64) -> Self {
        self.min_entries = min_entries;
        self
    }

    pub fn chi2_threshold(mut self, chi2_threshold: f64) -> Self {
        self.chi2_threshold = chi2_threshold;
        self
    }

    /// Whether the distribution holds enough entries to be fit
    pub fn passes_gate(&self, hist: &Histogram) -> bool {
        let n = hist.len() as f64;
        // Bin numbers counted from one, truncated
        let first = (n / 6.0) as usize;
        let last = (n * 0.5) as usize;
        if last == 0 {
            return false;
        }
        hist.integral_bins(first.saturating_sub(1)..=last - 1) > self.min_entries
    }

    /// The fit window `[peak + lower, peak + upper]` around the reference `peak`
    pub fn window(&self, peak: f64) -> (f64, f64) {
        let lower = shrink(&self.lower_offsets, |offset| {
            (peak + offset).abs() > self.lower_limit
        });
        let upper = shrink(&self.upper_offsets, |offset| peak + offset > self.upper_limit);
        (peak + lower, peak + upper)
    }
}

/// Walk down `ladder` while `too_wide` holds, stopping at the last step
fn shrink(ladder: &[f64], too_wide: impl Fn(f64) -> bool) -> f64 {
    let mut value = ladder.first().copied().unwrap_or_default();
    for next in ladder.iter().skip(1) {
        if too_wide(value) {
            value = *next;
        } else {
            break;
        }
    }
    value
}

struct GaussianOnLineModel<'a> {
    centers: &'a [f64],
}

impl BinnedModel for GaussianOnLineModel<'_> {
    fn n_params(&self) -> usize {
        5
    }

    fn n_bins(&self) -> usize {
        self.centers.len()
    }

    fn expected(&self, params: &[f64], out: &mut [f64]) {
        let shape = GaussianOnLine::from_slice(params);
        for (o, x) in out.iter_mut().zip(self.centers.iter()) {
            *o = shape.density(*x);
        }
    }
}

/// Fit the simple-peak model to `hist`.
///
/// Returns a null-effect outcome when the statistics gate fails. A fit that
/// stays above the chi-square threshold after every width range has been tried
/// is reported as [`FitStatus::Degraded`] but its mean is still used.
pub fn fit_simple_peak(
    hist: &Histogram,
    config: &SimplePeakConfig,
    minimizer: &MinimizerConfig,
    keep_snapshots: bool,
) -> Result<FitOutcome, FitError> {
    if !config.passes_gate(hist) {
        return Ok(FitOutcome::null_effect());
    }
    let mode = hist.maximum_bin().ok_or(FitError::EmptyHistogram)?;
    let peak = hist.bin_high_edge(mode);
    let (low, high) = config.window(peak);
    let (_, centers, observed) = window_data(hist, low, high)?;
    let model = GaussianOnLineModel { centers: &centers };
    // Empty bins carry no chi-square term and no degree of freedom
    let n_filled = observed.iter().filter(|o| **o > 0.0).count();

    let amplitude_limits = match config.amplitude_ceiling {
        Some(factor) => (0.0, factor * hist.integral()),
        None => (f64::NEG_INFINITY, f64::INFINITY),
    };
    let amplitude_init = hist.bin_count[mode].clamp(amplitude_limits.0, amplitude_limits.1);
    let mu_init = hist.bin_center(mode);

    let mut outcome = FitOutcome::default();
    let mut status = FitStatus::Degraded;

    for (attempt, (sigma_low, sigma_high)) in config.sigma_ladder.iter().enumerate() {
        let specs = [
            ParameterSpec::new(amplitude_init, amplitude_limits.0, amplitude_limits.1),
            ParameterSpec::unbounded(mu_init),
            ParameterSpec::new(
                config.sigma_init.clamp(*sigma_low, *sigma_high),
                *sigma_low,
                *sigma_high,
            ),
            ParameterSpec::new(0.0, config.slope_limits.0, config.slope_limits.1),
            ParameterSpec::unbounded(0.0),
        ];
        let result = minimize(&model, &observed, CostFunction::ChiSquare, &specs, minimizer);
        let chi2 = 2.0 * result.cost;
        let goodness = GoodnessOfFit::from_counts(chi2, n_filled, model.n_params());

        outcome.mean = result.params[1];
        outcome.mean_error = result.errors[1];
        outcome.sigma = result.params[2];
        outcome.goodness = goodness;
        outcome.attempts = attempt + 1;
        outcome.background_coefficients = vec![result.params[4], result.params[3]];
        if keep_snapshots {
            let shape = GaussianOnLine::from_slice(&result.params);
            outcome.snapshots.push(FitSnapshot {
                attempt,
                bin_centers: centers.clone(),
                observed: observed.clone(),
                model: centers.iter().map(|x| shape.density(*x)).collect(),
                signal: centers.iter().map(|x| shape.peak(*x)).collect(),
                background: centers.iter().map(|x| shape.line(*x)).collect(),
            });
        }

        match goodness {
            None => {
                log::warn!(
                    "{}: no degrees of freedom left in the fit window [{low:.4}, {high:.4}]",
                    hist.name
                );
                status = if result.converged {
                    FitStatus::Converged
                } else {
                    FitStatus::Degraded
                };
                break;
            }
            Some(g) if g.reduced() <= config.chi2_threshold => {
                if attempt > 0 {
                    log::debug!("{}: chi-square recovered with width range #{attempt}", hist.name);
                }
                status = if result.converged {
                    FitStatus::Converged
                } else {
                    FitStatus::Degraded
                };
                break;
            }
            Some(g) => {
                log::trace!(
                    "{}: reduced chi-square {:.2} above {} \
                     with sigma in [{sigma_low}, {sigma_high}]",
                    hist.name,
                    g.reduced(),
                    config.chi2_threshold
                );
            }
        }
    }

    if status == FitStatus::Degraded {
        log::warn!(
            "{}: high chi-square after {} attempts, keeping mean {:.5}",
            hist.name,
            outcome.attempts,
            outcome.mean
        );
    }
    outcome.status = status;
    outcome.deviation = outcome.mean;
    Ok(outcome)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_data;

    #[rstest::rstest]
    #[case(0.0, (-0.15, 0.25))]
    #[case(0.3, (0.3 - 0.15, 0.3 + 0.01))]
    #[case(-0.2, (-0.2 - 0.03, -0.2 + 0.25))]
    #[case(0.12, (0.12 - 0.15, 0.12 + 0.15))]
    fn test_barrel_window(#[case] peak: f64, #[case] expected: (f64, f64)) {
        let (low, high) = SimplePeakConfig::barrel().window(peak);
        assert_is_close!(low, expected.0, 1e-12, "low");
        assert_is_close!(high, expected.1, 1e-12, "high");
    }

    #[test]
    fn test_endcap_window_uses_full_ladder() {
        let config = SimplePeakConfig::endcap();
        let (low, high) = config.window(-0.45);
        assert_is_close!(low, -0.45 - 0.05, 1e-12, "low");
        assert_is_close!(high, -0.45 + 0.35, 1e-12, "high");
        let (low, high) = config.window(0.45);
        assert_is_close!(low, 0.45 - 0.35, 1e-12, "low");
        assert_is_close!(high, 0.45 + 0.10, 1e-12, "high");
        let (low, high) = config.window(0.0);
        assert_is_close!(low, -0.35, 1e-12, "low");
        assert_is_close!(high, 0.35, 1e-12, "high");
    }

    #[test]
    fn test_gate() {
        let config = SimplePeakConfig::barrel();
        let empty = Histogram::uniform("h", 80, -0.5, 0.5);
        assert!(!config.passes_gate(&empty));
        let hist = test_data::epsilon_histogram(0.02, 0.08, 100.0);
        assert!(config.passes_gate(&hist));
    }

    #[test_log::test]
    fn test_fit_recovers_mean() {
        let hist = test_data::epsilon_histogram(0.02, 0.08, 100.0);
        let outcome = fit_simple_peak(
            &hist,
            &SimplePeakConfig::barrel(),
            &MinimizerConfig::default(),
            true,
        )
        .unwrap();
        assert_eq!(outcome.status, FitStatus::Converged);
        assert_eq!(outcome.attempts, 1);
        assert_is_close!(outcome.mean, 0.02, 1e-3, "mean");
        assert_is_close!(outcome.sigma, 0.08, 1e-3, "sigma");
        assert_eq!(outcome.deviation, outcome.mean);
        assert!(outcome.goodness.is_some());
        assert_eq!(outcome.snapshots.len(), 1);
    }

    #[test_log::test]
    fn test_endcap_fit_recovers_mean() {
        let hist = test_data::epsilon_histogram(-0.03, 0.12, 100.0);
        let config = SimplePeakConfig::endcap();
        assert!(config.amplitude_ceiling.unwrap() * hist.integral() > 100.0);
        let outcome =
            fit_simple_peak(&hist, &config, &MinimizerConfig::default(), false).unwrap();
        assert_eq!(outcome.status, FitStatus::Converged);
        assert_eq!(outcome.attempts, 1);
        assert_is_close!(outcome.mean, -0.03, 1e-3, "mean");
        assert_is_close!(outcome.sigma, 0.12, 1e-3, "sigma");
        assert_eq!(outcome.deviation, outcome.mean);
    }

    #[test_log::test]
    fn test_ndof_skips_empty_bins() {
        let mut hist = test_data::epsilon_histogram(0.02, 0.06, 100.0);
        // Drop the floor so the window tails are empty
        for c in hist.bin_count.iter_mut() {
            if *c < 2.5 {
                *c = 0.0;
            }
        }
        let config = SimplePeakConfig::barrel();
        let peak = hist.bin_high_edge(hist.maximum_bin().unwrap());
        let (low, high) = config.window(peak);
        let window = hist.bins_in_window(low, high);
        let filled = hist.bin_count[window.clone()]
            .iter()
            .filter(|c| **c > 0.0)
            .count();
        assert!(filled < window.count());

        let outcome =
            fit_simple_peak(&hist, &config, &MinimizerConfig::default(), false).unwrap();
        assert_eq!(outcome.ndof(), Some(filled - 5));
    }

    #[test_log::test]
    fn test_poor_fit_walks_the_width_ladder() {
        let hist = test_data::jagged_epsilon_histogram();
        let config = SimplePeakConfig::barrel();
        let outcome =
            fit_simple_peak(&hist, &config, &MinimizerConfig::default(), false).unwrap();
        assert_eq!(outcome.attempts, config.sigma_ladder.len());
        assert_eq!(outcome.status, FitStatus::Degraded);
        assert!(outcome.mean.is_finite());
        assert_eq!(outcome.deviation, outcome.mean);
    }

    #[test]
    fn test_empty_is_null_effect() {
        let hist = Histogram::uniform("h", 80, -0.5, 0.5);
        let outcome = fit_simple_peak(
            &hist,
            &SimplePeakConfig::endcap(),
            &MinimizerConfig::default(),
            false,
        )
        .unwrap();
        assert!(outcome.is_null_effect());
        assert_eq!(outcome.attempts, 0);
    }
}
