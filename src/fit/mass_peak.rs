//! Extended binned likelihood fits of an invariant-mass peak.
//!
//! The signal is a Gaussian, optionally accompanied by a wider tail Gaussian
//! sharing its mean, and the background is a Chebyshev series normalised over
//! the fit window. When the fitted mass ends on the upper limit of its range
//! the fit has run away from the data and is repeated with a richer background
//! following [`MassPeakConfig::escalation`], at most [`MassPeakConfig::max_retries`]
//! times.
use crate::config::{ParticleHypothesis, SignalModel};
use crate::histogram::Histogram;
use crate::region::Subdetector;

use super::minimizer::{
    minimize, BinnedModel, CostFunction, MinimizerConfig, MinimizerResult, ParameterSpec,
};
use super::shapes::{gaussian_interval, Chebyshev};
use super::{
    pearson_chi2, window_data, FitError, FitOutcome, FitSnapshot, FitStatus, GoodnessOfFit,
};

const MEAN: usize = 0;
const SIGMA: usize = 1;
const N_SIGNAL: usize = 2;
const N_BACKGROUND: usize = 3;
const SIGMA_TAIL: usize = 4;
const CORE_FRACTION: usize = 5;

/// Limits of the wide Gaussian in the two-component signal model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TailConfig {
    pub sigma: ParameterSpec,
    pub core_fraction: ParameterSpec,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            sigma: ParameterSpec::new(0.040, 0.020, 0.065),
            core_fraction: ParameterSpec::new(0.9, 0.0, 1.0),
        }
    }
}

/// The Chebyshev coefficients tried on each attempt, one row per attempt
pub fn default_escalation() -> Vec<Vec<ParameterSpec>> {
    let c1 = ParameterSpec::new(0.2, -1.0, 1.0);
    let c2 = ParameterSpec::new(-0.1, -1.0, 1.0);
    let c3 = ParameterSpec::new(0.1, -1.0, 1.0);
    vec![
        vec![c1, c2, c3],
        vec![c1, c2, c3, ParameterSpec::new(-0.1, -0.5, 0.5)],
        vec![
            c1,
            c2,
            c3,
            ParameterSpec::new(-0.1, -1.0, 1.0),
            ParameterSpec::new(0.1, -0.3, 0.3),
        ],
        vec![
            c1,
            c2,
            c3,
            ParameterSpec::new(-0.1, -1.0, 1.0),
            ParameterSpec::new(0.1, -1.0, 1.0),
            ParameterSpec::new(0.1, -0.5, 0.5),
        ],
    ]
}

/// Parameterisation of the mass-peak fit for one sub-detector and particle
#[derive(Debug, Clone, PartialEq)]
pub struct MassPeakConfig {
    pub fit_window: (f64, f64),
    /// The mass range whose content must exceed `min_entries`
    pub gate_window: (f64, f64),
    pub min_entries: f64,
    /// Starting value and range of the peak mass. The upper limit is the
    /// runaway sentinel.
    pub mean: ParameterSpec,
    /// Replaces `mean` on the first retry
    pub mean_first_retry: Option<ParameterSpec>,
    pub sigma: ParameterSpec,
    /// Replaces `sigma` on the first retry
    pub sigma_first_retry: Option<ParameterSpec>,
    /// Present when the signal has a tail Gaussian
    pub tail: Option<TailConfig>,
    pub escalation: Vec<Vec<ParameterSpec>>,
    pub max_retries: usize,
    /// How close to its upper limit the mass must be to count as a runaway
    pub boundary_tolerance: f64,
    pub nominal_mass: f64,
}

impl MassPeakConfig {
    pub fn new(subdet: Subdetector, hypothesis: ParticleHypothesis, signal: SignalModel) -> Self {
        let (fit_window, gate_window) = match hypothesis {
            ParticleHypothesis::Pi0 => ((0.08, 0.21), (0.08, 0.18)),
            ParticleHypothesis::Eta => ((0.40, 0.65), (0.40, 0.65)),
        };
        let (mean, mean_first_retry, sigma, sigma_first_retry, min_entries) =
            match (subdet, hypothesis) {
                (Subdetector::Barrel, ParticleHypothesis::Pi0) => (
                    ParameterSpec::new(0.13, 0.105, 0.15),
                    None,
                    ParameterSpec::new(0.011, 0.005, 0.015),
                    Some(ParameterSpec::new(0.011, 0.003, 0.030)),
                    60.0,
                ),
                (Subdetector::Barrel, ParticleHypothesis::Eta) => (
                    ParameterSpec::new(0.52, 0.50, 0.62),
                    Some(ParameterSpec::new(0.52, 0.47, 0.62)),
                    ParameterSpec::new(0.011, 0.005, 0.015),
                    Some(ParameterSpec::new(0.011, 0.003, 0.030)),
                    60.0,
                ),
                (Subdetector::Endcap, ParticleHypothesis::Pi0) => (
                    ParameterSpec::new(0.13, 0.10, 0.16),
                    None,
                    ParameterSpec::new(0.011, 0.005, 0.020),
                    None,
                    70.0,
                ),
                (Subdetector::Endcap, ParticleHypothesis::Eta) => (
                    ParameterSpec::new(0.55, 0.45, 0.62),
                    None,
                    ParameterSpec::new(0.011, 0.005, 0.020),
                    None,
                    70.0,
                ),
            };
        Self {
            fit_window,
            gate_window,
            min_entries,
            mean,
            mean_first_retry,
            sigma,
            sigma_first_retry,
            tail: match signal {
                SignalModel::SingleGaussian => None,
                SignalModel::DoubleGaussian => Some(TailConfig::default()),
            },
            escalation: default_escalation(),
            max_retries: 3,
            boundary_tolerance: 1e-7,
            nominal_mass: hypothesis.nominal_mass(),
        }
    }

    pub fn min_entries(mut self, min_entries: f64) -> Self {
        self.min_entries = min_entries;
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

    pub fn passes_gate(&self, hist: &Histogram) -> bool {
        hist.integral_range(self.gate_window.0, self.gate_window.1) > self.min_entries
    }

    pub fn mean_spec(&self, attempt: usize) -> ParameterSpec {
        match (attempt, self.mean_first_retry) {
            (1, Some(spec)) => spec,
            _ => self.mean,
        }
    }

    pub fn sigma_spec(&self, attempt: usize) -> ParameterSpec {
        match (attempt, self.sigma_first_retry) {
            (1, Some(spec)) => spec,
            _ => self.sigma,
        }
    }

    pub fn background_spec(&self, attempt: usize) -> Option<&[ParameterSpec]> {
        self.escalation
            .get(attempt.min(self.escalation.len().saturating_sub(1)))
            .map(|v| v.as_slice())
    }

    /// Convert a fitted mass to the relative deviation `((m / M)^2 - 1) / 2`
    pub fn mass_to_deviation(&self, mass: f64) -> f64 {
        let r = mass / self.nominal_mass;
        0.5 * (r * r - 1.0)
    }
}

/// The result of a bounded retry loop
#[derive(Debug, Clone)]
pub struct Escalation<T> {
    pub value: T,
    /// The number of attempts run, the first one included
    pub attempts: usize,
    /// Whether the last attempt still ended on the sentinel
    pub pinned: bool,
}

/// Call `run` with attempt numbers `0, 1, ...` until it reports a result that is
/// not pinned to the sentinel, giving up after `max_retries` retries
pub fn escalate<T>(max_retries: usize, mut run: impl FnMut(usize) -> (T, bool)) -> Escalation<T> {
    let mut attempt = 0;
    loop {
        let (value, pinned) = run(attempt);
        if !pinned || attempt >= max_retries {
            return Escalation {
                value,
                attempts: attempt + 1,
                pinned,
            };
        }
        attempt += 1;
    }
}

/// Expected counts of the signal plus background model in each window bin
struct MassPeakModel {
    edges: Vec<f64>,
    low: f64,
    high: f64,
    n_coefficients: usize,
    double: bool,
}

impl MassPeakModel {
    fn first_coefficient(&self) -> usize {
        if self.double {
            6
        } else {
            4
        }
    }

    fn background(&self, params: &[f64]) -> Chebyshev {
        let start = self.first_coefficient();
        Chebyshev::new(
            params[start..start + self.n_coefficients].to_vec(),
            self.low,
            self.high,
        )
    }

    /// Per-bin expected signal and background counts
    fn components(&self, params: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let mean = params[MEAN];
        let sigma = params[SIGMA];
        let core_norm = gaussian_interval(self.low, self.high, mean, sigma);
        let (tail_sigma, fcore) = if self.double {
            (params[SIGMA_TAIL], params[CORE_FRACTION])
        } else {
            (sigma, 1.0)
        };
        let tail_norm = gaussian_interval(self.low, self.high, mean, tail_sigma);

        let bkg = self.background(params);
        let bkg_norm = bkg.total_integral();

        let n = self.edges.len() - 1;
        let mut signal = Vec::with_capacity(n);
        let mut background = Vec::with_capacity(n);
        for w in self.edges.windows(2) {
            let core = gaussian_interval(w[0], w[1], mean, sigma) / core_norm;
            let shape = if self.double {
                fcore * core
                    + (1.0 - fcore) * gaussian_interval(w[0], w[1], mean, tail_sigma) / tail_norm
            } else {
                core
            };
            signal.push(params[N_SIGNAL] * shape);
            background.push(params[N_BACKGROUND] * bkg.integral(w[0], w[1]) / bkg_norm);
        }
        (signal, background)
    }
}

impl BinnedModel for MassPeakModel {
    fn n_params(&self) -> usize {
        self.first_coefficient() + self.n_coefficients
    }

    fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    fn expected(&self, params: &[f64], out: &mut [f64]) {
        let (signal, background) = self.components(params);
        for ((o, s), b) in out.iter_mut().zip(signal).zip(background) {
            *o = s + b;
        }
    }
}

struct Attempt {
    specs: Vec<ParameterSpec>,
    model: MassPeakModel,
    result: MinimizerResult,
}

fn fit_attempt(
    hist: &Histogram,
    bins: &std::ops::RangeInclusive<usize>,
    observed: &[f64],
    config: &MassPeakConfig,
    minimizer: &MinimizerConfig,
    attempt: usize,
) -> Result<Attempt, FitError> {
    let coefficients = config
        .background_spec(attempt)
        .filter(|c| !c.is_empty())
        .ok_or(FitError::MissingBackground(attempt))?;
    let edges: Vec<f64> = hist.bin_edges[*bins.start()..=*bins.end() + 1].to_vec();
    let model = MassPeakModel {
        low: edges[0],
        high: edges[edges.len() - 1],
        edges,
        n_coefficients: coefficients.len(),
        double: config.tail.is_some(),
    };

    let total = hist.integral();
    let mut specs = vec![
        config.mean_spec(attempt),
        config.sigma_spec(attempt),
        ParameterSpec::new(0.15 * total, 0.0, 10.0 * total),
        ParameterSpec::new(0.85 * total, 0.0, 10.0 * total),
    ];
    if let Some(tail) = config.tail {
        specs.push(tail.sigma);
        specs.push(tail.core_fraction);
    }
    specs.extend_from_slice(coefficients);

    let result = minimize(
        &model,
        observed,
        CostFunction::PoissonLikelihood,
        &specs,
        minimizer,
    );
    log::trace!(
        "{} attempt {attempt}: mass {:.5} sigma {:.5} with {} background terms",
        hist.name,
        result.params[MEAN],
        result.params[SIGMA],
        coefficients.len()
    );
    Ok(Attempt {
        specs,
        model,
        result,
    })
}

/// Fit the mass-peak model to `hist`, retrying with richer backgrounds while
/// the fitted mass sits on its upper limit
pub fn fit_mass_peak(
    hist: &Histogram,
    config: &MassPeakConfig,
    minimizer: &MinimizerConfig,
    keep_snapshots: bool,
) -> Result<FitOutcome, FitError> {
    if !config.passes_gate(hist) {
        return Ok(FitOutcome::null_effect());
    }
    let (bins, centers, observed) = window_data(hist, config.fit_window.0, config.fit_window.1)?;

    let mut snapshots = Vec::new();
    let mut failure = None;
    let escalation = escalate(config.max_retries, |attempt| {
        match fit_attempt(hist, &bins, &observed, config, minimizer, attempt) {
            Ok(fit) => {
                let pinned =
                    fit.result
                        .at_upper_bound(MEAN, &fit.specs[MEAN], config.boundary_tolerance);
                if keep_snapshots {
                    let (signal, background) = fit.model.components(&fit.result.params);
                    snapshots.push(FitSnapshot {
                        attempt,
                        bin_centers: centers.clone(),
                        observed: observed.clone(),
                        model: signal.iter().zip(&background).map(|(s, b)| s + b).collect(),
                        signal,
                        background,
                    });
                }
                if pinned {
                    log::debug!(
                        "{}: mass ended on its upper limit {} in attempt {attempt}",
                        hist.name,
                        fit.specs[MEAN].upper
                    );
                }
                (Some(fit), pinned)
            }
            Err(e) => {
                failure = Some(e);
                (None, false)
            }
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }
    let Some(fit) = escalation.value else {
        return Ok(FitOutcome::failed(escalation.attempts));
    };

    let params = &fit.result.params;
    let errors = &fit.result.errors;
    let mean = params[MEAN];
    let sigma = params[SIGMA];
    let (low, high) = (fit.model.low, fit.model.high);

    let core_norm = gaussian_interval(low, high, mean, sigma);
    let (s_low, s_high) = ((mean - 3.0 * sigma).max(low), (mean + 3.0 * sigma).min(high));
    let signal_norm = if core_norm > 0.0 {
        gaussian_interval(s_low, s_high, mean, sigma) / core_norm
    } else {
        0.0
    };
    let bkg = fit.model.background(params);
    let bkg_total = bkg.total_integral();
    let background_norm = if bkg_total > 0.0 {
        bkg.integral(s_low, s_high) / bkg_total
    } else {
        0.0
    };

    let mut expected = vec![0.0; fit.model.n_bins()];
    fit.model.expected(params, &mut expected);
    let chi2 = pearson_chi2(&observed, &expected);

    let (status, deviation) = if escalation.pinned {
        log::warn!(
            "{}: mass still on its upper limit after {} retries, leaving the region unchanged",
            hist.name,
            escalation.attempts - 1
        );
        (FitStatus::Degraded, 0.0)
    } else if fit.result.converged {
        (FitStatus::Converged, config.mass_to_deviation(mean))
    } else {
        log::warn!("{}: likelihood fit did not converge (edm {:.3e})", hist.name, fit.result.edm);
        (FitStatus::Degraded, config.mass_to_deviation(mean))
    };

    let start = fit.model.first_coefficient();
    Ok(FitOutcome {
        status,
        deviation,
        mean,
        mean_error: errors[MEAN],
        sigma,
        signal: signal_norm * params[N_SIGNAL],
        background: background_norm * params[N_BACKGROUND],
        signal_norm,
        background_norm,
        goodness: GoodnessOfFit::from_counts(chi2, fit.model.n_bins(), fit.model.n_params()),
        background_coefficients: params[start..].to_vec(),
        attempts: escalation.attempts,
        snapshots,
    })
}
