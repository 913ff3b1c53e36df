//! A bounded Levenberg-Marquardt minimizer for binned models.
//!
//! The same damped Gauss-Newton step serves both the Poisson-weighted
//! chi-square and the extended binned Poisson likelihood: each bin contributes
//! a cost, its derivative with respect to the expected content, and a
//! curvature, and the model only has to predict expected bin contents.
//!
//! Parameters are held inside their `[lower, upper]` box. A parameter that sits
//! on a bound while the gradient pushes it outwards is frozen for that step,
//! so a parameter that runs away from the data stays exactly on its bound.
use nalgebra::{DMatrix, DVector};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Floor applied to predicted bin contents before taking logarithms
const MIN_EXPECTED: f64 = 1e-12;

/// A model predicting the content of every fitted bin from a parameter vector
pub trait BinnedModel {
    fn n_params(&self) -> usize;

    fn n_bins(&self) -> usize;

    /// Write the expected content of each fitted bin into `out`
    fn expected(&self, params: &[f64], out: &mut [f64]);
}

/// The objective a fit minimizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CostFunction {
    /// Chi-square with `sqrt(n)` bin errors, empty bins are skipped
    ChiSquare,
    /// Extended binned Poisson negative log-likelihood
    PoissonLikelihood,
}

impl CostFunction {
    /// Returns the bin's cost, its derivative with respect to the expected
    /// content and the curvature used to build the approximate Hessian
    #[inline]
    fn bin_terms(&self, observed: f64, expected: f64) -> (f64, f64, f64) {
        match self {
            Self::ChiSquare => {
                if observed <= 0.0 {
                    return (0.0, 0.0, 0.0);
                }
                let r = expected - observed;
                (0.5 * r * r / observed, r / observed, 1.0 / observed)
            }
            Self::PoissonLikelihood => {
                let mu = expected.max(MIN_EXPECTED);
                let log_term = if observed > 0.0 { observed * mu.ln() } else { 0.0 };
                (mu - log_term, 1.0 - observed / mu, 1.0 / mu)
            }
        }
    }
}

/// Starting value and box constraint of one fit parameter
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParameterSpec {
    pub init: f64,
    pub lower: f64,
    pub upper: f64,
}

impl ParameterSpec {
    pub fn new(init: f64, lower: f64, upper: f64) -> Self {
        Self { init, lower, upper }
    }

    pub fn unbounded(init: f64) -> Self {
        Self::new(init, f64::NEG_INFINITY, f64::INFINITY)
    }

    pub fn is_fixed(&self) -> bool {
        self.lower == self.upper
    }

    #[inline]
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.lower, self.upper)
    }
}

/// Hyperparameters of the minimizer
#[derive(Debug, Clone)]
pub struct MinimizerConfig {
    /// The maximum number of Gauss-Newton steps
    pub max_iterations: usize,
    /// Relative cost decrease below which an accepted step ends the minimization
    pub tolerance: f64,
    /// Estimated distance to the minimum below which the fit counts as converged
    pub edm_tolerance: f64,
    /// Initial damping parameter
    pub initial_lambda: f64,
    /// Factor to increase the damping on a rejected step
    pub lambda_up: f64,
    /// Factor to decrease the damping on an accepted step
    pub lambda_down: f64,
}

impl MinimizerConfig {
    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn edm_tolerance(mut self, edm_tolerance: f64) -> Self {
        self.edm_tolerance = edm_tolerance;
        self
    }
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-10,
            edm_tolerance: 1e-5,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

/// Describe a minimization's output
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MinimizerResult {
    pub params: Vec<f64>,
    /// Parabolic errors, zero for parameters held on a bound
    pub errors: Vec<f64>,
    /// The final cost, half the chi-square for [`CostFunction::ChiSquare`]
    pub cost: f64,
    /// The estimated distance to the minimum
    pub edm: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl MinimizerResult {
    /// Whether parameter `i` ended within `tolerance` of its upper bound
    pub fn at_upper_bound(&self, i: usize, spec: &ParameterSpec, tolerance: f64) -> bool {
        (self.params[i] - spec.upper).abs() < tolerance
    }
}

struct Problem<'a, M: BinnedModel> {
    model: &'a M,
    observed: &'a [f64],
    cost: CostFunction,
    specs: &'a [ParameterSpec],
}

impl<M: BinnedModel> Problem<'_, M> {
    fn evaluate(&self, params: &[f64], buffer: &mut [f64]) -> f64 {
        self.model.expected(params, buffer);
        let total: f64 = self
            .observed
            .iter()
            .zip(buffer.iter())
            .map(|(o, e)| self.cost.bin_terms(*o, *e).0)
            .sum();
        if total.is_finite() {
            total
        } else {
            f64::INFINITY
        }
    }

    fn step_size(value: f64) -> f64 {
        1e-5 * value.abs().max(1e-3)
    }

    /// Central differences, falling back to one-sided differences at a bound
    fn jacobian(&self, params: &[f64]) -> DMatrix<f64> {
        let n_bins = self.model.n_bins();
        let mut jac = DMatrix::zeros(n_bins, params.len());
        let mut up_buf = vec![0.0; n_bins];
        let mut down_buf = vec![0.0; n_bins];
        let mut shifted = params.to_vec();
        for (j, spec) in self.specs.iter().enumerate() {
            if spec.is_fixed() {
                continue;
            }
            let h = Self::step_size(params[j]);
            let up = spec.clamp(params[j] + h);
            let down = spec.clamp(params[j] - h);
            if up == down {
                continue;
            }
            shifted[j] = up;
            self.model.expected(&shifted, &mut up_buf);
            shifted[j] = down;
            self.model.expected(&shifted, &mut down_buf);
            shifted[j] = params[j];
            let span = up - down;
            for i in 0..n_bins {
                jac[(i, j)] = (up_buf[i] - down_buf[i]) / span;
            }
        }
        jac
    }

    fn gradient_hessian(&self, params: &[f64], buffer: &mut [f64]) -> (DVector<f64>, DMatrix<f64>) {
        self.model.expected(params, buffer);
        let jac = self.jacobian(params);
        let n = params.len();
        let mut gradient = DVector::zeros(n);
        let mut hessian = DMatrix::zeros(n, n);
        for (i, (o, e)) in self.observed.iter().zip(buffer.iter()).enumerate() {
            let (_, slope, curvature) = self.cost.bin_terms(*o, *e);
            if slope == 0.0 && curvature == 0.0 {
                continue;
            }
            let row = jac.row(i);
            for a in 0..n {
                let ja = row[a];
                if ja == 0.0 {
                    continue;
                }
                gradient[a] += slope * ja;
                for b in a..n {
                    hessian[(a, b)] += curvature * ja * row[b];
                }
            }
        }
        for a in 0..n {
            for b in 0..a {
                hessian[(a, b)] = hessian[(b, a)];
            }
        }
        (gradient, hessian)
    }

    /// Parameters excluded from the next step, either fixed or pressed against a bound
    fn active_set(&self, params: &[f64], gradient: &DVector<f64>) -> Vec<bool> {
        self.specs
            .iter()
            .enumerate()
            .map(|(j, spec)| {
                spec.is_fixed()
                    || (params[j] <= spec.lower && gradient[j] > 0.0)
                    || (params[j] >= spec.upper && gradient[j] < 0.0)
            })
            .collect()
    }
}

fn solve(matrix: DMatrix<f64>, rhs: &DVector<f64>) -> Option<DVector<f64>> {
    match matrix.clone().cholesky() {
        Some(chol) => Some(chol.solve(rhs)),
        None => matrix.lu().solve(rhs),
    }
}

/// Restrict `hessian` and `gradient` to the entries not flagged in `frozen`
fn reduce(
    hessian: &DMatrix<f64>,
    gradient: &DVector<f64>,
    frozen: &[bool],
) -> (Vec<usize>, DMatrix<f64>, DVector<f64>) {
    let free: Vec<usize> = (0..frozen.len()).filter(|j| !frozen[*j]).collect();
    let k = free.len();
    let h = DMatrix::from_fn(k, k, |a, b| hessian[(free[a], free[b])]);
    let g = DVector::from_fn(k, |a, _| gradient[free[a]]);
    (free, h, g)
}

/// Minimize `cost` between `model` and the `observed` bin contents, starting
/// from and bounded by `specs`
pub fn minimize<M: BinnedModel>(
    model: &M,
    observed: &[f64],
    cost: CostFunction,
    specs: &[ParameterSpec],
    config: &MinimizerConfig,
) -> MinimizerResult {
    let problem = Problem {
        model,
        observed,
        cost,
        specs,
    };
    let n_bins = model.n_bins();
    let mut buffer = vec![0.0; n_bins];

    let mut params: Vec<f64> = specs.iter().map(|s| s.clamp(s.init)).collect();
    let mut current = problem.evaluate(&params, &mut buffer);
    let mut lambda = config.initial_lambda;
    let mut iterations = 0;

    'outer: for iter in 0..config.max_iterations {
        iterations = iter + 1;
        let (gradient, hessian) = problem.gradient_hessian(&params, &mut buffer);
        let frozen = problem.active_set(&params, &gradient);
        let (free, h, g) = reduce(&hessian, &gradient, &frozen);
        if free.is_empty() {
            break;
        }
        let rhs = -g;

        loop {
            let mut damped = h.clone();
            for a in 0..free.len() {
                let d = h[(a, a)].max(1e-12);
                damped[(a, a)] += lambda * d;
            }
            let Some(delta) = solve(damped, &rhs) else {
                lambda *= config.lambda_up;
                if lambda > 1e10 {
                    break 'outer;
                }
                continue;
            };

            let mut candidate = params.clone();
            for (a, j) in free.iter().enumerate() {
                candidate[*j] = specs[*j].clamp(params[*j] + delta[a]);
            }
            let next = problem.evaluate(&candidate, &mut buffer);

            if next < current {
                let decrease = current - next;
                log::trace!(
                    "iteration {iterations}: cost {next:.6} \
                     (decrease {decrease:.3e}, lambda {lambda:.1e})"
                );
                params = candidate;
                current = next;
                lambda = (lambda * config.lambda_down).max(1e-12);
                if decrease <= config.tolerance * (1.0 + current.abs()) {
                    break 'outer;
                }
                break;
            } else {
                lambda *= config.lambda_up;
                if lambda > 1e10 {
                    break 'outer;
                }
            }
        }
    }

    let (gradient, hessian) = problem.gradient_hessian(&params, &mut buffer);
    let frozen = problem.active_set(&params, &gradient);
    let (free, h, g) = reduce(&hessian, &gradient, &frozen);
    let mut errors = vec![0.0; params.len()];
    let edm = match h.try_inverse() {
        Some(cov) => {
            for (a, j) in free.iter().enumerate() {
                let var = cov[(a, a)];
                errors[*j] = if var > 0.0 { var.sqrt() } else { 0.0 };
            }
            0.5 * g.dot(&(&cov * &g))
        }
        None if free.is_empty() => 0.0,
        None => f64::INFINITY,
    };
    let converged = current.is_finite() && edm.is_finite() && edm < config.edm_tolerance;
    log::trace!(
        "minimization ended after {iterations} iterations, cost {current:.6}, edm {edm:.3e}"
    );

    MinimizerResult {
        params,
        errors,
        cost: current,
        edm,
        iterations,
        converged,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// `a * x + b` evaluated at fixed abscissae
    struct Line {
        xs: Vec<f64>,
    }

    impl BinnedModel for Line {
        fn n_params(&self) -> usize {
            2
        }

        fn n_bins(&self) -> usize {
            self.xs.len()
        }

        fn expected(&self, params: &[f64], out: &mut [f64]) {
            for (o, x) in out.iter_mut().zip(self.xs.iter()) {
                *o = params[0] * x + params[1];
            }
        }
    }

    /// A single flat yield spread over `n` bins
    struct Flat {
        n: usize,
    }

    impl BinnedModel for Flat {
        fn n_params(&self) -> usize {
            1
        }

        fn n_bins(&self) -> usize {
            self.n
        }

        fn expected(&self, params: &[f64], out: &mut [f64]) {
            out.iter_mut().for_each(|o| *o = params[0] / self.n as f64);
        }
    }

    #[test_log::test]
    fn test_chi_square_line() {
        let xs: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let observed: Vec<f64> = xs.iter().map(|x| 3.0 * x + 10.0).collect();
        let model = Line { xs };
        let specs = [ParameterSpec::unbounded(1.0), ParameterSpec::unbounded(1.0)];
        let result = minimize(
            &model,
            &observed,
            CostFunction::ChiSquare,
            &specs,
            &MinimizerConfig::default(),
        );
        assert!(result.converged, "{result:?}");
        assert_is_close!(result.params[0], 3.0, 1e-5, "slope");
        assert_is_close!(result.params[1], 10.0, 1e-4, "intercept");
        assert!(result.cost < 1e-8);
        assert!(result.errors.iter().all(|e| *e > 0.0));
    }

    #[test_log::test]
    fn test_poisson_yield() {
        let observed = vec![4.0, 6.0, 5.0, 5.0];
        let model = Flat { n: 4 };
        let specs = [ParameterSpec::new(5.0, 0.0, 100.0)];
        let result = minimize(
            &model,
            &observed,
            CostFunction::PoissonLikelihood,
            &specs,
            &MinimizerConfig::default(),
        );
        assert!(result.converged);
        // The extended likelihood estimate of a total yield is the observed total
        assert_is_close!(result.params[0], 20.0, 1e-4, "yield");
        assert_is_close!(result.errors[0], 20.0f64.sqrt(), 1e-2, "error");
    }

    #[test_log::test]
    fn test_parameter_held_on_bound() {
        let observed = vec![40.0, 60.0, 50.0, 50.0];
        let model = Flat { n: 4 };
        let specs = [ParameterSpec::new(5.0, 0.0, 150.0)];
        let result = minimize(
            &model,
            &observed,
            CostFunction::PoissonLikelihood,
            &specs,
            &MinimizerConfig::default(),
        );
        assert_eq!(result.params[0], 150.0);
        assert!(result.at_upper_bound(0, &specs[0], 1e-7));
        assert_eq!(result.errors[0], 0.0);
    }

    #[test]
    fn test_fixed_parameter() {
        let xs: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let observed: Vec<f64> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
        let model = Line { xs };
        let specs = [ParameterSpec::unbounded(0.0), ParameterSpec::new(1.0, 1.0, 1.0)];
        let result = minimize(
            &model,
            &observed,
            CostFunction::ChiSquare,
            &specs,
            &MinimizerConfig::default(),
        );
        assert_eq!(result.params[1], 1.0);
        assert_is_close!(result.params[0], 2.0, 1e-5, "slope");
    }
}
