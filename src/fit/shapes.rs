//! Closed-form line shapes used to describe a region's peak and its background.
use std::f64::consts::SQRT_2;

use libm::erf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Cumulative distribution of a normal distribution with mean `mu` and width `sigma`
#[inline]
pub fn gaussian_cdf(x: f64, mu: f64, sigma: f64) -> f64 {
    0.5 * (1.0 + erf((x - mu) / (sigma * SQRT_2)))
}

/// Fraction of a normal distribution falling inside `[low, high]`
#[inline]
pub fn gaussian_interval(low: f64, high: f64, mu: f64, sigma: f64) -> f64 {
    gaussian_cdf(high, mu, sigma) - gaussian_cdf(low, mu, sigma)
}

/// Gaussian peak on top of a straight line
///
/// ```math
/// y = a\exp\left({\frac{-(x - \mu)^2}{2\sigma^2}}\right) + s x + b
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GaussianOnLine {
    pub amplitude: f64,
    pub mu: f64,
    pub sigma: f64,
    pub slope: f64,
    pub intercept: f64,
}

impl GaussianOnLine {
    pub fn from_slice(params: &[f64]) -> Self {
        Self {
            amplitude: params[0],
            mu: params[1],
            sigma: params[2],
            slope: params[3],
            intercept: params[4],
        }
    }

    #[inline]
    pub fn peak(&self, x: f64) -> f64 {
        self.amplitude * (-0.5 * ((x - self.mu) / self.sigma).powi(2)).exp()
    }

    #[inline]
    pub fn line(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }

    #[inline]
    pub fn density(&self, x: f64) -> f64 {
        self.peak(x) + self.line(x)
    }
}

/// Unnormalized Gaussian `a * exp(-(x - mu)^2 / (2 sigma^2))`
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GaussianCurve {
    pub amplitude: f64,
    pub mu: f64,
    pub sigma: f64,
}

impl GaussianCurve {
    pub fn new(amplitude: f64, mu: f64, sigma: f64) -> Self {
        Self {
            amplitude,
            mu,
            sigma,
        }
    }

    #[inline]
    pub fn density(&self, x: f64) -> f64 {
        self.amplitude * (-0.5 * ((x - self.mu) / self.sigma).powi(2)).exp()
    }
}

/// Chebyshev series `f(x) = 1 + Σ_{k=1..m} c_k T_k(x')` on a bounded support `[a, b]`,
/// where `x' = (2x - (a + b)) / (b - a)` maps the support onto `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Chebyshev {
    pub coefficients: Vec<f64>,
    pub low: f64,
    pub high: f64,
}

impl Chebyshev {
    pub fn new(coefficients: Vec<f64>, low: f64, high: f64) -> Self {
        Self {
            coefficients,
            low,
            high,
        }
    }

    #[inline]
    fn xprime(&self, x: f64) -> f64 {
        ((2.0 * x - (self.low + self.high)) / (self.high - self.low)).clamp(-1.0, 1.0)
    }

    /// `T_0(u) ..= T_n(u)`
    fn t_values(u: f64, n: usize) -> Vec<f64> {
        let mut out = Vec::with_capacity(n + 1);
        out.push(1.0);
        if n == 0 {
            return out;
        }
        out.push(u);
        for k in 2..=n {
            let next = 2.0 * u * out[k - 1] - out[k - 2];
            out.push(next);
        }
        out
    }

    /// Evaluate the unnormalized series at `x`
    pub fn value(&self, x: f64) -> f64 {
        let t = Self::t_values(self.xprime(x), self.coefficients.len());
        1.0 + self
            .coefficients
            .iter()
            .zip(t.iter().skip(1))
            .map(|(c, t)| c * t)
            .sum::<f64>()
    }

    /// Antiderivative of the series in `x'`
    fn antiderivative(&self, u: f64) -> f64 {
        let m = self.coefficients.len();
        let t = Self::t_values(u, m + 1);
        let mut acc = u;
        for (i, c) in self.coefficients.iter().enumerate() {
            let k = i + 1;
            let term = if k == 1 {
                0.5 * u * u
            } else {
                0.5 * (t[k + 1] / (k as f64 + 1.0) - t[k - 1] / (k as f64 - 1.0))
            };
            acc += c * term;
        }
        acc
    }

    /// Integral of the unnormalized series over `[x1, x2]`, clipped to the support
    pub fn integral(&self, x1: f64, x2: f64) -> f64 {
        let half_width = 0.5 * (self.high - self.low);
        half_width * (self.antiderivative(self.xprime(x2)) - self.antiderivative(self.xprime(x1)))
    }

    /// Integral of the unnormalized series over its whole support
    pub fn total_integral(&self) -> f64 {
        let w = self.high - self.low;
        let mut i = w;
        for (idx, c) in self.coefficients.iter().enumerate() {
            let k = idx + 1;
            if k % 2 == 0 {
                i += w * c / (1.0 - (k * k) as f64);
            }
        }
        i
    }
}

/// Crystal ball line shape with independent power-law tails on both sides of
/// a Gaussian core. `alpha_low` is negative by convention; only its magnitude
/// is used.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DoubleSidedCrystalBall {
    pub alpha_low: f64,
    pub n_low: f64,
    pub mu: f64,
    pub sigma: f64,
    pub norm: f64,
    pub alpha_high: f64,
    pub n_high: f64,
}

impl DoubleSidedCrystalBall {
    pub fn from_slice(params: &[f64]) -> Self {
        Self {
            alpha_low: params[0],
            n_low: params[1],
            mu: params[2],
            sigma: params[3],
            norm: params[4],
            alpha_high: params[5],
            n_high: params[6],
        }
    }

    fn tail(t: f64, alpha: f64, n: f64) -> f64 {
        let a = (n / alpha).powf(n) * (-0.5 * alpha * alpha).exp();
        let b = n / alpha - alpha;
        a * (b + t).powf(-n)
    }

    pub fn density(&self, x: f64) -> f64 {
        let t = (x - self.mu) / self.sigma;
        let alpha_low = self.alpha_low.abs();
        let alpha_high = self.alpha_high.abs();
        if t < -alpha_low {
            self.norm * Self::tail(-t, alpha_low, self.n_low)
        } else if t <= alpha_high {
            self.norm * (-0.5 * t * t).exp()
        } else {
            self.norm * Self::tail(t, alpha_high, self.n_high)
        }
    }
}
