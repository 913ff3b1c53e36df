use crate::config::{CalibrationConfig, PeakKind};
use crate::histogram::Histogram;
use crate::region::{RegionId, Subdetector};

use super::mass_peak::{fit_mass_peak, MassPeakConfig};
use super::minimizer::MinimizerConfig;
use super::ratio_peak::{fit_ratio_peak, RatioPeakConfig};
use super::simple_peak::{fit_simple_peak, SimplePeakConfig};
use super::{FitOutcome, FitStatus};

/// A pair of values, one for each sub-detector
#[derive(Debug, Clone, PartialEq)]
pub struct PerSubdetector<T> {
    pub barrel: T,
    pub endcap: T,
}

impl<T> PerSubdetector<T> {
    pub fn new(barrel: T, endcap: T) -> Self {
        Self { barrel, endcap }
    }

    pub fn get(&self, subdet: Subdetector) -> &T {
        match subdet {
            Subdetector::Barrel => &self.barrel,
            Subdetector::Endcap => &self.endcap,
        }
    }
}

/// The fit family and its parameterisation, chosen once per run
#[derive(Debug, Clone, PartialEq)]
pub enum FitStrategy {
    SimplePeak(PerSubdetector<SimplePeakConfig>),
    MassPeak(PerSubdetector<MassPeakConfig>),
    RatioPeak(PerSubdetector<RatioPeakConfig>),
}

impl FitStrategy {
    pub fn from_config(config: &CalibrationConfig) -> Self {
        let thresholds = &config.thresholds;
        if config.eover_etrue {
            let ratio = RatioPeakConfig::default().min_entries(thresholds.ratio);
            return Self::RatioPeak(PerSubdetector::new(ratio.clone(), ratio));
        }
        match config.peak_kind {
            PeakKind::Epsilon => Self::SimplePeak(PerSubdetector::new(
                SimplePeakConfig::barrel()
                    .min_entries(thresholds.simple_peak)
                    .chi2_threshold(config.chi2_threshold),
                SimplePeakConfig::endcap()
                    .min_entries(thresholds.simple_peak)
                    .chi2_threshold(config.chi2_threshold),
            )),
            PeakKind::Mass => {
                let build = |subdet: Subdetector, min_entries: f64| {
                    MassPeakConfig::new(subdet, config.hypothesis, config.signal_model)
                        .min_entries(min_entries)
                        .boundary_tolerance(config.boundary_tolerance)
                        .max_retries(config.max_retries)
                };
                Self::MassPeak(PerSubdetector::new(
                    build(Subdetector::Barrel, thresholds.mass_barrel),
                    build(Subdetector::Endcap, thresholds.mass_endcap),
                ))
            }
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::SimplePeak(_) => "simple-peak",
            Self::MassPeak(_) => "mass-peak",
            Self::RatioPeak(_) => "ratio-peak",
        }
    }
}

/// Fits one region's distribution with the configured [`FitStrategy`].
///
/// Fitting never fails: statistically insufficient distributions produce a
/// [`FitStatus::NullEffect`] outcome and numerical trouble a
/// [`FitStatus::Degraded`] one.
#[derive(Debug, Clone)]
pub struct PeakFitEngine {
    strategy: FitStrategy,
    minimizer: MinimizerConfig,
    keep_snapshots: bool,
}

impl PeakFitEngine {
    pub fn new(config: &CalibrationConfig) -> Self {
        Self {
            strategy: FitStrategy::from_config(config),
            minimizer: config.minimizer.clone(),
            keep_snapshots: config.store_diagnostics,
        }
    }

    pub fn with_strategy(strategy: FitStrategy, minimizer: MinimizerConfig) -> Self {
        Self {
            strategy,
            minimizer,
            keep_snapshots: false,
        }
    }

    pub fn keep_snapshots(mut self, keep_snapshots: bool) -> Self {
        self.keep_snapshots = keep_snapshots;
        self
    }

    pub fn strategy(&self) -> &FitStrategy {
        &self.strategy
    }

    pub fn fit(&self, hist: &Histogram, subdet: Subdetector, region: RegionId) -> FitOutcome {
        let result = match &self.strategy {
            FitStrategy::SimplePeak(configs) => {
                fit_simple_peak(hist, configs.get(subdet), &self.minimizer, self.keep_snapshots)
            }
            FitStrategy::MassPeak(configs) => {
                fit_mass_peak(hist, configs.get(subdet), &self.minimizer, self.keep_snapshots)
            }
            FitStrategy::RatioPeak(configs) => {
                fit_ratio_peak(hist, configs.get(subdet), &self.minimizer, self.keep_snapshots)
            }
        };
        match result {
            Ok(outcome) => {
                if outcome.status != FitStatus::NullEffect {
                    log::debug!(
                        "{subdet} region {region}: {} mean {:.5} +- {:.5} sigma {:.5} \
                         deviation {:.5} ({})",
                        self.strategy.name(),
                        outcome.mean,
                        outcome.mean_error,
                        outcome.sigma,
                        outcome.deviation,
                        outcome.status
                    );
                }
                outcome
            }
            Err(e) => {
                log::warn!("{subdet} region {region}: {e}, leaving the region unchanged");
                FitOutcome::failed(0)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{ParticleHypothesis, SignalModel};
    use crate::test_data;

    #[test]
    fn test_strategy_selection() {
        let config = CalibrationConfig::default();
        assert!(matches!(FitStrategy::from_config(&config), FitStrategy::MassPeak(_)));

        let config = CalibrationConfig::default().peak_kind(PeakKind::Epsilon);
        assert!(matches!(FitStrategy::from_config(&config), FitStrategy::SimplePeak(_)));

        let config = CalibrationConfig::default().eover_etrue(true);
        assert!(matches!(FitStrategy::from_config(&config), FitStrategy::RatioPeak(_)));

        let config = CalibrationConfig::default()
            .hypothesis(ParticleHypothesis::Eta)
            .signal_model(SignalModel::DoubleGaussian)
            .max_retries(1);
        match FitStrategy::from_config(&config) {
            FitStrategy::MassPeak(configs) => {
                assert_eq!(configs.barrel.fit_window, (0.40, 0.65));
                assert_eq!(configs.endcap.min_entries, 70.0);
                assert_eq!(configs.endcap.max_retries, 1);
                assert!(configs.barrel.tail.is_some());
            }
            other => panic!("unexpected strategy {other:?}"),
        }
    }

    #[test]
    fn test_zero_entries_is_null_effect() {
        let engine = PeakFitEngine::new(&CalibrationConfig::default());
        for subdet in Subdetector::ALL {
            let hist = Histogram::uniform("empty", 100, 0.0, 0.5);
            let outcome = engine.fit(&hist, subdet, 0);
            assert_eq!(outcome.status, FitStatus::NullEffect);
            assert_eq!(outcome.deviation, 0.0);
            assert_eq!(outcome.attempts, 0);
        }
    }

    #[test]
    fn test_unusable_histogram_degrades() {
        let engine = PeakFitEngine::new(&CalibrationConfig::default());
        // Enough entries in the gate window but no bins inside the fit window
        let mut hist = Histogram::uniform("coarse", 1, 0.0, 0.5);
        hist.bin_count[0] = 1000.0;
        let outcome = engine.fit(&hist, Subdetector::Barrel, 3);
        assert_eq!(outcome.status, FitStatus::Degraded);
        assert_eq!(outcome.deviation, 0.0);
    }

    #[test_log::test]
    fn test_engine_fits_scenario_region() {
        let engine = PeakFitEngine::new(&CalibrationConfig::default());
        let hist = test_data::mass_histogram(0.135, 0.011, 500.0, 200.0);
        let outcome = engine.fit(&hist, Subdetector::Barrel, 0);
        assert_eq!(outcome.status, FitStatus::Converged);
        assert!((outcome.mean - 0.135).abs() < 0.002);
    }
}
