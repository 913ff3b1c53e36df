//! `ecalcalib` performs iterative inter-calibration of calorimeter cells,
//! barrel and endcap crystals, by fitting the invariant-mass or energy-ratio
//! peak accumulated per detector region and rescaling that region's
//! calibration coefficients towards convergence.
//!
//! One calibration iteration consumes:
//! - one [`Histogram`] per region, held by a [`RegionHistogramStore`],
//! - the previous iteration's [`CalibrationMap`],
//! - a [`RegionTopology`] mapping each region onto the cells it covers.
//!
//! The [`PeakFitEngine`] fits every region's distribution with the strategy
//! chosen once from the [`CalibrationConfig`], the [`CoefficientUpdater`] turns
//! the fitted peak deviation into the multiplier `1 / (1 + mean)` and the
//! [`RegionIterationDriver`] walks the configured region range and keeps the
//! per-region [`FitOutcome`] for reporting.
//!
//! # Usage
//! ```
//! use ecalcalib::prelude::*;
//!
//! let config = CalibrationConfig::default()
//!     .subdetectors(SubdetectorSelection::Barrel)
//!     .region_range(RegionRange::new(0, 0));
//! let engine = PeakFitEngine::new(&config);
//!
//! // A region with no entries never reaches the fitter
//! let empty = Histogram::uniform("Barrel/epsilon_EB_iR_0", 100, 0.0, 0.5);
//! let outcome = engine.fit(&empty, Subdetector::Barrel, 0);
//! assert_eq!(outcome.status, FitStatus::NullEffect);
//! assert_eq!(outcome.deviation, 0.0);
//! ```

#[cfg(test)]
macro_rules! assert_is_close {
    ($t1:expr, $t2:expr, $tol:expr, $label:literal) => {
        assert!(
            ($t1 - $t2).abs() < $tol,
            "Observed {} {}, expected {}, difference {}",
            $label,
            $t1,
            $t2,
            $t1 - $t2,
        );
    };
}

pub mod calib_map;
pub mod config;
pub mod driver;
pub mod fit;
pub mod histogram;
pub mod region;
pub mod report;
pub mod store;
pub mod text;
pub mod updater;
pub mod prelude;

#[cfg(test)]
mod test_data;

pub use crate::calib_map::{
    CalibrationMap, CellId, CellPosition, RegionTopology, TabulatedTopology,
};
pub use crate::config::{CalibrationConfig, ConfigError, ParticleHypothesis, PeakKind, SignalModel};
pub use crate::driver::{CalibrationError, PassSummary, RegionIterationDriver, RegionReport};
pub use crate::fit::{FitOutcome, FitStatus, PeakFitEngine};
pub use crate::histogram::Histogram;
pub use crate::region::{RegionId, RegionRange, Subdetector, SubdetectorSelection};
pub use crate::store::RegionHistogramStore;
pub use crate::updater::CoefficientUpdater;
