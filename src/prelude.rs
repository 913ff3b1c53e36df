pub use crate::calib_map::{
    CalibrationMap, CellId, CellPosition, RegionTopology, TabulatedTopology,
};
pub use crate::config::{CalibrationConfig, ParticleHypothesis, PeakKind, SignalModel};
pub use crate::driver::{RegionIterationDriver, RegionReport, RegionState};
pub use crate::fit::{FitOutcome, FitStatus, GoodnessOfFit, PeakFitEngine};
pub use crate::histogram::Histogram;
pub use crate::region::{
    CalibrationGranularity, RegionId, RegionRange, Subdetector, SubdetectorSelection,
};
pub use crate::store::{HistogramKey, HistogramKind, Photon, RegionHistogramStore};
pub use crate::updater::CoefficientUpdater;
