//! Turning a fitted peak deviation into a coefficient correction.
use crate::calib_map::{CalibrationMap, RegionTopology};
use crate::region::{RegionId, Subdetector};

/// Owns one coefficient map and rescales the cells of each region it is
/// handed by `1 / (1 + deviation)`.
#[derive(Debug, Clone, Default)]
pub struct CoefficientUpdater {
    map: CalibrationMap,
}

impl CoefficientUpdater {
    pub fn new(map: CalibrationMap) -> Self {
        Self { map }
    }

    /// The multiplier for `deviation`.
    ///
    /// A zero deviation gives exactly 1.0. Deviations that are not finite or at
    /// or below -1 would produce a non-positive or undefined multiplier and
    /// are rejected with a multiplier of 1.0.
    pub fn multiplier(deviation: f64) -> f64 {
        if deviation == 0.0 {
            return 1.0;
        }
        if !deviation.is_finite() || deviation <= -1.0 {
            log::warn!("Rejecting peak deviation {deviation}, the region keeps its coefficients");
            return 1.0;
        }
        let factor = 1.0 / (1.0 + deviation);
        if factor.is_finite() && factor > 0.0 {
            factor
        } else {
            log::warn!("Rejecting multiplier {factor} from peak deviation {deviation}");
            1.0
        }
    }

    /// Rescale every cell of `region` and return the multiplier used
    pub fn apply<T: RegionTopology + ?Sized>(
        &mut self,
        topology: &T,
        subdet: Subdetector,
        region: RegionId,
        deviation: f64,
    ) -> f64 {
        let factor = Self::multiplier(deviation);
        if factor == 1.0 {
            return factor;
        }
        for cell in topology.cells(subdet, region) {
            self.map.scale(*cell, factor);
        }
        factor
    }

    pub fn map(&self) -> &CalibrationMap {
        &self.map
    }

    pub fn into_map(self) -> CalibrationMap {
        self.map
    }
}
