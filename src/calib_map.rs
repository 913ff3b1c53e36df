//! Per-cell calibration coefficients and the mapping of calibration regions
//! onto the cells they cover.
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;

use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::region::{CalibrationGranularity, RegionId, Subdetector};
use crate::text::{self, TextFormatError};

/// A detector cell's raw identifier
pub type CellId = u32;

/// Where a cell sits on its sub-detector's 2D grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CellPosition {
    /// `ieta` in `[-85, 85]` without zero, `iphi` in `[1, 360]`
    Barrel { ieta: i32, iphi: i32 },
    /// `ix` and `iy` in `[1, 100]`, `zside` is `-1` or `+1`
    Endcap { ix: i32, iy: i32, zside: i32 },
}

impl CellPosition {
    pub const fn subdetector(&self) -> Subdetector {
        match self {
            Self::Barrel { .. } => Subdetector::Barrel,
            Self::Endcap { .. } => Subdetector::Endcap,
        }
    }
}

/// Calibration coefficients keyed by cell. Cells without an entry have a
/// coefficient of 1.0.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CalibrationMap {
    coefficients: BTreeMap<CellId, f64>,
}

impl CalibrationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TextFormatError> {
        let map = text::read_calibration_map(text::open(path.as_ref())?)?;
        log::info!("Loaded {} coefficients from {}", map.len(), path.as_ref().display());
        Ok(map)
    }

    pub fn get(&self, cell: CellId) -> f64 {
        self.coefficients.get(&cell).copied().unwrap_or(1.0)
    }

    pub fn set(&mut self, cell: CellId, coefficient: f64) {
        self.coefficients.insert(cell, coefficient);
    }

    /// Multiply `cell`'s coefficient by `factor`, returning the new value
    pub fn scale(&mut self, cell: CellId, factor: f64) -> f64 {
        let entry = self.coefficients.entry(cell).or_insert(1.0);
        *entry *= factor;
        *entry
    }

    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    /// Iterate over the explicitly stored coefficients in cell order
    pub fn iter(&self) -> impl Iterator<Item = (CellId, f64)> + '_ {
        self.coefficients.iter().map(|(k, v)| (*k, *v))
    }
}

impl FromIterator<(CellId, f64)> for CalibrationMap {
    fn from_iter<T: IntoIterator<Item = (CellId, f64)>>(iter: T) -> Self {
        Self {
            coefficients: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to read the cell table {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Format(#[from] TextFormatError),
    #[error("cell {0} appears more than once in the cell table")]
    DuplicateCell(CellId),
}

/// Resolves which cells a calibration region covers
pub trait RegionTopology {
    /// The number of regions `subdet` is partitioned into
    fn n_regions(&self, subdet: Subdetector) -> usize;

    /// The cells covered by `region`, empty when the region does not exist
    fn cells(&self, subdet: Subdetector, region: RegionId) -> &[CellId];

    fn position(&self, cell: CellId) -> Option<CellPosition>;

    /// Every known cell with its position
    fn all_cells(&self) -> Vec<(CellId, CellPosition)>;
}

/// One row of a cell table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellRecord {
    pub cell: CellId,
    pub position: CellPosition,
    /// The cell's region index for the crystal, trigger tower and eta-ring granularities
    pub regions: [RegionId; 3],
}

impl CellRecord {
    pub const fn region(&self, granularity: CalibrationGranularity) -> RegionId {
        match granularity {
            CalibrationGranularity::Crystal => self.regions[0],
            CalibrationGranularity::TriggerTower => self.regions[1],
            CalibrationGranularity::EtaRing => self.regions[2],
        }
    }
}

/// A [`RegionTopology`] read from a cell table, with regions formed at one
/// [`CalibrationGranularity`]
#[derive(Debug, Clone, Default)]
pub struct TabulatedTopology {
    granularity: CalibrationGranularity,
    positions: HashMap<CellId, CellPosition>,
    barrel: Vec<Vec<CellId>>,
    endcap: Vec<Vec<CellId>>,
}

impl TabulatedTopology {
    pub fn from_records(
        records: impl IntoIterator<Item = CellRecord>,
        granularity: CalibrationGranularity,
    ) -> Result<Self, TopologyError> {
        let mut this = Self {
            granularity,
            ..Default::default()
        };
        for record in records {
            if this.positions.insert(record.cell, record.position).is_some() {
                return Err(TopologyError::DuplicateCell(record.cell));
            }
            let regions = match record.position.subdetector() {
                Subdetector::Barrel => &mut this.barrel,
                Subdetector::Endcap => &mut this.endcap,
            };
            let region = record.region(granularity);
            if regions.len() <= region {
                regions.resize_with(region + 1, Vec::new);
            }
            regions[region].push(record.cell);
        }
        Ok(this)
    }

    pub fn load<P: AsRef<Path>>(
        path: P,
        granularity: CalibrationGranularity,
    ) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        let reader = text::open(path).map_err(|source| TopologyError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        let this = Self::from_records(text::read_cell_table(reader)?, granularity)?;
        log::info!(
            "Loaded {} cells from {}: {} barrel and {} endcap regions at {granularity} granularity",
            this.positions.len(),
            path.display(),
            this.barrel.len(),
            this.endcap.len(),
        );
        Ok(this)
    }

    pub fn granularity(&self) -> CalibrationGranularity {
        self.granularity
    }

    fn regions(&self, subdet: Subdetector) -> &[Vec<CellId>] {
        match subdet {
            Subdetector::Barrel => &self.barrel,
            Subdetector::Endcap => &self.endcap,
        }
    }
}

impl RegionTopology for TabulatedTopology {
    fn n_regions(&self, subdet: Subdetector) -> usize {
        self.regions(subdet).len()
    }

    fn cells(&self, subdet: Subdetector, region: RegionId) -> &[CellId] {
        self.regions(subdet)
            .get(region)
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    fn position(&self, cell: CellId) -> Option<CellPosition> {
        self.positions.get(&cell).copied()
    }

    fn all_cells(&self) -> Vec<(CellId, CellPosition)> {
        let mut cells: Vec<_> = self.positions.iter().map(|(k, v)| (*k, *v)).collect();
        cells.sort_unstable_by_key(|(k, _)| *k);
        cells
    }
}
