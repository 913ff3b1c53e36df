//! Orchestration of one calibration pass over a range of regions.
use std::collections::BTreeMap;
use std::io;
use std::ops::Range;

use thiserror::Error;

use crate::calib_map::{CalibrationMap, RegionTopology, TopologyError};
use crate::config::{CalibrationConfig, ConfigError};
use crate::fit::{FitOutcome, FitStatus, PeakFitEngine};
use crate::histogram::Histogram;
use crate::region::{RegionId, Subdetector, SubdetectorSelection};
use crate::store::{HistogramKey, HistogramKind, RegionHistogramStore, StoreError};
use crate::text::TextFormatError;
use crate::updater::CoefficientUpdater;

/// The fatal failures of a calibration run. Per-region numerical problems
/// never show up here, they are recorded in each region's [`FitOutcome`].
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Format(#[from] TextFormatError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The life cycle of one region within a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RegionState {
    #[default]
    Pending,
    FitAttempted,
    Converged,
    Degraded,
    NullEffect,
    /// The coefficient update has been applied, possibly with a multiplier of 1
    Updated,
}

impl RegionState {
    /// Move to the next state, classifying a fitted region by `status`
    pub fn advance(self, status: FitStatus) -> Self {
        match self {
            Self::Pending => Self::FitAttempted,
            Self::FitAttempted => match status {
                FitStatus::Converged => Self::Converged,
                FitStatus::Degraded => Self::Degraded,
                FitStatus::NullEffect => Self::NullEffect,
            },
            Self::Converged | Self::Degraded | Self::NullEffect | Self::Updated => Self::Updated,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Updated)
    }
}

/// What happened to one region of one stream in the latest pass
#[derive(Debug, Clone, PartialEq)]
pub struct RegionReport {
    pub iteration: u32,
    pub stream: HistogramKind,
    pub subdet: Subdetector,
    pub region: RegionId,
    pub state: RegionState,
    pub outcome: FitOutcome,
    pub multiplier: f64,
}

/// Counts of region classifications over one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub regions: usize,
    pub converged: usize,
    pub degraded: usize,
    pub null_effect: usize,
}

impl PassSummary {
    fn record(&mut self, status: FitStatus) {
        self.regions += 1;
        match status {
            FitStatus::Converged => self.converged += 1,
            FitStatus::Degraded => self.degraded += 1,
            FitStatus::NullEffect => self.null_effect += 1,
        }
    }
}

#[derive(Debug, Clone)]
struct Stream {
    kind: HistogramKind,
    updater: CoefficientUpdater,
    reports: BTreeMap<(Subdetector, RegionId), RegionReport>,
}

// Can't inline cfg-if
cfg_if::cfg_if! {
    if #[cfg(feature = "parallelism")] {
        fn fit_all(
            engine: &PeakFitEngine,
            subdet: Subdetector,
            inputs: Vec<(RegionId, &Histogram)>,
        ) -> Vec<(RegionId, FitOutcome)> {
            use rayon::prelude::*;
            inputs
                .into_par_iter()
                .map(|(region, hist)| (region, engine.fit(hist, subdet, region)))
                .collect()
        }
    } else {
        fn fit_all(
            engine: &PeakFitEngine,
            subdet: Subdetector,
            inputs: Vec<(RegionId, &Histogram)>,
        ) -> Vec<(RegionId, FitOutcome)> {
            inputs
                .into_iter()
                .map(|(region, hist)| (region, engine.fit(hist, subdet, region)))
                .collect()
        }
    }
}

/// Walks the configured region range of each selected sub-detector, fitting
/// each region and rescaling its cells.
///
/// Each stream, one normally and two when fitting reconstructed over true
/// energy, owns its own coefficient map. Fits may run in parallel but updates
/// are applied in region order, so a pass gives the same result however the
/// region range is sharded.
#[derive(Debug)]
pub struct RegionIterationDriver<T: RegionTopology> {
    config: CalibrationConfig,
    engine: PeakFitEngine,
    store: RegionHistogramStore,
    topology: T,
    streams: Vec<Stream>,
}

impl<T: RegionTopology> RegionIterationDriver<T> {
    /// Create a driver whose streams start from all-ones coefficient maps
    pub fn new(
        config: CalibrationConfig,
        store: RegionHistogramStore,
        topology: T,
    ) -> Result<Self, CalibrationError> {
        config.validate()?;
        let engine = PeakFitEngine::new(&config);
        let streams = HistogramKind::streams(config.eover_etrue)
            .into_iter()
            .map(|kind| Stream {
                kind,
                updater: CoefficientUpdater::default(),
                reports: BTreeMap::new(),
            })
            .collect();
        Ok(Self {
            config,
            engine,
            store,
            topology,
            streams,
        })
    }

    /// Start `kind`'s stream from `map` instead of unit coefficients
    pub fn with_prior_map(mut self, kind: HistogramKind, map: CalibrationMap) -> Self {
        if let Some(stream) = self.streams.iter_mut().find(|s| s.kind == kind) {
            stream.updater = CoefficientUpdater::new(map);
        } else {
            log::warn!("No {kind} stream in this run, ignoring its prior map");
        }
        self
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn topology(&self) -> &T {
        &self.topology
    }

    pub fn streams(&self) -> impl Iterator<Item = HistogramKind> + '_ {
        self.streams.iter().map(|s| s.kind)
    }

    /// The regions of `subdet` this driver processes
    pub fn regions(&self, subdet: Subdetector) -> Range<RegionId> {
        self.config
            .region_range
            .clip(self.topology.n_regions(subdet))
    }

    /// Verify that every distribution a pass over `selection` reads is present
    pub fn check_inputs(&self, selection: SubdetectorSelection) -> Result<(), StoreError> {
        for stream in self.streams.iter() {
            for subdet in selection.iter() {
                for region in self.regions(subdet) {
                    self.store
                        .require(&HistogramKey::new(subdet, stream.kind, region))?;
                }
            }
        }
        Ok(())
    }

    /// Fit and update every region of the configured range in each sub-detector
    /// of `selection`, once per stream.
    ///
    /// Missing inputs are detected before any coefficient changes.
    pub fn run_pass(
        &mut self,
        selection: SubdetectorSelection,
    ) -> Result<PassSummary, CalibrationError> {
        self.check_inputs(selection)?;
        let mut summary = PassSummary::default();
        let Self {
            config,
            engine,
            store,
            topology,
            streams,
        } = self;

        for stream in streams.iter_mut() {
            for subdet in selection.iter() {
                let regions = config.region_range.clip(topology.n_regions(subdet));
                log::info!(
                    "Fitting {} {subdet} regions [{}, {}) of iteration {} with the {} strategy",
                    stream.kind,
                    regions.start,
                    regions.end,
                    config.iteration,
                    engine.strategy().name()
                );
                let kind = stream.kind;
                let inputs = regions
                    .map(|region| {
                        store
                            .require(&HistogramKey::new(subdet, kind, region))
                            .map(|hist| (region, hist))
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                for (region, outcome) in fit_all(engine, subdet, inputs) {
                    let mut state = RegionState::Pending
                        .advance(outcome.status)
                        .advance(outcome.status);
                    let multiplier =
                        stream
                            .updater
                            .apply(&*topology, subdet, region, outcome.deviation);
                    state = state.advance(outcome.status);
                    summary.record(outcome.status);
                    if summary.regions % 1000 == 0 {
                        log::info!("Processed {} regions", summary.regions);
                    }
                    stream.reports.insert(
                        (subdet, region),
                        RegionReport {
                            iteration: config.iteration,
                            stream: stream.kind,
                            subdet,
                            region,
                            state,
                            outcome,
                            multiplier,
                        },
                    );
                }
            }
        }
        log::info!(
            "Pass complete: {} regions, {} converged, {} degraded, {} without enough entries",
            summary.regions,
            summary.converged,
            summary.degraded,
            summary.null_effect
        );
        Ok(summary)
    }

    /// The latest report of every processed region, stream by stream
    pub fn reports(&self) -> impl Iterator<Item = &RegionReport> + '_ {
        self.streams.iter().flat_map(|s| s.reports.values())
    }

    pub fn report(
        &self,
        kind: HistogramKind,
        subdet: Subdetector,
        region: RegionId,
    ) -> Option<&RegionReport> {
        self.streams
            .iter()
            .find(|s| s.kind == kind)
            .and_then(|s| s.reports.get(&(subdet, region)))
    }

    pub fn outcome(
        &self,
        kind: HistogramKind,
        subdet: Subdetector,
        region: RegionId,
    ) -> Option<&FitOutcome> {
        self.report(kind, subdet, region).map(|r| &r.outcome)
    }

    pub fn map(&self, kind: HistogramKind) -> Option<&CalibrationMap> {
        self.streams
            .iter()
            .find(|s| s.kind == kind)
            .map(|s| s.updater.map())
    }

    pub fn into_maps(self) -> Vec<(HistogramKind, CalibrationMap)> {
        self.streams
            .into_iter()
            .map(|s| (s.kind, s.updater.into_map()))
            .collect()
    }
}
