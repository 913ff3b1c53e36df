//! The per-region distributions of one calibration iteration, keyed by
//! sub-detector, stream and region.
use std::collections::HashMap;
use std::fmt::Display;
use std::io;
use std::path::Path;

use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::histogram::Histogram;
use crate::region::{RegionId, Subdetector};
use crate::text::{self, TextFormatError};

/// Which photon of the pair a reconstructed over true energy distribution describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Photon {
    First,
    Second,
}

impl Photon {
    pub const fn index(&self) -> usize {
        match self {
            Self::First => 1,
            Self::Second => 2,
        }
    }
}

/// The quantity a region's distribution holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum HistogramKind {
    /// Pair invariant mass, or its relative deviation from nominal
    Epsilon,
    EoverEtrue(Photon),
}

impl HistogramKind {
    /// The streams a run processes, each with its own coefficient map
    pub fn streams(eover_etrue: bool) -> Vec<HistogramKind> {
        if eover_etrue {
            vec![
                Self::EoverEtrue(Photon::First),
                Self::EoverEtrue(Photon::Second),
            ]
        } else {
            vec![Self::Epsilon]
        }
    }
}

impl Display for HistogramKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Epsilon => f.write_str("epsilon"),
            Self::EoverEtrue(photon) => write!(f, "EoverEtrue_g{}", photon.index()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HistogramKey {
    pub subdet: Subdetector,
    pub kind: HistogramKind,
    pub region: RegionId,
}

impl HistogramKey {
    pub fn new(subdet: Subdetector, kind: HistogramKind, region: RegionId) -> Self {
        Self {
            subdet,
            kind,
            region,
        }
    }

    /// The stored name, e.g. `Barrel/epsilon_EB_iR_12` or `Endcap/EoverEtrue_g2_EE_iR_3`
    pub fn name(&self) -> String {
        format!(
            "{}/{}_{}_iR_{}",
            self.subdet.directory(),
            self.kind,
            self.subdet.tag(),
            self.region
        )
    }

    /// The inverse of [`HistogramKey::name`]
    pub fn parse(name: &str) -> Option<Self> {
        let (directory, stem) = name.split_once('/')?;
        let subdet = match directory {
            "Barrel" => Subdetector::Barrel,
            "Endcap" => Subdetector::Endcap,
            _ => return None,
        };
        let (prefix, region) = stem.rsplit_once("_iR_")?;
        let region = region.parse().ok()?;
        let kind_name = prefix.strip_suffix(subdet.tag())?.strip_suffix('_')?;
        let kind = match kind_name {
            "epsilon" => HistogramKind::Epsilon,
            "EoverEtrue_g1" => HistogramKind::EoverEtrue(Photon::First),
            "EoverEtrue_g2" => HistogramKind::EoverEtrue(Photon::Second),
            _ => return None,
        };
        Some(Self::new(subdet, kind, region))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open the histogram file {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid histogram file {path}: {source}")]
    Format {
        path: String,
        #[source]
        source: TextFormatError,
    },
    #[error("the histogram {0} is missing from the input")]
    MissingHistogram(String),
    #[error("the histogram {0} appears more than once")]
    DuplicateHistogram(String),
}

/// Holds one distribution per (sub-detector, stream, region) key.
///
/// Everything is loaded up front; a pass that needs a key the store lacks
/// fails before any coefficient is touched.
#[derive(Debug, Clone, Default)]
pub struct RegionHistogramStore {
    histograms: HashMap<HistogramKey, Histogram>,
}

impl RegionHistogramStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every histogram from a text file, see [`crate::text`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let reader = text::open(path).map_err(|source| StoreError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        let histograms = text::read_histograms(reader).map_err(|source| StoreError::Format {
            path: path.display().to_string(),
            source,
        })?;
        let mut store = Self::new();
        for hist in histograms {
            store.insert(hist)?;
        }
        log::info!("Loaded {} region histograms from {}", store.len(), path.display());
        Ok(store)
    }

    /// Add a histogram keyed by its name. Names that do not follow the
    /// region naming scheme are skipped and `false` is returned.
    pub fn insert(&mut self, hist: Histogram) -> Result<bool, StoreError> {
        match HistogramKey::parse(&hist.name) {
            Some(key) => {
                self.insert_keyed(key, hist)?;
                Ok(true)
            }
            None => {
                log::debug!("Skipping histogram {} with an unrecognized name", hist.name);
                Ok(false)
            }
        }
    }

    pub fn insert_keyed(&mut self, key: HistogramKey, hist: Histogram) -> Result<(), StoreError> {
        if self.histograms.contains_key(&key) {
            return Err(StoreError::DuplicateHistogram(key.name()));
        }
        self.histograms.insert(key, hist);
        Ok(())
    }

    pub fn get(&self, key: &HistogramKey) -> Option<&Histogram> {
        self.histograms.get(key)
    }

    pub fn require(&self, key: &HistogramKey) -> Result<&Histogram, StoreError> {
        self.get(key)
            .ok_or_else(|| StoreError::MissingHistogram(key.name()))
    }

    pub fn len(&self) -> usize {
        self.histograms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Subdetector::Barrel, HistogramKind::Epsilon, 12, "Barrel/epsilon_EB_iR_12")]
    #[case(Subdetector::Endcap, HistogramKind::Epsilon, 0, "Endcap/epsilon_EE_iR_0")]
    #[case(
        Subdetector::Endcap,
        HistogramKind::EoverEtrue(Photon::Second),
        3,
        "Endcap/EoverEtrue_g2_EE_iR_3"
    )]
    fn test_names(
        #[case] subdet: Subdetector,
        #[case] kind: HistogramKind,
        #[case] region: RegionId,
        #[case] name: &str,
    ) {
        let key = HistogramKey::new(subdet, kind, region);
        assert_eq!(key.name(), name);
        assert_eq!(HistogramKey::parse(name), Some(key));
    }

    #[rstest]
    #[case("Barrel/epsilon_EE_iR_1")]
    #[case("Tracker/epsilon_EB_iR_1")]
    #[case("Barrel/epsilon_EB_iR_x")]
    #[case("epsilon_EB_iR_1")]
    fn test_bad_names(#[case] name: &str) {
        assert!(HistogramKey::parse(name).is_none());
    }

    #[test]
    fn test_insert_and_require() {
        let mut store = RegionHistogramStore::new();
        assert!(store
            .insert(Histogram::uniform("Barrel/epsilon_EB_iR_4", 10, 0.0, 0.5))
            .unwrap());
        assert!(!store.insert(Histogram::uniform("misc", 10, 0.0, 0.5)).unwrap());
        assert!(matches!(
            store.insert(Histogram::uniform("Barrel/epsilon_EB_iR_4", 10, 0.0, 0.5)),
            Err(StoreError::DuplicateHistogram(_))
        ));
        let key = HistogramKey::new(Subdetector::Barrel, HistogramKind::Epsilon, 4);
        assert_eq!(store.require(&key).unwrap().len(), 10);

        let missing = HistogramKey::new(Subdetector::Endcap, HistogramKind::Epsilon, 4);
        let err = store.require(&missing).unwrap_err();
        assert_eq!(
            err.to_string(),
            "the histogram Endcap/epsilon_EE_iR_4 is missing from the input"
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unopenable_file() {
        let err = RegionHistogramStore::load("does/not/exist.tsv").unwrap_err();
        assert!(matches!(err, StoreError::Unreadable { .. }));
    }

    #[test]
    fn test_streams() {
        assert_eq!(HistogramKind::streams(false), vec![HistogramKind::Epsilon]);
        assert_eq!(HistogramKind::streams(true).len(), 2);
    }
}
