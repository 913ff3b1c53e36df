//! Identifiers for the two calorimeter sub-detectors and the regions they are
//! partitioned into for calibration.
use std::fmt::Display;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Subdetector {
    Barrel,
    Endcap,
}

impl Subdetector {
    pub const ALL: [Subdetector; 2] = [Subdetector::Barrel, Subdetector::Endcap];

    /// The two-letter tag used in histogram names and reports
    pub const fn tag(&self) -> &'static str {
        match self {
            Subdetector::Barrel => "EB",
            Subdetector::Endcap => "EE",
        }
    }

    /// The directory prefix under which this sub-detector's histograms are stored
    pub const fn directory(&self) -> &'static str {
        match self {
            Subdetector::Barrel => "Barrel",
            Subdetector::Endcap => "Endcap",
        }
    }
}

impl Display for Subdetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Subdetector {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eb" | "barrel" => Ok(Self::Barrel),
            "ee" | "endcap" => Ok(Self::Endcap),
            _ => Err(ConfigError::UnknownSubdetector(s.to_string())),
        }
    }
}

/// Index of a calibration region within one sub-detector. The same number
/// refers to different regions in the barrel and the endcap.
pub type RegionId = usize;

/// Which sub-detectors a pass visits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SubdetectorSelection {
    Barrel,
    Endcap,
    #[default]
    Both,
}

impl SubdetectorSelection {
    pub fn includes(&self, subdet: Subdetector) -> bool {
        matches!(
            (self, subdet),
            (Self::Both, _)
                | (Self::Barrel, Subdetector::Barrel)
                | (Self::Endcap, Subdetector::Endcap)
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = Subdetector> + '_ {
        Subdetector::ALL.into_iter().filter(|s| self.includes(*s))
    }
}

impl FromStr for SubdetectorSelection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eb" | "barrel" => Ok(Self::Barrel),
            "ee" | "endcap" => Ok(Self::Endcap),
            "both" | "all" => Ok(Self::Both),
            _ => Err(ConfigError::UnknownSubdetector(s.to_string())),
        }
    }
}

/// The detector unit each calibration region corresponds to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CalibrationGranularity {
    /// One region per crystal
    #[default]
    Crystal,
    /// One region per trigger tower
    TriggerTower,
    /// One region per ring of constant pseudorapidity
    EtaRing,
}

impl CalibrationGranularity {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Crystal => "xtal",
            Self::TriggerTower => "tt",
            Self::EtaRing => "etaring",
        }
    }
}

impl Display for CalibrationGranularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CalibrationGranularity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xtal" => Ok(Self::Crystal),
            "tt" => Ok(Self::TriggerTower),
            "etaring" => Ok(Self::EtaRing),
            _ => Err(ConfigError::UnknownGranularity(s.to_string())),
        }
    }
}

/// An inclusive `[start, end]` range of region indices processed by one job.
///
/// `end` may exceed the number of regions a sub-detector holds; the range is
/// clipped per sub-detector with [`RegionRange::clip`]. This lets many jobs
/// share the region space of the larger sub-detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegionRange {
    pub start: RegionId,
    pub end: RegionId,
}

impl Default for RegionRange {
    fn default() -> Self {
        Self {
            start: 0,
            end: RegionId::MAX,
        }
    }
}

impl RegionRange {
    pub fn new(start: RegionId, end: RegionId) -> Self {
        Self { start, end }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start > self.end {
            Err(ConfigError::InvalidRegionRange {
                start: self.start,
                end: self.end,
            })
        } else {
            Ok(())
        }
    }

    /// The regions of this range that exist in a sub-detector holding `n_regions`
    pub fn clip(&self, n_regions: usize) -> std::ops::Range<RegionId> {
        let end = self.end.saturating_add(1).min(n_regions);
        let start = self.start.min(end);
        start..end
    }

    /// Split this range into `n` contiguous shards, the last one absorbing the remainder
    pub fn shard(&self, n: usize, n_regions: usize) -> Vec<RegionRange> {
        let clipped = self.clip(n_regions);
        let total = clipped.len();
        if n == 0 || total == 0 {
            return Vec::new();
        }
        let per = total.div_ceil(n);
        clipped
            .step_by(per.max(1))
            .map(|s| RegionRange::new(s, (s + per - 1).min(clipped_end(self, n_regions))))
            .collect()
    }
}

fn clipped_end(range: &RegionRange, n_regions: usize) -> RegionId {
    range.clip(n_regions).end.saturating_sub(1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_clip() {
        let r = RegionRange::new(3, 100);
        assert_eq!(r.clip(10), 3..10);
        assert_eq!(r.clip(2), 2..2);
        assert!(RegionRange::new(5, 4).validate().is_err());
        assert_eq!(RegionRange::default().clip(7), 0..7);
    }

    #[test]
    fn test_shard() {
        let shards = RegionRange::new(0, 9).shard(3, 100);
        assert_eq!(
            shards,
            vec![
                RegionRange::new(0, 3),
                RegionRange::new(4, 7),
                RegionRange::new(8, 9)
            ]
        );
    }

    #[test]
    fn test_selection() {
        let sel: SubdetectorSelection = "barrel".parse().unwrap();
        assert_eq!(sel.iter().collect::<Vec<_>>(), vec![Subdetector::Barrel]);
        assert_eq!(SubdetectorSelection::Both.iter().count(), 2);
        assert!("tracker".parse::<Subdetector>().is_err());
    }

    #[test]
    fn test_granularity() {
        assert_eq!(
            "etaring".parse::<CalibrationGranularity>().unwrap(),
            CalibrationGranularity::EtaRing
        );
        assert_eq!("tt".parse::<CalibrationGranularity>().unwrap().to_string(), "tt");
        assert!(matches!(
            "ring".parse::<CalibrationGranularity>(),
            Err(ConfigError::UnknownGranularity(_))
        ));
    }
}
