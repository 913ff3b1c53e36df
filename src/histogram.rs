//! One-dimensional binned distributions, the per-region input of every fit.
use std::ops::RangeInclusive;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A named histogram with `n` bins described by `n + 1` ascending edges.
///
/// Bin contents are `f64` so weighted or expected-count distributions can be
/// stored alongside plain event counts. Entries falling outside the edges are
/// counted in [`Histogram::underflow`] and [`Histogram::overflow`] and never
/// contribute to any integral.
#[derive(Default, Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Histogram {
    pub name: String,
    pub bin_count: Vec<f64>,
    pub bin_edges: Vec<f64>,
    pub underflow: f64,
    pub overflow: f64,
}

impl Histogram {
    /// Create an empty histogram with `bins` equal-width bins over `[x_min, x_max]`
    pub fn uniform(name: impl Into<String>, bins: usize, x_min: f64, x_max: f64) -> Self {
        let width = (x_max - x_min) / bins as f64;
        let bin_edges = (0..=bins).map(|i| x_min + i as f64 * width).collect();
        Self {
            name: name.into(),
            bin_count: vec![0.0; bins],
            bin_edges,
            underflow: 0.0,
            overflow: 0.0,
        }
    }

    /// Create a histogram over `[x_min, x_max]` whose bin contents are `counts`
    pub fn from_counts(
        name: impl Into<String>,
        x_min: f64,
        x_max: f64,
        counts: Vec<f64>,
    ) -> Self {
        let mut hist = Self::uniform(name, counts.len(), x_min, x_max);
        hist.bin_count = counts;
        hist
    }

    pub fn len(&self) -> usize {
        self.bin_count.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bin_count.is_empty()
    }

    pub fn x_min(&self) -> f64 {
        self.bin_edges.first().copied().unwrap_or_default()
    }

    pub fn x_max(&self) -> f64 {
        self.bin_edges.last().copied().unwrap_or_default()
    }

    /// Add `weight` to the bin containing `x`
    pub fn fill(&mut self, x: f64, weight: f64) {
        match self.find_bin(x) {
            Some(i) => self.bin_count[i] += weight,
            None if x < self.x_min() => self.underflow += weight,
            None => self.overflow += weight,
        }
    }

    /// Locate the bin whose half-open interval `[low, high)` contains `x`
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        if self.is_empty() || !(x >= self.x_min() && x < self.x_max()) {
            return None;
        }
        let i = self.bin_edges.partition_point(|e| *e <= x);
        Some(i.saturating_sub(1).min(self.len() - 1))
    }

    /// Like [`Histogram::find_bin`], but values beyond the axis map to the
    /// first or last bin
    pub fn find_bin_clamped(&self, x: f64) -> usize {
        match self.find_bin(x) {
            Some(i) => i,
            None if x < self.x_min() => 0,
            None => self.len().saturating_sub(1),
        }
    }

    pub fn bin_low_edge(&self, i: usize) -> f64 {
        self.bin_edges[i]
    }

    pub fn bin_high_edge(&self, i: usize) -> f64 {
        self.bin_edges[i + 1]
    }

    pub fn bin_width(&self, i: usize) -> f64 {
        self.bin_edges[i + 1] - self.bin_edges[i]
    }

    pub fn bin_center(&self, i: usize) -> f64 {
        (self.bin_edges[i] + self.bin_edges[i + 1]) / 2.0
    }

    /// Sum of all in-range bin contents
    pub fn integral(&self) -> f64 {
        self.bin_count.iter().sum()
    }

    /// Sum of bin contents over an inclusive bin index range, clipped to the axis
    pub fn integral_bins(&self, bins: RangeInclusive<usize>) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let start = *bins.start();
        let end = (*bins.end()).min(self.len() - 1);
        if start > end {
            return 0.0;
        }
        self.bin_count[start..=end].iter().sum()
    }

    /// Sum of the contents of every bin between the bins holding `low` and `high`,
    /// both included
    pub fn integral_range(&self, low: f64, high: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.integral_bins(self.find_bin_clamped(low)..=self.find_bin_clamped(high))
    }

    /// The first bin holding the largest content
    pub fn maximum_bin(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, c) in self.bin_count.iter().enumerate() {
            match best {
                Some((_, b)) if *c <= b => {}
                _ => best = Some((i, *c)),
            }
        }
        best.map(|(i, _)| i)
    }

    /// The indices of the bins whose centers lie within `[low, high]`
    pub fn bins_in_window(&self, low: f64, high: f64) -> RangeInclusive<usize> {
        let mut first = None;
        let mut last = None;
        for i in 0..self.len() {
            let c = self.bin_center(i);
            if c >= low && c <= high {
                if first.is_none() {
                    first = Some(i);
                }
                last = Some(i);
            }
        }
        match (first, last) {
            (Some(f), Some(l)) => f..=l,
            #[allow(clippy::reversed_empty_ranges)]
            _ => 1..=0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_find_bin() {
        let hist = Histogram::uniform("h", 10, 0.0, 1.0);
        assert_eq!(hist.find_bin(0.0), Some(0));
        assert_eq!(hist.find_bin(0.15), Some(1));
        assert_eq!(hist.find_bin(0.999), Some(9));
        assert_eq!(hist.find_bin(1.0), None);
        assert_eq!(hist.find_bin(-0.1), None);
        assert_eq!(hist.find_bin(f64::NAN), None);
        assert_eq!(hist.find_bin_clamped(3.0), 9);
        assert_eq!(hist.find_bin_clamped(-3.0), 0);
    }

    #[test]
    fn test_fill_and_integral() {
        let mut hist = Histogram::uniform("h", 4, 0.0, 4.0);
        hist.fill(0.5, 1.0);
        hist.fill(1.5, 2.0);
        hist.fill(3.5, 4.0);
        hist.fill(7.0, 10.0);
        hist.fill(-1.0, 3.0);
        assert_eq!(hist.integral(), 7.0);
        assert_eq!(hist.overflow, 10.0);
        assert_eq!(hist.underflow, 3.0);
        assert_eq!(hist.integral_bins(1..=2), 2.0);
        assert_eq!(hist.integral_bins(2..=20), 4.0);
        assert_eq!(hist.integral_range(1.2, 3.9), 6.0);
        assert_eq!(hist.maximum_bin(), Some(3));
    }

    #[test]
    fn test_maximum_bin_prefers_first() {
        let hist = Histogram::from_counts("h", 0.0, 1.0, vec![1.0, 5.0, 5.0, 2.0]);
        assert_eq!(hist.maximum_bin(), Some(1));
        assert_eq!(hist.bin_center(1), 0.375);
        assert_eq!(hist.bin_high_edge(1), 0.5);
        let empty = Histogram::default();
        assert_eq!(empty.maximum_bin(), None);
    }

    #[test]
    fn test_bins_in_window() {
        let hist = Histogram::uniform("h", 100, 0.0, 0.5);
        let window = hist.bins_in_window(0.08, 0.21);
        assert_eq!(*window.start(), 16);
        assert_eq!(*window.end(), 41);
        assert!(hist.bins_in_window(0.6, 0.7).is_empty());
    }
}
