//! Deterministic synthetic inputs for the test suites.
use num_traits::Float;

use crate::calib_map::{CellPosition, CellRecord, TabulatedTopology};
use crate::fit::shapes::{gaussian_interval, DoubleSidedCrystalBall, GaussianCurve};
use crate::histogram::Histogram;
use crate::region::{CalibrationGranularity, RegionId, Subdetector};
use crate::store::{HistogramKey, HistogramKind, RegionHistogramStore};

pub fn minmax<T: Float>(values: &[T]) -> (T, T) {
    let mut max = -T::infinity();
    let mut min = T::infinity();

    for v in values.iter() {
        if *v > max {
            max = *v;
        }
        if *v < min {
            min = *v
        }
    }
    (min, max)
}

/// Bin `values` into `bins` bins spanning their observed range
pub fn histogram_from_values(name: &str, values: &[f64], bins: usize) -> Histogram {
    let (mut min, mut max) = minmax(values);
    if values.is_empty() {
        min = 0.0;
        max = 1.0;
    } else if min == max {
        min -= 0.5;
        max += 0.5;
    }
    let mut hist = Histogram::uniform(name, bins, min, max);
    for x in values.iter() {
        if *x == max {
            // The upper edge belongs to the last bin
            if let Some(last) = hist.bin_count.last_mut() {
                *last += 1.0;
            }
        } else {
            hist.fill(*x, 1.0);
        }
    }
    hist
}

/// Fill `hist` with the expected counts of `n_sig` Gaussian signal and `n_bkg`
/// flat background entries inside `window`
fn fill_mass_peak(
    hist: &mut Histogram,
    window: (f64, f64),
    mean: f64,
    sigma: f64,
    n_sig: f64,
    n_bkg: f64,
) {
    let in_window = gaussian_interval(window.0, window.1, mean, sigma);
    let window_width = window.1 - window.0;
    for i in 0..hist.len() {
        let (low, high) = (hist.bin_low_edge(i), hist.bin_high_edge(i));
        let signal = n_sig * gaussian_interval(low, high, mean, sigma) / in_window;
        let background = n_bkg * (high - low) / window_width;
        hist.bin_count[i] = signal + background;
    }
}

/// A pi0 invariant-mass distribution, 100 bins over `[0, 0.5]`, holding the
/// expected counts of `n_sig` Gaussian signal and `n_bkg` flat background
/// entries inside the `[0.08, 0.21]` fit window
pub fn mass_histogram(mean: f64, sigma: f64, n_sig: f64, n_bkg: f64) -> Histogram {
    let mut hist = Histogram::uniform("Barrel/epsilon_EB_iR_0", 100, 0.0, 0.5);
    fill_mass_peak(&mut hist, (0.08, 0.21), mean, sigma, n_sig, n_bkg);
    hist
}

/// An eta invariant-mass distribution, 100 bins over `[0.3, 0.8]`, with the
/// entry counts taken inside the `[0.40, 0.65]` fit window
pub fn eta_mass_histogram(mean: f64, sigma: f64, n_sig: f64, n_bkg: f64) -> Histogram {
    let mut hist = Histogram::uniform("Barrel/epsilon_EB_iR_0", 100, 0.3, 0.8);
    fill_mass_peak(&mut hist, (0.40, 0.65), mean, sigma, n_sig, n_bkg);
    hist
}

/// A relative deviation distribution, 80 bins over `[-0.5, 0.5]`, with a
/// Gaussian of height `amplitude` over a constant floor of 2 entries
pub fn epsilon_histogram(mean: f64, sigma: f64, amplitude: f64) -> Histogram {
    let curve = GaussianCurve::new(amplitude, mean, sigma);
    let mut hist = Histogram::uniform("Barrel/epsilon_EB_iR_0", 80, -0.5, 0.5);
    for i in 0..hist.len() {
        hist.bin_count[i] = curve.density(hist.bin_center(i)) + 2.0;
    }
    hist
}

/// A peak whose alternate bins are scaled by 0.5 and 1.5, which no smooth
/// model describes well
pub fn jagged_epsilon_histogram() -> Histogram {
    let mut hist = epsilon_histogram(0.0, 0.08, 1000.0);
    for (i, c) in hist.bin_count.iter_mut().enumerate() {
        *c *= if i % 2 == 0 { 0.5 } else { 1.5 };
    }
    hist
}

/// A reconstructed over true energy distribution, 200 bins over `[0, 2]`,
/// following a two-sided crystal ball peaking at `mu` with height `norm`
pub fn ratio_histogram(mu: f64, sigma: f64, norm: f64) -> Histogram {
    let shape = DoubleSidedCrystalBall {
        alpha_low: -1.4,
        n_low: 5.0,
        mu,
        sigma,
        norm,
        alpha_high: 1.4,
        n_high: 5.0,
    };
    let mut hist = Histogram::uniform("Barrel/EoverEtrue_g1_EB_iR_0", 200, 0.0, 2.0);
    for i in 0..hist.len() {
        hist.bin_count[i] = shape.density(hist.bin_center(i));
    }
    hist
}

/// A topology with `n_barrel` and `n_endcap` regions of `cells_per_region`
/// cells each, identical at every granularity. Barrel cells are numbered from
/// 1 and endcap cells from 100000.
pub fn toy_topology(
    n_barrel: usize,
    n_endcap: usize,
    cells_per_region: usize,
) -> TabulatedTopology {
    let mut records = Vec::new();
    for region in 0..n_barrel {
        for k in 0..cells_per_region {
            records.push(CellRecord {
                cell: (1 + region * cells_per_region + k) as u32,
                position: CellPosition::Barrel {
                    ieta: 1 + (region % 85) as i32,
                    iphi: 1 + (k % 360) as i32,
                },
                regions: [region; 3],
            });
        }
    }
    for region in 0..n_endcap {
        for k in 0..cells_per_region {
            records.push(CellRecord {
                cell: (100_000 + region * cells_per_region + k) as u32,
                position: CellPosition::Endcap {
                    ix: 1 + (region % 100) as i32,
                    iy: 1 + (k % 100) as i32,
                    zside: if region % 2 == 0 { 1 } else { -1 },
                },
                regions: [region; 3],
            });
        }
    }
    // Cell ids are unique by construction
    TabulatedTopology::from_records(records, CalibrationGranularity::Crystal).unwrap()
}

/// A store holding `make(subdet, kind, region)` for every region and stream
pub fn region_store(
    n_barrel: usize,
    n_endcap: usize,
    kinds: &[HistogramKind],
    make: impl Fn(Subdetector, HistogramKind, RegionId) -> Histogram,
) -> RegionHistogramStore {
    let mut store = RegionHistogramStore::new();
    for kind in kinds.iter().copied() {
        for (subdet, n) in [(Subdetector::Barrel, n_barrel), (Subdetector::Endcap, n_endcap)] {
            for region in 0..n {
                let key = HistogramKey::new(subdet, kind, region);
                let mut hist = make(subdet, kind, region);
                hist.name = key.name();
                store.insert_keyed(key, hist).unwrap();
            }
        }
    }
    store
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_values() {
        let hist = histogram_from_values("h", &[1.0, 2.0, 2.0, 3.0], 2);
        assert_eq!(hist.bin_count, vec![1.0, 3.0]);
        assert_eq!(hist.x_min(), 1.0);
        assert_eq!(hist.x_max(), 3.0);
        assert_eq!(minmax::<f64>(&[]), (f64::INFINITY, f64::NEG_INFINITY));
    }

    #[test]
    fn test_eta_peak_position() {
        let hist = eta_mass_histogram(0.548, 0.012, 1500.0, 500.0);
        let mode = hist.maximum_bin().unwrap();
        assert!((hist.bin_center(mode) - 0.548).abs() < 0.005);
        // Background alone fills the window edges
        assert!(hist.bin_count[hist.find_bin(0.41).unwrap()] > 9.0);
    }
}
