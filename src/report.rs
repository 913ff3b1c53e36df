//! Writing the products of a pass: the per-region diagnostics table, 2D
//! coefficient summaries and optional fit snapshots.
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use crate::calib_map::{CalibrationMap, CellPosition, RegionTopology};
use crate::config::CalibrationConfig;
use crate::driver::RegionReport;
use crate::store::HistogramKind;

const DIAGNOSTIC_COLUMNS: [&str; 20] = [
    "iteration",
    "stream",
    "subdet",
    "region",
    "status",
    "attempts",
    "signal",
    "background",
    "chi2",
    "ndof",
    "mean",
    "mean_error",
    "sigma",
    "signal_norm",
    "background_norm",
    "b0",
    "b1",
    "b2",
    "b3",
    "multiplier",
];

/// Write one row per report, keyed by iteration, stream, sub-detector and region.
///
/// A missing goodness of fit is written as `-` in both the chi-square and
/// degrees of freedom columns.
pub fn write_diagnostics<'a, W: Write + ?Sized>(
    writer: &mut W,
    reports: impl IntoIterator<Item = &'a RegionReport>,
) -> io::Result<()> {
    writeln!(writer, "{}", DIAGNOSTIC_COLUMNS.join("\t"))?;
    for report in reports {
        let outcome = &report.outcome;
        let (chi2, ndof) = match outcome.goodness {
            Some(g) => (g.chi2.to_string(), g.ndof.to_string()),
            None => ("-".to_string(), "-".to_string()),
        };
        let mut background = [0.0; 4];
        for (b, c) in background.iter_mut().zip(outcome.background_coefficients.iter()) {
            *b = *c;
        }
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{chi2}\t{ndof}\t\
             {}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            report.iteration,
            report.stream,
            report.subdet,
            report.region,
            outcome.status,
            outcome.attempts,
            outcome.signal,
            outcome.background,
            outcome.mean,
            outcome.mean_error,
            outcome.sigma,
            outcome.signal_norm,
            outcome.background_norm,
            background[0],
            background[1],
            background[2],
            background[3],
            report.multiplier,
        )?;
    }
    Ok(())
}

/// Write the sampled data and model of every fit attempt kept in `reports`
pub fn write_snapshots<'a, W: Write + ?Sized>(
    writer: &mut W,
    reports: impl IntoIterator<Item = &'a RegionReport>,
) -> io::Result<()> {
    writeln!(
        writer,
        "stream\tsubdet\tregion\tattempt\tx\tobserved\tmodel\tsignal\tbackground"
    )?;
    for report in reports {
        for snapshot in report.outcome.snapshots.iter() {
            for i in 0..snapshot.bin_centers.len() {
                writeln!(
                    writer,
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    report.stream,
                    report.subdet,
                    report.region,
                    snapshot.attempt,
                    snapshot.bin_centers[i],
                    snapshot.observed[i],
                    snapshot.model[i],
                    snapshot.signal.get(i).copied().unwrap_or_default(),
                    snapshot.background.get(i).copied().unwrap_or_default(),
                )?;
            }
        }
    }
    Ok(())
}

/// A coefficient map laid out on one sub-detector's cell grid. Positions
/// without a cell hold 0.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientGrid {
    pub label: &'static str,
    pub x_min: i32,
    pub y_min: i32,
    pub width: usize,
    pub height: usize,
    pub values: Vec<f64>,
}

impl CoefficientGrid {
    fn new(label: &'static str, x_min: i32, width: usize, y_min: i32, height: usize) -> Self {
        Self {
            label,
            x_min,
            y_min,
            width,
            height,
            values: vec![0.0; width * height],
        }
    }

    /// The barrel grid, `iphi` in `[1, 360]` along x and `ieta` in `[-85, 85]` along y
    pub fn barrel() -> Self {
        Self::new("EB", 1, 360, -85, 171)
    }

    /// One endcap side, `ix` and `iy` in `[1, 100]`
    pub fn endcap(zside: i32) -> Self {
        let label = if zside < 0 { "EEm" } else { "EEp" };
        Self::new(label, 1, 100, 1, 100)
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        let i = usize::try_from(x - self.x_min).ok()?;
        let j = usize::try_from(y - self.y_min).ok()?;
        (i < self.width && j < self.height).then_some(j * self.width + i)
    }

    pub fn get(&self, x: i32, y: i32) -> Option<f64> {
        self.index(x, y).map(|k| self.values[k])
    }

    fn set(&mut self, x: i32, y: i32, value: f64) -> bool {
        match self.index(x, y) {
            Some(k) => {
                self.values[k] = value;
                true
            }
            None => false,
        }
    }

    pub fn write<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writeln!(
            writer,
            "# {} x [{}, {}] y [{}, {}]",
            self.label,
            self.x_min,
            self.x_min + self.width as i32 - 1,
            self.y_min,
            self.y_min + self.height as i32 - 1
        )?;
        for row in self.values.chunks(self.width) {
            let row: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            writeln!(writer, "{}", row.join("\t"))?;
        }
        Ok(())
    }
}

/// Lay `map` out on the barrel grid and both endcap sides.
///
/// Non-positive coefficients are shown as 1.0.
pub fn coefficient_grids<T: RegionTopology + ?Sized>(
    map: &CalibrationMap,
    topology: &T,
) -> [CoefficientGrid; 3] {
    let mut barrel = CoefficientGrid::barrel();
    let mut minus = CoefficientGrid::endcap(-1);
    let mut plus = CoefficientGrid::endcap(1);
    for (cell, position) in topology.all_cells() {
        let mut value = map.get(cell);
        if value <= 0.0 {
            value = 1.0;
        }
        let placed = match position {
            CellPosition::Barrel { ieta, iphi } => barrel.set(iphi, ieta, value),
            CellPosition::Endcap { ix, iy, zside } if zside < 0 => minus.set(ix, iy, value),
            CellPosition::Endcap { ix, iy, .. } => plus.set(ix, iy, value),
        };
        if !placed {
            log::warn!("Cell {cell} at {position:?} lies outside its grid");
        }
    }
    [barrel, minus, plus]
}

/// Comment lines recording what a written map covers
pub fn map_header(config: &CalibrationConfig, kind: HistogramKind) -> Vec<String> {
    vec![
        format!("iteration {} stream {kind}", config.iteration),
        format!(
            "regions [{}, {}] of {:?} at {} granularity",
            config.region_range.start,
            config.region_range.end,
            config.subdetectors,
            config.granularity
        ),
    ]
}

/// Where a stream's map is written. The second photon's map gets a `_g2`
/// suffix before the extension.
pub fn stream_map_path(path: &Path, kind: HistogramKind) -> PathBuf {
    match kind {
        HistogramKind::EoverEtrue(photon) if photon.index() == 2 => {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let name = match path.extension() {
                Some(ext) => format!("{stem}_g2.{}", ext.to_string_lossy()),
                None => format!("{stem}_g2"),
            };
            path.with_file_name(name)
        }
        _ => path.to_path_buf(),
    }
}

/// The snapshot file accompanying a map, with `calibMap` in its name replaced by `fitRes`
pub fn fit_results_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = if name.contains("calibMap") {
        name.replace("calibMap", "fitRes")
    } else {
        format!("fitRes_{name}")
    };
    path.with_file_name(name)
}

/// The diagnostics table accompanying a map
pub fn diagnostics_path(path: &Path) -> PathBuf {
    path.with_extension("diagnostics.tsv")
}

/// The 2D summary accompanying a map
pub fn grid_path(path: &Path) -> PathBuf {
    path.with_extension("grid.tsv")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::calib_map::{CellRecord, TabulatedTopology};
    use crate::driver::RegionState;
    use crate::fit::{FitOutcome, FitSnapshot, FitStatus, GoodnessOfFit};
    use crate::region::{CalibrationGranularity, Subdetector};
    use crate::store::Photon;

    fn report(region: usize, outcome: FitOutcome) -> RegionReport {
        RegionReport {
            iteration: 2,
            stream: HistogramKind::Epsilon,
            subdet: Subdetector::Barrel,
            region,
            state: RegionState::Updated,
            outcome,
            multiplier: 1.0,
        }
    }

    #[test]
    fn test_diagnostics_rows() {
        let fitted = FitOutcome {
            status: FitStatus::Converged,
            mean: 0.135,
            goodness: GoodnessOfFit::new(21.5, 19),
            background_coefficients: vec![0.2, -0.1, 0.1],
            attempts: 1,
            ..Default::default()
        };
        let reports = vec![report(0, fitted), report(1, FitOutcome::null_effect())];
        let mut buf = Vec::new();
        write_diagnostics(&mut buf, &reports).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let header: Vec<&str> = lines[0].split('\t').collect();
        assert_eq!(header.len(), DIAGNOSTIC_COLUMNS.len());

        let row: Vec<&str> = lines[1].split('\t').collect();
        assert_eq!(row.len(), DIAGNOSTIC_COLUMNS.len());
        assert_eq!(&row[..5], &["2", "epsilon", "EB", "0", "converged"]);
        assert_eq!(&row[8..10], &["21.5", "19"]);
        assert_eq!(row[18], "0");

        let row: Vec<&str> = lines[2].split('\t').collect();
        assert_eq!(row[4], "null-effect");
        assert_eq!(&row[8..10], &["-", "-"]);
    }

    #[test]
    fn test_snapshot_rows() {
        let outcome = FitOutcome {
            snapshots: vec![FitSnapshot {
                attempt: 0,
                bin_centers: vec![0.1, 0.2],
                observed: vec![3.0, 4.0],
                model: vec![3.1, 3.9],
                signal: vec![1.0, 2.0],
                background: vec![2.1, 1.9],
            }],
            ..Default::default()
        };
        let mut buf = Vec::new();
        write_snapshots(&mut buf, &[report(4, outcome)]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.lines().nth(2).unwrap().starts_with("epsilon\tEB\t4\t0\t0.2\t4\t3.9"));
    }

    #[test]
    fn test_grids() {
        let records = [
            CellRecord {
                cell: 1,
                position: CellPosition::Barrel { ieta: -85, iphi: 1 },
                regions: [0; 3],
            },
            CellRecord {
                cell: 2,
                position: CellPosition::Barrel { ieta: 85, iphi: 360 },
                regions: [1; 3],
            },
            CellRecord {
                cell: 3,
                position: CellPosition::Endcap {
                    ix: 10,
                    iy: 20,
                    zside: -1,
                },
                regions: [0; 3],
            },
        ];
        let topology =
            TabulatedTopology::from_records(records, CalibrationGranularity::Crystal).unwrap();
        let mut map = CalibrationMap::new();
        map.set(1, 1.2);
        map.set(2, -0.3);
        let [barrel, minus, plus] = coefficient_grids(&map, &topology);
        assert_eq!(barrel.values.len(), 171 * 360);
        assert_eq!(barrel.get(1, -85), Some(1.2));
        assert_eq!(barrel.get(360, 85), Some(1.0));
        assert_eq!(barrel.get(2, 0), Some(0.0));
        assert_eq!(barrel.get(361, 0), None);
        assert_eq!(minus.get(10, 20), Some(1.0));
        assert!(plus.values.iter().all(|v| *v == 0.0));

        let mut buf = Vec::new();
        minus.write(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("# EEm x [1, 100] y [1, 100]\n"));
        assert_eq!(text.lines().count(), 101);
    }

    #[test]
    fn test_paths() {
        let path = Path::new("out/calibMap_iter3.txt");
        assert_eq!(fit_results_path(path), PathBuf::from("out/fitRes_iter3.txt"));
        assert_eq!(fit_results_path(Path::new("map.txt")), PathBuf::from("fitRes_map.txt"));
        assert_eq!(
            stream_map_path(path, HistogramKind::EoverEtrue(Photon::Second)),
            PathBuf::from("out/calibMap_iter3_g2.txt")
        );
        assert_eq!(stream_map_path(path, HistogramKind::Epsilon), path);
        assert_eq!(diagnostics_path(path), PathBuf::from("out/calibMap_iter3.diagnostics.tsv"));
    }
}
