//! Tab-separated text formats for histograms, calibration maps and cell tables.
//!
//! Every format skips blank lines and lines starting with `#`.
//!
//! - Histograms: `name<TAB>x_min<TAB>x_max<TAB>c0,c1,...,cN`
//! - Calibration maps: `cell_id<TAB>coefficient`
//! - Cell tables: `EB|EE<TAB>cell_id<TAB>a<TAB>b<TAB>side<TAB>xtal<TAB>tt<TAB>etaring`,
//!   where `(a, b)` is `(ieta, iphi)` in the barrel and `(ix, iy)` in the endcap.
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path;
use std::str::FromStr;

use thiserror::Error;

use crate::calib_map::{CalibrationMap, CellId, CellPosition, CellRecord};
use crate::histogram::Histogram;
use crate::region::Subdetector;

#[derive(Debug, Error)]
pub enum TextFormatError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

impl TextFormatError {
    fn malformed(line: usize, reason: impl Into<String>) -> Self {
        Self::Malformed {
            line,
            reason: reason.into(),
        }
    }
}

pub fn open<P: AsRef<path::Path>>(path: P) -> io::Result<io::BufReader<fs::File>> {
    Ok(io::BufReader::new(fs::File::open(path)?))
}

pub fn create<P: AsRef<path::Path>>(path: P) -> io::Result<io::BufWriter<fs::File>> {
    Ok(io::BufWriter::new(fs::File::create(path)?))
}

/// Yield `(line_number, fields)` for every data line of `reader`
fn records<R: BufRead>(
    reader: R,
) -> impl Iterator<Item = Result<(usize, Vec<String>), TextFormatError>> {
    reader.lines().enumerate().filter_map(|(i, line)| match line {
        Ok(line) => {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                None
            } else {
                Some(Ok((
                    i + 1,
                    trimmed.split('\t').map(|s| s.trim().to_string()).collect(),
                )))
            }
        }
        Err(e) => Some(Err(e.into())),
    })
}

fn field<T: FromStr>(
    fields: &[String],
    index: usize,
    line: usize,
    what: &str,
) -> Result<T, TextFormatError> {
    let raw = fields
        .get(index)
        .ok_or_else(|| TextFormatError::malformed(line, format!("missing {what}")))?;
    raw.parse()
        .map_err(|_| TextFormatError::malformed(line, format!("invalid {what} {raw:?}")))
}

pub fn read_histograms<R: BufRead>(reader: R) -> Result<Vec<Histogram>, TextFormatError> {
    let mut histograms = Vec::new();
    for record in records(reader) {
        let (line, fields) = record?;
        if fields.len() != 4 {
            return Err(TextFormatError::malformed(
                line,
                format!("expected 4 fields, found {}", fields.len()),
            ));
        }
        let x_min: f64 = field(&fields, 1, line, "lower edge")?;
        let x_max: f64 = field(&fields, 2, line, "upper edge")?;
        if !(x_min < x_max) {
            return Err(TextFormatError::malformed(line, "the axis is empty"));
        }
        let counts = fields[3]
            .split(',')
            .map(|c| c.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TextFormatError::malformed(line, format!("invalid bin content: {e}")))?;
        if counts.is_empty() {
            return Err(TextFormatError::malformed(line, "no bins"));
        }
        histograms.push(Histogram::from_counts(fields[0].clone(), x_min, x_max, counts));
    }
    Ok(histograms)
}

pub fn write_histograms<'a, W: Write + ?Sized>(
    writer: &mut W,
    histograms: impl IntoIterator<Item = &'a Histogram>,
) -> io::Result<()> {
    for hist in histograms {
        let counts: Vec<String> = hist.bin_count.iter().map(|c| c.to_string()).collect();
        writeln!(
            writer,
            "{}\t{}\t{}\t{}",
            hist.name,
            hist.x_min(),
            hist.x_max(),
            counts.join(",")
        )?;
    }
    Ok(())
}

pub fn read_calibration_map<R: BufRead>(reader: R) -> Result<CalibrationMap, TextFormatError> {
    let mut map = CalibrationMap::default();
    for record in records(reader) {
        let (line, fields) = record?;
        let cell: CellId = field(&fields, 0, line, "cell id")?;
        let coefficient: f64 = field(&fields, 1, line, "coefficient")?;
        map.set(cell, coefficient);
    }
    Ok(map)
}

/// Write `map` as a full replacement, preceded by `header` as comment lines
pub fn write_calibration_map<W: Write + ?Sized>(
    writer: &mut W,
    map: &CalibrationMap,
    header: &[String],
) -> io::Result<()> {
    for line in header {
        writeln!(writer, "# {line}")?;
    }
    for (cell, coefficient) in map.iter() {
        writeln!(writer, "{cell}\t{coefficient}")?;
    }
    Ok(())
}

pub fn read_cell_table<R: BufRead>(reader: R) -> Result<Vec<CellRecord>, TextFormatError> {
    let mut cells = Vec::new();
    for record in records(reader) {
        let (line, fields) = record?;
        if fields.len() != 8 {
            return Err(TextFormatError::malformed(
                line,
                format!("expected 8 fields, found {}", fields.len()),
            ));
        }
        let subdet: Subdetector = fields[0].parse().map_err(|_| {
            TextFormatError::malformed(line, format!("unknown sub-detector {:?}", fields[0]))
        })?;
        let cell = field(&fields, 1, line, "cell id")?;
        let a: i32 = field(&fields, 2, line, "first coordinate")?;
        let b: i32 = field(&fields, 3, line, "second coordinate")?;
        let side: i32 = field(&fields, 4, line, "side")?;
        let position = match subdet {
            Subdetector::Barrel => CellPosition::Barrel { ieta: a, iphi: b },
            Subdetector::Endcap => CellPosition::Endcap {
                ix: a,
                iy: b,
                zside: side,
            },
        };
        cells.push(CellRecord {
            cell,
            position,
            regions: [
                field(&fields, 5, line, "crystal region")?,
                field(&fields, 6, line, "tower region")?,
                field(&fields, 7, line, "ring region")?,
            ],
        });
    }
    Ok(cells)
}
