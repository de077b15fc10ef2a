//! Readers for the files the engine persists at the end of a run.

use crate::config::{is_compressed_archive, OutputFormat};
use crate::snapshot::{FieldArchive, ResidualRecord};
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// A final field loaded from a headerless CSV grid: ny lines of nx values, row 0 first.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub nx: usize,
    pub ny: usize,
    /// Row-major (ny, nx).
    pub values: Vec<f64>,
}

impl Grid {
    #[inline]
    pub fn at(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.nx + col]
    }

    /// Values down one column, bottom wall first.
    pub fn column(&self, col: usize) -> Vec<f64> {
        (0..self.ny).map(|row| self.at(row, col)).collect()
    }

    /// Values along one row, inlet first.
    pub fn row(&self, row: usize) -> &[f64] {
        &self.values[row * self.nx..(row + 1) * self.nx]
    }
}

pub fn read_grid_csv(path: &Path) -> Result<Grid> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("Failed to open '{}'", path.display()))?;

    let mut values = Vec::new();
    let mut nx = 0;
    let mut ny = 0;
    for record in reader.records() {
        let record = record.with_context(|| format!("Malformed CSV in '{}'", path.display()))?;
        if ny > 0 && record.len() != nx {
            anyhow::bail!("Ragged grid in '{}': row {} has {} values, expected {}.", path.display(), ny, record.len(), nx);
        }
        nx = record.len();
        for field in record.iter() {
            let value = field
                .trim()
                .parse::<f64>()
                .with_context(|| format!("Bad value '{}' in '{}'", field, path.display()))?;
            values.push(value);
        }
        ny += 1;
    }
    Ok(Grid { nx, ny, values })
}

/// Loads a snapshot archive, choosing the decoder from the file extension.
/// `.zst` archives are decompressed on the fly.
pub fn read_archive(path: &Path) -> Result<FieldArchive> {
    let format = OutputFormat::from_path(path)
        .with_context(|| format!("Unknown archive extension on '{}' (expected json, bin or msgpack)", path.display()))?;
    let file = File::open(path).with_context(|| format!("Failed to open '{}'", path.display()))?;
    let reader: Box<dyn Read> = if is_compressed_archive(path) {
        let decoder = zstd::Decoder::new(file)
            .with_context(|| format!("Failed to start zstd decoder for '{}'", path.display()))?;
        Box::new(decoder)
    } else {
        Box::new(BufReader::new(file))
    };

    let archive: FieldArchive = match format {
        OutputFormat::Json => serde_json::from_reader(reader)
            .with_context(|| format!("Failed to decode JSON archive '{}'", path.display()))?,
        OutputFormat::Bincode => bincode::deserialize_from(reader)
            .with_context(|| format!("Failed to decode bincode archive '{}'", path.display()))?,
        OutputFormat::Messagepack => rmp_serde::from_read(reader)
            .with_context(|| format!("Failed to decode MessagePack archive '{}'", path.display()))?,
    };

    let expected = archive.nx * archive.ny;
    if let Some((key, frame)) = archive.frames.iter().find(|(_, f)| f.len() != expected) {
        anyhow::bail!("Frame '{}' in '{}' has {} values, expected {}.", key, path.display(), frame.len(), expected);
    }
    Ok(archive)
}

pub fn read_residuals(path: &Path) -> Result<Vec<ResidualRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open '{}'", path.display()))?;
    let mut records = Vec::new();
    for record in reader.deserialize() {
        records.push(record.with_context(|| format!("Malformed residual row in '{}'", path.display()))?);
    }
    Ok(records)
}
