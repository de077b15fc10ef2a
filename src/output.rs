use crate::field::Dims;
use crate::simulation::{ChannelSimulation, RunState};
use anyhow::{Context, Result};
use channel_common::{ChannelConfig, FieldArchive, OutputFormat, ResidualRecord};
use log::info;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Summary of a finished run, written next to the field files.
#[derive(Debug, Serialize)]
pub struct RunSummary<'a> {
    pub state: RunState,
    pub final_step: u64,
    pub frame_count: usize,
    pub final_residual: Option<f64>,
    pub wall_clock_seconds: f64,
    pub config: &'a ChannelConfig,
}

/// Writes every artifact of a finished run into the configured output directory.
/// Returns the paths written, in order.
pub fn save_results(sim: &ChannelSimulation, wall_clock_seconds: f64) -> Result<Vec<PathBuf>> {
    let output = &sim.config().output;
    let dir = output.directory.as_path();
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory '{}'", dir.display()))?;

    let mut written = Vec::new();
    let fields = sim.fields();

    // --- Final fields, one (ny, nx) grid per file ---
    for (name, values) in [("rho_final.csv", &fields.rho), ("ux_final.csv", &fields.ux), ("uy_final.csv", &fields.uy)] {
        let path = dir.join(name);
        write_grid_csv(&path, fields.dims, values)?;
        written.push(path);
    }

    // --- Snapshot histories ---
    if output.save_speed_history {
        let path = dir.join(output.format.archive_file_name("speed_history"));
        write_archive(&path, output.format, output.compression_level, sim.speed_history())?;
        written.push(path);
    }
    if output.save_ux_history {
        let path = dir.join(output.format.archive_file_name("ux_history"));
        write_archive(&path, output.format, output.compression_level, sim.ux_history())?;
        written.push(path);
    }

    // --- Residual log ---
    let path = dir.join("residuals.csv");
    write_residuals(&path, sim.residuals())?;
    written.push(path);

    // --- Run summary ---
    let summary = RunSummary {
        state: sim.state(),
        final_step: sim.current_step(),
        frame_count: sim.residuals().len(),
        final_residual: sim.last_residual(),
        wall_clock_seconds,
        config: sim.config(),
    };
    let path = dir.join("run_summary.json");
    let mut file = create(&path)?;
    serde_json::to_writer_pretty(&mut file, &summary)
        .with_context(|| format!("Failed to write run summary '{}'", path.display()))?;
    file.flush().with_context(|| format!("Failed to flush '{}'", path.display()))?;
    written.push(path);

    for path in &written {
        info!("Wrote {}", path.display());
    }
    Ok(written)
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).with_context(|| format!("Failed to create '{}'", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Headerless CSV, one line per lattice row (row 0 first), nx values per line.
pub fn write_grid_csv(path: &Path, dims: Dims, values: &[f64]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("Failed to create '{}'", path.display()))?;
    for row in values.chunks(dims.nx) {
        writer
            .write_record(row.iter().map(|v| format!("{:e}", v)))
            .with_context(|| format!("Failed to write '{}'", path.display()))?;
    }
    writer.flush().with_context(|| format!("Failed to flush '{}'", path.display()))?;
    Ok(())
}

/// Serializes the archive in `format` through a zstd stream at `level`.
pub fn write_archive(path: &Path, format: OutputFormat, level: i32, archive: &FieldArchive) -> Result<()> {
    let mut encoder = zstd::Encoder::new(create(path)?, level)
        .with_context(|| format!("Failed to start zstd encoder for '{}'", path.display()))?;
    match format {
        OutputFormat::Json => serde_json::to_writer(&mut encoder, archive)
            .with_context(|| format!("Failed to serialize '{}' as JSON", path.display()))?,
        OutputFormat::Bincode => bincode::serialize_into(&mut encoder, archive)
            .with_context(|| format!("Failed to serialize '{}' as bincode", path.display()))?,
        OutputFormat::Messagepack => rmp_serde::encode::write(&mut encoder, archive)
            .with_context(|| format!("Failed to serialize '{}' as MessagePack", path.display()))?,
    }
    let mut writer = encoder
        .finish()
        .with_context(|| format!("Failed to finish zstd frame in '{}'", path.display()))?;
    writer.flush().with_context(|| format!("Failed to flush '{}'", path.display()))?;
    Ok(())
}

/// `Step,Residual` table with residuals in scientific notation.
pub fn write_residuals(path: &Path, residuals: &[ResidualRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create '{}'", path.display()))?;
    writer
        .write_record(["Step", "Residual"])
        .with_context(|| format!("Failed to write header of '{}'", path.display()))?;
    for record in residuals {
        writer
            .write_record([record.step.to_string(), format!("{:e}", record.residual)])
            .with_context(|| format!("Failed to write step {} to '{}'", record.step, path.display()))?;
    }
    writer.flush().with_context(|| format!("Failed to flush '{}'", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel_common::artifacts::{read_archive, read_grid_csv, read_residuals};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scratch_dir(tag: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("channel-flow-{}-{}-{}", tag, std::process::id(), n));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn finished_run(dir: &Path, format: OutputFormat) -> ChannelSimulation {
        let mut config = ChannelConfig::default();
        config.grid.nx = 12;
        config.grid.ny = 7;
        config.run.max_steps = 30;
        config.run.snapshot_interval = 10;
        config.run.convergence_tol = 0.0;
        config.output.directory = dir.to_path_buf();
        config.output.format = format;
        let mut sim = ChannelSimulation::new(config).unwrap();
        sim.run().unwrap();
        sim
    }

    #[test]
    fn writes_all_artifacts() {
        let dir = scratch_dir("all");
        let sim = finished_run(&dir, OutputFormat::Json);
        let written = save_results(&sim, 0.5).unwrap();
        assert_eq!(written.len(), 7);
        for path in &written {
            assert!(path.exists(), "missing {}", path.display());
        }

        let grid = read_grid_csv(&dir.join("ux_final.csv")).unwrap();
        assert_eq!((grid.nx, grid.ny), (12, 7));
        for (a, b) in grid.values.iter().zip(&sim.fields().ux) {
            assert!((a - b).abs() <= 1e-12 * b.abs().max(1e-300));
        }

        let residuals = fs::read_to_string(dir.join("residuals.csv")).unwrap();
        let lines: Vec<&str> = residuals.lines().collect();
        assert_eq!(lines[0], "Step,Residual");
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("10,"));
        let records = read_residuals(&dir.join("residuals.csv")).unwrap();
        assert_eq!(records, sim.residuals());

        let archive = read_archive(&dir.join("ux_history.json.zst")).unwrap();
        assert_eq!(archive.steps, sim.ux_history().steps);
        assert_eq!(archive.frames.keys().last().map(String::as_str), Some("frame_2"));
        for (a, b) in archive.last_frame().unwrap().iter().zip(sim.ux_history().last_frame().unwrap()) {
            assert!((a - b).abs() <= 1e-14 * b.abs().max(1e-300));
        }

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn binary_archives_read_back() {
        let dir = scratch_dir("bin");
        let sim = finished_run(&dir, OutputFormat::Bincode);
        save_results(&sim, 0.0).unwrap();
        let archive = read_archive(&dir.join("speed_history.bin.zst")).unwrap();
        assert_eq!(archive, *sim.speed_history());

        let dir2 = scratch_dir("msgpack");
        let sim = finished_run(&dir2, OutputFormat::Messagepack);
        save_results(&sim, 0.0).unwrap();
        let archive = read_archive(&dir2.join("ux_history.msgpack.zst")).unwrap();
        assert_eq!(archive.len(), 3);
        assert_eq!(archive.steps, [10, 20, 30]);

        fs::remove_dir_all(&dir).unwrap();
        fs::remove_dir_all(&dir2).unwrap();
    }

    #[test]
    fn snapshot_history_is_smaller_than_its_raw_payload() {
        let dir = scratch_dir("compressed");
        let mut config = ChannelConfig::default();
        config.grid.nx = 40;
        config.grid.ny = 11;
        config.run.max_steps = 200;
        config.run.snapshot_interval = 10;
        config.run.convergence_tol = 0.0;
        config.output.directory = dir.clone();
        let mut sim = ChannelSimulation::new(config).unwrap();
        sim.run().unwrap();
        save_results(&sim, 0.0).unwrap();

        let path = dir.join("ux_history.bin.zst");
        let raw_payload = 20 * 40 * 11 * std::mem::size_of::<f64>() as u64;
        let size = fs::metadata(&path).unwrap().len();
        assert!(size < raw_payload, "{} bytes on disk for {} bytes of frames", size, raw_payload);
        assert_eq!(read_archive(&path).unwrap(), *sim.ux_history());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn uniform_frames_compress_heavily() {
        let dir = scratch_dir("uniform");
        fs::create_dir_all(&dir).unwrap();
        let mut archive = FieldArchive::new(50, 20);
        for step in 1..=10 {
            archive.push(step * 100, vec![0.05; 1000]);
        }
        let path = dir.join(OutputFormat::Messagepack.archive_file_name("ux_history"));
        write_archive(&path, OutputFormat::Messagepack, 3, &archive).unwrap();
        assert!(fs::metadata(&path).unwrap().len() < 10 * 1000 * 8 / 20);
        assert_eq!(read_archive(&path).unwrap(), archive);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn residual_write_failure_names_file() {
        let dir = scratch_dir("residual-dir");
        // A directory where the residual file should go
        fs::create_dir_all(&dir).unwrap();
        let err = write_residuals(&dir, &[ResidualRecord { step: 10, residual: 1e-3 }]).unwrap_err();
        assert!(format!("{:#}", err).contains(&dir.display().to_string()));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unwritable_directory_reports_path() {
        let dir = scratch_dir("blocked");
        fs::create_dir_all(dir.parent().unwrap()).unwrap();
        // A regular file where the output directory should be
        fs::write(&dir, b"not a directory").unwrap();
        let sim = finished_run(&dir, OutputFormat::Json);
        let err = save_results(&sim, 0.0).unwrap_err();
        assert!(format!("{:#}", err).contains(&dir.display().to_string()));
        fs::remove_file(&dir).unwrap();
    }
}
