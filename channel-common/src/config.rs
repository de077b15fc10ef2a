use serde::{Deserialize, Serialize};
use anyhow::Result;
use crate::sim_params::SimParams;
use std::path::{Path, PathBuf};

/// Lattice sound speed 1/sqrt(3); velocities at or above it are treated as divergence.
pub const LATTICE_SOUND_SPEED: f64 = 0.577_350_269_189_625_8;

// Lattice dimensions
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GridConfig {
    #[serde(default = "default_nx")]
    pub nx: usize,
    #[serde(default = "default_ny")]
    pub ny: usize,
}

// Fluid and inlet properties
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FluidConfig {
    /// BGK relaxation time, must exceed 0.5.
    #[serde(default = "default_tau")]
    pub tau: f64,
    /// Peak velocity of the parabolic inlet profile (lattice units).
    #[serde(default = "default_u_max")]
    pub u_max: f64,
}

// Step budget and convergence
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RunConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,
    #[serde(default = "default_convergence_tol")]
    pub convergence_tol: f64,
    /// Upper bound on |u| anywhere in the domain before the run is declared diverged.
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Bincode,
    Messagepack,
}

impl OutputFormat {
    /// File extension used for archives written in this format.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Bincode => "bin",
            OutputFormat::Messagepack => "msgpack",
        }
    }

    /// Name of a zstd-compressed archive, e.g. `ux_history.bin.zst`.
    pub fn archive_file_name(self, stem: &str) -> String {
        format!("{}.{}.{}", stem, self.extension(), ARCHIVE_COMPRESSION_EXTENSION)
    }

    /// Guesses the format of an existing archive from its extension.
    /// A trailing `.zst` is skipped over.
    pub fn from_path(path: &Path) -> Option<Self> {
        let inner = if is_compressed_archive(path) { Path::new(path.file_stem()?) } else { path };
        match inner.extension()?.to_str()? {
            "json" => Some(OutputFormat::Json),
            "bin" => Some(OutputFormat::Bincode),
            "msgpack" => Some(OutputFormat::Messagepack),
            _ => None,
        }
    }
}

/// Suffix appended to archives written through the zstd encoder.
pub const ARCHIVE_COMPRESSION_EXTENSION: &str = "zst";

pub fn is_compressed_archive(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(ARCHIVE_COMPRESSION_EXTENSION)
}

// Where and how results are persisted
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_format")]
    pub format: OutputFormat,
    #[serde(default = "default_true")]
    pub save_speed_history: bool,
    #[serde(default = "default_true")]
    pub save_ux_history: bool,
    /// zstd level for the snapshot archives (1..=22).
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

/// Channel flow configuration, loaded from config.toml.
/// Every section may be omitted; missing keys fall back to the reference run
/// (400x100 channel, tau 0.6, u_max 0.1).
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ChannelConfig {
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub fluid: FluidConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig { nx: default_nx(), ny: default_ny() }
    }
}

impl Default for FluidConfig {
    fn default() -> Self {
        FluidConfig { tau: default_tau(), u_max: default_u_max() }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            max_steps: default_max_steps(),
            snapshot_interval: default_snapshot_interval(),
            convergence_tol: default_convergence_tol(),
            max_speed: default_max_speed(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            directory: default_directory(),
            format: default_format(),
            save_speed_history: true,
            save_ux_history: true,
            compression_level: default_compression_level(),
        }
    }
}

impl ChannelConfig {
    /// Loads and validates the configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path_ref.display(), e))?;
        let config = Self::from_toml_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Invalid config '{}': {}", path_ref.display(), e))?;

        Ok(config)
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ChannelConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the engine cannot run.
    pub fn validate(&self) -> Result<()> {
        let grid = &self.grid;
        let fluid = &self.fluid;
        let run = &self.run;

        if grid.nx < 2 {
            anyhow::bail!("grid.nx must be at least 2 (got {}).", grid.nx);
        }
        if grid.ny < 3 {
            anyhow::bail!("grid.ny must be at least 3 (got {}).", grid.ny);
        }
        if !fluid.tau.is_finite() || fluid.tau <= 0.5 {
            anyhow::bail!("fluid.tau must be finite and greater than 0.5 (got {}).", fluid.tau);
        }
        if !run.max_speed.is_finite() || run.max_speed <= 0.0 {
            anyhow::bail!("run.max_speed must be finite and positive (got {}).", run.max_speed);
        }
        if !fluid.u_max.is_finite() || fluid.u_max < 0.0 {
            anyhow::bail!("fluid.u_max must be finite and non-negative (got {}).", fluid.u_max);
        }
        if fluid.u_max >= run.max_speed {
            anyhow::bail!(
                "fluid.u_max ({}) must stay below run.max_speed ({}).",
                fluid.u_max,
                run.max_speed
            );
        }
        if run.max_steps == 0 {
            anyhow::bail!("run.max_steps must be greater than 0.");
        }
        if run.snapshot_interval == 0 {
            anyhow::bail!("run.snapshot_interval must be greater than 0.");
        }
        if !run.convergence_tol.is_finite() || run.convergence_tol < 0.0 {
            anyhow::bail!(
                "run.convergence_tol must be finite and non-negative (got {}).",
                run.convergence_tol
            );
        }
        if !(1..=22).contains(&self.output.compression_level) {
            anyhow::bail!(
                "output.compression_level must be between 1 and 22 (got {}).",
                self.output.compression_level
            );
        }
        Ok(())
    }

    /// Converts the configuration into the parameters used by the step loop.
    pub fn get_sim_params(&self) -> SimParams {
        let nx = self.grid.nx;
        let ny = self.grid.ny;
        let tau = self.fluid.tau;
        let u_max = self.fluid.u_max;

        let nu = (tau - 0.5) / 3.0;
        let channel_width = (ny - 1) as f64;
        // Mean of 4*u_max*s*(1-s) over s in [0, 1]
        let u_mean = 2.0 / 3.0 * u_max;
        let reynolds = if nu > 0.0 { u_mean * channel_width / nu } else { 0.0 };

        SimParams {
            nx,
            ny,
            num_cells: nx * ny,
            tau,
            omega: 1.0 / tau,
            nu,
            u_max,
            reynolds,
            max_steps: self.run.max_steps,
            snapshot_interval: self.run.snapshot_interval,
            convergence_tol: self.run.convergence_tol,
            max_speed: self.run.max_speed,
        }
    }
}

fn default_nx() -> usize {
    400
}

fn default_ny() -> usize {
    100
}

fn default_tau() -> f64 {
    0.6
}

fn default_u_max() -> f64 {
    0.1
}

fn default_max_steps() -> u64 {
    100_000
}

fn default_snapshot_interval() -> u64 {
    100
}

fn default_convergence_tol() -> f64 {
    1e-12
}

fn default_max_speed() -> f64 {
    LATTICE_SOUND_SPEED
}

fn default_directory() -> PathBuf {
    PathBuf::from("output")
}

fn default_format() -> OutputFormat {
    OutputFormat::Bincode
}

fn default_compression_level() -> i32 {
    9
}

fn default_true() -> bool {
    true
}
