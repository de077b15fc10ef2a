pub mod artifacts;
pub mod config;
pub mod sim_params;
pub mod snapshot;

// Re-export key types for easier use by dependent crates
pub use artifacts::{read_archive, read_grid_csv, read_residuals, Grid};
pub use config::{ChannelConfig, GridConfig, FluidConfig, RunConfig, OutputConfig, OutputFormat, is_compressed_archive, ARCHIVE_COMPRESSION_EXTENSION, LATTICE_SOUND_SPEED};
pub use sim_params::SimParams;
pub use snapshot::{FieldArchive, ResidualRecord};
