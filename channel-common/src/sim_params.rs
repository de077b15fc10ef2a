use serde::{Deserialize, Serialize};

/// Run parameters derived from the configuration, read every step by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimParams {
    // Lattice
    pub nx: usize,
    pub ny: usize,
    pub num_cells: usize,

    // BGK relaxation
    pub tau: f64,
    pub omega: f64, // 1 / tau
    pub nu: f64,    // Kinematic viscosity (tau - 0.5) / 3

    // Inlet
    pub u_max: f64,
    pub reynolds: f64, // Based on mean inlet velocity and channel width ny - 1

    // Loop control
    pub max_steps: u64,
    pub snapshot_interval: u64,
    pub convergence_tol: f64,
    pub max_speed: f64,
}
