use crate::lattice::Lattice;
use anyhow::Result;
use rayon::prelude::*;

/// Lattice extent. Cells are addressed (row, col) with row in [0, ny) and col in [0, nx).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dims {
    pub nx: usize,
    pub ny: usize,
}

impl Dims {
    pub fn new(nx: usize, ny: usize) -> Self {
        Self { nx, ny }
    }

    #[inline(always)]
    pub fn num_cells(&self) -> usize {
        self.nx * self.ny
    }

    // Calculates the 1D cell index within a (ny, nx) row-major plane
    #[inline(always)]
    pub fn cell_idx(&self, row: usize, col: usize) -> usize {
        row * self.nx + col
    }
}

/// Distribution functions for all nine directions, stored as one stride-indexed arena
/// of shape (9, ny, nx): direction planes laid out back to back.
#[derive(Debug)] // No Clone: the field is large and owned by the engine for the whole run
pub struct DistributionField {
    pub dims: Dims,

    // --- Ping-Pong Buffers for Streaming ---
    // Current populations (read by every kernel, written by collision and boundaries)
    pub f_in: Vec<f64>,
    // Streaming destination; becomes f_in after swap_buffers()
    pub f_out: Vec<f64>,
}

impl DistributionField {
    /// Creates a field with every population set to `value`.
    pub fn uniform(dims: Dims, value: f64) -> Result<Self> {
        if dims.nx == 0 || dims.ny == 0 {
            anyhow::bail!("Distribution field needs a non-empty lattice, got {}x{}.", dims.nx, dims.ny);
        }
        let len = Lattice::Q * dims.num_cells();
        Ok(Self {
            dims,
            f_in: vec![value; len],
            f_out: vec![0.0; len],
        })
    }

    #[inline(always)]
    pub fn plane_len(&self) -> usize {
        self.dims.num_cells()
    }

    #[inline(always)]
    fn idx(&self, dir: usize, row: usize, col: usize) -> usize {
        dir * self.plane_len() + self.dims.cell_idx(row, col)
    }

    #[inline(always)]
    pub fn get(&self, dir: usize, row: usize, col: usize) -> f64 {
        self.f_in[self.idx(dir, row, col)]
    }

    #[inline(always)]
    pub fn set(&mut self, dir: usize, row: usize, col: usize, value: f64) {
        let idx = self.idx(dir, row, col);
        self.f_in[idx] = value;
    }

    /// Current populations of a single direction, shape (ny, nx).
    pub fn plane_mut(&mut self, dir: usize) -> &mut [f64] {
        let len = self.plane_len();
        &mut self.f_in[dir * len..(dir + 1) * len]
    }

    /// Swaps the front and back buffers after a full streaming sweep.
    pub fn swap_buffers(&mut self) {
        std::mem::swap(&mut self.f_in, &mut self.f_out);
    }

    /// Sum of every population over all cells and directions.
    pub fn total_mass(&self) -> f64 {
        self.f_in.par_iter().sum()
    }
}

/// Density and velocity derived from the distribution field, each shaped (ny, nx) row-major.
#[derive(Debug, Clone)]
pub struct MacroFields {
    pub dims: Dims,
    pub rho: Vec<f64>,
    pub ux: Vec<f64>,
    pub uy: Vec<f64>,
}

impl MacroFields {
    pub fn new(dims: Dims) -> Self {
        let n = dims.num_cells();
        Self {
            dims,
            rho: vec![0.0; n],
            ux: vec![0.0; n],
            uy: vec![0.0; n],
        }
    }

    /// Velocity magnitude per cell.
    pub fn speed(&self) -> Vec<f64> {
        self.ux
            .par_iter()
            .zip(self.uy.par_iter())
            .map(|(&ux, &uy)| (ux * ux + uy * uy).sqrt())
            .collect()
    }
}
