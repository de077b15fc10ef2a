use crate::field::{DistributionField, MacroFields};
use crate::lattice::Lattice;
use rayon::prelude::*;
use thiserror::Error;

/// Computes rho = sum f_i and u = sum f_i c_i / rho for every cell, in parallel.
///
/// A non-positive density yields non-finite velocities here; `check_stability`
/// turns that into a `Divergence` error instead of letting it propagate.
pub fn extract(field: &DistributionField, lattice: &Lattice, out: &mut MacroFields) {
    debug_assert_eq!(field.dims, out.dims);
    let plane_len = field.plane_len();
    let f = &field.f_in;

    out.rho
        .par_iter_mut()
        .zip(out.ux.par_iter_mut())
        .zip(out.uy.par_iter_mut())
        .enumerate()
        .for_each(|(cell, ((rho_out, ux_out), uy_out))| {
            let mut rho = 0.0;
            let mut mx = 0.0;
            let mut my = 0.0;
            for i in 0..Lattice::Q {
                let fi = f[i * plane_len + cell];
                rho += fi;
                mx += fi * lattice.cx(i);
                my += fi * lattice.cy(i);
            }
            *rho_out = rho;
            *ux_out = mx / rho;
            *uy_out = my / rho;
        });
}

/// Fatal numerical blow-up detected in the macroscopic fields.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("numerical divergence at step {step} in cell (row {row}, col {col}): rho = {rho:e}, |u| = {speed:e}")]
pub struct Divergence {
    pub step: u64,
    pub row: usize,
    pub col: usize,
    pub rho: f64,
    pub speed: f64,
}

/// Finds the first cell with non-positive or non-finite density, or a speed at or above `max_speed`.
pub fn check_stability(fields: &MacroFields, max_speed: f64, step: u64) -> Result<(), Divergence> {
    let bad = (0..fields.dims.num_cells()).into_par_iter().find_first(|&cell| {
        let rho = fields.rho[cell];
        let speed = (fields.ux[cell].powi(2) + fields.uy[cell].powi(2)).sqrt();
        !(rho.is_finite() && rho > 0.0 && speed.is_finite() && speed < max_speed)
    });

    match bad {
        None => Ok(()),
        Some(cell) => {
            let nx = fields.dims.nx;
            Err(Divergence {
                step,
                row: cell / nx,
                col: cell % nx,
                rho: fields.rho[cell],
                speed: (fields.ux[cell].powi(2) + fields.uy[cell].powi(2)).sqrt(),
            })
        }
    }
}
