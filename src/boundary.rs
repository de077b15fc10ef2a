//! Channel boundary rules.
//!
//! Application order within a step:
//! 1. `apply_inlet` on the macroscopic fields, before the equilibrium is evaluated.
//! 2. `bounce_back_walls` on rows 0 and ny - 1, across every column, after the streaming swap.
//! 3. `copy_outlet` on column nx - 1, last, so the outlet corners inherit the
//!    already reflected values of column nx - 2.

use crate::field::{DistributionField, MacroFields};
use crate::lattice::Lattice;

/// Parabolic Poiseuille profile 4 u_max s (1 - s) with s = row / (ny - 1).
#[inline(always)]
pub fn inlet_profile(row: usize, ny: usize, u_max: f64) -> f64 {
    let s = row as f64 / (ny - 1) as f64;
    4.0 * u_max * s * (1.0 - s)
}

/// Imposes the inlet velocity on column 0 and back-solves its density (Zou-He closure).
///
/// With the east-moving populations unknown at the inlet, mass conservation gives
/// rho = [f_rest + f_north + f_south + 2 (f_west + f_northwest + f_southwest)] / (1 - ux).
/// The terms are selected by sign of cx: directions with cx = 0 count once, cx < 0 twice.
pub fn apply_inlet(lattice: &Lattice, field: &DistributionField, fields: &mut MacroFields, u_max: f64) {
    let dims = fields.dims;
    for row in 0..dims.ny {
        let cell = dims.cell_idx(row, 0);
        let ux = inlet_profile(row, dims.ny, u_max);

        let mut known = 0.0;
        for (i, c) in lattice.velocities.iter().enumerate() {
            let f = field.get(i, row, 0);
            match c[0] {
                0 => known += f,
                cx if cx < 0 => known += 2.0 * f,
                _ => {}
            }
        }

        fields.ux[cell] = ux;
        fields.uy[cell] = 0.0;
        fields.rho[cell] = known / (1.0 - ux);
    }
}

/// No-slip bounce-back on the bottom (row 0) and top (row ny - 1) walls.
///
/// After the periodic sweep, the populations at a wall row that head back into the
/// fluid arrived across the wrap from the opposite wall. Each is replaced with its
/// reverse, i.e. the population that just reached the wall from the fluid side.
pub fn bounce_back_walls(lattice: &Lattice, field: &mut DistributionField) {
    let ny = field.dims.ny;
    reflect_row(lattice, field, 0, |cy| cy > 0);
    reflect_row(lattice, field, ny - 1, |cy| cy < 0);
}

fn reflect_row(lattice: &Lattice, field: &mut DistributionField, row: usize, leaves_wall: impl Fn(i32) -> bool) {
    let nx = field.dims.nx;
    for i in 0..Lattice::Q {
        if !leaves_wall(lattice.velocities[i][1]) {
            continue;
        }
        let opp = lattice.opposite[i];
        for col in 0..nx {
            let reflected = field.get(opp, row, col);
            field.set(i, row, col, reflected);
        }
    }
}

/// Zero-gradient outlet: the last column takes the second-to-last column's populations in every direction.
pub fn copy_outlet(field: &mut DistributionField) {
    let dims = field.dims;
    let (nx, ny) = (dims.nx, dims.ny);
    for i in 0..Lattice::Q {
        let plane = field.plane_mut(i);
        for row in 0..ny {
            plane[row * nx + nx - 1] = plane[row * nx + nx - 2];
        }
    }
}
